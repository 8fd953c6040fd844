use crate::models::error::SyncError;

pub struct Json;

impl Json {
    pub fn encode<T: serde::Serialize>(data: &T) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec_pretty(data).map_err(|e| SyncError::ParseError(e.to_string()))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
        serde_json::from_slice::<T>(bytes).map_err(|e| SyncError::ParseError(e.to_string()))
    }
}
