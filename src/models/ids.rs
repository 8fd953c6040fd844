use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(
    Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct ModId(pub u64);

#[derive(
    Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct UserId(pub u64);
