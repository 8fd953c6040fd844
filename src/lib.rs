pub mod config;
pub mod core;
pub mod models;
pub mod utils;

pub use crate::config::ManagementConfig;
pub use crate::core::service::{Collaborators, ModService, RemoteHandle};
pub use crate::models::error::SyncError;
