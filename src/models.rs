pub mod collection;
pub mod error;
pub mod event;
pub mod ids;
pub mod paths;
pub mod profile;
pub mod subscription;
pub mod work;
