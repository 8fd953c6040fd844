pub mod archive;
pub mod cancel;
pub mod classifier;
pub mod clock;
pub mod context;
pub mod filesystem;
pub mod management;
pub mod pipeline;
pub mod queue;
pub mod removal;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync;
pub mod temp;
pub mod transport;
