pub mod actions;
pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod item;
pub mod logging;
pub mod metadata;
pub mod reconcile;
pub mod remote;
pub mod scanner;
pub mod staleness;
pub mod steam;
pub mod transfer;

pub use error::{CacheError, FetchError, InvalidMetadataError, InvalidRootError, WorkerLost};
pub use item::{ItemId, PackageExtension};
