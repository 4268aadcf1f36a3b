pub mod artifact;
pub mod cache;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod net;
pub mod progress;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod storage;
pub mod throttle;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::cache::{AssetCache, AssetKey, AssetLease, CacheStats};
pub use crate::catalog::{CatalogEntry, CatalogReader, MemoryCatalog, Page};
#[cfg(feature = "sqlite")]
pub use crate::catalog::SqliteCatalog;
pub use crate::config::AcquisitionConfig;
pub use crate::error::{CacheError, CoreError, CoreResult, FailureReason};
pub use crate::events::DownloadEvent;
pub use crate::manager::DownloadQueueManager;
pub use crate::request::{DownloadRequest, RequestId, RequestSpec, RequestState};
