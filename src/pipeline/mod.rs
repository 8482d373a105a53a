pub mod ingest;
pub mod processor;
pub mod rate_limit;
pub mod refresher;

pub use ingest::Ingestor;
pub use processor::{ProcessorConfig, QueueProcessor};
pub use rate_limit::{HostBackoff, HostRateLimiter};
pub use refresher::{Refresher, RefresherConfig};
