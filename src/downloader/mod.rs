pub mod checksum;
pub mod controller;
pub mod extract;
pub mod fetcher;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod segment;
pub mod task;

pub use checksum::ChecksumVerifier;
pub use controller::{ControllerContext, InstallInfo, TaskController};
pub use extract::{ArchiveExtractor, ZipExtractor};
pub use fetcher::{FetchOutcome, SegmentFetcher};
pub use orchestrator::InstallOrchestrator;
pub use progress::SpeedCalculator;
pub use retry::RetryPolicy;
pub use segment::{Segment, SegmentPlanner};
pub use task::{DownloadTask, TaskStatus};
