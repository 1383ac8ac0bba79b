pub mod archive;
pub mod engine;
pub mod guard;
pub mod relocator;
pub mod scanner;
pub mod scheduler;

pub use archive::{ArchiveExpander, ARCHIVED_DIR, FAILED_DIR};
pub use engine::{
    CycleHandle, FileRow, FileStatus, SyncConfig, SyncEngine, SyncEvent, SyncReport, SyncSession,
};
pub use guard::{is_inside, PathGuard, RemovalPolicy};
pub use relocator::{FileRelocator, SyncOutcome};
pub use scanner::{DiscoveredFile, FileScanner, ScanConfig, MAX_SCAN_DEPTH};
pub use scheduler::{
    CycleRunner, SchedulerHandle, SchedulerOptions, SyncScheduler, SyncTrigger, TriggerReason,
};
