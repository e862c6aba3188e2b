pub mod comparator;
pub mod engine;
pub mod metadata;
pub mod progress;
pub mod resolver;
pub mod rules;
pub mod scanner;
pub mod tags;
pub mod target;
pub mod transfer;

pub use comparator::{plan_sync, PlannedUpload, SyncPlan};
pub use engine::{Operation, PhaseSummary, RunReport, SyncEngine, TargetOutcome};
pub use metadata::{resync_metadata, MetadataSummary};
pub use progress::{Phase, ProgressEvent, ProgressSender, ProgressTracker};
pub use resolver::{BucketResolver, OutputError, OutputResolver, StaticOutputs};
pub use rules::{ObjectParams, Rule, RuleMatch, RuleSet};
pub use scanner::{list_files_recursive, scan_local_tree, LocalFile};
pub use tags::{merge_tags, sync_bucket_tags};
pub use target::{AccessControl, BucketIdentity, SyncTarget, TargetEntry, TargetSet};
pub use transfer::{ClearSummary, SyncSummary, TargetState, TransferOrchestrator};
