pub mod engine;
pub mod fingerprint;
pub mod moves;
pub mod node;
pub mod notifier;
pub mod scanner;
pub mod state;
pub mod triplet;
pub mod waiter;

pub use engine::{PassOutcome, StallReason, Sync, SyncDeps, SyncOptions};
pub use fingerprint::Fingerprint;
pub use node::{NodeDbId, SyncNode, SyncTree, TreeState};
pub use notifier::DirNotifier;
pub use scanner::{ScanRequest, ScanService};
pub use state::{SyncState, SyncStateMachine};
pub use waiter::Waiter;
