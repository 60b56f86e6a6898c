use sqlx::SqlitePool;

pub mod bind_tokens;
pub mod checkpoints;
pub mod ledger;
pub mod migrations;
pub mod nodes;
pub mod stats;
pub mod tasks;
pub mod users;

pub type Db = SqlitePool;

pub use checkpoints::CheckpointRecord;
pub use ledger::{LedgerReason, LedgerRecord};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use nodes::{NodeHello, NodeRecord, NodeStatus};
pub use stats::SystemCounts;
pub use tasks::{NewTask, TaskFilter, TaskHeader, TaskOrigin, TaskRecord, TaskStatus};
pub use users::{UserRecord, UserRole};
