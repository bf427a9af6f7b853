//! 生产者/消费者与重配置之间的协调

pub mod guard;
pub mod snapshot;

pub use guard::{AccessGuard, Coordinator, CoordinatorError, ReconfigureGuard};
pub use snapshot::{CachedSnapshot, FormatSnapshot, SnapshotCell};
