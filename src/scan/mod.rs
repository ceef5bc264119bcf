//! Parallel scan fan-out across cluster nodes.

pub mod executor;
pub mod external;
pub mod types;
pub mod wire;

pub use executor::{CallbackAction, Executor};
pub use types::{ScanRecord, ScanRequest, TaskId, UdfCall};
