pub mod coordinator;
pub mod error;
pub mod predicate;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod task;
pub mod tiers;

pub use coordinator::{Assignment, Completion, Coordinator, Summary};
pub use error::{Result, TaskDbError};
pub use protocol::{ApiForm, ApiRequest, ApiResponse, Status};
pub use registry::{RejectEmpty, ResultFilter, Stat, TaskRegistry};
pub use store::{Backend, StoreOptions};
pub use task::{Document, Task, TaskId};
