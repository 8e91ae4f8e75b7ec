//! stratus-state — task lifecycle enforcement.
//!
//! The heart of the crate is a pure transition function
//! ([`machine::evaluate`]) that maps `(from, to, task context)` to the
//! side-effect commands a legal transition requires. The
//! [`StateManager`] interprets those commands inside a single storage
//! write transaction, hands kill/launch instructions to the [`Driver`]
//! only after commit, and publishes state-change events for the
//! scheduling loop.
//!
//! Advisory locks and host maintenance also live here: both are thin
//! layers over the storage facade that the RPC surface consults before
//! mutating jobs or draining hosts.

pub mod driver;
pub mod error;
pub mod events;
pub mod locks;
pub mod machine;
pub mod maintenance;
pub mod manager;

pub use driver::{Driver, LoggingDriver, RecordingDriver};
pub use error::{LockError, StateError, StateResult};
pub use events::{EventBus, SchedulerEvent};
pub use locks::LockManager;
pub use machine::{evaluate, Eval, TransitionContext, WorkCommand};
pub use maintenance::{HostStatus, MaintenanceController};
pub use manager::{ReschedulePolicy, RescheduleVerdict, StateManager};
