//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! SecurityManager::initialize
//!     → scheduler.rs spawns periodic jobs (key rotation, limiter cleanup,
//!       nonce pruning, audit flush) and the rotation listener
//!
//! SecurityManager::shutdown
//!     → shutdown.rs latches the stop flag
//!     → scheduler.rs aborts every task it still owns
//! ```
//!
//! # Design Decisions
//! - No timer lives in a struct field; every background job is a
//!   scheduler task with a cancellation handle
//! - Shutdown is deterministic: after `Scheduler::shutdown` returns no
//!   scheduled job runs again

pub mod scheduler;
pub mod shutdown;

pub use scheduler::{Scheduler, TaskHandle};
pub use shutdown::{Shutdown, ShutdownSignal};
