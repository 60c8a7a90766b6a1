//! Thread board daemon: storage, guarded transitions, queue and service.

pub mod daemon_loop;
pub mod lifecycle;
pub mod persistence;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod store;

pub use daemon_loop::*;
pub use lifecycle::*;
pub use persistence::*;
pub use queue::*;
pub use rate_limiter::*;
pub use service::*;
pub use store::*;
