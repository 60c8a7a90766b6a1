pub mod error;
pub mod hub;
pub mod publisher;
pub mod types;
pub mod watcher;

pub use error::*;
pub use hub::*;
pub use publisher::*;
pub use types::*;
pub use watcher::*;
