pub mod column;
pub mod config;
pub mod events;
pub mod refetch;
pub mod status;
pub mod types;
pub mod validation;

pub use column::*;
pub use config::*;
pub use events::*;
pub use refetch::*;
pub use status::*;
pub use types::*;
pub use validation::*;
