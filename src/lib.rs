pub mod allocator;
pub mod config;
pub mod config_parser;
pub mod context;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod kafka;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod state_machine;
pub mod store;
pub mod supervisor;

pub use allocator::*;
pub use crate::config::*;
pub use context::*;
pub use domain::*;
pub use error::*;
pub use handlers::*;
pub use kafka::*;
pub use metrics::*;
pub use state_machine::*;
pub use supervisor::*;
