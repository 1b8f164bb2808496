pub mod config;
pub mod container;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod logs;
pub mod manager;
pub mod metrics;
pub mod services;
pub mod types;

pub use context::{CancelHandle, OpContext};
pub use endpoint::EndpointManager;
pub use error::{Error, ErrorKind, Result};
pub use manager::CoreManager;
pub use types::{Endpoint, EndpointBase, EndpointFilter, EndpointMap, EndpointType};
