pub mod config;
pub mod error;
pub mod executor;
pub mod hypervisor;
pub mod lease;
pub mod populator;
pub mod progress;
pub mod service;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracing;

pub use error::{Error, Result};
pub use populator::{PopulateRequest, PopulatorDeps};
pub use service::Service;
