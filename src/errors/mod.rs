//! Error types for the inference engine.
//!
//! Each concern owns one error enum. Pipeline errors wrap backend errors and attach the
//! layer and stage that failed; nothing in the library is retried.

mod backend_error;
mod config_error;
mod network_error;
mod pipeline_error;

pub use backend_error::{BackendError, BackendResult};
pub use config_error::{ConfigError, ConfigResult};
pub use network_error::{NetworkError, NetworkResult};
pub use pipeline_error::{PipelineError, PipelineResult};
