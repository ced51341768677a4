//! Errors raised by a compute backend.

use thiserror::Error;

/// Errors that can occur while acquiring a device, building kernels or running them.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("No compute device available: {message}")]
    DeviceUnavailable { message: String },

    #[error("Kernel program failed to compile:\n{log}")]
    CompileError { log: String },

    #[error("Kernel entry point '{name}' could not be created from the compiled program")]
    KernelCreationError { name: String },

    #[error("Buffer {id} is not allocated on this device")]
    UnknownBuffer { id: usize },

    #[error("Buffer '{label}' holds {expected} f32 values, got {actual}")]
    BufferLengthMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("Device execution failed: {message}")]
    DeviceExecutionError { message: String },

    #[error("Completion handle {id} has not been resolved by a wait")]
    UnresolvedHandle { id: u64 },
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
