//! Compute backend handles.
//!
//! A backend owns one compute device, one in-order command queue, the compiled kernel
//! program and every device buffer allocated through it. Two implementations exist:
//!
//! - [`WgpuBackend`]: a GPU reached through `wgpu`, running the WGSL kernels.
//! - [`HostBackend`]: a host reference device that executes the same kernel contracts
//!   on the CPU, one work-item at a time.
//!
//! # Ordering
//!
//! Launches execute in submission order. `submit` additionally takes the handles the
//! launch depends on; a backend must reject handles it has never issued, and must not
//! start the launch before its dependencies complete.

pub mod host;
pub mod wgpu_backend;

pub use host::HostBackend;
pub use wgpu_backend::WgpuBackend;

use std::fmt;

use crate::errors::BackendResult;
use crate::kernels::{KernelId, KernelLaunch};
use crate::tensor::{BufferId, TensorDescriptor};

/// Resolved timings are kept for this many of the most recent launches.
pub const TIMING_HISTORY: u64 = 4096;

/// Human-readable identification of the selected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Platform or driver backend (e.g. `Vulkan`, `Metal`, `Host`).
    pub platform: String,
    /// Device name as reported by the platform.
    pub device: String,
    /// Where launch timestamps come from.
    pub clock: TimingClock,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Platform Name: {}", self.platform)?;
        write!(f, "Device Name: {}", self.device)
    }
}

/// Origin of the timestamps attached to completion handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingClock {
    /// Timestamps written by the device around each dispatch.
    Device,
    /// Host clock readings at submission and at completion notification.
    Host,
}

/// Opaque token for the asynchronous completion of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionHandle {
    id: u64,
    kernel: KernelId,
}

impl CompletionHandle {
    pub fn new(id: u64, kernel: KernelId) -> Self {
        Self { id, kernel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kernel(&self) -> KernelId {
        self.kernel
    }
}

/// Start and end of a resolved launch, in nanoseconds on the backend's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTiming {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl EventTiming {
    pub fn elapsed_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Resolves completion handles and exposes their timestamps.
///
/// Split from [`ComputeBackend`] so timing aggregation can run against synthetic events.
pub trait CompletionSource {
    /// Blocks until every listed launch has completed.
    fn wait_all(&mut self, handles: &[CompletionHandle]) -> BackendResult<()>;

    /// Timestamps of a launch. Only valid after a `wait_all` that covered the handle.
    fn timing(&self, handle: &CompletionHandle) -> BackendResult<EventTiming>;
}

/// A connection to one compute device.
pub trait ComputeBackend: CompletionSource {
    fn device_info(&self) -> &DeviceInfo;

    /// Allocates device memory for an arena slot, optionally initialised with `contents`.
    fn allocate(
        &mut self,
        id: BufferId,
        descriptor: &TensorDescriptor,
        contents: Option<&[f32]>,
    ) -> BackendResult<()>;

    /// Overwrites a whole buffer. Ordered before any launch submitted afterwards.
    fn write(&mut self, id: BufferId, data: &[f32]) -> BackendResult<()>;

    /// Enqueues a launch without waiting for it and returns its completion handle.
    fn submit(
        &mut self,
        launch: &KernelLaunch,
        dependencies: &[CompletionHandle],
    ) -> BackendResult<CompletionHandle>;

    /// Copies a buffer back to the host, waiting for all submitted work first.
    fn read(&mut self, id: BufferId) -> BackendResult<Vec<f32>>;
}
