//! Host reference device.
//!
//! Executes the catalog's kernel contracts on the CPU. Launches run to completion inside
//! `submit`, in submission order, so the queue is trivially in-order; timestamps come from
//! the host clock but, like device events, are only readable after a wait.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, info};

use super::{
    CompletionHandle, CompletionSource, ComputeBackend, DeviceInfo, EventTiming, TIMING_HISTORY,
    TimingClock,
};
use crate::errors::{BackendError, BackendResult};
use crate::kernels::{KernelCatalog, KernelId, KernelLaunch, compute_entry_points};
use crate::tensor::{BufferId, TensorDescriptor};

struct HostBuffer {
    descriptor: TensorDescriptor,
    data: Vec<f32>,
}

/// CPU implementation of [`ComputeBackend`].
pub struct HostBackend {
    info: DeviceInfo,
    buffers: Vec<Option<HostBuffer>>,
    pending: HashMap<u64, EventTiming>,
    resolved: HashMap<u64, EventTiming>,
    next_handle: u64,
    submitted: usize,
    epoch: Instant,
}

impl HostBackend {
    /// Compiles the kernel program and resolves every catalog entry point from it.
    pub fn initialize(catalog: &KernelCatalog) -> BackendResult<Self> {
        let module = catalog
            .compile()
            .map_err(|log| BackendError::CompileError { log })?;
        debug!("Kernel program compiled successfully");

        let declared = compute_entry_points(&module);
        for kernel in KernelId::ALL {
            if !declared.iter().any(|name| name == kernel.entry_point()) {
                return Err(BackendError::KernelCreationError {
                    name: kernel.entry_point().to_string(),
                });
            }
            debug!("{} kernel created successfully", kernel.entry_point());
        }

        let info = DeviceInfo {
            platform: "Host".to_string(),
            device: "reference CPU device".to_string(),
            clock: TimingClock::Host,
        };
        info!("Initialized {} on {}", info.device, info.platform);

        Ok(Self {
            info,
            buffers: Vec::new(),
            pending: HashMap::new(),
            resolved: HashMap::new(),
            next_handle: 0,
            submitted: 0,
            epoch: Instant::now(),
        })
    }

    /// Number of launches executed since initialization.
    pub fn submitted_launches(&self) -> usize {
        self.submitted
    }

    fn buffer(&self, id: BufferId) -> BackendResult<&HostBuffer> {
        self.buffers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownBuffer { id: id.index() })
    }

    fn buffer_mut(&mut self, id: BufferId) -> BackendResult<&mut HostBuffer> {
        self.buffers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(BackendError::UnknownBuffer { id: id.index() })
    }

    /// First `len` elements of a buffer, or a device fault when the read overruns it.
    fn operand(&self, id: BufferId, len: usize) -> BackendResult<&[f32]> {
        let buffer = self.buffer(id)?;
        buffer
            .data
            .get(..len)
            .ok_or_else(|| BackendError::DeviceExecutionError {
                message: format!(
                    "read of {} elements overruns '{}' ({} elements)",
                    len,
                    buffer.descriptor.label(),
                    buffer.data.len()
                ),
            })
    }

    fn is_known(&self, handle: &CompletionHandle) -> bool {
        handle.id() < self.next_handle
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn execute(&mut self, launch: &KernelLaunch) -> BackendResult<()> {
        let result: Vec<f32> = match *launch {
            KernelLaunch::Multiply {
                weights,
                input,
                rows,
                cols,
                ..
            } => {
                let (rows, cols) = (rows as usize, cols as usize);
                let weights = self.operand(weights, rows * cols)?;
                let input = self.operand(input, cols)?;
                // one work-item per row
                (0..rows)
                    .map(|row| {
                        weights[row * cols..(row + 1) * cols]
                            .iter()
                            .zip(input)
                            .fold(0.0f32, |acc, (w, x)| acc + w * x)
                    })
                    .collect()
            }
            KernelLaunch::AddBias { a, b, len, .. } => {
                let a = self.operand(a, len as usize)?;
                let b = self.operand(b, len as usize)?;
                a.iter().zip(b).map(|(x, y)| x + y).collect()
            }
            KernelLaunch::Activate { input, len, .. } => self
                .operand(input, len as usize)?
                .iter()
                .map(|value| value.max(0.0))
                .collect(),
        };

        let output = self.buffer_mut(launch.output())?;
        let available = output.data.len();
        let target = output.data.get_mut(..result.len()).ok_or_else(|| {
            BackendError::DeviceExecutionError {
                message: format!(
                    "write of {} elements overruns '{}' ({} elements)",
                    result.len(),
                    output.descriptor.label(),
                    available
                ),
            }
        })?;
        target.copy_from_slice(&result);
        Ok(())
    }
}

impl CompletionSource for HostBackend {
    fn wait_all(&mut self, handles: &[CompletionHandle]) -> BackendResult<()> {
        for handle in handles {
            if let Some(timing) = self.pending.remove(&handle.id()) {
                self.resolved.insert(handle.id(), timing);
            } else if !self.is_known(handle) {
                return Err(BackendError::UnresolvedHandle { id: handle.id() });
            }
        }
        let oldest = self.next_handle.saturating_sub(TIMING_HISTORY);
        self.resolved.retain(|id, _| *id >= oldest);
        Ok(())
    }

    fn timing(&self, handle: &CompletionHandle) -> BackendResult<EventTiming> {
        self.resolved
            .get(&handle.id())
            .copied()
            .ok_or(BackendError::UnresolvedHandle { id: handle.id() })
    }
}

impl ComputeBackend for HostBackend {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(
        &mut self,
        id: BufferId,
        descriptor: &TensorDescriptor,
        contents: Option<&[f32]>,
    ) -> BackendResult<()> {
        let data = match contents {
            Some(values) if values.len() != descriptor.element_count() => {
                return Err(BackendError::BufferLengthMismatch {
                    label: descriptor.label().to_string(),
                    expected: descriptor.element_count(),
                    actual: values.len(),
                });
            }
            Some(values) => values.to_vec(),
            None => vec![0.0; descriptor.element_count()],
        };

        if self.buffers.len() <= id.index() {
            self.buffers.resize_with(id.index() + 1, || None);
        }
        self.buffers[id.index()] = Some(HostBuffer {
            descriptor: descriptor.clone(),
            data,
        });
        Ok(())
    }

    fn write(&mut self, id: BufferId, data: &[f32]) -> BackendResult<()> {
        let buffer = self.buffer_mut(id)?;
        if buffer.data.len() != data.len() {
            return Err(BackendError::BufferLengthMismatch {
                label: buffer.descriptor.label().to_string(),
                expected: buffer.data.len(),
                actual: data.len(),
            });
        }
        buffer.data.copy_from_slice(data);
        Ok(())
    }

    fn submit(
        &mut self,
        launch: &KernelLaunch,
        dependencies: &[CompletionHandle],
    ) -> BackendResult<CompletionHandle> {
        if let Some(unknown) = dependencies.iter().find(|handle| !self.is_known(handle)) {
            return Err(BackendError::UnresolvedHandle { id: unknown.id() });
        }

        let start_ns = self.now_ns();
        self.execute(launch)?;
        let end_ns = self.now_ns();

        let handle = CompletionHandle::new(self.next_handle, launch.kernel());
        self.next_handle += 1;
        self.submitted += 1;
        self.pending
            .insert(handle.id(), EventTiming { start_ns, end_ns });
        debug!(
            "Executed {} over {} work-items",
            launch.kernel().entry_point(),
            launch.work_size()
        );
        Ok(handle)
    }

    fn read(&mut self, id: BufferId) -> BackendResult<Vec<f32>> {
        Ok(self.buffer(id)?.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorRole;

    fn backend_with(buffers: &[(&str, TensorRole, &[f32])]) -> (HostBackend, Vec<BufferId>) {
        let mut backend = HostBackend::initialize(&KernelCatalog::bundled()).unwrap();
        let mut ids = Vec::new();
        for (index, (label, role, values)) in buffers.iter().enumerate() {
            let id = BufferId::new(index);
            let descriptor = TensorDescriptor::new(*label, values.len(), *role);
            backend.allocate(id, &descriptor, Some(values)).unwrap();
            ids.push(id);
        }
        (backend, ids)
    }

    #[test]
    fn test_multiply_accumulates_each_row() {
        let (mut backend, ids) = backend_with(&[
            ("w", TensorRole::Weight, &[1.0, 2.0, 3.0, -1.0, 0.5, 0.0]),
            ("x", TensorRole::Input, &[1.0, 2.0, 3.0]),
            ("y", TensorRole::Output, &[0.0, 0.0]),
        ]);
        let launch = KernelLaunch::Multiply {
            weights: ids[0],
            input: ids[1],
            output: ids[2],
            rows: 2,
            cols: 3,
        };
        let handle = backend.submit(&launch, &[]).unwrap();
        backend.wait_all(&[handle]).unwrap();

        assert_eq!(backend.read(ids[2]).unwrap(), vec![14.0, 0.0]);
    }

    #[test]
    fn test_elementwise_kernels_run_in_place() {
        let (mut backend, ids) = backend_with(&[
            ("acc", TensorRole::Scratch, &[-2.0, 1.0, 3.0]),
            ("b", TensorRole::Bias, &[1.0, -2.0, 0.5]),
        ]);
        let add = backend
            .submit(
                &KernelLaunch::AddBias {
                    a: ids[0],
                    b: ids[1],
                    output: ids[0],
                    len: 3,
                },
                &[],
            )
            .unwrap();
        backend
            .submit(
                &KernelLaunch::Activate {
                    input: ids[0],
                    output: ids[0],
                    len: 3,
                },
                &[add],
            )
            .unwrap();

        assert_eq!(backend.read(ids[0]).unwrap(), vec![0.0, 0.0, 3.5]);
        assert_eq!(backend.submitted_launches(), 2);
    }

    #[test]
    fn test_timing_requires_wait() {
        let (mut backend, ids) = backend_with(&[("v", TensorRole::Scratch, &[1.0])]);
        let handle = backend
            .submit(
                &KernelLaunch::Activate {
                    input: ids[0],
                    output: ids[0],
                    len: 1,
                },
                &[],
            )
            .unwrap();

        assert!(matches!(
            backend.timing(&handle),
            Err(BackendError::UnresolvedHandle { .. })
        ));
        backend.wait_all(&[handle]).unwrap();
        let timing = backend.timing(&handle).unwrap();
        assert!(timing.end_ns >= timing.start_ns);
    }

    #[test]
    fn test_overrunning_read_is_a_device_fault() {
        let (mut backend, ids) = backend_with(&[
            ("w", TensorRole::Weight, &[1.0, 2.0]),
            ("x", TensorRole::Input, &[1.0]),
            ("y", TensorRole::Output, &[0.0, 0.0]),
        ]);
        let launch = KernelLaunch::Multiply {
            weights: ids[0],
            input: ids[1],
            output: ids[2],
            rows: 2,
            cols: 2,
        };
        assert!(matches!(
            backend.submit(&launch, &[]),
            Err(BackendError::DeviceExecutionError { .. })
        ));
        assert_eq!(backend.submitted_launches(), 0);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let (mut backend, ids) = backend_with(&[("v", TensorRole::Scratch, &[1.0])]);
        let stranger = CompletionHandle::new(42, KernelId::Multiply);
        let result = backend.submit(
            &KernelLaunch::Activate {
                input: ids[0],
                output: ids[0],
                len: 1,
            },
            &[stranger],
        );
        assert!(matches!(
            result,
            Err(BackendError::UnresolvedHandle { id: 42 })
        ));
    }

    #[test]
    fn test_allocate_checks_contents_length() {
        let mut backend = HostBackend::initialize(&KernelCatalog::bundled()).unwrap();
        let descriptor = TensorDescriptor::new("b", 4, TensorRole::Bias);
        let result = backend.allocate(BufferId::new(0), &descriptor, Some(&[1.0]));
        assert!(matches!(
            result,
            Err(BackendError::BufferLengthMismatch {
                expected: 4,
                actual: 1,
                ..
            })
        ));
    }
}
