//! GPU backend built on `wgpu`.
//!
//! Each launch is recorded into its own command buffer and submitted to the device queue
//! immediately, so the queue itself provides submission ordering. Launch timings come from
//! timestamp queries written around the compute pass when the adapter supports them, and
//! from host clock readings around queue completion otherwise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use log::{debug, info, warn};
use pollster::FutureExt;
use wgpu::util::DeviceExt;

use super::{
    CompletionHandle, CompletionSource, ComputeBackend, DeviceInfo, EventTiming, TIMING_HISTORY,
    TimingClock,
};
use crate::config::PipelineConfig;
use crate::errors::{BackendError, BackendResult};
use crate::kernels::{KernelCatalog, KernelId, KernelLaunch, WORKGROUP_SIZE};
use crate::tensor::{BufferId, ELEMENT_SIZE, TensorDescriptor};

/// Bytes written per timestamp query.
const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u64>() as u64;

struct DeviceBuffer {
    descriptor: TensorDescriptor,
    buffer: wgpu::Buffer,
}

struct TimestampQueries {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    capacity: u32,
    period_ns: f64,
}

enum PendingTiming {
    /// Begin and end of pass written to queries `2 * slot` and `2 * slot + 1`.
    Query { slot: u32 },
    HostClock {
        submitted: Instant,
        completed: Arc<Mutex<Option<Instant>>>,
    },
}

struct InFlight {
    id: u64,
    timing: PendingTiming,
}

/// GPU implementation of [`ComputeBackend`].
pub struct WgpuBackend {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    placeholder: wgpu::Buffer,
    pipelines: HashMap<KernelId, wgpu::ComputePipeline>,
    buffers: Vec<Option<DeviceBuffer>>,
    timestamps: Option<TimestampQueries>,
    used_query_slots: u32,
    in_flight: Vec<InFlight>,
    resolved: HashMap<u64, EventTiming>,
    device_error: Arc<Mutex<Option<String>>>,
    next_handle: u64,
    epoch: Instant,
}

impl WgpuBackend {
    /// Selects an adapter, opens its device and builds one pipeline per catalog kernel.
    pub fn initialize(catalog: &KernelCatalog, config: &PipelineConfig) -> BackendResult<Self> {
        Self::new(catalog, config).block_on()
    }

    async fn new(catalog: &KernelCatalog, config: &PipelineConfig) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference.into(),
                ..Default::default()
            })
            .await
            .ok_or_else(|| BackendError::DeviceUnavailable {
                message: "no compatible GPU adapter found".to_string(),
            })?;

        let adapter_info = adapter.get_info();
        let timestamps_supported = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        if !timestamps_supported {
            warn!(
                "{} does not support timestamp queries, timing launches with the host clock",
                adapter_info.name
            );
        }
        let required_features = if timestamps_supported {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sinenet device"),
                    required_features,
                    required_limits: adapter.limits(),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceUnavailable {
                message: e.to_string(),
            })?;

        let device_error = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |error: wgpu::Error| {
            if let Ok(mut slot) = sink.lock() {
                slot.get_or_insert_with(|| error.to_string());
            }
        }));

        let info = DeviceInfo {
            platform: format!("{:?}", adapter_info.backend),
            device: adapter_info.name.clone(),
            clock: if timestamps_supported {
                TimingClock::Device
            } else {
                TimingClock::Host
            },
        };
        info!("Initialized {} on {}", info.device, info.platform);

        let module = compile(&device, catalog).await?;
        let bind_group_layout = create_bind_group_layout(&device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("dense kernels layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let declared = catalog
            .entry_points()
            .map_err(|log| BackendError::CompileError { log })?;
        let mut pipelines = HashMap::new();
        for kernel in KernelId::ALL {
            let name = kernel.entry_point();
            if !declared.iter().any(|declared_name| declared_name == name) {
                return Err(BackendError::KernelCreationError {
                    name: name.to_string(),
                });
            }

            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(name),
                compilation_options: Default::default(),
                cache: None,
            });
            if let Some(error) = device.pop_error_scope().await {
                warn!("Failed to create {name} kernel: {error}");
                return Err(BackendError::KernelCreationError {
                    name: name.to_string(),
                });
            }
            debug!("{name} kernel created successfully");
            pipelines.insert(kernel, pipeline);
        }

        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("unused binding"),
            size: ELEMENT_SIZE as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let timestamps = timestamps_supported.then(|| {
            create_timestamp_queries(&device, &queue, config.profiling_capacity as u32)
        });

        Ok(Self {
            info,
            device,
            queue,
            bind_group_layout,
            placeholder,
            pipelines,
            buffers: Vec::new(),
            timestamps,
            used_query_slots: 0,
            in_flight: Vec::new(),
            resolved: HashMap::new(),
            device_error,
            next_handle: 0,
            epoch: Instant::now(),
        })
    }

    fn buffer(&self, id: BufferId) -> BackendResult<&DeviceBuffer> {
        self.buffers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownBuffer { id: id.index() })
    }

    fn check_device_error(&self) -> BackendResult<()> {
        let message = self
            .device_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        match message {
            Some(message) => Err(BackendError::DeviceExecutionError { message }),
            None => Ok(()),
        }
    }

    fn nanos_since_epoch(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    /// Waits for the queue to go idle and resolves the timings of every launch in flight.
    fn drain(&mut self) -> BackendResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        self.check_device_error()?;
        if self.in_flight.is_empty() {
            return Ok(());
        }

        let ticks = self.read_timestamps()?;
        let period_ns = self.timestamps.as_ref().map_or(1.0, |ts| ts.period_ns);

        for launch in std::mem::take(&mut self.in_flight) {
            let timing = match launch.timing {
                PendingTiming::Query { slot } => {
                    let begin = ticks.get(2 * slot as usize).copied().unwrap_or(0);
                    let end = ticks.get(2 * slot as usize + 1).copied().unwrap_or(begin);
                    EventTiming {
                        start_ns: (begin as f64 * period_ns) as u64,
                        end_ns: (end as f64 * period_ns) as u64,
                    }
                }
                PendingTiming::HostClock {
                    submitted,
                    completed,
                } => {
                    let completed = completed
                        .lock()
                        .ok()
                        .and_then(|instant| *instant)
                        .unwrap_or_else(Instant::now);
                    EventTiming {
                        start_ns: self.nanos_since_epoch(submitted),
                        end_ns: self.nanos_since_epoch(completed),
                    }
                }
            };
            self.resolved.insert(launch.id, timing);
        }
        self.used_query_slots = 0;

        let oldest = self.next_handle.saturating_sub(TIMING_HISTORY);
        self.resolved.retain(|id, _| *id >= oldest);
        Ok(())
    }

    fn read_timestamps(&self) -> BackendResult<Vec<u64>> {
        let Some(ts) = &self.timestamps else {
            return Ok(Vec::new());
        };
        if self.used_query_slots == 0 {
            return Ok(Vec::new());
        }

        let query_count = self.used_query_slots * 2;
        let size = query_count as u64 * TIMESTAMP_SIZE;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("timestamp resolve"),
            });
        encoder.resolve_query_set(&ts.query_set, 0..query_count, &ts.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(&ts.resolve_buffer, 0, &ts.readback_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        self.map_read::<u64>(&ts.readback_buffer, size)
    }

    /// Maps the first `size` bytes of a `MAP_READ` buffer and copies them out.
    fn map_read<T: bytemuck::Pod>(
        &self,
        buffer: &wgpu::Buffer,
        size: u64,
    ) -> BackendResult<Vec<T>> {
        let slice = buffer.slice(..size);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| BackendError::DeviceExecutionError {
                message: "buffer mapping callback dropped".to_string(),
            })?
            .map_err(|e| BackendError::DeviceExecutionError {
                message: e.to_string(),
            })?;

        let values = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, T>(&view).to_vec()
        };
        buffer.unmap();
        Ok(values)
    }

    fn bind_group(
        &self,
        launch: &KernelLaunch,
        params: &wgpu::Buffer,
    ) -> BackendResult<wgpu::BindGroup> {
        let bindings = launch.bindings();
        // The layout is shared by all kernels; slots a kernel never touches get the placeholder.
        let mut storage = Vec::with_capacity(3);
        for slot in 0..3u32 {
            let buffer = match bindings.iter().find(|(binding, _)| *binding == slot) {
                Some((_, id)) => &self.buffer(*id)?.buffer,
                None => &self.placeholder,
            };
            storage.push((slot, buffer));
        }

        let mut entries: Vec<wgpu::BindGroupEntry> = storage
            .into_iter()
            .map(|(slot, buffer)| wgpu::BindGroupEntry {
                binding: slot,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: 3,
            resource: params.as_entire_binding(),
        });

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(launch.kernel().entry_point()),
            layout: &self.bind_group_layout,
            entries: &entries,
        }))
    }
}

async fn compile(
    device: &wgpu::Device,
    catalog: &KernelCatalog,
) -> BackendResult<wgpu::ShaderModule> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("dense kernels"),
        source: wgpu::ShaderSource::Wgsl(catalog.source().into()),
    });
    let compilation = module.get_compilation_info().await;
    let scope_error = device.pop_error_scope().await;

    let mut log: Vec<String> = compilation
        .messages
        .iter()
        .filter(|message| matches!(message.message_type, wgpu::CompilationMessageType::Error))
        .map(|message| match &message.location {
            Some(location) => format!(
                "{}:{}: error: {}",
                location.line_number, location.line_position, message.message
            ),
            None => format!("error: {}", message.message),
        })
        .collect();
    if log.is_empty() {
        if let Some(error) = scope_error {
            log.push(error.to_string());
        }
    }

    if log.is_empty() {
        debug!("Kernel program compiled successfully");
        Ok(module)
    } else {
        Err(BackendError::CompileError {
            log: log.join("\n"),
        })
    }
}

fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let storage = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("dense kernels bindings"),
        entries: &[
            storage(0),
            storage(1),
            storage(2),
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}

fn create_timestamp_queries(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    capacity: u32,
) -> TimestampQueries {
    let query_count = capacity * 2;
    let size = query_count as u64 * TIMESTAMP_SIZE;

    TimestampQueries {
        query_set: device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("launch timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: query_count,
        }),
        resolve_buffer: device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }),
        readback_buffer: device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }),
        capacity,
        period_ns: queue.get_timestamp_period() as f64,
    }
}

impl CompletionSource for WgpuBackend {
    fn wait_all(&mut self, handles: &[CompletionHandle]) -> BackendResult<()> {
        if let Some(unknown) = handles.iter().find(|handle| handle.id() >= self.next_handle) {
            return Err(BackendError::UnresolvedHandle { id: unknown.id() });
        }
        self.drain()
    }

    fn timing(&self, handle: &CompletionHandle) -> BackendResult<EventTiming> {
        self.resolved
            .get(&handle.id())
            .copied()
            .ok_or(BackendError::UnresolvedHandle { id: handle.id() })
    }
}

impl ComputeBackend for WgpuBackend {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(
        &mut self,
        id: BufferId,
        descriptor: &TensorDescriptor,
        contents: Option<&[f32]>,
    ) -> BackendResult<()> {
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let buffer = match contents {
            Some(values) if values.len() != descriptor.element_count() => {
                return Err(BackendError::BufferLengthMismatch {
                    label: descriptor.label().to_string(),
                    expected: descriptor.element_count(),
                    actual: values.len(),
                });
            }
            Some(values) => self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(descriptor.label()),
                    contents: bytemuck::cast_slice(values),
                    usage,
                }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(descriptor.label()),
                size: descriptor.byte_size() as u64,
                usage,
                mapped_at_creation: false,
            }),
        };

        if self.buffers.len() <= id.index() {
            self.buffers.resize_with(id.index() + 1, || None);
        }
        let previous = self.buffers[id.index()].replace(DeviceBuffer {
            descriptor: descriptor.clone(),
            buffer,
        });
        if let Some(previous) = previous {
            previous.buffer.destroy();
        }
        debug!(
            "Allocated '{}' ({} bytes, {})",
            descriptor.label(),
            descriptor.byte_size(),
            descriptor.role()
        );
        Ok(())
    }

    fn write(&mut self, id: BufferId, data: &[f32]) -> BackendResult<()> {
        let target = self.buffer(id)?;
        if target.descriptor.element_count() != data.len() {
            return Err(BackendError::BufferLengthMismatch {
                label: target.descriptor.label().to_string(),
                expected: target.descriptor.element_count(),
                actual: data.len(),
            });
        }
        self.queue
            .write_buffer(&target.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn submit(
        &mut self,
        launch: &KernelLaunch,
        dependencies: &[CompletionHandle],
    ) -> BackendResult<CompletionHandle> {
        if let Some(unknown) = dependencies
            .iter()
            .find(|handle| handle.id() >= self.next_handle)
        {
            return Err(BackendError::UnresolvedHandle { id: unknown.id() });
        }
        self.check_device_error()?;

        let slots_full = self
            .timestamps
            .as_ref()
            .is_some_and(|ts| self.used_query_slots >= ts.capacity);
        if slots_full {
            debug!("Timestamp query slots full, draining pending launches");
            self.drain()?;
        }
        let slot = self.timestamps.as_ref().map(|_| self.used_query_slots);

        let kernel = launch.kernel();
        let pipeline = self
            .pipelines
            .get(&kernel)
            .ok_or(BackendError::KernelCreationError {
                name: kernel.entry_point().to_string(),
            })?;
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel params"),
                contents: bytemuck::bytes_of(&launch.params()),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.bind_group(launch, &params)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.entry_point()),
            });
        {
            let timestamp_writes = match (&self.timestamps, slot) {
                (Some(ts), Some(slot)) => Some(wgpu::ComputePassTimestampWrites {
                    query_set: &ts.query_set,
                    beginning_of_pass_write_index: Some(slot * 2),
                    end_of_pass_write_index: Some(slot * 2 + 1),
                }),
                _ => None,
            };
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(launch.work_size().div_ceil(WORKGROUP_SIZE), 1, 1);
        }

        let submitted = Instant::now();
        self.queue.submit(Some(encoder.finish()));

        let timing = match slot {
            Some(slot) => {
                self.used_query_slots += 1;
                PendingTiming::Query { slot }
            }
            None => {
                let completed = Arc::new(Mutex::new(None));
                let sink = Arc::clone(&completed);
                self.queue.on_submitted_work_done(move || {
                    if let Ok(mut instant) = sink.lock() {
                        *instant = Some(Instant::now());
                    }
                });
                PendingTiming::HostClock {
                    submitted,
                    completed,
                }
            }
        };

        let handle = CompletionHandle::new(self.next_handle, kernel);
        self.next_handle += 1;
        self.in_flight.push(InFlight {
            id: handle.id(),
            timing,
        });
        debug!(
            "Submitted {} with {} workgroups",
            kernel.entry_point(),
            launch.work_size().div_ceil(WORKGROUP_SIZE)
        );
        Ok(handle)
    }

    fn read(&mut self, id: BufferId) -> BackendResult<Vec<f32>> {
        self.drain()?;

        let source = self.buffer(id)?;
        let size = (source.descriptor.element_count() * ELEMENT_SIZE) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let values = self.map_read::<f32>(&staging, size)?;
        staging.destroy();
        self.check_device_error()?;
        Ok(values)
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        for buffer in self.buffers.iter().flatten() {
            buffer.buffer.destroy();
        }
        self.placeholder.destroy();
    }
}
