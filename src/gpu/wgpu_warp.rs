//! WebGPU compute rendition of the distortion warp

use bytemuck::{Pod, Zeroable};
use tracing::{info, instrument};
use wgpu::util::DeviceExt;
use wgpu::*;

use crate::error::{PipelineError, Result};
use crate::stages::raster::RgbaView;
use crate::stages::warp::EyeWarp;
use crate::GpuBackend;

const WARP_WGSL: &str = include_str!("warp.wgsl");
const WORKGROUP: u32 = 8;

/// Uniform block matching `WarpParams` in warp.wgsl
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WarpUniforms {
    k_red: [f32; 4],
    k_green: [f32; 4],
    k_blue: [f32; 4],
    src_size: [u32; 2],
    dst_size: [u32; 2],
    lens_center: [f32; 2],
    aspect: f32,
    epsilon: f32,
    max_iterations: u32,
    border: u32,
    _pad: [u32; 2],
}

impl WarpUniforms {
    fn new(params: &EyeWarp, src_width: u32, src_height: u32) -> Self {
        let [red, green, blue] = params.coefficients;
        Self {
            k_red: red.0,
            k_green: green.0,
            k_blue: blue.0,
            src_size: [src_width, src_height],
            dst_size: [params.out_width, params.out_height],
            lens_center: params.lens_center.to_array(),
            aspect: params.out_width as f32 / params.out_height as f32,
            epsilon: params.solver.epsilon,
            max_iterations: params.solver.max_iterations,
            border: u32::from_le_bytes(params.border),
            _pad: [0; 2],
        }
    }
}

/// GPU warp pass with its own device and queue.
pub struct WgpuWarp {
    device: Device,
    queue: Queue,
    pipeline: ComputePipeline,
    bind_group_layout: BindGroupLayout,
    pub adapter_name: String,
}

impl WgpuWarp {
    /// Initialize the compute device. `on_error` is invoked for uncaptured
    /// device errors, which the pipeline treats as a lost context.
    #[instrument(skip(on_error))]
    pub async fn new(
        backend: GpuBackend,
        on_error: impl Fn(String) + Send + Sync + 'static,
    ) -> Result<Self> {
        let backends = match backend {
            GpuBackend::Vulkan => Backends::VULKAN,
            GpuBackend::Metal => Backends::METAL,
            GpuBackend::Dx12 => Backends::DX12,
            GpuBackend::OpenGl => Backends::GL,
            GpuBackend::Auto => Backends::PRIMARY,
            GpuBackend::Software => {
                return Err(PipelineError::DeviceNotFound(
                    "software backend has no GPU device".into(),
                ))
            }
        };

        let instance = Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| PipelineError::DeviceNotFound("no suitable GPU adapter".into()))?;

        let adapter_name = adapter.get_info().name;
        info!("GPU: {}", adapter_name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("vrcast warp device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults(),
                    memory_hints: MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| PipelineError::DeviceNotFound(format!("GPU device request failed: {e}")))?;

        device.on_uncaptured_error(Box::new(move |err| on_error(err.to_string())));

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("warp_shader"),
            source: ShaderSource::Wgsl(WARP_WGSL.into()),
        });

        let storage = |binding, read_only| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("warp_bind_group_layout"),
            entries: &[
                // Source eye image
                storage(0, true),
                // Warped output
                storage(1, false),
                // Uniform parameters
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("warp_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("warp_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            adapter_name,
        })
    }

    pub fn new_blocking(
        backend: GpuBackend,
        on_error: impl Fn(String) + Send + Sync + 'static,
    ) -> Result<Self> {
        pollster::block_on(Self::new(backend, on_error))
    }

    /// Warps one tightly packed RGBA8 eye image and reads the result back.
    pub fn warp_eye(&self, params: &EyeWarp, src: &RgbaView<'_>) -> Result<Vec<u8>> {
        let uniforms = WarpUniforms::new(params, src.width, src.height);
        let out_size = params.out_width as u64 * params.out_height as u64 * 4;

        let src_buffer = self.device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("warp_src"),
            contents: src.data,
            usage: BufferUsages::STORAGE,
        });
        let dst_buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("warp_dst"),
            size: out_size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let uniform_buffer = self.device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("warp_params"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: BufferUsages::UNIFORM,
        });
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("warp_staging"),
            size: out_size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("warp_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: src_buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: dst_buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("warp_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("warp_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                params.out_width.div_ceil(WORKGROUP),
                params.out_height.div_ceil(WORKGROUP),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&dst_buffer, 0, &staging, 0, out_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = flume::bounded(1);
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(Maintain::Wait);
        rx.recv()
            .map_err(|_| PipelineError::GpuContextLost("readback callback dropped".into()))?
            .map_err(|e| PipelineError::GpuContextLost(format!("readback failed: {e}")))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout_matches_shader() {
        // three vec4, two vec2<u32>, one vec2<f32>, six scalars
        assert_eq!(std::mem::size_of::<WarpUniforms>(), 96);
        assert_eq!(std::mem::size_of::<WarpUniforms>() % 16, 0);
    }

    #[test]
    fn test_shader_declares_entry_point() {
        assert!(WARP_WGSL.contains("fn main("));
        assert!(WARP_WGSL.contains("@group(0) @binding(2)"));
    }
}
