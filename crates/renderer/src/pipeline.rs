use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::Arc;

use tracing::debug;

use crate::bindless::CONSTANT_SLOT_SIZE;
use crate::channels::{ChannelKind, CHANNEL_COUNT};
use crate::compile::{
    check_stage_interface, lower_to_spirv, parse_to_ir, synthesize_source, vertex_ir,
    ShaderCompiler, ShaderIr, SourceOptions,
};
use crate::error::BuildError;

/// Format of every offscreen pass output.
pub const INTERMEDIATE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Where a pass writes, which decides its colour state and coordinate flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    /// Double-buffered intermediate sampled by later passes or frames.
    Offscreen,
    /// The frame's presentation target.
    Presentation(wgpu::TextureFormat),
}

impl PassTarget {
    pub fn format(self) -> wgpu::TextureFormat {
        match self {
            PassTarget::Offscreen => INTERMEDIATE_FORMAT,
            PassTarget::Presentation(format) => format,
        }
    }

    fn blend(self) -> wgpu::BlendState {
        match self {
            // Buffers carry arbitrary data in alpha, so they are written as-is.
            PassTarget::Offscreen => wgpu::BlendState::REPLACE,
            PassTarget::Presentation(_) => wgpu::BlendState::ALPHA_BLENDING,
        }
    }
}

/// A pass compiled down to pipeline state. Holds no per-frame resources.
pub struct CompiledPass {
    pub label: String,
    pub pipeline: wgpu::RenderPipeline,
    pub channel_layout: wgpu::BindGroupLayout,
    pub channel_kinds: [ChannelKind; CHANNEL_COUNT],
    pub target: PassTarget,
}

/// Shared layouts plus the full-screen vertex stage. Cheap to clone onto the
/// compile worker.
#[derive(Clone)]
pub struct PassCompiler {
    device: wgpu::Device,
    uniform_layout: wgpu::BindGroupLayout,
    vertex_module: wgpu::ShaderModule,
    vertex_ir: Arc<ShaderIr>,
    compiler: ShaderCompiler,
}

impl PassCompiler {
    pub fn new(device: &wgpu::Device, compiler: ShaderCompiler) -> Result<Self, BuildError> {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(CONSTANT_SLOT_SIZE),
                },
                count: None,
            }],
        });

        let vertex_ir = vertex_ir()?;
        let words = lower_to_spirv("fullscreen vertex", &vertex_ir)?;
        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen triangle vertex"),
            source: wgpu::ShaderSource::SpirV(Cow::Owned(words)),
        });

        Ok(Self {
            device: device.clone(),
            uniform_layout,
            vertex_module,
            vertex_ir: Arc::new(vertex_ir),
            compiler,
        })
    }

    pub fn uniform_layout(&self) -> &wgpu::BindGroupLayout {
        &self.uniform_layout
    }

    pub fn compiler(&self) -> ShaderCompiler {
        self.compiler
    }

    /// Runs both compile stages for one pass and builds its pipeline.
    pub fn compile_pass(
        &self,
        label: &str,
        common: &str,
        code: &str,
        channel_kinds: [ChannelKind; CHANNEL_COUNT],
        target: PassTarget,
    ) -> Result<CompiledPass, BuildError> {
        let options = SourceOptions {
            channel_kinds,
            flip_y: matches!(target, PassTarget::Presentation(_)),
        };
        let source = synthesize_source(common, code, &options);
        let ir = parse_to_ir(label, &source, self.compiler)?;
        check_stage_interface(label, &self.vertex_ir, &ir)?;
        let words = lower_to_spirv(label, &ir)?;
        debug!(
            pass = label,
            words = words.len(),
            compiler = %self.compiler,
            "lowered pass to SPIR-V"
        );

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fragment_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::SpirV(Cow::Owned(words)),
            });
        let channel_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("channel layout"),
                entries: &build_channel_layout_entries(&channel_kinds),
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("pass pipeline layout"),
                bind_group_layouts: &[&self.uniform_layout, &channel_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self.create_render_pipeline(
            label,
            &pipeline_layout,
            &fragment_module,
            target,
        );
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BuildError::PipelineBuildFailed {
                pass: label.to_string(),
                diagnostic: err.to_string(),
            });
        }

        Ok(CompiledPass {
            label: label.to_string(),
            pipeline,
            channel_layout,
            channel_kinds,
            target,
        })
    }

    fn create_render_pipeline(
        &self,
        label: &str,
        layout: &wgpu::PipelineLayout,
        fragment_module: &wgpu::ShaderModule,
        target: PassTarget,
    ) -> wgpu::RenderPipeline {
        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &self.vertex_module,
                    entry_point: Some("main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: fragment_module,
                    entry_point: Some("main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target.format(),
                        blend: Some(target.blend()),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                multiview: None,
                cache: None,
            })
    }
}

pub(crate) fn build_channel_layout_entries(
    kinds: &[ChannelKind; CHANNEL_COUNT],
) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
    for (index, kind) in kinds.iter().enumerate() {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: (index as u32) * 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: kind.view_dimension(),
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: (index as u32) * 2 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_layout_pairs_textures_with_samplers() {
        let kinds = [
            ChannelKind::Texture2d,
            ChannelKind::Cube,
            ChannelKind::Texture2d,
            ChannelKind::Volume,
        ];
        let entries = build_channel_layout_entries(&kinds);
        assert_eq!(entries.len(), 8);
        assert!(matches!(
            entries[2].ty,
            wgpu::BindingType::Texture {
                view_dimension: wgpu::TextureViewDimension::Cube,
                ..
            }
        ));
        assert!(matches!(
            entries[6].ty,
            wgpu::BindingType::Texture {
                view_dimension: wgpu::TextureViewDimension::D3,
                ..
            }
        ));
        assert!(matches!(entries[7].ty, wgpu::BindingType::Sampler(_)));
        assert_eq!(entries[7].binding, 7);
    }

    #[test]
    fn offscreen_targets_use_the_intermediate_format() {
        assert_eq!(PassTarget::Offscreen.format(), INTERMEDIATE_FORMAT);
        assert_eq!(
            PassTarget::Presentation(wgpu::TextureFormat::Bgra8Unorm).format(),
            wgpu::TextureFormat::Bgra8Unorm
        );
        assert_eq!(PassTarget::Offscreen.blend(), wgpu::BlendState::REPLACE);
    }
}
