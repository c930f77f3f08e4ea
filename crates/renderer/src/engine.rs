//! Render-thread facade over the registry, the compile worker, and the live
//! render input.
//!
//! ```text
//!   load(handle) ──▶ CompileController ──▶ worker: fetch, plan, decode, compile
//!                                         │ {generation, PreparedShader}
//!   poll() ◀───────────────────────────────┘
//!     └─▶ RenderInput::initialize (registry allocations) ─▶ old input released
//!   render_frame(encoder, target, dt) ─▶ uniforms ─▶ graph.execute ─▶ draw(0..3)
//! ```

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use shadertoy::{load_shader, ShaderHandle, ShadertoyClient};
use tracing::{debug, error, info, warn};

use crate::bindless::{HeapCapacities, ResourceRegistry, CONSTANT_SLOT_SIZE};
use crate::channels::{create_channel_sampler, Placeholders};
use crate::compile::ShaderCompiler;
use crate::controller::{CompileController, CompileStatus};
use crate::error::{BindlessError, BuildError};
use crate::graph::{compile_graph, plan_graph, RenderGraph};
use crate::input::{
    DecodedImage, FrameContext, LivePass, Overlay, PreparedShader, RenderInput, SharedBindings,
};
use crate::pipeline::PassCompiler;
use crate::uniforms::FrameClock;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub capacities: HeapCapacities,
    pub compiler: ShaderCompiler,
    pub queue_depth: usize,
    pub presentation_format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Needed for `shadertoy://` handles only.
    pub client: Option<ShadertoyClient>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            capacities: HeapCapacities::default(),
            compiler: ShaderCompiler::default(),
            queue_depth: 4,
            presentation_format: wgpu::TextureFormat::Rgba8Unorm,
            width: 1280,
            height: 720,
            client: None,
        }
    }
}

pub struct Engine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    registry: ResourceRegistry,
    shared: SharedBindings,
    controller: CompileController<ShaderHandle, PreparedShader>,
    input: RenderInput,
    /// Set when the latest build compiled but could not be committed.
    commit_error: Option<BindlessError>,
    clock: FrameClock,
    size: (u32, u32),
    presentation_format: wgpu::TextureFormat,
}

impl Engine {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        settings: EngineSettings,
    ) -> Result<Self> {
        if !settings.compiler.is_available() {
            bail!(
                "shader compiler '{}' is not available in this build",
                settings.compiler
            );
        }
        if settings.width == 0 || settings.height == 0 {
            bail!(
                "output size must be non-zero, got {}x{}",
                settings.width,
                settings.height
            );
        }
        let max_dimension = device.limits().max_texture_dimension_2d;
        if settings.width > max_dimension || settings.height > max_dimension {
            bail!(
                "GPU max texture dimension is {max_dimension}, requested output is {}x{}",
                settings.width,
                settings.height
            );
        }

        let mut registry = ResourceRegistry::new(device, settings.capacities)
            .context("failed to initialise bindless heaps")?;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("placeholder upload"),
        });
        let placeholders = Placeholders::create(&mut registry, &mut encoder)
            .context("failed to create placeholder textures")?;
        queue.submit(Some(encoder.finish()));
        registry.retire_uploads();

        let pass_compiler = PassCompiler::new(device, settings.compiler)
            .context("failed to build the full-screen vertex stage")?;
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame uniform bind group"),
            layout: pass_compiler.uniform_layout(),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: registry.constant_arena(),
                    offset: 0,
                    size: NonZeroU64::new(CONSTANT_SLOT_SIZE),
                }),
            }],
        });
        let shared = SharedBindings {
            sampler: create_channel_sampler(device),
            uniform_bind_group,
            placeholders,
        };

        let presentation_format = settings.presentation_format;
        let client = settings.client;
        let build = move |handle: ShaderHandle| {
            prepare_shader(
                &handle,
                client.as_ref(),
                &pass_compiler,
                presentation_format,
                max_dimension,
            )
        };
        let controller = CompileController::spawn(settings.queue_depth, build)
            .context("failed to spawn compile worker")?;

        info!(
            compiler = %settings.compiler,
            width = settings.width,
            height = settings.height,
            format = ?presentation_format,
            "engine ready"
        );

        Ok(Self {
            device: device.clone(),
            queue: queue.clone(),
            registry,
            shared,
            controller,
            input: RenderInput::Empty,
            commit_error: None,
            clock: FrameClock::new(),
            size: (settings.width, settings.height),
            presentation_format,
        })
    }

    /// Starts building `handle` in the background and returns its generation.
    /// The current graph keeps rendering until the new one is committed.
    pub fn load(&mut self, handle: ShaderHandle) -> u64 {
        info!(shader = %handle, "loading shader");
        self.commit_error = None;
        self.controller.request(handle)
    }

    /// Tears down the active graph and invalidates any build in flight.
    pub fn unload(&mut self) -> Result<(), BindlessError> {
        self.controller.reset();
        self.commit_error = None;
        let previous = std::mem::take(&mut self.input);
        if let Some(name) = previous.name() {
            info!(shader = name, "unloading shader");
        }
        previous.release(&mut self.registry).inspect_err(|err| {
            error!(%err, "failed to release render graph");
        })
    }

    pub fn status(&self) -> CompileStatus {
        self.controller.status()
    }

    pub fn generation(&self) -> u64 {
        self.controller.generation()
    }

    pub fn last_error(&self) -> Option<&BuildError> {
        self.controller.last_error()
    }

    /// Drains the compile worker and commits a finished build. Returns `true`
    /// when a new graph went live. Build failures leave the current graph in
    /// place; registry failures are returned.
    pub fn poll(&mut self) -> Result<bool, BindlessError> {
        let Some(result) = self.controller.poll() else {
            return Ok(false);
        };
        let generation = self.controller.generation();
        let prepared = match result {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(generation, error = %err, "shader build failed; keeping previous graph");
                return Ok(false);
            }
        };

        let name = prepared.name.clone();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("graph commit"),
            });
        let mut ctx = FrameContext {
            device: &self.device,
            queue: &self.queue,
            registry: &mut self.registry,
            shared: &self.shared,
        };
        let next =
            match RenderInput::initialize(prepared, generation, self.size, &mut ctx, &mut encoder) {
                Ok(next) => next,
                Err(err) => {
                    error!(%err, shader = %name, "failed to commit render graph");
                    self.commit_error = Some(err.clone());
                    return Err(err);
                }
            };
        self.queue.submit(Some(encoder.finish()));
        self.registry.retire_uploads();

        let previous = std::mem::replace(&mut self.input, next);
        previous
            .release(&mut self.registry)
            .inspect_err(|err| error!(%err, "failed to release previous render graph"))?;
        self.clock.reset();
        info!(
            shader = %name,
            generation,
            live_resources = self.registry.live_resources(),
            "render graph live"
        );
        Ok(true)
    }

    /// Records the active graph into `encoder`, drawing the presentation pass
    /// into `target`. Does nothing unless the latest build is compiled and
    /// committed. Submit before calling this again.
    pub fn render_frame(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Texture,
        delta: Duration,
    ) -> Result<bool, BindlessError> {
        let (generation, status) = (self.controller.generation(), self.controller.status());
        if status != CompileStatus::Compiled || self.input.generation() != Some(generation) {
            return Ok(false);
        }
        let sample = self.clock.tick(delta);
        let mut ctx = FrameContext {
            device: &self.device,
            queue: &self.queue,
            registry: &mut self.registry,
            shared: &self.shared,
        };
        self.input
            .render(&mut ctx, encoder, target, &sample)
            .inspect_err(|err| error!(%err, frame = sample.frame, "failed to record frame"))
    }

    /// Recreates every pass target at the new size; pipelines are kept. Sizes
    /// over the device's 2D texture limit are ignored with a warning.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), BindlessError> {
        if width == 0 || height == 0 || (width, height) == self.size {
            return Ok(());
        }
        let (max_dimension, _) = self.registry.max_texture_dimensions();
        if width > max_dimension || height > max_dimension {
            warn!(
                new_width = width,
                new_height = height,
                max_dimension,
                old_width = self.size.0,
                old_height = self.size.1,
                "requested resize exceeds GPU limits; keeping previous size"
            );
            return Ok(());
        }
        self.size = (width, height);
        let mut ctx = FrameContext {
            device: &self.device,
            queue: &self.queue,
            registry: &mut self.registry,
            shared: &self.shared,
        };
        self.input
            .resize_targets((width, height), &mut ctx)
            .inspect_err(|err| error!(%err, width, height, "failed to resize pass targets"))
    }

    pub fn overlay(&self) -> Overlay {
        if let Some(err) = &self.commit_error {
            return Overlay::Error {
                message: format!("failed to commit render graph: {err}"),
            };
        }
        self.input
            .render_overlay(self.controller.status(), self.controller.last_error())
    }

    /// Why the latest compiled build is not live, if its commit failed.
    pub fn commit_error(&self) -> Option<&BindlessError> {
        self.commit_error.as_ref()
    }

    /// The committed graph, if any. Survives failed rebuilds.
    pub fn active_graph(&self) -> Option<&RenderGraph<LivePass>> {
        self.input.graph()
    }

    pub fn active_shader(&self) -> Option<&str> {
        self.input.name()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn presentation_format(&self) -> wgpu::TextureFormat {
        self.presentation_format
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let input = std::mem::take(&mut self.input);
        if let Err(err) = input.release(&mut self.registry) {
            error!(%err, "failed to release render graph on shutdown");
        }
    }
}

/// Worker side of a load: fetch, plan, decode textures, compile.
fn prepare_shader(
    handle: &ShaderHandle,
    client: Option<&ShadertoyClient>,
    compiler: &PassCompiler,
    presentation_format: wgpu::TextureFormat,
    max_dimension: u32,
) -> Result<PreparedShader, BuildError> {
    let loaded = load_shader(handle, client)?;
    let plan = plan_graph(&loaded.description)?;

    let mut assets = HashMap::new();
    for src in plan.asset_sources() {
        let decoded = loaded
            .assets
            .read(&src)
            .map_err(|err| err.to_string())
            .and_then(|bytes| DecodedImage::decode(&bytes).map_err(|err| err.to_string()));
        match decoded {
            Ok(image) if image.width > max_dimension || image.height > max_dimension => warn!(
                src = %src,
                width = image.width,
                height = image.height,
                max_dimension,
                "channel texture exceeds GPU limits; binding placeholder"
            ),
            Ok(image) => {
                debug!(
                    src = %src,
                    width = image.width,
                    height = image.height,
                    "decoded channel texture"
                );
                assets.insert(src, image);
            }
            Err(err) => {
                warn!(src = %src, error = %err, "channel texture unavailable; binding placeholder")
            }
        }
    }

    let name = loaded
        .description
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| handle.to_string());
    let graph = compile_graph(plan, compiler, presentation_format)?;
    debug!(shader = %name, passes = graph.len(), "compiled render graph");
    Ok(PreparedShader {
        name,
        graph,
        assets,
    })
}
