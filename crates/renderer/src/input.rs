//! What the engine renders each frame.
//!
//! [`RenderInput::ShaderToy`] owns a committed render graph together with
//! every registry resource it needs: one constant block per pass, two
//! intermediate targets per offscreen pass (ping-ponged by frame parity), and
//! the uploaded channel textures. It is built in one go from a worker-built
//! [`PreparedShader`] and released in one go.

use std::collections::HashMap;

use image::imageops::flip_vertical_in_place;
use tracing::{debug, error, trace};

use crate::bindless::{ResourceDesc, ResourceHandle, ResourceRegistry, TextureDesc, ViewKind};
use crate::channels::{ChannelKind, Placeholders, CHANNEL_COUNT};
use crate::controller::CompileStatus;
use crate::error::{BindlessError, BuildError};
use crate::graph::{ChannelSource, CompiledNode, RenderGraph};
use crate::pipeline::{CompiledPass, PassTarget, INTERMEDIATE_FORMAT};
use crate::uniforms::{FrameSample, FrameUniforms};

/// RGBA8 texels, bottom row first like every ShaderToy texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl DecodedImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let mut image = image::load_from_memory(bytes)?.to_rgba8();
        flip_vertical_in_place(&mut image);
        Ok(Self {
            width: image.width(),
            height: image.height(),
            rgba: image.into_raw(),
        })
    }
}

/// A compiled graph plus decoded assets, ready to be committed on the render
/// thread.
pub struct PreparedShader {
    pub name: String,
    pub graph: RenderGraph<CompiledNode>,
    pub assets: HashMap<String, DecodedImage>,
}

/// State shared by every committed graph.
pub struct SharedBindings {
    pub sampler: wgpu::Sampler,
    pub uniform_bind_group: wgpu::BindGroup,
    pub(crate) placeholders: Placeholders,
}

/// Borrowed render-thread state an input needs to allocate or record.
pub struct FrameContext<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub registry: &'a mut ResourceRegistry,
    pub shared: &'a SharedBindings,
}

/// What the UI collaborator should draw on top of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    None,
    Progress { previous: Option<String> },
    Error { message: String },
}

/// One live pass of a committed graph.
pub struct LivePass {
    compiled: CompiledPass,
    channels: [ChannelSource; CHANNEL_COUNT],
    presents: bool,
    constants: ResourceHandle,
    /// Ping-pong outputs; `None` for the pass drawing into the presentation target.
    targets: Option<[ResourceHandle; 2]>,
    bind_groups: Vec<wgpu::BindGroup>,
    channel_resolution: [[f32; 3]; CHANNEL_COUNT],
}

impl LivePass {
    pub fn label(&self) -> &str {
        &self.compiled.label
    }

    pub fn presents(&self) -> bool {
        self.presents
    }

    pub fn channels(&self) -> &[ChannelSource; CHANNEL_COUNT] {
        &self.channels
    }

    pub fn constants(&self) -> ResourceHandle {
        self.constants
    }

    pub fn targets(&self) -> Option<[ResourceHandle; 2]> {
        self.targets
    }
}

#[derive(Default)]
pub enum RenderInput {
    #[default]
    Empty,
    ShaderToy(Box<ShaderToyInput>),
}

impl RenderInput {
    /// Commits `prepared`. On failure every resource allocated so far has
    /// already been released.
    pub fn initialize(
        prepared: PreparedShader,
        generation: u64,
        size: (u32, u32),
        ctx: &mut FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<Self, BindlessError> {
        ShaderToyInput::initialize(prepared, generation, size, ctx, encoder)
            .map(|input| RenderInput::ShaderToy(Box::new(input)))
    }

    pub fn resize_targets(
        &mut self,
        size: (u32, u32),
        ctx: &mut FrameContext<'_>,
    ) -> Result<(), BindlessError> {
        match self {
            RenderInput::Empty => Ok(()),
            RenderInput::ShaderToy(input) => input.resize_targets(size, ctx),
        }
    }

    /// Records one frame. Returns `false` when there was nothing to draw.
    pub fn render(
        &mut self,
        ctx: &mut FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Texture,
        sample: &FrameSample,
    ) -> Result<bool, BindlessError> {
        match self {
            RenderInput::Empty => Ok(false),
            RenderInput::ShaderToy(input) => {
                input.render(ctx, encoder, target, sample).map(|_| true)
            }
        }
    }

    pub fn render_overlay(
        &self,
        status: CompileStatus,
        last_error: Option<&BuildError>,
    ) -> Overlay {
        let previous = match self {
            RenderInput::Empty => None,
            RenderInput::ShaderToy(input) => Some(input.name.clone()),
        };
        match status {
            CompileStatus::Compiling => Overlay::Progress { previous },
            CompileStatus::Failed => Overlay::Error {
                message: last_error
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "shader build failed".to_string()),
            },
            CompileStatus::Idle | CompileStatus::Compiled => Overlay::None,
        }
    }

    pub fn release(self, registry: &mut ResourceRegistry) -> Result<(), BindlessError> {
        match self {
            RenderInput::Empty => Ok(()),
            RenderInput::ShaderToy(input) => input.release(registry),
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            RenderInput::Empty => None,
            RenderInput::ShaderToy(input) => Some(input.generation),
        }
    }

    pub fn graph(&self) -> Option<&RenderGraph<LivePass>> {
        match self {
            RenderInput::Empty => None,
            RenderInput::ShaderToy(input) => Some(&input.graph),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            RenderInput::Empty => None,
            RenderInput::ShaderToy(input) => Some(&input.name),
        }
    }
}

pub struct ShaderToyInput {
    name: String,
    generation: u64,
    graph: RenderGraph<LivePass>,
    assets: HashMap<String, (ResourceHandle, [f32; 3])>,
    size: (u32, u32),
    frames: u64,
}

impl ShaderToyInput {
    fn initialize(
        prepared: PreparedShader,
        generation: u64,
        size: (u32, u32),
        ctx: &mut FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<Self, BindlessError> {
        let mut owned = Vec::new();
        let result = Self::allocate(prepared, generation, size, ctx, encoder, &mut owned);
        if result.is_err() {
            for handle in owned {
                if let Err(err) = ctx.registry.release(handle) {
                    error!(%err, "failed to roll back render graph resource");
                }
            }
        }
        result
    }

    fn allocate(
        prepared: PreparedShader,
        generation: u64,
        size: (u32, u32),
        ctx: &mut FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
        owned: &mut Vec<ResourceHandle>,
    ) -> Result<Self, BindlessError> {
        let PreparedShader {
            name,
            graph,
            assets: images,
        } = prepared;

        let mut assets = HashMap::with_capacity(images.len());
        for (src, image) in images {
            let desc = ResourceDesc::Texture(TextureDesc::d2(
                format!("channel asset {src}"),
                image.width,
                image.height,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING,
            ));
            let handle = ctx.registry.create_with_data(
                &desc,
                &[ViewKind::SampledImage],
                &image.rgba,
                encoder,
            )?;
            owned.push(handle);
            assets.insert(src, (handle, [image.width as f32, image.height as f32, 1.0]));
        }

        let graph = graph.try_map(|_, meta, node| {
            let constants = ctx.registry.create(
                &ResourceDesc::ConstantBlock {
                    label: format!("{} constants", meta.name),
                },
                &[ViewKind::ConstantBuffer],
            )?;
            owned.push(constants);
            let targets = if node.presents {
                None
            } else {
                let pair = create_target_pair(ctx.registry, &meta.name, size)?;
                owned.extend(pair);
                Some(pair)
            };
            Ok::<_, BindlessError>(LivePass {
                compiled: node.pass,
                channels: node.channels,
                presents: node.presents,
                constants,
                targets,
                bind_groups: Vec::new(),
                channel_resolution: [[0.0; 3]; CHANNEL_COUNT],
            })
        })?;

        let mut input = Self {
            name,
            generation,
            graph,
            assets,
            size,
            frames: 0,
        };
        input.rebuild_bind_groups(ctx)?;
        debug!(
            shader = %input.name,
            generation,
            passes = input.graph.len(),
            live_resources = ctx.registry.live_resources(),
            "committed render graph"
        );
        Ok(input)
    }

    fn resize_targets(
        &mut self,
        size: (u32, u32),
        ctx: &mut FrameContext<'_>,
    ) -> Result<(), BindlessError> {
        for pass in self.graph.payloads_mut() {
            if let Some(old) = pass.targets.take() {
                for handle in old {
                    ctx.registry.release(handle)?;
                }
                pass.targets = Some(create_target_pair(ctx.registry, pass.label(), size)?);
            }
        }
        self.size = size;
        self.frames = 0;
        self.rebuild_bind_groups(ctx)?;
        debug!(width = size.0, height = size.1, "recreated pass targets");
        Ok(())
    }

    /// One bind group per frame parity. A pass reading its own output gets the
    /// buffer written last frame; every other producer has already run this
    /// frame and is read from the buffer it just wrote.
    fn rebuild_bind_groups(&mut self, ctx: &FrameContext<'_>) -> Result<(), BindlessError> {
        let mut all_groups = Vec::with_capacity(self.graph.len());
        let mut all_resolutions = Vec::with_capacity(self.graph.len());
        for (index, node) in self.graph.nodes().iter().enumerate() {
            let pass = &node.payload;
            let mut groups = Vec::with_capacity(2);
            let mut resolution = [[0.0; 3]; CHANNEL_COUNT];
            for parity in 0..2 {
                let mut views = Vec::with_capacity(CHANNEL_COUNT);
                for (channel, source) in pass.channels.iter().enumerate() {
                    let kind = pass.compiled.channel_kinds[channel];
                    let (handle, extent) = self.channel_handle(index, source, kind, parity, ctx)?;
                    resolution[channel] = extent;
                    views.push(ctx.registry.texture_view(handle, ViewKind::SampledImage)?);
                }
                let mut entries = Vec::with_capacity(CHANNEL_COUNT * 2);
                for (channel, view) in views.iter().enumerate() {
                    entries.push(wgpu::BindGroupEntry {
                        binding: (channel as u32) * 2,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                    entries.push(wgpu::BindGroupEntry {
                        binding: (channel as u32) * 2 + 1,
                        resource: wgpu::BindingResource::Sampler(&ctx.shared.sampler),
                    });
                }
                groups.push(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("channel bind group"),
                    layout: &pass.compiled.channel_layout,
                    entries: &entries,
                }));
            }
            all_groups.push(groups);
            all_resolutions.push(resolution);
        }

        for ((pass, groups), resolution) in self
            .graph
            .payloads_mut()
            .zip(all_groups)
            .zip(all_resolutions)
        {
            pass.bind_groups = groups;
            pass.channel_resolution = resolution;
        }
        Ok(())
    }

    fn channel_handle(
        &self,
        consumer: usize,
        source: &ChannelSource,
        kind: ChannelKind,
        parity: usize,
        ctx: &FrameContext<'_>,
    ) -> Result<(ResourceHandle, [f32; 3]), BindlessError> {
        let placeholder = (ctx.shared.placeholders.handle(kind), [1.0, 1.0, 1.0]);
        match source {
            ChannelSource::Pass(id) => {
                let producer = self.graph.index_of(*id);
                let targets = producer
                    .and_then(|producer| self.graph.node(producer))
                    .and_then(|node| node.payload.targets);
                match (producer, targets) {
                    (Some(producer), Some(targets)) => {
                        let slot = if producer == consumer { 1 - parity } else { parity };
                        let (width, height) = self.size;
                        Ok((targets[slot], [width as f32, height as f32, 1.0]))
                    }
                    _ => Ok(placeholder),
                }
            }
            ChannelSource::Asset { src } => Ok(self
                .assets
                .get(src)
                .copied()
                .unwrap_or(placeholder)),
            ChannelSource::Placeholder => Ok(placeholder),
            ChannelSource::Unbound => Ok((placeholder.0, [0.0; 3])),
        }
    }

    fn render(
        &mut self,
        ctx: &mut FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Texture,
        sample: &FrameSample,
    ) -> Result<(), BindlessError> {
        let presentation_format = self
            .graph
            .nodes()
            .iter()
            .find_map(|node| match node.payload.compiled.target {
                PassTarget::Presentation(format) => Some(format),
                PassTarget::Offscreen => None,
            })
            .unwrap_or(INTERMEDIATE_FORMAT);
        if target.format() != presentation_format {
            return Err(BindlessError::InvalidArgument(format!(
                "presentation target is {:?}, graph was compiled for {presentation_format:?}",
                target.format()
            )));
        }
        if !target.usage().contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
            return Err(BindlessError::InvalidArgument(
                "presentation target is not a render attachment".to_string(),
            ));
        }

        self.write_uniforms(ctx, target, sample)?;

        let presentation =
            ctx.registry
                .import_texture(target, "presentation target", &[ViewKind::RenderTarget])?;
        let recorded = self.record(ctx, encoder, presentation);
        let released = ctx.registry.release(presentation);
        recorded?;
        released?;

        self.frames = self.frames.wrapping_add(1);
        Ok(())
    }

    fn write_uniforms(
        &self,
        ctx: &FrameContext<'_>,
        target: &wgpu::Texture,
        sample: &FrameSample,
    ) -> Result<(), BindlessError> {
        for node in self.graph.nodes() {
            let pass = &node.payload;
            let (width, height) = if pass.presents {
                (target.width(), target.height())
            } else {
                self.size
            };
            let mut uniforms = FrameUniforms::new(width, height);
            uniforms.apply_sample(sample);
            for (channel, extent) in pass.channel_resolution.iter().enumerate() {
                uniforms.set_channel_resolution(channel, *extent);
            }
            let offset = ctx.registry.constant_offset(pass.constants)?;
            ctx.queue.write_buffer(
                ctx.registry.constant_arena(),
                u64::from(offset),
                uniforms.as_bytes(),
            );
        }
        Ok(())
    }

    fn record(
        &self,
        ctx: &FrameContext<'_>,
        encoder: &mut wgpu::CommandEncoder,
        presentation: ResourceHandle,
    ) -> Result<(), BindlessError> {
        let parity = (self.frames % 2) as usize;
        self.graph.execute(|_, node| {
            let pass = &node.payload;
            let output = match pass.targets {
                Some(targets) => targets[parity],
                None => presentation,
            };
            let view = ctx.registry.texture_view(output, ViewKind::RenderTarget)?;
            let offset = ctx.registry.constant_offset(pass.constants)?;
            let bind_group = pass.bind_groups.get(parity).ok_or_else(|| {
                let message = format!("pass '{}' has no channel bindings", node.name);
                BindlessError::InvalidArgument(message)
            })?;
            trace!(pass = %node.name, parity, offset, "recording pass");

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(node.name.as_str()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(&pass.compiled.pipeline);
            render_pass.set_bind_group(0, &ctx.shared.uniform_bind_group, &[offset]);
            render_pass.set_bind_group(1, bind_group, &[]);
            render_pass.draw(0..3, 0..1);
            Ok(())
        })
    }

    fn release(self, registry: &mut ResourceRegistry) -> Result<(), BindlessError> {
        let mut first_error = None;
        let mut release = |handle: ResourceHandle| {
            if let Err(err) = registry.release(handle) {
                error!(%err, "failed to release render graph resource");
                first_error.get_or_insert(err);
            }
        };
        for pass in self.graph.into_payloads() {
            release(pass.constants);
            for handle in pass.targets.into_iter().flatten() {
                release(handle);
            }
        }
        for (handle, _) in self.assets.into_values() {
            release(handle);
        }
        debug!(shader = %self.name, generation = self.generation, "released render graph");
        first_error.map_or(Ok(()), Err)
    }
}

fn create_target_pair(
    registry: &mut ResourceRegistry,
    label: &str,
    (width, height): (u32, u32),
) -> Result<[ResourceHandle; 2], BindlessError> {
    let desc = |parity: usize| {
        ResourceDesc::Texture(TextureDesc::d2(
            format!("{label} output {parity}"),
            width.max(1),
            height.max(1),
            INTERMEDIATE_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        ))
    };
    let views = [ViewKind::SampledImage, ViewKind::RenderTarget];
    let first = registry.create(&desc(0), &views)?;
    match registry.create(&desc(1), &views) {
        Ok(second) => Ok([first, second]),
        Err(err) => {
            registry.release(first)?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    #[test]
    fn decoded_images_are_stored_bottom_row_first() {
        let mut image = RgbaImage::new(1, 2);
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        image.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png).unwrap();

        let decoded = DecodedImage::decode(png.get_ref()).unwrap();
        assert_eq!((decoded.width, decoded.height), (1, 2));
        assert_eq!(&decoded.rgba[..4], &[0, 0, 255, 255]);
        assert_eq!(&decoded.rgba[4..], &[255, 0, 0, 255]);
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(DecodedImage::decode(b"not an image").is_err());
    }

    #[test]
    fn overlay_follows_status() {
        let input = RenderInput::Empty;
        assert_eq!(input.render_overlay(CompileStatus::Idle, None), Overlay::None);
        assert_eq!(
            input.render_overlay(CompileStatus::Compiling, None),
            Overlay::Progress { previous: None }
        );
        let err = BuildError::CompileFailed {
            pass: "Image".into(),
            diagnostic: "syntax error".into(),
        };
        match input.render_overlay(CompileStatus::Failed, Some(&err)) {
            Overlay::Error { message } => assert!(message.contains("syntax error")),
            other => panic!("unexpected overlay {other:?}"),
        }
    }
}
