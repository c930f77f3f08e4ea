use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use renderer::{
    lower_plan, plan_graph, CompileStatus, Engine, EngineSettings, GpuContext, HeapCapacities,
    ShaderCompiler,
};
use shadertoy::{load_shader, ShaderHandle, ShadertoyClient, ShadertoyConfig};
use toyconfig::{CompilerBackend, EngineConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{CheckArgs, Cli, Command, RenderArgs};

const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub fn run(args: Cli) -> Result<()> {
    initialise_tracing();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(key) = &args.shadertoy_api_key {
        config.shadertoy.api_key = Some(key.clone());
    }
    let compiler = args
        .compiler
        .unwrap_or_else(|| compiler_from_config(config.compiler.backend));
    if !compiler.is_available() {
        bail!("shader compiler '{compiler}' is not available in this build");
    }

    match args.command {
        Command::Check(check) => run_check(&config, compiler, check),
        Command::Render(render) => run_render(config, compiler, render),
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn compiler_from_config(backend: Option<CompilerBackend>) -> ShaderCompiler {
    match backend {
        Some(CompilerBackend::Shaderc) => ShaderCompiler::Shaderc,
        Some(CompilerBackend::Naga) | None => ShaderCompiler::default(),
    }
}

fn heap_capacities(config: &EngineConfig) -> HeapCapacities {
    HeapCapacities {
        sampled_image: config.descriptors.sampled_image,
        render_target: config.descriptors.render_target,
        constant_buffer: config.descriptors.constant_buffer,
        raw_buffer: config.descriptors.raw_buffer,
    }
}

fn build_client(config: &EngineConfig, handle: &ShaderHandle) -> Result<Option<ShadertoyClient>> {
    let Some(key) = config.api_key() else {
        if !handle.is_local() {
            bail!("{handle} needs a Shadertoy API key (--shadertoy-api-key or SHADERTOY_API_KEY)");
        }
        return Ok(None);
    };
    let api_config = ShadertoyConfig::new(key).context("invalid Shadertoy API configuration")?;
    let client = ShadertoyClient::new(api_config).context("failed to construct Shadertoy client")?;
    Ok(Some(client))
}

fn run_check(config: &EngineConfig, compiler: ShaderCompiler, args: CheckArgs) -> Result<()> {
    let client = build_client(config, &args.shader)?;
    let loaded = load_shader(&args.shader, client.as_ref())
        .with_context(|| format!("failed to load {}", args.shader))?;
    let plan = plan_graph(&loaded.description)
        .with_context(|| format!("failed to plan {}", args.shader))?;
    let lowered = lower_plan(&plan, compiler)
        .with_context(|| format!("failed to compile {}", args.shader))?;

    let graph = &plan.graph;
    let presentation = plan.presentation_index();
    println!(
        "{}: {} pass(es), {} edge(s), compiler {compiler}",
        loaded.description.name().unwrap_or("shader"),
        graph.len(),
        graph.edges().count()
    );
    for (index, pass) in graph.order().iter().zip(&lowered) {
        let node = &graph.nodes()[*index];
        let marker = if presentation == Some(*index) {
            " [presents]"
        } else {
            ""
        };
        println!(
            "  {} (output {}) {} SPIR-V words{marker}",
            node.name,
            node.output_id,
            pass.words.len()
        );
    }
    for (producer, consumer) in graph.edges() {
        println!(
            "  {} -> {}",
            graph.nodes()[producer].name,
            graph.nodes()[consumer].name
        );
    }
    for src in plan.asset_sources() {
        println!("  texture {src}");
    }
    println!(
        "  note: stage interfaces checked; pipeline layouts and targets need a GPU, \
         run `toyview render` to validate them"
    );
    Ok(())
}

fn run_render(mut config: EngineConfig, compiler: ShaderCompiler, args: RenderArgs) -> Result<()> {
    if let Some((width, height)) = args.size {
        config.output.width = width;
        config.output.height = height;
    }
    let (width, height) = (config.output.width, config.output.height);
    let client = build_client(&config, &args.shader)?;

    let context = GpuContext::new_headless(args.power())?;
    let mut engine = Engine::new(
        &context.device,
        &context.queue,
        EngineSettings {
            capacities: heap_capacities(&config),
            compiler,
            queue_depth: config.worker.queue_depth,
            presentation_format: OUTPUT_FORMAT,
            width,
            height,
            client,
        },
    )?;

    engine.load(args.shader.clone());
    wait_for_graph(&mut engine, Duration::from_secs(args.timeout))?;

    let target = context.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("toyview output"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: OUTPUT_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });

    let interval = config.frame_interval();
    let started = Instant::now();
    for frame in 0..args.frames {
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("toyview frame"),
            });
        let delta = if frame == 0 { Duration::ZERO } else { interval };
        if !engine.render_frame(&mut encoder, &target, delta)? {
            bail!("{} is not ready to render ({})", args.shader, engine.status());
        }
        context.queue.submit(Some(encoder.finish()));
    }
    context.wait_idle()?;
    info!(
        frames = args.frames,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rendered frames"
    );

    if let Some(path) = &args.export {
        export_png(&context, &target, width, height, path)?;
        info!(path = %path.display(), "exported frame");
    }
    Ok(())
}

fn wait_for_graph(engine: &mut Engine, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if engine.poll()? {
            debug!(shader = engine.active_shader().unwrap_or_default(), "graph committed");
            return Ok(());
        }
        if engine.status() == CompileStatus::Failed {
            let message = engine
                .last_error()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown build failure".to_string());
            bail!("shader build failed: {message}");
        }
        if Instant::now() >= deadline {
            warn!(status = %engine.status(), "gave up waiting for shader build");
            bail!("shader did not compile within {}s", timeout.as_secs());
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn export_png(
    context: &GpuContext,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
    path: &Path,
) -> Result<()> {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = unpadded.div_ceil(align) * align;
    let buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("toyview readback"),
        size: u64::from(padded) * u64::from(height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("toyview readback"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    context.queue.submit(Some(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    context.wait_idle()?;
    rx.recv()
        .map_err(|_| anyhow!("readback callback never ran"))?
        .context("failed to map readback buffer")?;

    let mut pixels = Vec::with_capacity((unpadded * height) as usize);
    {
        let data = slice.get_mapped_range();
        for row in data.chunks_exact(padded as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
    }
    buffer.unmap();

    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("readback size does not match {width}x{height}"))?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_backend_maps_to_compiler() {
        assert_eq!(compiler_from_config(None), ShaderCompiler::Naga);
        assert_eq!(
            compiler_from_config(Some(CompilerBackend::Shaderc)),
            ShaderCompiler::Shaderc
        );
    }

    #[test]
    fn remote_handles_need_a_key() {
        let config = EngineConfig::default();
        let remote = ShaderHandle::ShadertoyId("abc123".into());
        assert!(build_client(&config, &remote).is_err());
        let local = ShaderHandle::LocalFile("shader.json".into());
        assert!(build_client(&config, &local).unwrap().is_none());
    }

    #[test]
    fn capacities_follow_config() {
        let mut config = EngineConfig::default();
        config.descriptors.render_target = 8;
        let capacities = heap_capacities(&config);
        assert_eq!(capacities.render_target, 8);
        assert_eq!(capacities.sampled_image, config.descriptors.sampled_image);
    }
}
