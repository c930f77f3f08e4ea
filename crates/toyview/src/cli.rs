use std::path::PathBuf;

use clap::{Parser, Subcommand};
use renderer::{GpuPowerPreference, ShaderCompiler};
use shadertoy::ShaderHandle;

#[derive(Parser, Debug)]
#[command(
    name = "toyview",
    author,
    version,
    about = "Headless ShaderToy preview engine"
)]
pub struct Cli {
    /// Engine configuration file (TOML). Built-in defaults when omitted.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Shadertoy API key; can also be supplied via the `SHADERTOY_API_KEY` env var.
    #[arg(long, env = "SHADERTOY_API_KEY", global = true, hide_env_values = true)]
    pub shadertoy_api_key: Option<String>,

    /// Shader compiler backend: `naga` or `shaderc`. Overrides the config file.
    #[arg(
        long,
        value_name = "COMPILER",
        value_parser = parse_shader_compiler,
        global = true
    )]
    pub compiler: Option<ShaderCompiler>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and compile a shader without touching the GPU. Pipeline layouts and
    /// render targets are only validated by `render`.
    Check(CheckArgs),
    /// Render frames offscreen and optionally export the last one as PNG.
    Render(RenderArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Shader handle (`shadertoy://ID`, a shadertoy.com URL, or a JSON file).
    #[arg(value_name = "HANDLE", value_parser = parse_handle)]
    pub shader: ShaderHandle,
}

#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Shader handle (`shadertoy://ID`, a shadertoy.com URL, or a JSON file).
    #[arg(value_name = "HANDLE", value_parser = parse_handle)]
    pub shader: ShaderHandle,

    /// Number of frames to render.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub frames: u32,

    /// Override the output resolution (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Write the final frame to this PNG file.
    #[arg(long, value_name = "PATH")]
    pub export: Option<PathBuf>,

    /// Seconds to wait for the shader to compile.
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    pub timeout: u64,

    /// Prefer the high-performance adapter.
    #[arg(long)]
    pub high_power: bool,
}

impl RenderArgs {
    pub fn power(&self) -> GpuPowerPreference {
        if self.high_power {
            GpuPowerPreference::High
        } else {
            GpuPowerPreference::Low
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_handle(value: &str) -> Result<ShaderHandle, String> {
    ShaderHandle::from_input(value).map_err(|err| err.to_string())
}

pub fn parse_shader_compiler(value: &str) -> Result<ShaderCompiler, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("shader compiler must not be empty".to_string());
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "shaderc" => {
            if ShaderCompiler::Shaderc.is_available() {
                Ok(ShaderCompiler::Shaderc)
            } else {
                Err("shaderc support is not enabled in this build".to_string())
            }
        }
        "naga" | "naga-glsl" => Ok(ShaderCompiler::Naga),
        _ => Err("unknown shader compiler (expected naga or shaderc)".to_string()),
    }
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WxH format, e.g. 1920x1080".to_string())?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| "invalid width in size specification".to_string())?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| "invalid height in size specification".to_string())?;
    if width == 0 || height == 0 {
        return Err("output dimensions must be greater than zero".to_string());
    }
    Ok((width, height))
}
