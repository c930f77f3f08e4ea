//! ShaderToy GLSL to SPIR-V.
//!
//! Every pass goes through two stages:
//!
//! 1. [`synthesize_source`] wraps the user code with a generated preamble
//!    (uniform block, per-channel texture/sampler pairs, macro aliases) and an
//!    epilogue that forwards to `mainImage`. [`parse_to_ir`] turns that into a
//!    validated `naga::Module`, either through naga's GLSL frontend or through
//!    shaderc when the `shaderc` feature is enabled.
//! 2. [`lower_to_spirv`] writes the entry point as SPIR-V words which the
//!    pipeline builder hands to `wgpu`.
//!
//! The full-screen vertex stage takes the same route so both stages reach
//! `wgpu` with matching interface decorations; [`check_stage_interface`]
//! verifies that match without a device.
use std::collections::BTreeMap;
use std::fmt;

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::ShaderStage;

use crate::channels::{ChannelKind, CHANNEL_COUNT};
use crate::error::BuildError;

/// Shader compilation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderCompiler {
    /// naga's built-in GLSL frontend.
    Naga,
    /// shaderc to SPIR-V, then naga's SPIR-V frontend.
    Shaderc,
}

impl ShaderCompiler {
    pub fn is_available(self) -> bool {
        match self {
            ShaderCompiler::Naga => true,
            ShaderCompiler::Shaderc => cfg!(feature = "shaderc"),
        }
    }
}

impl Default for ShaderCompiler {
    fn default() -> Self {
        ShaderCompiler::Naga
    }
}

impl fmt::Display for ShaderCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderCompiler::Naga => f.write_str("naga"),
            ShaderCompiler::Shaderc => f.write_str("shaderc"),
        }
    }
}

/// Per-pass knobs for [`synthesize_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceOptions {
    pub channel_kinds: [ChannelKind; CHANNEL_COUNT],
    /// Presentation targets are stored top-down; offscreen buffers keep
    /// ShaderToy's bottom-up rows so sampling them needs no flip.
    pub flip_y: bool,
}

/// A validated single-stage module ready for lowering.
pub struct ShaderIr {
    pub module: naga::Module,
    pub info: ModuleInfo,
    pub stage: ShaderStage,
}

const UNIFORM_NAMES: [&str; 13] = [
    "iResolution",
    "iTimeDelta",
    "iTime",
    "iFrameRate",
    "iFrame",
    "iMouse",
    "iDate",
    "iSampleRate",
    "iChannelTime",
    "iChannelResolution",
    "iChannel",
    "iAppViewport",
    "iKeyboard",
];

/// Produces a self-contained Vulkan GLSL fragment shader for one pass.
pub fn synthesize_source(common: &str, code: &str, options: &SourceOptions) -> String {
    let mut source = String::with_capacity(PREAMBLE.len() + common.len() + code.len() + 1024);
    source.push_str(PREAMBLE);
    for (index, kind) in options.channel_kinds.iter().enumerate() {
        let (texture_type, sampler_type) = kind.glsl_types();
        source.push_str(&format!(
            "layout(set = 1, binding = {texture}) uniform {texture_type} toyview_channel{index}_texture;\n\
             layout(set = 1, binding = {sampler}) uniform sampler toyview_channel{index}_sampler;\n\
             #define iChannel{index} {sampler_type}(toyview_channel{index}_texture, toyview_channel{index}_sampler)\n",
            texture = index * 2,
            sampler = index * 2 + 1,
        ));
    }
    if !common.trim().is_empty() {
        source.push_str("#line 1\n");
        push_sanitized(&mut source, common);
    }
    source.push_str("#line 1\n");
    push_sanitized(&mut source, code);
    source.push_str(if options.flip_y {
        EPILOGUE_FLIPPED
    } else {
        EPILOGUE
    });
    source
}

/// Drops `#version` directives and ShaderToy uniform redeclarations.
fn push_sanitized(target: &mut String, code: &str) {
    for line in code.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#version") {
            continue;
        }
        let redeclares_builtin = trimmed.starts_with("uniform ")
            && UNIFORM_NAMES.iter().any(|name| trimmed.contains(name));
        if redeclares_builtin {
            continue;
        }
        target.push_str(line);
        target.push('\n');
    }
}

/// Parses and validates synthesized fragment source.
pub fn parse_to_ir(
    pass: &str,
    source: &str,
    compiler: ShaderCompiler,
) -> Result<ShaderIr, BuildError> {
    let module = match compiler {
        ShaderCompiler::Naga => parse_with_naga(pass, source, ShaderStage::Fragment)?,
        ShaderCompiler::Shaderc => parse_with_shaderc(pass, source)?,
    };
    validate(pass, source, module, ShaderStage::Fragment)
}

/// The full-screen triangle every pass is drawn with.
pub fn vertex_ir() -> Result<ShaderIr, BuildError> {
    let module = parse_with_naga(VERTEX_LABEL, VERTEX_SHADER_GLSL, ShaderStage::Vertex)?;
    validate(VERTEX_LABEL, VERTEX_SHADER_GLSL, module, ShaderStage::Vertex)
}

fn validate(
    pass: &str,
    source: &str,
    module: naga::Module,
    stage: ShaderStage,
) -> Result<ShaderIr, BuildError> {
    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| BuildError::CompileFailed {
            pass: pass.to_string(),
            diagnostic: err.emit_to_string(source),
        })?;
    Ok(ShaderIr {
        module,
        info,
        stage,
    })
}

fn parse_with_naga(
    pass: &str,
    source: &str,
    stage: ShaderStage,
) -> Result<naga::Module, BuildError> {
    let mut frontend = naga::front::glsl::Frontend::default();
    frontend
        .parse(&naga::front::glsl::Options::from(stage), source)
        .map_err(|err| BuildError::CompileFailed {
            pass: pass.to_string(),
            diagnostic: err.to_string(),
        })
}

#[cfg(feature = "shaderc")]
fn parse_with_shaderc(pass: &str, source: &str) -> Result<naga::Module, BuildError> {
    let failed = |diagnostic: String| BuildError::CompileFailed {
        pass: pass.to_string(),
        diagnostic,
    };
    let compiler = shaderc::Compiler::new().map_err(|err| failed(err.to_string()))?;
    let mut options = shaderc::CompileOptions::new().map_err(|err| failed(err.to_string()))?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    let artifact = compiler
        .compile_into_spirv(
            source,
            shaderc::ShaderKind::Fragment,
            pass,
            "main",
            Some(&options),
        )
        .map_err(|err| failed(err.to_string()))?;
    naga::front::spv::parse_u8_slice(
        artifact.as_binary_u8(),
        &naga::front::spv::Options::default(),
    )
    .map_err(|err| failed(err.to_string()))
}

#[cfg(not(feature = "shaderc"))]
fn parse_with_shaderc(pass: &str, _source: &str) -> Result<naga::Module, BuildError> {
    Err(BuildError::CompileFailed {
        pass: pass.to_string(),
        diagnostic: "shaderc support is not enabled in this build".to_string(),
    })
}

/// Lowers validated IR to SPIR-V for its `main` entry point.
pub fn lower_to_spirv(pass: &str, ir: &ShaderIr) -> Result<Vec<u32>, BuildError> {
    let options = naga::back::spv::Options {
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: ir.stage,
        entry_point: "main".to_string(),
    };
    naga::back::spv::write_vec(&ir.module, &ir.info, &options, Some(&pipeline_options)).map_err(
        |err| BuildError::CrossCompileFailed {
            pass: pass.to_string(),
            diagnostic: err.to_string(),
        },
    )
}

/// Interpolation and sampling of one user-defined varying, defaults applied.
type Varying = (Option<naga::Interpolation>, Option<naga::Sampling>);

/// Fails when a fragment input has no vertex output at the same location
/// with the same interpolation and sampling. `wgpu` rejects such pipelines.
pub fn check_stage_interface(
    pass: &str,
    vertex: &ShaderIr,
    fragment: &ShaderIr,
) -> Result<(), BuildError> {
    let outputs = stage_varyings(vertex, true);
    for (location, input) in stage_varyings(fragment, false) {
        match outputs.get(&location) {
            Some(output) if *output == input => {}
            Some(output) => {
                return Err(BuildError::PipelineBuildFailed {
                    pass: pass.to_string(),
                    diagnostic: format!(
                        "fragment input at location {location} is {input:?}, vertex output is {output:?}"
                    ),
                })
            }
            None => {
                return Err(BuildError::PipelineBuildFailed {
                    pass: pass.to_string(),
                    diagnostic: format!(
                        "fragment input at location {location} is not written by the vertex stage"
                    ),
                })
            }
        }
    }
    Ok(())
}

/// Location-bound varyings of the stage's `main`: its result when `outputs`
/// is set, its arguments otherwise.
pub(crate) fn stage_varyings(ir: &ShaderIr, outputs: bool) -> BTreeMap<u32, Varying> {
    let mut varyings = BTreeMap::new();
    let Some(entry) = ir
        .module
        .entry_points
        .iter()
        .find(|entry| entry.stage == ir.stage && entry.name == "main")
    else {
        return varyings;
    };
    if outputs {
        if let Some(result) = &entry.function.result {
            collect_varyings(&ir.module, result.ty, result.binding.as_ref(), &mut varyings);
        }
    } else {
        for argument in &entry.function.arguments {
            collect_varyings(&ir.module, argument.ty, argument.binding.as_ref(), &mut varyings);
        }
    }
    varyings
}

fn collect_varyings(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
    varyings: &mut BTreeMap<u32, Varying>,
) {
    let inner = &module.types[ty].inner;
    match binding {
        Some(binding @ naga::Binding::Location { .. }) => {
            let mut binding = binding.clone();
            binding.apply_default_interpolation(inner);
            if let naga::Binding::Location {
                location,
                interpolation,
                sampling,
                ..
            } = binding
            {
                varyings.insert(location, (interpolation, sampling));
            }
        }
        Some(naga::Binding::BuiltIn(_)) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = inner {
                for member in members {
                    collect_varyings(module, member.ty, member.binding.as_ref(), varyings);
                }
            }
        }
    }
}

const VERTEX_LABEL: &str = "fullscreen vertex";

/// Full-screen triangle shared by every pass. Writes no varyings; passes
/// derive everything from `gl_FragCoord`.
pub(crate) const VERTEX_SHADER_GLSL: &str = r"#version 450

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// Must match `FrameUniforms` field for field.
const PREAMBLE: &str = r"#version 450
layout(location = 0) out vec4 toyview_out_color;

layout(std140, set = 0, binding = 0) uniform ToyviewFrame {
    vec4 _iAppViewport;
    vec3 _iResolution;
    float _iTime;
    float _iTimeDelta;
    float _iFrameRate;
    int _iFrame;
    float _toyview_pad0;
    float _iChannelTime[4];
    vec3 _iChannelResolution[4];
    vec4 _iMouse;
    vec4 _iDate;
    float _iSampleRate;
} ubo;

#define iAppViewport ubo._iAppViewport
#define iResolution ubo._iResolution
#define iTime ubo._iTime
#define iTimeDelta ubo._iTimeDelta
#define iFrameRate ubo._iFrameRate
#define iFrame ubo._iFrame
#define iChannelTime ubo._iChannelTime
#define iChannelResolution ubo._iChannelResolution
#define iMouse ubo._iMouse
#define iDate ubo._iDate
#define iSampleRate ubo._iSampleRate

";

const EPILOGUE: &str = r"
void main() {
    vec4 color = vec4(0.0);
    mainImage(color, gl_FragCoord.xy);
    toyview_out_color = color;
}
";

const EPILOGUE_FLIPPED: &str = r"
void main() {
    vec2 fragCoord = vec2(gl_FragCoord.x, iResolution.y - gl_FragCoord.y);
    vec4 color = vec4(0.0);
    mainImage(color, fragCoord);
    toyview_out_color = color;
}
";
