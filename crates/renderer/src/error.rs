use shadertoy::DescriptionError;
use thiserror::Error;

use crate::bindless::ViewKind;

/// Misuse or exhaustion of the bindless descriptor heaps.
///
/// These are programming or capacity errors on the render thread; the engine
/// escalates them instead of folding them into the compile status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindlessError {
    #[error("{kind} heap exhausted ({capacity} slots)")]
    ResourceExhausted { kind: ViewKind, capacity: u32 },
    #[error("handle does not reference a live resource")]
    InvalidHandle,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Failure while turning a shader description into an executable graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("pass '{pass}' channel {channel} uses unsupported input type '{ctype}'")]
    UnsupportedInput {
        pass: String,
        channel: u8,
        ctype: String,
    },
    #[error("failed to compile pass '{pass}':\n{diagnostic}")]
    CompileFailed { pass: String, diagnostic: String },
    #[error("failed to lower pass '{pass}' to SPIR-V: {diagnostic}")]
    CrossCompileFailed { pass: String, diagnostic: String },
    #[error("failed to build pipeline for pass '{pass}': {diagnostic}")]
    PipelineBuildFailed { pass: String, diagnostic: String },
    #[error("render graph has a cycle through outputs {outputs:?}")]
    GraphCycleDetected { outputs: Vec<i64> },
    #[error("invalid shader description: {0}")]
    InvalidArgument(String),
    #[error("failed to load shader: {0}")]
    NetworkOrParseFailure(String),
    #[error("compile worker panicked: {0}")]
    WorkerPanicked(String),
}

impl From<DescriptionError> for BuildError {
    fn from(err: DescriptionError) -> Self {
        BuildError::NetworkOrParseFailure(err.to_string())
    }
}
