//! Bindless render-graph engine for multi-pass ShaderToy shaders.
//!
//! The crate is split along the path a shader takes from description to
//! pixels:
//!
//! ```text
//!   ShaderDescription ──▶ graph::plan_graph ──▶ compile (GLSL → naga IR → SPIR-V)
//!          │                                       │
//!          │                         pipeline::PassCompiler (wgpu pipelines)
//!          ▼                                       ▼
//!   controller (worker thread, generation-tagged) ──▶ engine::Engine::poll
//!                                                          │ commit
//!                                                          ▼
//!   bindless::ResourceRegistry (descriptor heaps) ◀── input::RenderInput
//!                                                          │
//!                                       Engine::render_frame ──▶ CommandEncoder
//! ```
//!
//! Windowing, presentation and UI live outside the crate. Callers hand the
//! engine a `wgpu::Device`/`Queue`, a command encoder and a target texture
//! per frame, and read [`Engine::overlay`] to decide what to draw on top.

pub mod bindless;
pub mod channels;
pub mod compile;
pub mod context;
pub mod controller;
pub mod engine;
pub mod error;
pub mod graph;
pub mod input;
pub mod pipeline;
pub mod uniforms;

pub use bindless::{
    DescriptorHeap, DescriptorSlot, DescriptorSlotAllocator, HeapCapacities, ResourceDesc,
    ResourceHandle, ResourceRegistry, ViewKind,
};
pub use channels::ChannelKind;
pub use compile::ShaderCompiler;
pub use context::{GpuContext, GpuPowerPreference};
pub use controller::{CompileController, CompileStatus};
pub use engine::{Engine, EngineSettings};
pub use error::{BindlessError, BuildError};
pub use graph::{lower_plan, plan_graph, RenderGraph};
pub use input::Overlay;
pub use uniforms::FrameUniforms;
