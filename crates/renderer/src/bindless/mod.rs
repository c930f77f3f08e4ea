//! Bindless resource management.
//!
//! Every GPU-visible resource the engine creates is addressed through plain
//! integer slots in one of four fixed-capacity descriptor heaps. Slots are
//! recycled FIFO so an index freed by one resource is the last to be handed
//! out again.
//!
//! ```text
//!   ResourceRegistry::create(desc, views)
//!        │
//!        ├─▶ wgpu::Texture / wgpu::Buffer
//!        └─▶ DescriptorHeap[kind].allocate() ─▶ slot ─▶ descriptor table entry
//! ```

mod allocator;
mod registry;

use std::fmt;

pub use allocator::{DescriptorHeap, DescriptorSlot, DescriptorSlotAllocator, HeapLayout, SlotError};
pub use registry::{
    BufferDesc, DescriptorEntry, Ownership, Resource, ResourceDesc, ResourceHandle,
    ResourceRegistry, TextureDesc, TextureShape, INVALID_INDEX,
};

/// Size of one constant-buffer slot in the shared uniform arena.
pub const CONSTANT_SLOT_SIZE: u64 = 256;

/// The kinds of view a resource can expose, one heap per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewKind {
    SampledImage,
    RenderTarget,
    ConstantBuffer,
    RawBuffer,
}

impl ViewKind {
    pub const COUNT: usize = 4;
    pub const ALL: [ViewKind; Self::COUNT] = [
        ViewKind::SampledImage,
        ViewKind::RenderTarget,
        ViewKind::ConstantBuffer,
        ViewKind::RawBuffer,
    ];

    pub fn index(self) -> usize {
        match self {
            ViewKind::SampledImage => 0,
            ViewKind::RenderTarget => 1,
            ViewKind::ConstantBuffer => 2,
            ViewKind::RawBuffer => 3,
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::SampledImage => f.write_str("sampled-image"),
            ViewKind::RenderTarget => f.write_str("render-target"),
            ViewKind::ConstantBuffer => f.write_str("constant-buffer"),
            ViewKind::RawBuffer => f.write_str("raw-buffer"),
        }
    }
}

/// Fixed capacity of each descriptor heap, chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapCapacities {
    pub sampled_image: u32,
    pub render_target: u32,
    pub constant_buffer: u32,
    pub raw_buffer: u32,
}

impl HeapCapacities {
    pub fn get(&self, kind: ViewKind) -> u32 {
        match kind {
            ViewKind::SampledImage => self.sampled_image,
            ViewKind::RenderTarget => self.render_target,
            ViewKind::ConstantBuffer => self.constant_buffer,
            ViewKind::RawBuffer => self.raw_buffer,
        }
    }
}

impl Default for HeapCapacities {
    fn default() -> Self {
        Self {
            sampled_image: 1024,
            render_target: 256,
            constant_buffer: 1024,
            raw_buffer: 256,
        }
    }
}
