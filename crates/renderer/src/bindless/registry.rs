use std::collections::VecDeque;

use tracing::{debug, trace};
use wgpu::util::DeviceExt;

use crate::error::BindlessError;

use super::allocator::{DescriptorHeap, DescriptorSlot, HeapLayout};
use super::{HeapCapacities, ViewKind, CONSTANT_SLOT_SIZE};

/// Marker for an unset resource or view index.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Stable reference to a registry resource and the descriptor slot of each of
/// its views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    resource_index: u32,
    views: [u32; ViewKind::COUNT],
}

impl ResourceHandle {
    pub const INVALID: ResourceHandle = ResourceHandle {
        resource_index: INVALID_INDEX,
        views: [INVALID_INDEX; ViewKind::COUNT],
    };

    pub fn is_valid(&self) -> bool {
        self.resource_index != INVALID_INDEX
    }

    pub fn resource_index(&self) -> u32 {
        self.resource_index
    }

    /// Descriptor index of the given view, if the resource has one.
    pub fn view(&self, kind: ViewKind) -> Option<u32> {
        let index = self.views[kind.index()];
        (index != INVALID_INDEX).then_some(index)
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Destroyed when the handle is released.
    Owned,
    /// Lifetime managed elsewhere; releasing only frees the slots.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureShape {
    D2,
    Cube,
    D3,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Array layers for 2D and cube textures (6 for a cube), depth for 3D.
    pub depth_or_layers: u32,
    pub shape: TextureShape,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

impl TextureDesc {
    pub fn d2(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            depth_or_layers: 1,
            shape: TextureShape::D2,
            format,
            usage,
        }
    }

    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: self.depth_or_layers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
}

#[derive(Debug, Clone)]
pub enum ResourceDesc {
    Texture(TextureDesc),
    Buffer(BufferDesc),
    /// A 256-byte block inside the shared constant arena; owns no GPU object.
    ConstantBlock { label: String },
}

impl ResourceDesc {
    fn label(&self) -> &str {
        match self {
            ResourceDesc::Texture(desc) => &desc.label,
            ResourceDesc::Buffer(desc) => &desc.label,
            ResourceDesc::ConstantBlock { label } => label,
        }
    }
}

/// What a descriptor slot points at.
#[derive(Debug, Clone)]
pub enum DescriptorEntry {
    Texture(wgpu::TextureView),
    Buffer {
        buffer: wgpu::Buffer,
        offset: u64,
        size: u64,
    },
    ArenaBlock {
        offset: u64,
    },
}

#[derive(Debug)]
enum Native {
    Texture {
        texture: wgpu::Texture,
        shape: TextureShape,
    },
    Buffer(wgpu::Buffer),
    ConstantBlock,
}

#[derive(Debug)]
pub struct Resource {
    native: Native,
    ownership: Ownership,
    label: String,
    handle: ResourceHandle,
}

impl Resource {
    pub fn texture(&self) -> Option<&wgpu::Texture> {
        match &self.native {
            Native::Texture { texture, .. } => Some(texture),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.native {
            Native::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn destroy(&self) {
        if self.ownership == Ownership::External {
            return;
        }
        match &self.native {
            Native::Texture { texture, .. } => texture.destroy(),
            Native::Buffer(buffer) => buffer.destroy(),
            Native::ConstantBlock => {}
        }
    }
}

/// Owner of every bindless resource, its descriptor slots, and the shared
/// constant arena. Lives on the render thread.
pub struct ResourceRegistry {
    device: wgpu::Device,
    heaps: [DescriptorHeap; ViewKind::COUNT],
    tables: [Vec<Option<DescriptorEntry>>; ViewKind::COUNT],
    resources: Vec<Option<Resource>>,
    free_resources: VecDeque<u32>,
    constant_arena: wgpu::Buffer,
    pending_uploads: Vec<wgpu::Buffer>,
    limits: wgpu::Limits,
}

impl ResourceRegistry {
    pub fn new(device: &wgpu::Device, capacities: HeapCapacities) -> Result<Self, BindlessError> {
        let constant_capacity = capacities.get(ViewKind::ConstantBuffer);
        let arena_size = u64::from(constant_capacity) * CONSTANT_SLOT_SIZE;
        let max_buffer = device.limits().max_buffer_size;
        if arena_size == 0 || arena_size > max_buffer {
            return Err(BindlessError::InvalidArgument(format!(
                "constant-buffer capacity {constant_capacity} needs {arena_size} bytes (limit {max_buffer})"
            )));
        }
        let constant_arena = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("bindless constant arena"),
            size: arena_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let heaps = ViewKind::ALL.map(|kind| {
            let layout = match kind {
                ViewKind::ConstantBuffer => HeapLayout {
                    cpu_base: 0,
                    gpu_base: 0,
                    stride: CONSTANT_SLOT_SIZE,
                },
                _ => HeapLayout::INDEXED,
            };
            DescriptorHeap::new(kind, capacities.get(kind), layout)
        });
        let tables = ViewKind::ALL.map(|kind| vec![None; capacities.get(kind) as usize]);

        debug!(
            sampled_image = capacities.sampled_image,
            render_target = capacities.render_target,
            constant_buffer = capacities.constant_buffer,
            raw_buffer = capacities.raw_buffer,
            "initialised bindless heaps"
        );

        Ok(Self {
            device: device.clone(),
            heaps,
            tables,
            resources: Vec::new(),
            free_resources: VecDeque::new(),
            constant_arena,
            pending_uploads: Vec::new(),
            limits: device.limits(),
        })
    }

    /// Creates an owned resource with one descriptor slot per requested view.
    pub fn create(
        &mut self,
        desc: &ResourceDesc,
        views: &[ViewKind],
    ) -> Result<ResourceHandle, BindlessError> {
        let native = match desc {
            ResourceDesc::Texture(texture) => {
                validate_texture_desc(texture, &self.limits)?;
                let dimension = match texture.shape {
                    TextureShape::D3 => wgpu::TextureDimension::D3,
                    TextureShape::D2 | TextureShape::Cube => wgpu::TextureDimension::D2,
                };
                Native::Texture {
                    texture: self.device.create_texture(&wgpu::TextureDescriptor {
                        label: Some(texture.label.as_str()),
                        size: texture.extent(),
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension,
                        format: texture.format,
                        usage: texture.usage,
                        view_formats: &[],
                    }),
                    shape: texture.shape,
                }
            }
            ResourceDesc::Buffer(buffer) => {
                if buffer.size == 0 || buffer.size > self.limits.max_buffer_size {
                    return Err(BindlessError::InvalidArgument(format!(
                        "buffer '{}' size {} is outside 1..={}",
                        buffer.label, buffer.size, self.limits.max_buffer_size
                    )));
                }
                Native::Buffer(self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(buffer.label.as_str()),
                    size: buffer.size,
                    usage: buffer.usage,
                    mapped_at_creation: false,
                }))
            }
            ResourceDesc::ConstantBlock { .. } => Native::ConstantBlock,
        };
        self.insert(native, Ownership::Owned, desc.label(), views)
    }

    /// Like [`create`](Self::create) but also records an upload of `bytes`
    /// on `encoder`. The staging buffer stays alive until
    /// [`retire_uploads`](Self::retire_uploads) runs after submission.
    ///
    /// Texture data is tightly packed rows, layer after layer.
    pub fn create_with_data(
        &mut self,
        desc: &ResourceDesc,
        views: &[ViewKind],
        bytes: &[u8],
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<ResourceHandle, BindlessError> {
        let staging_data = match desc {
            ResourceDesc::Texture(texture) => {
                validate_texture_desc(texture, &self.limits)?;
                pad_texture_rows(texture, bytes)?
            }
            ResourceDesc::Buffer(buffer) => {
                let padded = align_to(bytes.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT);
                if bytes.is_empty() || padded > buffer.size {
                    return Err(BindlessError::InvalidArgument(format!(
                        "buffer '{}' of {} bytes cannot hold {} bytes of data",
                        buffer.label,
                        buffer.size,
                        bytes.len()
                    )));
                }
                let mut data = bytes.to_vec();
                data.resize(padded as usize, 0);
                data
            }
            ResourceDesc::ConstantBlock { label } => {
                return Err(BindlessError::InvalidArgument(format!(
                    "constant block '{label}' is written per frame, not uploaded"
                )));
            }
        };

        let desc = with_copy_dst(desc);
        let handle = self.create(&desc, views)?;
        let staging = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("bindless upload staging"),
                contents: &staging_data,
                usage: wgpu::BufferUsages::COPY_SRC,
            });

        let len = staging_data.len() as u64;
        if let Err(err) = self.record_upload(&desc, handle, &staging, len, encoder) {
            self.release(handle)?;
            staging.destroy();
            return Err(err);
        }

        trace!(label = desc.label(), bytes = staging_data.len(), "recorded resource upload");
        self.pending_uploads.push(staging);
        Ok(handle)
    }

    fn record_upload(
        &self,
        desc: &ResourceDesc,
        handle: ResourceHandle,
        staging: &wgpu::Buffer,
        len: u64,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<(), BindlessError> {
        match (desc, &self.resolve(handle)?.native) {
            (ResourceDesc::Texture(texture_desc), Native::Texture { texture, .. }) => {
                let bytes_per_row = padded_bytes_per_row(texture_desc)?;
                encoder.copy_buffer_to_texture(
                    wgpu::TexelCopyBufferInfo {
                        buffer: staging,
                        layout: wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(bytes_per_row),
                            rows_per_image: Some(texture_desc.height),
                        },
                    },
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    texture_desc.extent(),
                );
            }
            (ResourceDesc::Buffer(_), Native::Buffer(buffer)) => {
                encoder.copy_buffer_to_buffer(staging, 0, buffer, 0, len);
            }
            _ => return Err(BindlessError::InvalidHandle),
        }
        Ok(())
    }

    /// Registers a texture whose lifetime is managed by the caller.
    pub fn import_texture(
        &mut self,
        texture: &wgpu::Texture,
        label: &str,
        views: &[ViewKind],
    ) -> Result<ResourceHandle, BindlessError> {
        let shape = match texture.dimension() {
            wgpu::TextureDimension::D3 => TextureShape::D3,
            _ => TextureShape::D2,
        };
        self.insert(
            Native::Texture {
                texture: texture.clone(),
                shape,
            },
            Ownership::External,
            label,
            views,
        )
    }

    /// Frees every slot of `handle` and destroys the resource if it is owned.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<(), BindlessError> {
        self.resolve(handle)?;
        let resource = self.resources[handle.resource_index as usize]
            .take()
            .ok_or(BindlessError::InvalidHandle)?;
        for kind in ViewKind::ALL {
            if let Some(index) = handle.view(kind) {
                self.tables[kind.index()][index as usize] = None;
                self.heaps[kind.index()].free(DescriptorSlot { index, kind })?;
            }
        }
        resource.destroy();
        self.free_resources.push_back(handle.resource_index);
        trace!(label = %resource.label, index = handle.resource_index, "released resource");
        Ok(())
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<&Resource, BindlessError> {
        self.resolve(handle)
    }

    pub fn texture_view(
        &self,
        handle: ResourceHandle,
        kind: ViewKind,
    ) -> Result<&wgpu::TextureView, BindlessError> {
        let slot = self.slot(handle, kind)?;
        match self.descriptor(slot) {
            Some(DescriptorEntry::Texture(view)) => Ok(view),
            _ => Err(BindlessError::InvalidArgument(format!(
                "{kind} view of '{}' is not a texture view",
                self.resolve(handle)?.label
            ))),
        }
    }

    pub fn slot(
        &self,
        handle: ResourceHandle,
        kind: ViewKind,
    ) -> Result<DescriptorSlot, BindlessError> {
        let resource = self.resolve(handle)?;
        handle
            .view(kind)
            .map(|index| DescriptorSlot { index, kind })
            .ok_or_else(|| {
                BindlessError::InvalidArgument(format!(
                    "resource '{}' has no {kind} view",
                    resource.label
                ))
            })
    }

    pub fn descriptor(&self, slot: DescriptorSlot) -> Option<&DescriptorEntry> {
        self.tables[slot.kind.index()]
            .get(slot.index as usize)
            .and_then(Option::as_ref)
    }

    /// Dynamic offset of the handle's constant block inside the arena.
    pub fn constant_offset(&self, handle: ResourceHandle) -> Result<u32, BindlessError> {
        let slot = self.slot(handle, ViewKind::ConstantBuffer)?;
        let address = self.heap(ViewKind::ConstantBuffer).gpu_address(slot.index)?;
        u32::try_from(address).map_err(|_| {
            BindlessError::InvalidArgument(format!("constant offset {address} exceeds u32"))
        })
    }

    /// The device's largest 2D/cube and 3D texture extents.
    pub fn max_texture_dimensions(&self) -> (u32, u32) {
        (
            self.limits.max_texture_dimension_2d,
            self.limits.max_texture_dimension_3d,
        )
    }

    pub fn constant_arena(&self) -> &wgpu::Buffer {
        &self.constant_arena
    }

    pub fn heap(&self, kind: ViewKind) -> &DescriptorHeap {
        &self.heaps[kind.index()]
    }

    pub fn live_resources(&self) -> usize {
        self.resources.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending_uploads.len()
    }

    /// Drops staging buffers once the uploads that used them were submitted.
    pub fn retire_uploads(&mut self) -> usize {
        let retired = self.pending_uploads.len();
        for staging in self.pending_uploads.drain(..) {
            staging.destroy();
        }
        retired
    }

    fn resolve(&self, handle: ResourceHandle) -> Result<&Resource, BindlessError> {
        if !handle.is_valid() {
            return Err(BindlessError::InvalidHandle);
        }
        match self.resources.get(handle.resource_index as usize) {
            Some(Some(resource)) if resource.handle == handle => Ok(resource),
            _ => Err(BindlessError::InvalidHandle),
        }
    }

    fn insert(
        &mut self,
        native: Native,
        ownership: Ownership,
        label: &str,
        views: &[ViewKind],
    ) -> Result<ResourceHandle, BindlessError> {
        let mut handle = ResourceHandle::INVALID;
        let mut allocated = Vec::with_capacity(views.len());
        for &kind in views {
            if handle.view(kind).is_some() {
                continue;
            }
            let result = self
                .describe(&native, label, kind)
                .and_then(|entry| Ok((self.heaps[kind.index()].allocate()?, entry)));
            match result {
                Ok((slot, entry)) => {
                    let address = self.heaps[kind.index()].gpu_address(slot.index)?;
                    let entry = match entry {
                        DescriptorEntry::ArenaBlock { .. } => {
                            DescriptorEntry::ArenaBlock { offset: address }
                        }
                        other => other,
                    };
                    self.tables[kind.index()][slot.index as usize] = Some(entry);
                    handle.views[kind.index()] = slot.index;
                    allocated.push(slot);
                }
                Err(err) => {
                    for slot in allocated {
                        self.tables[slot.kind.index()][slot.index as usize] = None;
                        self.heaps[slot.kind.index()].free(slot)?;
                    }
                    let orphan = Resource {
                        native,
                        ownership,
                        label: label.to_string(),
                        handle,
                    };
                    orphan.destroy();
                    debug!(label, %err, "rolled back resource creation");
                    return Err(err);
                }
            }
        }

        let resource_index = match self.free_resources.pop_front() {
            Some(index) => index,
            None => {
                let index = self.resources.len() as u32;
                if index == INVALID_INDEX {
                    return Err(BindlessError::InvalidArgument(
                        "resource table is full".into(),
                    ));
                }
                self.resources.push(None);
                index
            }
        };
        handle.resource_index = resource_index;
        self.resources[resource_index as usize] = Some(Resource {
            native,
            ownership,
            label: label.to_string(),
            handle,
        });
        trace!(label, index = resource_index, ?ownership, "registered resource");
        Ok(handle)
    }

    fn describe(
        &self,
        native: &Native,
        label: &str,
        kind: ViewKind,
    ) -> Result<DescriptorEntry, BindlessError> {
        let unsupported = || {
            let message = format!("resource '{label}' cannot expose a {kind} view");
            BindlessError::InvalidArgument(message)
        };
        match (native, kind) {
            (Native::Texture { texture, shape }, ViewKind::SampledImage) => {
                if !texture.usage().contains(wgpu::TextureUsages::TEXTURE_BINDING) {
                    return Err(unsupported());
                }
                let dimension = match shape {
                    TextureShape::D2 => wgpu::TextureViewDimension::D2,
                    TextureShape::Cube => wgpu::TextureViewDimension::Cube,
                    TextureShape::D3 => wgpu::TextureViewDimension::D3,
                };
                Ok(DescriptorEntry::Texture(texture.create_view(
                    &wgpu::TextureViewDescriptor {
                        label: Some(label),
                        dimension: Some(dimension),
                        ..Default::default()
                    },
                )))
            }
            (Native::Texture { texture, shape }, ViewKind::RenderTarget) => {
                if *shape != TextureShape::D2
                    || !texture
                        .usage()
                        .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
                {
                    return Err(unsupported());
                }
                Ok(DescriptorEntry::Texture(texture.create_view(
                    &wgpu::TextureViewDescriptor {
                        label: Some(label),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_array_layer: 0,
                        array_layer_count: Some(1),
                        ..Default::default()
                    },
                )))
            }
            (Native::ConstantBlock, ViewKind::ConstantBuffer) => {
                Ok(DescriptorEntry::ArenaBlock { offset: 0 })
            }
            (Native::Buffer(buffer), ViewKind::ConstantBuffer)
                if buffer.usage().contains(wgpu::BufferUsages::UNIFORM) =>
            {
                Ok(DescriptorEntry::Buffer {
                    buffer: buffer.clone(),
                    offset: 0,
                    size: buffer.size(),
                })
            }
            (Native::Buffer(buffer), ViewKind::RawBuffer)
                if buffer.usage().contains(wgpu::BufferUsages::STORAGE) =>
            {
                Ok(DescriptorEntry::Buffer {
                    buffer: buffer.clone(),
                    offset: 0,
                    size: buffer.size(),
                })
            }
            _ => Err(unsupported()),
        }
    }
}

fn validate_texture_desc(desc: &TextureDesc, limits: &wgpu::Limits) -> Result<(), BindlessError> {
    if desc.width == 0 || desc.height == 0 || desc.depth_or_layers == 0 {
        return Err(BindlessError::InvalidArgument(format!(
            "texture '{}' has an empty extent {}x{}x{}",
            desc.label, desc.width, desc.height, desc.depth_or_layers
        )));
    }
    let cube_faces_invalid = desc.depth_or_layers != 6 || desc.width != desc.height;
    if desc.shape == TextureShape::Cube && cube_faces_invalid {
        return Err(BindlessError::InvalidArgument(format!(
            "cube texture '{}' needs six square faces",
            desc.label
        )));
    }
    let (max_extent, max_depth) = match desc.shape {
        TextureShape::D2 | TextureShape::Cube => (
            limits.max_texture_dimension_2d,
            limits.max_texture_array_layers,
        ),
        TextureShape::D3 => (
            limits.max_texture_dimension_3d,
            limits.max_texture_dimension_3d,
        ),
    };
    if desc.width > max_extent || desc.height > max_extent || desc.depth_or_layers > max_depth {
        return Err(BindlessError::InvalidArgument(format!(
            "texture '{}' extent {}x{}x{} exceeds device limits {max_extent}/{max_depth}",
            desc.label, desc.width, desc.height, desc.depth_or_layers
        )));
    }
    Ok(())
}

fn with_copy_dst(desc: &ResourceDesc) -> ResourceDesc {
    match desc {
        ResourceDesc::Texture(texture) => ResourceDesc::Texture(TextureDesc {
            usage: texture.usage | wgpu::TextureUsages::COPY_DST,
            ..texture.clone()
        }),
        ResourceDesc::Buffer(buffer) => ResourceDesc::Buffer(BufferDesc {
            usage: buffer.usage | wgpu::BufferUsages::COPY_DST,
            ..buffer.clone()
        }),
        other => other.clone(),
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn texel_size(desc: &TextureDesc) -> Result<u32, BindlessError> {
    desc.format.block_copy_size(None).ok_or_else(|| {
        BindlessError::InvalidArgument(format!(
            "texture '{}' format {:?} cannot be uploaded directly",
            desc.label, desc.format
        ))
    })
}

fn padded_bytes_per_row(desc: &TextureDesc) -> Result<u32, BindlessError> {
    let unpadded = desc.width * texel_size(desc)?;
    Ok(align_to(
        u64::from(unpadded),
        u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
    ) as u32)
}

/// Re-lays tightly packed texel rows at the copy row pitch.
fn pad_texture_rows(desc: &TextureDesc, bytes: &[u8]) -> Result<Vec<u8>, BindlessError> {
    let row = (desc.width * texel_size(desc)?) as usize;
    let rows = (desc.height * desc.depth_or_layers) as usize;
    if bytes.len() != row * rows {
        return Err(BindlessError::InvalidArgument(format!(
            "texture '{}' expects {} bytes of data, got {}",
            desc.label,
            row * rows,
            bytes.len()
        )));
    }
    let padded_row = padded_bytes_per_row(desc)? as usize;
    if padded_row == row {
        return Ok(bytes.to_vec());
    }
    let mut padded = vec![0u8; padded_row * rows];
    for (source, target) in bytes.chunks_exact(row).zip(padded.chunks_exact_mut(padded_row)) {
        target[..row].copy_from_slice(source);
    }
    Ok(padded)
}
