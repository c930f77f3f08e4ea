use crate::bindless::{
    ResourceDesc, ResourceHandle, ResourceRegistry, TextureDesc, TextureShape, ViewKind,
};
use crate::error::BindlessError;

/// ShaderToy exposes four optional input channels (`iChannel0-3`).
pub const CHANNEL_COUNT: usize = 4;

/// Texture dimensionality a channel is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelKind {
    #[default]
    Texture2d,
    Cube,
    Volume,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] =
        [ChannelKind::Texture2d, ChannelKind::Cube, ChannelKind::Volume];

    /// Maps a ShaderToy `ctype`; `None` for input types the engine cannot feed.
    pub fn from_ctype(ctype: &str) -> Option<Self> {
        match ctype.trim().to_ascii_lowercase().as_str() {
            "buffer" | "texture" => Some(ChannelKind::Texture2d),
            "cubemap" => Some(ChannelKind::Cube),
            "volume" => Some(ChannelKind::Volume),
            _ => None,
        }
    }

    /// GLSL texture type and combined-sampler constructor.
    pub fn glsl_types(self) -> (&'static str, &'static str) {
        match self {
            ChannelKind::Texture2d => ("texture2D", "sampler2D"),
            ChannelKind::Cube => ("textureCube", "samplerCube"),
            ChannelKind::Volume => ("texture3D", "sampler3D"),
        }
    }

    pub fn view_dimension(self) -> wgpu::TextureViewDimension {
        match self {
            ChannelKind::Texture2d => wgpu::TextureViewDimension::D2,
            ChannelKind::Cube => wgpu::TextureViewDimension::Cube,
            ChannelKind::Volume => wgpu::TextureViewDimension::D3,
        }
    }

    fn index(self) -> usize {
        match self {
            ChannelKind::Texture2d => 0,
            ChannelKind::Cube => 1,
            ChannelKind::Volume => 2,
        }
    }
}

pub(crate) fn create_channel_sampler(device: &wgpu::Device) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("channel sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    })
}

/// One 1x1 stand-in texture per channel kind, bound wherever a channel has no
/// real source.
pub(crate) struct Placeholders {
    handles: [ResourceHandle; 3],
}

impl Placeholders {
    pub fn create(
        registry: &mut ResourceRegistry,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<Self, BindlessError> {
        let mut handles = [ResourceHandle::INVALID; 3];
        for kind in ChannelKind::ALL {
            let (shape, layers) = match kind {
                ChannelKind::Texture2d => (TextureShape::D2, 1),
                ChannelKind::Cube => (TextureShape::Cube, 6),
                ChannelKind::Volume => (TextureShape::D3, 1),
            };
            let desc = ResourceDesc::Texture(TextureDesc {
                label: format!("placeholder {kind:?}"),
                width: 1,
                height: 1,
                depth_or_layers: layers,
                shape,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
            });
            let texels: Vec<u8> = [0u8, 0, 0, 255].repeat(layers as usize);
            handles[kind.index()] =
                registry.create_with_data(&desc, &[ViewKind::SampledImage], &texels, encoder)?;
        }
        Ok(Self { handles })
    }

    pub fn handle(&self, kind: ChannelKind) -> ResourceHandle {
        self.handles[kind.index()]
    }

    pub fn release(self, registry: &mut ResourceRegistry) -> Result<(), BindlessError> {
        for handle in self.handles {
            registry.release(handle)?;
        }
        Ok(())
    }
}
