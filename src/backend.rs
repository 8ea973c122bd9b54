use std::sync::Arc;

use crate::error::Result;
use crate::tlas::INSTANCE_TEXELS;

/// Which runtime executes the emitted traversal program. Only `GlEs` and
/// `Cpu` carry required behavior; the rest are reserved names.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::Display, strum::EnumString,
)]
pub enum BackendKind {
    #[default]
    None,
    GlEs,
    Gl,
    Vulkan,
    WebGpu,
    Cpu,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindingKind {
    GlUniformBlock,
    GlTexture2d,
    GlTexture2dArray,
    GlStorageBuffer,
    CpuBuffer,
}

/// Backend-owned payload behind a binding: an opaque texture name for GPU
/// backends, or the uploaded bytes themselves for the CPU backend.
#[derive(Clone, Debug)]
pub enum BindingData {
    Texture(u32),
    CpuBuffer { bytes: Arc<[u8]>, elements: usize },
}

/// One entry of the scene-accessor binding table. `name` matches a uniform
/// declared by the emitted accessor text.
#[derive(Clone, Debug)]
pub struct Binding {
    pub name: &'static str,
    pub kind: BindingKind,
    pub data: BindingData,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextureFormat {
    Rgba32F,
    Rgba32I,
    R32I,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::Rgba32F | TextureFormat::Rgba32I => 16,
            TextureFormat::R32I => 4,
        }
    }
}

/// Shape of one texture-array upload request.
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub label: &'static str,
    pub format: TextureFormat,
    pub width: usize,
    pub height: usize,
    pub layers: usize,
}

impl TextureDesc {
    pub fn layer_bytes(&self) -> usize {
        self.width * self.height * self.format.bytes_per_texel()
    }
}

/// Upload capability the scene update threads its byte arrays through. The
/// core never talks to a graphics API itself; a GL-backed implementation
/// returns texture names, the CPU implementation retains the bytes.
///
/// Each entry of `layers` holds at most [`TextureDesc::layer_bytes`] bytes;
/// short layers are zero-padded by the backend.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    fn upload_texture_array(
        &mut self,
        desc: &TextureDesc,
        layers: &[&[u8]],
    ) -> Result<(BindingKind, BindingData)>;
}

/// Keeps uploads in memory so the CPU traversal path and the binding table
/// can serve them back.
#[derive(Debug, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn upload_texture_array(
        &mut self,
        desc: &TextureDesc,
        layers: &[&[u8]],
    ) -> Result<(BindingKind, BindingData)> {
        let layer_bytes = desc.layer_bytes();
        let mut bytes = vec![0u8; layer_bytes * desc.layers];
        for (i, layer) in layers.iter().enumerate().take(desc.layers) {
            bytes[i * layer_bytes..i * layer_bytes + layer.len()].copy_from_slice(layer);
        }
        Ok((
            BindingKind::CpuBuffer,
            BindingData::CpuBuffer {
                elements: bytes.len() / desc.format.bytes_per_texel(),
                bytes: bytes.into(),
            },
        ))
    }
}

/// Placeholder for backend kinds without a built-in implementation; uploads
/// succeed and bind texture name zero.
#[derive(Debug, Default)]
pub struct NullBackend {
    pub kind: BackendKind,
}

impl Backend for NullBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn upload_texture_array(
        &mut self,
        _desc: &TextureDesc,
        _layers: &[&[u8]],
    ) -> Result<(BindingKind, BindingData)> {
        Ok((BindingKind::GlTexture2dArray, BindingData::Texture(0)))
    }
}

/// 2-D tiling of a flat texel array. `size` is the power-of-two row length
/// accessor code divides by; `width`/`height` are the allocated extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tiling {
    pub size: usize,
    pub width: usize,
    pub height: usize,
}

pub fn next_pow2_min16(number: u32) -> u32 {
    number.next_power_of_two().max(16)
}

/// Tiles `num_pixels` texels into a near-square power-of-two-width
/// rectangle, at least 16 wide.
pub fn tile_pixels(num_pixels: usize) -> Tiling {
    let n = num_pixels.max(1);
    let size = next_pow2_min16(1 + (n as f32).sqrt() as u32) as usize;
    Tiling {
        size,
        width: n.min(size),
        height: (n - 1) / size + 1,
    }
}

pub const MAX_INSTANCE_TEXTURE_WIDTH: usize = 512;

/// Tiles one TLAS layer of packed instances (four texels each), width
/// capped at [`MAX_INSTANCE_TEXTURE_WIDTH`].
pub fn tile_instances(max_instances: usize) -> Tiling {
    let n = (max_instances * INSTANCE_TEXELS).max(1);
    let width = n.min(MAX_INSTANCE_TEXTURE_WIDTH);
    Tiling {
        size: width,
        width,
        height: (n - 1) / width + 1,
    }
}

/// Layout a caller must allocate for one of the 2-D query buffers.
#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
}
