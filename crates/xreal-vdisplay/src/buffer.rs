//! Kernel buffer and GPU buffer-management interfaces.

use crate::host::{HostError, MappingId, TextureId};
use bitflags::bitflags;
use drm_fourcc::DrmFourcc;
use std::num::NonZeroU32;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Failed to allocate {width}x{height} buffer: {reason}")]
    Allocate {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("Failed to import buffer as framebuffer: {0}")]
    Import(String),
    #[error("Failed to map buffer: {0}")]
    Map(String),
    #[error("Failed to bind GPU texture: {0}")]
    TextureBind(String),
    #[error("Failed to wrap buffer in a pixmap")]
    Pixmap(#[from] HostError),
}

/// Imported framebuffer id. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub NonZeroU32);

impl FramebufferId {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// CPU-mappable buffer returned from CREATE_DUMB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// Bytes per scanline, may be larger than width * bpp / 8.
    pub pitch: u32,
    pub size: u64,
}

/// Memory mapping of a dumb buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub id: MappingId,
    pub len: u64,
}

bitflags! {
    /// GPU buffer object usage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoUsage: u32 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const WRITE = 1 << 3;
        const LINEAR = 1 << 4;
    }
}

/// GPU-resident buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBo {
    /// Kernel handle used for framebuffer import.
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: DrmFourcc,
}

/// Arguments to the framebuffer import (ADDFB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferRequest {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub depth: u32,
    pub bpp: u32,
}

/// Kernel mode-setting buffer operations.
pub trait BufferDevice {
    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, BufferError>;
    fn destroy_dumb(&mut self, buffer: &DumbBuffer);
    fn map_dumb(&mut self, buffer: &DumbBuffer) -> Result<Mapping, BufferError>;
    fn unmap(&mut self, mapping: Mapping);
    fn add_framebuffer(&mut self, request: &FramebufferRequest) -> Result<FramebufferId, BufferError>;
    fn remove_framebuffer(&mut self, framebuffer: FramebufferId);
}

/// Optional GPU buffer-management library.
pub trait GpuBufferManager {
    fn create_bo(
        &mut self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        usage: BoUsage,
    ) -> Result<GpuBo, BufferError>;
    fn destroy_bo(&mut self, bo: &GpuBo);
    /// Create a texture the host can render to, backed by `bo`.
    fn bind_texture(&mut self, bo: &GpuBo) -> Result<TextureId, BufferError>;
    fn release_texture(&mut self, texture: TextureId);
}

/// Stand-in for builds and drivers without a GPU buffer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoGpu {}

impl GpuBufferManager for NoGpu {
    fn create_bo(&mut self, _: u32, _: u32, _: DrmFourcc, _: BoUsage) -> Result<GpuBo, BufferError> {
        match *self {}
    }

    fn destroy_bo(&mut self, _: &GpuBo) {
        match *self {}
    }

    fn bind_texture(&mut self, _: &GpuBo) -> Result<TextureId, BufferError> {
        match *self {}
    }

    fn release_texture(&mut self, _: TextureId) {
        match *self {}
    }
}

/// GPU pixel format for a screen depth.
pub fn format_for_depth(depth: u32) -> DrmFourcc {
    match depth {
        15 => DrmFourcc::Argb1555,
        16 => DrmFourcc::Rgb565,
        30 => DrmFourcc::Argb2101010,
        _ => DrmFourcc::Argb8888,
    }
}

/// Bits per pixel of a dumb buffer for a screen depth.
pub fn bpp_for_depth(depth: u32) -> u32 {
    match depth {
        15 | 16 => 16,
        _ => 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_depths_pick_matching_formats() {
        assert_eq!(format_for_depth(15), DrmFourcc::Argb1555);
        assert_eq!(format_for_depth(16), DrmFourcc::Rgb565);
        assert_eq!(format_for_depth(30), DrmFourcc::Argb2101010);
        assert_eq!(format_for_depth(24), DrmFourcc::Argb8888);
        assert_eq!(format_for_depth(8), DrmFourcc::Argb8888);
        assert_eq!(bpp_for_depth(16), 16);
        assert_eq!(bpp_for_depth(24), 32);
        assert_eq!(bpp_for_depth(30), 32);
    }
}
