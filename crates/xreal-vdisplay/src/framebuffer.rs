//! Off-screen framebuffers for virtual outputs.
//!
//! A framebuffer is a buffer (GPU object or dumb buffer), the framebuffer id
//! it was imported as, and a host pixmap wrapping it. Every failure releases
//! what was acquired before it, so no path leaves a live id behind.

use crate::buffer::{
    bpp_for_depth, format_for_depth, BoUsage, BufferDevice, BufferError, DumbBuffer,
    FramebufferId, FramebufferRequest, GpuBo, GpuBufferManager, Mapping,
};
use crate::host::{HostDisplay, PixmapBacking, PixmapHeader, PixmapId, TextureId};
use tracing::{debug, error, warn};

/// The collaborators a framebuffer is built from.
pub struct BufferContext<'a> {
    pub host: &'a mut dyn HostDisplay,
    pub device: &'a mut dyn BufferDevice,
    pub gpu: Option<&'a mut dyn GpuBufferManager>,
}

#[derive(Debug)]
pub enum Backing {
    Gpu { bo: GpuBo, texture: TextureId },
    Cpu { buffer: DumbBuffer, mapping: Mapping },
}

#[derive(Debug)]
pub struct OffscreenFramebuffer {
    backing: Backing,
    id: FramebufferId,
    pixmap: PixmapId,
    width: u32,
    height: u32,
    pitch: u32,
}

impl OffscreenFramebuffer {
    pub fn id(&self) -> FramebufferId {
        self.id
    }

    pub fn pixmap(&self) -> PixmapId {
        self.pixmap
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.backing, Backing::Gpu { .. })
    }
}

/// Outcome of a failed GPU attempt.
enum GpuFailure {
    /// Nothing is left allocated; try dumb buffers instead.
    Fallback(BufferError),
    /// Fatal for the whole allocation.
    Abort(BufferError),
}

#[derive(Debug, Clone)]
pub struct FramebufferAllocator {
    depth: u32,
    bpp: u32,
    gpu_enabled: bool,
}

impl FramebufferAllocator {
    pub fn new(depth: u32, gpu_enabled: bool) -> Self {
        Self {
            depth,
            bpp: bpp_for_depth(depth),
            gpu_enabled,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn allocate(
        &self,
        cx: &mut BufferContext<'_>,
        width: u32,
        height: u32,
    ) -> Result<OffscreenFramebuffer, BufferError> {
        #[cfg(feature = "gpu")]
        if self.gpu_enabled {
            if let Some(gpu) = cx.gpu.as_deref_mut() {
                match self.allocate_gpu(&mut *cx.host, &mut *cx.device, gpu, width, height) {
                    Ok(fb) => return Ok(fb),
                    Err(GpuFailure::Abort(e)) => return Err(e),
                    Err(GpuFailure::Fallback(e)) => {
                        debug!(width, height, error = %e, "GPU buffer path failed, using dumb buffer");
                    }
                }
            }
        }

        self.allocate_dumb(&mut *cx.host, &mut *cx.device, width, height)
    }

    #[cfg_attr(not(feature = "gpu"), allow(dead_code))]
    fn allocate_gpu(
        &self,
        host: &mut dyn HostDisplay,
        device: &mut dyn BufferDevice,
        gpu: &mut dyn GpuBufferManager,
        width: u32,
        height: u32,
    ) -> Result<OffscreenFramebuffer, GpuFailure> {
        let format = format_for_depth(self.depth);
        let bo = gpu
            .create_bo(width, height, format, BoUsage::RENDERING | BoUsage::SCANOUT)
            .map_err(GpuFailure::Fallback)?;

        let id = match device.add_framebuffer(&FramebufferRequest {
            handle: bo.handle,
            width,
            height,
            pitch: bo.pitch,
            depth: self.depth,
            bpp: self.bpp,
        }) {
            Ok(id) => id,
            Err(e) => {
                gpu.destroy_bo(&bo);
                return Err(GpuFailure::Abort(e));
            }
        };

        let texture = match gpu.bind_texture(&bo) {
            Ok(texture) => texture,
            Err(e) => {
                warn!(
                    width,
                    height,
                    error = %e,
                    "GPU texture binding failed, running virtual output in degraded CPU mode"
                );
                device.remove_framebuffer(id);
                gpu.destroy_bo(&bo);
                return Err(GpuFailure::Fallback(e));
            }
        };

        let header = PixmapHeader {
            width,
            height,
            depth: self.depth,
            bpp: self.bpp,
            pitch: bo.pitch,
            backing: PixmapBacking::Texture(texture),
        };
        match wrap_pixmap(host, self.depth, &header) {
            Ok(pixmap) => Ok(OffscreenFramebuffer {
                backing: Backing::Gpu { bo, texture },
                id,
                pixmap,
                width,
                height,
                pitch: bo.pitch,
            }),
            Err(e) => {
                gpu.release_texture(texture);
                device.remove_framebuffer(id);
                gpu.destroy_bo(&bo);
                Err(GpuFailure::Abort(e))
            }
        }
    }

    fn allocate_dumb(
        &self,
        host: &mut dyn HostDisplay,
        device: &mut dyn BufferDevice,
        width: u32,
        height: u32,
    ) -> Result<OffscreenFramebuffer, BufferError> {
        let buffer = device.create_dumb(width, height, self.bpp)?;

        let id = match device.add_framebuffer(&FramebufferRequest {
            handle: buffer.handle,
            width,
            height,
            pitch: buffer.pitch,
            depth: self.depth,
            bpp: self.bpp,
        }) {
            Ok(id) => id,
            Err(e) => {
                device.destroy_dumb(&buffer);
                return Err(e);
            }
        };

        let mapping = match device.map_dumb(&buffer) {
            Ok(mapping) => mapping,
            Err(e) => {
                device.remove_framebuffer(id);
                device.destroy_dumb(&buffer);
                return Err(e);
            }
        };

        let header = PixmapHeader {
            width,
            height,
            depth: self.depth,
            bpp: self.bpp,
            pitch: buffer.pitch,
            backing: PixmapBacking::Memory(mapping.id),
        };
        match wrap_pixmap(host, self.depth, &header) {
            Ok(pixmap) => Ok(OffscreenFramebuffer {
                backing: Backing::Cpu { buffer, mapping },
                id,
                pixmap,
                width,
                height,
                pitch: buffer.pitch,
            }),
            Err(e) => {
                device.unmap(mapping);
                device.remove_framebuffer(id);
                device.destroy_dumb(&buffer);
                Err(e)
            }
        }
    }

    /// Tear down a framebuffer: pixmap, texture, framebuffer id, mapping, buffer.
    pub fn release(&self, cx: &mut BufferContext<'_>, fb: OffscreenFramebuffer) {
        cx.host.destroy_pixmap(fb.pixmap);
        match fb.backing {
            Backing::Gpu { bo, texture } => {
                cx.device.remove_framebuffer(fb.id);
                match cx.gpu.as_deref_mut() {
                    Some(gpu) => {
                        gpu.release_texture(texture);
                        gpu.destroy_bo(&bo);
                    }
                    None => error!(
                        fb = fb.id.get(),
                        "GPU framebuffer released without a GPU buffer manager"
                    ),
                }
            }
            Backing::Cpu { buffer, mapping } => {
                cx.device.remove_framebuffer(fb.id);
                cx.device.unmap(mapping);
                cx.device.destroy_dumb(&buffer);
            }
        }
    }

    /// Replace the framebuffer in `slot` with one of the new size.
    ///
    /// The old buffer is fully released before the new one is allocated; on
    /// failure `slot` is left empty.
    pub fn reallocate(
        &self,
        cx: &mut BufferContext<'_>,
        slot: &mut Option<OffscreenFramebuffer>,
        width: u32,
        height: u32,
    ) -> Result<(), BufferError> {
        if let Some(old) = slot.take() {
            self.release(cx, old);
        }
        *slot = Some(self.allocate(cx, width, height)?);
        Ok(())
    }
}

/// Create a pixmap and point its header at the buffer.
fn wrap_pixmap(
    host: &mut dyn HostDisplay,
    depth: u32,
    header: &PixmapHeader,
) -> Result<PixmapId, BufferError> {
    let pixmap = host.create_pixmap(depth)?;
    if let Err(e) = host.modify_pixmap_header(pixmap, header) {
        host.destroy_pixmap(pixmap);
        return Err(e.into());
    }
    Ok(pixmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{BufferOp, HeadlessBuffers, HeadlessGpu, HeadlessHost, HostOp};

    struct Rig {
        host: HeadlessHost,
        device: HeadlessBuffers,
        gpu: HeadlessGpu,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                host: HeadlessHost::new(),
                device: HeadlessBuffers::new(),
                gpu: HeadlessGpu::new(),
            }
        }

        fn cx(&mut self, with_gpu: bool) -> BufferContext<'_> {
            BufferContext {
                host: &mut self.host,
                device: &mut self.device,
                gpu: if with_gpu {
                    Some(&mut self.gpu)
                } else {
                    None
                },
            }
        }

        fn assert_nothing_live(&self) {
            assert_eq!(self.device.live_framebuffers(), 0);
            assert_eq!(self.device.live_dumb_buffers(), 0);
            assert_eq!(self.device.live_mappings(), 0);
            assert_eq!(self.gpu.live_bos(), 0);
            assert_eq!(self.gpu.live_textures(), 0);
            assert_eq!(self.host.live_pixmaps(), 0);
        }
    }

    #[test]
    fn cpu_path_without_gpu() {
        let mut rig = Rig::new();
        let alloc = FramebufferAllocator::new(24, true);
        let fb = alloc.allocate(&mut rig.cx(false), 1920, 1080).unwrap();

        assert!(!fb.is_gpu());
        assert_eq!((fb.width(), fb.height()), (1920, 1080));
        assert!(fb.pitch() >= 1920 * 4);
        let header = rig.host.pixmap_header(fb.pixmap()).unwrap();
        assert!(matches!(header.backing, PixmapBacking::Memory(_)));
        assert_eq!(header.pitch, fb.pitch());
        assert_eq!(rig.device.live_mappings(), 1);

        alloc.release(&mut rig.cx(false), fb);
        rig.assert_nothing_live();
    }

    #[test]
    fn gpu_path_binds_texture() {
        let mut rig = Rig::new();
        let alloc = FramebufferAllocator::new(30, true);
        let fb = alloc.allocate(&mut rig.cx(true), 2560, 1440).unwrap();

        assert!(fb.is_gpu());
        match fb.backing() {
            Backing::Gpu { bo, .. } => assert_eq!(bo.format, drm_fourcc::DrmFourcc::Argb2101010),
            Backing::Cpu { .. } => unreachable!(),
        }
        assert_eq!(rig.device.live_mappings(), 0);
        assert_eq!(rig.gpu.live_textures(), 1);

        alloc.release(&mut rig.cx(true), fb);
        rig.assert_nothing_live();
    }

    #[test]
    fn disabled_gpu_path_uses_dumb_buffers() {
        let mut rig = Rig::new();
        let alloc = FramebufferAllocator::new(24, false);
        let fb = alloc.allocate(&mut rig.cx(true), 640, 480).unwrap();
        assert!(!fb.is_gpu());
        assert_eq!(rig.gpu.live_bos(), 0);
    }

    #[test]
    fn gpu_allocation_failure_falls_back() {
        let mut rig = Rig::new();
        rig.gpu.fail_on(BufferOp::CreateBo);
        let alloc = FramebufferAllocator::new(24, true);
        let fb = alloc.allocate(&mut rig.cx(true), 1920, 1080).unwrap();
        assert!(!fb.is_gpu());
        assert_eq!(rig.gpu.live_bos(), 0);
    }

    #[test]
    fn texture_binding_failure_falls_back_without_leaks() {
        let mut rig = Rig::new();
        rig.gpu.fail_on(BufferOp::BindTexture);
        let alloc = FramebufferAllocator::new(24, true);
        let fb = alloc.allocate(&mut rig.cx(true), 1920, 1080).unwrap();
        assert!(!fb.is_gpu());
        assert_eq!(rig.gpu.live_bos(), 0);
        assert_eq!(rig.device.live_framebuffers(), 1);
    }

    #[test]
    fn gpu_import_failure_is_fatal() {
        let mut rig = Rig::new();
        rig.device.fail_on(BufferOp::AddFramebuffer);
        let alloc = FramebufferAllocator::new(24, true);
        let err = alloc.allocate(&mut rig.cx(true), 1920, 1080).unwrap_err();
        assert!(matches!(err, BufferError::Import(_)));
        rig.assert_nothing_live();
    }

    #[test]
    fn dumb_import_failure_destroys_buffer() {
        let mut rig = Rig::new();
        rig.device.fail_on(BufferOp::AddFramebuffer);
        let alloc = FramebufferAllocator::new(24, true);
        assert!(alloc.allocate(&mut rig.cx(false), 800, 600).is_err());
        rig.assert_nothing_live();
    }

    #[test]
    fn map_failure_removes_framebuffer() {
        let mut rig = Rig::new();
        rig.device.fail_on(BufferOp::Map);
        let alloc = FramebufferAllocator::new(24, true);
        let err = alloc.allocate(&mut rig.cx(false), 800, 600).unwrap_err();
        assert!(matches!(err, BufferError::Map(_)));
        rig.assert_nothing_live();
    }

    #[test]
    fn pixmap_failure_releases_everything() {
        for op in [HostOp::CreatePixmap, HostOp::ModifyPixmapHeader] {
            for with_gpu in [false, true] {
                let mut rig = Rig::new();
                rig.host.fail_on(op);
                let alloc = FramebufferAllocator::new(24, true);
                let err = alloc.allocate(&mut rig.cx(with_gpu), 800, 600).unwrap_err();
                assert!(matches!(err, BufferError::Pixmap(_)), "{op:?} gpu={with_gpu}");
                rig.assert_nothing_live();
            }
        }
    }

    #[test]
    fn reallocate_replaces_id_and_frees_old_buffer() {
        let mut rig = Rig::new();
        let alloc = FramebufferAllocator::new(24, true);
        let mut slot = Some(alloc.allocate(&mut rig.cx(false), 1920, 1080).unwrap());
        let old_id = slot.as_ref().unwrap().id();

        alloc
            .reallocate(&mut rig.cx(false), &mut slot, 3840, 2160)
            .unwrap();
        let fb = slot.as_ref().unwrap();
        assert_ne!(fb.id(), old_id);
        assert_eq!((fb.width(), fb.height()), (3840, 2160));
        assert!(!rig.device.has_framebuffer(old_id));
        assert_eq!(rig.device.live_framebuffers(), 1);
        assert_eq!(rig.device.live_dumb_buffers(), 1);
    }

    #[test]
    fn failed_reallocate_leaves_slot_empty() {
        let mut rig = Rig::new();
        let alloc = FramebufferAllocator::new(24, true);
        let mut slot = Some(alloc.allocate(&mut rig.cx(false), 1920, 1080).unwrap());
        rig.device.fail_on(BufferOp::CreateDumb);

        assert!(alloc
            .reallocate(&mut rig.cx(false), &mut slot, 1280, 720)
            .is_err());
        assert!(slot.is_none());
        rig.assert_nothing_live();
    }
}
