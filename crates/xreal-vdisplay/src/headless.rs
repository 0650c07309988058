//! In-memory host, buffer device and GPU buffer manager.
//!
//! Used when no display server is around (development, the `xreal-vout`
//! shell) and by the tests. Every object is tracked so leaks show up as
//! nonzero live counts, and any fallible operation can be made to fail.

use crate::buffer::{
    BoUsage, BufferDevice, BufferError, DumbBuffer, FramebufferId, FramebufferRequest, GpuBo,
    GpuBufferManager, Mapping,
};
use crate::host::{
    Connection, CrtcId, HostDisplay, HostError, MappingId, OutputId, OutputTraits, PixmapHeader,
    PixmapId, PropertyKind, PropertySpec, PropertyValue, TextureId,
};
use crate::mode::ModeDescriptor;
use drm_fourcc::DrmFourcc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU32;

/// Host operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    CreateOutput,
    SetModes,
    ConfigureProperty,
    ChangeProperty,
    CreateCrtc,
    SetPossibleCrtcs,
    Activate,
    CreatePixmap,
    ModifyPixmapHeader,
}

/// Buffer and GPU operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferOp {
    CreateDumb,
    Map,
    AddFramebuffer,
    CreateBo,
    BindTexture,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessProperty {
    pub spec: PropertySpec,
    pub value: Option<PropertyValue>,
}

#[derive(Debug, Clone)]
pub struct HeadlessOutput {
    pub name: String,
    pub traits: OutputTraits,
    pub connection: Connection,
    pub modes: Vec<ModeDescriptor>,
    pub preferred: usize,
    pub possible_crtcs: Vec<CrtcId>,
    pub properties: HashMap<String, HeadlessProperty>,
    /// Number of change notifications received.
    pub notifications: u32,
}

impl HeadlessOutput {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name).and_then(|p| p.value.as_ref())
    }
}

/// Output and mode a CRTC was activated with.
#[derive(Debug, Clone)]
pub struct CrtcBinding {
    pub output: OutputId,
    pub mode: ModeDescriptor,
}

#[derive(Debug)]
pub struct HeadlessHost {
    next_id: u32,
    screen_ready: bool,
    outputs: BTreeMap<OutputId, HeadlessOutput>,
    crtcs: BTreeMap<CrtcId, Option<CrtcBinding>>,
    pixmaps: HashMap<PixmapId, Option<PixmapHeader>>,
    failures: HashSet<HostOp>,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessHost {
    /// A host whose screen resources already exist.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            screen_ready: true,
            outputs: BTreeMap::new(),
            crtcs: BTreeMap::new(),
            pixmaps: HashMap::new(),
            failures: HashSet::new(),
        }
    }

    /// A host still before screen resource creation: no CRTCs can be made.
    pub fn without_screen_resources() -> Self {
        Self {
            screen_ready: false,
            ..Self::new()
        }
    }

    pub fn set_screen_resources_ready(&mut self, ready: bool) {
        self.screen_ready = ready;
    }

    /// Make every later call of `op` fail until `clear_failures`.
    pub fn fail_on(&mut self, op: HostOp) {
        self.failures.insert(op);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    pub fn output(&self, id: OutputId) -> Option<&HeadlessOutput> {
        self.outputs.get(&id)
    }

    pub fn output_named(&self, name: &str) -> Option<(OutputId, &HeadlessOutput)> {
        self.outputs
            .iter()
            .find(|(_, o)| o.name == name)
            .map(|(id, o)| (*id, o))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (OutputId, &HeadlessOutput)> {
        self.outputs.iter().map(|(id, o)| (*id, o))
    }

    pub fn live_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn live_crtcs(&self) -> usize {
        self.crtcs.len()
    }

    pub fn live_pixmaps(&self) -> usize {
        self.pixmaps.len()
    }

    pub fn crtc_binding(&self, crtc: CrtcId) -> Option<&CrtcBinding> {
        self.crtcs.get(&crtc).and_then(Option::as_ref)
    }

    pub fn pixmap_header(&self, pixmap: PixmapId) -> Option<PixmapHeader> {
        self.pixmaps.get(&pixmap).copied().flatten()
    }

    fn check(&self, op: HostOp, what: &'static str) -> Result<(), HostError> {
        if self.failures.contains(&op) {
            Err(HostError::Refused(what))
        } else {
            Ok(())
        }
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn output_mut(&mut self, id: OutputId) -> Result<&mut HeadlessOutput, HostError> {
        self.outputs.get_mut(&id).ok_or(HostError::NoSuchOutput(id))
    }
}

impl HostDisplay for HeadlessHost {
    fn screen_resources_ready(&self) -> bool {
        self.screen_ready
    }

    fn create_output(&mut self, name: &str, traits: &OutputTraits) -> Result<OutputId, HostError> {
        self.check(HostOp::CreateOutput, "output")?;
        let id = OutputId(self.next());
        self.outputs.insert(
            id,
            HeadlessOutput {
                name: name.to_string(),
                traits: *traits,
                connection: Connection::Unknown,
                modes: Vec::new(),
                preferred: 0,
                possible_crtcs: Vec::new(),
                properties: HashMap::new(),
                notifications: 0,
            },
        );
        Ok(id)
    }

    fn destroy_output(&mut self, output: OutputId) {
        self.outputs.remove(&output);
        for binding in self.crtcs.values_mut() {
            if binding.as_ref().is_some_and(|b| b.output == output) {
                *binding = None;
            }
        }
    }

    fn set_connection(&mut self, output: OutputId, connection: Connection) {
        if let Some(o) = self.outputs.get_mut(&output) {
            o.connection = connection;
        }
    }

    fn set_modes(
        &mut self,
        output: OutputId,
        modes: &[ModeDescriptor],
        preferred: usize,
    ) -> Result<(), HostError> {
        self.check(HostOp::SetModes, "mode list")?;
        let o = self.output_mut(output)?;
        o.modes = modes.to_vec();
        o.preferred = preferred;
        Ok(())
    }

    fn configure_property(
        &mut self,
        output: OutputId,
        name: &str,
        spec: PropertySpec,
    ) -> Result<(), HostError> {
        self.check(HostOp::ConfigureProperty, "property")?;
        let o = self.output_mut(output)?;
        o.properties
            .entry(name.to_string())
            .and_modify(|p| p.spec = spec)
            .or_insert(HeadlessProperty { spec, value: None });
        Ok(())
    }

    fn change_property(
        &mut self,
        output: OutputId,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), HostError> {
        self.check(HostOp::ChangeProperty, "property value")?;
        let o = self.output_mut(output)?;
        let prop = o
            .properties
            .get_mut(name)
            .ok_or_else(|| HostError::NoSuchProperty(name.to_string()))?;
        let matches = matches!(
            (prop.spec.kind, &value),
            (PropertyKind::Integer, PropertyValue::Integer(_))
                | (PropertyKind::String, PropertyValue::String(_))
        );
        if !matches {
            return Err(HostError::PropertyType(name.to_string()));
        }
        prop.value = Some(value);
        Ok(())
    }

    fn property(&self, output: OutputId, name: &str) -> Option<PropertyValue> {
        self.outputs.get(&output)?.property(name).cloned()
    }

    fn output_changed(&mut self, output: OutputId, _config_changed: bool) {
        if let Some(o) = self.outputs.get_mut(&output) {
            o.notifications += 1;
        }
    }

    fn create_crtc(&mut self) -> Result<CrtcId, HostError> {
        if !self.screen_ready {
            return Err(HostError::ScreenNotReady);
        }
        self.check(HostOp::CreateCrtc, "CRTC")?;
        let id = CrtcId(self.next());
        self.crtcs.insert(id, None);
        Ok(id)
    }

    fn destroy_crtc(&mut self, crtc: CrtcId) {
        self.crtcs.remove(&crtc);
        for o in self.outputs.values_mut() {
            o.possible_crtcs.retain(|c| *c != crtc);
        }
    }

    fn set_possible_crtcs(&mut self, output: OutputId, crtcs: &[CrtcId]) -> Result<(), HostError> {
        self.check(HostOp::SetPossibleCrtcs, "CRTC binding")?;
        if let Some(missing) = crtcs.iter().find(|c| !self.crtcs.contains_key(c)) {
            return Err(HostError::NoSuchCrtc(*missing));
        }
        self.output_mut(output)?.possible_crtcs = crtcs.to_vec();
        Ok(())
    }

    fn activate(
        &mut self,
        crtc: CrtcId,
        output: OutputId,
        mode: &ModeDescriptor,
    ) -> Result<(), HostError> {
        self.check(HostOp::Activate, "CRTC configuration")?;
        let o = self.outputs.get(&output).ok_or(HostError::NoSuchOutput(output))?;
        if !o.possible_crtcs.contains(&crtc) {
            return Err(HostError::NoSuchCrtc(crtc));
        }
        let slot = self.crtcs.get_mut(&crtc).ok_or(HostError::NoSuchCrtc(crtc))?;
        *slot = Some(CrtcBinding {
            output,
            mode: mode.clone(),
        });
        Ok(())
    }

    fn create_pixmap(&mut self, _depth: u32) -> Result<PixmapId, HostError> {
        self.check(HostOp::CreatePixmap, "pixmap")?;
        let id = PixmapId(self.next());
        self.pixmaps.insert(id, None);
        Ok(id)
    }

    fn modify_pixmap_header(
        &mut self,
        pixmap: PixmapId,
        header: &PixmapHeader,
    ) -> Result<(), HostError> {
        self.check(HostOp::ModifyPixmapHeader, "pixmap header")?;
        let slot = self
            .pixmaps
            .get_mut(&pixmap)
            .ok_or(HostError::NoSuchPixmap(pixmap))?;
        *slot = Some(*header);
        Ok(())
    }

    fn destroy_pixmap(&mut self, pixmap: PixmapId) {
        self.pixmaps.remove(&pixmap);
    }
}

/// Dumb buffers and framebuffer ids, tracked but never backed by memory.
#[derive(Debug, Default)]
pub struct HeadlessBuffers {
    next_id: u32,
    dumb: HashMap<u32, DumbBuffer>,
    mappings: HashMap<MappingId, u32>,
    framebuffers: HashMap<FramebufferId, FramebufferRequest>,
    failures: HashSet<BufferOp>,
}

impl HeadlessBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&mut self, op: BufferOp) {
        self.failures.insert(op);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.dumb.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mappings.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn has_framebuffer(&self, id: FramebufferId) -> bool {
        self.framebuffers.contains_key(&id)
    }

    pub fn framebuffer(&self, id: FramebufferId) -> Option<&FramebufferRequest> {
        self.framebuffers.get(&id)
    }

    fn next(&mut self) -> NonZeroU32 {
        self.next_id += 1;
        NonZeroU32::MIN.saturating_add(self.next_id - 1)
    }

    fn failing(&self, op: BufferOp) -> bool {
        self.failures.contains(&op)
    }
}

impl BufferDevice for HeadlessBuffers {
    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, BufferError> {
        if self.failing(BufferOp::CreateDumb) {
            return Err(BufferError::Allocate {
                width,
                height,
                reason: "CREATE_DUMB refused".to_string(),
            });
        }
        // Align scanlines to 64 bytes, like most KMS drivers do.
        let pitch = (width * bpp.div_ceil(8) + 63) & !63;
        let buffer = DumbBuffer {
            handle: self.next().get(),
            width,
            height,
            bpp,
            pitch,
            size: u64::from(pitch) * u64::from(height),
        };
        self.dumb.insert(buffer.handle, buffer);
        Ok(buffer)
    }

    fn destroy_dumb(&mut self, buffer: &DumbBuffer) {
        self.dumb.remove(&buffer.handle);
    }

    fn map_dumb(&mut self, buffer: &DumbBuffer) -> Result<Mapping, BufferError> {
        if self.failing(BufferOp::Map) {
            return Err(BufferError::Map("MAP_DUMB refused".to_string()));
        }
        if !self.dumb.contains_key(&buffer.handle) {
            return Err(BufferError::Map(format!("no dumb buffer {}", buffer.handle)));
        }
        let id = MappingId(self.next().get());
        self.mappings.insert(id, buffer.handle);
        Ok(Mapping {
            id,
            len: buffer.size,
        })
    }

    fn unmap(&mut self, mapping: Mapping) {
        self.mappings.remove(&mapping.id);
    }

    fn add_framebuffer(&mut self, request: &FramebufferRequest) -> Result<FramebufferId, BufferError> {
        if self.failing(BufferOp::AddFramebuffer) {
            return Err(BufferError::Import("ADDFB refused".to_string()));
        }
        let id = FramebufferId(self.next());
        self.framebuffers.insert(id, *request);
        Ok(id)
    }

    fn remove_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
    }
}

/// GPU buffer objects and textures, tracked only.
#[derive(Debug, Default)]
pub struct HeadlessGpu {
    next_id: u32,
    bos: HashMap<u32, GpuBo>,
    textures: HashMap<TextureId, u32>,
    failures: HashSet<BufferOp>,
}

impl HeadlessGpu {
    pub fn new() -> Self {
        Self {
            // Keep GPU handles apart from dumb buffer handles.
            next_id: 0x1_0000,
            ..Self::default()
        }
    }

    pub fn fail_on(&mut self, op: BufferOp) {
        self.failures.insert(op);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    pub fn live_bos(&self) -> usize {
        self.bos.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuBufferManager for HeadlessGpu {
    fn create_bo(
        &mut self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        usage: BoUsage,
    ) -> Result<GpuBo, BufferError> {
        if self.failures.contains(&BufferOp::CreateBo) {
            return Err(BufferError::Allocate {
                width,
                height,
                reason: format!("no {format:?} buffer with {usage:?}"),
            });
        }
        let cpp = match format {
            DrmFourcc::Argb1555 | DrmFourcc::Rgb565 => 2,
            _ => 4,
        };
        let bo = GpuBo {
            handle: self.next(),
            width,
            height,
            pitch: (width * cpp + 255) & !255,
            format,
        };
        self.bos.insert(bo.handle, bo);
        Ok(bo)
    }

    fn destroy_bo(&mut self, bo: &GpuBo) {
        self.bos.remove(&bo.handle);
    }

    fn bind_texture(&mut self, bo: &GpuBo) -> Result<TextureId, BufferError> {
        if self.failures.contains(&BufferOp::BindTexture) {
            return Err(BufferError::TextureBind("EGL image import refused".to_string()));
        }
        if !self.bos.contains_key(&bo.handle) {
            return Err(BufferError::TextureBind(format!("no buffer object {}", bo.handle)));
        }
        let id = TextureId(self.next());
        self.textures.insert(id, bo.handle);
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }
}
