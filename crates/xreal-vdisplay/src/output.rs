use crate::crtc::{DpmsMode, VirtualCrtc};
use crate::framebuffer::OffscreenFramebuffer;
use crate::host::{Connection, CrtcId, OutputId, OutputTraits, PixmapId, PropertyValue, SubpixelOrder};
use crate::mode::{ModeDescriptor, ModeList, ModeSpec};
use crate::protocol::{AR_MODE, FRAMEBUFFER_ID, VIRTUAL_OUTPUT, XR_HEIGHT, XR_REFRESH, XR_WIDTH};

/// Traits of every virtual output: no physical size, shown on the desktop.
pub const VIRTUAL_OUTPUT_TRAITS: OutputTraits = OutputTraits {
    mm_width: 0,
    mm_height: 0,
    subpixel: SubpixelOrder::Unknown,
    interlace_allowed: true,
    doublescan_allowed: true,
    non_desktop: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeStatus {
    Ok,
    BadSize,
    BadRefresh,
}

/// Output hooks the host calls. Property writes are routed separately
/// through [`crate::VirtualDisplayManager::set_output_property`] since they
/// can restructure the whole registry.
pub trait OutputFuncs {
    /// Expose driver-specific properties. Virtual outputs have none beyond
    /// the ones created with the output.
    fn create_resources(&mut self);
    fn detect(&self) -> Connection;
    fn mode_valid(&self, mode: &ModeDescriptor) -> ModeStatus;
    fn get_modes(&self) -> Vec<ModeDescriptor>;
    fn dpms(&mut self, mode: DpmsMode);
    /// Current value of a property, as the driver sees it.
    fn get_property(&self, name: &str) -> Option<PropertyValue>;
}

/// A connector with no hardware behind it.
#[derive(Debug)]
pub struct VirtualOutput {
    name: String,
    output: OutputId,
    current: ModeSpec,
    custom_modes: Vec<ModeSpec>,
    modes: ModeList,
    pub(crate) framebuffer: Option<OffscreenFramebuffer>,
    pub(crate) crtc: Option<VirtualCrtc>,
    ar_mode: bool,
    dpms: DpmsMode,
}

impl VirtualOutput {
    pub(crate) fn new(name: &str, output: OutputId, current: ModeSpec, modes: ModeList) -> Self {
        Self {
            name: name.to_string(),
            output,
            current,
            custom_modes: Vec::new(),
            modes,
            framebuffer: None,
            crtc: None,
            ar_mode: false,
            dpms: DpmsMode::On,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_id(&self) -> OutputId {
        self.output
    }

    pub fn width(&self) -> u32 {
        self.current.width
    }

    pub fn height(&self) -> u32 {
        self.current.height
    }

    pub fn refresh(&self) -> u32 {
        self.current.refresh
    }

    pub fn current(&self) -> ModeSpec {
        self.current
    }

    pub fn custom_modes(&self) -> &[ModeSpec] {
        &self.custom_modes
    }

    pub fn modes(&self) -> &ModeList {
        &self.modes
    }

    pub fn framebuffer(&self) -> Option<&OffscreenFramebuffer> {
        self.framebuffer.as_ref()
    }

    /// Imported framebuffer id, or 0 when there is no framebuffer.
    pub fn framebuffer_id(&self) -> u32 {
        self.framebuffer.as_ref().map_or(0, |fb| fb.id().get())
    }

    pub fn pixmap(&self) -> Option<PixmapId> {
        self.framebuffer.as_ref().map(OffscreenFramebuffer::pixmap)
    }

    pub fn crtc(&self) -> Option<&VirtualCrtc> {
        self.crtc.as_ref()
    }

    pub fn crtc_id(&self) -> Option<CrtcId> {
        self.crtc.as_ref().and_then(VirtualCrtc::host_id)
    }

    pub fn ar_mode(&self) -> bool {
        self.ar_mode
    }

    pub fn dpms_mode(&self) -> DpmsMode {
        self.dpms
    }

    pub(crate) fn set_current(&mut self, current: ModeSpec) {
        self.current = current;
    }

    pub(crate) fn set_custom_modes(&mut self, modes: Vec<ModeSpec>) {
        self.custom_modes = modes;
    }

    pub(crate) fn set_modes(&mut self, modes: ModeList) {
        self.modes = modes;
    }

    pub(crate) fn set_ar_mode(&mut self, enabled: bool) {
        self.ar_mode = enabled;
    }

    /// Whether the framebuffer is missing or sized differently from `mode`.
    pub(crate) fn framebuffer_mismatch(&self, mode: &ModeDescriptor) -> bool {
        self.framebuffer
            .as_ref()
            .map_or(true, |fb| (fb.width(), fb.height()) != mode.size())
    }
}

impl OutputFuncs for VirtualOutput {
    fn create_resources(&mut self) {}

    fn detect(&self) -> Connection {
        Connection::Connected
    }

    fn mode_valid(&self, mode: &ModeDescriptor) -> ModeStatus {
        let spec = ModeSpec::new(mode.hdisplay, mode.vdisplay, 1);
        if spec.validate().is_err() {
            return ModeStatus::BadSize;
        }
        let refresh = mode.vrefresh().round();
        if !(1.0..=1000.0).contains(&refresh) {
            return ModeStatus::BadRefresh;
        }
        ModeStatus::Ok
    }

    fn get_modes(&self) -> Vec<ModeDescriptor> {
        self.modes.modes.clone()
    }

    fn dpms(&mut self, mode: DpmsMode) {
        self.dpms = mode;
    }

    fn get_property(&self, name: &str) -> Option<PropertyValue> {
        let int = |v: u32| PropertyValue::Integer(i32::try_from(v).unwrap_or(i32::MAX));
        match name {
            XR_WIDTH => Some(int(self.current.width)),
            XR_HEIGHT => Some(int(self.current.height)),
            XR_REFRESH => Some(int(self.current.refresh)),
            FRAMEBUFFER_ID => Some(int(self.framebuffer_id())),
            VIRTUAL_OUTPUT => Some(PropertyValue::Integer(1)),
            // The cached flag is authoritative; the host copy mirrors it.
            AR_MODE => Some(PropertyValue::Integer(i32::from(self.ar_mode))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{build_mode_list, synthesize, FallbackModes};

    fn output() -> VirtualOutput {
        let spec = ModeSpec::new(1920, 1080, 60);
        let modes = build_mode_list(spec, &[], &FallbackModes::default()).unwrap();
        VirtualOutput::new("XR-0", OutputId(7), spec, modes)
    }

    #[test]
    fn always_connected() {
        assert_eq!(output().detect(), Connection::Connected);
    }

    #[test]
    fn properties_reflect_cached_state() {
        let mut out = output();
        assert_eq!(out.get_property(XR_WIDTH), Some(PropertyValue::Integer(1920)));
        assert_eq!(out.get_property(FRAMEBUFFER_ID), Some(PropertyValue::Integer(0)));
        assert_eq!(out.get_property(AR_MODE), Some(PropertyValue::Integer(0)));
        out.set_ar_mode(true);
        assert_eq!(out.get_property(AR_MODE), Some(PropertyValue::Integer(1)));
        assert_eq!(out.get_property("EDID"), None);
    }

    #[test]
    fn mode_validation_uses_output_bounds() {
        let out = output();
        let ok = synthesize(ModeSpec::new(3840, 2160, 60)).unwrap();
        assert_eq!(out.mode_valid(&ok), ModeStatus::Ok);
        let mut tiny = ok.clone();
        tiny.hdisplay = 32;
        assert_eq!(out.mode_valid(&tiny), ModeStatus::BadSize);
    }

    #[test]
    fn missing_framebuffer_always_mismatches() {
        let out = output();
        let mode = synthesize(ModeSpec::new(1920, 1080, 60)).unwrap();
        assert!(out.framebuffer_mismatch(&mode));
    }
}
