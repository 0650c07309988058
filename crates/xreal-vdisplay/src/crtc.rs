use crate::host::CrtcId;
use crate::mode::ModeDescriptor;
use bitflags::bitflags;
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rotation: u32 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

/// Gamma ramp as last handed to the CRTC. Never applied anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GammaLut {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub colors: (u32, u32),
    pub image: Option<Vec<u32>>,
}

/// CRTC hooks the host calls. Real CRTCs program hardware; the virtual one
/// records state and nothing else.
pub trait CrtcFuncs {
    fn dpms(&mut self, mode: DpmsMode);
    /// Commit a mode. Returns false if the CRTC refused it.
    fn set_mode_major(&mut self, mode: &ModeDescriptor, rotation: Rotation, x: i32, y: i32)
        -> bool;
    fn set_cursor_colors(&mut self, bg: u32, fg: u32);
    fn set_cursor_position(&mut self, x: i32, y: i32);
    fn show_cursor(&mut self);
    fn hide_cursor(&mut self);
    /// Returns false if the image was rejected.
    fn load_cursor_argb(&mut self, image: &[u32]) -> bool;
    fn gamma_set(&mut self, red: &[u16], green: &[u16], blue: &[u16]);
    /// Shadow buffer for rotated scanout. Returns the shadow handle, if any.
    fn shadow_allocate(&mut self, width: u32, height: u32) -> Option<u32>;
    fn shadow_destroy(&mut self, shadow: Option<u32>);
}

/// Software-only display controller owned by one virtual output.
#[derive(Debug, Clone)]
pub struct VirtualCrtc {
    host: Option<CrtcId>,
    mode: Option<ModeDescriptor>,
    x: i32,
    y: i32,
    rotation: Rotation,
    dpms: DpmsMode,
    gamma: GammaLut,
    cursor: CursorState,
}

impl Default for VirtualCrtc {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCrtc {
    pub fn new() -> Self {
        Self {
            host: None,
            mode: None,
            x: 0,
            y: 0,
            rotation: Rotation::ROTATE_0,
            dpms: DpmsMode::On,
            gamma: GammaLut::default(),
            cursor: CursorState::default(),
        }
    }

    /// Attach the host-facing CRTC object.
    pub fn bind(&mut self, crtc: CrtcId) {
        self.host = Some(crtc);
    }

    pub fn host_id(&self) -> Option<CrtcId> {
        self.host
    }

    pub fn mode(&self) -> Option<&ModeDescriptor> {
        self.mode.as_ref()
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn dpms_mode(&self) -> DpmsMode {
        self.dpms
    }

    pub fn gamma(&self) -> &GammaLut {
        &self.gamma
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }
}

impl CrtcFuncs for VirtualCrtc {
    fn dpms(&mut self, mode: DpmsMode) {
        trace!(crtc = ?self.host, ?mode, "virtual CRTC dpms");
        self.dpms = mode;
    }

    fn set_mode_major(
        &mut self,
        mode: &ModeDescriptor,
        rotation: Rotation,
        x: i32,
        y: i32,
    ) -> bool {
        self.mode = Some(mode.clone());
        self.rotation = rotation;
        self.x = x;
        self.y = y;
        true
    }

    fn set_cursor_colors(&mut self, bg: u32, fg: u32) {
        self.cursor.colors = (bg, fg);
    }

    fn set_cursor_position(&mut self, x: i32, y: i32) {
        self.cursor.x = x;
        self.cursor.y = y;
    }

    fn show_cursor(&mut self) {
        self.cursor.visible = true;
    }

    fn hide_cursor(&mut self) {
        self.cursor.visible = false;
    }

    fn load_cursor_argb(&mut self, image: &[u32]) -> bool {
        self.cursor.image = Some(image.to_vec());
        true
    }

    fn gamma_set(&mut self, red: &[u16], green: &[u16], blue: &[u16]) {
        self.gamma = GammaLut {
            red: red.to_vec(),
            green: green.to_vec(),
            blue: blue.to_vec(),
        };
    }

    fn shadow_allocate(&mut self, _width: u32, _height: u32) -> Option<u32> {
        None
    }

    fn shadow_destroy(&mut self, _shadow: Option<u32>) {}
}
