//! Host display server interface.
//!
//! Everything the virtual output core needs from the display server it plugs
//! into: output, CRTC and mode objects, output properties, change
//! notification and pixmaps. The driver provides the real implementation;
//! [`crate::headless`] provides an in-memory one.

use crate::mode::ModeDescriptor;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixmapId(pub u32);

/// GPU texture created from a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

/// CPU mapping of a dumb buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpixelOrder {
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

/// Static traits of an output reported to the host once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTraits {
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: SubpixelOrder,
    pub interlace_allowed: bool,
    pub doublescan_allowed: bool,
    /// Hidden from desktop layout (e.g. the control output).
    pub non_desktop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Integer(i32),
    String(String),
}

impl PropertyValue {
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Integer(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Integer,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// How a property is configured on an output. Values are never range-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    pub kind: PropertyKind,
    pub access: PropertyAccess,
}

impl PropertySpec {
    pub const fn integer(access: PropertyAccess) -> Self {
        Self {
            kind: PropertyKind::Integer,
            access,
        }
    }

    pub const fn string(access: PropertyAccess) -> Self {
        Self {
            kind: PropertyKind::String,
            access,
        }
    }
}

/// Backing storage a pixmap header points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixmapBacking {
    /// CPU-mapped memory, addressed with the header's pitch.
    Memory(MappingId),
    /// GPU texture bound from a buffer object.
    Texture(TextureId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapHeader {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub backing: PixmapBacking,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host refused to create {0}")]
    Refused(&'static str),
    #[error("Unknown output {0:?}")]
    NoSuchOutput(OutputId),
    #[error("Unknown CRTC {0:?}")]
    NoSuchCrtc(CrtcId),
    #[error("Unknown pixmap {0:?}")]
    NoSuchPixmap(PixmapId),
    #[error("Property {0} is not configured")]
    NoSuchProperty(String),
    #[error("Property {0} has a different type")]
    PropertyType(String),
    #[error("Screen resources are not available yet")]
    ScreenNotReady,
}

/// The display server object model, as seen by the virtual output core.
pub trait HostDisplay {
    /// Whether screen-level resources exist (CRTC objects can be created).
    fn screen_resources_ready(&self) -> bool;

    fn create_output(&mut self, name: &str, traits: &OutputTraits) -> Result<OutputId, HostError>;
    fn destroy_output(&mut self, output: OutputId);
    fn set_connection(&mut self, output: OutputId, connection: Connection);
    /// Replace the output's mode list in one batch.
    fn set_modes(
        &mut self,
        output: OutputId,
        modes: &[ModeDescriptor],
        preferred: usize,
    ) -> Result<(), HostError>;

    fn configure_property(
        &mut self,
        output: OutputId,
        name: &str,
        spec: PropertySpec,
    ) -> Result<(), HostError>;
    fn change_property(
        &mut self,
        output: OutputId,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), HostError>;
    fn property(&self, output: OutputId, name: &str) -> Option<PropertyValue>;
    /// Tell the host the output changed and clients should re-query it.
    fn output_changed(&mut self, output: OutputId, config_changed: bool);

    fn create_crtc(&mut self) -> Result<CrtcId, HostError>;
    fn destroy_crtc(&mut self, crtc: CrtcId);
    fn set_possible_crtcs(&mut self, output: OutputId, crtcs: &[CrtcId]) -> Result<(), HostError>;
    /// Light up `output` on `crtc` with `mode`.
    fn activate(
        &mut self,
        crtc: CrtcId,
        output: OutputId,
        mode: &ModeDescriptor,
    ) -> Result<(), HostError>;

    fn create_pixmap(&mut self, depth: u32) -> Result<PixmapId, HostError>;
    fn modify_pixmap_header(
        &mut self,
        pixmap: PixmapId,
        header: &PixmapHeader,
    ) -> Result<(), HostError>;
    fn destroy_pixmap(&mut self, pixmap: PixmapId);
}
