//! Virtual display outputs for a display server driver.
//!
//! A hidden control output accepts `CREATE_XR_OUTPUT` / `DELETE_XR_OUTPUT`
//! commands; every virtual output it creates gets synthesized modes, a
//! software CRTC and an off-screen framebuffer whose id is published for
//! capture consumers.

pub mod buffer;
pub mod crtc;
pub mod error;
pub mod framebuffer;
pub mod headless;
pub mod host;
mod lifecycle;
pub mod manager;
pub mod mode;
pub mod output;
pub mod protocol;
pub mod registry;

pub use error::VirtualOutputError;
pub use manager::{ControlState, CrtcTarget, OutputTarget, VirtualDisplayManager};
pub use protocol::CreateRequest;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Information about a created virtual display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub name: String,
    /// Current resolution.
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// Framebuffer id capture consumers read, 0 when none is allocated.
    pub framebuffer_id: u32,
}

/// Batch creation and removal of virtual displays.
pub trait VirtualDisplayProvider: Send {
    /// Create virtual displays with the given names and modes.
    fn create_displays(&mut self, configs: &[CreateRequest]) -> Result<Vec<DisplayInfo>>;
    /// Remove all virtual displays.
    fn remove_all(&mut self) -> Result<()>;
}
