use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Pixel format and buffer path settings.
    pub display: DisplayConfig,
    /// Virtual output policy.
    pub outputs: VirtualOutputConfig,
    /// Outputs created right after the screen comes up.
    pub startup: Vec<StartupOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Screen color depth in bits (15, 16, 24 or 30).
    pub depth: u32,
    /// Try the GPU buffer path before falling back to dumb buffers.
    pub gpu_buffers: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            depth: 24,
            gpu_buffers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualOutputConfig {
    /// Name of the hidden control output carrying the command properties.
    pub manager_name: String,
    /// Refresh used when a create command omits it.
    pub default_refresh: u32,
    /// Reallocate the framebuffer on resize instead of waiting for the next mode-set.
    pub eager_resize: bool,
    /// Widths of the fallback mode set, used when an output has no custom modes.
    pub fallback_widths: Vec<u32>,
    /// Heights of the fallback mode set.
    pub fallback_heights: Vec<u32>,
}

impl Default for VirtualOutputConfig {
    fn default() -> Self {
        Self {
            manager_name: "XR-Manager".to_string(),
            default_refresh: 60,
            eager_resize: false,
            fallback_widths: vec![1920, 2560, 3840],
            fallback_heights: vec![1080, 1440, 2160],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupOutput {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// `None` uses `outputs.default_refresh`.
    #[serde(default)]
    pub refresh: Option<u32>,
}

impl StartupOutput {
    pub fn refresh_or(&self, default_refresh: u32) -> u32 {
        self.refresh.unwrap_or(default_refresh)
    }
}
