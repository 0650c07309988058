//! Display mode synthesis.
//!
//! Virtual outputs never scan out, so timings only need to be plausible
//! enough for the host's mode bookkeeping. They are generated with the VESA
//! Coordinated Video Timing formula (normal blanking, progressive) rather
//! than looked up in an EDID-style database.

use crate::error::VirtualOutputError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 16384;
pub const MIN_REFRESH: u32 = 1;
pub const MAX_REFRESH: u32 = 1000;

/// CVT constants (VESA CVT 1.2, normal blanking).
const CVT_H_GRANULARITY: u32 = 8;
const CVT_MIN_V_PORCH: u32 = 3;
const CVT_MIN_VSYNC_BP: f64 = 550.0;
const CVT_HSYNC_PERCENTAGE: u32 = 8;
const CVT_CLOCK_STEP: u32 = 250;
const CVT_MIN_BLANK_PERCENTAGE: f64 = 20.0;
/// M' = M * K / 256 with M = 600, K = 128.
const CVT_M_PRIME: f64 = 600.0 * 128.0 / 256.0;
/// C' = (C - J) * K / 256 + J with C = 40, J = 20, K = 128.
const CVT_C_PRIME: f64 = (40.0 - 20.0) * 128.0 / 256.0 + 20.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("Cannot build timings for {width}x{height}@{refresh}")]
    Degenerate { width: u32, height: u32, refresh: u32 },
}

/// A requested (width, height, refresh) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeSpec {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

impl ModeSpec {
    pub fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            width,
            height,
            refresh,
        }
    }

    /// Check the triple against the bounds every virtual output must respect.
    pub fn validate(&self) -> Result<(), VirtualOutputError> {
        let size_ok = |v: u32| (MIN_DIMENSION..=MAX_DIMENSION).contains(&v);
        if size_ok(self.width)
            && size_ok(self.height)
            && (MIN_REFRESH..=MAX_REFRESH).contains(&self.refresh)
        {
            Ok(())
        } else {
            Err(VirtualOutputError::InvalidDimensions {
                width: self.width.into(),
                height: self.height.into(),
                refresh: self.refresh.into(),
            })
        }
    }

    pub fn same_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

impl std::fmt::Display for ModeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh)
    }
}

bitflags! {
    /// Sync polarity and scan flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
        const DBLSCAN = 1 << 5;
    }
}

bitflags! {
    /// Where a mode came from and whether it is the preferred one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeType: u32 {
        const PREFERRED = 1 << 3;
        const DEFAULT = 1 << 4;
        const USERDEF = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

/// Full timing description of a display mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeDescriptor {
    pub name: String,
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub vdisplay: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
    pub flags: ModeFlags,
    pub kind: ModeType,
}

impl ModeDescriptor {
    /// Vertical refresh implied by the timings, in Hz.
    pub fn vrefresh(&self) -> f64 {
        let pixels = f64::from(self.htotal) * f64::from(self.vtotal);
        if pixels == 0.0 {
            return 0.0;
        }
        f64::from(self.clock) * 1000.0 / pixels
    }

    pub fn is_preferred(&self) -> bool {
        self.kind.contains(ModeType::PREFERRED)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.hdisplay, self.vdisplay)
    }
}

/// VSync width from the aspect ratio, per the CVT table.
fn cvt_vsync_width(width: u32, height: u32) -> u32 {
    if height % 3 == 0 && height * 4 / 3 == width {
        4
    } else if height % 9 == 0 && height * 16 / 9 == width {
        5
    } else if height % 10 == 0 && height * 16 / 10 == width {
        6
    } else if (height % 4 == 0 && height * 5 / 4 == width)
        || (height % 9 == 0 && height * 15 / 9 == width)
    {
        7
    } else {
        10
    }
}

/// Build CVT timings for a triple.
///
/// The active width is kept exact instead of being rounded down to the
/// 8-pixel cell grid, since the framebuffer behind a virtual output must match
/// the requested size.
pub fn synthesize(spec: ModeSpec) -> Result<ModeDescriptor, ModeError> {
    let ModeSpec {
        width,
        height,
        refresh,
    } = spec;
    let degenerate = ModeError::Degenerate {
        width,
        height,
        refresh,
    };
    if width == 0 || height == 0 || refresh == 0 {
        return Err(degenerate);
    }

    // Line period in microseconds.
    let h_period = (1_000_000.0 / f64::from(refresh) - CVT_MIN_VSYNC_BP)
        / f64::from(height + CVT_MIN_V_PORCH);
    if h_period <= 0.0 {
        return Err(degenerate);
    }

    let vsync = cvt_vsync_width(width, height);
    let vsync_bp = ((CVT_MIN_VSYNC_BP / h_period) as u32 + 1).max(vsync + CVT_MIN_V_PORCH);
    let vtotal = height + vsync_bp + CVT_MIN_V_PORCH;

    let blank_percentage =
        (CVT_C_PRIME - CVT_M_PRIME * h_period / 1000.0).max(CVT_MIN_BLANK_PERCENTAGE);
    let mut hblank = (f64::from(width) * blank_percentage / (100.0 - blank_percentage)) as u32;
    hblank -= hblank % (2 * CVT_H_GRANULARITY);

    let htotal = width + hblank;
    let hsync_end = width + hblank / 2;
    let mut hsync_start = hsync_end - htotal * CVT_HSYNC_PERCENTAGE / 100;
    hsync_start += CVT_H_GRANULARITY - hsync_start % CVT_H_GRANULARITY;
    let hsync_start = hsync_start.clamp(width, hsync_end);

    let vsync_start = height + CVT_MIN_V_PORCH;
    let vsync_end = vsync_start + vsync;

    // Very low refresh rates on tiny modes would otherwise step down to 0 kHz.
    let raw_clock = (f64::from(htotal) * 1000.0 / h_period) as u32;
    let clock = if raw_clock >= CVT_CLOCK_STEP {
        raw_clock - raw_clock % CVT_CLOCK_STEP
    } else {
        raw_clock.max(1)
    };

    Ok(ModeDescriptor {
        name: format!("{width}x{height}"),
        clock,
        hdisplay: width,
        hsync_start,
        hsync_end,
        htotal,
        vdisplay: height,
        vsync_start,
        vsync_end,
        vtotal,
        flags: ModeFlags::NHSYNC | ModeFlags::PVSYNC,
        kind: ModeType::DRIVER,
    })
}

/// A user-facing mode: CVT timings with an explicit refresh suffix.
pub fn synthesize_user(spec: ModeSpec) -> Result<ModeDescriptor, ModeError> {
    let mut mode = synthesize(spec)?;
    mode.name = format!("{}x{}@{}Hz", spec.width, spec.height, spec.refresh);
    mode.kind = ModeType::USERDEF;
    Ok(mode)
}

/// The mode list published for one output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeList {
    pub modes: Vec<ModeDescriptor>,
    /// Index into `modes`; always 0 when nothing matches the current size.
    pub preferred: usize,
}

impl ModeList {
    pub fn preferred_mode(&self) -> Option<&ModeDescriptor> {
        self.modes.get(self.preferred)
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

/// Fallback sizes synthesized when an output carries no custom modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackModes {
    pub widths: Vec<u32>,
    pub heights: Vec<u32>,
}

impl Default for FallbackModes {
    fn default() -> Self {
        Self {
            widths: vec![1920, 2560, 3840],
            heights: vec![1080, 1440, 2160],
        }
    }
}

/// Build the full mode list for an output.
///
/// With custom modes, one descriptor per entry. Without, exactly the
/// fallback cross product at the current refresh. Exactly one mode ends up
/// flagged preferred: the first matching the current size, else the first.
pub fn build_mode_list(
    current: ModeSpec,
    custom: &[ModeSpec],
    fallback: &FallbackModes,
) -> Result<ModeList, ModeError> {
    let mut modes = Vec::new();

    if custom.is_empty() {
        for &w in &fallback.widths {
            for &h in &fallback.heights {
                let mut mode = synthesize(ModeSpec::new(w, h, current.refresh))?;
                mode.kind = ModeType::DEFAULT;
                modes.push(mode);
            }
        }
    } else {
        for &spec in custom {
            modes.push(synthesize_user(spec)?);
        }
    }

    let preferred = modes
        .iter()
        .position(|m| current.same_size(m.hdisplay, m.vdisplay))
        .unwrap_or(0);
    if let Some(mode) = modes.get_mut(preferred) {
        mode.kind |= ModeType::PREFERRED;
    }

    Ok(ModeList { modes, preferred })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cvt_1080p60_matches_reference_timings() {
        let mode = synthesize(ModeSpec::new(1920, 1080, 60)).unwrap();
        assert_eq!(mode.name, "1920x1080");
        assert_eq!(mode.clock, 173_000);
        assert_eq!(
            (mode.hdisplay, mode.hsync_start, mode.hsync_end, mode.htotal),
            (1920, 2048, 2248, 2576)
        );
        assert_eq!(
            (mode.vdisplay, mode.vsync_start, mode.vsync_end, mode.vtotal),
            (1080, 1083, 1088, 1120)
        );
        assert!((mode.vrefresh() - 59.96).abs() < 0.01);
        assert_eq!(mode.flags, ModeFlags::NHSYNC | ModeFlags::PVSYNC);
    }

    #[test]
    fn timings_stay_ordered_at_the_bounds() {
        for spec in [
            ModeSpec::new(64, 64, 1),
            ModeSpec::new(64, 64, 1000),
            ModeSpec::new(16384, 16384, 1000),
            ModeSpec::new(1366, 768, 75),
        ] {
            let m = synthesize(spec).unwrap();
            assert_eq!(m.size(), (spec.width, spec.height), "{spec}");
            assert!(m.hdisplay <= m.hsync_start, "{spec}");
            assert!(m.hsync_start <= m.hsync_end, "{spec}");
            assert!(m.hsync_end <= m.htotal, "{spec}");
            assert!(m.vdisplay < m.vsync_start, "{spec}");
            assert!(m.vsync_end < m.vtotal, "{spec}");
            assert!(m.clock > 0, "{spec}");
        }
    }

    #[test]
    fn user_modes_carry_refresh_in_name() {
        let mode = synthesize_user(ModeSpec::new(2560, 1440, 90)).unwrap();
        assert_eq!(mode.name, "2560x1440@90Hz");
        assert_eq!(mode.kind, ModeType::USERDEF);
    }

    #[test]
    fn zero_refresh_is_degenerate() {
        assert!(synthesize(ModeSpec::new(1920, 1080, 0)).is_err());
    }

    #[test]
    fn fallback_list_prefers_current_size() {
        let list = build_mode_list(
            ModeSpec::new(2560, 1440, 60),
            &[],
            &FallbackModes::default(),
        )
        .unwrap();
        assert_eq!(list.len(), 9);
        let preferred = list.preferred_mode().unwrap();
        assert_eq!(preferred.size(), (2560, 1440));
        assert_eq!(list.modes.iter().filter(|m| m.is_preferred()).count(), 1);
    }

    #[test]
    fn fallback_list_without_match_prefers_first_entry() {
        let list = build_mode_list(
            ModeSpec::new(1280, 720, 60),
            &[],
            &FallbackModes::default(),
        )
        .unwrap();
        assert_eq!(list.len(), 9);
        assert_eq!(list.preferred, 0);
        assert_eq!(list.modes[0].size(), (1920, 1080));
        assert!(list.modes[0].is_preferred());
        assert_eq!(list.modes.iter().filter(|m| m.is_preferred()).count(), 1);
        assert!(list.modes.iter().all(|m| m.size() != (1280, 720)));
    }

    #[test]
    fn custom_list_without_match_prefers_first_entry() {
        let custom = [ModeSpec::new(640, 480, 60), ModeSpec::new(800, 600, 75)];
        let list = build_mode_list(
            ModeSpec::new(1920, 1080, 60),
            &custom,
            &FallbackModes::default(),
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.preferred, 0);
        assert!(list.modes[0].is_preferred());
        assert!(!list.modes[1].is_preferred());
    }

    #[test]
    fn custom_list_prefers_matching_entry() {
        let custom = [ModeSpec::new(640, 480, 60), ModeSpec::new(800, 600, 75)];
        let list = build_mode_list(
            ModeSpec::new(800, 600, 60),
            &custom,
            &FallbackModes::default(),
        )
        .unwrap();
        assert_eq!(list.preferred, 1);
        assert_eq!(list.modes[1].name, "800x600@75Hz");
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(ModeSpec::new(64, 16384, 1).validate().is_ok());
        assert!(ModeSpec::new(16384, 64, 1000).validate().is_ok());
        assert!(ModeSpec::new(63, 1080, 60).validate().is_err());
        assert!(ModeSpec::new(1920, 16385, 60).validate().is_err());
        assert!(ModeSpec::new(1920, 1080, 1001).validate().is_err());
        assert!(ModeSpec::new(1920, 1080, 0).validate().is_err());
    }
}
