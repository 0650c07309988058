//! Capture-side view of virtual outputs.
//!
//! A capture consumer never touches the driver's objects; it reads the
//! `FRAMEBUFFER_ID` property of an output and follows it as outputs are
//! created, resized and deleted.

use std::collections::BTreeMap;
use tracing::{debug, info};
use xreal_vdisplay::buffer::{BufferDevice, GpuBufferManager};
use xreal_vdisplay::host::HostDisplay;
use xreal_vdisplay::protocol::FRAMEBUFFER_ID;
use xreal_vdisplay::VirtualDisplayManager;

/// Where framebuffer ids are read from.
pub trait FramebufferSource {
    /// Names of the outputs that currently exist.
    fn output_names(&self) -> Vec<String>;

    /// Published framebuffer id of `output`: `None` if the output does not
    /// exist, `Some(0)` if it has no framebuffer.
    fn framebuffer_id(&self, output: &str) -> Option<u32>;
}

/// Reads what the host has published, as an external client would.
impl<H, D, G> FramebufferSource for VirtualDisplayManager<H, D, G>
where
    H: HostDisplay,
    D: BufferDevice,
    G: GpuBufferManager,
{
    fn output_names(&self) -> Vec<String> {
        VirtualDisplayManager::output_names(self)
    }

    fn framebuffer_id(&self, output: &str) -> Option<u32> {
        let vout = self.lookup(output)?;
        let id = self
            .host()
            .property(vout.output_id(), FRAMEBUFFER_ID)
            .and_then(|v| v.as_integer())
            .unwrap_or(0);
        Some(u32::try_from(id).unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A framebuffer became available.
    Attached { output: String, framebuffer: u32 },
    /// The framebuffer was replaced, typically by a resize.
    Changed { output: String, from: u32, to: u32 },
    /// The framebuffer went away, or the output did.
    Detached { output: String, framebuffer: u32 },
}

impl CaptureEvent {
    pub fn output(&self) -> &str {
        match self {
            Self::Attached { output, .. }
            | Self::Changed { output, .. }
            | Self::Detached { output, .. } => output,
        }
    }
}

/// Follows the framebuffer of one output.
#[derive(Debug, Clone)]
pub struct FramebufferWatcher {
    output: String,
    /// Last nonzero id seen.
    last: Option<u32>,
}

impl FramebufferWatcher {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            last: None,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn current(&self) -> Option<u32> {
        self.last
    }

    /// Check the source once. Returns an event if the id changed since the
    /// previous poll.
    pub fn poll(&mut self, source: &dyn FramebufferSource) -> Option<CaptureEvent> {
        let now = source.framebuffer_id(&self.output).filter(|&id| id != 0);
        let event = match (self.last, now) {
            (None, None) => None,
            (Some(a), Some(b)) if a == b => None,
            (None, Some(framebuffer)) => Some(CaptureEvent::Attached {
                output: self.output.clone(),
                framebuffer,
            }),
            (Some(from), Some(to)) => Some(CaptureEvent::Changed {
                output: self.output.clone(),
                from,
                to,
            }),
            (Some(framebuffer), None) => Some(CaptureEvent::Detached {
                output: self.output.clone(),
                framebuffer,
            }),
        };
        self.last = now;
        event
    }
}

/// Watchers for every output a source exposes.
#[derive(Debug, Default)]
pub struct CaptureMonitor {
    watchers: BTreeMap<String, FramebufferWatcher>,
}

impl CaptureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> impl Iterator<Item = &FramebufferWatcher> {
        self.watchers.values()
    }

    /// Start watching new outputs, poll all of them and drop the watchers
    /// of outputs that no longer exist.
    pub fn sync(&mut self, source: &dyn FramebufferSource) -> Vec<CaptureEvent> {
        for name in source.output_names() {
            self.watchers.entry(name.clone()).or_insert_with(|| {
                debug!(output = %name, "Watching framebuffer");
                FramebufferWatcher::new(name)
            });
        }

        let events: Vec<CaptureEvent> = self
            .watchers
            .values_mut()
            .filter_map(|w| w.poll(source))
            .collect();
        for event in &events {
            info!(?event, "Capture event");
        }

        self.watchers
            .retain(|name, _| source.framebuffer_id(name).is_some());
        events
    }
}
