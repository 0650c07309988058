use crate::buffer::{BufferDevice, GpuBufferManager, NoGpu};
use crate::crtc::{DpmsMode, VirtualCrtc};
use crate::error::VirtualOutputError;
use crate::framebuffer::{BufferContext, FramebufferAllocator};
use crate::host::{
    Connection, CrtcId, HostDisplay, OutputId, OutputTraits, PropertyAccess, PropertySpec,
    PropertyValue, SubpixelOrder,
};
use crate::mode::{FallbackModes, ModeDescriptor};
use crate::output::{ModeStatus, OutputFuncs, VirtualOutput};
use crate::protocol::{
    parse_command, ControlCommand, CreateRequest, AR_MODE, CREATE_XR_OUTPUT, DELETE_XR_OUTPUT, FRAMEBUFFER_ID,
    VIRTUAL_OUTPUT, XR_HEIGHT, XR_MODES, XR_REFRESH, XR_WIDTH,
};
use crate::registry::OutputRegistry;
use crate::{DisplayInfo, VirtualDisplayProvider};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use xreal_config::DriverConfig;

const CONTROL_TRAITS: OutputTraits = OutputTraits {
    mm_width: 0,
    mm_height: 0,
    subpixel: SubpixelOrder::Unknown,
    interlace_allowed: false,
    doublescan_allowed: false,
    non_desktop: true,
};

/// Lifecycle of the control output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Driver not attached; nothing exists.
    Detached,
    /// Driver attached, host screen not up yet; no host objects exist.
    Attached,
    /// Host-facing control output exists and accepts commands.
    Active { output: OutputId },
}

impl ControlState {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Active { .. } => "active",
        }
    }
}

/// The hidden, permanently disconnected command channel.
#[derive(Debug, Clone)]
pub struct ControlOutput {
    name: String,
    state: ControlState,
}

impl ControlOutput {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ControlState::Detached,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn output_id(&self) -> Option<OutputId> {
        match self.state {
            ControlState::Active { output } => Some(output),
            _ => None,
        }
    }
}

impl OutputFuncs for ControlOutput {
    fn create_resources(&mut self) {}

    fn detect(&self) -> Connection {
        Connection::Disconnected
    }

    fn mode_valid(&self, _mode: &ModeDescriptor) -> ModeStatus {
        ModeStatus::BadSize
    }

    fn get_modes(&self) -> Vec<ModeDescriptor> {
        Vec::new()
    }

    fn dpms(&mut self, _mode: DpmsMode) {}

    // Command properties are write-only.
    fn get_property(&self, _name: &str) -> Option<PropertyValue> {
        None
    }
}

/// Which implementation a host output callback lands on.
pub enum OutputTarget<'a> {
    Control(&'a mut ControlOutput),
    Virtual(&'a mut VirtualOutput),
    /// Not ours; handled by the hardware path.
    Real(OutputId),
}

/// Which implementation a host CRTC callback lands on.
pub enum CrtcTarget<'a> {
    Virtual(&'a mut VirtualCrtc),
    Real(CrtcId),
}

/// Output policy derived from the driver config.
#[derive(Debug, Clone)]
pub(crate) struct OutputPolicy {
    pub(crate) default_refresh: u32,
    pub(crate) eager_resize: bool,
    pub(crate) fallback: FallbackModes,
}

/// Per-driver-instance state: the control output and every virtual output.
///
/// Owned by the driver instance record and handed the host, the kernel buffer
/// device and (optionally) a GPU buffer manager. All entry points run inside
/// host callbacks, which the host serializes.
pub struct VirtualDisplayManager<H, D, G = NoGpu> {
    pub(crate) host: H,
    pub(crate) device: D,
    pub(crate) gpu: Option<G>,
    pub(crate) allocator: FramebufferAllocator,
    pub(crate) policy: OutputPolicy,
    pub(crate) control: ControlOutput,
    pub(crate) registry: OutputRegistry,
}

impl<H, D, G> std::fmt::Debug for VirtualDisplayManager<H, D, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDisplayManager")
            .field("control", &self.control)
            .field("outputs", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl<H, D, G> VirtualDisplayManager<H, D, G>
where
    H: HostDisplay,
    D: BufferDevice,
    G: GpuBufferManager,
{
    pub fn new(host: H, device: D, gpu: Option<G>, config: &DriverConfig) -> Self {
        let outputs = &config.outputs;
        Self {
            host,
            device,
            gpu,
            allocator: FramebufferAllocator::new(config.display.depth, config.display.gpu_buffers),
            policy: OutputPolicy {
                default_refresh: outputs.default_refresh,
                eager_resize: outputs.eager_resize,
                fallback: FallbackModes {
                    widths: outputs.fallback_widths.clone(),
                    heights: outputs.fallback_heights.clone(),
                },
            },
            control: ControlOutput::new(&outputs.manager_name),
            registry: OutputRegistry::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn gpu(&self) -> Option<&G> {
        self.gpu.as_ref()
    }

    pub fn gpu_mut(&mut self) -> Option<&mut G> {
        self.gpu.as_mut()
    }

    pub fn control(&self) -> &ControlOutput {
        &self.control
    }

    pub fn state(&self) -> ControlState {
        self.control.state
    }

    pub fn lookup(&self, name: &str) -> Option<&VirtualOutput> {
        self.registry.get(name)
    }

    pub fn lookup_by_crtc(&self, crtc: CrtcId) -> Option<&VirtualOutput> {
        self.registry.by_crtc(crtc)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &VirtualOutput> {
        self.registry.iter()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Split borrows: buffer collaborators, registry, allocator.
    pub(crate) fn parts(
        &mut self,
    ) -> (BufferContext<'_>, &mut OutputRegistry, &FramebufferAllocator) {
        let gpu = self
            .gpu
            .as_mut()
            .map(|gpu| gpu as &mut dyn GpuBufferManager);
        (
            BufferContext {
                host: &mut self.host,
                device: &mut self.device,
                gpu,
            },
            &mut self.registry,
            &self.allocator,
        )
    }

    /// Driver attach. Creates no host objects. Idempotent.
    pub fn attach(&mut self) -> bool {
        match self.control.state {
            ControlState::Detached => {
                self.control.state = ControlState::Attached;
                debug!(manager = %self.control.name, "Virtual output manager attached");
                true
            }
            _ => false,
        }
    }

    /// Called once the host screen exists: create the control output and its
    /// command properties. A no-op when already active.
    pub fn post_screen_init(&mut self) -> Result<OutputId, VirtualOutputError> {
        match self.control.state {
            ControlState::Active { output } => return Ok(output),
            ControlState::Detached => {
                return Err(VirtualOutputError::NotActive(self.control.state.label()))
            }
            ControlState::Attached => {}
        }

        let name = self.control.name.clone();
        let output = self
            .host
            .create_output(&name, &CONTROL_TRAITS)
            .map_err(|e| {
                tracing::error!(manager = %name, error = %e, "Failed to create control output");
                VirtualOutputError::allocation(&name, e)
            })?;
        self.host.set_connection(output, Connection::Disconnected);
        self.control.create_resources();

        for property in [CREATE_XR_OUTPUT, DELETE_XR_OUTPUT] {
            if let Err(e) = self.host.configure_property(
                output,
                property,
                PropertySpec::string(PropertyAccess::WriteOnly),
            ) {
                // Without its command properties the control output is useless.
                tracing::error!(manager = %name, property, error = %e, "Failed to configure command property");
                self.host.destroy_output(output);
                return Err(VirtualOutputError::Property {
                    name,
                    property,
                    source: e,
                });
            }
        }

        self.control.state = ControlState::Active { output };
        info!(manager = %name, "Virtual output control channel ready");
        Ok(output)
    }

    /// Driver detach: delete every virtual output, then the control output.
    pub fn detach(&mut self) {
        self.remove_all_outputs();
        if let ControlState::Active { output } = self.control.state {
            self.host.destroy_output(output);
        }
        if self.control.state != ControlState::Detached {
            info!(manager = %self.control.name, "Virtual output manager detached");
        }
        self.control.state = ControlState::Detached;
    }

    /// Delete every registered virtual output.
    pub fn remove_all_outputs(&mut self) -> usize {
        let names = self.registry.names();
        for name in &names {
            if let Err(e) = self.delete_output(name) {
                warn!(name = %name, error = %e, "Failed to delete virtual output during teardown");
            }
        }
        names.len()
    }

    /// Host property-write callback for any output. Returns whether the write
    /// was accepted; `false` for properties this core does not handle.
    pub fn set_output_property(
        &mut self,
        output: OutputId,
        property: &str,
        value: &PropertyValue,
    ) -> bool {
        if self.control.output_id() == Some(output) {
            return self.handle_control_property(property, value);
        }
        match self.registry.name_of_output(output) {
            Some(name) => self.handle_virtual_property(&name, property, value),
            None => false,
        }
    }

    /// Host property-read callback. `None` means "use the host's stored value".
    pub fn output_property(&self, output: OutputId, property: &str) -> Option<PropertyValue> {
        if self.control.output_id() == Some(output) {
            return self.control.get_property(property);
        }
        self.registry.by_output(output)?.get_property(property)
    }

    /// Control output command handler.
    pub fn handle_control_property(&mut self, property: &str, value: &PropertyValue) -> bool {
        if !matches!(self.control.state, ControlState::Active { .. }) {
            warn!(property, state = self.control.state.label(), "Command on inactive control output");
            return false;
        }
        let default_refresh = self.policy.default_refresh;
        let Some(text) = value.as_str() else {
            if property == CREATE_XR_OUTPUT || property == DELETE_XR_OUTPUT {
                warn!(property, "Command property expects a string value");
            }
            return false;
        };
        let command = match parse_command(property, text, default_refresh) {
            None => return false,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                warn!(property, value = %text, error = %e, "Rejected malformed command");
                return false;
            }
        };

        match command {
            ControlCommand::Create(req) => {
                match self.create_output(&req.name, req.width, req.height, req.refresh) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(name = %req.name, error = %e, "Rejected create command");
                        false
                    }
                }
            }
            ControlCommand::Delete(name) => match self.delete_output(&name) {
                Ok(()) => true,
                Err(e) => {
                    warn!(name = %name, error = %e, "Rejected delete command");
                    false
                }
            },
        }
    }

    fn handle_virtual_property(&mut self, name: &str, property: &str, value: &PropertyValue) -> bool {
        let Some(current) = self.registry.get(name).map(VirtualOutput::current) else {
            return false;
        };

        let result = match (property, value) {
            (XR_WIDTH | XR_HEIGHT | XR_REFRESH, PropertyValue::Integer(v)) => {
                let v = i64::from(*v);
                let (w, h, r) = match property {
                    XR_WIDTH => (v, current.height.into(), current.refresh.into()),
                    XR_HEIGHT => (current.width.into(), v, current.refresh.into()),
                    _ => (current.width.into(), current.height.into(), v),
                };
                self.resize_checked(name, w, h, r)
            }
            (XR_MODES, PropertyValue::String(list)) => self.set_custom_modes(name, list).map(|_| ()),
            (AR_MODE, PropertyValue::Integer(v)) => self.set_ar_mode(name, *v != 0),
            (FRAMEBUFFER_ID | VIRTUAL_OUTPUT, _) => {
                warn!(name = %name, property, "Write to read-only property rejected");
                return false;
            }
            (XR_WIDTH | XR_HEIGHT | XR_REFRESH | XR_MODES | AR_MODE, _) => {
                warn!(name = %name, property, "Property write with wrong value type rejected");
                return false;
            }
            _ => return false,
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(name = %name, property, error = %e, "Rejected property write");
                false
            }
        }
    }

    /// Resize from signed property values, rejecting anything negative.
    fn resize_checked(&mut self, name: &str, w: i64, h: i64, r: i64) -> Result<(), VirtualOutputError> {
        let invalid = || VirtualOutputError::InvalidDimensions {
            width: w,
            height: h,
            refresh: r,
        };
        let w = u32::try_from(w).map_err(|_| invalid())?;
        let h = u32::try_from(h).map_err(|_| invalid())?;
        let r = u32::try_from(r).map_err(|_| invalid())?;
        self.resize_output(name, w, h, r)
    }

    /// Route an output callback to the control, virtual or real implementation.
    pub fn output_target(&mut self, output: OutputId) -> OutputTarget<'_> {
        if self.control.output_id() == Some(output) {
            return OutputTarget::Control(&mut self.control);
        }
        match self.registry.by_output_mut(output) {
            Some(vout) => OutputTarget::Virtual(vout),
            None => OutputTarget::Real(output),
        }
    }

    /// Route a CRTC callback to the virtual CRTC owning `crtc`, if any.
    pub fn crtc_target(&mut self, crtc: CrtcId) -> CrtcTarget<'_> {
        match self
            .registry
            .by_crtc_mut(crtc)
            .and_then(|vout| vout.crtc.as_mut())
        {
            Some(vcrtc) => CrtcTarget::Virtual(vcrtc),
            None => CrtcTarget::Real(crtc),
        }
    }

    pub fn display_info(&self, name: &str) -> Option<DisplayInfo> {
        self.registry.get(name).map(|vout| DisplayInfo {
            name: vout.name().to_string(),
            width: vout.width(),
            height: vout.height(),
            refresh: vout.refresh(),
            framebuffer_id: vout.framebuffer_id(),
        })
    }
}

impl<H, D, G> VirtualDisplayProvider for VirtualDisplayManager<H, D, G>
where
    H: HostDisplay + Send,
    D: BufferDevice + Send,
    G: GpuBufferManager + Send,
{
    fn create_displays(&mut self, configs: &[CreateRequest]) -> Result<Vec<DisplayInfo>> {
        configs
            .iter()
            .map(|req| {
                self.create_output(&req.name, req.width, req.height, req.refresh)
                    .with_context(|| format!("Failed to create virtual output {}", req.name))?;
                self.display_info(&req.name)
                    .with_context(|| format!("Virtual output {} vanished after creation", req.name))
            })
            .collect()
    }

    fn remove_all(&mut self) -> Result<()> {
        let removed = self.remove_all_outputs();
        info!(count = removed, "Removed all virtual outputs");
        if self.registry.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{} virtual outputs could not be removed", self.registry.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessBuffers, HeadlessGpu, HeadlessHost, HostOp};

    type TestManager = VirtualDisplayManager<HeadlessHost, HeadlessBuffers, HeadlessGpu>;

    fn manager() -> TestManager {
        VirtualDisplayManager::new(
            HeadlessHost::new(),
            HeadlessBuffers::new(),
            Some(HeadlessGpu::new()),
            &DriverConfig::default(),
        )
    }

    fn active() -> (TestManager, OutputId) {
        let mut m = manager();
        assert!(m.attach());
        let control = m.post_screen_init().unwrap();
        (m, control)
    }

    fn text(s: &str) -> PropertyValue {
        PropertyValue::String(s.to_string())
    }

    #[test]
    fn control_output_two_phase_init() {
        let mut m = manager();
        assert_eq!(m.state(), ControlState::Detached);
        assert!(m.post_screen_init().is_err());
        assert_eq!(m.host().live_outputs(), 0);

        assert!(m.attach());
        assert!(!m.attach());
        assert_eq!(m.state(), ControlState::Attached);
        assert_eq!(m.host().live_outputs(), 0);

        let first = m.post_screen_init().unwrap();
        let second = m.post_screen_init().unwrap();
        assert_eq!(first, second);
        assert_eq!(m.host().live_outputs(), 1);

        let control = m.host().output(first).unwrap();
        assert_eq!(control.name, "XR-Manager");
        assert_eq!(control.connection, Connection::Disconnected);
        assert!(control.traits.non_desktop);
        assert!(control.properties.contains_key(CREATE_XR_OUTPUT));
        assert!(control.properties.contains_key(DELETE_XR_OUTPUT));
    }

    #[test]
    fn failed_post_screen_init_stays_attached() {
        let mut m = manager();
        m.attach();
        m.host_mut().fail_on(HostOp::ConfigureProperty);
        assert!(m.post_screen_init().is_err());
        assert_eq!(m.state(), ControlState::Attached);
        assert_eq!(m.host().live_outputs(), 0);

        m.host_mut().clear_failures();
        assert!(m.post_screen_init().is_ok());
    }

    #[test]
    fn create_and_delete_commands() {
        let (mut m, control) = active();
        assert!(m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:1920:1080")));
        let vout = m.lookup("XR-0").unwrap();
        assert_eq!((vout.width(), vout.height(), vout.refresh()), (1920, 1080, 60));

        assert!(!m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:1280:720")));
        assert_eq!(m.lookup("XR-0").unwrap().width(), 1920);

        assert!(m.set_output_property(control, DELETE_XR_OUTPUT, &text("XR-0")));
        assert!(m.lookup("XR-0").is_none());
        assert!(!m.set_output_property(control, DELETE_XR_OUTPUT, &text("XR-0")));
    }

    #[test]
    fn malformed_and_foreign_writes_are_rejected() {
        let (mut m, control) = active();
        assert!(!m.set_output_property(control, CREATE_XR_OUTPUT, &text(":1920:1080")));
        assert!(!m.set_output_property(control, CREATE_XR_OUTPUT, &text("")));
        assert!(!m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:10:10")));
        assert!(!m.set_output_property(control, CREATE_XR_OUTPUT, &PropertyValue::Integer(1)));
        assert!(!m.set_output_property(control, "EDID", &text("XR-0:1920:1080")));
        assert!(m.outputs().next().is_none());
        // Only the control output exists on the host.
        assert_eq!(m.host().live_outputs(), 1);
    }

    #[test]
    fn commands_need_an_active_control_output() {
        let mut m = manager();
        m.attach();
        assert!(!m.handle_control_property(CREATE_XR_OUTPUT, &text("XR-0:1920:1080")));
        assert!(m.lookup("XR-0").is_none());
    }

    #[test]
    fn writes_to_unknown_outputs_fall_through() {
        let (mut m, _) = active();
        assert!(!m.set_output_property(OutputId(999), XR_WIDTH, &PropertyValue::Integer(640)));
        assert!(matches!(m.output_target(OutputId(999)), OutputTarget::Real(_)));
        assert!(matches!(m.crtc_target(CrtcId(999)), CrtcTarget::Real(_)));
    }

    #[test]
    fn per_output_properties_drive_resize() {
        let (mut m, control) = active();
        m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:1920:1080:60"));
        let out = m.lookup("XR-0").unwrap().output_id();

        assert!(m.set_output_property(out, XR_WIDTH, &PropertyValue::Integer(2560)));
        assert!(m.set_output_property(out, XR_HEIGHT, &PropertyValue::Integer(1440)));
        assert!(m.set_output_property(out, XR_REFRESH, &PropertyValue::Integer(90)));
        let vout = m.lookup("XR-0").unwrap();
        assert_eq!((vout.width(), vout.height(), vout.refresh()), (2560, 1440, 90));

        assert!(!m.set_output_property(out, XR_WIDTH, &PropertyValue::Integer(-5)));
        assert!(!m.set_output_property(out, XR_HEIGHT, &PropertyValue::Integer(20000)));
        assert!(!m.set_output_property(out, FRAMEBUFFER_ID, &PropertyValue::Integer(1)));
        assert!(!m.set_output_property(out, XR_WIDTH, &text("2560")));
        assert_eq!(m.lookup("XR-0").unwrap().width(), 2560);
    }

    #[test]
    fn ar_mode_reads_from_cache() {
        let (mut m, control) = active();
        m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:1920:1080"));
        let out = m.lookup("XR-0").unwrap().output_id();

        assert_eq!(m.output_property(out, AR_MODE), Some(PropertyValue::Integer(0)));
        assert!(m.set_output_property(out, AR_MODE, &PropertyValue::Integer(1)));
        assert_eq!(m.output_property(out, AR_MODE), Some(PropertyValue::Integer(1)));
        assert_eq!(
            m.host().property(out, AR_MODE),
            Some(PropertyValue::Integer(1))
        );
        assert_eq!(m.output_property(control, CREATE_XR_OUTPUT), None);
    }

    #[test]
    fn detach_tears_everything_down() {
        let (mut m, control) = active();
        m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-0:1920:1080"));
        m.set_output_property(control, CREATE_XR_OUTPUT, &text("XR-1:1280:720"));
        m.detach();

        assert_eq!(m.state(), ControlState::Detached);
        assert!(m.outputs().next().is_none());
        assert_eq!(m.host().live_outputs(), 0);
        assert_eq!(m.host().live_crtcs(), 0);
        assert_eq!(m.host().live_pixmaps(), 0);
        assert_eq!(m.device().live_framebuffers(), 0);
        assert_eq!(m.gpu().unwrap().live_bos(), 0);

        // A detached manager can be attached again.
        assert!(m.attach());
        assert!(m.post_screen_init().is_ok());
    }

    #[test]
    fn provider_creates_and_removes_in_batch() {
        let (mut m, _) = active();
        let infos = m
            .create_displays(&[
                CreateRequest {
                    name: "XR-0".into(),
                    width: 1920,
                    height: 1080,
                    refresh: 60,
                },
                CreateRequest {
                    name: "XR-1".into(),
                    width: 3840,
                    height: 2160,
                    refresh: 30,
                },
            ])
            .unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].refresh, 30);
        assert!(infos.iter().all(|i| i.framebuffer_id != 0));

        m.remove_all().unwrap();
        assert!(m.outputs().next().is_none());
    }
}
