//! Virtual output create / delete / resize and the mode-set path.

use crate::buffer::{BufferDevice, GpuBufferManager};
use crate::crtc::{CrtcFuncs, DpmsMode, Rotation, VirtualCrtc};
use crate::error::VirtualOutputError;
use crate::framebuffer::{BufferContext, FramebufferAllocator};
use crate::host::{
    Connection, CrtcId, HostDisplay, OutputId, PropertyAccess, PropertySpec, PropertyValue,
};
use crate::manager::{ControlState, VirtualDisplayManager};
use crate::mode::{build_mode_list, ModeDescriptor, ModeSpec};
use crate::output::{ModeStatus, OutputFuncs, VirtualOutput, VIRTUAL_OUTPUT_TRAITS};
use crate::protocol::{
    parse_mode_list, ParseError, AR_MODE, FRAMEBUFFER_ID, VIRTUAL_OUTPUT, XR_HEIGHT, XR_MODES,
    XR_REFRESH, XR_WIDTH,
};
use tracing::{debug, error, info, warn};

/// Properties every virtual output carries from creation on.
const OUTPUT_PROPERTIES: [(&str, PropertySpec); 6] = [
    (XR_WIDTH, PropertySpec::integer(PropertyAccess::ReadWrite)),
    (XR_HEIGHT, PropertySpec::integer(PropertyAccess::ReadWrite)),
    (XR_REFRESH, PropertySpec::integer(PropertyAccess::ReadWrite)),
    (XR_MODES, PropertySpec::string(PropertyAccess::WriteOnly)),
    (FRAMEBUFFER_ID, PropertySpec::integer(PropertyAccess::ReadOnly)),
    (AR_MODE, PropertySpec::integer(PropertyAccess::ReadWrite)),
];

fn int(v: u32) -> PropertyValue {
    PropertyValue::Integer(i32::try_from(v).unwrap_or(i32::MAX))
}

/// Set a property value on the host. Failures are logged, never fatal.
fn publish(
    host: &mut dyn HostDisplay,
    output: OutputId,
    name: &str,
    property: &'static str,
    value: PropertyValue,
) {
    if let Err(source) = host.change_property(output, property, value) {
        let e = VirtualOutputError::Property {
            name: name.to_string(),
            property,
            source,
        };
        warn!(error = %e, "Property update failed");
    }
}

fn configure(
    host: &mut dyn HostDisplay,
    output: OutputId,
    name: &str,
    property: &'static str,
    spec: PropertySpec,
) -> bool {
    match host.configure_property(output, property, spec) {
        Ok(()) => true,
        Err(source) => {
            let e = VirtualOutputError::Property {
                name: name.to_string(),
                property,
                source,
            };
            warn!(error = %e, "Property configuration failed");
            false
        }
    }
}

fn publish_dimensions(host: &mut dyn HostDisplay, vout: &VirtualOutput) {
    let (output, name) = (vout.output_id(), vout.name());
    publish(host, output, name, XR_WIDTH, int(vout.width()));
    publish(host, output, name, XR_HEIGHT, int(vout.height()));
    publish(host, output, name, XR_REFRESH, int(vout.refresh()));
}

fn publish_framebuffer(host: &mut dyn HostDisplay, vout: &VirtualOutput) {
    publish(
        host,
        vout.output_id(),
        vout.name(),
        FRAMEBUFFER_ID,
        int(vout.framebuffer_id()),
    );
}

/// Hand the output's whole mode list to the host in one batch.
fn register_modes(host: &mut dyn HostDisplay, vout: &VirtualOutput) {
    let modes = vout.modes();
    if let Err(e) = host.set_modes(vout.output_id(), &modes.modes, modes.preferred) {
        warn!(name = %vout.name(), error = %e, "Mode list registration failed");
    }
}

/// Release everything an output owns, in dependency order.
fn teardown(cx: &mut BufferContext<'_>, allocator: &FramebufferAllocator, mut vout: VirtualOutput) {
    let output = vout.output_id();
    if let Some(fb) = vout.framebuffer.take() {
        allocator.release(cx, fb);
    }
    if let Some(crtc) = vout.crtc.take() {
        // Clients must see the output go away before its CRTC does.
        cx.host.set_connection(output, Connection::Disconnected);
        cx.host.output_changed(output, true);
        if let Some(id) = crtc.host_id() {
            cx.host.destroy_crtc(id);
        }
    }
    cx.host.destroy_output(output);
}

/// Bring the framebuffer in line with `mode`, then commit the mode to the CRTC.
///
/// Modes the output does not accept are refused before anything is touched.
/// A failed reallocation is logged and the mode still goes through; the
/// output then has no framebuffer and publishes id 0.
fn apply_mode(
    cx: &mut BufferContext<'_>,
    allocator: &FramebufferAllocator,
    vout: &mut VirtualOutput,
    mode: &ModeDescriptor,
    rotation: Rotation,
    x: i32,
    y: i32,
) -> bool {
    let status = vout.mode_valid(mode);
    if status != ModeStatus::Ok {
        warn!(name = %vout.name(), mode = %mode.name, ?status, "Rejected mode set");
        return false;
    }

    if vout.framebuffer_mismatch(mode) {
        let (width, height) = mode.size();
        match allocator.reallocate(cx, &mut vout.framebuffer, width, height) {
            Ok(()) => debug!(
                name = %vout.name(),
                width,
                height,
                fb = vout.framebuffer_id(),
                "Framebuffer reallocated for mode set"
            ),
            Err(e) => warn!(
                name = %vout.name(),
                width,
                height,
                error = %e,
                "Framebuffer reallocation failed, continuing mode set without one"
            ),
        }
        publish_framebuffer(&mut *cx.host, vout);
    }

    match vout.crtc.as_mut() {
        Some(crtc) => crtc.set_mode_major(mode, rotation, x, y),
        None => false,
    }
}

impl<H, D, G> VirtualDisplayManager<H, D, G>
where
    H: HostDisplay,
    D: BufferDevice,
    G: GpuBufferManager,
{
    /// Create a virtual output and register it.
    ///
    /// Host output, mode list, CRTC and framebuffer are set up in that order.
    /// Failing to create the host output or its CRTC rolls everything back;
    /// properties, activation and the framebuffer are best effort.
    pub fn create_output(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        refresh: u32,
    ) -> Result<OutputId, VirtualOutputError> {
        let state = self.control.state();
        if !matches!(state, ControlState::Active { .. }) {
            return Err(VirtualOutputError::NotActive(state.label()));
        }
        if name.is_empty() {
            return Err(ParseError::EmptyName.into());
        }
        if self.registry.contains(name) || name == self.control.name() {
            warn!(name, "Output name already taken");
            return Err(VirtualOutputError::DuplicateName(name.to_string()));
        }
        let spec = ModeSpec::new(width, height, refresh);
        if let Err(e) = spec.validate() {
            warn!(name, error = %e, "Rejected virtual output");
            return Err(e);
        }

        let output = self
            .host
            .create_output(name, &VIRTUAL_OUTPUT_TRAITS)
            .map_err(|e| {
                error!(name, error = %e, "Failed to create host output");
                VirtualOutputError::allocation(name, e)
            })?;

        let modes = match build_mode_list(spec, &[], &self.policy.fallback) {
            Ok(modes) => modes,
            Err(e) => {
                error!(name, error = %e, "Mode synthesis failed");
                self.host.destroy_output(output);
                return Err(VirtualOutputError::allocation(name, e));
            }
        };
        let mut vout = VirtualOutput::new(name, output, spec, modes);
        vout.create_resources();
        self.host.set_connection(output, vout.detect());
        register_modes(&mut self.host, &vout);

        for (property, prop_spec) in OUTPUT_PROPERTIES {
            configure(&mut self.host, output, name, property, prop_spec);
        }
        publish_dimensions(&mut self.host, &vout);
        publish(&mut self.host, output, name, AR_MODE, PropertyValue::Integer(0));

        let mut crtc = VirtualCrtc::new();
        if self.host.screen_resources_ready() {
            let id = match self.host.create_crtc() {
                Ok(id) => id,
                Err(e) => {
                    error!(name, error = %e, "Failed to create host CRTC");
                    self.host.destroy_output(output);
                    return Err(VirtualOutputError::allocation(name, e));
                }
            };
            if let Err(e) = self.host.set_possible_crtcs(output, &[id]) {
                error!(name, error = %e, "Failed to bind host CRTC");
                self.host.destroy_crtc(id);
                self.host.destroy_output(output);
                return Err(VirtualOutputError::allocation(name, e));
            }
            crtc.bind(id);

            if configure(
                &mut self.host,
                output,
                name,
                VIRTUAL_OUTPUT,
                PropertySpec::integer(PropertyAccess::ReadOnly),
            ) {
                publish(&mut self.host, output, name, VIRTUAL_OUTPUT, PropertyValue::Integer(1));
            }

            if let Some(mode) = vout.modes().preferred_mode().cloned() {
                match self.host.activate(id, output, &mode) {
                    Ok(()) => {
                        crtc.set_mode_major(&mode, Rotation::ROTATE_0, 0, 0);
                    }
                    Err(e) => warn!(name, mode = %mode.name, error = %e, "Automatic activation failed"),
                }
            }
        } else {
            debug!(name, "Screen resources not ready, output has no host CRTC");
        }
        vout.crtc = Some(crtc);

        let (mut cx, registry, allocator) = self.parts();
        match allocator.allocate(&mut cx, width, height) {
            Ok(fb) => vout.framebuffer = Some(fb),
            Err(e) => warn!(name, width, height, error = %e, "Framebuffer allocation failed, output has none"),
        }
        publish_framebuffer(&mut *cx.host, &vout);

        let framebuffer_id = vout.framebuffer_id();
        if let Err(vout) = registry.insert(vout) {
            teardown(&mut cx, allocator, vout);
            return Err(VirtualOutputError::DuplicateName(name.to_string()));
        }
        cx.host.output_changed(output, true);

        info!(name, width, height, refresh, fb = framebuffer_id, "Created virtual output");
        Ok(output)
    }

    /// Unregister an output and release everything it owns.
    pub fn delete_output(&mut self, name: &str) -> Result<(), VirtualOutputError> {
        let (mut cx, registry, allocator) = self.parts();
        let Some(vout) = registry.remove(name) else {
            warn!(name, "Cannot delete unknown virtual output");
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        teardown(&mut cx, allocator, vout);
        info!(name, "Deleted virtual output");
        Ok(())
    }

    /// Change an output's current mode.
    ///
    /// Only metadata changes here: the framebuffer follows at the next mode
    /// set on the output's CRTC, unless eager resizing is configured.
    pub fn resize_output(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        refresh: u32,
    ) -> Result<(), VirtualOutputError> {
        let spec = ModeSpec::new(width, height, refresh);
        if !self.registry.contains(name) {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        }
        spec.validate()?;

        let eager = self.policy.eager_resize;
        let fallback = self.policy.fallback.clone();
        let (mut cx, registry, allocator) = self.parts();
        let Some(vout) = registry.get_mut(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };

        let modes = build_mode_list(spec, vout.custom_modes(), &fallback)
            .map_err(|e| VirtualOutputError::allocation(name, e))?;
        vout.set_current(spec);
        vout.set_modes(modes);
        register_modes(&mut *cx.host, vout);
        publish_dimensions(&mut *cx.host, vout);

        let fb_size = vout.framebuffer().map(|fb| (fb.width(), fb.height()));
        if eager && fb_size != Some((width, height)) {
            if let Err(e) = allocator.reallocate(&mut cx, &mut vout.framebuffer, width, height) {
                warn!(name, width, height, error = %e, "Eager framebuffer resize failed");
            }
            publish_framebuffer(&mut *cx.host, vout);
        }

        cx.host.output_changed(vout.output_id(), true);
        info!(name, mode = %spec, "Resized virtual output");
        Ok(())
    }

    /// Replace the custom mode list from `W:H:R|W:H:R|...`.
    ///
    /// Malformed and out-of-bounds entries are skipped. An empty value
    /// clears the list; a value with no usable entry leaves it alone.
    /// Returns the number of modes accepted.
    pub fn set_custom_modes(&mut self, name: &str, value: &str) -> Result<usize, VirtualOutputError> {
        if !self.registry.contains(name) {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        }
        let parsed = parse_mode_list(value);
        for entry in &parsed.skipped {
            debug!(name, entry = %entry, "Skipping invalid custom mode");
        }
        if parsed.modes.is_empty() && !parsed.skipped.is_empty() {
            warn!(name, value, "No usable entry in custom mode list, keeping current modes");
            return Ok(0);
        }

        let accepted = parsed.modes.len();
        self.replace_custom_modes(name, parsed.modes)?;
        info!(name, accepted, skipped = parsed.skipped.len(), "Custom modes updated");
        Ok(accepted)
    }

    /// Add one user mode unless an identical one is present.
    /// Returns whether the list changed.
    pub fn add_mode(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        refresh: u32,
    ) -> Result<bool, VirtualOutputError> {
        let spec = ModeSpec::new(width, height, refresh);
        let Some(vout) = self.registry.get(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        spec.validate()?;
        if vout.custom_modes().contains(&spec) {
            return Ok(false);
        }
        let mut modes = vout.custom_modes().to_vec();
        modes.push(spec);
        self.replace_custom_modes(name, modes)?;
        debug!(name, mode = %spec, "Added custom mode");
        Ok(true)
    }

    fn replace_custom_modes(&mut self, name: &str, custom: Vec<ModeSpec>) -> Result<(), VirtualOutputError> {
        let fallback = &self.policy.fallback;
        let Some(vout) = self.registry.get_mut(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        let modes = build_mode_list(vout.current(), &custom, fallback)
            .map_err(|e| VirtualOutputError::allocation(name, e))?;
        vout.set_custom_modes(custom);
        vout.set_modes(modes);
        register_modes(&mut self.host, vout);
        self.host.output_changed(vout.output_id(), true);
        Ok(())
    }

    /// Set the AR flag. The cached flag answers reads.
    pub fn set_ar_mode(&mut self, name: &str, enabled: bool) -> Result<(), VirtualOutputError> {
        let Some(vout) = self.registry.get_mut(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        vout.set_ar_mode(enabled);
        publish(
            &mut self.host,
            vout.output_id(),
            name,
            AR_MODE,
            PropertyValue::Integer(i32::from(enabled)),
        );
        debug!(name, enabled, "AR mode changed");
        Ok(())
    }

    /// Host mode-set callback for a CRTC. Returns false for CRTCs that are
    /// not virtual or that refused the mode.
    pub fn crtc_set_mode_major(
        &mut self,
        crtc: CrtcId,
        mode: &ModeDescriptor,
        rotation: Rotation,
        x: i32,
        y: i32,
    ) -> bool {
        let (mut cx, registry, allocator) = self.parts();
        match registry.by_crtc_mut(crtc) {
            Some(vout) => apply_mode(&mut cx, allocator, vout, mode, rotation, x, y),
            None => {
                debug!(?crtc, "Mode set on a CRTC without a virtual output");
                false
            }
        }
    }

    /// Switch an output to entry `index` of its mode list, as a client
    /// would through the host.
    pub fn set_output_mode(&mut self, name: &str, index: usize) -> Result<(), VirtualOutputError> {
        let (mut cx, registry, allocator) = self.parts();
        let Some(vout) = registry.get_mut(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        let Some(mode) = vout.modes().modes.get(index).cloned() else {
            return Err(VirtualOutputError::NoSuchMode {
                name: name.to_string(),
                index,
            });
        };

        if let Some(crtc) = vout.crtc_id() {
            cx.host
                .activate(crtc, vout.output_id(), &mode)
                .map_err(|source| VirtualOutputError::Activation {
                    name: name.to_string(),
                    source,
                })?;
        }
        let (rotation, (x, y)) = vout
            .crtc()
            .map_or((Rotation::ROTATE_0, (0, 0)), |c| (c.rotation(), c.position()));
        apply_mode(&mut cx, allocator, vout, &mode, rotation, x, y);
        info!(name, mode = %mode.name, fb = vout.framebuffer_id(), "Mode set");
        Ok(())
    }

    /// Power state change for an output and its CRTC.
    pub fn set_output_dpms(&mut self, name: &str, mode: DpmsMode) -> Result<(), VirtualOutputError> {
        let Some(vout) = self.registry.get_mut(name) else {
            return Err(VirtualOutputError::NotFound(name.to_string()));
        };
        OutputFuncs::dpms(vout, mode);
        if let Some(crtc) = vout.crtc.as_mut() {
            CrtcFuncs::dpms(crtc, mode);
        }
        Ok(())
    }
}
