use crate::host::{CrtcId, OutputId};
use crate::output::VirtualOutput;
use std::collections::HashMap;

/// Live virtual outputs by name, with reverse indices by host output and
/// host CRTC.
///
/// The indices are only touched by `insert` and `remove`, which keep them in
/// step; nothing else may change the ids of a registered output.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    outputs: HashMap<String, VirtualOutput>,
    by_output: HashMap<OutputId, String>,
    by_crtc: HashMap<CrtcId, String>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    /// Add an output. Gives it back if the name is empty or taken.
    pub fn insert(&mut self, output: VirtualOutput) -> Result<(), VirtualOutput> {
        if output.name().is_empty() || self.outputs.contains_key(output.name()) {
            return Err(output);
        }
        self.by_output
            .insert(output.output_id(), output.name().to_string());
        if let Some(crtc) = output.crtc_id() {
            self.by_crtc.insert(crtc, output.name().to_string());
        }
        self.outputs.insert(output.name().to_string(), output);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<VirtualOutput> {
        let output = self.outputs.remove(name)?;
        self.by_output.remove(&output.output_id());
        if let Some(crtc) = output.crtc_id() {
            self.by_crtc.remove(&crtc);
        }
        Some(output)
    }

    pub fn get(&self, name: &str) -> Option<&VirtualOutput> {
        self.outputs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut VirtualOutput> {
        self.outputs.get_mut(name)
    }

    pub fn by_crtc(&self, crtc: CrtcId) -> Option<&VirtualOutput> {
        self.by_crtc.get(&crtc).and_then(|name| self.outputs.get(name))
    }

    pub fn by_crtc_mut(&mut self, crtc: CrtcId) -> Option<&mut VirtualOutput> {
        let name = self.by_crtc.get(&crtc)?;
        self.outputs.get_mut(name)
    }

    pub fn by_output(&self, output: OutputId) -> Option<&VirtualOutput> {
        self.by_output
            .get(&output)
            .and_then(|name| self.outputs.get(name))
    }

    pub fn by_output_mut(&mut self, output: OutputId) -> Option<&mut VirtualOutput> {
        let name = self.by_output.get(&output)?;
        self.outputs.get_mut(name)
    }

    pub fn name_of_output(&self, output: OutputId) -> Option<String> {
        self.by_output.get(&output).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualOutput> {
        self.outputs.values()
    }

    /// Names in sorted order, for stable teardown and listing.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crtc::VirtualCrtc;
    use crate::mode::{ModeList, ModeSpec};

    fn output(name: &str, id: u32, crtc: Option<u32>) -> VirtualOutput {
        let mut out = VirtualOutput::new(
            name,
            OutputId(id),
            ModeSpec::new(1920, 1080, 60),
            ModeList::default(),
        );
        let mut vcrtc = VirtualCrtc::new();
        if let Some(c) = crtc {
            vcrtc.bind(CrtcId(c));
        }
        out.crtc = Some(vcrtc);
        out
    }

    #[test]
    fn lookup_by_name_and_crtc() {
        let mut reg = OutputRegistry::new();
        reg.insert(output("XR-0", 1, Some(10))).unwrap();
        reg.insert(output("XR-1", 2, None)).unwrap();

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.by_crtc(CrtcId(10)).map(VirtualOutput::name), Some("XR-0"));
        assert_eq!(reg.by_output(OutputId(2)).map(VirtualOutput::name), Some("XR-1"));
        assert!(reg.by_crtc(CrtcId(11)).is_none());
    }

    #[test]
    fn duplicate_and_empty_names_are_refused() {
        let mut reg = OutputRegistry::new();
        reg.insert(output("XR-0", 1, Some(10))).unwrap();
        let back = reg.insert(output("XR-0", 2, Some(11))).unwrap_err();
        assert_eq!(back.output_id(), OutputId(2));
        assert!(reg.insert(output("", 3, None)).is_err());
        assert_eq!(reg.len(), 1);
        assert!(reg.by_crtc(CrtcId(11)).is_none());
        // The refused output left no trace in the indices.
        assert!(reg.by_output(OutputId(2)).is_none());
        assert!(reg.name_of_output(OutputId(3)).is_none());
        assert_eq!(reg.name_of_output(OutputId(1)).as_deref(), Some("XR-0"));
    }

    #[test]
    fn remove_drops_every_index() {
        let mut reg = OutputRegistry::new();
        reg.insert(output("XR-0", 1, Some(10))).unwrap();
        reg.by_output_mut(OutputId(1)).unwrap().set_ar_mode(true);
        let removed = reg.remove("XR-0").unwrap();
        assert_eq!(removed.name(), "XR-0");
        assert!(removed.ar_mode());
        assert!(reg.is_empty());
        assert!(reg.by_crtc_mut(CrtcId(10)).is_none());
        assert!(reg.by_output(OutputId(1)).is_none());
        assert!(reg.name_of_output(OutputId(1)).is_none());
        assert!(reg.remove("XR-0").is_none());

        // A new output may reuse the host id of a removed one.
        reg.insert(output("XR-1", 1, None)).unwrap();
        assert_eq!(reg.by_output(OutputId(1)).map(VirtualOutput::name), Some("XR-1"));
    }
}
