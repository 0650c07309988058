mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides the config file location when set.
pub const CONFIG_ENV: &str = "XREAL_VOUT_CONFIG";

/// Color depths the buffer path can back.
const SUPPORTED_DEPTHS: [u32; 4] = [15, 16, 24, 30];

/// `$XREAL_VOUT_CONFIG`, or `$XDG_CONFIG_HOME/xreal-vout/config.toml`.
/// Nothing is created on disk.
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("xreal-vout").join("config.toml"))
}

pub fn load_config() -> Result<DriverConfig> {
    load_config_from(&config_path()?)
}

/// Read and check a config file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<DriverConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(?path, "No config found, using defaults");
            return Ok(DriverConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let config: DriverConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    check(&config).with_context(|| format!("Invalid config in {}", path.display()))?;
    info!(?path, startup = config.startup.len(), "Loaded config");
    Ok(config)
}

pub fn save_config(config: &DriverConfig) -> Result<()> {
    save_config_to(config, &config_path()?)
}

/// Write `config` to `path`, creating its directory first.
pub fn save_config_to(config: &DriverConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(?path, "Saved config");
    Ok(())
}

/// Reject values no output could be built from. Per-output bounds are left
/// to the manager.
fn check(config: &DriverConfig) -> Result<()> {
    if !SUPPORTED_DEPTHS.contains(&config.display.depth) {
        bail!("Unsupported color depth {}", config.display.depth);
    }
    let outputs = &config.outputs;
    if outputs.manager_name.is_empty() {
        bail!("outputs.manager_name must not be empty");
    }
    if outputs.fallback_widths.is_empty() || outputs.fallback_heights.is_empty() {
        bail!("Fallback mode set must have at least one width and one height");
    }
    if let Some(s) = config.startup.iter().find(|s| s.name == outputs.manager_name) {
        bail!("Startup output {:?} uses the control output's name", s.name);
    }
    debug!(depth = config.display.depth, "Config checked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("xreal-vout-{}-{name}", std::process::id()))
            .join("config.toml")
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = scratch("missing");
        assert_eq!(load_config_from(&path).unwrap(), DriverConfig::default());
        assert!(!path.exists());
    }

    #[test]
    fn save_creates_directory_and_reloads() {
        let path = scratch("saved");
        let mut config = DriverConfig::default();
        config.outputs.eager_resize = true;
        config.startup.push(StartupOutput {
            name: "XR-0".into(),
            width: 2560,
            height: 1440,
            refresh: Some(90),
        });

        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn bad_files_are_errors() {
        let path = scratch("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, "[display\ndepth = 24").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse"));

        std::fs::write(&path, "[display]\ndepth = 8").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Unsupported color depth 8"));

        std::fs::write(&path, "[outputs]\nfallback_heights = []").unwrap();
        assert!(load_config_from(&path).is_err());

        std::fs::write(
            &path,
            "[[startup]]\nname = \"XR-Manager\"\nwidth = 1920\nheight = 1080",
        )
        .unwrap();
        assert!(load_config_from(&path).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
