//! Line commands for driving the manager from a terminal.

use anyhow::{anyhow, bail, Context, Result};
use xreal_vdisplay::crtc::DpmsMode;
use xreal_vdisplay::host::PropertyValue;
use xreal_vdisplay::protocol::{CREATE_XR_OUTPUT, DELETE_XR_OUTPUT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write to a control output property.
    Control { property: &'static str, value: String },
    /// Write to a virtual output property.
    Set {
        output: String,
        property: String,
        value: PropertyValue,
    },
    Modeset { output: String, index: usize },
    Dpms { output: String, mode: DpmsMode },
    List,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  CREATE_XR_OUTPUT NAME:WIDTH:HEIGHT[:REFRESH]
  DELETE_XR_OUTPUT NAME
  set OUTPUT PROPERTY VALUE
  modeset OUTPUT INDEX
  dpms OUTPUT on|off
  list
  quit";

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match word {
        CREATE_XR_OUTPUT => Command::Control {
            property: CREATE_XR_OUTPUT,
            value: rest.to_string(),
        },
        DELETE_XR_OUTPUT => Command::Control {
            property: DELETE_XR_OUTPUT,
            value: rest.to_string(),
        },
        "set" => {
            let mut args = rest.splitn(3, char::is_whitespace);
            let output = args.next().filter(|s| !s.is_empty());
            let property = args.next();
            let value = args.next().map(str::trim);
            let (Some(output), Some(property), Some(value)) = (output, property, value) else {
                bail!("usage: set OUTPUT PROPERTY VALUE");
            };
            // Numbers go out as integers, anything else as a string.
            let value = match value.parse::<i32>() {
                Ok(v) => PropertyValue::Integer(v),
                Err(_) => PropertyValue::String(value.to_string()),
            };
            Command::Set {
                output: output.to_string(),
                property: property.to_string(),
                value,
            }
        }
        "modeset" => {
            let (output, index) = two_args(rest, "modeset OUTPUT INDEX")?;
            let index = index
                .parse()
                .with_context(|| format!("Invalid mode index {index:?}"))?;
            Command::Modeset {
                output: output.to_string(),
                index,
            }
        }
        "dpms" => {
            let (output, state) = two_args(rest, "dpms OUTPUT on|off")?;
            let mode = match state {
                "on" => DpmsMode::On,
                "off" => DpmsMode::Off,
                "standby" => DpmsMode::Standby,
                "suspend" => DpmsMode::Suspend,
                other => bail!("Unknown power state {other:?}"),
            };
            Command::Dpms {
                output: output.to_string(),
                mode,
            }
        }
        "list" => Command::List,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(anyhow!("Unknown command {other:?} (try `help`)")),
    };
    Ok(Some(command))
}

fn two_args<'a>(rest: &'a str, usage: &str) -> Result<(&'a str, &'a str)> {
    let mut args = rest.split_whitespace();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => bail!("usage: {usage}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_commands_keep_their_value() {
        assert_eq!(
            parse_line("CREATE_XR_OUTPUT XR-0:1920:1080:90").unwrap(),
            Some(Command::Control {
                property: CREATE_XR_OUTPUT,
                value: "XR-0:1920:1080:90".into()
            })
        );
        // An empty value is passed through; the manager rejects it.
        assert_eq!(
            parse_line("DELETE_XR_OUTPUT").unwrap(),
            Some(Command::Control {
                property: DELETE_XR_OUTPUT,
                value: String::new()
            })
        );
    }

    #[test]
    fn set_picks_value_type() {
        assert_eq!(
            parse_line("set XR-0 XR_WIDTH 2560").unwrap(),
            Some(Command::Set {
                output: "XR-0".into(),
                property: "XR_WIDTH".into(),
                value: PropertyValue::Integer(2560)
            })
        );
        assert_eq!(
            parse_line("set XR-0 XR_MODES 640:480:60|800:600:75").unwrap(),
            Some(Command::Set {
                output: "XR-0".into(),
                property: "XR_MODES".into(),
                value: PropertyValue::String("640:480:60|800:600:75".into())
            })
        );
        assert!(parse_line("set XR-0 XR_WIDTH").is_err());
    }

    #[test]
    fn modeset_and_dpms() {
        assert_eq!(
            parse_line("modeset XR-0 2").unwrap(),
            Some(Command::Modeset {
                output: "XR-0".into(),
                index: 2
            })
        );
        assert!(parse_line("modeset XR-0 two").is_err());
        assert_eq!(
            parse_line("dpms XR-0 off").unwrap(),
            Some(Command::Dpms {
                output: "XR-0".into(),
                mode: DpmsMode::Off
            })
        );
        assert!(parse_line("dpms XR-0 dim").is_err());
    }

    #[test]
    fn blanks_comments_and_unknowns() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# setup").unwrap(), None);
        assert_eq!(parse_line("quit").unwrap(), Some(Command::Quit));
        assert!(parse_line("frobnicate").is_err());
    }
}
