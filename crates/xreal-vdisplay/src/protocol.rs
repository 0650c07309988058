//! Text commands carried in output properties.
//!
//! The control output takes `CREATE_XR_OUTPUT = "NAME:WIDTH:HEIGHT[:REFRESH]"`
//! and `DELETE_XR_OUTPUT = "NAME"`. Virtual outputs take a mode list in
//! `XR_MODES = "W:H:R|W:H:R|..."`.

use crate::mode::ModeSpec;
use thiserror::Error;

/// Control output: create a virtual output.
pub const CREATE_XR_OUTPUT: &str = "CREATE_XR_OUTPUT";
/// Control output: delete a virtual output.
pub const DELETE_XR_OUTPUT: &str = "DELETE_XR_OUTPUT";

pub const XR_WIDTH: &str = "XR_WIDTH";
pub const XR_HEIGHT: &str = "XR_HEIGHT";
pub const XR_REFRESH: &str = "XR_REFRESH";
pub const XR_MODES: &str = "XR_MODES";
pub const FRAMEBUFFER_ID: &str = "FRAMEBUFFER_ID";
pub const VIRTUAL_OUTPUT: &str = "VIRTUAL_OUTPUT";
pub const AR_MODE: &str = "AR_MODE";

pub const DEFAULT_REFRESH: u32 = 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Missing output name")]
    EmptyName,
    #[error("Missing {0}")]
    MissingField(&'static str),
    #[error("{field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Unexpected trailing fields: {0:?}")]
    TrailingFields(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Create(CreateRequest),
    Delete(String),
}

/// Property strings may arrive NUL-padded from fixed-size client buffers.
fn clean(value: &str) -> &str {
    value.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

fn number(field: &'static str, raw: Option<&str>) -> Result<u32, ParseError> {
    let raw = raw.map(str::trim).ok_or(ParseError::MissingField(field))?;
    if raw.is_empty() {
        return Err(ParseError::MissingField(field));
    }
    raw.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

/// Parse `NAME:WIDTH:HEIGHT[:REFRESH]`. Bounds are checked at creation.
pub fn parse_create(value: &str, default_refresh: u32) -> Result<CreateRequest, ParseError> {
    let value = clean(value);
    let mut fields = value.splitn(5, ':');

    let name = fields.next().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }
    let width = number("width", fields.next())?;
    let height = number("height", fields.next())?;
    let refresh = match fields.next() {
        Some(raw) => number("refresh", Some(raw))?,
        None => default_refresh,
    };
    if let Some(rest) = fields.next() {
        return Err(ParseError::TrailingFields(rest.to_string()));
    }

    Ok(CreateRequest {
        name: name.to_string(),
        width,
        height,
        refresh,
    })
}

/// Parse `NAME`.
pub fn parse_delete(value: &str) -> Result<&str, ParseError> {
    let name = clean(value);
    if name.is_empty() {
        Err(ParseError::EmptyName)
    } else {
        Ok(name)
    }
}

/// Route a control-output property write. `None` means the property is not
/// a control command and should fall through to default handling.
pub fn parse_command(
    property: &str,
    value: &str,
    default_refresh: u32,
) -> Option<Result<ControlCommand, ParseError>> {
    match property {
        CREATE_XR_OUTPUT => Some(parse_create(value, default_refresh).map(ControlCommand::Create)),
        DELETE_XR_OUTPUT => {
            Some(parse_delete(value).map(|name| ControlCommand::Delete(name.to_string())))
        }
        _ => None,
    }
}

/// Result of parsing an `XR_MODES` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeListParse {
    pub modes: Vec<ModeSpec>,
    /// Entries dropped as malformed or out of bounds.
    pub skipped: Vec<String>,
}

/// Parse `W:H:R|W:H:R|...`, keeping only well-formed in-bounds entries.
pub fn parse_mode_list(value: &str) -> ModeListParse {
    let mut parsed = ModeListParse::default();

    for entry in clean(value).split('|').map(str::trim) {
        if entry.is_empty() {
            continue;
        }
        match parse_mode_entry(entry) {
            Some(spec) if spec.validate().is_ok() => parsed.modes.push(spec),
            _ => parsed.skipped.push(entry.to_string()),
        }
    }

    parsed
}

fn parse_mode_entry(entry: &str) -> Option<ModeSpec> {
    let mut fields = entry.split(':').map(str::trim);
    let width = fields.next()?.parse().ok()?;
    let height = fields.next()?.parse().ok()?;
    let refresh = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(ModeSpec::new(width, height, refresh))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_defaults_refresh() {
        let req = parse_create("XR-0:1920:1080", DEFAULT_REFRESH).unwrap();
        assert_eq!(req.name, "XR-0");
        assert_eq!((req.width, req.height, req.refresh), (1920, 1080, 60));
    }

    #[test]
    fn create_with_refresh() {
        let req = parse_create("XR-0:1920:1080:90", DEFAULT_REFRESH).unwrap();
        assert_eq!(req.refresh, 90);
    }

    #[test]
    fn create_tolerates_padding() {
        let req = parse_create(" XR-1:2560:1440:120\0\0", DEFAULT_REFRESH).unwrap();
        assert_eq!(req.name, "XR-1");
        assert_eq!(req.refresh, 120);
    }

    #[test]
    fn create_rejects_missing_name() {
        assert_eq!(parse_create("", DEFAULT_REFRESH), Err(ParseError::EmptyName));
        assert_eq!(
            parse_create(":1920:1080", DEFAULT_REFRESH),
            Err(ParseError::EmptyName)
        );
    }

    #[test]
    fn create_rejects_bad_fields() {
        assert_eq!(
            parse_create("XR-0", DEFAULT_REFRESH),
            Err(ParseError::MissingField("width"))
        );
        assert_eq!(
            parse_create("XR-0:1920", DEFAULT_REFRESH),
            Err(ParseError::MissingField("height"))
        );
        assert!(matches!(
            parse_create("XR-0:wide:1080", DEFAULT_REFRESH),
            Err(ParseError::InvalidNumber { field: "width", .. })
        ));
        assert!(matches!(
            parse_create("XR-0:1920:1080:60:extra", DEFAULT_REFRESH),
            Err(ParseError::TrailingFields(_))
        ));
    }

    #[test]
    fn delete_takes_trimmed_name() {
        assert_eq!(parse_delete("XR-0\n"), Ok("XR-0"));
        assert_eq!(parse_delete("  "), Err(ParseError::EmptyName));
    }

    #[test]
    fn unknown_property_falls_through() {
        assert!(parse_command("EDID", "XR-0:1:1", DEFAULT_REFRESH).is_none());
        assert_eq!(
            parse_command(DELETE_XR_OUTPUT, "XR-0", DEFAULT_REFRESH),
            Some(Ok(ControlCommand::Delete("XR-0".to_string())))
        );
    }

    #[test]
    fn mode_list_skips_malformed_entries() {
        let parsed = parse_mode_list("640:480:60|bad|800:600:75");
        assert_eq!(
            parsed.modes,
            vec![ModeSpec::new(640, 480, 60), ModeSpec::new(800, 600, 75)]
        );
        assert_eq!(parsed.skipped, vec!["bad".to_string()]);
    }

    #[test]
    fn mode_list_skips_out_of_bounds_entries() {
        let parsed = parse_mode_list("32:32:60|1920:1080:2000|1920:1080:60||");
        assert_eq!(parsed.modes, vec![ModeSpec::new(1920, 1080, 60)]);
        assert_eq!(parsed.skipped.len(), 2);
    }
}
