//! Data models for finishline
//!
//! Defines the assignment record kept by every device, the record shape
//! exchanged with peers and the history store, and the small helpers that
//! normalise operator input (tokens, barcodes, event names).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::identity::random_base36;

/// Highest token that can be handed out
pub const MAX_TOKEN: u32 = 9999;

/// Longest event name accepted from the operator
pub const MAX_EVENT_NAME_LEN: usize = 20;

/// Name of a freshly created event
pub const DEFAULT_EVENT_NAME: &str = "New event";

/// Name adopted when a peer announces an empty name
pub const UNNAMED_EVENT_NAME: &str = "Unnamed Event";

/// Length of generated event ids
pub const EVENT_ID_LEN: usize = 6;

/// Operator input rejected before anything is broadcast
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Token must be a whole number between 1 and {max}, got {0}", max = MAX_TOKEN)]
    TokenOutOfRange(i64),

    #[error("Invalid token label '{0}', expected something like P0042")]
    InvalidTokenLabel(String),

    #[error("Invalid athlete barcode '{0}', expected something like A123456")]
    InvalidBarcode(String),

    #[error("The event name must be between 1 and {max} characters", max = MAX_EVENT_NAME_LEN)]
    InvalidEventName,

    #[error("Invalid event id or link '{0}'")]
    InvalidEventId(String),

    #[error("Unknown entry method '{0}', expected scan, manual or qr")]
    UnknownEntryMethod(String),
}

/// How the athlete data for a token was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMethod {
    /// Barcode read by the camera
    Scan,
    /// Typed in by the operator
    Manual,
    /// Token QR shown to the athlete, no barcode captured
    Qr,
}

impl EntryMethod {
    /// Guess the entry method of a record that does not carry one
    pub fn infer(athlete_barcode: &str) -> Self {
        if athlete_barcode.is_empty() {
            EntryMethod::Qr
        } else {
            EntryMethod::Manual
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryMethod::Scan => "scan",
            EntryMethod::Manual => "manual",
            EntryMethod::Qr => "qr",
        }
    }
}

impl fmt::Display for EntryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scan" => Ok(EntryMethod::Scan),
            "manual" => Ok(EntryMethod::Manual),
            "qr" => Ok(EntryMethod::Qr),
            other => Err(ValidationError::UnknownEntryMethod(other.to_string())),
        }
    }
}

/// The outcome of handing a token to an athlete, as seen by one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Token number, unique within an event
    pub token: u32,
    /// Canonical `A<digits>` barcode, or empty
    pub athlete_barcode: String,
    /// Optional athlete name
    #[serde(default)]
    pub athlete_name: String,
    /// How the data was captured
    pub entry_method: EntryMethod,
    /// Wall-clock milliseconds of the write
    pub timestamp: i64,
    /// Session id of the writer
    pub origin_id: String,
    /// Whether this device produced the current value
    #[serde(default)]
    pub is_local: bool,
}

impl Assignment {
    /// Display label of the token (`P0042`)
    pub fn label(&self) -> String {
        format_token(self.token)
    }

    /// Last-writer-wins ordering: newer timestamp, then larger origin id
    pub fn supersedes(&self, other: &Assignment) -> bool {
        self.timestamp > other.timestamp
            || (self.timestamp == other.timestamp && self.origin_id > other.origin_id)
    }
}

/// Assignment record as exchanged with peers and the history store
///
/// Two historical shapes exist on the wire: PascalCase (`Position`,
/// `AthleteId`, ...) and camelCase (`position`, `athleteId`, ...). Both are
/// accepted; records are always written in the PascalCase shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAssignment {
    /// Token label, `P0042`
    #[serde(
        rename = "Position",
        alias = "position",
        deserialize_with = "deserialize_position"
    )]
    pub position: String,

    #[serde(rename = "AthleteId", alias = "athleteId", default)]
    pub athlete_id: String,

    #[serde(rename = "AthleteName", alias = "athleteName", default)]
    pub athlete_name: String,

    /// Writer attribution used for tie-breaks
    #[serde(rename = "ConnectionId", alias = "connectionId", default)]
    pub connection_id: String,

    #[serde(rename = "DeviceId", alias = "deviceId", default)]
    pub device_id: String,

    #[serde(
        rename = "Timestamp",
        alias = "timestamp",
        alias = "assignmentTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,

    #[serde(
        rename = "EntryMethod",
        alias = "entryMethod",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub entry_method: Option<EntryMethod>,
}

impl WireAssignment {
    /// Build the wire record for an assignment written by `device_id`
    pub fn from_assignment(assignment: &Assignment, device_id: &str) -> Self {
        Self {
            position: assignment.label(),
            athlete_id: assignment.athlete_barcode.clone(),
            athlete_name: assignment.athlete_name.clone(),
            connection_id: assignment.origin_id.clone(),
            device_id: device_id.to_string(),
            timestamp: Some(assignment.timestamp),
            entry_method: Some(assignment.entry_method),
        }
    }

    /// Token number carried by this record
    pub fn token(&self) -> Result<u32, ValidationError> {
        parse_token_label(&self.position)
    }

    /// Normalise into a non-local assignment
    ///
    /// A missing timestamp is read as 0, so such a record only fills a gap
    /// and never replaces a stamped one. A missing entry method is inferred
    /// from the barcode.
    pub fn into_assignment(self) -> Result<Assignment, ValidationError> {
        let token = self.token()?;
        let athlete_barcode = normalize_barcode(&self.athlete_id);
        let entry_method = self
            .entry_method
            .unwrap_or_else(|| EntryMethod::infer(&athlete_barcode));

        Ok(Assignment {
            token,
            athlete_barcode,
            athlete_name: self.athlete_name,
            entry_method,
            timestamp: self.timestamp.unwrap_or(0),
            origin_id: self.connection_id,
            is_local: false,
        })
    }
}

fn deserialize_position<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Label(String),
        Number(u64),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Label(label) => label,
        Repr::Number(n) => format!("P{:04}", n),
    })
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a token for display (`42` -> `P0042`)
pub fn format_token(token: u32) -> String {
    format!("P{:04}", token)
}

/// Parse a token label (`P0042`, `p42` or `42`)
pub fn parse_token_label(label: &str) -> Result<u32, ValidationError> {
    let trimmed = label.trim();
    let digits = trimmed
        .strip_prefix('P')
        .or_else(|| trimmed.strip_prefix('p'))
        .unwrap_or(trimmed);

    let value: i64 = digits
        .parse()
        .map_err(|_| ValidationError::InvalidTokenLabel(label.to_string()))?;
    validate_token(value)
}

/// Check that a token is in 1..=9999
pub fn validate_token(token: i64) -> Result<u32, ValidationError> {
    if (1..=MAX_TOKEN as i64).contains(&token) {
        Ok(token as u32)
    } else {
        Err(ValidationError::TokenOutOfRange(token))
    }
}

/// Canonicalise an athlete barcode to `A<digits>`
///
/// A single leading `A`/`a` is dropped, then every non-digit, then leading
/// zeros. Input that does not leave a positive number becomes empty.
pub fn normalize_barcode(input: &str) -> String {
    let trimmed = input.trim();
    let rest = trimmed
        .strip_prefix('A')
        .or_else(|| trimmed.strip_prefix('a'))
        .unwrap_or(trimmed);

    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
    let significant = digits.trim_start_matches('0');

    if significant.is_empty() {
        String::new()
    } else {
        format!("A{}", significant)
    }
}

/// Normalise operator-entered barcode, rejecting input that is not empty but
/// does not parse
pub fn validate_barcode(input: &str) -> Result<String, ValidationError> {
    let normalized = normalize_barcode(input);
    if normalized.is_empty() && !input.trim().is_empty() {
        return Err(ValidationError::InvalidBarcode(input.to_string()));
    }
    Ok(normalized)
}

/// Check an operator-entered event name
pub fn validate_event_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_EVENT_NAME_LEN {
        return Err(ValidationError::InvalidEventName);
    }
    Ok(trimmed.to_string())
}

/// Generate a new random event id
pub fn new_event_id() -> String {
    random_base36(EVENT_ID_LEN)
}

/// Build the link other devices open to join an event
///
/// The event id travels base64-encoded in the `eventId` query parameter.
pub fn event_share_link(base_url: &str, event_id: &str) -> String {
    format!(
        "{}?eventId={}",
        base_url.trim_end_matches('/'),
        URL_SAFE_NO_PAD.encode(event_id)
    )
}

/// Extract the event id from a share link, or accept a bare event id
pub fn parse_event_link(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    let invalid = || ValidationError::InvalidEventId(input.to_string());

    let Some(start) = trimmed.find("eventId=") else {
        return if is_valid_event_id(trimmed) {
            Ok(trimmed.to_string())
        } else {
            Err(invalid())
        };
    };

    let encoded = trimmed[start + "eventId=".len()..]
        .split(['&', '#'])
        .next()
        .unwrap_or_default()
        .replace("%3D", "=")
        .replace("%3d", "=")
        .replace("%2B", "+")
        .replace("%2F", "/");

    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(&encoded))
        .map_err(|_| invalid())?;
    let event_id = String::from_utf8(bytes).map_err(|_| invalid())?;

    if is_valid_event_id(&event_id) {
        Ok(event_id)
    } else {
        Err(invalid())
    }
}

fn is_valid_event_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_barcode() {
        assert_eq!(normalize_barcode("a007"), "A7");
        assert_eq!(normalize_barcode("7"), "A7");
        assert_eq!(normalize_barcode("abc"), "");
        assert_eq!(normalize_barcode("A1234567"), "A1234567");
        assert_eq!(normalize_barcode(" A 12-34 "), "A1234");
        assert_eq!(normalize_barcode("A000"), "");
        assert_eq!(normalize_barcode(""), "");
    }

    #[test]
    fn test_validate_barcode() {
        assert_eq!(validate_barcode("a42").unwrap(), "A42");
        assert_eq!(validate_barcode("").unwrap(), "");
        assert_eq!(
            validate_barcode("abc"),
            Err(ValidationError::InvalidBarcode("abc".to_string()))
        );
    }

    #[test]
    fn test_token_labels() {
        assert_eq!(format_token(7), "P0007");
        assert_eq!(format_token(9999), "P9999");
        assert_eq!(parse_token_label("P0042").unwrap(), 42);
        assert_eq!(parse_token_label("p42").unwrap(), 42);
        assert_eq!(parse_token_label("42").unwrap(), 42);
        assert!(parse_token_label("P0000").is_err());
        assert!(parse_token_label("P10000").is_err());
        assert!(parse_token_label("Pxyz").is_err());
    }

    #[test]
    fn test_validate_event_name() {
        assert_eq!(validate_event_name("  Park 5k ").unwrap(), "Park 5k");
        assert!(validate_event_name("   ").is_err());
        assert!(validate_event_name("a name that is far too long").is_err());
    }

    #[test]
    fn test_entry_method_parse_and_infer() {
        assert_eq!("Scan".parse::<EntryMethod>().unwrap(), EntryMethod::Scan);
        assert!("carrier pigeon".parse::<EntryMethod>().is_err());
        assert_eq!(EntryMethod::infer(""), EntryMethod::Qr);
        assert_eq!(EntryMethod::infer("A1"), EntryMethod::Manual);
    }

    #[test]
    fn test_wire_assignment_pascal_case() {
        let json = r#"{
            "Position": "P0003",
            "AthleteId": "a0042",
            "AthleteName": "Sam",
            "ConnectionId": "abc123",
            "DeviceId": "dev-1",
            "Timestamp": 1700000000000
        }"#;

        let wire: WireAssignment = serde_json::from_str(json).unwrap();
        let assignment = wire.into_assignment().unwrap();

        assert_eq!(assignment.token, 3);
        assert_eq!(assignment.athlete_barcode, "A42");
        assert_eq!(assignment.athlete_name, "Sam");
        assert_eq!(assignment.origin_id, "abc123");
        assert_eq!(assignment.timestamp, 1_700_000_000_000);
        assert_eq!(assignment.entry_method, EntryMethod::Manual);
        assert!(!assignment.is_local);
    }

    #[test]
    fn test_wire_assignment_camel_case() {
        let json = r#"{
            "position": "P0011",
            "athleteId": "",
            "connectionId": "zz",
            "assignmentTimestamp": 5
        }"#;

        let wire: WireAssignment = serde_json::from_str(json).unwrap();
        let assignment = wire.into_assignment().unwrap();

        assert_eq!(assignment.token, 11);
        assert_eq!(assignment.athlete_barcode, "");
        assert_eq!(assignment.entry_method, EntryMethod::Qr);
        assert_eq!(assignment.timestamp, 5);
    }

    #[test]
    fn test_wire_assignment_written_in_pascal_case() {
        let assignment = Assignment {
            token: 12,
            athlete_barcode: "A99".to_string(),
            athlete_name: String::new(),
            entry_method: EntryMethod::Scan,
            timestamp: 10,
            origin_id: "s1".to_string(),
            is_local: true,
        };

        let value = serde_json::to_value(WireAssignment::from_assignment(&assignment, "dev")).unwrap();
        assert_eq!(value["Position"], "P0012");
        assert_eq!(value["AthleteId"], "A99");
        assert_eq!(value["ConnectionId"], "s1");
        assert_eq!(value["DeviceId"], "dev");
        assert_eq!(value["EntryMethod"], "scan");
    }

    #[test]
    fn test_wire_assignment_bad_position() {
        let wire: WireAssignment = serde_json::from_str(r#"{"Position": "nope"}"#).unwrap();
        assert!(wire.into_assignment().is_err());
    }

    #[test]
    fn test_supersedes() {
        let base = Assignment {
            token: 1,
            athlete_barcode: "A1".to_string(),
            athlete_name: String::new(),
            entry_method: EntryMethod::Manual,
            timestamp: 100,
            origin_id: "m".to_string(),
            is_local: false,
        };

        let newer = Assignment {
            timestamp: 101,
            origin_id: "a".to_string(),
            ..base.clone()
        };
        let tie_larger = Assignment {
            origin_id: "z".to_string(),
            ..base.clone()
        };
        let tie_smaller = Assignment {
            origin_id: "b".to_string(),
            ..base.clone()
        };

        assert!(newer.supersedes(&base));
        assert!(tie_larger.supersedes(&base));
        assert!(!tie_smaller.supersedes(&base));
        assert!(!base.supersedes(&base));
    }

    #[test]
    fn test_event_links() {
        let link = event_share_link("https://finish.example.com/", "k3x9qa");
        assert!(link.starts_with("https://finish.example.com?eventId="));
        assert_eq!(parse_event_link(&link).unwrap(), "k3x9qa");

        // Standard base64 with padding, as older links were written
        let legacy = format!("https://x.test/?eventId={}", STANDARD.encode("abc"));
        assert_eq!(parse_event_link(&legacy).unwrap(), "abc");

        assert_eq!(parse_event_link("k3x9qa").unwrap(), "k3x9qa");
        assert!(parse_event_link("not an id").is_err());
    }

    #[test]
    fn test_new_event_id() {
        let id = new_event_id();
        assert_eq!(id.len(), EVENT_ID_LEN);
        assert!(parse_event_link(&id).is_ok());
    }
}
