//! Telemetry channel
//!
//! Sensor packets arrive as text: a `data` header line followed by
//! `Key: Value` lines. Parsing turns them into an ordered, typed record that
//! is handed to the recording session and the UI.

pub mod system;

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

use crate::TELEMETRY_PREFIX;

/// A single typed telemetry value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    /// Type a raw value: digits-only → Int, then Float (surrounding
    /// whitespace allowed), else the original text.
    pub fn infer(raw: &str) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = raw.parse::<i64>() {
                return TelemetryValue::Int(v);
            }
        }
        match raw.trim().parse::<f64>() {
            Ok(v) => TelemetryValue::Float(v),
            Err(_) => TelemetryValue::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Int(v) => write!(f, "{}", v),
            TelemetryValue::Float(v) => write!(f, "{}", v),
            TelemetryValue::Text(v) => f.write_str(v),
        }
    }
}

/// Parsed telemetry packet. Field order follows the packet.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    fields: Vec<(String, TelemetryValue)>,
    raw: String,
}

impl TelemetryRecord {
    /// Parse a telemetry packet.
    ///
    /// The first line is a header and is discarded. Each remaining non-empty
    /// line is split on the first `": "`; lines without it are skipped. A
    /// repeated key keeps its first position and takes the last value.
    pub fn parse(text: &str) -> Self {
        let mut fields: Vec<(String, TelemetryValue)> = Vec::new();

        for line in text.lines().skip(1) {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = TelemetryValue::infer(value);
            match fields.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value,
                None => fields.push((key.to_string(), value)),
            }
        }

        Self {
            fields,
            raw: text.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn fields(&self) -> &[(String, TelemetryValue)] {
        &self.fields
    }

    /// The packet text as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A parsed record and the device it came from
#[derive(Debug, Clone)]
pub struct InboundTelemetry {
    pub from: IpAddr,
    pub record: TelemetryRecord,
}

/// Build a telemetry packet from key/value pairs.
pub fn format_packet<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, TelemetryValue)>,
{
    let mut out = String::from(TELEMETRY_PREFIX);
    out.push('\n');
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out
}
