// SPDX-License-Identifier: GPL-3.0-or-later
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::settings::{DeviceClass, JsonPointer, SensorSettings};

/// The payload that explicitly clears a numeric sensor's value.
const PAYLOAD_NONE: &str = "None";

/// A decoded sensor value.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub(crate) enum SensorValue {
    Text(String),
    Timestamp(DateTime<FixedOffset>),
    Date(NaiveDate),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Timestamp(timestamp) => f.write_str(&timestamp.to_rfc3339()),
            Self::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

/// The result of decoding a message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Decoded {
    /// Nothing usable was in the message, leave the current value alone.
    Keep,

    /// Replace the current value. `None` is an unknown value.
    Value(Option<SensorValue>),
}

/// Pull the interesting part out of a payload.
///
/// Without a pointer the whole payload is used. With one, the payload is parsed as JSON and the
/// pointer resolved, with `None` returned if either step fails.
pub(crate) fn extract(payload: &str, pointer: Option<&JsonPointer>) -> Option<String> {
    let pointer = match pointer {
        Some(pointer) => pointer,
        None => return Some(payload.to_string()),
    };
    let document: serde_json::Value = match serde_json::from_str(payload) {
        Ok(document) => document,
        Err(err) => {
            debug!(%payload, error = %err, "payload is not valid JSON");
            return None;
        }
    };
    match document.pointer(pointer.as_str()) {
        Some(serde_json::Value::String(value)) => Some(value.clone()),
        // Rendered the same as an explicit "None" payload
        Some(serde_json::Value::Null) => Some(PAYLOAD_NONE.to_string()),
        Some(value) => Some(value.to_string()),
        None => {
            debug!(%payload, pointer = pointer.as_str(), "pointer not found in payload");
            None
        }
    }
}

/// Date and time layouts, without the offset. Seconds are optional.
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Offsets as `+hh:mm`, `+hhmm`, or `+hh`.
const OFFSET_FORMATS: [&str; 3] = ["%:z", "%z", "%#z"];

/// Parse an ISO 8601 date and time.
///
/// Values without an offset are taken to be UTC, and a bare date is midnight UTC.
pub(crate) fn parse_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed);
    }
    let with_offset = match value.strip_suffix(|c: char| c == 'Z' || c == 'z') {
        Some(utc) => format!("{}+00:00", utc),
        None => value.to_string(),
    };
    let parsed = DATETIME_FORMATS
        .iter()
        .flat_map(|datetime| OFFSET_FORMATS.iter().map(move |offset| (datetime, offset)))
        .find_map(|(datetime, offset)| {
            DateTime::parse_from_str(&with_offset, &format!("{}{}", datetime, offset)).ok()
        });
    if parsed.is_some() {
        return parsed;
    }
    let naive = DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;
    Some(Utc.from_utc_datetime(&naive).into())
}

/// Decode a state message for a sensor.
pub(crate) fn decode(settings: &SensorSettings, topic: &str, payload: &str) -> Decoded {
    let new_value = match extract(payload, settings.value_template.as_ref()) {
        Some(new_value) => new_value,
        None => return Decoded::Keep,
    };
    if settings.numeric_state_expected() {
        return if new_value.is_empty() {
            debug!(%topic, "Ignore empty state");
            Decoded::Keep
        } else if new_value == PAYLOAD_NONE {
            Decoded::Value(None)
        } else {
            Decoded::Value(Some(SensorValue::Text(new_value)))
        };
    }
    let device_class = match settings.device_class {
        None | Some(DeviceClass::Enum) => {
            return Decoded::Value(Some(SensorValue::Text(new_value)));
        }
        Some(device_class) => device_class,
    };
    let timestamp = match parse_datetime(&new_value) {
        Some(timestamp) => timestamp,
        None => {
            warn!(%topic, %payload, "Invalid state message");
            return Decoded::Value(None);
        }
    };
    if device_class == DeviceClass::Date {
        Decoded::Value(Some(SensorValue::Date(timestamp.date_naive())))
    } else {
        Decoded::Value(Some(SensorValue::Timestamp(timestamp)))
    }
}

/// Decode the last reset timestamp from a message, if one is configured and present.
pub(crate) fn decode_last_reset(
    settings: &SensorSettings,
    topic: &str,
    payload: &str,
) -> Option<DateTime<FixedOffset>> {
    let pointer = settings.last_reset_value_template.as_ref()?;
    let last_reset = match extract(payload, Some(pointer)) {
        Some(last_reset) if !last_reset.is_empty() => last_reset,
        _ => {
            debug!(%topic, "Ignoring empty last_reset message");
            return None;
        }
    };
    let parsed = parse_datetime(&last_reset);
    if parsed.is_none() {
        warn!(%topic, %payload, "Invalid last_reset message");
    }
    parsed
}

#[cfg(test)]
mod test {
    use std::convert::TryFrom;

    use chrono::{FixedOffset, NaiveDate, TimeZone};

    use super::{decode, decode_last_reset, extract, parse_datetime, Decoded, SensorValue};
    use crate::sensor::settings::{DeviceClass, JsonPointer, SensorSettings, StateClass};

    fn pointer(p: &str) -> JsonPointer {
        JsonPointer::try_from(p.to_string()).unwrap()
    }

    fn text(value: &str) -> Decoded {
        Decoded::Value(Some(SensorValue::Text(value.to_string())))
    }

    #[test]
    fn extract_without_pointer() {
        assert_eq!(extract("22.5", None), Some("22.5".to_string()));
        assert_eq!(extract("", None), Some("".to_string()));
    }

    #[test]
    fn extract_with_pointer() {
        let payload = r#"{"temperature": 21.5, "label": "warm", "nested": {"ok": true}}"#;
        assert_eq!(
            extract(payload, Some(&pointer("/temperature"))),
            Some("21.5".to_string())
        );
        assert_eq!(
            extract(payload, Some(&pointer("/label"))),
            Some("warm".to_string())
        );
        assert_eq!(
            extract(payload, Some(&pointer("/nested/ok"))),
            Some("true".to_string())
        );
        assert_eq!(extract(payload, Some(&pointer("/missing"))), None);
        assert_eq!(extract("not json", Some(&pointer("/temperature"))), None);
    }

    #[test]
    fn parse_datetimes() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            parse_datetime("2021-06-01T12:30:00+02:00"),
            Some(offset.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap())
        );
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            parse_datetime("2021-06-01 12:30:00"),
            Some(utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap())
        );
        assert_eq!(
            parse_datetime("2021-06-01"),
            Some(utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn parse_loose_datetimes() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let expected = offset.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_datetime("2021-06-01T12:30:00+0200"), Some(expected));
        assert_eq!(parse_datetime("2021-06-01 12:30+02:00"), Some(expected));
        assert_eq!(parse_datetime("2021-06-01T12:30+0200"), Some(expected));
        assert_eq!(
            parse_datetime("2021-06-01T12:30:00.250+0200").map(|t| t.timestamp()),
            Some(expected.timestamp())
        );
        let utc = FixedOffset::east_opt(0).unwrap();
        let utc_expected = utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap();
        // No seconds, no offset
        assert_eq!(parse_datetime("2021-06-01T12:30"), Some(utc_expected));
        assert_eq!(parse_datetime("2021-06-01 12:30"), Some(utc_expected));
        assert_eq!(parse_datetime("2021-06-01T12:30Z"), Some(utc_expected));
        assert_eq!(parse_datetime("2021-06-01T12"), None);

        let mut settings = SensorSettings::new("t", "t");
        settings.device_class = Some(DeviceClass::Timestamp);
        assert_eq!(
            decode(&settings, "t", "2021-06-01T12:30"),
            Decoded::Value(Some(SensorValue::Timestamp(utc_expected)))
        );
        assert_eq!(
            decode(&settings, "t", "2021-06-01T12:30:00+0200"),
            Decoded::Value(Some(SensorValue::Timestamp(expected)))
        );
    }

    #[test]
    fn numeric() {
        let mut settings = SensorSettings::new("t", "t");
        settings.unit_of_measurement = Some("°C".to_string());
        assert_eq!(decode(&settings, "t", "22.5"), text("22.5"));
        assert_eq!(decode(&settings, "t", ""), Decoded::Keep);
        assert_eq!(decode(&settings, "t", "None"), Decoded::Value(None));
    }

    #[test]
    fn json_null_clears_value() {
        let mut settings = SensorSettings::new("t", "t");
        settings.unit_of_measurement = Some("W".to_string());
        settings.value_template = Some(pointer("/power"));
        assert_eq!(
            extract(r#"{"power": null}"#, Some(&pointer("/power"))),
            Some("None".to_string())
        );
        assert_eq!(decode(&settings, "t", r#"{"power": null}"#), Decoded::Value(None));
        assert_eq!(decode(&settings, "t", r#"{"power": 230}"#), text("230"));
    }

    #[test]
    fn plain_text() {
        let settings = SensorSettings::new("t", "t");
        // Without a numeric expectation an empty payload is a real (empty) value.
        assert_eq!(decode(&settings, "t", ""), text(""));
        assert_eq!(decode(&settings, "t", "None"), text("None"));
        let mut settings = SensorSettings::new("t", "t");
        settings.device_class = Some(DeviceClass::Enum);
        assert_eq!(decode(&settings, "t", "heating"), text("heating"));
    }

    #[test]
    fn template_miss_keeps_value() {
        let mut settings = SensorSettings::new("t", "t");
        settings.value_template = Some(pointer("/temperature"));
        assert_eq!(decode(&settings, "t", r#"{"humidity": 40}"#), Decoded::Keep);
        assert_eq!(decode(&settings, "t", r#"{"temperature": 19}"#), text("19"));
    }

    #[test]
    fn timestamps_and_dates() {
        let mut settings = SensorSettings::new("t", "t");
        settings.device_class = Some(DeviceClass::Timestamp);
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            decode(&settings, "t", "2021-06-01T08:00:00Z"),
            Decoded::Value(Some(SensorValue::Timestamp(
                utc.with_ymd_and_hms(2021, 6, 1, 8, 0, 0).unwrap()
            )))
        );
        assert_eq!(decode(&settings, "t", "soon"), Decoded::Value(None));

        settings.device_class = Some(DeviceClass::Date);
        assert_eq!(
            decode(&settings, "t", "2021-06-01T08:00:00Z"),
            Decoded::Value(Some(SensorValue::Date(
                NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
            )))
        );
    }

    #[test]
    fn last_reset() {
        let mut settings = SensorSettings::new("t", "t");
        assert_eq!(decode_last_reset(&settings, "t", "{}"), None);
        settings.state_class = Some(StateClass::Total);
        settings.last_reset_value_template = Some(pointer("/reset"));
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            decode_last_reset(&settings, "t", r#"{"reset": "2021-01-01T00:00:00Z"}"#),
            Some(utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(decode_last_reset(&settings, "t", r#"{"reset": ""}"#), None);
        assert_eq!(decode_last_reset(&settings, "t", r#"{"reset": "never"}"#), None);
    }

    #[test]
    fn display() {
        assert_eq!(SensorValue::Text("12".to_string()).to_string(), "12");
        assert_eq!(
            SensorValue::Date(NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()).to_string(),
            "2021-06-01"
        );
    }
}
