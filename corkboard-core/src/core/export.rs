//! The serialised note collection used for import and export.
//!
//! An export is a JSON object:
//!
//! ```json
//! { "version": 1, "appVersion": "0.1.0", "exportedAt": "2026-01-01T00:00:00Z", "notes": [ ... ] }
//! ```
//!
//! Each note uses camelCase field names and RFC 3339 timestamps. A bare JSON
//! array of notes is also accepted on import.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::note::now;
use crate::core::schema::{ColumnKind, CURRENT};
use crate::{CorkboardError, Note, Result};

/// Format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Application version stamped into every export.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level JSON structure of an export.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNotes {
    pub version: u32,
    pub app_version: String,
    pub exported_at: DateTime<Utc>,
    pub notes: Vec<Note>,
}

impl ExportNotes {
    #[must_use]
    pub fn new(notes: Vec<Note>) -> Self {
        Self {
            version: FORMAT_VERSION,
            app_version: APP_VERSION.to_string(),
            exported_at: now(),
            notes,
        }
    }
}

/// Encodes `notes` as a pretty-printed export document.
pub fn encode_notes(notes: Vec<Note>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&ExportNotes::new(notes))?)
}

/// Decodes an export document or a bare array of notes.
///
/// # Errors
///
/// Returns [`CorkboardError::InvalidData`] for malformed JSON, an unsupported
/// format version, or a record that is missing `id` or has a field of the
/// wrong type.
pub fn decode_notes(bytes: &[u8]) -> Result<Vec<Note>> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| CorkboardError::InvalidData(format!("malformed export: {e}")))?;
    let records = match document {
        Value::Array(records) => records,
        Value::Object(mut fields) => {
            let version = fields
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| CorkboardError::InvalidData("export has no format version".to_string()))?;
            if version != u64::from(FORMAT_VERSION) {
                return Err(CorkboardError::InvalidData(format!(
                    "unsupported export format version {version}"
                )));
            }
            match fields.remove("notes") {
                Some(Value::Array(records)) => records,
                _ => {
                    return Err(CorkboardError::InvalidData(
                        "export has no notes array".to_string(),
                    ))
                }
            }
        }
        _ => {
            return Err(CorkboardError::InvalidData(
                "export must be an object or an array".to_string(),
            ))
        }
    };

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            validate_record(&record)
                .map_err(|msg| CorkboardError::InvalidData(format!("record {index}: {msg}")))?;
            serde_json::from_value(record)
                .map_err(|e| CorkboardError::InvalidData(format!("record {index}: {e}")))
        })
        .collect()
}

/// Checks a raw record against the field table.
fn validate_record(record: &Value) -> std::result::Result<(), String> {
    if !record.is_object() {
        return Err("not an object".to_string());
    }
    for field in CURRENT.fields {
        let value = field
            .record_key
            .split('.')
            .try_fold(record, |node, key| node.get(key));
        match value {
            None if field.is_optional() => {}
            None => return Err(format!("missing required field {}", field.record_key)),
            Some(value) if kind_accepts(field.kind, value) => {}
            Some(value) => {
                return Err(format!(
                    "field {} has unexpected value {value}",
                    field.record_key
                ))
            }
        }
    }
    Ok(())
}

fn kind_accepts(kind: ColumnKind, value: &Value) -> bool {
    match kind {
        ColumnKind::Uuid => value
            .as_str()
            .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
        ColumnKind::Text | ColumnKind::Color => value.is_string(),
        ColumnKind::Real => value.is_number(),
        ColumnKind::Bool => value.is_boolean(),
        ColumnKind::Timestamp | ColumnKind::TimestampNanos => value
            .as_str()
            .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoteColor;

    #[test]
    fn test_export_notes_serialization() {
        let export = ExportNotes::new(vec![]);
        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"version\":1"));
        assert!(json.contains(&format!("\"appVersion\":\"{APP_VERSION}\"")));
        assert!(json.contains("\"exportedAt\""));
        assert!(json.contains("\"notes\":[]"));
    }

    #[test]
    fn test_encode_decode_keeps_every_field() {
        let mut note = Note::with_text("Title", "# Body");
        note.color = NoteColor::Purple;
        note.is_markdown = true;
        note.tags = vec!["x".to_string()];
        note.position.x = 12.5;

        let bytes = encode_notes(vec![note.clone()]).unwrap();
        assert_eq!(decode_notes(&bytes).unwrap(), vec![note]);
    }

    #[test]
    fn test_decode_bare_array_with_defaults() {
        let json = r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "title": "Only title",
                       "size": {"width": 50}}]"#;
        let notes = decode_notes(json.as_bytes()).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Only title");
        assert_eq!(notes[0].color, NoteColor::Yellow);
        assert_eq!(notes[0].size.width, 50.0);
        assert_eq!(notes[0].size.height, 200.0);
        assert!(notes[0].tags.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        let cases = [
            "not json",
            "42",
            r#"{"version": 9, "notes": []}"#,
            r#"{"notes": []}"#,
            r#"{"version": 1}"#,
            r#"[{"title": "no id"}]"#,
            r#"[{"id": "nope"}]"#,
            r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "title": 3}]"#,
            r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "size": {"width": "wide"}}]"#,
            r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "createdAt": "yesterday"}]"#,
            r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "isLocked": null}]"#,
        ];
        for case in cases {
            assert!(
                matches!(decode_notes(case.as_bytes()), Err(CorkboardError::InvalidData(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_unknown_color_decodes_as_default() {
        let json = r#"[{"id": "7f1c2a8e-8f4e-4c4e-9a51-2b7d7f0e7a11", "color": "teal"}]"#;
        assert_eq!(decode_notes(json.as_bytes()).unwrap()[0].color, NoteColor::Yellow);
    }
}
