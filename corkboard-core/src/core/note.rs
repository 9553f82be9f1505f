//! The note record and its lightweight metadata projection.

use chrono::{DateTime, Utc};
use pulldown_cmark::{Event, Parser, TagEnd};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorkboardError, Result};

/// Returns the current time at full precision; the store keeps nanoseconds.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

const SEARCH_SEPARATOR: char = '\u{1f}';

/// Background colour of a note.
///
/// Stored and serialised as a lowercase string. Unknown strings decode to
/// [`NoteColor::Yellow`] so that a record written by a newer client stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NoteColor {
    #[default]
    Yellow,
    Blue,
    Green,
    Pink,
    Purple,
    Gray,
}

impl NoteColor {
    /// Every colour, in picker order.
    pub const ALL: [NoteColor; 6] = [
        NoteColor::Yellow,
        NoteColor::Blue,
        NoteColor::Green,
        NoteColor::Pink,
        NoteColor::Purple,
        NoteColor::Gray,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Pink => "pink",
            Self::Purple => "purple",
            Self::Gray => "gray",
        }
    }

    /// Parses a stored colour name, returning `None` for unknown values.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Parses a stored colour name, falling back to the default colour.
    #[must_use]
    pub fn from_stored(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            log::warn!("unknown note colour {name:?}, using default");
            Self::default()
        })
    }
}

impl From<String> for NoteColor {
    fn from(name: String) -> Self {
        Self::from_stored(&name)
    }
}

impl From<NoteColor> for String {
    fn from(color: NoteColor) -> Self {
        color.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 300.0,
            height: 200.0,
        }
    }
}

/// A single sticky note, the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub position: Point,
    #[serde(default)]
    pub size: Size,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub is_markdown: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Note {
    /// Creates an empty note with a fresh id and both timestamps set to now.
    #[must_use]
    pub fn new() -> Self {
        let created = now();
        Self {
            id: Uuid::new_v4(),
            title: String::new(),
            content: String::new(),
            color: NoteColor::default(),
            position: Point::default(),
            size: Size::default(),
            created_at: created,
            modified_at: created,
            is_markdown: false,
            is_locked: false,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_text(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::new()
        }
    }

    /// Returns the content with markdown markup removed when `is_markdown` is set.
    #[must_use]
    pub fn plain_text(&self) -> String {
        if self.is_markdown {
            markdown_to_plain_text(&self.content)
        } else {
            self.content.clone()
        }
    }

    /// The denormalised text the search index stores for this note.
    ///
    /// Title and body are joined by a unit separator so that a query never
    /// matches across the boundary.
    #[must_use]
    pub fn search_text(&self) -> String {
        format!("{}{SEARCH_SEPARATOR}{}", self.title, self.plain_text()).to_lowercase()
    }

    #[must_use]
    pub fn metadata(&self) -> NoteMetadata {
        NoteMetadata::from(self)
    }

    /// Checks the invariants a note must satisfy before it is written.
    ///
    /// # Errors
    ///
    /// Returns [`CorkboardError::InvalidData`] for non-finite geometry or a
    /// negative size.
    pub fn validate(&self) -> Result<()> {
        let geometry = [self.position.x, self.position.y, self.size.width, self.size.height];
        if geometry.iter().any(|v| !v.is_finite()) {
            return Err(CorkboardError::InvalidData(format!(
                "note {} has non-finite position or size",
                self.id
            )));
        }
        if self.size.width < 0.0 || self.size.height < 0.0 {
            return Err(CorkboardError::InvalidData(format!(
                "note {} has a negative size",
                self.id
            )));
        }
        Ok(())
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only listing projection of a [`Note`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMetadata {
    pub id: Uuid,
    pub title: String,
    pub color: NoteColor,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<&Note> for NoteMetadata {
    fn from(note: &Note) -> Self {
        Self {
            id: note.id,
            title: note.title.clone(),
            color: note.color,
            created_at: note.created_at,
            modified_at: note.modified_at,
        }
    }
}

fn markdown_to_plain_text(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for event in Parser::new(source) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(
                TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock,
            ) => out.push(' '),
            _ => {}
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_note_defaults() {
        let note = Note::new();
        assert_eq!(note.title, "");
        assert_eq!(note.color, NoteColor::Yellow);
        assert_eq!(note.size, Size { width: 300.0, height: 200.0 });
        assert_eq!(note.created_at, note.modified_at);
        assert!(note.tags.is_empty());
    }

    #[test]
    fn test_unknown_color_falls_back_to_default() {
        assert_eq!(NoteColor::from_stored("pink"), NoteColor::Pink);
        assert_eq!(NoteColor::from_stored("chartreuse"), NoteColor::Yellow);

        let parsed: NoteColor = serde_json::from_str("\"turquoise\"").unwrap();
        assert_eq!(parsed, NoteColor::Yellow);
        assert_eq!(serde_json::to_string(&NoteColor::Purple).unwrap(), "\"purple\"");
    }

    #[test]
    fn test_search_text_lowercases_title_and_content() {
        let note = Note::with_text("Groceries", "Buy MILK");
        assert_eq!(note.search_text(), "groceries\u{1f}buy milk");
    }

    #[test]
    fn test_search_text_strips_markdown() {
        let mut note = Note::with_text("Plan", "# Header\n\nSome **bold** and `code`");
        note.is_markdown = true;
        assert_eq!(note.search_text(), "plan\u{1f}header some bold and code");
    }

    #[test]
    fn test_metadata_projection() {
        let note = Note::with_text("Title", "body");
        let meta = NoteMetadata::from(&note);
        assert_eq!(meta.id, note.id);
        assert_eq!(meta.title, "Title");
        assert_eq!(meta.modified_at, note.modified_at);
    }

    #[test]
    fn test_validate_rejects_nan_geometry() {
        let mut note = Note::new();
        note.position.x = f64::NAN;
        assert!(matches!(note.validate(), Err(CorkboardError::InvalidData(_))));

        let mut note = Note::new();
        note.size.width = -1.0;
        assert!(note.validate().is_err());
        assert!(Note::new().validate().is_ok());
    }

    #[test]
    fn test_note_json_uses_camel_case_and_defaults() {
        let json = r#"{"id":"7f1c0d4e-8a8b-4b55-9c3b-2f43f1a4c001","title":"t"}"#;
        let note: Note = serde_json::from_str(json).unwrap();
        assert_eq!(note.title, "t");
        assert_eq!(note.size, Size::default());
        assert!(!note.is_markdown);

        let out = serde_json::to_string(&note).unwrap();
        assert!(out.contains("\"isMarkdown\":false"));
        assert!(out.contains("\"createdAt\""));
    }
}
