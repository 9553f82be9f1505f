//! Row mapping and SQL primitives over a single connection.
//!
//! Everything here is synchronous and runs inside a background context;
//! callers own transaction boundaries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::core::schema::{ColumnKind, FieldDefault, FieldSpec, CURRENT};
use crate::{CorkboardError, Note, NoteColor, NoteMetadata, Point, Result, Size};

/// Raw column values of one `notes` row, in `CURRENT.fields` order.
struct NoteRow {
    id: String,
    title: String,
    content: String,
    color: String,
    pos_x: f64,
    pos_y: f64,
    width: f64,
    height: f64,
    created_at: i64,
    modified_at: i64,
    is_markdown: bool,
    is_locked: bool,
}

fn map_note_row(row: &rusqlite::Row) -> rusqlite::Result<NoteRow> {
    Ok(NoteRow {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        color: row.get(3)?,
        pos_x: row.get(4)?,
        pos_y: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        created_at: row.get(8)?,
        modified_at: row.get(9)?,
        is_markdown: row.get(10)?,
        is_locked: row.get(11)?,
    })
}

fn note_from_row(row: NoteRow) -> Result<Note> {
    Ok(Note {
        id: parse_id(&row.id)?,
        title: row.title,
        content: row.content,
        color: NoteColor::from_stored(&row.color),
        position: Point {
            x: row.pos_x,
            y: row.pos_y,
        },
        size: Size {
            width: row.width,
            height: row.height,
        },
        created_at: from_nanos(row.created_at),
        modified_at: from_nanos(row.modified_at),
        is_markdown: row.is_markdown,
        is_locked: row.is_locked,
        tags: Vec::new(),
    })
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| CorkboardError::InvalidData(format!("malformed note id {raw:?}: {e}")))
}

/// Reads a schema v1 timestamp.
pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| CorkboardError::InvalidData(format!("timestamp out of range: {millis}")))
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Timestamps are stored as nanoseconds, which covers the years 1677 to 2262.
pub(crate) fn to_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| CorkboardError::InvalidData(format!("timestamp out of storable range: {ts}")))
}

/// Loads notes matching `where_clause`, newest modification first, with tags attached.
fn query_notes<P: rusqlite::Params>(
    conn: &Connection,
    where_clause: &str,
    params: P,
) -> Result<Vec<Note>> {
    let sql = format!(
        "SELECT {} FROM notes n {where_clause} ORDER BY n.modified_at DESC, n.id",
        CURRENT.select_list("n")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, map_note_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut notes = rows.into_iter().map(note_from_row).collect::<Result<Vec<_>>>()?;
    attach_tags(conn, &mut notes)?;
    Ok(notes)
}

fn attach_tags(conn: &Connection, notes: &mut [Note]) -> Result<()> {
    if notes.is_empty() {
        return Ok(());
    }
    if let [note] = notes {
        note.tags = load_tags(conn, note.id)?;
        return Ok(());
    }
    let mut by_note: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT note_id, tag FROM note_tags ORDER BY note_id, ordinal")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (note_id, tag) = row?;
        by_note.entry(note_id).or_default().push(tag);
    }
    for note in notes.iter_mut() {
        if let Some(tags) = by_note.remove(&note.id.to_string()) {
            note.tags = tags;
        }
    }
    Ok(())
}

pub(crate) fn load_tags(conn: &Connection, id: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM note_tags WHERE note_id = ?1 ORDER BY ordinal")?;
    let tags = stmt
        .query_map([id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

pub(crate) fn fetch_all(conn: &Connection) -> Result<Vec<Note>> {
    query_notes(conn, "", [])
}

pub(crate) fn fetch(conn: &Connection, id: Uuid) -> Result<Option<Note>> {
    Ok(query_notes(conn, "WHERE n.id = ?1", [id.to_string()])?.into_iter().next())
}

pub(crate) fn fetch_metadata(conn: &Connection) -> Result<Vec<NoteMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, color, created_at, modified_at FROM notes
         ORDER BY modified_at DESC, id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, title, color, created_at, modified_at)| {
            Ok(NoteMetadata {
                id: parse_id(&id)?,
                title,
                color: NoteColor::from_stored(&color),
                created_at: from_nanos(created_at),
                modified_at: from_nanos(modified_at),
            })
        })
        .collect()
}

pub(crate) fn exists(conn: &Connection, id: Uuid) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM notes WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?
        .is_some())
}

pub(crate) fn count(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Substring match against the search index. `needle` must already be lowercase.
pub(crate) fn search(conn: &Connection, needle: &str) -> Result<Vec<Note>> {
    query_notes(
        conn,
        "JOIN search_index s ON s.note_id = n.id WHERE instr(s.text, ?1) > 0",
        [needle],
    )
}

pub(crate) fn filter_by_color(conn: &Connection, color: NoteColor) -> Result<Vec<Note>> {
    if color != NoteColor::default() {
        return query_notes(conn, "WHERE n.color = ?1", [color.as_str()]);
    }
    // Unknown stored names read back as the default colour, so they match it too.
    let known = NoteColor::ALL
        .iter()
        .filter(|c| **c != color)
        .map(|c| format!("'{}'", c.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    query_notes(conn, &format!("WHERE n.color NOT IN ({known})"), [])
}

/// Notes carrying any of `tags`.
pub(crate) fn filter_by_tags(conn: &Connection, tags: &[String]) -> Result<Vec<Note>> {
    let placeholders = tags.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    query_notes(
        conn,
        &format!(
            "WHERE n.id IN (SELECT note_id FROM note_tags WHERE tag IN ({placeholders}))"
        ),
        params_from_iter(tags.iter()),
    )
}

pub(crate) fn all_tags(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT tag FROM note_tags ORDER BY tag")?;
    let tags = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

/// Upserts `note` with `modified_at` set to `stamp`, rewriting its tags and
/// search entry. Returns the note as stored.
///
/// Must run inside a transaction; does not open one.
pub(crate) fn write(conn: &Connection, note: &Note, stamp: DateTime<Utc>) -> Result<Note> {
    note.validate()?;
    let id = note.id.to_string();
    let modified_at = stamp.max(note.created_at);

    conn.execute(
        &CURRENT.upsert_sql(),
        rusqlite::params![
            id,
            note.title,
            note.content,
            note.color.as_str(),
            note.position.x,
            note.position.y,
            note.size.width,
            note.size.height,
            to_nanos(note.created_at)?,
            to_nanos(modified_at)?,
            note.is_markdown,
            note.is_locked,
        ],
    )?;

    conn.execute("DELETE FROM note_tags WHERE note_id = ?1", [&id])?;
    for (ordinal, tag) in note.tags.iter().enumerate() {
        conn.execute(
            "INSERT INTO note_tags (note_id, ordinal, tag) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, ordinal as i64, tag],
        )?;
    }

    conn.execute(
        "INSERT INTO search_index (note_id, text) VALUES (?1, ?2)
         ON CONFLICT(note_id) DO UPDATE SET text = excluded.text",
        rusqlite::params![id, note.search_text()],
    )?;

    let (created_at, modified_at): (i64, i64) = conn.query_row(
        "SELECT created_at, modified_at FROM notes WHERE id = ?1",
        [&id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Note {
        created_at: from_nanos(created_at),
        modified_at: from_nanos(modified_at),
        ..note.clone()
    })
}

/// Removes a note, its tags and its search entry. Returns whether a row existed.
///
/// Must run inside a transaction; does not open one.
pub(crate) fn delete(conn: &Connection, id: Uuid) -> Result<bool> {
    let id = id.to_string();
    conn.execute("DELETE FROM note_tags WHERE note_id = ?1", [&id])?;
    conn.execute("DELETE FROM search_index WHERE note_id = ?1", [&id])?;
    let removed = conn.execute("DELETE FROM notes WHERE id = ?1", [&id])?;
    Ok(removed > 0)
}

/// Sets `modified_at` to `stamp` (clamped to `created_at`). Returns whether a row existed.
pub(crate) fn touch(conn: &Connection, id: Uuid, stamp: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE notes SET modified_at = MAX(?1, created_at) WHERE id = ?2",
        rusqlite::params![to_nanos(stamp)?, id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Builds a note from loosely typed column values read with `fields`, the
/// field table of the generation that wrote them. Fields it does not declare
/// keep their defaults.
pub(crate) fn note_from_values(fields: &[FieldSpec], values: &HashMap<String, Value>) -> Result<Note> {
    let mut note = Note::new();
    for field in fields {
        let value = match values.get(field.column) {
            Some(Value::Null) | None => match field.default {
                FieldDefault::Required => {
                    return Err(CorkboardError::InvalidData(format!(
                        "legacy row is missing required column {}",
                        field.column
                    )));
                }
                _ => continue,
            },
            Some(value) => value,
        };
        let mismatch = || {
            CorkboardError::InvalidData(format!(
                "column {} has unexpected value {value:?}",
                field.column
            ))
        };
        match (field.column, field.kind, value) {
            ("id", ColumnKind::Uuid, Value::Text(s)) => note.id = parse_id(s)?,
            ("title", ColumnKind::Text, Value::Text(s)) => note.title = s.clone(),
            ("content", ColumnKind::Text, Value::Text(s)) => note.content = s.clone(),
            ("color", ColumnKind::Color, Value::Text(s)) => note.color = NoteColor::from_stored(s),
            (column, ColumnKind::Real, value) => {
                let v = match value {
                    Value::Real(v) => *v,
                    Value::Integer(i) => *i as f64,
                    _ => return Err(mismatch()),
                };
                match column {
                    "pos_x" => note.position.x = v,
                    "pos_y" => note.position.y = v,
                    "width" => note.size.width = v,
                    "height" => note.size.height = v,
                    _ => return Err(mismatch()),
                }
            }
            (column, kind @ (ColumnKind::Timestamp | ColumnKind::TimestampNanos), Value::Integer(raw)) => {
                let ts = if kind == ColumnKind::Timestamp {
                    from_millis(*raw)?
                } else {
                    from_nanos(*raw)
                };
                match column {
                    "created_at" => note.created_at = ts,
                    "modified_at" => note.modified_at = ts,
                    _ => return Err(mismatch()),
                }
            }
            ("is_markdown", ColumnKind::Bool, Value::Integer(i)) => note.is_markdown = *i != 0,
            ("is_locked", ColumnKind::Bool, Value::Integer(i)) => note.is_locked = *i != 0,
            _ => return Err(mismatch()),
        }
    }
    if note.modified_at < note.created_at {
        note.modified_at = note.created_at;
    }
    Ok(note)
}
