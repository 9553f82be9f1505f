//! Statically declared store schema.
//!
//! Every schema generation the engine has shipped is described by a
//! [`SchemaDescriptor`]: a table of [`FieldSpec`]s for the `notes` table plus the
//! auxiliary tables that exist alongside it. The same tables drive DDL, the
//! upsert statement, migration row mapping, import validation and the schema
//! signature written to `store_meta`.

use rusqlite::{Connection, OptionalExtension};

use crate::Result;

/// SQLite storage class of a column, plus how the engine interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Hyphenated UUID text.
    Uuid,
    Text,
    /// Lowercase colour name; unknown names read as the default colour.
    Color,
    Real,
    /// `0` / `1` integer.
    Bool,
    /// Milliseconds since the Unix epoch. Schema v1 only.
    Timestamp,
    /// Nanoseconds since the Unix epoch.
    TimestampNanos,
}

impl ColumnKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Text => "text",
            Self::Color => "color",
            Self::Real => "real",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::TimestampNanos => "timestamp_ns",
        }
    }
}

/// Value a field takes when a record or a legacy row does not supply it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldDefault {
    /// The field must always be present.
    Required,
    Text(&'static str),
    Real(f64),
    Bool(bool),
    /// The time the record is materialised.
    Now,
}

/// One column of the `notes` table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub column: &'static str,
    /// Dotted path of the field in the serialised record, e.g. `size.width`.
    pub record_key: &'static str,
    pub kind: ColumnKind,
    pub default: FieldDefault,
}

impl FieldSpec {
    const fn new(
        column: &'static str,
        record_key: &'static str,
        kind: ColumnKind,
        default: FieldDefault,
    ) -> Self {
        Self {
            column,
            record_key,
            kind,
            default,
        }
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        !matches!(self.default, FieldDefault::Required)
    }

    fn sql_declaration(&self) -> String {
        let storage = match self.kind {
            ColumnKind::Uuid => return format!("{} TEXT PRIMARY KEY NOT NULL", self.column),
            ColumnKind::Text | ColumnKind::Color => "TEXT",
            ColumnKind::Real => "REAL",
            ColumnKind::Bool | ColumnKind::Timestamp | ColumnKind::TimestampNanos => "INTEGER",
        };
        let default = match self.default {
            FieldDefault::Text(s) => format!(" DEFAULT '{}'", s.replace('\'', "''")),
            FieldDefault::Real(v) => format!(" DEFAULT {v:?}"),
            FieldDefault::Bool(b) => format!(" DEFAULT {}", i32::from(b)),
            FieldDefault::Required | FieldDefault::Now => String::new(),
        };
        format!("{} {storage} NOT NULL{default}", self.column)
    }

    fn signature_fragment(&self) -> String {
        format!("{}:{}:{:?}", self.column, self.kind.as_str(), self.default)
    }
}

use ColumnKind as K;
use FieldDefault as D;

const V1_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", "id", K::Uuid, D::Required),
    FieldSpec::new("title", "title", K::Text, D::Text("")),
    FieldSpec::new("content", "content", K::Text, D::Text("")),
    FieldSpec::new("color", "color", K::Color, D::Text("yellow")),
    FieldSpec::new("pos_x", "position.x", K::Real, D::Real(0.0)),
    FieldSpec::new("pos_y", "position.y", K::Real, D::Real(0.0)),
    FieldSpec::new("width", "size.width", K::Real, D::Real(300.0)),
    FieldSpec::new("height", "size.height", K::Real, D::Real(200.0)),
    FieldSpec::new("created_at", "createdAt", K::Timestamp, D::Now),
    FieldSpec::new("modified_at", "modifiedAt", K::Timestamp, D::Now),
];

const V2_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", "id", K::Uuid, D::Required),
    FieldSpec::new("title", "title", K::Text, D::Text("")),
    FieldSpec::new("content", "content", K::Text, D::Text("")),
    FieldSpec::new("color", "color", K::Color, D::Text("yellow")),
    FieldSpec::new("pos_x", "position.x", K::Real, D::Real(0.0)),
    FieldSpec::new("pos_y", "position.y", K::Real, D::Real(0.0)),
    FieldSpec::new("width", "size.width", K::Real, D::Real(300.0)),
    FieldSpec::new("height", "size.height", K::Real, D::Real(200.0)),
    FieldSpec::new("created_at", "createdAt", K::TimestampNanos, D::Now),
    FieldSpec::new("modified_at", "modifiedAt", K::TimestampNanos, D::Now),
    FieldSpec::new("is_markdown", "isMarkdown", K::Bool, D::Bool(false)),
    FieldSpec::new("is_locked", "isLocked", K::Bool, D::Bool(false)),
];

/// Name of the ordered tag table.
pub const TAGS_TABLE: &str = "note_tags";
/// Name of the denormalised search table.
pub const SEARCH_TABLE: &str = "search_index";

/// One generation of the on-disk schema.
#[derive(Debug, PartialEq)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub fields: &'static [FieldSpec],
    pub auxiliary_tables: &'static [&'static str],
}

/// The schema this build writes.
pub const CURRENT: SchemaDescriptor = SchemaDescriptor {
    version: 2,
    fields: V2_FIELDS,
    auxiliary_tables: &[TAGS_TABLE, SEARCH_TABLE],
};

/// First shipped schema: no markdown/lock flags, no tags, no search table.
pub const V1: SchemaDescriptor = SchemaDescriptor {
    version: 1,
    fields: V1_FIELDS,
    auxiliary_tables: &[],
};

/// Older generations that can be mapped onto [`CURRENT`].
pub const HISTORY: &[&SchemaDescriptor] = &[&V1];

impl SchemaDescriptor {
    /// Stable fingerprint of this generation, stored in `store_meta`.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("v{};", self.version).as_bytes());
        for field in self.fields {
            hasher.update(field.signature_fragment().as_bytes());
            hasher.update(b";");
        }
        for table in self.auxiliary_tables {
            hasher.update(format!("+{table};").as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    #[must_use]
    pub fn field(&self, column: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.column == column)
    }

    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.auxiliary_tables.contains(&table)
    }

    /// Comma-separated column list, each qualified with `alias`.
    #[must_use]
    pub fn select_list(&self, alias: &str) -> String {
        self.fields
            .iter()
            .map(|f| format!("{alias}.{}", f.column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `INSERT … ON CONFLICT(id) DO UPDATE` over every column.
    ///
    /// `created_at` is only written on insert; on update the stored value
    /// wins and `modified_at` is clamped so it never precedes it.
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let columns: Vec<&str> = self.fields.iter().map(|f| f.column).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !matches!(**c, "id" | "created_at"))
            .map(|c| match *c {
                "modified_at" => {
                    "modified_at = MAX(excluded.modified_at, notes.created_at)".to_string()
                }
                other => format!("{other} = excluded.{other}"),
            })
            .collect();
        format!(
            "INSERT INTO notes ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        )
    }

    fn create_notes_sql(&self) -> String {
        let columns: Vec<String> = self.fields.iter().map(FieldSpec::sql_declaration).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS notes (\n    {}\n)",
            columns.join(",\n    ")
        )
    }

    /// Creates every table of this generation on `conn` and stamps `store_meta`.
    pub(crate) fn create_tables(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&self.create_notes_sql())?;
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_notes_modified ON notes(modified_at DESC);
             CREATE TABLE IF NOT EXISTS store_meta (
                 key TEXT PRIMARY KEY NOT NULL,
                 value TEXT NOT NULL
             );",
        )?;
        if self.has_table(TAGS_TABLE) {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS note_tags (
                     note_id TEXT NOT NULL,
                     ordinal INTEGER NOT NULL,
                     tag TEXT NOT NULL,
                     PRIMARY KEY (note_id, ordinal)
                 );
                 CREATE INDEX IF NOT EXISTS idx_note_tags_tag ON note_tags(tag);",
            )?;
        }
        if self.has_table(SEARCH_TABLE) {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS search_index (
                     note_id TEXT PRIMARY KEY NOT NULL,
                     text TEXT NOT NULL
                 );",
            )?;
        }
        write_store_meta(conn, self)
    }
}

/// Schema identity read back from `store_meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSchema {
    pub version: u32,
    pub signature: String,
}

/// Creates the current schema on `conn` if it is not already present.
pub(crate) fn init(conn: &Connection) -> Result<()> {
    CURRENT.create_tables(conn)
}

fn write_store_meta(conn: &Connection, schema: &SchemaDescriptor) -> Result<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [schema.version.to_string()],
    )?;
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('schema_signature', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [schema.signature()],
    )?;
    Ok(())
}

/// Returns `true` if the database contains no user tables at all.
pub(crate) fn is_blank(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count == 0)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Reads the schema identity from `store_meta`, or `None` if it was never written.
pub(crate) fn read_stored_schema(conn: &Connection) -> Result<Option<StoredSchema>> {
    if !table_exists(conn, "store_meta")? {
        return Ok(None);
    }
    let lookup = |key: &str| -> Result<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM store_meta WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?)
    };
    let (Some(version), Some(signature)) = (lookup("schema_version")?, lookup("schema_signature")?)
    else {
        return Ok(None);
    };
    let version = version.parse::<u32>().map_err(|_| {
        crate::CorkboardError::StoreCorrupt(format!("unreadable schema version {version:?}"))
    })?;
    Ok(Some(StoredSchema { version, signature }))
}

/// Finds the generation whose shape matches the live tables.
///
/// Used for stores whose metadata is missing.
pub(crate) fn infer_schema(conn: &Connection) -> Result<Option<&'static SchemaDescriptor>> {
    if !table_exists(conn, "notes")? {
        return Ok(None);
    }
    let mut columns = table_columns(conn, "notes")?;
    columns.sort();
    for candidate in std::iter::once(&CURRENT).chain(HISTORY.iter().copied()) {
        let mut expected: Vec<&str> = candidate.fields.iter().map(|f| f.column).collect();
        expected.sort_unstable();
        if columns != expected {
            continue;
        }
        let mut tables_match = true;
        for table in [TAGS_TABLE, SEARCH_TABLE] {
            if table_exists(conn, table)? != candidate.has_table(table) {
                tables_match = false;
            }
        }
        if tables_match {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Looks up a descriptor by stored signature among the current and historical generations.
#[must_use]
pub fn descriptor_for_signature(signature: &str) -> Option<&'static SchemaDescriptor> {
    std::iter::once(&CURRENT)
        .chain(HISTORY.iter().copied())
        .find(|d| d.signature() == signature)
}
