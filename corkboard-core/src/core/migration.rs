//! Schema migration for on-disk stores.
//!
//! A store written by an older generation is copied row by row into a fresh
//! store at `<path>.migrating` using the current schema, then swapped over the
//! original file. Columns the old generation lacked take the defaults declared
//! in [`crate::core::schema`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::core::records;
use crate::core::schema::{self, SchemaDescriptor, CURRENT, TAGS_TABLE};
use crate::core::storage::{remove_store_files, store_files};
use crate::{CorkboardError, MigrationFailure, Result};

/// Result of [`migrate_if_needed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Nothing to do: no store, a blank store, or already current.
    #[default]
    UpToDate,
    Migrated { from_version: u32, records: usize },
}

fn open_existing(path: &Path) -> Result<Connection> {
    Ok(Connection::open(path)?)
}

fn migration_temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".migrating");
    PathBuf::from(name)
}

/// Returns `true` if the store at `path` was written by a different schema.
///
/// A missing or blank store needs no migration.
///
/// # Errors
///
/// Returns [`CorkboardError::Database`] if the file is not a readable SQLite
/// database.
pub fn requires_migration(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let conn = open_existing(path)?;
    if schema::is_blank(&conn)? {
        return Ok(false);
    }
    let current = CURRENT.signature();
    match schema::read_stored_schema(&conn)? {
        Some(stored) => Ok(stored.signature != current),
        None => Ok(schema::infer_schema(&conn)? != Some(&CURRENT)),
    }
}

/// Finds the generation that wrote the store, by stored signature or by shape.
fn locate_source_schema(conn: &Connection) -> Result<&'static SchemaDescriptor> {
    match schema::read_stored_schema(conn)? {
        Some(stored) if stored.version > CURRENT.version => {
            Err(MigrationFailure::IncompatibleVersion {
                found: stored.version,
                current: CURRENT.version,
            }
            .into())
        }
        Some(stored) => schema::descriptor_for_signature(&stored.signature).ok_or_else(|| {
            let short: String = stored.signature.chars().take(12).collect();
            MigrationFailure::NoSourceSchema(format!(
                "schema v{} ({short}) is not a known generation",
                stored.version
            ))
            .into()
        }),
        None => schema::infer_schema(conn)?.ok_or_else(|| {
            MigrationFailure::NoSourceSchema(
                "notes table does not match any known generation".to_string(),
            )
            .into()
        }),
    }
}

/// Cheap probe: can the store be brought to the current schema without a reset?
///
/// True for a nonexistent or blank store, a store already at the current
/// schema, or a store whose generation has a mapping to it.
///
/// # Errors
///
/// Returns [`CorkboardError::Database`] if the file is not a readable SQLite
/// database.
pub fn can_perform_lightweight_migration(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    let conn = open_existing(path)?;
    if schema::is_blank(&conn)? {
        return Ok(true);
    }
    match locate_source_schema(&conn) {
        Ok(_) => Ok(true),
        Err(CorkboardError::MigrationFailed(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Migrates the store at `path` to the current schema if it needs it.
///
/// # Errors
///
/// - [`MigrationFailure::NoSourceSchema`] if no known generation matches.
/// - [`MigrationFailure::IncompatibleVersion`] if the store is newer than this build.
/// - [`MigrationFailure::Mapping`] if copying records failed; the original
///   store is left untouched and the temporary store is removed.
pub fn migrate_if_needed(path: &Path) -> Result<MigrationOutcome> {
    if !requires_migration(path)? {
        return Ok(MigrationOutcome::UpToDate);
    }
    let source = {
        let conn = open_existing(path)?;
        locate_source_schema(&conn)?
    };
    if source == &CURRENT {
        return Ok(MigrationOutcome::UpToDate);
    }
    info!(
        "migrating store {} from schema v{} to v{}",
        path.display(),
        source.version,
        CURRENT.version
    );

    let temp = migration_temp_path(path);
    remove_store_files(&temp)?;
    let records = match copy_into(path, &temp, source) {
        Ok(count) => count,
        Err(e) => {
            if let Err(cleanup) = remove_store_files(&temp) {
                warn!("could not remove {}: {cleanup}", temp.display());
            }
            return Err(MigrationFailure::Mapping(e.to_string()).into());
        }
    };

    for side in &store_files(path)[1..] {
        match fs::remove_file(side) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    fs::rename(&temp, path)?;
    remove_store_files(&temp)?;

    info!("migrated {records} notes in {}", path.display());
    Ok(MigrationOutcome::Migrated {
        from_version: source.version,
        records,
    })
}

/// Copies every note from the store at `source_path` into a new current-schema
/// store at `temp_path`. Both connections are closed on return.
fn copy_into(source_path: &Path, temp_path: &Path, source: &SchemaDescriptor) -> Result<usize> {
    let src = open_existing(source_path)?;
    src.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;

    let mut dst = Connection::open(temp_path)?;
    schema::init(&dst)?;
    let tx = dst.transaction()?;

    let columns: Vec<&str> = source.fields.iter().map(|f| f.column).collect();
    let mut stmt = src.prepare(&format!("SELECT {} FROM notes", columns.join(", ")))?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while let Some(row) = rows.next()? {
        let mut values = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            values.insert((*column).to_string(), row.get::<_, Value>(i)?);
        }
        let mut note = records::note_from_values(source.fields, &values)?;
        if source.has_table(TAGS_TABLE) {
            note.tags = records::load_tags(&src, note.id)?;
        }
        let stamp = note.modified_at;
        records::write(&tx, &note, stamp)?;
        count += 1;
    }
    tx.commit()?;
    Ok(count)
}
