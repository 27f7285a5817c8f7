use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use m2m_migrate_core::{
    AssociationPair, AssociationStore, ChildId, JoinRecord, ParentId, ParentWithChildren,
    RelationLayout, StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Version 1: implicit relation only. 2: join table added. 3: implicit relation dropped.
const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_STEPS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS _m2m_schema_steps (
  join_table TEXT NOT NULL,
  version INTEGER NOT NULL,
  applied_at TEXT NOT NULL,
  PRIMARY KEY (join_table, version)
);
";

pub struct SqliteStore {
    conn: Connection,
    layout: RelationLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub relation_table_present: bool,
    pub join_table_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyReport {
    pub implicit_pairs: usize,
    pub join_records: usize,
    pub missing: Vec<AssociationPair>,
    pub unexpected: Vec<AssociationPair>,
    pub clean: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropSummary {
    pub relation_table: String,
    /// True only when the drop went ahead over a verification mismatch. A
    /// forced drop of a clean copy reports `false`.
    pub forced: bool,
    pub verification: VerifyReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open an existing SQLite database. A missing file is a connectivity error,
    /// never an implicit create.
    ///
    /// # Errors
    /// Returns [`StoreError::Connectivity`] when the file cannot be opened as a
    /// database and [`StoreError::Other`] when the layout is invalid.
    pub fn open(path: &Path, layout: RelationLayout) -> Result<Self, StoreError> {
        layout
            .validate()
            .map_err(|err| StoreError::Other(format!("invalid relation layout: {err}")))?;

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            StoreError::Connectivity(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        Self::configure(conn, layout)
    }

    /// Open a private in-memory database with the given layout.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the layout is invalid or `SQLite` refuses
    /// the connection.
    pub fn open_in_memory(layout: RelationLayout) -> Result<Self, StoreError> {
        layout
            .validate()
            .map_err(|err| StoreError::Other(format!("invalid relation layout: {err}")))?;
        let conn = Connection::open_in_memory()
            .map_err(|err| classify(&err, "failed to open in-memory sqlite database"))?;
        Self::configure(conn, layout)
    }

    fn configure(conn: Connection, layout: RelationLayout) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| classify(&err, "failed to configure sqlite pragmas"))?;

        // Opening is lazy; touching the schema is what detects a non-database file.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|err| classify(&err, "failed to read sqlite schema"))?;

        Ok(Self { conn, layout })
    }

    #[must_use]
    pub fn layout(&self) -> &RelationLayout {
        &self.layout
    }

    /// Report the effective schema step of this relation plus pending steps.
    ///
    /// Read-only: the bookkeeping table is not created here.
    ///
    /// # Errors
    /// Returns an error when `sqlite_master` or the bookkeeping table cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) =
            detect_effective_schema_version(&self.conn, &self.layout)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version.max(1) + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
            relation_table_present: table_exists(&self.conn, &self.layout.relation_table)?,
            join_table_present: table_exists(&self.conn, &self.layout.join_table)?,
        })
    }

    /// Create the explicit join table, its unique pair constraint, and indexes.
    ///
    /// Returns `false` when the table already existed.
    ///
    /// # Errors
    /// Returns an error when the parent or child table is missing or the DDL fails.
    pub fn add_join_table(&mut self) -> Result<bool> {
        self.conn
            .execute_batch(CREATE_SCHEMA_STEPS_SQL)
            .context("failed to apply schema step bookkeeping table")?;

        if table_exists(&self.conn, &self.layout.join_table)? {
            record_schema_version(&self.conn, &self.layout.join_table, 2)?;
            return Ok(false);
        }

        for table in [&self.layout.parent_table, &self.layout.child_table] {
            if !table_exists(&self.conn, table)? {
                return Err(anyhow!("cannot add join table: referenced table {table} is missing"));
            }
        }

        let tx = self.conn.transaction().context("failed to start join table transaction")?;
        tx.execute_batch(&create_join_table_sql(&self.layout))
            .with_context(|| format!("failed to create join table {}", self.layout.join_table))?;
        if table_exists(&tx, &self.layout.relation_table)? {
            record_schema_version(&tx, &self.layout.join_table, 1)?;
        }
        record_schema_version(&tx, &self.layout.join_table, 2)?;
        tx.commit().context("failed to commit join table transaction")?;

        tracing::info!(join_table = %self.layout.join_table, "created join table");
        Ok(true)
    }

    /// Load every join row in id order.
    ///
    /// # Errors
    /// Returns an error when the join table is missing or a row cannot be decoded.
    pub fn list_join_records(&self) -> Result<Vec<JoinRecord>> {
        let layout = &self.layout;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, {jp}, {jc}, created_at FROM {join} ORDER BY id ASC",
                jp = quote(&layout.join_parent_column),
                jc = quote(&layout.join_child_column),
                join = quote(&layout.join_table),
            ))
            .with_context(|| format!("failed to query join table {}", layout.join_table))?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(JoinRecord {
                id: row.get(0)?,
                parent_id: ParentId(row.get(1)?),
                child_id: ChildId(row.get(2)?),
                created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
            });
        }

        Ok(records)
    }

    /// Compare the implicit relation against the join table.
    ///
    /// # Errors
    /// Returns an error when either table is missing or cannot be read.
    pub fn verify_copy(&self) -> Result<VerifyReport> {
        let layout = &self.layout;
        if !table_exists(&self.conn, &layout.relation_table)? {
            return Err(anyhow!(
                "cannot verify: implicit relation table {} does not exist",
                layout.relation_table
            ));
        }
        if !table_exists(&self.conn, &layout.join_table)? {
            return Err(anyhow!("cannot verify: join table {} does not exist", layout.join_table));
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {a}, {b} FROM {rel}",
            a = quote(&layout.relation_parent_column),
            b = quote(&layout.relation_child_column),
            rel = quote(&layout.relation_table),
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(AssociationPair::new(ParentId(row.get(0)?), ChildId(row.get(1)?)))
        })?;
        let mut implicit = BTreeSet::new();
        for row in rows {
            implicit.insert(row?);
        }

        let joined: BTreeSet<AssociationPair> =
            self.list_join_records()?.iter().map(JoinRecord::pair).collect();

        let missing: Vec<AssociationPair> = implicit.difference(&joined).copied().collect();
        let unexpected: Vec<AssociationPair> = joined.difference(&implicit).copied().collect();
        let clean = missing.is_empty() && unexpected.is_empty();

        Ok(VerifyReport {
            implicit_pairs: implicit.len(),
            join_records: joined.len(),
            missing,
            unexpected,
            clean,
        })
    }

    /// Drop the implicit relation table once the join table mirrors it.
    ///
    /// # Errors
    /// Returns an error when verification is not clean and `force` is unset, or
    /// when the drop fails.
    pub fn drop_implicit_relation(&mut self, force: bool) -> Result<DropSummary> {
        let verification = self.verify_copy()?;
        if !verification.clean && !force {
            return Err(anyhow!(
                "refusing to drop {}: {} pairs missing from {}, {} unexpected pairs",
                self.layout.relation_table,
                verification.missing.len(),
                self.layout.join_table,
                verification.unexpected.len()
            ));
        }

        self.conn
            .execute_batch(CREATE_SCHEMA_STEPS_SQL)
            .context("failed to apply schema step bookkeeping table")?;

        let tx = self.conn.transaction().context("failed to start drop transaction")?;
        tx.execute_batch(&format!("DROP TABLE {};", quote(&self.layout.relation_table)))
            .with_context(|| format!("failed to drop {}", self.layout.relation_table))?;
        record_schema_version(&tx, &self.layout.join_table, 3)?;
        tx.commit().context("failed to commit drop transaction")?;

        if !verification.clean {
            tracing::warn!(
                relation_table = %self.layout.relation_table,
                missing = verification.missing.len(),
                unexpected = verification.unexpected.len(),
                "dropped implicit relation despite verification mismatch"
            );
        }

        Ok(DropSummary {
            relation_table: self.layout.relation_table.clone(),
            forced: !verification.clean,
            verification,
        })
    }

    /// Run quick-check, foreign-key-check, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl AssociationStore for SqliteStore {
    fn fetch_parents_with_children(&mut self) -> Result<Vec<ParentWithChildren>, StoreError> {
        let layout = &self.layout;
        let sql = format!(
            "SELECT p.{pk}, r.{b}
             FROM {parent} AS p
             LEFT JOIN {rel} AS r ON r.{a} = p.{pk}
             ORDER BY p.{pk} ASC, r.{b} ASC",
            pk = quote(&layout.parent_key),
            a = quote(&layout.relation_parent_column),
            b = quote(&layout.relation_child_column),
            parent = quote(&layout.parent_table),
            rel = quote(&layout.relation_table),
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| classify(&err, "failed to prepare parent fetch"))?;
        let mut rows = stmt.query([]).map_err(|err| classify(&err, "failed to fetch parents"))?;

        let mut parents: Vec<ParentWithChildren> = Vec::new();
        while let Some(row) = rows.next().map_err(|err| classify(&err, "failed to read row"))? {
            let parent_id = ParentId(
                row.get(0).map_err(|err| classify(&err, "failed to decode parent id"))?,
            );
            let child_id: Option<i64> =
                row.get(1).map_err(|err| classify(&err, "failed to decode child id"))?;

            if !matches!(parents.last(), Some(last) if last.id == parent_id) {
                parents.push(ParentWithChildren { id: parent_id, children: Vec::new() });
            }
            if let (Some(child_id), Some(last)) = (child_id, parents.last_mut()) {
                last.children.push(ChildId(child_id));
            }
        }

        Ok(parents)
    }

    fn insert_join(&mut self, pair: AssociationPair) -> Result<JoinRecord, StoreError> {
        let layout = &self.layout;
        let created_at = OffsetDateTime::now_utc();
        let created_at_raw = rfc3339(created_at).map_err(|err| StoreError::Other(err.to_string()))?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {join}({jp}, {jc}, created_at) VALUES (?1, ?2, ?3)",
                    join = quote(&layout.join_table),
                    jp = quote(&layout.join_parent_column),
                    jc = quote(&layout.join_child_column),
                ),
                params![pair.parent_id.0, pair.child_id.0, created_at_raw],
            )
            .map_err(|err| classify(&err, &format!("failed to insert join record {pair}")))?;

        Ok(JoinRecord {
            id: self.conn.last_insert_rowid(),
            parent_id: pair.parent_id,
            child_id: pair.child_id,
            created_at,
        })
    }

    fn release(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .map_err(|(_conn, err)| classify(&err, "failed to close sqlite connection"))
    }
}

/// Map a `rusqlite` failure onto the copier's error taxonomy.
fn classify(err: &rusqlite::Error, what: &str) -> StoreError {
    let message = format!("{what}: {err}");
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::ConstraintViolation(message),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure => StoreError::Connectivity(message),
            _ => StoreError::Other(message),
        },
        _ => StoreError::Other(message),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn create_join_table_sql(layout: &RelationLayout) -> String {
    let join = quote(&layout.join_table);
    let jp = quote(&layout.join_parent_column);
    let jc = quote(&layout.join_child_column);
    let child_index = quote(&format!("idx_{}_{}", layout.join_table, layout.join_child_column));
    format!(
        "CREATE TABLE IF NOT EXISTS {join} (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           {jp} INTEGER NOT NULL,
           {jc} INTEGER NOT NULL,
           created_at TEXT NOT NULL,
           UNIQUE ({jp}, {jc}),
           FOREIGN KEY ({jp}) REFERENCES {parent}({pk}) ON DELETE CASCADE ON UPDATE CASCADE,
           FOREIGN KEY ({jc}) REFERENCES {child}({ck}) ON DELETE CASCADE ON UPDATE CASCADE
         );
         CREATE INDEX IF NOT EXISTS {child_index} ON {join}({jc});",
        parent = quote(&layout.parent_table),
        pk = quote(&layout.parent_key),
        child = quote(&layout.child_table),
        ck = quote(&layout.child_key),
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection, join_table: &str) -> Result<i64> {
    if !table_exists(conn, "_m2m_schema_steps")? {
        return Ok(0);
    }
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _m2m_schema_steps WHERE join_table = ?1 COLLATE NOCASE",
            params![join_table],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(
    conn: &Connection,
    layout: &RelationLayout,
) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn, &layout.join_table)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let has_relation = table_exists(conn, &layout.relation_table)?;
    let has_join = table_exists(conn, &layout.join_table)?;
    let inferred = match (has_relation, has_join) {
        (true, false) => 1,
        (true, true) => 2,
        (false, true) => 3,
        (false, false) => {
            return Err(anyhow!(
                "database has neither implicit relation table {} nor join table {}",
                layout.relation_table,
                layout.join_table
            ))
        }
    };
    Ok((inferred, true))
}

fn record_schema_version(conn: &Connection, join_table: &str, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO _m2m_schema_steps(join_table, version, applied_at) VALUES (?1, ?2, ?3)",
        params![join_table, version, now],
    )
    .with_context(|| format!("failed to record schema step {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
