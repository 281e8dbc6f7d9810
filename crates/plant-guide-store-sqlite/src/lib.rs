use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use plant_guide_core::{
    AddSummary, Batch, CollectionId, CollectionRef, DocumentStore, GuideError, IngestReport,
    Metadata, PlantCollections, ReportStatus, ReportedPlant, REPORTS_COLLECTION,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const DATABASE_FILE: &str = "plant_guide.sqlite3";

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  collection_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
  collection_id TEXT NOT NULL,
  document_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  document TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (collection_id, document_id),
  FOREIGN KEY (collection_id) REFERENCES collections(collection_id)
);

CREATE TABLE IF NOT EXISTS ingest_runs (
  run_id TEXT PRIMARY KEY,
  collection TEXT NOT NULL,
  source TEXT NOT NULL,
  source_sha256 TEXT,
  rows INTEGER NOT NULL CHECK (rows >= 0),
  inserted INTEGER NOT NULL CHECK (inserted >= 0),
  skipped_existing INTEGER NOT NULL CHECK (skipped_existing >= 0),
  ingested_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_position ON documents(collection_id, position);
CREATE INDEX IF NOT EXISTS idx_ingest_runs_collection ON ingest_runs(collection);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionSummary {
    pub collection_id: String,
    pub name: String,
    pub created_at: String,
    pub documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub position: i64,
    pub document: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRunRecord {
    pub run_id: String,
    pub collection: String,
    pub source: String,
    pub source_sha256: Option<String>,
    pub rows: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub ingested_at: String,
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
    /// Open a SQLite-backed document store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open the store that lives inside a persistence directory, creating the directory.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or the database cannot be opened.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        Self::open(&database_path(dir))
    }

    /// Compare the store's recorded schema version with the one this build expects.
    ///
    /// A fresh store directory reports version 0 with every migration pending.
    ///
    /// # Errors
    /// Returns an error when the migrations ledger cannot be created or read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        ensure_migrations_ledger(&self.conn)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = (current_version + 1..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>();

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Create the collection, document, and ingest-run tables if the store is new.
    ///
    /// # Errors
    /// Returns an error when a table cannot be created or the store was written by a
    /// newer schema than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        ensure_migrations_ledger(&self.conn)?;

        if current_schema_version(&self.conn)? == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to create plant guide tables")?;
            record_schema_version(&self.conn, 1)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "store schema is at version {version} but this build only knows version {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Look up a collection by name without creating it.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails or the stored id is malformed.
    pub fn find_collection(&self, name: &str) -> Result<Option<CollectionRef>> {
        let raw = self
            .conn
            .query_row(
                "SELECT collection_id FROM collections WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up collection {name}"))?;

        match raw {
            Some(raw) => Ok(Some(CollectionRef {
                collection_id: parse_collection_id(&raw)?,
                name: name.to_string(),
            })),
            None => Ok(None),
        }
    }

    /// Return the named collection, creating it when it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the lookup or the insert fails.
    pub fn ensure_collection(&mut self, name: &str) -> Result<CollectionRef> {
        if name.trim().is_empty() {
            return Err(anyhow!("collection name MUST NOT be empty"));
        }
        if let Some(existing) = self.find_collection(name)? {
            return Ok(existing);
        }

        let collection = CollectionRef { collection_id: CollectionId::new(), name: name.to_string() };
        self.conn
            .execute(
                "INSERT INTO collections(collection_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![collection.collection_id.to_string(), collection.name, now_rfc3339()?],
            )
            .with_context(|| format!("failed to create collection {name}"))?;
        tracing::debug!(collection = %name, "created collection");
        Ok(collection)
    }

    /// Insert a batch into one collection inside a single transaction.
    ///
    /// Ids already present in the collection, including ones repeated earlier in the same
    /// batch, are left untouched and counted as skipped.
    ///
    /// # Errors
    /// Returns an error when the batch is uneven, the collection is unknown, or any write fails.
    pub fn insert_batch(&mut self, collection: &CollectionRef, batch: &Batch) -> Result<AddSummary> {
        batch.validate().map_err(|err| anyhow!("batch validation failed: {err}"))?;

        let collection_id = collection.collection_id.to_string();
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let known = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM collections WHERE collection_id = ?1)",
                params![collection_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check collection")?;
        if known != 1 {
            return Err(anyhow!("unknown collection {} ({collection_id})", collection.name));
        }

        let mut next_position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM documents WHERE collection_id = ?1",
                params![collection_id],
                |row| row.get(0),
            )
            .context("failed to read next document position")?;
        let created_at = now_rfc3339()?;

        let mut summary = AddSummary::default();
        for (id, document, metadata) in batch.entries() {
            let metadata_json =
                serde_json::to_string(metadata).context("failed to serialize metadata")?;
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO documents(
                        collection_id, document_id, position, document, metadata_json, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![collection_id, id, next_position, document, metadata_json, created_at],
                )
                .with_context(|| format!("failed to insert document {id}"))?;

            if changed == 0 {
                tracing::warn!(collection = %collection.name, id, "document id already exists; skipping");
                summary.skipped_existing += 1;
            } else {
                summary.inserted += 1;
                next_position += 1;
            }
        }

        tx.commit().context("failed to commit batch transaction")?;
        Ok(summary)
    }

    /// List every collection with its document count.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_collections(&self) -> Result<Vec<CollectionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.collection_id, c.name, c.created_at, COUNT(d.document_id)
             FROM collections c
             LEFT JOIN documents d ON d.collection_id = c.collection_id
             GROUP BY c.collection_id, c.name, c.created_at
             ORDER BY c.name ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut collections = Vec::new();
        while let Some(row) = rows.next()? {
            collections.push(CollectionSummary {
                collection_id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                documents: to_usize(row.get(3)?)?,
            });
        }
        Ok(collections)
    }

    /// Count documents stored in the named collection.
    ///
    /// # Errors
    /// Returns an error when the collection does not exist or the count query fails.
    pub fn count(&self, name: &str) -> Result<usize> {
        let collection = self.require_collection(name)?;
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection_id = ?1",
                params![collection.collection_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count documents in {name}"))?;
        to_usize(count)
    }

    /// Load all documents of the named collection in insertion order.
    ///
    /// # Errors
    /// Returns an error when the collection does not exist or rows cannot be decoded.
    pub fn get_documents(&self, name: &str) -> Result<Vec<StoredDocument>> {
        let collection = self.require_collection(name)?;
        let mut stmt = self.conn.prepare(
            "SELECT document_id, position, document, metadata_json
             FROM documents
             WHERE collection_id = ?1
             ORDER BY position ASC",
        )?;
        let mut rows = stmt.query(params![collection.collection_id.to_string()])?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let metadata_json: String = row.get(3)?;
            documents.push(StoredDocument {
                id: row.get(0)?,
                position: row.get(1)?,
                document: row.get(2)?,
                metadata: serde_json::from_str(&metadata_json)
                    .context("failed to deserialize stored metadata")?,
            });
        }
        Ok(documents)
    }

    /// Delete a collection and all of its documents. Returns `false` when it did not exist.
    ///
    /// # Errors
    /// Returns an error when any delete in the transaction fails.
    pub fn delete_collection(&mut self, name: &str) -> Result<bool> {
        let Some(collection) = self.find_collection(name)? else {
            return Ok(false);
        };
        let collection_id = collection.collection_id.to_string();

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM documents WHERE collection_id = ?1", params![collection_id])
            .context("failed to delete collection documents")?;
        tx.execute("DELETE FROM collections WHERE collection_id = ?1", params![collection_id])
            .context("failed to delete collection")?;
        tx.commit().context("failed to commit delete transaction")?;
        Ok(true)
    }

    /// Reports from the reports collection, newest first, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when the collection is missing or a stored report does not decode.
    pub fn list_reports(
        &self,
        status: Option<ReportStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ReportedPlant>> {
        let mut reports = Vec::new();
        for document in self.get_documents(REPORTS_COLLECTION)?.into_iter().rev() {
            let report = ReportedPlant::from_metadata(&document.id, &document.metadata)?;
            if status.map_or(true, |wanted| report.status == wanted) {
                reports.push(report);
            }
            if limit.is_some_and(|limit| reports.len() >= limit) {
                break;
            }
        }
        Ok(reports)
    }

    /// Change the status of a stored report. Returns `false` when no report has `id`.
    ///
    /// # Errors
    /// Returns an error when the reports collection is missing or the update fails.
    pub fn set_report_status(&mut self, id: &str, status: ReportStatus) -> Result<bool> {
        let collection = self.require_collection(REPORTS_COLLECTION)?;
        let collection_id = collection.collection_id.to_string();

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let metadata_json: Option<String> = tx
            .query_row(
                "SELECT metadata_json FROM documents WHERE collection_id = ?1 AND document_id = ?2",
                params![collection_id, id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load report {id}"))?;
        let Some(metadata_json) = metadata_json else {
            return Ok(false);
        };

        let mut metadata: Metadata = serde_json::from_str(&metadata_json)
            .context("failed to deserialize stored metadata")?;
        metadata.insert("status".to_string(), status.as_str().to_string());
        tx.execute(
            "UPDATE documents SET metadata_json = ?1 WHERE collection_id = ?2 AND document_id = ?3",
            params![serde_json::to_string(&metadata)?, collection_id, id],
        )
        .with_context(|| format!("failed to update report {id}"))?;
        tx.commit().context("failed to commit report status")?;

        tracing::info!(id, status = status.as_str(), "updated report status");
        Ok(true)
    }

    /// Persist provenance for one completed ingest.
    ///
    /// Call this after the batch has been committed. The run row is written in its own
    /// statement, so a failure here leaves the ingested documents in place without a run
    /// row. Re-running the same ingest is safe: existing ids are skipped and the run is
    /// recorded with `skipped_existing` counts.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_ingest_run(&mut self, source: &str, report: &IngestReport) -> Result<IngestRunRecord> {
        let run = IngestRunRecord {
            run_id: Ulid::new().to_string(),
            collection: report.collection.clone(),
            source: source.to_string(),
            source_sha256: report.source_sha256.clone(),
            rows: report.rows,
            inserted: report.inserted,
            skipped_existing: report.skipped_existing,
            ingested_at: now_rfc3339()?,
        };

        self.conn
            .execute(
                "INSERT INTO ingest_runs(
                    run_id, collection, source, source_sha256, rows, inserted, skipped_existing, ingested_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.run_id,
                    run.collection,
                    run.source,
                    run.source_sha256,
                    to_i64(run.rows)?,
                    to_i64(run.inserted)?,
                    to_i64(run.skipped_existing)?,
                    run.ingested_at,
                ],
            )
            .context("failed to record ingest run")?;
        Ok(run)
    }

    /// List recorded ingest runs, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_ingest_runs(&self) -> Result<Vec<IngestRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, collection, source, source_sha256, rows, inserted, skipped_existing, ingested_at
             FROM ingest_runs
             ORDER BY run_id ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(IngestRunRecord {
                run_id: row.get(0)?,
                collection: row.get(1)?,
                source: row.get(2)?,
                source_sha256: row.get(3)?,
                rows: to_usize(row.get(4)?)?,
                inserted: to_usize(row.get(5)?)?,
                skipped_existing: to_usize(row.get(6)?)?,
                ingested_at: row.get(7)?,
            });
        }
        Ok(runs)
    }

    /// Check the store file for corruption, documents pointing at missing collections,
    /// and outstanding migrations.
    ///
    /// # Errors
    /// Returns an error when one of the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("sqlite quick_check did not run")?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let foreign_key_violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to scan documents for orphaned collection ids")?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn require_collection(&self, name: &str) -> Result<CollectionRef> {
        self.find_collection(name)?.ok_or_else(|| anyhow!("collection does not exist: {name}"))
    }
}

impl DocumentStore for SqliteStore {
    fn get_or_create_collection(&mut self, name: &str) -> Result<CollectionRef, GuideError> {
        self.ensure_collection(name).map_err(store_error)
    }

    fn add(&mut self, collection: &CollectionRef, batch: &Batch) -> Result<AddSummary, GuideError> {
        batch.validate()?;
        self.insert_batch(collection, batch).map_err(store_error)
    }
}

/// A migrated store plus the two collections the plant guide works with.
pub struct PlantStore {
    pub store: SqliteStore,
    pub collections: PlantCollections,
}

impl PlantStore {
    /// Open the persistence directory, migrate it, and get or create both collections.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened, migrated, or initialized.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut store = SqliteStore::open_dir(dir)?;
        store.migrate()?;
        let collections = PlantCollections::initialize(&mut store)
            .context("failed to initialize plant collections")?;
        tracing::info!(store_dir = %dir.display(), "plant store ready");
        Ok(Self { store, collections })
    }
}

#[must_use]
pub fn database_path(dir: &Path) -> PathBuf {
    dir.join(DATABASE_FILE)
}

fn store_error(err: anyhow::Error) -> GuideError {
    GuideError::Store(format!("{err:#}"))
}

fn ensure_migrations_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to create schema_migrations ledger")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_collection_id(raw: &str) -> Result<CollectionId> {
    let parsed = Ulid::from_str(raw).with_context(|| format!("invalid collection ULID: {raw}"))?;
    Ok(CollectionId(parsed))
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("count out of range: {value}"))
}
