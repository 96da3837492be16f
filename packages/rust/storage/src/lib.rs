//! libSQL storage layer for the linkflow item store.
//!
//! The [`Storage`] struct wraps a libSQL database holding work items, their
//! provenance history, one output table per stage, and the transition audit
//! log.
//!
//! **Concurrency rules:**
//! - Every state change goes through [`Storage::apply`], a conditional
//!   update on `(id, status, revision)`. Zero affected rows means another
//!   writer got there first; the caller gets `None` and moves on.
//! - Multi-row effects (status + stage output + audit rows) commit in one
//!   IMMEDIATE transaction on a dedicated connection, so they land together
//!   or not at all.
//! - Reads use the shared connection and never take part in a transaction.

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use linkflow_shared::{
    Classification, ItemId, LinkflowError, Outcome, Provenance, Result, Stage,
    StageOutput, Status, TransitionRecord, UpsertResult, WorkItem,
};

/// How long a writer waits for another writer's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Column list shared by every query that materializes a [`WorkItem`].
const ITEM_COLUMNS: &str = "id, identity_key, link, classification, status, attempt_count, \
     total_attempts, next_eligible_at, last_error, failed_stage, revision, status_changed_at, \
     source, locator, category, date_in_source, created_at, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Target field values for a conditional write. Start from the current item
/// with [`ItemUpdate::from`] and change what the transition changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub status: Status,
    pub classification: Classification,
    pub attempt_count: u32,
    pub total_attempts: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub failed_stage: Option<Stage>,
}

impl From<&WorkItem> for ItemUpdate {
    fn from(item: &WorkItem) -> Self {
        Self {
            status: item.status,
            classification: item.classification,
            attempt_count: item.attempt_count,
            total_attempts: item.total_attempts,
            next_eligible_at: item.next_eligible_at,
            last_error: item.last_error.clone(),
            failed_stage: item.failed_stage,
        }
    }
}

/// A compare-and-swap against one item plus the rows that must land with it.
#[derive(Debug, Clone)]
pub struct ConditionalWrite<'a> {
    pub item_id: ItemId,
    /// Status the writer observed.
    pub expected_status: Status,
    /// Revision the writer observed.
    pub expected_revision: i64,
    pub update: ItemUpdate,
    /// Stage output to upsert in the same transaction.
    pub output: Option<&'a StageOutput>,
    /// Audit rows describing the transition(s) this write performs.
    pub audit: &'a [TransitionRecord],
    pub at: DateTime<Utc>,
}

/// One recorded sighting of a link by a source.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub provenance: Provenance,
    pub seen_at: DateTime<Utc>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LinkflowError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        // WAL lets readers proceed while a writer holds the lock.
        conn.query("PRAGMA journal_mode = WAL", params![])
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status and inspection).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LinkflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LinkflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Begin an IMMEDIATE transaction on a fresh connection. The write lock
    /// is taken up front, so the conditional update inside cannot be
    /// interleaved with another writer's.
    async fn write_tx(&self) -> Result<Transaction> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Insert a new item for `identity_key`, or merge `provenance` into the
    /// existing one. Never touches status, so re-ingestion cannot regress it.
    pub async fn upsert_item(
        &self,
        identity_key: &str,
        link: &str,
        provenance: &Provenance,
        at: DateTime<Utc>,
    ) -> Result<UpsertResult> {
        let tx = self.write_tx().await?;
        let now = fmt_ts(at);
        let new_id = ItemId::new();

        let affected = tx
            .execute(
                "INSERT INTO work_items (id, identity_key, link, classification, status,
                     next_eligible_at, status_changed_at, source, locator, category,
                     date_in_source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'unknown', 'new', ?4, ?4, ?5, ?6, ?7, ?8, ?4, ?4)
                 ON CONFLICT(identity_key) DO NOTHING",
                params![
                    new_id.to_string(),
                    identity_key,
                    link,
                    now.as_str(),
                    provenance.source.as_deref(),
                    provenance.locator.as_deref(),
                    provenance.category.as_deref(),
                    provenance.date_in_source.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;

        let inserted = affected == 1;
        let id = if inserted {
            new_id
        } else {
            tx.execute(
                "UPDATE work_items SET
                   source = COALESCE(?2, source),
                   locator = COALESCE(?3, locator),
                   category = COALESCE(?4, category),
                   date_in_source = COALESCE(?5, date_in_source),
                   updated_at = ?6
                 WHERE identity_key = ?1",
                params![
                    identity_key,
                    provenance.source.as_deref(),
                    provenance.locator.as_deref(),
                    provenance.category.as_deref(),
                    provenance.date_in_source.as_deref(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

            let mut rows = tx
                .query(
                    "SELECT id FROM work_items WHERE identity_key = ?1",
                    params![identity_key],
                )
                .await
                .map_err(db_err)?;
            let row = rows
                .next()
                .await
                .map_err(db_err)?
                .ok_or_else(|| LinkflowError::not_found(identity_key))?;
            parse_id(&row.get::<String>(0).map_err(db_err)?)?
        };

        tx.execute(
            "INSERT INTO item_provenance (item_id, source, locator, category, date_in_source, seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                provenance.source.as_deref(),
                provenance.locator.as_deref(),
                provenance.category.as_deref(),
                provenance.date_in_source.as_deref(),
                now.as_str(),
            ],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(UpsertResult { id, inserted })
    }

    // -----------------------------------------------------------------------
    // Item reads
    // -----------------------------------------------------------------------

    /// Get an item by id.
    pub async fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>> {
        self.query_one(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            id.to_string(),
        )
        .await
    }

    /// Get an item by its identity key.
    pub async fn get_item_by_key(&self, identity_key: &str) -> Result<Option<WorkItem>> {
        self.query_one(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE identity_key = ?1"),
            identity_key.to_string(),
        )
        .await
    }

    async fn query_one(&self, sql: &str, arg: String) -> Result<Option<WorkItem>> {
        let mut rows = self.conn.query(sql, params![arg]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Items in `status` that are eligible at `now`, oldest eligibility first.
    pub async fn list_eligible(
        &self,
        status: Status,
        now: DateTime<Utc>,
        classification: Option<Classification>,
        limit: u32,
    ) -> Result<Vec<WorkItem>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM work_items
                     WHERE status = ?1 AND next_eligible_at <= ?2
                       AND (?3 IS NULL OR classification = ?3)
                     ORDER BY next_eligible_at, id
                     LIMIT ?4"
                ),
                params![
                    status.to_string(),
                    fmt_ts(now),
                    classification.map(Classification::as_str),
                    i64::from(limit),
                ],
            )
            .await
            .map_err(db_err)?;
        collect_items(&mut rows).await
    }

    /// Items that entered `status` strictly before `cutoff`, longest-waiting first.
    pub async fn list_in_state_since(
        &self,
        status: Status,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkItem>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM work_items
                     WHERE status = ?1 AND status_changed_at < ?2
                     ORDER BY status_changed_at, id
                     LIMIT ?3"
                ),
                params![status.to_string(), fmt_ts(cutoff), i64::from(limit)],
            )
            .await
            .map_err(db_err)?;
        collect_items(&mut rows).await
    }

    /// Items in `status`, oldest first.
    pub async fn list_by_status(&self, status: Status, limit: u32) -> Result<Vec<WorkItem>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM work_items
                     WHERE status = ?1
                     ORDER BY created_at, id
                     LIMIT ?2"
                ),
                params![status.to_string(), i64::from(limit)],
            )
            .await
            .map_err(db_err)?;
        collect_items(&mut rows).await
    }

    /// Number of items currently in `status`.
    pub async fn count_status(&self, status: Status) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM work_items WHERE status = ?1",
                params![status.to_string()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Item counts for every status that has at least one item.
    pub async fn count_by_status(&self) -> Result<Vec<(Status, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM work_items GROUP BY status ORDER BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: Status = row.get::<String>(0).map_err(db_err)?.parse()?;
            let count = row.get::<i64>(1).map_err(db_err)?.max(0) as u64;
            results.push((status, count));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Conditional writes
    // -----------------------------------------------------------------------

    /// Apply a conditional write. Returns the updated item, or `None` when
    /// the item no longer has the expected status and revision (lost race).
    pub async fn apply(&self, write: &ConditionalWrite<'_>) -> Result<Option<WorkItem>> {
        let tx = self.write_tx().await?;
        let at = fmt_ts(write.at);
        let update = &write.update;

        let mut rows = tx
            .query(
                &format!(
                    "UPDATE work_items SET
                       status = ?1,
                       classification = ?2,
                       attempt_count = ?3,
                       total_attempts = ?4,
                       next_eligible_at = ?5,
                       last_error = ?6,
                       failed_stage = ?7,
                       revision = revision + 1,
                       status_changed_at = CASE WHEN status = ?1 THEN status_changed_at ELSE ?8 END,
                       updated_at = ?8
                     WHERE id = ?9 AND status = ?10 AND revision = ?11
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![
                    update.status.to_string(),
                    update.classification.as_str(),
                    i64::from(update.attempt_count),
                    i64::from(update.total_attempts),
                    fmt_ts(update.next_eligible_at),
                    update.last_error.as_deref(),
                    update.failed_stage.map(Stage::as_str),
                    at.as_str(),
                    write.item_id.to_string(),
                    write.expected_status.to_string(),
                    write.expected_revision,
                ],
            )
            .await
            .map_err(db_err)?;

        let updated = match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_item(&row)?,
            None => {
                drop(rows);
                tx.rollback().await.map_err(db_err)?;
                return Ok(None);
            }
        };
        drop(rows);

        if let Some(output) = write.output {
            let payload = serde_json::to_string(&output.payload)
                .map_err(|e| LinkflowError::Storage(format!("encode payload: {e}")))?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (item_id, payload_json, produced_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(item_id) DO UPDATE SET
                       payload_json = excluded.payload_json,
                       produced_at = excluded.produced_at",
                    output_table(output.stage)
                ),
                params![
                    output.item_id.to_string(),
                    payload,
                    fmt_ts(output.produced_at),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        for record in write.audit {
            tx.execute(
                "INSERT INTO transition_events (item_id, from_status, to_status, stage, outcome, detail, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.item_id.to_string(),
                    record.from.to_string(),
                    record.to.to_string(),
                    record.stage.map(Stage::as_str),
                    record.outcome.as_str(),
                    record.detail.as_deref(),
                    fmt_ts(record.at),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Some(updated))
    }

    /// Move an item's eligibility time without changing its status. Guarded
    /// by revision like every other write and bumps it; returns `false` on a
    /// lost race.
    pub async fn set_next_eligible(
        &self,
        id: ItemId,
        expected_revision: i64,
        next_eligible_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE work_items
                 SET next_eligible_at = ?1, updated_at = ?2, revision = revision + 1
                 WHERE id = ?3 AND revision = ?4",
                params![
                    fmt_ts(next_eligible_at),
                    fmt_ts(at),
                    id.to_string(),
                    expected_revision,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(affected == 1)
    }

    // -----------------------------------------------------------------------
    // Stage outputs
    // -----------------------------------------------------------------------

    /// Get the live output of `stage` for an item.
    pub async fn get_output(&self, stage: Stage, item_id: ItemId) -> Result<Option<StageOutput>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT payload_json, produced_at FROM {} WHERE item_id = ?1",
                    output_table(stage)
                ),
                params![item_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let raw: String = row.get(0).map_err(db_err)?;
                let payload = serde_json::from_str(&raw)
                    .map_err(|e| LinkflowError::Storage(format!("decode payload: {e}")))?;
                Ok(Some(StageOutput {
                    item_id,
                    stage,
                    payload,
                    produced_at: parse_ts(&row.get::<String>(1).map_err(db_err)?)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete outputs of `stage` produced before `cutoff`, but only for items
    /// in a terminal state. Returns the number of outputs removed.
    pub async fn prune_outputs(&self, stage: Stage, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE produced_at < ?1 AND item_id IN (
                       SELECT id FROM work_items WHERE status IN ('extracted', 'dead'))",
                    output_table(stage)
                ),
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Audit and provenance
    // -----------------------------------------------------------------------

    /// Transition history of an item, oldest first.
    pub async fn list_transitions(&self, item_id: ItemId) -> Result<Vec<TransitionRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT from_status, to_status, stage, outcome, detail, at
                 FROM transition_events WHERE item_id = ?1 ORDER BY id",
                params![item_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let stage = match row.get::<String>(2).ok() {
                Some(s) => Some(s.parse::<Stage>()?),
                None => None,
            };
            results.push(TransitionRecord {
                item_id,
                from: row.get::<String>(0).map_err(db_err)?.parse()?,
                to: row.get::<String>(1).map_err(db_err)?.parse()?,
                stage,
                outcome: row.get::<String>(3).map_err(db_err)?.parse::<Outcome>()?,
                detail: row.get::<String>(4).ok(),
                at: parse_ts(&row.get::<String>(5).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Every recorded sighting of an item, oldest first.
    pub async fn list_sightings(&self, item_id: ItemId) -> Result<Vec<Sighting>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source, locator, category, date_in_source, seen_at
                 FROM item_provenance WHERE item_id = ?1 ORDER BY id",
                params![item_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(Sighting {
                provenance: Provenance {
                    source: row.get::<String>(0).ok(),
                    locator: row.get::<String>(1).ok(),
                    category: row.get::<String>(2).ok(),
                    date_in_source: row.get::<String>(3).ok(),
                },
                seen_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }
}

/// Output table backing each stage.
fn output_table(stage: Stage) -> &'static str {
    match stage {
        Stage::Acquisition => "raw_outputs",
        Stage::Normalization => "normalized_outputs",
        Stage::Extraction => "extracted_outputs",
    }
}

/// Fixed-width UTC timestamps so string order is time order.
fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LinkflowError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_id(s: &str) -> Result<ItemId> {
    s.parse()
        .map_err(|e| LinkflowError::Storage(format!("invalid item id '{s}': {e}")))
}

fn db_err(e: libsql::Error) -> LinkflowError {
    LinkflowError::Storage(e.to_string())
}

async fn collect_items(rows: &mut libsql::Rows) -> Result<Vec<WorkItem>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_item(&row)?);
    }
    Ok(results)
}

/// Convert a database row (selected with [`ITEM_COLUMNS`]) to a [`WorkItem`].
fn row_to_item(row: &libsql::Row) -> Result<WorkItem> {
    let failed_stage = match row.get::<String>(9).ok() {
        Some(s) => Some(s.parse::<Stage>()?),
        None => None,
    };
    Ok(WorkItem {
        id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        identity_key: row.get::<String>(1).map_err(db_err)?,
        link: row.get::<String>(2).map_err(db_err)?,
        classification: row.get::<String>(3).map_err(db_err)?.parse()?,
        status: row.get::<String>(4).map_err(db_err)?.parse()?,
        attempt_count: row.get::<i64>(5).map_err(db_err)?.max(0) as u32,
        total_attempts: row.get::<i64>(6).map_err(db_err)?.max(0) as u32,
        next_eligible_at: parse_ts(&row.get::<String>(7).map_err(db_err)?)?,
        last_error: row.get::<String>(8).ok(),
        failed_stage,
        revision: row.get::<i64>(10).map_err(db_err)?,
        status_changed_at: parse_ts(&row.get::<String>(11).map_err(db_err)?)?,
        provenance: Provenance {
            source: row.get::<String>(12).ok(),
            locator: row.get::<String>(13).ok(),
            category: row.get::<String>(14).ok(),
            date_in_source: row.get::<String>(15).ok(),
        },
        created_at: parse_ts(&row.get::<String>(16).map_err(db_err)?)?,
        updated_at: parse_ts(&row.get::<String>(17).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn audit(item: &WorkItem, to: Status, outcome: Outcome, at: DateTime<Utc>) -> TransitionRecord {
        TransitionRecord {
            item_id: item.id,
            from: item.status,
            to,
            stage: to.in_progress_stage(),
            outcome,
            detail: None,
            at,
        }
    }

    async fn insert(storage: &Storage, key: &str) -> WorkItem {
        let res = storage
            .upsert_item(key, key, &Provenance::default(), Utc::now())
            .await
            .expect("upsert");
        storage.get_item(res.id).await.unwrap().expect("item exists")
    }

    /// Walk an item along the given statuses without any policy checks.
    async fn force_path(storage: &Storage, mut item: WorkItem, path: &[Status]) -> WorkItem {
        for &to in path {
            let mut update = ItemUpdate::from(&item);
            update.status = to;
            let at = Utc::now();
            item = storage
                .apply(&ConditionalWrite {
                    item_id: item.id,
                    expected_status: item.status,
                    expected_revision: item.revision,
                    update,
                    output: None,
                    audit: &[],
                    at,
                })
                .await
                .unwrap()
                .expect("write applies");
        }
        item
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn upsert_merges_provenance() {
        let storage = test_storage().await;
        let first = Provenance {
            source: Some("sheet:aug".into()),
            locator: Some("row 4".into()),
            ..Default::default()
        };
        let a = storage
            .upsert_item("https://x.test/a", "https://X.test/a", &first, Utc::now())
            .await
            .unwrap();
        assert!(a.inserted);

        let second = Provenance {
            locator: Some("row 9".into()),
            category: Some("jobs".into()),
            ..Default::default()
        };
        let b = storage
            .upsert_item("https://x.test/a", "https://x.test/a/", &second, Utc::now())
            .await
            .unwrap();
        assert!(!b.inserted);
        assert_eq!(a.id, b.id);

        let item = storage.get_item(a.id).await.unwrap().unwrap();
        assert_eq!(item.link, "https://X.test/a");
        assert_eq!(item.provenance.source.as_deref(), Some("sheet:aug"));
        assert_eq!(item.provenance.locator.as_deref(), Some("row 9"));
        assert_eq!(item.provenance.category.as_deref(), Some("jobs"));
        assert_eq!(item.status, Status::New);

        let sightings = storage.list_sightings(a.id).await.unwrap();
        assert_eq!(sightings.len(), 2);
    }

    #[tokio::test]
    async fn conditional_write_rejects_stale_revision() {
        let storage = test_storage().await;
        let item = insert(&storage, "k-stale").await;
        let now = Utc::now();

        let mut update = ItemUpdate::from(&item);
        update.status = Status::Classified;
        let records = [audit(&item, Status::Classified, Outcome::Classified, now)];
        let write = ConditionalWrite {
            item_id: item.id,
            expected_status: Status::New,
            expected_revision: item.revision,
            update,
            output: None,
            audit: &records,
            at: now,
        };

        let updated = storage.apply(&write).await.unwrap().expect("first write wins");
        assert_eq!(updated.status, Status::Classified);
        assert_eq!(updated.revision, item.revision + 1);

        // Same observation again: revision moved on, nothing happens.
        assert!(storage.apply(&write).await.unwrap().is_none());
        assert_eq!(storage.list_transitions(item.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_one_winner() {
        let storage = Arc::new(test_storage().await);
        let item = insert(&storage, "k-race").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            let item = item.clone();
            handles.push(tokio::spawn(async move {
                let mut update = ItemUpdate::from(&item);
                update.status = Status::Classified;
                storage
                    .apply(&ConditionalWrite {
                        item_id: item.id,
                        expected_status: item.status,
                        expected_revision: item.revision,
                        update,
                        output: None,
                        audit: &[],
                        at: Utc::now(),
                    })
                    .await
                    .expect("write does not error")
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn output_lands_with_status_and_overwrites() {
        let storage = test_storage().await;
        let item = insert(&storage, "k-out").await;
        let item = force_path(
            &storage,
            item,
            &[Status::Classified, Status::Queued, Status::Acquiring],
        )
        .await;

        let output = StageOutput {
            item_id: item.id,
            stage: Stage::Acquisition,
            payload: serde_json::json!({"html_ref": "s3://raw/1"}),
            produced_at: Utc::now(),
        };
        let mut update = ItemUpdate::from(&item);
        update.status = Status::Acquired;
        let done = storage
            .apply(&ConditionalWrite {
                item_id: item.id,
                expected_status: item.status,
                expected_revision: item.revision,
                update,
                output: Some(&output),
                audit: &[],
                at: Utc::now(),
            })
            .await
            .unwrap()
            .expect("commit applies");
        assert_eq!(done.status, Status::Acquired);

        let stored = storage
            .get_output(Stage::Acquisition, item.id)
            .await
            .unwrap()
            .expect("output stored");
        assert_eq!(stored.payload["html_ref"], "s3://raw/1");

        // Reprocessing overwrites the single live row.
        let item = force_path(&storage, done, &[Status::Acquiring]).await;
        let second = StageOutput {
            payload: serde_json::json!({"html_ref": "s3://raw/2"}),
            ..output
        };
        let mut update = ItemUpdate::from(&item);
        update.status = Status::Acquired;
        storage
            .apply(&ConditionalWrite {
                item_id: item.id,
                expected_status: item.status,
                expected_revision: item.revision,
                update,
                output: Some(&second),
                audit: &[],
                at: Utc::now(),
            })
            .await
            .unwrap()
            .expect("second commit applies");
        let stored = storage.get_output(Stage::Acquisition, item.id).await.unwrap().unwrap();
        assert_eq!(stored.payload["html_ref"], "s3://raw/2");
    }

    #[tokio::test]
    async fn lost_race_writes_no_output() {
        let storage = test_storage().await;
        let item = insert(&storage, "k-lost").await;
        let output = StageOutput {
            item_id: item.id,
            stage: Stage::Acquisition,
            payload: serde_json::json!({}),
            produced_at: Utc::now(),
        };
        let mut update = ItemUpdate::from(&item);
        update.status = Status::Acquired;
        let result = storage
            .apply(&ConditionalWrite {
                item_id: item.id,
                expected_status: Status::Acquiring,
                expected_revision: item.revision,
                update,
                output: Some(&output),
                audit: &[],
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(storage.get_output(Stage::Acquisition, item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eligible_listing_respects_time_and_queue() {
        let storage = test_storage().await;
        let job = insert(&storage, "https://www.linkedin.com/jobs/view/1").await;
        let job = force_path(&storage, job, &[Status::Classified]).await;
        let mut update = ItemUpdate::from(&job);
        update.status = Status::Queued;
        update.classification = Classification::Job;
        update.next_eligible_at = Utc::now() + ChronoDuration::hours(1);
        storage
            .apply(&ConditionalWrite {
                item_id: job.id,
                expected_status: job.status,
                expected_revision: job.revision,
                update,
                output: None,
                audit: &[],
                at: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();

        let now = Utc::now();
        let eligible = storage
            .list_eligible(Status::Queued, now, None, 10)
            .await
            .unwrap();
        assert!(eligible.is_empty());

        let later = now + ChronoDuration::hours(2);
        let jobs = storage
            .list_eligible(Status::Queued, later, Some(Classification::Job), 10)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let posts = storage
            .list_eligible(Status::Queued, later, Some(Classification::Post), 10)
            .await
            .unwrap();
        assert!(posts.is_empty());
    }

    #[tokio::test]
    async fn counts_and_prune() {
        let storage = test_storage().await;
        for key in ["k1", "k2", "k3"] {
            insert(&storage, key).await;
        }
        assert_eq!(storage.count_status(Status::New).await.unwrap(), 3);

        let item = storage.get_item_by_key("k1").await.unwrap().unwrap();
        let item = force_path(
            &storage,
            item,
            &[Status::Classified, Status::Queued, Status::Acquiring],
        )
        .await;
        let output = StageOutput {
            item_id: item.id,
            stage: Stage::Acquisition,
            payload: serde_json::json!({"n": 1}),
            produced_at: Utc::now() - ChronoDuration::days(30),
        };
        let mut update = ItemUpdate::from(&item);
        update.status = Status::Acquired;
        let item = storage
            .apply(&ConditionalWrite {
                item_id: item.id,
                expected_status: item.status,
                expected_revision: item.revision,
                update,
                output: Some(&output),
                audit: &[],
                at: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();

        let counts = storage.count_by_status().await.unwrap();
        assert!(counts.contains(&(Status::New, 2)));
        assert!(counts.contains(&(Status::Acquired, 1)));

        // Not terminal yet: retention leaves it alone.
        let cutoff = Utc::now() - ChronoDuration::days(7);
        assert_eq!(storage.prune_outputs(Stage::Acquisition, cutoff).await.unwrap(), 0);

        force_path(
            &storage,
            item,
            &[
                Status::Normalizing,
                Status::Normalized,
                Status::Extracting,
                Status::Extracted,
            ],
        )
        .await;
        assert_eq!(storage.prune_outputs(Stage::Acquisition, cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_time_is_revision_guarded() {
        let storage = test_storage().await;
        let item = insert(&storage, "k-time").await;
        let soon = Utc::now();
        assert!(storage
            .set_next_eligible(item.id, item.revision, soon, soon)
            .await
            .unwrap());

        // The first move consumed the revision; a writer still holding it loses.
        assert!(!storage
            .set_next_eligible(item.id, item.revision, soon, soon)
            .await
            .unwrap());
        let stored = storage.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, item.revision + 1);
        assert_eq!(stored.status, item.status);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.upsert_item("k", "k", &Provenance::default(), Utc::now())
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_item_by_key("k").await.unwrap().is_some());
        let result = ro
            .upsert_item("k2", "k2", &Provenance::default(), Utc::now())
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
