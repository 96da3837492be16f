//! SQL migration definitions for the linkflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: work_items, provenance, stage outputs, transition_events",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per work item; status is the single source of truth for ownership
CREATE TABLE IF NOT EXISTS work_items (
    id                TEXT PRIMARY KEY,
    identity_key      TEXT NOT NULL UNIQUE,
    link              TEXT NOT NULL,
    classification    TEXT NOT NULL DEFAULT 'unknown'
                      CHECK (classification IN ('job', 'post', 'unknown')),
    status            TEXT NOT NULL DEFAULT 'new'
                      CHECK (status IN (
                          'new', 'classified', 'queued',
                          'acquiring', 'acquired',
                          'normalizing', 'normalized',
                          'extracting', 'extracted',
                          'error:acquisition', 'error:normalization', 'error:extraction',
                          'dead')),
    attempt_count     INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    total_attempts    INTEGER NOT NULL DEFAULT 0 CHECK (total_attempts >= 0),
    next_eligible_at  TEXT NOT NULL,
    last_error        TEXT,
    failed_stage      TEXT,
    revision          INTEGER NOT NULL DEFAULT 0,
    status_changed_at TEXT NOT NULL,
    source            TEXT,
    locator           TEXT,
    category          TEXT,
    date_in_source    TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_eligible ON work_items(status, next_eligible_at);
CREATE INDEX IF NOT EXISTS idx_work_items_in_state ON work_items(status, status_changed_at);

-- Every sighting of a link by a source connector
CREATE TABLE IF NOT EXISTS item_provenance (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id        TEXT NOT NULL REFERENCES work_items(id),
    source         TEXT,
    locator        TEXT,
    category       TEXT,
    date_in_source TEXT,
    seen_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_item_provenance_item ON item_provenance(item_id);

-- Stage outputs: at most one live row per item per stage
CREATE TABLE IF NOT EXISTS raw_outputs (
    item_id      TEXT PRIMARY KEY REFERENCES work_items(id),
    payload_json TEXT NOT NULL,
    produced_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS normalized_outputs (
    item_id      TEXT PRIMARY KEY REFERENCES work_items(id),
    payload_json TEXT NOT NULL,
    produced_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS extracted_outputs (
    item_id      TEXT PRIMARY KEY REFERENCES work_items(id),
    payload_json TEXT NOT NULL,
    produced_at  TEXT NOT NULL
);

-- Append-only audit log of state transitions
CREATE TABLE IF NOT EXISTS transition_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id     TEXT NOT NULL REFERENCES work_items(id),
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    stage       TEXT,
    outcome     TEXT NOT NULL,
    detail      TEXT,
    at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transition_events_item ON transition_events(item_id, id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
