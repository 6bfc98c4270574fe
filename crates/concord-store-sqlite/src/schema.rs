//! SQL schema for the Concord SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! schema revision so later migrations can be gated on it.

/// Connection-level settings; applied before the schema on every open.
pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS facts (
    fact_id         INTEGER PRIMARY KEY,  -- origin prefix << 32 | local sequence
    origin_node     TEXT    NOT NULL,
    content         TEXT    NOT NULL,
    fact_type       TEXT    NOT NULL,
    confidence      TEXT    NOT NULL DEFAULT 'unverified',
    consensus_score REAL    NOT NULL DEFAULT 1.0,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
);

-- At most one vote per (fact, agent). A zero vote deletes the row, so the
-- stored value is always -1 or 1.
CREATE TABLE IF NOT EXISTS consensus_votes (
    fact_id  INTEGER NOT NULL REFERENCES facts(fact_id),
    agent    TEXT    NOT NULL,
    vote     INTEGER NOT NULL CHECK (vote IN (-1, 1)),
    voted_at TEXT    NOT NULL,
    PRIMARY KEY (fact_id, agent)
);

-- Nodes are soft-deactivated, never deleted.
CREATE TABLE IF NOT EXISTS cluster_nodes (
    node_id      TEXT    PRIMARY KEY,
    node_name    TEXT    NOT NULL,
    node_address TEXT    NOT NULL,
    node_region  TEXT,
    is_active    INTEGER NOT NULL DEFAULT 1,
    is_voter     INTEGER NOT NULL DEFAULT 1,
    joined_at    TEXT    NOT NULL,
    last_seen_at TEXT    NOT NULL,
    raft_role    TEXT,            -- 'leader' | 'follower' | 'candidate' | NULL
    meta         TEXT    NOT NULL DEFAULT '{}'
);

-- `timestamp` is when the owning node bumped `version`; `touched_at` is
-- when this replica last changed the row, and drives delta collection.
CREATE TABLE IF NOT EXISTS vector_clocks (
    node_id     TEXT    NOT NULL,
    entity_type TEXT    NOT NULL,
    entity_id   TEXT    NOT NULL,
    version     INTEGER NOT NULL CHECK (version >= 0),
    timestamp   TEXT    NOT NULL,
    touched_at  TEXT    NOT NULL,
    PRIMARY KEY (node_id, entity_type, entity_id)
);

-- Append-only; node_id deliberately has no foreign key.
CREATE TABLE IF NOT EXISTS sync_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id      TEXT    NOT NULL,
    sync_type    TEXT    NOT NULL,
    entity_type  TEXT    NOT NULL,
    entity_count INTEGER NOT NULL DEFAULT 0,
    started_at   TEXT    NOT NULL,
    completed_at TEXT,
    status       TEXT    NOT NULL DEFAULT 'running',
    details      TEXT
);

CREATE INDEX IF NOT EXISTS votes_fact_idx       ON consensus_votes(fact_id);
CREATE INDEX IF NOT EXISTS clocks_entity_idx    ON vector_clocks(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS clocks_touched_idx   ON vector_clocks(touched_at);
CREATE INDEX IF NOT EXISTS sync_log_status_idx  ON sync_log(status, started_at);

PRAGMA user_version = 1;
";
