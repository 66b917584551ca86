use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. All instants are stored as integer Unix milliseconds so the
/// due-trigger query can order numerically.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            job_type          TEXT    NOT NULL,
            concurrency       TEXT    NOT NULL DEFAULT 'allow',
            description       TEXT,
            max_runtime_secs  INTEGER,
            created_at        INTEGER NOT NULL,
            updated_at        INTEGER NOT NULL
        ) STRICT;

        -- Job parameters as plain name/value strings, one row per key.
        CREATE TABLE IF NOT EXISTS job_data (
            job_id  TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            key     TEXT NOT NULL,
            value   TEXT NOT NULL,
            PRIMARY KEY (job_id, key)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            schedule        TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            start_at        INTEGER,
            end_at          INTEGER,
            max_fires       INTEGER,            -- NULL means unlimited
            priority        INTEGER NOT NULL DEFAULT 0,
            misfire_policy  TEXT    NOT NULL,
            next_fire_at    INTEGER,            -- NULL means exhausted
            prev_fire_at    INTEGER,
            fire_count      INTEGER NOT NULL DEFAULT 0,
            state           TEXT    NOT NULL DEFAULT 'waiting',
            acquired_by     TEXT,
            acquired_at     INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        ) STRICT;

        -- Claim query: WHERE state = 'waiting' AND next_fire_at <= ? ORDER BY next_fire_at
        CREATE INDEX IF NOT EXISTS idx_triggers_due ON triggers (state, next_fire_at);
        CREATE INDEX IF NOT EXISTS idx_triggers_job ON triggers (job_id);

        -- No foreign keys: history outlives removed jobs.
        CREATE TABLE IF NOT EXISTS fire_instances (
            id            TEXT    NOT NULL PRIMARY KEY,
            trigger_id    TEXT    NOT NULL,
            job_id        TEXT    NOT NULL,
            instance_id   TEXT    NOT NULL,
            scheduled_at  INTEGER NOT NULL,
            fired_at      INTEGER NOT NULL,
            finished_at   INTEGER,
            outcome       TEXT    NOT NULL,
            error         TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_fires_job_outcome ON fire_instances (job_id, outcome);
        CREATE INDEX IF NOT EXISTS idx_fires_instance ON fire_instances (instance_id, outcome);

        CREATE TABLE IF NOT EXISTS scheduler_instances (
            instance_id   TEXT    NOT NULL PRIMARY KEY,
            last_checkin  INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Per-connection settings every store connection needs.
pub fn configure(conn: &Connection) -> Result<()> {
    // Before the journal pragma, which itself may need the lock.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(())
}
