//! Store schema: table DDL and versioned forward migrations
//!
//! The schema version lives in SQLite's `user_version` pragma. On open the
//! store applies every migration past the recorded version in order; a
//! database newer than this build refuses to open.

/// Schema version this build writes
pub const SCHEMA_VERSION: i64 = 1;

/// Ordered forward migrations; index i migrates version i to i+1
pub const MIGRATIONS: &[&str] = &[
    // v0 -> v1: initial layout
    r#"
    CREATE TABLE IF NOT EXISTS intents (
        id          TEXT PRIMARY KEY,
        session_id  TEXT NOT NULL,
        status      TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        payload     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_intents_session ON intents(session_id, created_at);

    CREATE TABLE IF NOT EXISTS specs (
        id          TEXT PRIMARY KEY,
        intent_id   TEXT NOT NULL REFERENCES intents(id),
        version     INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        payload     TEXT NOT NULL,
        UNIQUE(intent_id, version)
    );

    CREATE TABLE IF NOT EXISTS attempts (
        id            TEXT PRIMARY KEY,
        spec_id       TEXT NOT NULL REFERENCES specs(id),
        spec_version  INTEGER NOT NULL,
        status        TEXT NOT NULL,
        content_hash  TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        payload       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attempts_spec ON attempts(spec_id, created_at);

    CREATE TABLE IF NOT EXISTS verifications (
        id          TEXT PRIMARY KEY,
        attempt_id  TEXT NOT NULL REFERENCES attempts(id),
        passed      INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        payload     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_verifications_attempt ON verifications(attempt_id);

    CREATE TABLE IF NOT EXISTS survivors (
        id               TEXT PRIMARY KEY,
        intent_id        TEXT NOT NULL REFERENCES intents(id),
        attempt_id       TEXT NOT NULL REFERENCES attempts(id),
        verification_id  TEXT NOT NULL REFERENCES verifications(id),
        rank             INTEGER NOT NULL,
        presented        INTEGER NOT NULL DEFAULT 0,
        payload          TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_survivors_intent ON survivors(intent_id, rank);

    CREATE TABLE IF NOT EXISTS judgments (
        id          TEXT PRIMARY KEY,
        intent_id   TEXT NOT NULL REFERENCES intents(id),
        decision    TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        payload     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_judgments_intent ON judgments(intent_id, created_at);

    CREATE TABLE IF NOT EXISTS events (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        intent_id   TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        payload     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_intent ON events(intent_id, seq);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_count_matches_version() {
        assert_eq!(MIGRATIONS.len() as i64, SCHEMA_VERSION);
    }
}
