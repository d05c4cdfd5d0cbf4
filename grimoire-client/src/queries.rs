//! Named SQL constants for the reserved local tables, mirroring the
//! teacher's `Queries`/`DbHelpers` split: every statement lives here as a
//! named constant so the rest of the crate never inlines ad-hoc SQL.

pub struct Queries;

impl Queries {
    pub const SCHEMA: &'static str = r#"
        CREATE TABLE IF NOT EXISTS _schema (
            hash TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
            record_id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            content TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _version (
            record_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _pending_mutations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            record_id TEXT NOT NULL,
            data TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _stream_processor_state (
            id TEXT PRIMARY KEY,
            bytes BLOB NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#;

    pub const HAS_SCHEMA_MARKER: &'static str = "SELECT hash FROM _schema WHERE hash = ?1";
    pub const INSERT_SCHEMA_MARKER: &'static str =
        "INSERT OR IGNORE INTO _schema (hash, created_at) VALUES (?1, ?2)";

    pub const UPSERT_RECORD: &'static str = r#"
        INSERT INTO records (record_id, table_name, content)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(record_id) DO UPDATE SET content = excluded.content
    "#;
    pub const DELETE_RECORD: &'static str = "DELETE FROM records WHERE record_id = ?1";
    pub const GET_RECORD: &'static str = "SELECT content FROM records WHERE record_id = ?1";

    pub const UPSERT_VERSION: &'static str = r#"
        INSERT INTO _version (record_id, version)
        VALUES (?1, ?2)
        ON CONFLICT(record_id) DO UPDATE SET version = excluded.version
    "#;
    pub const DELETE_VERSION: &'static str = "DELETE FROM _version WHERE record_id = ?1";
    pub const GET_VERSION: &'static str = "SELECT version FROM _version WHERE record_id = ?1";

    pub const INSERT_PENDING_MUTATION: &'static str = r#"
        INSERT INTO _pending_mutations (id, kind, record_id, data, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
    "#;
    pub const DELETE_PENDING_MUTATION: &'static str = "DELETE FROM _pending_mutations WHERE id = ?1";
    pub const LIST_PENDING_MUTATIONS: &'static str =
        "SELECT id, kind, record_id, data, created_at FROM _pending_mutations ORDER BY created_at ASC";

    pub const UPSERT_PROCESSOR_STATE: &'static str = r#"
        INSERT INTO _stream_processor_state (id, bytes, updated_at)
        VALUES ('singleton', ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET bytes = excluded.bytes, updated_at = excluded.updated_at
    "#;
    pub const GET_PROCESSOR_STATE: &'static str =
        "SELECT bytes FROM _stream_processor_state WHERE id = 'singleton'";
}
