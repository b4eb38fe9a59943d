//! DDL for every table the read side owns.
//!
//! Statements are create-if-absent so running them again is a no-op.

/// Event log written by the write side (and by seeding/tests)
pub(crate) const EVENT_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    event_id      UUID         NOT NULL UNIQUE,
    tag           VARCHAR(128) NOT NULL,
    seq           BIGINT       NOT NULL CHECK (seq > 0),
    entity_id     VARCHAR(64)  NOT NULL,
    event_type    VARCHAR(64)  NOT NULL,
    payload       JSONB        NOT NULL,
    occurred_at   TIMESTAMPTZ  NOT NULL,
    persisted_at  TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tag, seq)
)
"#;

/// Per-tag offset allocator for the event log
pub(crate) const TAG_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS tag_state (
    tag         VARCHAR(128) PRIMARY KEY,
    last_seq    BIGINT       NOT NULL,
    updated_at  TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

/// Last committed offset per tag
pub(crate) const READ_SIDE_OFFSETS: &str = r#"
CREATE TABLE IF NOT EXISTS read_side_offsets (
    tag          VARCHAR(128) PRIMARY KEY,
    last_offset  BIGINT       NOT NULL CHECK (last_offset >= 0),
    updated_at   TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

/// Partition leases
pub(crate) const READ_SIDE_LEASES: &str = r#"
CREATE TABLE IF NOT EXISTS read_side_leases (
    tag          VARCHAR(128) PRIMARY KEY,
    worker_id    VARCHAR(128) NOT NULL,
    token        UUID         NOT NULL,
    ttl_ms       BIGINT       NOT NULL,
    expires_at   TIMESTAMPTZ  NOT NULL,
    acquired_at  TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

/// Greetings read model
pub(crate) const USER_GREETINGS: &str = r#"
CREATE TABLE IF NOT EXISTS user_greetings (
    id           VARCHAR(64)  PRIMARY KEY,
    message      VARCHAR(256) NOT NULL,
    last_offset  BIGINT       NOT NULL,
    updated_at   TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

/// All statements, in creation order
pub(crate) const ALL: [(&str, &str); 5] = [
    ("event_log", EVENT_LOG),
    ("tag_state", TAG_STATE),
    ("read_side_offsets", READ_SIDE_OFFSETS),
    ("read_side_leases", READ_SIDE_LEASES),
    ("user_greetings", USER_GREETINGS),
];
