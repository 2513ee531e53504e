//! Database schema constants.
//!
//! All statements target SQLite. Identifiers are stored as TEXT (hyphenated
//! UUIDs), timestamps as RFC 3339 TEXT.

/// SQL schema for creating the opportunities table.
pub const CREATE_OPPORTUNITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS opportunities (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    market TEXT NOT NULL,
    score REAL NOT NULL,
    trend REAL NOT NULL,
    competition TEXT NOT NULL,
    revenue_potential TEXT NOT NULL,
    validated INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL,
    discovered_at TEXT NOT NULL,
    stage TEXT NOT NULL,
    rejection_reason TEXT
)
"#;

/// SQL schema for creating the capabilities table.
pub const CREATE_CAPABILITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS capabilities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    confidence REAL NOT NULL,
    learned_at TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL schema for creating the proof_log table.
pub const CREATE_PROOF_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS proof_log (
    position INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    action TEXT NOT NULL,
    agent TEXT NOT NULL,
    result TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    digest TEXT NOT NULL
)
"#;

/// Index on the stage column, used by stage listings.
pub const CREATE_OPPORTUNITIES_STAGE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_opportunities_stage ON opportunities(stage)";

/// Index on capability category, used by eligibility lookups.
pub const CREATE_CAPABILITIES_CATEGORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_capabilities_category ON capabilities(category)";

/// Returns all schema creation statements in the correct order.
///
/// SQLite executes one statement per query, so indexes are listed separately.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_OPPORTUNITIES_TABLE,
        CREATE_CAPABILITIES_TABLE,
        CREATE_PROOF_LOG_TABLE,
        CREATE_OPPORTUNITIES_STAGE_INDEX,
        CREATE_CAPABILITIES_CATEGORY_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const OPPORTUNITIES: &str = "opportunities";
    pub const CAPABILITIES: &str = "capabilities";
    pub const PROOF_LOG: &str = "proof_log";
}
