//! Database schema constants.
//!
//! Jobs and tasks keep their full serialized form in a `data` JSONB column.
//! The scalar columns beside it mirror the fields operators query on.

/// SQL schema for creating the generation_jobs table.
pub const CREATE_GENERATION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id UUID PRIMARY KEY,
    status VARCHAR(20) NOT NULL,
    progress_percentage DOUBLE PRECISION NOT NULL DEFAULT 0,
    preferred_model VARCHAR(255) NOT NULL,
    model_selected VARCHAR(255),
    fallback_occurred BOOLEAN NOT NULL DEFAULT FALSE,
    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the asset_tasks table.
pub const CREATE_ASSET_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS asset_tasks (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES generation_jobs(id) ON DELETE CASCADE,
    task_index INTEGER NOT NULL,
    asset_type VARCHAR(20) NOT NULL,
    status VARCHAR(20) NOT NULL,
    model_used VARCHAR(255),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    data JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(job_id, task_index)
)
"#;

/// Index statements, one per entry so each runs as a single prepared statement.
pub const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_generation_jobs_status ON generation_jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_generation_jobs_created_at ON generation_jobs(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_asset_tasks_job_id ON asset_tasks(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_asset_tasks_status ON asset_tasks(status)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![CREATE_GENERATION_JOBS_TABLE, CREATE_ASSET_TASKS_TABLE];
    statements.extend(CREATE_INDEXES);
    statements
}

/// Table names in the schema.
pub mod tables {
    pub const GENERATION_JOBS: &str = "generation_jobs";
    pub const ASSET_TASKS: &str = "asset_tasks";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 6);
        // asset_tasks references generation_jobs
        assert!(statements[0].contains(tables::GENERATION_JOBS));
        assert!(statements[1].contains(tables::ASSET_TASKS));
        assert!(statements[2..].iter().all(|s| s.starts_with("CREATE INDEX")));
    }
}
