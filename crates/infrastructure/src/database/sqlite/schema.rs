//! SQLite 表结构
//!
//! 时间统一以 RFC3339 文本保存，JSON 列保存为文本。

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        compute_resource_id TEXT NOT NULL,
        experiment_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        connection_state TEXT NOT NULL,
        current_task_id TEXT,
        walltime_secs INTEGER NOT NULL DEFAULT 0,
        walltime_remaining_secs INTEGER NOT NULL DEFAULT 0,
        capabilities TEXT NOT NULL DEFAULT '{}',
        metadata TEXT NOT NULL DEFAULT '{}',
        registered_at TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        last_seen_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        experiment_id TEXT NOT NULL,
        command TEXT NOT NULL,
        input_files TEXT NOT NULL DEFAULT '[]',
        output_files TEXT NOT NULL DEFAULT '[]',
        requirements TEXT NOT NULL DEFAULT '{}',
        compute_resource_id TEXT,
        worker_id TEXT REFERENCES workers(id) ON DELETE SET NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        staging_started_at TEXT,
        staging_completed_at TEXT,
        completed_at TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        version INTEGER NOT NULL DEFAULT 0,
        CHECK (retry_count <= max_retries)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_experiment ON tasks(experiment_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id)",
    r#"
    CREATE TABLE IF NOT EXISTS staging_operations (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        worker_id TEXT NOT NULL,
        compute_resource_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        source_path TEXT NOT NULL,
        destination_path TEXT NOT NULL,
        status TEXT NOT NULL,
        total_size INTEGER NOT NULL DEFAULT 0,
        expected_checksum TEXT,
        transferred_size INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        timeout_seconds INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        last_heartbeat TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staging_task ON staging_operations(task_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_staging_status ON staging_operations(status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_state (
        id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        status TEXT NOT NULL,
        clean_shutdown INTEGER NOT NULL,
        startup_time TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        shutdown_time TEXT
    )
    "#,
];
