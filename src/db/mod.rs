//! Database module for SQLite persistence using SeaORM

pub mod entities;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::path::Path;

/// Connect to the database at `db_path` and create tables.
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection, DbErr> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::info!("Connecting to database: {}", db_url);

    connect(&db_url).await
}

/// Connect to an explicit database URL and create tables.
pub async fn connect(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(db_url).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Create all tables and indexes if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Videos table: lifecycle source of truth
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_upload',
            source_url TEXT NOT NULL,
            source_size INTEGER NOT NULL,
            source_checksum TEXT,
            content_type TEXT NOT NULL,
            manifest_url TEXT,
            duration_s REAL,
            width INTEGER,
            height INTEGER,
            codec TEXT,
            bitrate INTEGER,
            fps REAL,
            thumbnails TEXT,
            upload_session_id TEXT,
            processing_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            is_public INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            processed_at TEXT,
            cancelled_at TEXT,
            deleted_at TEXT
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_videos_created ON videos(created_at)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_videos_status_created ON videos(status, created_at)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_videos_deleted ON videos(deleted_at)"#.to_string(),
    ))
    .await?;

    // Upload sessions table, cascade-deleted with the owning video
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS upload_sessions (
            id TEXT PRIMARY KEY,
            video_id TEXT NOT NULL,
            multipart_upload_id TEXT,
            total_parts INTEGER NOT NULL,
            part_size INTEGER NOT NULL,
            uploaded_parts TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_sessions_video ON upload_sessions(video_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_sessions_status ON upload_sessions(status)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_sessions_expires ON upload_sessions(expires_at)"#
            .to_string(),
    ))
    .await?;

    // Segments table, written by the worker
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            video_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            url TEXT NOT NULL,
            start_s REAL NOT NULL,
            duration_s REAL NOT NULL,
            size INTEGER,
            keyframe INTEGER,
            PRIMARY KEY (video_id, idx),
            FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    // Transcode job queue
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS transcode_jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            video_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            run_at TEXT NOT NULL,
            last_error TEXT,
            enqueued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_claim ON transcode_jobs(status, priority, run_at)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_jobs_video ON transcode_jobs(video_id)"#.to_string(),
    ))
    .await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Fresh SQLite database in a temp dir for tests. The TempDir must be
    /// kept alive alongside the connection.
    pub async fn temp_db() -> (TempDir, DatabaseConnection) {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("vodgate-test.db"))
            .await
            .unwrap();
        (dir, db)
    }
}
