//! 数据库迁移模块
//!
//! 管理离线数据库的版本迁移，迁移记录存储在 schema_migrations 表中。
//! 每个迁移在独立事务中执行，失败时回滚该迁移并中止后续迁移。

use chrono::Utc;
use rusqlite::Connection;

use crate::storage::{StorageError, StorageResult};

/// 当前数据库 schema 版本
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// 初始化 schema SQL (V1)
const INIT_SCHEMA: &str = include_str!("schema.sql");

/// 迁移定义
#[derive(Debug, Clone)]
pub struct Migration {
    /// 迁移版本号
    pub version: i32,
    /// 迁移名称/描述
    pub name: String,
    /// 迁移 SQL 语句
    pub sql: String,
}

impl Migration {
    pub fn new(version: i32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// 获取所有迁移定义（按版本号排序）
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "初始表结构", INIT_SCHEMA),
        Migration::new(
            2,
            "失败列表与队列时间索引",
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_failures_failed_at
                ON sync_failures(failed_at);

            CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at
                ON sync_queue(created_at);
            "#,
        ),
    ]
}

/// 已应用的迁移记录
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i32,
    pub name: String,
    pub applied_at: i64,
}

fn ensure_migrations_table(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StorageError::Migration(format!("创建迁移表失败: {}", e)))?;

    Ok(())
}

/// 获取当前数据库版本，没有迁移记录时返回 0
pub fn get_current_version(conn: &Connection) -> StorageResult<i32> {
    ensure_migrations_table(conn)?;

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

fn get_applied_versions(conn: &Connection) -> StorageResult<Vec<i32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i32>, _>>()?;

    Ok(versions)
}

fn record_migration(conn: &Connection, migration: &Migration) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![migration.version, migration.name, Utc::now().timestamp()],
    )?;

    Ok(())
}

/// 运行数据库迁移
///
/// 检查当前数据库版本并执行尚未应用的迁移脚本。
///
/// # Arguments
/// * `conn` - 数据库连接
///
/// # Returns
/// * `StorageResult<i32>` - 成功返回最终版本号
pub fn run_migrations(conn: &Connection) -> StorageResult<i32> {
    ensure_migrations_table(conn)?;

    let applied_versions = get_applied_versions(conn)?;
    let mut final_version = get_current_version(conn)?;

    log::info!(
        "当前数据库版本: {}, 目标版本: {}",
        final_version,
        CURRENT_SCHEMA_VERSION
    );

    for migration in get_migrations() {
        if applied_versions.contains(&migration.version) {
            continue;
        }

        log::info!("运行迁移 v{}: {}", migration.version, migration.name);

        match execute_migration_in_transaction(conn, &migration) {
            Ok(()) => {
                final_version = migration.version;
                log::info!("迁移 v{} 完成", migration.version);
            }
            Err(e) => {
                log::error!("迁移 v{} 失败: {}", migration.version, e);
                return Err(e);
            }
        }
    }

    Ok(final_version)
}

fn execute_migration_in_transaction(conn: &Connection, migration: &Migration) -> StorageResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match conn.execute_batch(&migration.sql) {
        Ok(()) => {
            if let Err(e) = record_migration(conn, migration) {
                conn.execute_batch("ROLLBACK").ok();
                return Err(e);
            }

            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK").ok();
            Err(StorageError::Migration(format!(
                "迁移 v{} 执行失败: {}",
                migration.version, e
            )))
        }
    }
}

/// 获取迁移历史
pub fn get_migration_history(conn: &Connection) -> StorageResult<Vec<MigrationRecord>> {
    ensure_migrations_table(conn)?;

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;

    let records = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                name: row.get(1)?,
                applied_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_db() -> Connection {
        Connection::open_in_memory().expect("Failed to open in-memory database")
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .expect("Failed to query sqlite_master")
    }

    #[test]
    fn test_get_migrations_sorted() {
        let migrations = get_migrations();
        assert_eq!(migrations.len() as i32, CURRENT_SCHEMA_VERSION);
        for (idx, migration) in migrations.iter().enumerate() {
            assert_eq!(migration.version, idx as i32 + 1);
        }
    }

    #[test]
    fn test_initial_migration_creates_tables() {
        let conn = setup_test_db();

        let version = run_migrations(&conn).expect("Migration should succeed");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        for table in [
            "liked_items",
            "progress",
            "vocabulary",
            "annotations",
            "sync_queue",
            "sync_failures",
            "sync_metadata",
        ] {
            assert!(table_exists(&conn, table), "missing table {}", table);
        }
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = setup_test_db();

        run_migrations(&conn).expect("First migration should succeed");
        run_migrations(&conn).expect("Second migration should succeed");

        assert_eq!(
            get_current_version(&conn).expect("version"),
            CURRENT_SCHEMA_VERSION
        );
        assert_eq!(get_migration_history(&conn).expect("history").len(), 2);
    }

    #[test]
    fn test_migration_history() {
        let conn = setup_test_db();
        run_migrations(&conn).expect("Migration should succeed");

        let history = get_migration_history(&conn).expect("history");
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].name, "初始表结构");
        assert!(history[0].applied_at > 0);
    }

    #[test]
    fn test_failed_migration_rolls_back() {
        let conn = setup_test_db();
        ensure_migrations_table(&conn).expect("migrations table");

        let broken = Migration::new(99, "损坏的迁移", "CREATE TABLE broken (; ");
        let err = execute_migration_in_transaction(&conn, &broken).unwrap_err();
        assert!(matches!(err, StorageError::Migration(_)));
        assert_eq!(get_current_version(&conn).expect("version"), 0);
    }
}
