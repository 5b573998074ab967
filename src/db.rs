// ==========================================
// 血液履约编排核心 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发写入时的偶发 busy 错误
// - 统一时间戳格式（RFC3339 UTC 毫秒，字典序 == 时间序）
// ==========================================

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要"每个连接"单独开启
/// - busy_timeout 需要"每个连接"单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 创建全部业务表（幂等）
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS facility (
            facility_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            has_testing_capability INTEGER NOT NULL DEFAULT 1,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS college (
            college_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            coordinator_id TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS donor (
            donor_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            blood_group TEXT NOT NULL,
            eligibility TEXT NOT NULL,
            availability TEXT NOT NULL,
            last_donation_date TEXT,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            college_id TEXT
        );

        CREATE TABLE IF NOT EXISTS blood_request (
            request_id TEXT PRIMARY KEY,
            hospital_id TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            blood_group TEXT NOT NULL,
            component TEXT NOT NULL,
            units INTEGER NOT NULL,
            urgency TEXT NOT NULL,
            deadline TEXT NOT NULL,
            status TEXT NOT NULL,
            reserved_units INTEGER NOT NULL DEFAULT 0,
            issued_units INTEGER NOT NULL DEFAULT 0,
            fulfillment_details_json TEXT NOT NULL,
            outcome_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_request_status
          ON blood_request(status, created_at);

        CREATE TABLE IF NOT EXISTS inventory_unit (
            unit_id TEXT PRIMARY KEY,
            facility_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            blood_group TEXT NOT NULL,
            component TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            expiry_date TEXT NOT NULL,
            status TEXT NOT NULL,
            reserved_request_id TEXT,
            reserved_at TEXT,
            reservation_expires_at TEXT,
            lock_id TEXT,
            issued_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_unit_lookup
          ON inventory_unit(facility_id, blood_group, component, status, expiry_date);

        CREATE INDEX IF NOT EXISTS idx_unit_reservation
          ON inventory_unit(reserved_request_id, status);

        CREATE TABLE IF NOT EXISTS donor_appointment (
            appointment_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            donor_id TEXT NOT NULL,
            facility_id TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_appointment_request
          ON donor_appointment(request_id, status);

        CREATE TABLE IF NOT EXISTS donor_response (
            request_id TEXT NOT NULL,
            donor_id TEXT NOT NULL,
            response TEXT NOT NULL,
            reason TEXT,
            responded_at TEXT NOT NULL,
            PRIMARY KEY (request_id, donor_id)
        );

        CREATE TABLE IF NOT EXISTS donor_invitation (
            request_id TEXT NOT NULL,
            donor_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            invited_at TEXT NOT NULL,
            PRIMARY KEY (request_id, donor_id, channel)
        );

        CREATE TABLE IF NOT EXISTS delivery (
            delivery_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            facility_id TEXT NOT NULL,
            destination_id TEXT NOT NULL,
            unit_ids_json TEXT NOT NULL,
            eta_minutes INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            delivered_at TEXT
        );

        CREATE TABLE IF NOT EXISTS action_log (
            action_id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            action_ts TEXT NOT NULL,
            actor TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload_json TEXT,
            detail TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_action_log_entity
          ON action_log(entity_type, entity_id, action_ts);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

// ==========================================
// 时间戳格式
// ==========================================

/// 统一时间戳格式: 2026-01-01T08:00:00.000Z
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn fmt_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}
