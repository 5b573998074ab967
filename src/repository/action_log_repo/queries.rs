use super::core::ActionLogRepository;
use crate::db::fmt_ts;
use crate::domain::action_log::ActionLog;
use crate::repository::error::RepositoryResult;
use crate::repository::row_mapping::{conversion_error, ts_col};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row};

const COLUMNS: &str = r#"
    action_id, action_type, action_ts, actor, entity_type, entity_id, payload_json, detail
"#;

impl ActionLogRepository {
    // ==========================================
    // 查询操作
    // ==========================================

    /// 按 action_id 查询单个日志
    pub fn find_by_id(&self, action_id: &str) -> RepositoryResult<Option<ActionLog>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM action_log WHERE action_id = ?1", COLUMNS);
        let log = conn
            .query_row(&sql, params![action_id], |row| self.map_row(row))
            .optional()?;
        Ok(log)
    }

    /// 查询实体的全部日志（按时间正序，用于重建决策历史）
    pub fn find_by_entity(&self, entity_type: &str, entity_id: &str) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM action_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY action_ts ASC, rowid ASC
            "#,
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![entity_type, entity_id], |row| self.map_row(row))?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }

    /// 查询指定时间范围的操作日志
    pub fn find_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {} FROM action_log
            WHERE action_ts BETWEEN ?1 AND ?2
            ORDER BY action_ts DESC
            "#,
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![fmt_ts(&start_time), fmt_ts(&end_time)], |row| {
                self.map_row(row)
            })?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }

    /// 查询最近 N 条日志
    pub fn find_recent(&self, limit: usize) -> RepositoryResult<Vec<ActionLog>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM action_log ORDER BY action_ts DESC, rowid DESC LIMIT ?1",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![limit as i64], |row| self.map_row(row))?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(logs)
    }

    /// 按实体与操作类型计数
    pub fn count_by_type(&self, entity_id: &str, action_type: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_log WHERE entity_id = ?1 AND action_type = ?2",
            params![entity_id, action_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_row(&self, row: &Row) -> SqliteResult<ActionLog> {
        let payload_raw: Option<String> = row.get(6)?;
        let payload_json = match payload_raw {
            None => None,
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| conversion_error(6, format!("payload_json 解析失败: {}", e)))?,
            ),
        };

        Ok(ActionLog {
            action_id: row.get(0)?,
            action_type: row.get(1)?,
            action_ts: ts_col(row, 2)?,
            actor: row.get(3)?,
            entity_type: row.get(4)?,
            entity_id: row.get(5)?,
            payload_json,
            detail: row.get(7)?,
        })
    }
}
