use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::RetryRepository;
use crate::error::{Result, ServerError};
use crate::model::RetryRecord;

/// 重试记录 Repository（PostgreSQL）
pub struct PgRetryRepository {
    pool: PgPool,
}

impl PgRetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryRepository for PgRetryRepository {
    async fn insert_if_absent(&self, record: &RetryRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_retries
                (message_id, device_id, user_id, attempt, last_attempt_at, next_attempt_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (message_id, user_id, device_id) DO NOTHING
            "#,
        )
        .bind(record.message_id)
        .bind(&record.device_id)
        .bind(record.user_id)
        .bind(record.attempt as i32)
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("创建重试记录失败: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, message_id: Uuid, user_id: Uuid, device_id: &str) -> Result<Option<RetryRecord>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            message_id: Uuid,
            device_id: String,
            user_id: Uuid,
            attempt: i32,
            last_attempt_at: Option<DateTime<Utc>>,
            next_attempt_at: DateTime<Utc>,
            created_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT message_id, device_id, user_id, attempt, last_attempt_at, next_attempt_at, created_at
            FROM message_retries
            WHERE message_id = $1 AND user_id = $2 AND device_id = $3
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("查询重试记录失败: {}", e)))?;

        Ok(row.map(|row| RetryRecord {
            message_id: row.message_id,
            device_id: row.device_id,
            user_id: row.user_id,
            attempt: row.attempt.max(0) as u32,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
        }))
    }

    async fn advance(&self, record: &RetryRecord, expected_attempt: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_retries
            SET attempt = $4, last_attempt_at = $5, next_attempt_at = $6
            WHERE message_id = $1 AND user_id = $2 AND device_id = $3 AND attempt = $7
            "#,
        )
        .bind(record.message_id)
        .bind(record.user_id)
        .bind(&record.device_id)
        .bind(record.attempt as i32)
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(expected_attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("更新重试记录失败: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        device_id: &str,
        expected_attempt: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM message_retries \
             WHERE message_id = $1 AND user_id = $2 AND device_id = $3 AND attempt = $4",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(device_id)
        .bind(expected_attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("删除重试记录失败: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }
}
