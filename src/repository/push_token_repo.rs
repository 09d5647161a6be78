use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::PushTokenRepository;
use crate::error::{Result, ServerError};
use crate::model::{PushPlatform, PushToken};

#[derive(sqlx::FromRow)]
struct Row {
    id: Uuid,
    user_id: Uuid,
    device_id: String,
    platform: String,
    token: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl Row {
    /// 平台字段无法识别的行直接跳过
    fn into_token(self) -> Option<PushToken> {
        let platform = match self.platform.parse::<PushPlatform>() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("push token {}: {}", self.id, e);
                return None;
            }
        };
        Some(PushToken {
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            platform,
            token: self.token,
            created_at: self.created_at,
            updated_at: self.updated_at,
            revoked_at: self.revoked_at,
        })
    }
}

const COLUMNS: &str = "id, user_id, device_id, platform, token, created_at, updated_at, revoked_at";

/// 推送令牌 Repository（PostgreSQL）
pub struct PgPushTokenRepository {
    pool: PgPool,
}

impl PgPushTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PushTokenRepository for PgPushTokenRepository {
    async fn active_tokens(&self, user_id: Uuid, device_id: Option<&str>) -> Result<Vec<PushToken>> {
        let sql = format!(
            "SELECT {} FROM push_tokens \
             WHERE user_id = $1 AND revoked_at IS NULL AND ($2::varchar IS NULL OR device_id = $2) \
             ORDER BY device_id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, Row>(&sql)
            .bind(user_id)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询推送令牌失败: {}", e)))?;

        Ok(rows.into_iter().filter_map(Row::into_token).collect())
    }

    async fn active_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM push_tokens \
             WHERE user_id = ANY($1) AND revoked_at IS NULL \
             ORDER BY user_id, device_id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, Row>(&sql)
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("批量查询推送令牌失败: {}", e)))?;

        Ok(rows.into_iter().filter_map(Row::into_token).collect())
    }

    async fn register(
        &self,
        user_id: Uuid,
        device_id: &str,
        platform: PushPlatform,
        token: &str,
    ) -> Result<PushToken> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServerError::Database(format!("开启事务失败: {}", e)))?;

        // 同一个令牌转移到了新设备（重装 / 换账号），先释放旧行
        sqlx::query(
            "DELETE FROM push_tokens WHERE token = $1 AND NOT (user_id = $2 AND device_id = $3)",
        )
        .bind(token)
        .bind(user_id)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ServerError::Database(format!("清理旧推送令牌失败: {}", e)))?;

        let sql = format!(
            "INSERT INTO push_tokens (user_id, device_id, platform, token) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, device_id) DO UPDATE \
             SET platform = EXCLUDED.platform, token = EXCLUDED.token, \
                 updated_at = NOW(), revoked_at = NULL \
             RETURNING {}",
            COLUMNS
        );
        let row = sqlx::query_as::<_, Row>(&sql)
            .bind(user_id)
            .bind(device_id)
            .bind(platform.as_str())
            .bind(token)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ServerError::Database(format!("注册推送令牌失败: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ServerError::Database(format!("提交事务失败: {}", e)))?;

        row.into_token()
            .ok_or_else(|| ServerError::Internal("registered token has unknown platform".to_string()))
    }

    async fn revoke(&self, user_id: Uuid, device_id: &str, token: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE push_tokens
            SET revoked_at = $4, updated_at = $4
            WHERE user_id = $1 AND device_id = $2 AND token = $3 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(token)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("吊销推送令牌失败: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }
}
