use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::MessageRepository;
use crate::error::{Result, ServerError};
use crate::model::{ContentType, Message};

/// 消息 Repository（PostgreSQL）
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: Uuid,
            conversation_id: Uuid,
            sender_user_id: Uuid,
            content_type: String,
            body: String,
            media_url: Option<String>,
            created_at: DateTime<Utc>,
            delivered_at: Option<DateTime<Utc>>,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT id, conversation_id, sender_user_id, content_type, body, media_url,
                   created_at, delivered_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("查询消息失败: {}", e)))?;

        Ok(row.map(|row| {
            let content_type = row.content_type.parse().unwrap_or_else(|e| {
                tracing::warn!("message {}: {}, treating as system", row.id, e);
                ContentType::System
            });
            Message {
                id: row.id,
                conversation_id: row.conversation_id,
                sender_id: row.sender_user_id,
                content_type,
                body: row.body,
                media_url: row.media_url,
                created_at: row.created_at,
                delivered_at: row.delivered_at,
            }
        }))
    }

    async fn active_recipients(&self, conversation_id: Uuid, exclude_user: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM conversation_members
            WHERE conversation_id = $1 AND user_id <> $2 AND left_at IS NULL
            ORDER BY user_id
            "#,
        )
        .bind(conversation_id)
        .bind(exclude_user)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("查询会话成员失败: {}", e)))
    }

    async fn mark_delivered(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET delivered_at = $2 WHERE id = $1 AND delivered_at IS NULL",
        )
        .bind(message_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("更新消息送达时间失败: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }
}
