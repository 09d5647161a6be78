use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 媒体消息的推送预览文案
pub const MEDIA_PREVIEW: &str = "Media message";
/// 系统消息的推送预览文案
pub const SYSTEM_PREVIEW: &str = "New message";

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Media,
    System,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Media => "media",
            ContentType::System => "system",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "media" => Ok(ContentType::Media),
            "system" => Ok(ContentType::System),
            other => Err(format!("unknown content type: {}", other)),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息
///
/// 由发送链路创建，投递核心只读，唯一会写回的字段是 `delivered_at`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content_type: ContentType,
    /// 文本内容（媒体消息可能为空）
    pub body: String,
    /// 媒体地址（仅媒体消息）
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// 任一接收者在线时写入，写入后不再修改
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    /// 推送通知使用的内容预览
    ///
    /// 文本按字符截断，媒体和系统消息只给固定文案，不把媒体内容放进推送。
    pub fn preview(&self, max_chars: usize) -> String {
        match self.content_type {
            ContentType::Text => self.body.chars().take(max_chars).collect(),
            ContentType::Media => MEDIA_PREVIEW.to_string(),
            ContentType::System => SYSTEM_PREVIEW.to_string(),
        }
    }
}

/// 会话成员
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    /// 非空表示已退出，不再参与投递
    pub left_at: Option<DateTime<Utc>>,
}

impl ConversationMember {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content_type: ContentType, body: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content_type,
            body: body.to_string(),
            media_url: None,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[test]
    fn test_text_preview_truncates_by_char() {
        let long = "你".repeat(200);
        let preview = message(ContentType::Text, &long).preview(140);
        assert_eq!(preview.chars().count(), 140);

        assert_eq!(message(ContentType::Text, "hello").preview(140), "hello");
    }

    #[test]
    fn test_media_and_system_use_fixed_labels() {
        let mut media = message(ContentType::Media, "");
        media.media_url = Some("s3://bucket/cat.png".to_string());
        assert_eq!(media.preview(140), MEDIA_PREVIEW);
        assert_eq!(message(ContentType::System, "alice joined").preview(140), SYSTEM_PREVIEW);
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!("media".parse::<ContentType>().unwrap(), ContentType::Media);
        assert!("video".parse::<ContentType>().is_err());
    }
}
