//! 队列任务定义
//!
//! 每种任务都有确定性的幂等键，重复入队或重复执行不会产生额外效果。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::push::types::PushMessage;
use crate::queue::{Job, QueueName};

/// 消息推送标题
pub const MESSAGE_PUSH_TITLE: &str = "New message";
/// 通用通知的默认标题
pub const DEFAULT_NOTIFICATION_TITLE: &str = "Notification";
/// 通用通知的默认正文
pub const DEFAULT_NOTIFICATION_BODY: &str = "You have a new notification";
/// 通用通知 data.type 的默认值
pub const DEFAULT_NOTIFICATION_TYPE: &str = "system";

/// 新消息投递任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverMessageJob {
    pub message_id: Uuid,
}

impl Job for DeliverMessageJob {
    const QUEUE: QueueName = QueueName::Message;
    const NAME: &'static str = "deliver-message";

    fn idempotency_key(&self) -> String {
        format!("deliver:{}", self.message_id)
    }
}

/// 推送内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PushKind {
    /// 某条消息的离线推送，`attempt` 为对应的重试轮次
    #[serde(rename_all = "camelCase")]
    Message {
        message_id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        preview: String,
        attempt: u32,
    },
    /// 通用系统通知，发往用户的全部设备
    #[serde(rename_all = "camelCase")]
    Notification {
        notification_id: Uuid,
        title: Option<String>,
        body: Option<String>,
        #[serde(default)]
        data: BTreeMap<String, String>,
    },
}

/// 推送任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushJob {
    pub user_id: Uuid,
    /// `None` 表示发往用户的全部设备
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub kind: PushKind,
}

impl PushJob {
    pub fn message(
        user_id: Uuid,
        device_id: impl Into<String>,
        message_id: Uuid,
        conversation_id: Uuid,
        sender_id: Uuid,
        preview: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            user_id,
            device_id: Some(device_id.into()),
            kind: PushKind::Message {
                message_id,
                conversation_id,
                sender_id,
                preview: preview.into(),
                attempt,
            },
        }
    }

    pub fn notification(
        user_id: Uuid,
        notification_id: Uuid,
        title: Option<String>,
        body: Option<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            user_id,
            device_id: None,
            kind: PushKind::Notification {
                notification_id,
                title,
                body,
                data,
            },
        }
    }

    /// 转换为发给推送平台的内容
    pub fn to_push_message(&self) -> PushMessage {
        match &self.kind {
            PushKind::Message {
                message_id,
                conversation_id,
                sender_id,
                preview,
                ..
            } => {
                let mut data = BTreeMap::new();
                data.insert("type".to_string(), "message".to_string());
                data.insert("messageId".to_string(), message_id.to_string());
                data.insert("conversationId".to_string(), conversation_id.to_string());
                data.insert("senderUserId".to_string(), sender_id.to_string());
                PushMessage {
                    title: MESSAGE_PUSH_TITLE.to_string(),
                    body: preview.clone(),
                    data,
                }
            }
            PushKind::Notification { title, body, data, .. } => {
                let mut data = data.clone();
                data.entry("type".to_string())
                    .or_insert_with(|| DEFAULT_NOTIFICATION_TYPE.to_string());
                PushMessage {
                    title: title.clone().unwrap_or_else(|| DEFAULT_NOTIFICATION_TITLE.to_string()),
                    body: body.clone().unwrap_or_else(|| DEFAULT_NOTIFICATION_BODY.to_string()),
                    data,
                }
            }
        }
    }
}

impl Job for PushJob {
    const QUEUE: QueueName = QueueName::Push;
    const NAME: &'static str = "push";

    fn idempotency_key(&self) -> String {
        match &self.kind {
            PushKind::Message { message_id, attempt, .. } => format!(
                "push:{}:{}:{}:{}",
                message_id,
                self.user_id,
                self.device_id.as_deref().unwrap_or("*"),
                attempt
            ),
            PushKind::Notification { notification_id, .. } => {
                format!("notify:{}:{}", notification_id, self.user_id)
            }
        }
    }
}

/// 消息级重试任务，`attempt` 是入队时重试记录所处的轮次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub message_id: Uuid,
    pub device_id: String,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub preview: String,
    pub attempt: u32,
}

impl RetryJob {
    /// 同一条重试链的下一轮
    pub fn next(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// 提前触发后重新排队使用的幂等键，`at` 为本次触发时间
    pub fn deferral_key(&self, at: DateTime<Utc>) -> String {
        format!("{}:defer:{}", self.idempotency_key(), at.timestamp_micros())
    }

    /// 本轮要发出的推送
    pub fn push_job(&self, attempt: u32) -> PushJob {
        PushJob::message(
            self.user_id,
            self.device_id.clone(),
            self.message_id,
            self.conversation_id,
            self.sender_id,
            self.preview.clone(),
            attempt,
        )
    }
}

impl Job for RetryJob {
    const QUEUE: QueueName = QueueName::MessageRetry;
    const NAME: &'static str = "message-retry";

    fn idempotency_key(&self) -> String {
        format!(
            "retry:{}:{}:{}:{}",
            self.message_id, self.user_id, self.device_id, self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_job() -> RetryJob {
        RetryJob {
            message_id: Uuid::new_v4(),
            device_id: "d1".to_string(),
            user_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            preview: "hello".to_string(),
            attempt: 0,
        }
    }

    #[test]
    fn test_idempotency_keys() {
        let job = retry_job();
        let (mid, user) = (job.message_id, job.user_id);
        assert_eq!(job.idempotency_key(), format!("retry:{}:{}:d1:0", mid, user));
        assert_eq!(job.next(3).idempotency_key(), format!("retry:{}:{}:d1:3", mid, user));
        assert_eq!(job.push_job(1).idempotency_key(), format!("push:{}:{}:d1:1", mid, user));

        // 不同用户的同名设备互不冲突
        let other = RetryJob {
            user_id: Uuid::new_v4(),
            ..job.clone()
        };
        assert_ne!(other.idempotency_key(), job.idempotency_key());
        assert_ne!(other.push_job(0).idempotency_key(), job.push_job(0).idempotency_key());

        let deliver = DeliverMessageJob {
            message_id: job.message_id,
        };
        assert_eq!(deliver.idempotency_key(), format!("deliver:{}", job.message_id));

        let nid = Uuid::new_v4();
        let notify = PushJob::notification(job.user_id, nid, None, None, BTreeMap::new());
        assert_eq!(notify.idempotency_key(), format!("notify:{}:{}", nid, job.user_id));
    }

    #[test]
    fn test_message_push_content() {
        let job = retry_job().push_job(0);
        let message = job.to_push_message();
        assert_eq!(message.title, MESSAGE_PUSH_TITLE);
        assert_eq!(message.body, "hello");
        assert_eq!(message.data["type"], "message");
        assert!(message.data.contains_key("messageId"));
        assert!(message.data.contains_key("conversationId"));
        assert!(message.data.contains_key("senderUserId"));
    }

    #[test]
    fn test_notification_defaults() {
        let job = PushJob::notification(Uuid::new_v4(), Uuid::new_v4(), None, None, BTreeMap::new());
        let message = job.to_push_message();
        assert_eq!(message.title, DEFAULT_NOTIFICATION_TITLE);
        assert_eq!(message.body, DEFAULT_NOTIFICATION_BODY);
        assert_eq!(message.data["type"], DEFAULT_NOTIFICATION_TYPE);

        let mut data = BTreeMap::new();
        data.insert("type".to_string(), "friend_request".to_string());
        let job = PushJob::notification(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Some("Hi".to_string()),
            Some("Bob wants to connect".to_string()),
            data,
        );
        let message = job.to_push_message();
        assert_eq!(message.title, "Hi");
        assert_eq!(message.data["type"], "friend_request");
    }

    #[test]
    fn test_push_job_serde() {
        let job = retry_job().push_job(2);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["attempt"], 2);
        let back: PushJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
