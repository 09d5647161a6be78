use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// 在线状态存储
///
/// 由接入层在连接建立 / 断开时调用，投递链路只读。
/// 所有方法都不返回错误：查询失败或没有记录一律视为离线。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 用户是否有任一设备在线
    async fn is_online(&self, user_id: Uuid) -> bool;

    /// 指定设备是否在线
    async fn is_device_online(&self, user_id: Uuid, device_id: &str) -> bool;

    /// 设备建立连接（也可作为心跳重复调用）
    async fn mark_connected(&self, user_id: Uuid, device_id: &str);

    /// 设备断开连接
    async fn mark_disconnected(&self, user_id: Uuid, device_id: &str);
}

/// 在线统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceStats {
    pub online_users: usize,
    pub online_devices: usize,
    pub connections: usize,
}

/// 进程内在线状态跟踪器
///
/// 每个用户维护 设备 -> 连接数，同一设备开了多个连接时要全部断开才算离线。
/// 纯内存状态，进程重启后从零重建。
#[derive(Default)]
pub struct PresenceTracker {
    users: DashMap<Uuid, HashMap<String, u32>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, user_id: Uuid, device_id: &str) {
        let mut devices = self.users.entry(user_id).or_default();
        *devices.entry(device_id.to_string()).or_insert(0) += 1;
        debug!("👤 {}:{} connected", user_id, device_id);
    }

    pub fn disconnect(&self, user_id: Uuid, device_id: &str) {
        let mut emptied = false;
        if let Some(mut devices) = self.users.get_mut(&user_id) {
            if let Some(count) = devices.get_mut(device_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    devices.remove(device_id);
                }
            }
            emptied = devices.is_empty();
        }

        if emptied {
            self.users.remove_if(&user_id, |_, devices| devices.is_empty());
        }
        debug!("👋 {}:{} disconnected", user_id, device_id);
    }

    pub fn user_online(&self, user_id: Uuid) -> bool {
        self.users
            .get(&user_id)
            .map(|devices| !devices.is_empty())
            .unwrap_or(false)
    }

    pub fn device_online(&self, user_id: Uuid, device_id: &str) -> bool {
        self.users
            .get(&user_id)
            .map(|devices| devices.contains_key(device_id))
            .unwrap_or(false)
    }

    /// 用户当前在线的设备
    pub fn online_devices(&self, user_id: Uuid) -> Vec<String> {
        let mut devices: Vec<String> = self
            .users
            .get(&user_id)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        devices.sort();
        devices
    }

    pub fn stats(&self) -> PresenceStats {
        let mut stats = PresenceStats::default();
        for entry in self.users.iter() {
            stats.online_users += 1;
            stats.online_devices += entry.len();
            stats.connections += entry.values().map(|c| *c as usize).sum::<usize>();
        }
        stats
    }
}

#[async_trait]
impl PresenceStore for PresenceTracker {
    async fn is_online(&self, user_id: Uuid) -> bool {
        self.user_online(user_id)
    }

    async fn is_device_online(&self, user_id: Uuid, device_id: &str) -> bool {
        self.device_online(user_id, device_id)
    }

    async fn mark_connected(&self, user_id: Uuid, device_id: &str) {
        self.connect(user_id, device_id);
    }

    async fn mark_disconnected(&self, user_id: Uuid, device_id: &str) {
        self.disconnect(user_id, device_id);
    }
}
