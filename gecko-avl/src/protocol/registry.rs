//! 设备注册表
//! 进程内唯一的共享可变结构，记录已认证连接的存活状态。
//! 同一 IMEI 重连时替换旧会话：给旧会话发关闭信号，新条目立即生效

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use log::warn;
use tokio::sync::{mpsc, RwLock};

/// 一条已认证连接
#[derive(Debug)]
struct ActiveDevice {
    peer: SocketAddr,
    connected_at_ms: u64,
    last_activity_ms: u64,
    bytes_received: u64,
    packets_processed: u64,
    /// 会话令牌，注销时校验，防止挤掉接替者
    token: u64,
    /// 通知会话退出的信号
    close_tx: mpsc::Sender<()>,
}

/// 监控侧看到的注册表条目
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDeviceView {
    pub device_id: String,
    pub connected_at: u64,
    pub last_activity_at: u64,
    pub bytes_received: u64,
    pub packets_processed: u64,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, ActiveDevice>>,
    next_token: AtomicU64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一条已认证连接，返回会话令牌
    /// 同 IMEI 已在线时给旧会话发关闭信号，新条目直接覆盖
    pub async fn register(
        &self,
        imei: &str,
        peer: SocketAddr,
        close_tx: mpsc::Sender<()>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ms();
        let entry = ActiveDevice {
            peer,
            connected_at_ms: now,
            last_activity_ms: now,
            bytes_received: 0,
            packets_processed: 0,
            token,
            close_tx,
        };

        let mut devices = self.devices.write().await;
        if let Some(old) = devices.insert(imei.into(), entry) {
            if let Err(e) = old.close_tx.try_send(()) {
                warn!("failed to signal replaced session of {}: {}", imei, e);
            }
        }
        token
    }

    /// 累加存活统计
    pub async fn touch(&self, imei: &str, bytes: u64, packets: u64) {
        if let Some(device) = self.devices.write().await.get_mut(imei) {
            device.last_activity_ms = now_ms();
            device.bytes_received += bytes;
            device.packets_processed += packets;
        }
    }

    /// 注销一条连接，令牌不匹配说明条目已被重连会话接管，不动
    pub async fn unregister(&self, imei: &str, token: u64) {
        let mut devices = self.devices.write().await;
        if devices.get(imei).map(|d| d.token) == Some(token) {
            devices.remove(imei);
        }
    }

    /// 给所有会话发关闭信号，优雅停机用
    pub async fn close_all(&self) {
        for (imei, device) in self.devices.read().await.iter() {
            if let Err(e) = device.close_tx.try_send(()) {
                warn!("failed to signal session of {}: {}", imei, e);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// 拷出监控快照
    pub async fn snapshot(&self) -> Vec<ActiveDeviceView> {
        let devices = self.devices.read().await;
        let mut views: Vec<ActiveDeviceView> = devices
            .iter()
            .map(|(imei, d)| ActiveDeviceView {
                device_id: imei.clone(),
                connected_at: d.connected_at_ms,
                last_activity_at: d.last_activity_ms,
                bytes_received: d.bytes_received,
                packets_processed: d.packets_processed,
            })
            .collect();
        views.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        views
    }

    /// 连接的对端地址，日志用
    pub async fn peer_of(&self, imei: &str) -> Option<SocketAddr> {
        self.devices.read().await.get(imei).map(|d| d.peer)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn register_and_unregister_work() {
        let registry = DeviceRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let token = registry.register("353691841005134", addr(1000), tx).await;
        assert_eq!(registry.len().await, 1);

        registry.touch("353691841005134", 66, 1).await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].device_id, "353691841005134");
        assert_eq!(snapshot[0].bytes_received, 66);
        assert_eq!(snapshot[0].packets_processed, 1);

        registry.unregister("353691841005134", token).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn replacement_signals_old_session() {
        let registry = DeviceRegistry::new();
        let (old_tx, mut old_rx) = mpsc::channel(1);
        let old_token = registry.register("353691841005134", addr(1000), old_tx).await;

        let (new_tx, _new_rx) = mpsc::channel(1);
        let new_token = registry.register("353691841005134", addr(1001), new_tx).await;
        assert_ne!(old_token, new_token);
        assert_eq!(registry.len().await, 1);
        // 旧会话收到关闭信号
        assert_eq!(old_rx.try_recv(), Ok(()));

        // 旧会话迟到的注销不能挤掉新条目
        registry.unregister("353691841005134", old_token).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.peer_of("353691841005134").await, Some(addr(1001)));

        registry.unregister("353691841005134", new_token).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn close_all_signals_every_session() {
        let registry = DeviceRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        registry.register("111111111111111", addr(1), tx1).await;
        registry.register("222222222222222", addr(2), tx2).await;

        registry.close_all().await;
        assert_eq!(rx1.try_recv(), Ok(()));
        assert_eq!(rx2.try_recv(), Ok(()));
    }
}
