//! 网络状态监听
//!
//! 宿主平台把连通性变化推送进来，上传队列订阅 watch 通道，
//! 在每次变化时重新计算挂起策略

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// 网络连通性状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// 无网络
    Offline,
    /// 蜂窝网络
    Cellular,
    /// Wi-Fi
    Wifi,
}

impl NetworkStatus {
    /// 在给定策略下是否允许上传
    ///
    /// 无网络一律挂起；开启"仅 Wi-Fi"时蜂窝网络也挂起
    pub fn allows_upload(&self, wifi_only: bool) -> bool {
        match self {
            NetworkStatus::Offline => false,
            NetworkStatus::Cellular => !wifi_only,
            NetworkStatus::Wifi => true,
        }
    }
}

/// 网络状态监视器
///
/// 持有 watch 发送端；宿主调用 `update` 推送变化，
/// 消费方通过 `subscribe` 拿到接收端
#[derive(Debug)]
pub struct NetworkMonitor {
    sender: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// 创建监视器，初始状态由宿主给出
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// 推送网络状态变化
    pub fn update(&self, status: NetworkStatus) {
        let old = *self.sender.borrow();
        if old != status {
            info!("网络状态变化: {:?} -> {:?}", old, status);
            let _ = self.sender.send(status);
        }
    }

    /// 当前状态
    pub fn current(&self) -> NetworkStatus {
        *self.sender.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.sender.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Wifi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_upload_policy() {
        assert!(!NetworkStatus::Offline.allows_upload(false));
        assert!(!NetworkStatus::Offline.allows_upload(true));

        assert!(NetworkStatus::Cellular.allows_upload(false));
        assert!(!NetworkStatus::Cellular.allows_upload(true));

        assert!(NetworkStatus::Wifi.allows_upload(false));
        assert!(NetworkStatus::Wifi.allows_upload(true));
    }

    #[tokio::test]
    async fn test_monitor_notifies_subscriber() {
        let monitor = NetworkMonitor::new(NetworkStatus::Wifi);
        let mut rx = monitor.subscribe();

        monitor.update(NetworkStatus::Cellular);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Cellular);
        assert_eq!(monitor.current(), NetworkStatus::Cellular);
    }

    #[tokio::test]
    async fn test_monitor_skips_duplicate_updates() {
        let monitor = NetworkMonitor::new(NetworkStatus::Wifi);
        let mut rx = monitor.subscribe();

        // 重复推送相同状态不应产生通知
        monitor.update(NetworkStatus::Wifi);
        assert!(!rx.has_changed().unwrap());
    }
}
