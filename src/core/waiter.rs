//! 等待/唤醒原语：同步线程唯一的挂起点

use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// 同步线程在 `wait_until` 里挂起；协作方完成任何异步工作后
/// 调用 `notify` 把它唤醒。
pub struct Waiter {
    notify: Notify,
}

impl Waiter {
    pub fn new() -> Arc<Waiter> {
        Arc::new(Waiter {
            notify: Notify::new(),
        })
    }

    /// 唤醒同步线程（可在任意线程调用；多次调用合并成一次）
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// 挂起直到被唤醒或到达截止时间；被唤醒返回 true
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep_until(deadline) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let waiter = Waiter::new();
        let w = waiter.clone();

        let handle = tokio::spawn(async move {
            w.wait_until(Instant::now() + Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.notify();

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let waiter = Waiter::new();
        let woken = waiter
            .wait_until(Instant::now() + Duration::from_millis(20))
            .await;
        assert!(!woken);
    }

    #[tokio::test]
    async fn test_notify_before_wait_is_not_lost() {
        let waiter = Waiter::new();
        waiter.notify();
        let woken = waiter
            .wait_until(Instant::now() + Duration::from_millis(50))
            .await;
        assert!(woken);
    }
}
