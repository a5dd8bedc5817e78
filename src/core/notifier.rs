//! 目录变更通知队列
//!
//! 平台监视器在外部；它只往这里投递粗粒度的"子树已脏"提示。
//! 每个同步两条队列：立即队列当轮处理，延迟队列等待静置期满
//! 再处理（编辑器的连环写入借此合并）。

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::node::NodeDbId;

/// 同一 (节点, 路径) 在该窗口内的重复通知被合并
const DEDUP_WINDOW: Duration = Duration::from_millis(100);

/// 延迟队列的静置时间
pub const EXTRA_SCANNING_DELAY: Duration = Duration::from_millis(500);

/// 一条子树脏通知
#[derive(Debug, Clone)]
pub struct Notification {
    pub dbid: NodeDbId,
    pub path: PathBuf,
    pub at: Instant,
}

/// 每个同步一份的通知队列
pub struct DirNotifier {
    immediate: VecDeque<Notification>,
    delayed: VecDeque<Notification>,
    recent: HashMap<(NodeDbId, PathBuf), Instant>,
}

impl DirNotifier {
    pub fn new() -> DirNotifier {
        DirNotifier {
            immediate: VecDeque::new(),
            delayed: VecDeque::new(),
            recent: HashMap::new(),
        }
    }

    fn deduped(&mut self, dbid: NodeDbId, path: &PathBuf) -> bool {
        let now = Instant::now();
        let key = (dbid, path.clone());
        if let Some(last) = self.recent.get(&key) {
            if now.duration_since(*last) < DEDUP_WINDOW {
                return true;
            }
        }
        self.recent.insert(key, now);
        // 防止窗口表无限增长
        if self.recent.len() > 4096 {
            let cutoff = now - DEDUP_WINDOW;
            self.recent.retain(|_, t| *t >= cutoff);
        }
        false
    }

    /// 投递立即通知
    pub fn notify_dirty(&mut self, dbid: NodeDbId, path: PathBuf) {
        if self.deduped(dbid, &path) {
            return;
        }
        self.immediate.push_back(Notification {
            dbid,
            path,
            at: Instant::now(),
        });
    }

    /// 投递延迟通知（静置期满才可处理）
    pub fn notify_delayed(&mut self, dbid: NodeDbId, path: PathBuf) {
        if self.deduped(dbid, &path) {
            return;
        }
        self.delayed.push_back(Notification {
            dbid,
            path,
            at: Instant::now(),
        });
    }

    /// 取走当前可处理的通知：全部立即项 + 静置期满的延迟项
    pub fn drain_ready(&mut self) -> Vec<Notification> {
        let mut out: Vec<Notification> = self.immediate.drain(..).collect();

        let now = Instant::now();
        while let Some(front) = self.delayed.front() {
            if now.duration_since(front.at) >= EXTRA_SCANNING_DELAY {
                out.push(self.delayed.pop_front().unwrap());
            } else {
                break;
            }
        }
        out
    }

    /// 是否还有通知（含未到期的延迟项）
    pub fn has_pending(&self) -> bool {
        !self.immediate.is_empty() || !self.delayed.is_empty()
    }

    /// 下一个延迟项到期时刻（用于计算挂起截止时间）
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.immediate.is_empty() {
            return Some(Instant::now());
        }
        self.delayed.front().map(|n| n.at + EXTRA_SCANNING_DELAY)
    }

    pub fn clear(&mut self) {
        self.immediate.clear();
        self.delayed.clear();
        self.recent.clear();
    }
}

impl Default for DirNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_drains_now() {
        let mut notifier = DirNotifier::new();
        notifier.notify_dirty(1, PathBuf::from("/a"));
        notifier.notify_dirty(2, PathBuf::from("/b"));

        let ready = notifier.drain_ready();
        assert_eq!(ready.len(), 2);
        assert!(!notifier.has_pending());
    }

    #[tokio::test]
    async fn test_duplicate_within_window_coalesces() {
        let mut notifier = DirNotifier::new();
        notifier.notify_dirty(1, PathBuf::from("/a"));
        notifier.notify_dirty(1, PathBuf::from("/a"));
        notifier.notify_dirty(1, PathBuf::from("/a"));

        assert_eq!(notifier.drain_ready().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_waits_for_quiet_period() {
        let mut notifier = DirNotifier::new();
        notifier.notify_delayed(1, PathBuf::from("/a"));

        assert!(notifier.drain_ready().is_empty());
        assert!(notifier.has_pending());

        tokio::time::advance(EXTRA_SCANNING_DELAY + Duration::from_millis(10)).await;
        assert_eq!(notifier.drain_ready().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let mut notifier = DirNotifier::new();
        notifier.notify_dirty(1, PathBuf::from("/a"));
        notifier.notify_delayed(2, PathBuf::from("/b"));
        notifier.clear();
        assert!(!notifier.has_pending());
    }
}
