// ============================================================================
// src/eeh/event.rs - Fault Report Queue
// ============================================================================
//!
//! 検出側から送られた障害報告を、回復ワーカが取り出すまで保持するキュー。

use alloc::collections::VecDeque;
use spin::Mutex;

use super::types::PeAddress;

/// キューから取り除く範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    /// 全イベント
    All,
    /// 指定コントローラ配下のPE宛てイベント
    Controller(u16),
    /// 指定PE宛てのイベント
    Domain(PeAddress),
}

/// 障害報告キュー
pub struct EventQueue {
    /// `None` はファブリック全体の特殊イベント
    queue: Mutex<VecDeque<Option<PeAddress>>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, target: Option<PeAddress>) {
        self.queue.lock().push_back(target);
    }

    pub fn pop(&self) -> Option<Option<PeAddress>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 範囲内のイベントを破棄し、破棄した数を返す
    ///
    /// 特殊イベントは `All` でのみ破棄される。
    pub fn purge(&self, scope: PurgeScope) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.len();
        match scope {
            PurgeScope::All => queue.clear(),
            PurgeScope::Controller(phb) => {
                queue.retain(|ev| !matches!(ev, Some(pe) if pe.controller == phb))
            }
            PurgeScope::Domain(target) => queue.retain(|ev| *ev != Some(target)),
        }
        before - queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> EventQueue {
        let q = EventQueue::new();
        q.push(Some(PeAddress::new(0, 1)));
        q.push(None);
        q.push(Some(PeAddress::new(1, 1)));
        q.push(Some(PeAddress::new(0, 2)));
        q
    }

    #[test]
    fn test_fifo_order() {
        let q = filled();
        assert_eq!(q.pop(), Some(Some(PeAddress::new(0, 1))));
        assert_eq!(q.pop(), Some(None));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_purge_controller_keeps_special_events() {
        let q = filled();
        assert_eq!(q.purge(PurgeScope::Controller(0)), 2);
        assert_eq!(q.pop(), Some(None));
        assert_eq!(q.pop(), Some(Some(PeAddress::new(1, 1))));
        assert!(q.is_empty());
    }

    #[test]
    fn test_purge_domain_and_all() {
        let q = filled();
        assert_eq!(q.purge(PurgeScope::Domain(PeAddress::new(0, 2))), 1);
        assert_eq!(q.len(), 3);
        assert_eq!(q.purge(PurgeScope::All), 3);
        assert_eq!(q.pop(), None);
    }
}
