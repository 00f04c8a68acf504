// ============================================================================
// src/eeh/handler.rs - Driver Recovery Callback Interface
// ============================================================================
//!
//! デバイスドライバが任意に実装する回復コールバック。
//!
//! 呼び出し順: `error_detected` → `mmio_enabled` → `slot_reset` → `resume`、
//! 失敗時は `permanent_failure`。未実装のメソッドは `RecoveryResult::None`
//! （または何もしない）と等価。

use alloc::sync::Arc;

use super::types::{ChannelState, DeviceAddress, RecoveryResult};

/// ドライバの回復コールバック
pub trait RecoveryHandler: Send + Sync {
    /// エラー検出通知。以降ドライバはMMIOに触れてはならない
    fn error_detected(&self, _dev: DeviceAddress, _state: ChannelState) -> RecoveryResult {
        RecoveryResult::None
    }

    /// MMIOアクセスが再び安全になった（DMAはまだ凍結されている可能性あり）
    fn mmio_enabled(&self, _dev: DeviceAddress) -> RecoveryResult {
        RecoveryResult::None
    }

    /// ハードウェアリセット完了。割り込みは再有効化済み
    fn slot_reset(&self, _dev: DeviceAddress) -> RecoveryResult {
        RecoveryResult::None
    }

    /// 通常動作の再開
    fn resume(&self, _dev: DeviceAddress) {}

    /// 永久障害の通知
    fn permanent_failure(&self, _dev: DeviceAddress) {}
}

/// デバイスにバインドされたドライバ
#[derive(Clone)]
pub struct DriverBinding {
    pub name: &'static str,
    /// 回復コールバック（EEH非対応ドライバは `None`）
    pub handler: Option<Arc<dyn RecoveryHandler>>,
}

impl DriverBinding {
    /// 回復コールバックを持つドライバ
    pub fn new(name: &'static str, handler: Arc<dyn RecoveryHandler>) -> Self {
        Self {
            name,
            handler: Some(handler),
        }
    }

    /// 回復コールバックを持たないドライバ
    pub fn unaware(name: &'static str) -> Self {
        Self {
            name,
            handler: None,
        }
    }
}
