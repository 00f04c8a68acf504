// ============================================================================
// src/eeh/state_machine.rs - Normal Recovery State Machine
// ============================================================================
//!
//! 1つのPEの回復フェーズと、その遷移関数。
//!
//! ```text
//! FreezeCheck → Announce → Settle → [HotplugReset] → Mmio → Dma
//!             → [ForcedReset] → Resume | PermanentFailure
//! ```
//!
//! 各フェーズは `Step` を返し、`transition` が次のフェーズを決める。
//! `Step::Fail` はどのフェーズからでも `PermanentFailure` に遷移する。

use core::fmt;

use super::types::RecoveryResult;
use crate::error::PlatformError;

/// 回復フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// フリーズ回数の上限チェック
    FreezeCheck,
    /// 全デバイスに `error_detected` を通知
    Announce,
    /// ハードウェア状態の安定待ち
    Settle,
    /// デタッチ・再アタッチを伴うリセット
    HotplugReset,
    /// MMIO解凍と `mmio_enabled`
    Mmio,
    /// DMA解凍
    Dma,
    /// デタッチなしのリセットと `slot_reset`
    ForcedReset,
    /// `resume` 通知（終端）
    Resume,
    /// 永久障害処理（終端）
    PermanentFailure(FailureCause),
}

impl Phase {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Phase::Resume | Phase::PermanentFailure(_))
    }
}

/// フェーズの実行結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// 集約結果を持って続行
    Continue(RecoveryResult),
    /// 致命的失敗
    Fail(FailureCause),
}

/// 永久無効化の原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// 1ウィンドウ内のフリーズ回数超過
    ExcessFailures(u32),
    /// 安定待ちの失敗
    SettleFailed(PlatformError),
    /// 状態取得が未サポート
    SettleUnsupported,
    /// リセット / 再構成の失敗
    ResetFailed(PlatformError),
    /// MMIO/DMA 解凍の失敗
    ThawFailed(PlatformError),
    /// ドライバが回復を断念
    DriverDisconnect,
    /// リセット後も回復しなかった
    NotRecovered(RecoveryResult),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::ExcessFailures(n) => write!(f, "failed {} times in the last hour", n),
            FailureCause::SettleFailed(e) => write!(f, "hardware did not settle: {}", e),
            FailureCause::SettleUnsupported => write!(f, "state query not supported"),
            FailureCause::ResetFailed(e) => write!(f, "reset failed: {}", e),
            FailureCause::ThawFailed(e) => write!(f, "unable to thaw I/O: {}", e),
            FailureCause::DriverDisconnect => write!(f, "device driver gave up"),
            FailureCause::NotRecovered(r) => write!(f, "not recovered ({})", r),
        }
    }
}

/// 集約結果から次に進むフェーズ
fn route(result: RecoveryResult) -> Phase {
    match result {
        RecoveryResult::CanRecover => Phase::Mmio,
        RecoveryResult::NeedReset => Phase::ForcedReset,
        RecoveryResult::Disconnect => Phase::PermanentFailure(FailureCause::DriverDisconnect),
        RecoveryResult::None | RecoveryResult::Recovered => Phase::Resume,
    }
}

/// 遷移関数 `(Phase, Step) → Phase`
pub fn transition(phase: Phase, step: Step) -> Phase {
    if phase.is_terminal() {
        return phase;
    }
    let result = match step {
        Step::Fail(cause) => return Phase::PermanentFailure(cause),
        Step::Continue(result) => result,
    };

    match phase {
        Phase::FreezeCheck => Phase::Announce,
        Phase::Announce => Phase::Settle,
        // ドライバの意見が全くない場合のみホットプラグリセット
        Phase::Settle if result == RecoveryResult::None => Phase::HotplugReset,
        Phase::Settle | Phase::HotplugReset => route(result),
        Phase::Mmio if result == RecoveryResult::CanRecover => Phase::Dma,
        Phase::Mmio | Phase::Dma => match result {
            RecoveryResult::CanRecover => Phase::Resume,
            other => route(other),
        },
        Phase::ForcedReset if result.allows_resume() => Phase::Resume,
        Phase::ForcedReset => Phase::PermanentFailure(FailureCause::NotRecovered(result)),
        Phase::Resume | Phase::PermanentFailure(_) => phase,
    }
}
