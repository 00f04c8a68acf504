//! PCI EEH (Enhanced Error Handling)
//!
//! フリーズしたPEの回復を調停する。
//! - PEレジストリ（グローバルシリアライズロックで保護）
//! - ドライバ回復コールバックの通知と応答の集約
//! - リセット / ホットプラグ再列挙 / 永久無効化の判定
//! - ファブリック全体の特殊イベント（デッドIOC / デッドPHB / フェンス）の振り分け

mod driver;
pub mod event;
pub mod handler;
pub mod pe;
pub mod platform;
mod special;
pub mod state_machine;
pub mod types;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use spin::Mutex;

pub use event::{EventQueue, PurgeScope};
pub use handler::{DriverBinding, RecoveryHandler};
pub use pe::{DomainRegistry, FaultDomain, ManagedDevice, PeKind, PeState};
pub use platform::{
    BusReconfigure, Clock, DeviceScope, DiagnosticLevel, FaultEvent, PlatformOps, SettleState,
    ThawOutcome,
};
pub use state_machine::{FailureCause, Phase, Step};
pub use types::{ChannelState, DeviceAddress, IrqMode, PeAddress, RecoveryResult};

use crate::error::{EehError, EehResult};

// =============================================================================
// 定数
// =============================================================================

/// 1ウィンドウあたりのフリーズ許容回数
pub const DEFAULT_MAX_FREEZES: u32 = 5;

/// フリーズ回数を数えるウィンドウ（秒）
pub const DEFAULT_FREEZE_WINDOW_SECS: u64 = 3600;

/// ハードウェア安定待ちの上限（秒）
pub const DEFAULT_SETTLE_TIMEOUT_SECS: u64 = 150;

/// ホットプラグ・デタッチ後、再アタッチまでの待ち時間（秒）
pub const DEFAULT_HOTPLUG_SETTLE_SECS: u64 = 5;

// =============================================================================
// 設定
// =============================================================================

/// 回復処理の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EehConfig {
    /// `freeze_window` 内でこの回数を超えたら永久無効化
    pub max_freezes: u32,
    pub freeze_window: Duration,
    pub settle_timeout: Duration,
    /// ユーザー空間のホットプラグスクリプトを待つ時間
    pub hotplug_settle_delay: Duration,
}

impl EehConfig {
    pub const fn new() -> Self {
        Self {
            max_freezes: DEFAULT_MAX_FREEZES,
            freeze_window: Duration::from_secs(DEFAULT_FREEZE_WINDOW_SECS),
            settle_timeout: Duration::from_secs(DEFAULT_SETTLE_TIMEOUT_SECS),
            hotplug_settle_delay: Duration::from_secs(DEFAULT_HOTPLUG_SETTLE_SECS),
        }
    }

    pub const fn with_max_freezes(mut self, max_freezes: u32) -> Self {
        self.max_freezes = max_freezes;
        self
    }

    pub const fn with_freeze_window(mut self, window: Duration) -> Self {
        self.freeze_window = window;
        self
    }

    pub const fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub const fn with_hotplug_settle_delay(mut self, delay: Duration) -> Self {
        self.hotplug_settle_delay = delay;
        self
    }
}

impl Default for EehConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// 統計と結果
// =============================================================================

/// 回復処理の統計
#[derive(Debug, Default)]
pub struct EehStats {
    recovered: AtomicU32,
    disabled: AtomicU32,
    torn_down: AtomicU32,
}

impl EehStats {
    pub const fn new() -> Self {
        Self {
            recovered: AtomicU32::new(0),
            disabled: AtomicU32::new(0),
            torn_down: AtomicU32::new(0),
        }
    }

    /// 回復に成功したPE数
    pub fn recovered(&self) -> u32 {
        self.recovered.load(Ordering::Relaxed)
    }

    /// 永久無効化されたPE数
    pub fn disabled(&self) -> u32 {
        self.disabled.load(Ordering::Relaxed)
    }

    /// デッドPHB / IOCとして撤去されたブリッジ数
    pub fn torn_down(&self) -> u32 {
        self.torn_down.load(Ordering::Relaxed)
    }
}

/// 回復をスキップした理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 未登録のPE
    UnknownDomain,
    /// 他のワーカが回復中
    AlreadyRecovering,
    /// PHBが死んでいる
    BridgeDead,
}

/// 1つのPEに対する障害報告の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 回復して通常動作に戻った
    Recovered,
    /// 永久無効化された
    Disabled(FailureCause),
    /// デッドPHB / IOCとして撤去された
    TornDown,
    /// 処理しなかった
    Skipped(SkipReason),
}

// =============================================================================
// EEHマネージャ
// =============================================================================

/// 回復オーケストレータ
pub struct EehManager {
    /// PEレジストリ。このロックがグローバルシリアライズを兼ねる
    registry: Mutex<DomainRegistry>,
    events: EventQueue,
    platform: Arc<dyn PlatformOps>,
    bus: Arc<dyn BusReconfigure>,
    clock: Arc<dyn Clock>,
    config: EehConfig,
    stats: EehStats,
}

impl EehManager {
    pub fn new(
        platform: Arc<dyn PlatformOps>,
        bus: Arc<dyn BusReconfigure>,
        clock: Arc<dyn Clock>,
        config: EehConfig,
    ) -> Self {
        Self {
            registry: Mutex::new(DomainRegistry::new()),
            events: EventQueue::new(),
            platform,
            bus,
            clock,
            config,
            stats: EehStats::new(),
        }
    }

    /// ロックを取ってレジストリを操作する（プラットフォーム呼び出しは中で行わない）
    fn serialized<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut DomainRegistry) -> R,
    {
        let mut registry = self.registry.lock();
        f(&mut registry)
    }

    // ========================================================================
    // 登録
    // ========================================================================

    /// コントローラのブリッジルートPEを登録
    pub fn add_bridge(&self, addr: PeAddress) -> EehResult<()> {
        self.serialized(|reg| reg.add_bridge(addr))
    }

    /// 子PEを登録
    pub fn add_domain(&self, addr: PeAddress, kind: PeKind, parent: PeAddress) -> EehResult<()> {
        self.serialized(|reg| reg.add_domain(addr, kind, parent))
    }

    /// PEにデバイスを追加
    pub fn add_device(&self, pe: PeAddress, device: ManagedDevice) -> EehResult<()> {
        self.serialized(|reg| reg.add_device(pe, device))
    }

    // ========================================================================
    // 参照
    // ========================================================================

    /// PEを読み取る
    pub fn get_domain<F, R>(&self, pe: PeAddress, f: F) -> Option<R>
    where
        F: FnOnce(&FaultDomain) -> R,
    {
        self.serialized(|reg| reg.get(pe).map(f))
    }

    /// PEを更新する
    pub fn update_domain<F, R>(&self, pe: PeAddress, f: F) -> EehResult<R>
    where
        F: FnOnce(&mut FaultDomain) -> R,
    {
        self.serialized(|reg| reg.get_mut(pe).map(f))
            .ok_or(EehError::DomainNotFound(pe))
    }

    /// レジストリ全体を読み取る
    pub fn with_registry<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&DomainRegistry) -> R,
    {
        self.serialized(|reg| f(reg))
    }

    pub fn pe_state(&self, pe: PeAddress) -> Option<PeState> {
        self.get_domain(pe, |d| d.state)
    }

    pub fn freeze_count(&self, pe: PeAddress) -> Option<u32> {
        self.get_domain(pe, |d| d.freeze_count)
    }

    pub fn device_count(&self, pe: PeAddress) -> Option<usize> {
        self.get_domain(pe, |d| d.devices.len())
    }

    pub fn config(&self) -> &EehConfig {
        &self.config
    }

    pub fn stats(&self) -> &EehStats {
        &self.stats
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    // ========================================================================
    // 障害報告
    // ========================================================================

    /// 障害報告をキューに積む
    ///
    /// PE宛ての報告はその時点でPEを隔離済みとしてマークする。
    pub fn queue_failure(&self, target: Option<PeAddress>) {
        if let Some(pe) = target {
            self.serialized(|reg| reg.mark_state(pe, PeState::ISOLATED));
        }
        self.events.push(target);
    }

    /// キューが空になるまで障害報告を処理する
    pub fn run_queued(&self) -> Vec<(PeAddress, RecoveryOutcome)> {
        let mut outcomes = Vec::new();
        while let Some(target) = self.events.pop() {
            outcomes.extend(self.handle_fault_report(target));
        }
        outcomes
    }

    /// 障害報告を処理する
    ///
    /// `None` はファブリック全体の特殊イベントとして扱い、
    /// PE指定の場合はそのPEの通常回復を直接実行する。
    pub fn handle_fault_report(&self, target: Option<PeAddress>) -> Vec<(PeAddress, RecoveryOutcome)> {
        let Some(pe) = target else {
            return self.handle_special_event();
        };

        let outcome = match self.serialized(|reg| begin_recovery(reg, pe)) {
            Ok(()) => self.run_recovery(pe),
            Err(reason) => {
                log::warn!("EEH: {}: fault report ignored ({:?})", pe, reason);
                RecoveryOutcome::Skipped(reason)
            }
        };
        vec![(pe, outcome)]
    }

    /// 通常回復を実行し、終了後に `RECOVERING` を解除する
    fn run_recovery(&self, pe: PeAddress) -> RecoveryOutcome {
        let outcome = self.recover(pe);
        self.serialized(|reg| reg.clear_state(pe, PeState::RECOVERING));
        outcome
    }
}

/// PEを `ISOLATED | RECOVERING` にする（ロック保持中に呼ぶ）
fn begin_recovery(reg: &mut DomainRegistry, pe: PeAddress) -> Result<(), SkipReason> {
    let state = reg.get(pe).ok_or(SkipReason::UnknownDomain)?.state;
    if state.contains(PeState::PHB_DEAD) {
        return Err(SkipReason::BridgeDead);
    }
    // 祖先・子孫のどこかで回復中なら、同じデバイスを二重に扱うことになる
    let busy = reg
        .subtree(pe)
        .into_iter()
        .chain(reg.ancestors(pe))
        .filter_map(|addr| reg.get(addr))
        .any(|d| d.state.contains(PeState::RECOVERING));
    if busy {
        return Err(SkipReason::AlreadyRecovering);
    }
    reg.mark_state(pe, PeState::ISOLATED | PeState::RECOVERING);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EehConfig::default();
        assert_eq!(config.max_freezes, 5);
        assert_eq!(config.freeze_window, Duration::from_secs(3600));
        assert_eq!(config.settle_timeout, Duration::from_secs(150));
        assert_eq!(config.hotplug_settle_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builders() {
        let config = EehConfig::new()
            .with_max_freezes(2)
            .with_hotplug_settle_delay(Duration::ZERO);
        assert_eq!(config.max_freezes, 2);
        assert_eq!(config.hotplug_settle_delay, Duration::ZERO);
        assert_eq!(config.settle_timeout, Duration::from_secs(150));
    }

    #[test]
    fn test_begin_recovery_guards() {
        let mut reg = DomainRegistry::new();
        let phb = PeAddress::new(0, 0);
        let pe = PeAddress::new(0, 1);
        reg.add_bridge(phb).unwrap();
        reg.add_domain(pe, PeKind::Bus, phb).unwrap();

        assert_eq!(
            begin_recovery(&mut reg, PeAddress::new(3, 3)),
            Err(SkipReason::UnknownDomain)
        );
        assert_eq!(begin_recovery(&mut reg, pe), Ok(()));
        assert_eq!(
            reg.get(pe).unwrap().state,
            PeState::ISOLATED | PeState::RECOVERING
        );
        assert_eq!(
            begin_recovery(&mut reg, pe),
            Err(SkipReason::AlreadyRecovering)
        );

        reg.mark_state(phb, PeState::PHB_DEAD);
        assert_eq!(begin_recovery(&mut reg, phb), Err(SkipReason::BridgeDead));
    }

    #[test]
    fn test_begin_recovery_rejects_nested_domains() {
        let mut reg = DomainRegistry::new();
        let phb = PeAddress::new(0, 0);
        let parent = PeAddress::new(0, 1);
        let child = PeAddress::new(0, 2);
        let sibling = PeAddress::new(0, 3);
        reg.add_bridge(phb).unwrap();
        reg.add_domain(parent, PeKind::Bus, phb).unwrap();
        reg.add_domain(child, PeKind::Device, parent).unwrap();
        reg.add_domain(sibling, PeKind::Bus, phb).unwrap();

        assert_eq!(begin_recovery(&mut reg, child), Ok(()));
        // 子が回復中の間は親もブリッジも始められない
        assert_eq!(
            begin_recovery(&mut reg, parent),
            Err(SkipReason::AlreadyRecovering)
        );
        assert_eq!(
            begin_recovery(&mut reg, phb),
            Err(SkipReason::AlreadyRecovering)
        );
        assert!(!reg.get(parent).unwrap().state.contains(PeState::RECOVERING));
        assert_eq!(begin_recovery(&mut reg, sibling), Ok(()));

        reg.clear_state(child, PeState::RECOVERING);
        assert_eq!(begin_recovery(&mut reg, parent), Ok(()));
        assert_eq!(
            begin_recovery(&mut reg, child),
            Err(SkipReason::AlreadyRecovering)
        );
    }
}
