// ============================================================================
// src/eeh/platform.rs - Platform Ops / Bus Reconfiguration / Clock
// ============================================================================
//!
//! 回復コアが消費する外部コラボレータのインターフェース。
//! ハードウェア固有の実装はプラットフォーム側が提供する。

use alloc::vec::Vec;
use bitflags::bitflags;
use core::time::Duration;

use super::types::{DeviceAddress, PeAddress};
use crate::error::PlatformResult;

bitflags! {
    /// `wait_until_settled` が返すPEのハードウェア状態
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SettleState: u32 {
        /// MMIOが有効
        const MMIO_ACTIVE = 1 << 0;
        /// DMAが有効
        const DMA_ACTIVE = 1 << 1;
        /// リセット中
        const RESET_ACTIVE = 1 << 2;
        /// 一時的に状態取得不可
        const UNAVAILABLE = 1 << 3;
        /// 状態取得がサポートされていない
        const NOT_SUPPORTED = 1 << 4;
    }
}

/// MMIO/DMA 解凍の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThawOutcome {
    /// 解凍成功
    Thawed,
    /// 解凍できず、完全リセットが必要
    NeedsReset,
}

/// 診断ログの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// 回復試行中の一時ログ
    Temporary,
    /// 永久障害時のログ
    Permanent,
}

/// プラットフォームが報告するファブリック全体の障害イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEvent {
    /// 保留中のイベントなし
    None,
    /// ファブリックコントローラ（IOC）全体が死んだ
    DeadFabric,
    /// コントローラのブリッジが死んだ
    DeadBridge(u16),
    /// ブリッジがフェンスされた
    Fenced(PeAddress),
    /// 単一PEがフリーズした
    Frozen(PeAddress),
}

/// ハードウェア固有のプリミティブ
pub trait PlatformOps: Send + Sync {
    /// PEのハードウェア状態が判読可能になるまで待つ
    fn wait_until_settled(&self, pe: PeAddress, timeout: Duration) -> PlatformResult<SettleState>;

    /// PEをリセットする
    fn reset_domain(&self, pe: PeAddress) -> PlatformResult<()>;

    /// リセット後にブリッジ構成を再設定する
    fn configure_bridge(&self, pe: PeAddress) -> PlatformResult<()>;

    /// アドレスデコーダ（BAR）を復元する
    fn restore_address_decoders(&self, pe: PeAddress) -> PlatformResult<()>;

    /// MMIOを解凍する
    fn enable_io(&self, pe: PeAddress) -> PlatformResult<ThawOutcome>;

    /// DMAを解凍する
    fn enable_dma(&self, pe: PeAddress) -> PlatformResult<ThawOutcome>;

    /// 次の障害イベントを取得する
    fn next_fault_event(&self) -> FaultEvent;

    /// 診断情報をスナップショットする
    fn capture_diagnostics(&self, pe: PeAddress, level: DiagnosticLevel) -> PlatformResult<()>;

    /// レガシー割り込みラインを無効化する
    fn disable_irq(&self, dev: DeviceAddress, line: u32);

    /// レガシー割り込みラインを有効化する
    fn enable_irq(&self, dev: DeviceAddress, line: u32);
}

/// デタッチ / アタッチの対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceScope {
    /// PE配下のバス上の全デバイス
    Bus(PeAddress),
    /// 指定デバイスのみ
    Devices(Vec<DeviceAddress>),
}

/// バスからのデバイス除去・再列挙を行うコラボレータ
pub trait BusReconfigure: Send + Sync {
    fn detach_devices(&self, scope: &DeviceScope) -> PlatformResult<()>;

    fn attach_devices(&self, scope: &DeviceScope) -> PlatformResult<()>;
}

/// 単調時計と遅延
pub trait Clock: Send + Sync {
    /// 起動からの経過時間
    fn now(&self) -> Duration;

    /// 指定時間ブロックする
    fn delay(&self, duration: Duration);
}
