// ============================================================================
// src/lib.rs - PCI EEH (Enhanced Error Handling) recovery core
// ============================================================================
//!
//! PCIフォールトドメイン（PE）の障害回復オーケストレータ。
//!
//! プラットフォームがPEをフリーズした後、以下を調停する:
//! - 接続されたドライバへの固定順コールバック通知
//! - ハードウェアリセット / ブリッジ再構成
//! - ドライバ応答の集約による再開・リセット・永久無効化の判定
//! - 繰り返し障害の履歴管理（1時間あたりのフリーズ回数）

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod eeh;
pub mod error;

pub use eeh::{
    BusReconfigure, ChannelState, Clock, DeviceAddress, DeviceScope, DiagnosticLevel,
    DomainRegistry, DriverBinding, EehConfig, EehManager, EehStats, FailureCause, FaultDomain,
    FaultEvent, IrqMode, ManagedDevice, PeAddress, PeKind, PeState, PlatformOps,
    RecoveryHandler, RecoveryOutcome, RecoveryResult, SettleState, SkipReason, ThawOutcome,
};
pub use error::{EehError, EehResult, PlatformError, PlatformResult};
