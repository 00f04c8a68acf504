// ============================================================================
// src/eeh/types.rs - EEH Type Definitions
// ============================================================================
//!
//! PE / デバイスの識別子、ドライバ応答（`RecoveryResult`）とその集約規則。

use core::cmp::Ordering;
use core::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// PE（フォールトドメイン）のプラットフォームアドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeAddress {
    /// ファブリック / PHB コントローラ番号
    pub controller: u16,
    /// コントローラ内のPE番号
    pub pe_number: u32,
}

impl PeAddress {
    pub const fn new(controller: u16, pe_number: u32) -> Self {
        Self {
            controller,
            pe_number,
        }
    }
}

impl fmt::Display for PeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PHB#{}-PE#{:x}", self.controller, self.pe_number)
    }
}

/// デバイスのバスアドレス (Segment/Bus/Device/Function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl DeviceAddress {
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment,
            bus,
            device: device & 0x1F,
            function: function & 0x07,
        }
    }

    /// Routing ID (bus << 8 | devfn)
    pub const fn rid(&self) -> u16 {
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

// ============================================================================
// Device state
// ============================================================================

/// デバイスのI/Oチャネル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// 通常動作
    #[default]
    Normal,
    /// フリーズ中（MMIO/DMAがブロックされている）
    Frozen,
    /// 永久障害
    PermanentFailure,
}

/// デバイスの割り込み方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqMode {
    /// 割り込みなし
    #[default]
    None,
    /// レガシー INTx ライン
    Legacy {
        line: u32,
        /// ハンドラが登録済みか
        has_action: bool,
    },
    /// MSI（フリーズにより暗黙にマスクされる）
    Msi,
    /// MSI-X（フリーズにより暗黙にマスクされる）
    MsiX,
}

impl IrqMode {
    /// 回復処理で明示的に無効化すべき割り込みライン
    pub const fn maskable_line(&self) -> Option<u32> {
        match *self {
            IrqMode::Legacy {
                line,
                has_action: true,
            } => Some(line),
            _ => None,
        }
    }
}

// ============================================================================
// RecoveryResult
// ============================================================================

/// ドライバの回復応答
///
/// 重大度: `None < Recovered ≈ CanRecover < NeedReset < Disconnect`。
/// `Recovered` と `CanRecover` は互いに比較不能。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryResult {
    /// 意見なし
    #[default]
    None,
    /// 回復済み
    Recovered,
    /// I/O再開で回復可能
    CanRecover,
    /// スロットリセットが必要
    NeedReset,
    /// 回復不能
    Disconnect,
}

impl RecoveryResult {
    const fn severity(self) -> u8 {
        match self {
            RecoveryResult::None => 0,
            RecoveryResult::Recovered | RecoveryResult::CanRecover => 1,
            RecoveryResult::NeedReset => 2,
            RecoveryResult::Disconnect => 3,
        }
    }

    /// 2つの応答を集約する
    ///
    /// 同じ重大度では先着の非`None`応答が勝ち、厳密に重大な応答は常に上書きする。
    pub fn merge(self, next: RecoveryResult) -> RecoveryResult {
        match self.partial_cmp(&next) {
            Some(Ordering::Less) => next,
            _ => self,
        }
    }

    /// デバイス順の応答列を畳み込む
    pub fn merge_all<I>(start: RecoveryResult, results: I) -> RecoveryResult
    where
        I: IntoIterator<Item = RecoveryResult>,
    {
        results.into_iter().fold(start, RecoveryResult::merge)
    }

    /// リセットなしで回復を続行できる応答か
    pub const fn allows_resume(self) -> bool {
        matches!(self, RecoveryResult::None | RecoveryResult::Recovered)
    }
}

impl PartialOrd for RecoveryResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match self.severity().cmp(&other.severity()) {
            Ordering::Equal => None,
            ord => Some(ord),
        }
    }
}

impl fmt::Display for RecoveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryResult::None => "none",
            RecoveryResult::Recovered => "recovered",
            RecoveryResult::CanRecover => "can recover",
            RecoveryResult::NeedReset => "need reset",
            RecoveryResult::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}
