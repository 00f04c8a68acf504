//! EEHエラー型
//!
//! レジストリ操作のエラーと、プラットフォーム / バス再構成コラボレータが
//! 返すエラーを定義する。回復処理そのものはエラーを返さない
//! （結果は `RecoveryOutcome` で表現する）。

use core::fmt;

use crate::eeh::{DeviceAddress, PeAddress};

/// レジストリ（ブックキーピング）操作のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EehError {
    /// PEが見つからない
    DomainNotFound(PeAddress),
    /// PEが既に登録されている
    DomainExists(PeAddress),
    /// 親PEが見つからない
    ParentNotFound(PeAddress),
    /// 同じコントローラにブリッジルートが既に存在
    BridgeExists(u16),
    /// デバイスが見つからない
    DeviceNotFound(DeviceAddress),
    /// デバイスが既に登録されている
    DeviceExists(DeviceAddress),
}

/// プラットフォーム操作 / バス再構成のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// タイムアウト
    Timeout,
    /// サポートされていない
    NotSupported,
    /// ハードウェアがビジー
    Busy,
    /// ファームウェア / ハードウェアが返したエラーコード
    Hardware(i64),
}

pub type EehResult<T> = Result<T, EehError>;
pub type PlatformResult<T> = Result<T, PlatformError>;

// ===== Display implementations =====

impl fmt::Display for EehError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EehError::DomainNotFound(pe) => write!(f, "{} not found", pe),
            EehError::DomainExists(pe) => write!(f, "{} already registered", pe),
            EehError::ParentNotFound(pe) => write!(f, "parent {} not found", pe),
            EehError::BridgeExists(phb) => write!(f, "PHB#{} already has a bridge PE", phb),
            EehError::DeviceNotFound(dev) => write!(f, "device {} not found", dev),
            EehError::DeviceExists(dev) => write!(f, "device {} already registered", dev),
        }
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Timeout => write!(f, "timeout"),
            PlatformError::NotSupported => write!(f, "not supported"),
            PlatformError::Busy => write!(f, "busy"),
            PlatformError::Hardware(code) => write!(f, "hardware error {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EehError::DomainNotFound(PeAddress::new(1, 0x20));
        assert_eq!(format!("{}", err), "PHB#1-PE#20 not found");
        let err = EehError::BridgeExists(3);
        assert_eq!(format!("{}", err), "PHB#3 already has a bridge PE");
        assert_eq!(
            format!("{}", PlatformError::Hardware(-3)),
            "hardware error -3"
        );
    }

    #[test]
    fn test_device_error_display() {
        let dev = DeviceAddress::new(0, 2, 1, 0);
        assert_eq!(
            format!("{}", EehError::DeviceExists(dev)),
            "device 0000:02:01.0 already registered"
        );
    }
}
