// ============================================================================
// src/eeh/pe.rs - Fault Domain (PE) Registry
// ============================================================================
//!
//! PE（Partitionable Endpoint）とその配下デバイスを管理するレジストリ。
//!
//! PEはコントローラごとのブリッジルートを頂点とする木構造をなし、
//! 状態フラグの設定・解除はサブツリー全体に伝播する。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::time::Duration;
use hashbrown::HashMap;

use super::handler::DriverBinding;
use super::types::{ChannelState, DeviceAddress, IrqMode, PeAddress};
use crate::error::{EehError, EehResult};

bitflags! {
    /// PE状態フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PeState: u32 {
        /// I/Oが隔離されている
        const ISOLATED = 1 << 0;
        /// 回復処理中
        const RECOVERING = 1 << 1;
        /// ブリッジ / コントローラが死んでいる
        const PHB_DEAD = 1 << 2;
        /// デタッチ / 再アタッチ中もブックキーピングを保持
        const KEEP = 1 << 3;
    }
}

/// PEの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeKind {
    /// コントローラ直下のブリッジルート
    Bridge,
    /// バス単位のPE
    Bus,
    /// デバイス単位のPE
    Device,
}

// ============================================================================
// ManagedDevice
// ============================================================================

/// PEに所属するデバイス
#[derive(Clone)]
pub struct ManagedDevice {
    pub addr: DeviceAddress,
    /// バインドされたドライバ（未バインドなら `None`）
    pub driver: Option<DriverBinding>,
    pub irq: IrqMode,
    /// 回復処理が割り込みを無効化したか
    pub io_disabled_by_recovery: bool,
    pub channel_state: ChannelState,
    /// KEEP中にバスから一時的に外されている
    pub detached: bool,
}

impl ManagedDevice {
    pub fn new(addr: DeviceAddress) -> Self {
        Self {
            addr,
            driver: None,
            irq: IrqMode::None,
            io_disabled_by_recovery: false,
            channel_state: ChannelState::Normal,
            detached: false,
        }
    }

    pub fn with_driver(mut self, driver: DriverBinding) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_irq(mut self, irq: IrqMode) -> Self {
        self.irq = irq;
        self
    }
}

impl core::fmt::Debug for ManagedDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManagedDevice")
            .field("addr", &self.addr)
            .field("driver", &self.driver.as_ref().map(|d| d.name))
            .field("irq", &self.irq)
            .field("io_disabled_by_recovery", &self.io_disabled_by_recovery)
            .field("channel_state", &self.channel_state)
            .field("detached", &self.detached)
            .finish()
    }
}

// ============================================================================
// FaultDomain
// ============================================================================

/// フォールトドメイン（PE）
#[derive(Debug)]
pub struct FaultDomain {
    pub addr: PeAddress,
    pub kind: PeKind,
    pub parent: Option<PeAddress>,
    /// 子PE（登録順）
    pub children: Vec<PeAddress>,
    pub state: PeState,
    /// 現在のウィンドウ内のフリーズ回数
    pub freeze_count: u32,
    /// ウィンドウ開始時刻
    pub last_freeze: Duration,
    /// 所属デバイス（登録順）
    pub devices: Vec<ManagedDevice>,
}

impl FaultDomain {
    pub fn new(addr: PeAddress, kind: PeKind, parent: Option<PeAddress>) -> Self {
        Self {
            addr,
            kind,
            parent,
            children: Vec::new(),
            state: PeState::empty(),
            freeze_count: 0,
            last_freeze: Duration::ZERO,
            devices: Vec::new(),
        }
    }

    /// フリーズ履歴を更新してカウントを1増やす
    ///
    /// ウィンドウを超えて経過していればカウントをリセットする。
    pub fn record_freeze(&mut self, now: Duration, window: Duration) -> u32 {
        if self.freeze_count == 0 {
            self.last_freeze = now;
        } else if now.saturating_sub(self.last_freeze) > window {
            self.last_freeze = now;
            self.freeze_count = 0;
        }
        self.freeze_count = self.freeze_count.saturating_add(1);
        self.freeze_count
    }

    pub fn is_isolated(&self) -> bool {
        self.state.contains(PeState::ISOLATED)
    }
}

// ============================================================================
// DomainRegistry
// ============================================================================

/// 全PEとデバイスのアリーナ
pub struct DomainRegistry {
    domains: BTreeMap<PeAddress, FaultDomain>,
    /// コントローラ番号 -> ブリッジルートPE
    bridges: BTreeMap<u16, PeAddress>,
    /// デバイス -> 所属PE
    device_index: HashMap<DeviceAddress, PeAddress>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            domains: BTreeMap::new(),
            bridges: BTreeMap::new(),
            device_index: HashMap::new(),
        }
    }

    /// コントローラのブリッジルートPEを登録
    pub fn add_bridge(&mut self, addr: PeAddress) -> EehResult<()> {
        if self.domains.contains_key(&addr) {
            return Err(EehError::DomainExists(addr));
        }
        if self.bridges.contains_key(&addr.controller) {
            return Err(EehError::BridgeExists(addr.controller));
        }
        self.bridges.insert(addr.controller, addr);
        self.domains
            .insert(addr, FaultDomain::new(addr, PeKind::Bridge, None));
        Ok(())
    }

    /// 親PEの下に子PEを登録
    pub fn add_domain(&mut self, addr: PeAddress, kind: PeKind, parent: PeAddress) -> EehResult<()> {
        if self.domains.contains_key(&addr) {
            return Err(EehError::DomainExists(addr));
        }
        let parent_pe = self
            .domains
            .get_mut(&parent)
            .ok_or(EehError::ParentNotFound(parent))?;
        parent_pe.children.push(addr);
        self.domains
            .insert(addr, FaultDomain::new(addr, kind, Some(parent)));
        Ok(())
    }

    /// PEにデバイスを追加
    pub fn add_device(&mut self, pe: PeAddress, device: ManagedDevice) -> EehResult<()> {
        if self.device_index.contains_key(&device.addr) {
            return Err(EehError::DeviceExists(device.addr));
        }
        let domain = self
            .domains
            .get_mut(&pe)
            .ok_or(EehError::DomainNotFound(pe))?;
        self.device_index.insert(device.addr, pe);
        domain.devices.push(device);
        Ok(())
    }

    pub fn get(&self, pe: PeAddress) -> Option<&FaultDomain> {
        self.domains.get(&pe)
    }

    pub fn get_mut(&mut self, pe: PeAddress) -> Option<&mut FaultDomain> {
        self.domains.get_mut(&pe)
    }

    /// コントローラのブリッジルートPE
    pub fn bridge_of(&self, controller: u16) -> Option<PeAddress> {
        self.bridges.get(&controller).copied()
    }

    /// 全ブリッジルートPE（コントローラ番号順）
    pub fn bridges(&self) -> impl Iterator<Item = PeAddress> + '_ {
        self.bridges.values().copied()
    }

    pub fn all_domains(&self) -> impl Iterator<Item = &FaultDomain> {
        self.domains.values()
    }

    pub fn count(&self) -> usize {
        self.domains.len()
    }

    /// デバイスの所属PE
    pub fn domain_of(&self, dev: DeviceAddress) -> Option<PeAddress> {
        self.device_index.get(&dev).copied()
    }

    pub fn device(&self, dev: DeviceAddress) -> Option<&ManagedDevice> {
        let pe = self.device_index.get(&dev)?;
        self.domains.get(pe)?.devices.iter().find(|d| d.addr == dev)
    }

    pub fn device_mut(&mut self, dev: DeviceAddress) -> Option<&mut ManagedDevice> {
        let pe = self.device_index.get(&dev)?;
        self.domains
            .get_mut(pe)?
            .devices
            .iter_mut()
            .find(|d| d.addr == dev)
    }

    /// PEとその子孫（深さ優先、登録順）
    pub fn subtree(&self, pe: PeAddress) -> Vec<PeAddress> {
        let mut out = Vec::new();
        let mut stack = alloc::vec![pe];
        while let Some(addr) = stack.pop() {
            let Some(domain) = self.domains.get(&addr) else {
                continue;
            };
            out.push(addr);
            stack.extend(domain.children.iter().rev().copied());
        }
        out
    }

    /// 親から根までの祖先PE（自身は含まない）
    pub fn ancestors(&self, pe: PeAddress) -> Vec<PeAddress> {
        let mut out = Vec::new();
        let mut cur = self.domains.get(&pe).and_then(|d| d.parent);
        while let Some(addr) = cur {
            out.push(addr);
            cur = self.domains.get(&addr).and_then(|d| d.parent);
        }
        out
    }

    /// サブツリー全体に状態フラグを設定
    pub fn mark_state(&mut self, pe: PeAddress, flags: PeState) {
        for addr in self.subtree(pe) {
            if let Some(domain) = self.domains.get_mut(&addr) {
                domain.state.insert(flags);
            }
        }
    }

    /// サブツリー全体から状態フラグを解除
    pub fn clear_state(&mut self, pe: PeAddress, flags: PeState) {
        for addr in self.subtree(pe) {
            if let Some(domain) = self.domains.get_mut(&addr) {
                domain.state.remove(flags);
            }
        }
    }

    /// サブツリー配下の全デバイス（トラバース順）
    pub fn subtree_devices(&self, pe: PeAddress) -> Vec<ManagedDevice> {
        self.subtree(pe)
            .into_iter()
            .filter_map(|addr| self.domains.get(&addr))
            .flat_map(|d| d.devices.iter().cloned())
            .collect()
    }

    /// デバイスのデタッチ状態を更新
    pub fn set_detached(&mut self, devs: &[DeviceAddress], detached: bool) {
        for dev in devs {
            if let Some(d) = self.device_mut(*dev) {
                d.detached = detached;
            }
        }
    }

    /// サブツリー配下のデバイスを取り除く
    ///
    /// `KEEP` が立っているPEのデバイスは `detached` として残す。
    pub fn drain_devices(&mut self, pe: PeAddress) -> Vec<DeviceAddress> {
        let mut removed = Vec::new();
        for addr in self.subtree(pe) {
            let Some(domain) = self.domains.get_mut(&addr) else {
                continue;
            };
            if domain.state.contains(PeState::KEEP) {
                for dev in domain.devices.iter_mut() {
                    dev.detached = true;
                }
                continue;
            }
            for dev in domain.devices.drain(..) {
                self.device_index.remove(&dev.addr);
                removed.push(dev.addr);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DomainRegistry {
        let mut reg = DomainRegistry::new();
        let phb = PeAddress::new(0, 0xff);
        reg.add_bridge(phb).unwrap();
        reg.add_domain(PeAddress::new(0, 1), PeKind::Bus, phb).unwrap();
        reg.add_domain(PeAddress::new(0, 2), PeKind::Device, PeAddress::new(0, 1))
            .unwrap();
        reg.add_domain(PeAddress::new(0, 3), PeKind::Bus, phb).unwrap();
        reg
    }

    #[test]
    fn test_subtree_order() {
        let reg = sample();
        let order = reg.subtree(PeAddress::new(0, 0xff));
        assert_eq!(
            order,
            alloc::vec![
                PeAddress::new(0, 0xff),
                PeAddress::new(0, 1),
                PeAddress::new(0, 2),
                PeAddress::new(0, 3),
            ]
        );
    }

    #[test]
    fn test_mark_and_clear_propagate() {
        let mut reg = sample();
        reg.mark_state(PeAddress::new(0, 1), PeState::ISOLATED | PeState::RECOVERING);
        assert!(reg.get(PeAddress::new(0, 2)).unwrap().is_isolated());
        assert!(!reg.get(PeAddress::new(0, 3)).unwrap().is_isolated());
        assert!(!reg.get(PeAddress::new(0, 0xff)).unwrap().is_isolated());

        reg.clear_state(PeAddress::new(0, 1), PeState::RECOVERING);
        let state = reg.get(PeAddress::new(0, 2)).unwrap().state;
        assert_eq!(state, PeState::ISOLATED);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = sample();
        assert_eq!(
            reg.add_bridge(PeAddress::new(0, 0x10)),
            Err(EehError::BridgeExists(0))
        );
        assert_eq!(
            reg.add_domain(PeAddress::new(1, 1), PeKind::Bus, PeAddress::new(1, 0)),
            Err(EehError::ParentNotFound(PeAddress::new(1, 0)))
        );
        let dev = DeviceAddress::new(0, 1, 0, 0);
        reg.add_device(PeAddress::new(0, 1), ManagedDevice::new(dev))
            .unwrap();
        assert_eq!(
            reg.add_device(PeAddress::new(0, 3), ManagedDevice::new(dev)),
            Err(EehError::DeviceExists(dev))
        );
        assert_eq!(reg.domain_of(dev), Some(PeAddress::new(0, 1)));
    }

    #[test]
    fn test_drain_respects_keep() {
        let mut reg = sample();
        let a = DeviceAddress::new(0, 1, 0, 0);
        let b = DeviceAddress::new(0, 3, 0, 0);
        reg.add_device(PeAddress::new(0, 1), ManagedDevice::new(a)).unwrap();
        reg.add_device(PeAddress::new(0, 3), ManagedDevice::new(b)).unwrap();

        reg.mark_state(PeAddress::new(0, 1), PeState::KEEP);
        let removed = reg.drain_devices(PeAddress::new(0, 0xff));
        assert_eq!(removed, alloc::vec![b]);
        assert!(reg.device(a).unwrap().detached);
        assert!(reg.device(b).is_none());
    }

    #[test]
    fn test_freeze_window() {
        let mut pe = FaultDomain::new(PeAddress::new(0, 1), PeKind::Bus, None);
        let hour = Duration::from_secs(3600);
        assert_eq!(pe.record_freeze(Duration::from_secs(10), hour), 1);
        assert_eq!(pe.record_freeze(Duration::from_secs(3610), hour), 2);
        // ウィンドウを超えたらリセット
        assert_eq!(pe.record_freeze(Duration::from_secs(3611), hour), 1);
        assert_eq!(pe.last_freeze, Duration::from_secs(3611));
    }

    #[test]
    fn test_freeze_count_saturates() {
        let mut pe = FaultDomain::new(PeAddress::new(0, 1), PeKind::Bus, None);
        pe.freeze_count = u32::MAX;
        pe.last_freeze = Duration::from_secs(10);
        let hour = Duration::from_secs(3600);
        assert_eq!(pe.record_freeze(Duration::from_secs(20), hour), u32::MAX);
    }

    #[test]
    fn test_ancestors() {
        let reg = sample();
        assert_eq!(
            reg.ancestors(PeAddress::new(0, 2)),
            alloc::vec![PeAddress::new(0, 1), PeAddress::new(0, 0xff)]
        );
        assert!(reg.ancestors(PeAddress::new(0, 0xff)).is_empty());
    }
}
