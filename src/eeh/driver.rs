// ============================================================================
// src/eeh/driver.rs - Normal Recovery
// ============================================================================
//!
//! 1つのPEについて、ドライバ通知 → 安定待ち → リセット / 解凍 → 再開、
//! または永久無効化までを実行する。
//!
//! レジストリのロックはブックキーピングの間だけ保持し、
//! プラットフォーム操作・コラボレータ・ドライバコールバックは
//! ロックの外で呼び出す。

use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use log::{error, info, warn};

use super::handler::RecoveryHandler;
use super::pe::PeState;
use super::platform::{DeviceScope, DiagnosticLevel, SettleState, ThawOutcome};
use super::state_machine::{transition, FailureCause, Phase, Step};
use super::types::{ChannelState, DeviceAddress, PeAddress, RecoveryResult};
use super::{EehManager, RecoveryOutcome};
use crate::error::PlatformResult;

/// コールバック前の割り込み操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrqToggle {
    Keep,
    Disable,
    Enable,
}

impl EehManager {
    /// 通常回復の状態機械を終端まで回す
    pub(super) fn recover(&self, pe: PeAddress) -> RecoveryOutcome {
        let mut phase = Phase::FreezeCheck;
        let mut result = RecoveryResult::None;

        loop {
            let step = match phase {
                Phase::FreezeCheck => self.check_freeze_budget(pe),
                Phase::Announce => Step::Continue(self.announce(pe)),
                Phase::Settle => self.settle(pe, result),
                Phase::HotplugReset => {
                    info!("EEH: {}: reset with hotplug activity", pe);
                    match self.reset_device(pe, true) {
                        Ok(()) => Step::Continue(result),
                        Err(e) => Step::Fail(FailureCause::ResetFailed(e)),
                    }
                }
                Phase::Mmio => self.thaw_mmio(pe, result),
                Phase::Dma => self.thaw_dma(pe),
                Phase::ForcedReset => self.forced_reset(pe),
                Phase::Resume => {
                    self.resume(pe);
                    return RecoveryOutcome::Recovered;
                }
                Phase::PermanentFailure(cause) => {
                    self.fail_domain(pe, cause);
                    return RecoveryOutcome::Disabled(cause);
                }
            };

            if let Step::Continue(merged) = step {
                result = merged;
            }
            phase = transition(phase, step);
        }
    }

    // ========================================================================
    // フェーズ
    // ========================================================================

    fn check_freeze_budget(&self, pe: PeAddress) -> Step {
        let now = self.clock.now();
        let window = self.config.freeze_window;
        let count = self
            .serialized(|reg| reg.get_mut(pe).map(|d| d.record_freeze(now, window)))
            .unwrap_or(0);

        if count > self.config.max_freezes {
            return Step::Fail(FailureCause::ExcessFailures(count));
        }
        warn!("EEH: {}: this domain has failed {} times in the last hour", pe, count);
        Step::Continue(RecoveryResult::None)
    }

    fn announce(&self, pe: PeAddress) -> RecoveryResult {
        info!("EEH: {}: notify device drivers to shutdown", pe);
        self.traverse(
            pe,
            RecoveryResult::None,
            Some(ChannelState::Frozen),
            IrqToggle::Disable,
            |h, dev| h.error_detected(dev, ChannelState::Frozen),
        )
    }

    fn settle(&self, pe: PeAddress, result: RecoveryResult) -> Step {
        let state = match self
            .platform
            .wait_until_settled(pe, self.config.settle_timeout)
        {
            Ok(state) => state,
            Err(e) => {
                warn!("EEH: {}: permanent failure, hardware did not settle ({})", pe, e);
                return Step::Fail(FailureCause::SettleFailed(e));
            }
        };
        if state.contains(SettleState::NOT_SUPPORTED) {
            warn!("EEH: {}: permanent failure, state query not supported", pe);
            return Step::Fail(FailureCause::SettleUnsupported);
        }

        // ドライバへの通知が済んでから診断ログを取る
        info!("EEH: {}: collect temporary log", pe);
        if let Err(e) = self
            .platform
            .capture_diagnostics(pe, DiagnosticLevel::Temporary)
        {
            warn!("EEH: {}: unable to collect temporary log ({})", pe, e);
        }
        Step::Continue(result)
    }

    fn thaw_mmio(&self, pe: PeAddress, result: RecoveryResult) -> Step {
        info!("EEH: {}: enable I/O for affected devices", pe);
        match self.platform.enable_io(pe) {
            Err(e) => Step::Fail(FailureCause::ThawFailed(e)),
            Ok(ThawOutcome::NeedsReset) => Step::Continue(RecoveryResult::NeedReset),
            Ok(ThawOutcome::Thawed) => {
                info!("EEH: {}: notify device drivers to resume I/O", pe);
                Step::Continue(self.traverse(pe, result, None, IrqToggle::Keep, |h, dev| {
                    h.mmio_enabled(dev)
                }))
            }
        }
    }

    fn thaw_dma(&self, pe: PeAddress) -> Step {
        info!("EEH: {}: enable DMA for affected devices", pe);
        match self.platform.enable_dma(pe) {
            Err(e) => Step::Fail(FailureCause::ThawFailed(e)),
            Ok(ThawOutcome::NeedsReset) => Step::Continue(RecoveryResult::NeedReset),
            Ok(ThawOutcome::Thawed) => {
                // リセットしていないのでPEはまだ隔離状態のまま
                self.serialized(|reg| reg.clear_state(pe, PeState::ISOLATED));
                Step::Continue(RecoveryResult::Recovered)
            }
        }
    }

    fn forced_reset(&self, pe: PeAddress) -> Step {
        info!("EEH: {}: reset without hotplug activity", pe);
        if let Err(e) = self.reset_device(pe, false) {
            warn!("EEH: {}: cannot reset, err={}", pe, e);
            return Step::Fail(FailureCause::ResetFailed(e));
        }

        info!("EEH: {}: notify device drivers of reset completion", pe);
        Step::Continue(self.traverse(
            pe,
            RecoveryResult::None,
            Some(ChannelState::Normal),
            IrqToggle::Enable,
            |h, dev| h.slot_reset(dev),
        ))
    }

    fn resume(&self, pe: PeAddress) {
        info!("EEH: {}: notify device drivers to resume", pe);
        self.traverse(
            pe,
            RecoveryResult::None,
            Some(ChannelState::Normal),
            IrqToggle::Enable,
            |h, dev| {
                h.resume(dev);
                RecoveryResult::None
            },
        );
        self.serialized(|reg| reg.clear_state(pe, PeState::ISOLATED));
        self.stats.recovered.fetch_add(1, Ordering::Relaxed);
        info!("EEH: {}: recovery successful", pe);
    }

    fn fail_domain(&self, pe: PeAddress, cause: FailureCause) {
        match cause {
            FailureCause::ExcessFailures(count) => error!(
                "EEH: {} has failed {} times in the last hour and has been permanently disabled. \
                 Please try reseating or replacing it.",
                pe, count
            ),
            other => error!(
                "EEH: unable to recover from failure of {} ({}). \
                 Please try reseating or replacing it.",
                pe, other
            ),
        }
        if let Err(e) = self
            .platform
            .capture_diagnostics(pe, DiagnosticLevel::Permanent)
        {
            error!("EEH: {}: unable to collect permanent log ({})", pe, e);
        }

        self.teardown(pe);
        self.stats.disabled.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // 共通処理
    // ========================================================================

    /// 全デバイスに `permanent_failure` を通知し、バスから恒久的に外す
    pub(super) fn teardown(&self, pe: PeAddress) {
        self.traverse(
            pe,
            RecoveryResult::None,
            Some(ChannelState::PermanentFailure),
            IrqToggle::Disable,
            |h, dev| {
                h.permanent_failure(dev);
                RecoveryResult::None
            },
        );

        self.serialized(|reg| reg.clear_state(pe, PeState::KEEP));
        if let Err(e) = self.bus.detach_devices(&DeviceScope::Bus(pe)) {
            error!("EEH: {}: failed to detach devices ({})", pe, e);
        }
        let removed = self.serialized(|reg| reg.drain_devices(pe));
        info!("EEH: {}: {} devices removed", pe, removed.len());
    }

    /// PEをリセットしてブリッジとデコーダを復元する
    ///
    /// `hotplug` の場合はPE配下のバスを丸ごとデタッチし、
    /// 設定された待ち時間の後に再アタッチする。
    fn reset_device(&self, pe: PeAddress, hotplug: bool) -> PlatformResult<()> {
        let detached = if hotplug {
            Some(self.detach_bus(pe)?)
        } else {
            None
        };

        if let Err(e) = self.reset_and_restore(pe) {
            self.serialized(|reg| reg.clear_state(pe, PeState::KEEP));
            return Err(e);
        }

        let Some(devs) = detached else {
            return Ok(());
        };

        // ホットプラグのシャットダウンスクリプトが終わるのを待つ
        self.clock.delay(self.config.hotplug_settle_delay);

        self.serialized(|reg| reg.clear_state(pe, PeState::KEEP));
        if !devs.is_empty() {
            self.bus.attach_devices(&DeviceScope::Bus(pe))?;
        }
        self.serialized(|reg| reg.set_detached(&devs, false));
        Ok(())
    }

    /// KEEPを立て、PE配下の全デバイスをバスから外す
    fn detach_bus(&self, pe: PeAddress) -> PlatformResult<Vec<DeviceAddress>> {
        let devs: Vec<DeviceAddress> = self.serialized(|reg| {
            reg.mark_state(pe, PeState::KEEP);
            reg.subtree_devices(pe).iter().map(|d| d.addr).collect()
        });

        if !devs.is_empty() {
            if let Err(e) = self.bus.detach_devices(&DeviceScope::Bus(pe)) {
                self.serialized(|reg| reg.clear_state(pe, PeState::KEEP));
                return Err(e);
            }
        }
        self.serialized(|reg| reg.set_detached(&devs, true));
        Ok(devs)
    }

    fn reset_and_restore(&self, pe: PeAddress) -> PlatformResult<()> {
        self.platform.reset_domain(pe)?;
        self.platform.configure_bridge(pe)?;
        self.platform.restore_address_decoders(pe)?;
        self.serialized(|reg| reg.clear_state(pe, PeState::ISOLATED));
        Ok(())
    }

    /// サブツリーの全デバイスに登録順でコールバックし、応答を集約する
    fn traverse<F>(
        &self,
        pe: PeAddress,
        start: RecoveryResult,
        state: Option<ChannelState>,
        irq: IrqToggle,
        callback: F,
    ) -> RecoveryResult
    where
        F: Fn(&dyn RecoveryHandler, DeviceAddress) -> RecoveryResult,
    {
        let devices = self.serialized(|reg| reg.subtree_devices(pe));
        let mut result = start;

        for dev in devices.iter().filter(|d| !d.detached) {
            if let Some(state) = state {
                self.serialized(|reg| {
                    if let Some(d) = reg.device_mut(dev.addr) {
                        d.channel_state = state;
                    }
                });
            }
            let Some(driver) = &dev.driver else {
                continue;
            };
            match irq {
                IrqToggle::Keep => {}
                IrqToggle::Disable => self.disable_irq(dev.addr),
                IrqToggle::Enable => self.enable_irq(dev.addr),
            }
            let Some(handler) = &driver.handler else {
                continue;
            };

            let rc = callback(handler.as_ref(), dev.addr);
            #[cfg(feature = "verbose_logging")]
            log::trace!("EEH: {}: driver {} on {} answered {}", pe, driver.name, dev.addr, rc);
            result = result.merge(rc);
        }
        result
    }

    /// 回復処理としてレガシー割り込みを無効化する（二重無効化はしない）
    fn disable_irq(&self, dev: DeviceAddress) {
        let line = self.serialized(|reg| {
            let d = reg.device_mut(dev)?;
            let line = d.irq.maskable_line()?;
            if d.io_disabled_by_recovery {
                return None;
            }
            d.io_disabled_by_recovery = true;
            Some(line)
        });
        if let Some(line) = line {
            self.platform.disable_irq(dev, line);
        }
    }

    /// 回復処理が無効化した割り込みだけを再有効化する
    fn enable_irq(&self, dev: DeviceAddress) {
        let line = self.serialized(|reg| {
            let d = reg.device_mut(dev)?;
            if !d.io_disabled_by_recovery {
                return None;
            }
            d.io_disabled_by_recovery = false;
            d.irq.maskable_line()
        });
        if let Some(line) = line {
            self.platform.enable_irq(dev, line);
        }
    }
}
