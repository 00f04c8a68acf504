// ============================================================================
// src/eeh/special.rs - Special Event Dispatcher
// ============================================================================
//!
//! PE指定のない障害報告を処理する。プラットフォームに次のイベントを
//! 問い合わせ、重大度に応じて通常回復か撤去へ振り分ける。

use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use log::{error, info, warn};

use super::event::PurgeScope;
use super::pe::PeState;
use super::platform::FaultEvent;
use super::types::PeAddress;
use super::{begin_recovery, EehManager, RecoveryOutcome};

impl EehManager {
    /// プラットフォームの保留イベントがなくなるまで処理する
    pub(super) fn handle_special_event(&self) -> Vec<(PeAddress, RecoveryOutcome)> {
        let mut outcomes = Vec::new();

        loop {
            let event = self.platform.next_fault_event();
            match event {
                FaultEvent::None => break,
                FaultEvent::DeadFabric => {
                    error!("EEH: fabric controller is dead, isolating every PHB");
                    self.serialized(|reg| {
                        self.events.purge(PurgeScope::All);
                        let bridges: Vec<PeAddress> = reg.bridges().collect();
                        for bridge in bridges {
                            reg.mark_state(bridge, PeState::ISOLATED | PeState::PHB_DEAD);
                        }
                    });
                    outcomes.extend(self.remove_dead_bridges());
                    // 全PHBが撤去済み
                    break;
                }
                FaultEvent::DeadBridge(phb) => {
                    let bridge = self.serialized(|reg| {
                        let bridge = reg.bridge_of(phb)?;
                        self.events.purge(PurgeScope::Controller(phb));
                        reg.mark_state(bridge, PeState::ISOLATED | PeState::PHB_DEAD);
                        Some(bridge)
                    });
                    match bridge {
                        Some(bridge) => error!("EEH: {} is dead", bridge),
                        None => {
                            warn!("EEH: dead PHB#{} is not registered", phb);
                            continue;
                        }
                    }
                    outcomes.extend(self.remove_dead_bridges());
                }
                FaultEvent::Fenced(pe) | FaultEvent::Frozen(pe) => {
                    let scope = match event {
                        FaultEvent::Fenced(_) => PurgeScope::Controller(pe.controller),
                        _ => PurgeScope::Domain(pe),
                    };
                    let begin = self.serialized(|reg| {
                        self.events.purge(scope);
                        begin_recovery(reg, pe)
                    });
                    let outcome = match begin {
                        Ok(()) => self.run_recovery(pe),
                        Err(reason) => {
                            warn!("EEH: {}: special event ignored ({:?})", pe, reason);
                            RecoveryOutcome::Skipped(reason)
                        }
                    };
                    outcomes.push((pe, outcome));
                }
            }
        }
        outcomes
    }

    /// `PHB_DEAD` のブリッジ配下を回復なしで撤去する
    fn remove_dead_bridges(&self) -> Vec<(PeAddress, RecoveryOutcome)> {
        let dead: Vec<PeAddress> = self.serialized(|reg| {
            let bridges: Vec<PeAddress> = reg.bridges().collect();
            bridges
                .into_iter()
                .filter(|&b| {
                    reg.get(b)
                        .is_some_and(|d| d.state.contains(PeState::PHB_DEAD))
                        && !reg.subtree_devices(b).is_empty()
                })
                .collect()
        });

        dead.into_iter()
            .map(|bridge| {
                info!("EEH: {}: removing devices of dead PHB", bridge);
                self.teardown(bridge);
                self.stats.torn_down.fetch_add(1, Ordering::Relaxed);
                (bridge, RecoveryOutcome::TornDown)
            })
            .collect()
    }
}
