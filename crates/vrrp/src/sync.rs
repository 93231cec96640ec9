//! Sync-Group Coordinator (spec §4.2, §9).
//!
//! Grounded directly on `vrrp_sync.c`'s `vrrp_sync_set_group` /
//! `vrrp_sync_can_goto_master` / `vrrp_sync_backup` / `vrrp_sync_master` /
//! `vrrp_sync_fault`, renamed to this crate's convention. The three
//! behaviors spec §9 calls out as open questions are preserved exactly as
//! the original implements them:
//!
//! 1. the owner fast-path (`wantstate == Master && base_priority == OWNER`)
//!    is only consulted when *resolving* group state at startup, never
//!    taken as a shortcut during `can_goto_master`;
//! 2. a sync group with a single member only logs a warning, it still runs;
//! 3. `sync_to_fault` sets a Backup/Init member's `state` to `Fault` before
//!    calling `leave_fault` on it, purely so the subsequent transition logs
//!    read as "FAULT -> BACKUP" instead of "BACKUP -> BACKUP".

use tracing::{info, warn};

use crate::fsm;
use crate::notify::{NotifyEvent, NotifyScope};
use crate::registry::GroupRegistry;
use crate::scheduler::Engine;
use crate::types::{SyncGroup, SyncGroupId, VirtualRouterId, VrrpState};

/// Build a sync group from member names, resolving them against the
/// instance registry (`vrrp_sync_set_group`). Returns `None` if no named
/// member resolved, in which case the caller drops the group entirely.
pub fn resolve_group(groups: &mut GroupRegistry, engine_instances: &mut crate::registry::InstanceRegistry, name: &str, member_names: &[String]) -> Option<SyncGroupId> {
    let mut members = Vec::new();
    let mut state = VrrpState::Init;
    let mut group_member_down = false;

    for member_name in member_names {
        let Some(id) = engine_instances.find_by_name(member_name) else {
            warn!(group = name, member = member_name, "virtual router specified in sync group doesn't exist - ignoring");
            continue;
        };

        if engine_instances.get(id).sync.is_some() {
            warn!(group = name, member = member_name, "virtual router cannot exist in more than one sync group; ignoring");
            continue;
        }

        let vr = engine_instances.get(id);
        if state == VrrpState::Master && vr.wantstate == VrrpState::Backup {
            warn!(group = name, "sync group has some member(s) as address owner and some not as address owner. This won't work.");
        }
        if state != VrrpState::Backup {
            state = if vr.wantstate == VrrpState::Master && vr.is_owner() {
                VrrpState::Master
            } else {
                VrrpState::Backup
            };
        }
        if vr.state == VrrpState::Fault {
            group_member_down = true;
        }

        members.push(id);
    }

    if group_member_down {
        state = VrrpState::Fault;
    }

    if members.is_empty() {
        warn!(group = name, "no matching virtual router found in group declaration - removing");
        return None;
    }

    if members.len() == 1 {
        warn!(group = name, "sync group has only 1 virtual router - this probably isn't what you want");
    }

    let group_id = groups.insert(|id| {
        let mut group = SyncGroup::new(id, name);
        group.members = members.clone();
        group.state = state;
        group
    });

    for member_id in &members {
        engine_instances.get_mut(*member_id).sync = Some(group_id);
    }

    Some(group_id)
}

/// Whether `id` may proceed to Master: true immediately if the group is
/// already Master, otherwise only once every other member wants Master too
/// (`vrrp_sync_can_goto_master`: "prefer backup state to avoid thrashing").
/// When blocked, reschedules `id`'s own master-down timer the same way the
/// original does, since it is waiting on siblings rather than a peer advert.
pub fn can_goto_master(engine: &mut Engine, id: VirtualRouterId) -> bool {
    let group_id = match engine.instances.get(id).sync {
        Some(g) => g,
        None => return true,
    };

    if engine.groups.get(group_id).state == VrrpState::Master {
        return true;
    }

    let members = engine.groups.get(group_id).members.clone();
    for member_id in members {
        if member_id == id {
            continue;
        }
        if engine.instances.get(member_id).wantstate != VrrpState::Master {
            let now = engine.clock.now();
            let delay = engine.instances.get(id).master_down_interval();
            engine.instances.get_mut(id).reschedule(now, delay);
            return false;
        }
    }

    true
}

/// Bring every other member of `id`'s group to Backup (`vrrp_sync_backup`).
pub async fn sync_to_backup(engine: &mut Engine, id: VirtualRouterId) {
    let Some(group_id) = engine.instances.get(id).sync else {
        return;
    };
    if engine.groups.get(group_id).state == VrrpState::Backup {
        return;
    }

    let group_name = engine.groups.get(group_id).name.clone();
    info!(group = %group_name, "syncing instances to BACKUP state");

    let members = engine.groups.get(group_id).members.clone();
    for member_id in members {
        if member_id == id {
            continue;
        }
        let state = engine.instances.get(member_id).state;
        if state == VrrpState::Backup {
            continue;
        }

        engine.instances.get_mut(member_id).wantstate = VrrpState::Backup;
        if state == VrrpState::Fault || state == VrrpState::Init {
            let _ = fsm::leave_fault(engine, member_id).await;
        } else {
            let _ = fsm::leave_master(engine, member_id, false).await;
        }
    }

    engine.groups.get_mut(group_id).state = VrrpState::Backup;
    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Group(group_name),
            state: VrrpState::Backup,
        })
        .await;
}

/// Bring every other member of `id`'s group to Master (`vrrp_sync_master`).
/// A no-op if the group isn't actually ready yet (defensive: callers are
/// expected to have already checked `can_goto_master`).
pub async fn sync_to_master(engine: &mut Engine, id: VirtualRouterId) {
    let Some(group_id) = engine.instances.get(id).sync else {
        return;
    };
    if engine.groups.get(group_id).state == VrrpState::Master {
        return;
    }
    if !can_goto_master(engine, id) {
        return;
    }

    let group_name = engine.groups.get(group_id).name.clone();
    info!(group = %group_name, "syncing instances to MASTER state");

    let members = engine.groups.get(group_id).members.clone();
    for member_id in members {
        if member_id == id {
            continue;
        }
        let state = engine.instances.get(member_id).state;
        if state != VrrpState::Master {
            engine.instances.get_mut(member_id).wantstate = VrrpState::Master;
            let _ = fsm::goto_master(engine, member_id, crate::types::MasterReason::GroupPromotion).await;
        }
    }

    engine.groups.get_mut(group_id).state = VrrpState::Master;
    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Group(group_name),
            state: VrrpState::Master,
        })
        .await;
}

/// Force every other member of `id`'s group to Fault (`vrrp_sync_fault`).
/// This reduces takeover time to well under a full master-down interval by
/// pushing siblings to Backup via Fault rather than leaving them to notice
/// on their own.
pub async fn sync_to_fault(engine: &mut Engine, id: VirtualRouterId) {
    let Some(group_id) = engine.instances.get(id).sync else {
        return;
    };
    if engine.groups.get(group_id).state == VrrpState::Fault {
        return;
    }

    let group_name = engine.groups.get(group_id).name.clone();
    info!(group = %group_name, "syncing instances to FAULT state");

    let members = engine.groups.get(group_id).members.clone();
    for member_id in members {
        if member_id == id {
            continue;
        }
        let state = engine.instances.get(member_id).state;
        if state == VrrpState::Fault {
            continue;
        }

        engine.instances.get_mut(member_id).wantstate = VrrpState::Fault;
        if state == VrrpState::Master {
            let _ = fsm::leave_master(engine, member_id, false).await;
        } else if state == VrrpState::Backup || state == VrrpState::Init {
            // Set state to Fault first purely so leave_fault's transition
            // log reads FAULT -> BACKUP instead of BACKUP -> BACKUP.
            engine.instances.get_mut(member_id).state = VrrpState::Fault;
            let _ = fsm::leave_fault(engine, member_id).await;
        }
    }

    engine.groups.get_mut(group_id).state = VrrpState::Fault;
    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Group(group_name),
            state: VrrpState::Fault,
        })
        .await;
}
