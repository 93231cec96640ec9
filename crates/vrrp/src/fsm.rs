//! Instance FSM (spec §4.1): state transitions, timer resets, and received
//! advertisement processing for one virtual router.
//!
//! Functions here are "physical" transitions — they touch VIPs, sockets,
//! stats, and notifications for exactly the instance named, and know
//! nothing about sync groups. `transition_to_*` wrap a physical transition
//! with the sync-group gate/propagation step (spec §4.2); `crate::sync`
//! calls the physical functions directly on peer members to avoid
//! re-entering that propagation recursively.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::advert;
use crate::error::VrrpError;
use crate::notify::{NotifyEvent, NotifyScope};
use crate::packet::VrrpPacket;
use crate::scheduler::Engine;
use crate::sync;
use crate::types::{MasterReason, VirtualRouterId, VrrpState, VRRP_MULTICAST_ADDR_V4, VRRP_MULTICAST_ADDR_V6};

fn multicast_addr(family: crate::types::AddressFamily) -> IpAddr {
    match family {
        crate::types::AddressFamily::V4 => VRRP_MULTICAST_ADDR_V4.parse().unwrap(),
        crate::types::AddressFamily::V6 => VRRP_MULTICAST_ADDR_V6.parse().unwrap(),
    }
}

fn build_packet(engine: &Engine, id: VirtualRouterId, priority: u8) -> VrrpPacket {
    let vr = engine.instances.get(id);
    match vr.version {
        crate::types::VRRP_VERSION_V2 => {
            let ips = vr
                .vips
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(*v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            VrrpPacket::new_v2(vr.vrid, priority, vr.advert_interval, ips)
        }
        _ => VrrpPacket::new_v3(vr.vrid, priority, vr.advert_interval, vr.vips.clone()),
    }
}

/// Send one advertisement at the instance's current effective priority
/// (spec §4.1: Master periodically re-advertises at `advert_interval`).
pub async fn send_advertisement(engine: &mut Engine, id: VirtualRouterId) -> common::Result<()> {
    send_advertisement_at_priority(engine, id, engine.instances.get(id).effective_priority()).await
}

async fn send_advertisement_at_priority(
    engine: &mut Engine,
    id: VirtualRouterId,
    priority: u8,
) -> common::Result<()> {
    let packet = build_packet(engine, id, priority);
    let vr = engine.instances.get(id);
    let primary_ip = vr.primary_ip;
    let vrid = vr.vrid;

    let Some(socket) = engine.sockets.get(&id) else {
        warn!(vrid, "no advert socket bound for instance, dropping send");
        return Ok(());
    };

    match socket.send(&packet, primary_ip) {
        Ok(_) => {
            let vr = engine.instances.get_mut(id);
            vr.stats.adverts_sent += 1;
            if priority == crate::types::VRRP_PRIORITY_RESIGN {
                vr.stats.priority_zero_sent += 1;
            }
            debug!(vrid, priority, "sent VRRP advertisement");
            Ok(())
        }
        Err(e) => {
            warn!(vrid, error = %e, "failed to send VRRP advertisement");
            Err(VrrpError::resource(format!("send failed for vrid {vrid}: {e}")).into())
        }
    }
}

/// Physical transition into Master (spec §4.1): install VIPs, announce,
/// send an immediate advertisement, update stats and the next deadline. A
/// VIP install failure demotes straight to Fault rather than returning an
/// error past this call (spec §7's recoverable-error policy).
pub async fn goto_master(engine: &mut Engine, id: VirtualRouterId, reason: MasterReason) -> common::Result<()> {
    let (interface, vips, name, vrid) = {
        let vr = engine.instances.get(id);
        (vr.interface.clone(), vr.vips.clone(), vr.name.clone(), vr.vrid)
    };

    if let Err(e) = engine.vip.install(&interface, &vips).await {
        warn!(vrid, name = %name, error = ?e, "VIP install failed, faulting instead of becoming master");
        return goto_fault(engine, id).await;
    }

    let announce_count = 5;
    engine
        .vip
        .announce(&interface, &vips, announce_count, Duration::from_millis(50))
        .await;

    let priority = engine.instances.get(id).effective_priority();
    send_advertisement_at_priority(engine, id, priority).await?;

    let now = engine.clock.now();
    let vr = engine.instances.get_mut(id);
    vr.state = VrrpState::Master;
    vr.wantstate = VrrpState::Master;
    vr.stats.master_transitions += 1;
    vr.stats.last_master_reason = Some(reason);
    vr.reschedule(now, vr.advert_interval_duration());

    info!(vrid, name = %name, priority = vr.effective_priority(), ?reason, "instance -> MASTER");

    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Instance(name),
            state: VrrpState::Master,
        })
        .await;

    Ok(())
}

/// Physical transition out of Master into Backup (spec §4.1). If
/// `send_resign` is set, a priority-0 advertisement is sent first (graceful
/// shutdown or resignation per RFC 5798 §6.4.1); a demotion that lost an
/// election to a higher-priority peer does not resign.
pub async fn leave_master(engine: &mut Engine, id: VirtualRouterId, send_resign: bool) -> common::Result<()> {
    if send_resign {
        send_advertisement_at_priority(engine, id, crate::types::VRRP_PRIORITY_RESIGN).await?;
    }

    let (interface, vips, name, vrid) = {
        let vr = engine.instances.get(id);
        (vr.interface.clone(), vr.vips.clone(), vr.name.clone(), vr.vrid)
    };
    if let Err(e) = engine.vip.remove(&interface, &vips).await {
        warn!(vrid, name = %name, error = ?e, "VIP removal failed while leaving master");
    }

    let now = engine.clock.now();
    let vr = engine.instances.get_mut(id);
    vr.state = VrrpState::Backup;
    vr.wantstate = VrrpState::Backup;
    vr.stats.backup_transitions += 1;
    let delay = vr.master_down_interval();
    vr.reschedule(now, delay);

    info!(vrid, name = %name, "instance -> BACKUP (left master)");

    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Instance(name),
            state: VrrpState::Backup,
        })
        .await;

    Ok(())
}

/// Physical transition into Fault (spec §4.1/§4.3): a tracked resource
/// failed. VIPs are torn down without a resignation advertisement — a
/// faulted instance cannot be trusted to claim it is giving up gracefully.
pub async fn goto_fault(engine: &mut Engine, id: VirtualRouterId) -> common::Result<()> {
    let was_master = engine.instances.get(id).state == VrrpState::Master;
    let (interface, vips, name, vrid) = {
        let vr = engine.instances.get(id);
        (vr.interface.clone(), vr.vips.clone(), vr.name.clone(), vr.vrid)
    };

    if was_master {
        if let Err(e) = engine.vip.remove(&interface, &vips).await {
            warn!(vrid, name = %name, error = ?e, "VIP removal failed while faulting");
        }
    }

    let now = engine.clock.now();
    let vr = engine.instances.get_mut(id);
    vr.state = VrrpState::Fault;
    vr.wantstate = VrrpState::Fault;
    vr.stats.fault_transitions += 1;
    let delay = vr.master_down_interval();
    vr.reschedule(now, delay);

    warn!(vrid, name = %name, "instance -> FAULT");

    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Instance(name),
            state: VrrpState::Fault,
        })
        .await;

    Ok(())
}

/// Physical transition out of Fault into Backup, once the track subsystem
/// reports recovery (spec §4.3).
pub async fn leave_fault(engine: &mut Engine, id: VirtualRouterId) -> common::Result<()> {
    let now = engine.clock.now();
    let vr = engine.instances.get_mut(id);
    vr.state = VrrpState::Backup;
    vr.wantstate = VrrpState::Backup;
    let delay = vr.master_down_interval();
    vr.reschedule(now, delay);
    let name = vr.name.clone();
    let vrid = vr.vrid;

    info!(vrid, name = %name, "instance -> BACKUP (left fault)");

    engine
        .notifier
        .notify(NotifyEvent {
            scope: NotifyScope::Instance(name),
            state: VrrpState::Backup,
        })
        .await;

    Ok(())
}

/// Orchestration entry point for becoming master from an external trigger
/// (master-down timer expiry, owner init, priority recovery). Performs the
/// sync-group readiness gate before the physical transition, then
/// propagates to the rest of the group.
pub async fn transition_to_master(engine: &mut Engine, id: VirtualRouterId, reason: MasterReason) -> common::Result<()> {
    if engine.instances.get(id).sync.is_some() {
        engine.instances.get_mut(id).wantstate = VrrpState::Master;
        if !sync::can_goto_master(engine, id) {
            debug!(vrid = engine.instances.get(id).vrid, "deferring MASTER transition: sync group not ready");
            return Ok(());
        }
    }

    goto_master(engine, id, reason).await?;

    if engine.instances.get(id).sync.is_some() {
        sync::sync_to_master(engine, id).await;
    }

    Ok(())
}

/// Orchestration entry point for leaving master (higher-priority peer
/// detected, or operator-initiated shutdown via `send_resign`).
pub async fn transition_to_backup(engine: &mut Engine, id: VirtualRouterId, send_resign: bool) -> common::Result<()> {
    let synced = engine.instances.get(id).sync.is_some();
    leave_master(engine, id, send_resign).await?;
    if synced {
        sync::sync_to_backup(engine, id).await;
    }
    Ok(())
}

/// Orchestration entry point for a tracked resource failing.
pub async fn transition_to_fault(engine: &mut Engine, id: VirtualRouterId) -> common::Result<()> {
    let synced = engine.instances.get(id).sync.is_some();
    goto_fault(engine, id).await?;
    if synced {
        sync::sync_to_fault(engine, id).await;
    }
    Ok(())
}

/// Orchestration entry point for a tracked resource recovering.
pub async fn transition_from_fault(engine: &mut Engine, id: VirtualRouterId) -> common::Result<()> {
    let synced = engine.instances.get(id).sync.is_some();
    leave_fault(engine, id).await?;
    if synced {
        sync::sync_to_backup(engine, id).await;
    }
    Ok(())
}

/// Process one received advertisement against this instance's current
/// state (RFC 5798 §6.4.2/§6.4.3; spec §4.1 step 1-3).
pub async fn recv_advertisement(
    engine: &mut Engine,
    id: VirtualRouterId,
    advert: advert::ReceivedAdvert,
) -> common::Result<()> {
    let vrid = engine.instances.get(id).vrid;

    if !advert::validate_ttl(advert.ttl) {
        engine.instances.get_mut(id).stats.invalid_adverts += 1;
        warn!(vrid, ttl = advert.ttl, "dropping advert with invalid TTL/hop-limit");
        return Ok(());
    }
    if advert.packet.vrid != vrid {
        return Ok(());
    }
    let family = engine.instances.get(id).family;
    if !family.matches(advert.src_ip) {
        engine.instances.get_mut(id).stats.invalid_adverts += 1;
        warn!(vrid, "dropping advert with mismatched address family");
        return Ok(());
    }

    let dst = multicast_addr(family);
    if !advert.packet.verify_checksum(advert.src_ip, dst) {
        engine.instances.get_mut(id).stats.checksum_errors += 1;
        warn!(vrid, "dropping advert with invalid checksum");
        return Ok(());
    }

    engine.instances.get_mut(id).stats.adverts_received += 1;
    if advert.packet.is_resignation() {
        engine.instances.get_mut(id).stats.priority_zero_received += 1;
    }

    let state = engine.instances.get(id).state;
    match state {
        VrrpState::Backup => {
            if advert.packet.is_resignation() {
                debug!(vrid, "master resigned, shortening to skew time");
                let skew = engine.instances.get(id).skew_time();
                let now = engine.clock.now();
                engine.instances.get_mut(id).reschedule(now, skew);
            } else {
                let preempt = engine.instances.get(id).preempt;
                let our_priority = engine.instances.get(id).effective_priority();
                if !preempt || advert.packet.priority >= our_priority {
                    let now = engine.clock.now();
                    let delay = engine.instances.get(id).master_down_interval();
                    engine.instances.get_mut(id).reschedule(now, delay);
                }
                // else: lower-priority peer and we preempt — let our timer
                // keep counting down toward taking over.
            }
        }
        VrrpState::Master => {
            if !advert.packet.is_resignation() {
                let our_priority = engine.instances.get(id).effective_priority();
                let primary_ip = engine.instances.get(id).primary_ip;
                let outranked = advert.packet.priority > our_priority
                    || (advert.packet.priority == our_priority && advert.src_ip > primary_ip);
                if outranked {
                    info!(vrid, their_priority = advert.packet.priority, our_priority, "outranked, leaving MASTER");
                    transition_to_backup(engine, id, false).await?;
                }
            }
        }
        VrrpState::Init | VrrpState::Fault => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::test_engine;
    use crate::types::AddressFamily;

    #[tokio::test]
    async fn goto_master_installs_vips_and_updates_state() {
        let (mut engine, id, fake_vip, _sink) = test_engine(100, true, AddressFamily::V4).await;

        goto_master(&mut engine, id, MasterReason::MasterDownExpired).await.unwrap();

        let vr = engine.instances.get(id);
        assert_eq!(vr.state, VrrpState::Master);
        assert_eq!(vr.stats.master_transitions, 1);
        assert!(fake_vip.is_installed(&vr.interface, vr.vips[0]));
    }

    #[tokio::test]
    async fn leave_master_removes_vips_and_reschedules_backup() {
        let (mut engine, id, fake_vip, _sink) = test_engine(100, true, AddressFamily::V4).await;
        goto_master(&mut engine, id, MasterReason::MasterDownExpired).await.unwrap();

        leave_master(&mut engine, id, false).await.unwrap();

        let vr = engine.instances.get(id);
        assert_eq!(vr.state, VrrpState::Backup);
        assert!(!fake_vip.is_installed(&vr.interface, vr.vips[0]));
    }

    #[tokio::test]
    async fn backup_preempts_lower_priority_peer_by_ignoring_advert() {
        let (mut engine, id, _fake_vip, _sink) = test_engine(150, true, AddressFamily::V4).await;
        let vr = engine.instances.get(id);
        let before = vr.sands;

        let mut packet = VrrpPacket::new_v3(vr.vrid, 50, vr.advert_interval, vr.vips.clone());
        let src: IpAddr = "10.0.0.2".parse().unwrap();
        packet.set_checksum(src, "224.0.0.18".parse().unwrap());
        recv_advertisement(
            &mut engine,
            id,
            advert::ReceivedAdvert {
                packet,
                src_ip: src,
                ttl: 255,
            },
        )
        .await
        .unwrap();

        assert_eq!(engine.instances.get(id).sands, before);
    }

    #[tokio::test]
    async fn backup_resets_timer_on_valid_higher_or_equal_advert() {
        let (mut engine, id, _fake_vip, _sink) = test_engine(100, false, AddressFamily::V4).await;
        let vr = engine.instances.get(id);
        let before = vr.sands;

        let packet = VrrpPacket::new_v3(vr.vrid, 100, vr.advert_interval, vr.vips.clone());
        let src: IpAddr = "10.0.0.2".parse().unwrap();
        let mut packet = packet;
        packet.set_checksum(src, "224.0.0.18".parse().unwrap());

        recv_advertisement(
            &mut engine,
            id,
            advert::ReceivedAdvert {
                packet,
                src_ip: src,
                ttl: 255,
            },
        )
        .await
        .unwrap();

        assert!(engine.instances.get(id).sands >= before);
    }

    #[tokio::test]
    async fn invalid_ttl_is_dropped_and_counted() {
        let (mut engine, id, _fake_vip, _sink) = test_engine(100, true, AddressFamily::V4).await;
        let vr = engine.instances.get(id);
        let packet = VrrpPacket::new_v3(vr.vrid, 200, vr.advert_interval, vr.vips.clone());

        recv_advertisement(
            &mut engine,
            id,
            advert::ReceivedAdvert {
                packet,
                src_ip: "10.0.0.2".parse().unwrap(),
                ttl: 64,
            },
        )
        .await
        .unwrap();

        assert_eq!(engine.instances.get(id).stats.invalid_adverts, 1);
        assert_eq!(engine.instances.get(id).state, VrrpState::Backup);
    }
}
