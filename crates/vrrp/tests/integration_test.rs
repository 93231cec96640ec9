//! End-to-end scenarios driven through the public `fsm`/`sync`/`config` API,
//! using the fake `VipBackend`/`AdvertTransport`/`NotifySink` so they run
//! without CAP_NET_ADMIN or a real network namespace.
//!
//! Covers: owner-forces-master, preemption, backup-holds-on-lower-priority-
//! advert, priority-zero resignation, fault propagation, and sync-group
//! partial readiness / fault coordination.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use vrrp::advert::{FakeAdvertTransport, ReceivedAdvert};
use vrrp::clock::{ClockSource, MonotonicInstant};
use vrrp::config::{DaemonConfig, GroupConfig, InstanceConfig};
use vrrp::fsm;
use vrrp::notify::{Notifier, RecordingNotifySink};
use vrrp::scheduler::Engine;
use vrrp::types::{MasterReason, VrrpState};
use vrrp::vip::FakeVipBackend;

/// Fixed at `MonotonicInstant::ZERO`; `sleep_until` resolves immediately so
/// tests never wait on real time.
struct FrozenClock;

#[async_trait::async_trait]
impl ClockSource for FrozenClock {
    fn now(&self) -> MonotonicInstant {
        MonotonicInstant::ZERO
    }

    async fn sleep_until(&self, _deadline: MonotonicInstant) {}
}

struct Harness {
    engine: Engine,
    vip: Arc<FakeVipBackend>,
    notify: Arc<RecordingNotifySink>,
}

fn single_instance(priority: u8, preempt: bool) -> (Harness, vrrp::types::VirtualRouterId) {
    let config = DaemonConfig {
        instances: vec![InstanceConfig {
            name: "vr1".to_string(),
            vrid: 1,
            version: 3,
            interface: "eth0".to_string(),
            primary_ip: "10.0.0.1".parse().unwrap(),
            vips: vec!["10.0.0.100".parse().unwrap()],
            priority,
            advert_interval: 100,
            preempt,
            accept_mode: false,
            tracks: Vec::new(),
        }],
        groups: Vec::new(),
        track_poll_interval_ms: 1000,
    };
    config.validate().expect("config should be valid");
    build_harness(config)
}

fn build_harness(config: DaemonConfig) -> (Harness, vrrp::types::VirtualRouterId) {
    let vip = Arc::new(FakeVipBackend::new());
    let notify = Arc::new(RecordingNotifySink::new());
    let notifier = Arc::new(Notifier::new(notify.clone(), 4));
    let clock: Arc<dyn ClockSource> = Arc::new(FrozenClock);

    let vip_backend: Arc<dyn vrrp::vip::VipBackend> = vip.clone();
    let mut engine = Engine::new(clock, vip_backend, notifier);

    let (instances, groups, trackers) = config.build(MonotonicInstant::ZERO);
    engine.instances = instances;
    engine.groups = groups;
    engine.trackers = trackers;

    let ids: Vec<_> = engine.instances.ids().collect();
    for id in &ids {
        engine.sockets.insert(*id, Box::new(FakeAdvertTransport::new()));
    }
    let first = ids[0];

    (Harness { engine, vip, notify }, first)
}

fn advert_from(vrid: u8, priority: u8, src_ip: IpAddr) -> ReceivedAdvert {
    let mut packet = vrrp::packet::VrrpPacket::new_v3(vrid, priority, 100, vec!["10.0.0.100".parse().unwrap()]);
    packet.set_checksum(src_ip, "224.0.0.18".parse().unwrap());
    ReceivedAdvert { packet, src_ip, ttl: 255 }
}

#[tokio::test]
async fn owner_jumps_straight_to_master() {
    let (mut h, id) = single_instance(255, true);

    fsm::transition_to_master(&mut h.engine, id, MasterReason::AddressOwner).await.unwrap();

    assert_eq!(h.engine.instances.get(id).state, VrrpState::Master);
    assert!(h.vip.is_installed("eth0", "10.0.0.100".parse().unwrap()));
    assert_eq!(h.vip.announce_count(), 1);

    // notifications are dispatched on a spawned task; give it a chance to run
    tokio::task::yield_now().await;
    let events = h.notify.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, VrrpState::Master);
}

#[tokio::test]
async fn preemption_takes_over_from_lower_priority_master() {
    let (mut h, id) = single_instance(150, true);

    // become master first, as if master_down_interval had already expired
    fsm::transition_to_master(&mut h.engine, id, MasterReason::MasterDownExpired).await.unwrap();
    assert_eq!(h.engine.instances.get(id).state, VrrpState::Master);

    // a higher-priority advert from a peer should make us step down
    let advert = advert_from(1, 200, "10.0.0.2".parse().unwrap());
    fsm::recv_advertisement(&mut h.engine, id, advert).await.unwrap();

    assert_eq!(h.engine.instances.get(id).state, VrrpState::Backup);
    assert!(!h.vip.is_installed("eth0", "10.0.0.100".parse().unwrap()));
}

#[tokio::test]
async fn backup_ignores_advert_from_lower_priority_peer_when_preempt_is_off() {
    let (mut h, id) = single_instance(100, false);
    h.engine.instances.get_mut(id).state = VrrpState::Backup;
    let before = h.engine.instances.get(id).sands;

    let advert = advert_from(1, 50, "10.0.0.2".parse().unwrap());
    fsm::recv_advertisement(&mut h.engine, id, advert).await.unwrap();

    // preempt=false: a lower-priority peer does not move us out of Backup,
    // and we don't even reset our own timer for an advert we ignore
    assert_eq!(h.engine.instances.get(id).state, VrrpState::Backup);
    assert_eq!(h.engine.instances.get(id).sands, before);
}

#[tokio::test]
async fn priority_zero_advert_speeds_up_backup_takeover() {
    let (mut h, id) = single_instance(100, true);
    h.engine.instances.get_mut(id).state = VrrpState::Backup;
    let now = h.engine.clock.now();
    let skew = h.engine.instances.get(id).skew_time();
    h.engine.instances.get_mut(id).reschedule(now, Duration::from_secs(999));

    let advert = advert_from(1, 0, "10.0.0.2".parse().unwrap());
    fsm::recv_advertisement(&mut h.engine, id, advert).await.unwrap();

    assert_eq!(h.engine.instances.get(id).sands, now.saturating_add(skew));
}

#[tokio::test]
async fn master_resigns_with_priority_zero_advert_on_fault() {
    let (mut h, id) = single_instance(100, true);
    fsm::transition_to_master(&mut h.engine, id, MasterReason::MasterDownExpired).await.unwrap();

    fsm::transition_to_fault(&mut h.engine, id).await.unwrap();

    assert_eq!(h.engine.instances.get(id).state, VrrpState::Fault);
    assert!(!h.vip.is_installed("eth0", "10.0.0.100".parse().unwrap()));
}

#[tokio::test]
async fn recovering_from_fault_returns_to_backup_not_master() {
    let (mut h, id) = single_instance(100, true);
    fsm::transition_to_fault(&mut h.engine, id).await.unwrap();
    assert_eq!(h.engine.instances.get(id).state, VrrpState::Fault);

    fsm::transition_from_fault(&mut h.engine, id).await.unwrap();

    assert_eq!(h.engine.instances.get(id).state, VrrpState::Backup);
}

#[tokio::test]
async fn sync_group_defers_master_until_every_member_wants_it() {
    let config = DaemonConfig {
        instances: vec![
            InstanceConfig {
                name: "a".to_string(),
                vrid: 1,
                version: 3,
                interface: "eth0".to_string(),
                primary_ip: "10.0.0.1".parse().unwrap(),
                vips: vec!["10.0.0.100".parse().unwrap()],
                priority: 150,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
            InstanceConfig {
                name: "b".to_string(),
                vrid: 2,
                version: 3,
                interface: "eth1".to_string(),
                primary_ip: "10.0.1.1".parse().unwrap(),
                vips: vec!["10.0.1.100".parse().unwrap()],
                priority: 150,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
        ],
        groups: vec![GroupConfig {
            name: "g1".to_string(),
            members: vec!["a".to_string(), "b".to_string()],
        }],
        track_poll_interval_ms: 1000,
    };
    config.validate().expect("config should be valid");
    let (mut h, a) = build_harness(config);
    let b = h.engine.instances.find_by_name("b").unwrap();

    // a's master-down timer expires first, but b hasn't reached the same
    // point yet, so the group can't elect: a is left wanting master without
    // actually becoming it
    fsm::transition_to_master(&mut h.engine, a, MasterReason::MasterDownExpired).await.unwrap();
    assert_eq!(h.engine.instances.get(a).state, VrrpState::Init);
    assert_eq!(h.engine.instances.get(a).wantstate, VrrpState::Master);
    assert!(!h.vip.is_installed("eth0", "10.0.0.100".parse().unwrap()));

    // once b also wants master, the group elects and promotes a alongside it
    fsm::transition_to_master(&mut h.engine, b, MasterReason::MasterDownExpired).await.unwrap();
    assert_eq!(h.engine.instances.get(b).state, VrrpState::Master);
    assert_eq!(h.engine.instances.get(a).state, VrrpState::Master);
    assert!(h.vip.is_installed("eth0", "10.0.0.100".parse().unwrap()));
}

#[tokio::test]
async fn sync_group_fault_on_one_master_demotes_its_sibling() {
    let config = DaemonConfig {
        instances: vec![
            InstanceConfig {
                name: "a".to_string(),
                vrid: 1,
                version: 3,
                interface: "eth0".to_string(),
                primary_ip: "10.0.0.1".parse().unwrap(),
                vips: vec!["10.0.0.100".parse().unwrap()],
                priority: 150,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
            InstanceConfig {
                name: "b".to_string(),
                vrid: 2,
                version: 3,
                interface: "eth1".to_string(),
                primary_ip: "10.0.1.1".parse().unwrap(),
                vips: vec!["10.0.1.100".parse().unwrap()],
                priority: 150,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
        ],
        groups: vec![GroupConfig {
            name: "g1".to_string(),
            members: vec!["a".to_string(), "b".to_string()],
        }],
        track_poll_interval_ms: 1000,
    };
    config.validate().expect("config should be valid");
    let (mut h, a) = build_harness(config);
    let b = h.engine.instances.find_by_name("b").unwrap();

    // bring both members to Master directly via the physical transition,
    // bypassing sync-group readiness gating, to set up the scenario
    fsm::goto_master(&mut h.engine, a, MasterReason::MasterDownExpired).await.unwrap();
    fsm::goto_master(&mut h.engine, b, MasterReason::MasterDownExpired).await.unwrap();

    fsm::transition_to_fault(&mut h.engine, a).await.unwrap();

    // the instance that actually faulted lands in Fault; its sibling is
    // only demoted to Backup (sync_to_fault's Master branch calls
    // leave_master, not goto_fault, on the rest of the group)
    assert_eq!(h.engine.instances.get(a).state, VrrpState::Fault);
    assert_eq!(h.engine.instances.get(b).state, VrrpState::Backup);
    assert!(!h.vip.is_installed("eth1", "10.0.1.100".parse().unwrap()));

    let group_id = h.engine.instances.get(a).sync.unwrap();
    assert_eq!(h.engine.groups.get(group_id).state, VrrpState::Fault);
}

#[tokio::test]
async fn config_rejects_duplicate_vrid_on_same_interface() {
    let config = DaemonConfig {
        instances: vec![
            InstanceConfig {
                name: "a".to_string(),
                vrid: 1,
                version: 3,
                interface: "eth0".to_string(),
                primary_ip: "10.0.0.1".parse().unwrap(),
                vips: vec!["10.0.0.100".parse().unwrap()],
                priority: 100,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
            InstanceConfig {
                name: "b".to_string(),
                vrid: 1,
                version: 3,
                interface: "eth0".to_string(),
                primary_ip: "10.0.0.2".parse().unwrap(),
                vips: vec!["10.0.0.101".parse().unwrap()],
                priority: 100,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            },
        ],
        groups: Vec::new(),
        track_poll_interval_ms: 1000,
    };

    assert!(config.validate().is_err());
}
