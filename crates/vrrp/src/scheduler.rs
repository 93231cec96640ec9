//! Scheduler Loop (spec §2, §5): the single `tokio::task` that owns every
//! instance's timer, drives advert sockets, and polls the track subsystem.
//! No instance gets its own spawned task — FSM and sync-group transitions
//! run to completion inside one loop iteration, which is what makes a group
//! transition atomic from the protocol's perspective (spec §5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::advert::{AdvertSocket, AdvertTransport};
use crate::clock::{ClockSource, MonotonicInstant, TimerWheel};
use crate::config::DaemonConfig;
use crate::error::VrrpError;
use crate::notify::Notifier;
use crate::registry::{GroupRegistry, InstanceRegistry};
use crate::track::Tracker;
use crate::types::{AddressFamily, MasterReason, VirtualRouter, VirtualRouterId, VrrpState};
use crate::fsm;
use crate::vip::VipBackend;

/// How often `tick` polls bound advert sockets for incoming packets when no
/// sooner timer/track deadline already forces a wakeup. Raw advert sockets
/// aren't registered with tokio's reactor, so this is a bounded poll rather
/// than a readiness notification (spec §2/§5: "timers, sockets, and signals
/// together").
const ADVERT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything one scheduler iteration needs: registries, boundary traits,
/// and the per-instance send transports. Not `Clone` — there is exactly one
/// per running daemon.
pub struct Engine {
    pub instances: InstanceRegistry,
    pub groups: GroupRegistry,
    pub clock: Arc<dyn ClockSource>,
    pub vip: Arc<dyn VipBackend>,
    pub notifier: Arc<Notifier>,
    pub sockets: HashMap<VirtualRouterId, Box<dyn AdvertTransport>>,
    pub trackers: HashMap<VirtualRouterId, Tracker>,
}

impl Engine {
    pub fn new(clock: Arc<dyn ClockSource>, vip: Arc<dyn VipBackend>, notifier: Arc<Notifier>) -> Self {
        Self {
            instances: InstanceRegistry::new(),
            groups: GroupRegistry::new(),
            clock,
            vip,
            notifier,
            sockets: HashMap::new(),
            trackers: HashMap::new(),
        }
    }
}

/// Runs the instance/group/track event loop to completion only on
/// `shutdown()`; otherwise loops forever reacting to timer expiry and
/// socket reads.
pub struct Scheduler {
    engine: Engine,
    wheel: TimerWheel,
    track_poll_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Engine, track_poll_interval: Duration) -> Self {
        Self {
            engine,
            wheel: TimerWheel::new(),
            track_poll_interval,
        }
    }

    /// Seed the timer wheel from each instance's initial state: owners go
    /// straight to Master, everyone else starts counting down
    /// `master_down_interval` from Backup (spec §4.1 "Init" transitions).
    pub async fn start(&mut self) -> common::Result<()> {
        let ids: Vec<_> = self.engine.instances.ids().collect();
        for id in ids {
            let is_owner = self.engine.instances.get(id).is_owner();
            if is_owner {
                fsm::transition_to_master(&mut self.engine, id, MasterReason::AddressOwner).await?;
            } else {
                let now = self.engine.clock.now();
                let delay = self.engine.instances.get(id).master_down_interval();
                self.engine.instances.get_mut(id).reschedule(now, delay);
            }
            self.wheel.schedule(id, self.engine.instances.get(id).sands);
        }
        Ok(())
    }

    /// Run one pass: wait for the earliest deadline (timer, track poll, or
    /// the next advert poll, whichever is sooner), then act. Draining
    /// sockets happens every pass so a packet arrival is never starved
    /// behind a long timer/track deadline (spec §2/§5).
    pub async fn tick(&mut self) -> common::Result<()> {
        let now = self.engine.clock.now();
        let next_timer = self.wheel.peek_deadline();
        let next_track = now.saturating_add(self.track_poll_interval);
        let mut deadline = match next_timer {
            Some(t) if t < next_track => t,
            _ => next_track,
        };
        if !self.engine.sockets.is_empty() {
            let next_poll = now.saturating_add(ADVERT_POLL_INTERVAL);
            if next_poll < deadline {
                deadline = next_poll;
            }
        }

        self.engine.clock.sleep_until(deadline).await;
        let now = self.engine.clock.now();

        self.drain_adverts().await?;

        while let Some(deadline) = self.wheel.peek_deadline() {
            if deadline > now {
                break;
            }
            let (id, popped_deadline) = self.wheel.pop().unwrap();
            if self.engine.instances.try_get(id).map(|vr| vr.sands) != Some(popped_deadline) {
                continue; // stale entry, instance was rescheduled since
            }
            if self.engine.instances.get(id).retired {
                continue; // dropped by reload, never rescheduled
            }
            self.handle_timer_expiry(id).await?;
            self.wheel.schedule(id, self.engine.instances.get(id).sands);
        }

        self.poll_tracks().await?;
        Ok(())
    }

    /// Non-blockingly drain every bound advert socket and feed whatever it
    /// has pending through `on_advert`, fully draining each one before
    /// moving to the next so a burst of adverts on one interface can't
    /// starve the others' single pass (review fix: this used to be dead —
    /// `tick` never called it and `vrrpd` could never hear a peer).
    async fn drain_adverts(&mut self) -> common::Result<()> {
        let ids: Vec<_> = self.engine.instances.ids().collect();
        for id in ids {
            if self.engine.instances.get(id).retired {
                continue;
            }
            let interface = self.engine.instances.get(id).interface.clone();
            loop {
                let received = match self.engine.sockets.get(&id) {
                    Some(socket) => socket.try_recv(),
                    None => break,
                };
                match received {
                    Ok(Some(advert)) => self.on_advert(&interface, advert).await?,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(interface = %interface, error = %e, "advert socket read failed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_timer_expiry(&mut self, id: VirtualRouterId) -> common::Result<()> {
        let state = self.engine.instances.get(id).state;
        match state {
            VrrpState::Master => {
                fsm::send_advertisement(&mut self.engine, id).await?;
                let now = self.engine.clock.now();
                let delay = self.engine.instances.get(id).advert_interval_duration();
                self.engine.instances.get_mut(id).reschedule(now, delay);
            }
            VrrpState::Backup | VrrpState::Init => {
                debug!(vrid = self.engine.instances.get(id).vrid, "master down interval expired");
                fsm::transition_to_master(&mut self.engine, id, MasterReason::MasterDownExpired).await?;
            }
            VrrpState::Fault => {
                // Faulted instances just keep their deadline alive; only
                // track recovery (poll_tracks) moves them out of Fault.
                let now = self.engine.clock.now();
                let delay = self.engine.instances.get(id).master_down_interval();
                self.engine.instances.get_mut(id).reschedule(now, delay);
            }
        }
        Ok(())
    }

    /// Feed one received advert to its owning instance, identified by
    /// matching VRID within the same interface/family. Called from
    /// `drain_adverts`, which owns the non-blocking socket reads.
    pub async fn on_advert(&mut self, interface: &str, advert: crate::advert::ReceivedAdvert) -> common::Result<()> {
        let target = self.engine.instances.iter().find(|vr| vr.interface == interface && vr.vrid == advert.packet.vrid).map(|vr| vr.id);

        let Some(id) = target else {
            warn!(interface, vrid = advert.packet.vrid, "advert for unknown instance, dropping");
            return Ok(());
        };

        fsm::recv_advertisement(&mut self.engine, id, advert).await
    }

    async fn poll_tracks(&mut self) -> common::Result<()> {
        let ids: Vec<_> = self.engine.instances.ids().collect();
        for id in ids {
            if self.engine.instances.get(id).retired {
                continue;
            }
            let Some(tracker) = self.engine.trackers.get(&id) else {
                continue;
            };
            if tracker.is_empty() {
                continue;
            }
            let outcome = tracker.evaluate().await;

            let was_faulted = self.engine.instances.get(id).track_fault;
            self.engine.instances.get_mut(id).set_priority_delta(outcome.priority_delta);
            self.engine.instances.get_mut(id).track_fault = outcome.faulted;

            if outcome.faulted && !was_faulted {
                fsm::transition_to_fault(&mut self.engine, id).await?;
            } else if !outcome.faulted && was_faulted {
                fsm::transition_from_fault(&mut self.engine, id).await?;
            }
        }
        Ok(())
    }

    /// Orderly shutdown (spec §6 operator surface): every instance
    /// currently Master resigns (priority-0 advert, VIPs removed), then
    /// sockets/notifier are dropped by the caller discarding the
    /// `Scheduler`.
    pub async fn shutdown(mut self) -> common::Result<()> {
        let ids: Vec<_> = self.engine.instances.ids().collect();
        for id in ids {
            if self.engine.instances.get(id).state == VrrpState::Master {
                info!(vrid = self.engine.instances.get(id).vrid, "shutting down, resigning as master");
                fsm::leave_master(&mut self.engine, id, true).await?;
            }
        }
        Ok(())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Apply a new configuration to the running daemon (spec §6's
    /// operator-surface `reload` bullet): instances named in both the old
    /// and new config are left untouched (`sands`/`state`/stats survive);
    /// instances only in `new_config` are added fresh, seeded the same way
    /// `start` seeds them; instances only in the old config are retired in
    /// place — a Master resigns first, then its socket/tracker are dropped
    /// and `VirtualRouter::retired` is set so the scheduler stops touching
    /// it (`InstanceRegistry` never compacts, see its doc comment).
    ///
    /// Added instances come back from this call with no bound socket, same
    /// as a freshly built `Engine` before the caller's first
    /// `bind_advert_sockets`: call it again afterward (it already skips
    /// retired instances) to give them one. `reload` doesn't do this
    /// itself so it stays usable without a privileged raw socket in tests.
    ///
    /// Sync-group topology is not reloadable: `new_config.groups` is
    /// ignored, so a newly added instance named in a group there simply
    /// runs standalone until the next restart.
    pub async fn reload(&mut self, new_config: &DaemonConfig) -> common::Result<ReloadReport> {
        let mut report = ReloadReport::default();

        let existing_names: HashSet<String> = self
            .engine
            .instances
            .iter()
            .filter(|vr| !vr.retired)
            .map(|vr| vr.name.clone())
            .collect();
        let new_names: HashSet<String> = new_config.instances.iter().map(|cfg| cfg.name.clone()).collect();

        let removed: Vec<VirtualRouterId> = self
            .engine
            .instances
            .iter()
            .filter(|vr| !vr.retired && !new_names.contains(&vr.name))
            .map(|vr| vr.id)
            .collect();

        for id in removed {
            let name = self.engine.instances.get(id).name.clone();
            if self.engine.instances.get(id).state == VrrpState::Master {
                info!(name = %name, "reload: retiring instance, resigning as master");
                fsm::leave_master(&mut self.engine, id, true).await?;
            }
            self.engine.instances.get_mut(id).retired = true;
            self.engine.sockets.remove(&id);
            self.engine.trackers.remove(&id);
            report.removed.push(name);
        }

        for cfg in &new_config.instances {
            if existing_names.contains(&cfg.name) {
                report.unchanged.push(cfg.name.clone());
                continue;
            }

            let now = self.engine.clock.now();
            let family = AddressFamily::of(cfg.primary_ip);
            let id = self.engine.instances.insert(|id| {
                VirtualRouter::new(
                    id,
                    cfg.name.clone(),
                    cfg.vrid,
                    cfg.version,
                    family,
                    cfg.interface.clone(),
                    cfg.priority,
                    cfg.advert_interval,
                    cfg.primary_ip,
                    cfg.vips.clone(),
                    cfg.preempt,
                    cfg.accept_mode,
                    now,
                )
            });

            if !cfg.tracks.is_empty() {
                let mut tracker = Tracker::new();
                for track in &cfg.tracks {
                    tracker.add(track.build_probe());
                }
                self.engine.trackers.insert(id, tracker);
            }

            if self.engine.instances.get(id).is_owner() {
                fsm::transition_to_master(&mut self.engine, id, MasterReason::AddressOwner).await?;
            } else {
                let delay = self.engine.instances.get(id).master_down_interval();
                self.engine.instances.get_mut(id).reschedule(now, delay);
            }
            self.wheel.schedule(id, self.engine.instances.get(id).sands);
            report.added.push(cfg.name.clone());
            info!(name = %cfg.name, "reload: added instance");
        }

        Ok(report)
    }
}

/// Outcome of a `Scheduler::reload` call (spec §6 operator surface).
#[derive(Debug, Default, Clone)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Bind a real `AdvertSocket` for every distinct `(interface, family)` pair
/// across an engine's live (non-retired) instances and register it for
/// each instance sharing that pair.
pub fn bind_advert_sockets(engine: &mut Engine) -> common::Result<()> {
    let mut by_key: HashMap<(String, bool), Arc<AdvertSocket>> = HashMap::new();
    let ids: Vec<_> = engine.instances.ids().collect();

    for id in ids {
        let vr = engine.instances.get(id);
        if vr.retired {
            continue;
        }
        let is_ipv6 = matches!(vr.family, AddressFamily::V6);
        let key = (vr.interface.clone(), is_ipv6);

        let socket = if let Some(existing) = by_key.get(&key) {
            existing.clone()
        } else {
            let socket = Arc::new(
                AdvertSocket::new(&vr.interface, vr.family)
                    .map_err(|e| VrrpError::fatal(format!("bind advert socket on {}: {e}", vr.interface)))?,
            );
            socket
                .join_multicast()
                .map_err(|e| VrrpError::fatal(format!("join multicast on {}: {e}", vr.interface)))?;
            by_key.insert(key.clone(), socket.clone());
            socket
        };

        engine.sockets.insert(id, Box::new(SharedAdvertSocket(socket)));
    }

    Ok(())
}

struct SharedAdvertSocket(Arc<AdvertSocket>);

impl AdvertTransport for SharedAdvertSocket {
    fn send(&self, packet: &crate::packet::VrrpPacket, src_ip: std::net::IpAddr) -> std::io::Result<usize> {
        self.0.send(packet, src_ip)
    }

    fn try_recv(&self) -> std::io::Result<Option<crate::advert::ReceivedAdvert>> {
        self.0.try_recv()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::advert::FakeAdvertTransport;
    use crate::clock::MonotonicInstant;
    use crate::notify::RecordingNotifySink;
    use crate::types::{AddressFamily, VirtualRouter, VRRP_VERSION_V3};
    use crate::vip::FakeVipBackend;

    /// A `ClockSource` fixed at `MonotonicInstant::ZERO` for deterministic
    /// FSM/sync-group tests: `sleep_until` resolves immediately.
    pub struct FrozenClock;

    #[async_trait::async_trait]
    impl ClockSource for FrozenClock {
        fn now(&self) -> MonotonicInstant {
            MonotonicInstant::ZERO
        }

        async fn sleep_until(&self, _deadline: MonotonicInstant) {}
    }

    pub async fn test_engine(
        priority: u8,
        preempt: bool,
        family: AddressFamily,
    ) -> (Engine, VirtualRouterId, Arc<FakeVipBackend>, Arc<RecordingNotifySink>) {
        let fake_vip = Arc::new(FakeVipBackend::new());
        let sink = Arc::new(RecordingNotifySink::new());
        let notifier = Arc::new(Notifier::new(sink.clone(), 4));
        let clock: Arc<dyn ClockSource> = Arc::new(FrozenClock);

        let vip_backend: Arc<dyn VipBackend> = fake_vip.clone();
        let mut engine = Engine::new(clock, vip_backend, notifier);

        let vip_addr = match family {
            AddressFamily::V4 => "10.0.0.100".parse().unwrap(),
            AddressFamily::V6 => "fe80::100".parse().unwrap(),
        };
        let primary_ip = match family {
            AddressFamily::V4 => "10.0.0.1".parse().unwrap(),
            AddressFamily::V6 => "fe80::1".parse().unwrap(),
        };

        let id = engine.instances.insert(|id| {
            VirtualRouter::new(
                id,
                "vr1",
                1,
                VRRP_VERSION_V3,
                family,
                "eth0",
                priority,
                100,
                primary_ip,
                vec![vip_addr],
                preempt,
                false,
                MonotonicInstant::ZERO,
            )
        });
        engine.sockets.insert(id, Box::new(FakeAdvertTransport::new()));

        (engine, id, fake_vip, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FrozenClock;
    use super::*;
    use crate::advert::{FakeAdvertTransport, ReceivedAdvert};
    use crate::notify::{Notifier, RecordingNotifySink};
    use crate::packet::VrrpPacket;
    use crate::types::{AddressFamily, VRRP_VERSION_V3};
    use crate::vip::FakeVipBackend;
    use std::net::IpAddr;

    fn build_engine() -> (Engine, VirtualRouterId, Arc<FakeAdvertTransport>) {
        let fake_vip: Arc<dyn VipBackend> = Arc::new(FakeVipBackend::new());
        let sink = Arc::new(RecordingNotifySink::new());
        let notifier = Arc::new(Notifier::new(sink, 4));
        let clock: Arc<dyn ClockSource> = Arc::new(FrozenClock);
        let mut engine = Engine::new(clock, fake_vip, notifier);

        let id = engine.instances.insert(|id| {
            VirtualRouter::new(
                id,
                "vr1",
                1,
                VRRP_VERSION_V3,
                AddressFamily::V4,
                "eth0",
                100,
                100,
                "10.0.0.1".parse().unwrap(),
                vec!["10.0.0.100".parse().unwrap()],
                true,
                false,
                MonotonicInstant::ZERO,
            )
        });

        let fake_socket = Arc::new(FakeAdvertTransport::new());
        engine.sockets.insert(id, Box::new(fake_socket.clone()));

        (engine, id, fake_socket)
    }

    #[tokio::test]
    async fn tick_drains_pending_advert_through_on_advert() {
        let (engine, id, fake_socket) = build_engine();

        let mut packet = VrrpPacket::new_v3(1, 200, 100, vec!["10.0.0.100".parse().unwrap()]);
        let src: IpAddr = "10.0.0.9".parse().unwrap();
        packet.set_checksum(src, "224.0.0.18".parse().unwrap());
        fake_socket.push_incoming(ReceivedAdvert { packet, src_ip: src, ttl: 255 });

        let mut scheduler = Scheduler::new(engine, Duration::from_secs(1));
        scheduler.start().await.unwrap();
        scheduler.tick().await.unwrap();

        assert_eq!(scheduler.engine().instances.get(id).stats.adverts_received, 1);
    }

    #[tokio::test]
    async fn tick_ignores_advert_with_no_matching_instance() {
        let (engine, _id, fake_socket) = build_engine();

        let mut packet = VrrpPacket::new_v3(99, 200, 100, vec!["10.0.0.100".parse().unwrap()]);
        let src: IpAddr = "10.0.0.9".parse().unwrap();
        packet.set_checksum(src, "224.0.0.18".parse().unwrap());
        fake_socket.push_incoming(ReceivedAdvert { packet, src_ip: src, ttl: 255 });

        let mut scheduler = Scheduler::new(engine, Duration::from_secs(1));
        scheduler.start().await.unwrap();
        // Should not panic or error even though the vrid matches nothing.
        scheduler.tick().await.unwrap();
    }

    #[tokio::test]
    async fn reload_adds_and_retires_instances() {
        let (engine, vr1, _fake_socket) = build_engine();
        let mut scheduler = Scheduler::new(engine, Duration::from_secs(1));
        scheduler.start().await.unwrap();

        let config = DaemonConfig {
            instances: vec![crate::config::InstanceConfig {
                name: "vr2".to_string(),
                vrid: 2,
                version: VRRP_VERSION_V3,
                interface: "eth0".to_string(),
                primary_ip: "10.0.0.2".parse().unwrap(),
                vips: vec!["10.0.0.200".parse().unwrap()],
                priority: 100,
                advert_interval: 100,
                preempt: true,
                accept_mode: false,
                tracks: Vec::new(),
            }],
            groups: Vec::new(),
            track_poll_interval_ms: 1000,
        };

        let report = scheduler.reload(&config).await.unwrap();
        assert_eq!(report.added, vec!["vr2".to_string()]);
        assert_eq!(report.removed, vec!["vr1".to_string()]);
        assert!(report.unchanged.is_empty());

        assert!(scheduler.engine().instances.get(vr1).retired);
        assert!(!scheduler.engine().sockets.contains_key(&vr1));
        let vr2 = scheduler.engine().instances.find_by_name("vr2").unwrap();
        assert!(!scheduler.engine().instances.get(vr2).retired);
    }
}
