//! VRRP data types and structures.
//!
//! Based on RFC 5798: Virtual Router Redundancy Protocol (VRRP) Version 3,
//! with the sync-group extensions this workspace layers on top (see
//! `crate::sync`).

use std::net::IpAddr;
use std::time::Duration;

use crate::clock::MonotonicInstant;

/// VRRP protocol version 3 (RFC 5798).
pub const VRRP_VERSION_V3: u8 = 3;
/// VRRP protocol version 2 (RFC 3768), still seen on the wire.
pub const VRRP_VERSION_V2: u8 = 2;

/// VRRP IP protocol number (IANA).
pub const VRRP_PROTOCOL: u8 = 112;

/// VRRP multicast address for IPv4.
pub const VRRP_MULTICAST_ADDR_V4: &str = "224.0.0.18";
/// VRRP multicast address for IPv6.
pub const VRRP_MULTICAST_ADDR_V6: &str = "ff02::12";

/// TTL/hop-limit required on send and receive (RFC 5798 §5.1.1.3/5.2.2).
pub const VRRP_REQUIRED_TTL: u8 = 255;

/// Default advertisement interval, in centiseconds (1 second).
pub const DEFAULT_ADVERT_INTERVAL: u16 = 100;

/// Priority value reserved for the address owner — always preempts, never
/// clamped, and forces an immediate Init -> Master transition.
pub const VRRP_PRIORITY_OWNER: u8 = 255;

/// Priority value meaning "master is resigning" on the wire.
pub const VRRP_PRIORITY_RESIGN: u8 = 0;

/// Opaque handle into the instance registry. Never a pointer: instances are
/// owned by `registry::InstanceRegistry`, and a `SyncGroup` only ever holds
/// `VirtualRouterId`s, per the cyclic-reference design note (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualRouterId(pub u32);

/// Opaque handle into the group registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncGroupId(pub u32);

/// Address family an instance is configured for. An instance's VIPs must
/// all match this family; mixed families on one instance are a
/// configuration error caught at resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        *self == AddressFamily::of(addr)
    }
}

/// VRRP instance state. `Fault` is not part of RFC 5798's own state diagram
/// but is required by the track subsystem and sync-group fault propagation
/// (spec §3/§4.1): a tracked resource failing must remove an instance from
/// election without simply freezing it in Backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrrpState {
    Init,
    Backup,
    Master,
    Fault,
}

impl std::fmt::Display for VrrpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VrrpState::Init => write!(f, "INIT"),
            VrrpState::Backup => write!(f, "BACKUP"),
            VrrpState::Master => write!(f, "MASTER"),
            VrrpState::Fault => write!(f, "FAULT"),
        }
    }
}

/// Why an instance (or group) last moved to Master, kept for SNMP-shaped
/// observability (spec §3: stats include "master-reason").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterReason {
    AddressOwner,
    MasterDownExpired,
    GroupPromotion,
    Preempted,
}

/// Per-instance counters (spec §3).
#[derive(Debug, Clone, Default)]
pub struct VrrpStats {
    pub adverts_sent: u64,
    pub adverts_received: u64,
    pub priority_zero_sent: u64,
    pub priority_zero_received: u64,
    pub master_transitions: u64,
    pub backup_transitions: u64,
    pub fault_transitions: u64,
    pub invalid_adverts: u64,
    pub checksum_errors: u64,
    pub last_master_reason: Option<MasterReason>,
}

/// One virtual router: a single `(vrid, interface, family)` election
/// participant, optionally joined to a sync group.
#[derive(Debug, Clone)]
pub struct VirtualRouter {
    pub id: VirtualRouterId,
    pub name: String,
    pub vrid: u8,
    /// Wire version to speak: `VRRP_VERSION_V2` or `VRRP_VERSION_V3`.
    pub version: u8,
    pub family: AddressFamily,
    pub interface: String,

    pub base_priority: u8,
    effective_priority: u8,
    /// Sum of track-subsystem priority deltas currently in effect.
    priority_delta: i32,

    pub advert_interval: u16,

    pub state: VrrpState,
    pub wantstate: VrrpState,

    pub sands: MonotonicInstant,

    pub vips: Vec<IpAddr>,
    pub evips: Vec<IpAddr>,

    pub sync: Option<SyncGroupId>,

    pub primary_ip: IpAddr,
    pub preempt: bool,
    pub accept_mode: bool,

    /// True once the track subsystem has reported at least one source down
    /// that has not yet recovered (spec §4.3).
    pub track_fault: bool,

    /// True once `reload` has dropped this instance from the running
    /// configuration. `InstanceRegistry` never compacts, so a retired
    /// instance keeps its id and stats; the scheduler simply stops
    /// scheduling it, polling its tracks, or binding it a socket.
    pub retired: bool,

    pub stats: VrrpStats,
}

impl VirtualRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: VirtualRouterId,
        name: impl Into<String>,
        vrid: u8,
        version: u8,
        family: AddressFamily,
        interface: impl Into<String>,
        base_priority: u8,
        advert_interval: u16,
        primary_ip: IpAddr,
        vips: Vec<IpAddr>,
        preempt: bool,
        accept_mode: bool,
        now: MonotonicInstant,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            vrid,
            version,
            family,
            interface: interface.into(),
            base_priority,
            effective_priority: base_priority,
            priority_delta: 0,
            advert_interval,
            state: VrrpState::Init,
            wantstate: VrrpState::Init,
            sands: now,
            vips,
            evips: Vec::new(),
            sync: None,
            primary_ip,
            preempt,
            accept_mode,
            track_fault: false,
            retired: false,
            stats: VrrpStats::default(),
        }
    }

    /// Priority 255 is the address owner: owns the VIP as its real address,
    /// always preempts, never clamped by track deltas (spec §3).
    pub fn is_owner(&self) -> bool {
        self.base_priority == VRRP_PRIORITY_OWNER
    }

    pub fn effective_priority(&self) -> u8 {
        self.effective_priority
    }

    /// Recompute `effective_priority` from `base_priority` and the current
    /// track delta, clamped to 1..254 unless this instance is the owner
    /// (spec §3: "clamped to 1..254 unless owner").
    pub fn recompute_effective_priority(&mut self) {
        if self.is_owner() {
            self.effective_priority = VRRP_PRIORITY_OWNER;
            return;
        }
        let raw = self.base_priority as i32 + self.priority_delta;
        self.effective_priority = raw.clamp(1, 254) as u8;
    }

    pub fn set_priority_delta(&mut self, delta: i32) {
        self.priority_delta = delta;
        self.recompute_effective_priority();
    }

    pub fn priority_delta(&self) -> i32 {
        self.priority_delta
    }

    /// Skew_Time = ((256 - priority) * advert_interval) / 256 (RFC 5798 §6.1).
    pub fn skew_time(&self) -> Duration {
        skew_time(self.effective_priority, self.advert_interval)
    }

    /// Master_Down_Interval = 3 * advert_interval + skew (RFC 5798 §6.1).
    pub fn master_down_interval(&self) -> Duration {
        master_down_interval(self.effective_priority, self.advert_interval)
    }

    pub fn advert_interval_duration(&self) -> Duration {
        centiseconds_to_duration(self.advert_interval)
    }

    /// Recompute and apply a new deadline, respecting invariant 5 (spec §3):
    /// sands must never regress behind `now`.
    pub fn reschedule(&mut self, now: MonotonicInstant, delay: Duration) {
        self.sands = now.saturating_add(delay);
    }
}

fn centiseconds_to_duration(centiseconds: u16) -> Duration {
    Duration::from_millis((centiseconds as u64) * 10)
}

pub(crate) fn skew_time(priority: u8, advert_interval: u16) -> Duration {
    let advert_ms = (advert_interval as u64) * 10;
    let skew_ms = ((256 - priority as u64) * advert_ms) / 256;
    Duration::from_millis(skew_ms)
}

pub(crate) fn master_down_interval(priority: u8, advert_interval: u16) -> Duration {
    let advert_ms = (advert_interval as u64) * 10;
    let skew = skew_time(priority, advert_interval);
    Duration::from_millis(3 * advert_ms) + skew
}

/// A set of virtual routers that transition together (spec §3/§4.2).
#[derive(Debug, Clone)]
pub struct SyncGroup {
    pub id: SyncGroupId,
    pub name: String,
    pub members: Vec<VirtualRouterId>,
    pub state: VrrpState,
}

impl SyncGroup {
    pub fn new(id: SyncGroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            members: Vec::new(),
            state: VrrpState::Init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicInstant;

    fn router(priority: u8, advert_interval: u16) -> VirtualRouter {
        VirtualRouter::new(
            VirtualRouterId(1),
            "r1",
            1,
            VRRP_VERSION_V3,
            AddressFamily::V4,
            "eth0",
            priority,
            advert_interval,
            "10.0.0.1".parse().unwrap(),
            vec!["10.0.0.100".parse().unwrap()],
            true,
            false,
            MonotonicInstant::ZERO,
        )
    }

    #[test]
    fn master_down_interval_matches_rfc_formula() {
        let r = router(100, 100);
        // skew = ((256-100)*1000)/256 = 609ms, total = 3609ms
        assert_eq!(r.master_down_interval(), Duration::from_millis(3609));
    }

    #[test]
    fn owner_priority_is_never_clamped_by_deltas() {
        let mut r = router(255, 100);
        r.set_priority_delta(-50);
        assert_eq!(r.effective_priority(), 255);
    }

    #[test]
    fn effective_priority_clamps_to_1_254() {
        let mut r = router(10, 100);
        r.set_priority_delta(-100);
        assert_eq!(r.effective_priority(), 1);

        let mut r2 = router(250, 100);
        r2.set_priority_delta(100);
        assert_eq!(r2.effective_priority(), 254);
    }

    #[test]
    fn reschedule_never_regresses_before_now() {
        let mut r = router(100, 100);
        let now = MonotonicInstant::ZERO.saturating_add(Duration::from_secs(10));
        r.reschedule(now, Duration::from_secs(1));
        assert!(r.sands >= now);
    }
}
