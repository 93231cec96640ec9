//! Virtual Router Redundancy Protocol (VRRP) failover daemon core
//!
//! Implements RFC 5798 (VRRPv3, IPv4 and IPv6) and RFC 3768 (VRRPv2) instance
//! election, layered with a sync-group coordinator that makes a set of
//! virtual routers transition together as one unit.
//!
//! # Layout
//!
//! - [`types`] — `VirtualRouter`, `SyncGroup`, and the shared enums/constants.
//! - [`packet`] — wire encode/decode and checksum for both protocol versions.
//! - [`clock`] — the `ClockSource` boundary and the scheduler's timer wheel.
//! - [`advert`] — the raw multicast send/receive socket and its `AdvertTransport` seam.
//! - [`vip`] — the `VipBackend` boundary for installing/removing/announcing VIPs.
//! - [`track`] — the `TrackProbe` boundary and its interface/script/route/file sources.
//! - [`notify`] — the `NotifySink` boundary and bounded-concurrency dispatcher.
//! - [`registry`] — `Vec`-backed instance and sync-group storage, indexed by id.
//! - [`fsm`] — per-instance state transitions and advertisement processing.
//! - [`sync`] — sync-group resolution, gating, and propagation.
//! - [`scheduler`] — the single-task event loop tying everything together.
//! - [`config`] — typed, validated, JSON-loadable daemon configuration.
//! - [`error`] — this crate's error taxonomy.
//!
//! # Example
//!
//! ```no_run
//! use vrrp::clock::SystemClock;
//! use vrrp::config::DaemonConfig;
//! use vrrp::notify::{Notifier, ScriptNotifySink};
//! use vrrp::scheduler::{bind_advert_sockets, Engine, Scheduler};
//! use vrrp::vip::ShellVipBackend;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DaemonConfig::load_from_file("/etc/vrrpd/config.json")?;
//! let (instances, groups, trackers) = config.build(vrrp::clock::MonotonicInstant::ZERO);
//!
//! let clock = Arc::new(SystemClock::new());
//! let vip = Arc::new(ShellVipBackend::new());
//! let notifier = Arc::new(Notifier::new(Arc::new(ScriptNotifySink::new()), 4));
//!
//! let mut engine = Engine::new(clock, vip, notifier);
//! engine.instances = instances;
//! engine.groups = groups;
//! engine.trackers = trackers;
//! bind_advert_sockets(&mut engine)?;
//!
//! let mut scheduler = Scheduler::new(engine, config.track_poll_interval());
//! scheduler.start().await?;
//! loop {
//!     scheduler.tick().await?;
//! }
//! # }
//! ```

pub mod advert;
pub mod clock;
pub mod config;
pub mod error;
pub mod fsm;
pub mod notify;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod sync;
pub mod track;
pub mod types;
pub mod vip;

pub use config::DaemonConfig;
pub use error::VrrpError;
pub use scheduler::{Engine, ReloadReport, Scheduler};
pub use types::{SyncGroup, VirtualRouter, VrrpState};
