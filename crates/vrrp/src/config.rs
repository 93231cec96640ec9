//! Typed, validated in-memory configuration surface (spec §7 ambient
//! expansion). This crate does not parse keepalived's config-file grammar —
//! that parser is explicitly out of scope (spec §1) — but a `Daemon` still
//! needs something concrete to build its registries from, so `DaemonConfig`
//! is `serde::Deserialize`, loadable from a plain JSON file.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::MonotonicInstant;
use crate::registry::{GroupRegistry, InstanceRegistry};
use crate::sync;
use crate::track::{FileProbe, InterfaceProbe, RouteProbe, ScriptProbe, Tracker};
use crate::types::{AddressFamily, VirtualRouter, VRRP_VERSION_V3};

/// Errors raised while loading or validating a `DaemonConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

/// One tracked source, as configured (spec §4.3). Mirrors the four
/// `TrackProbe` kinds one to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackConfig {
    Interface {
        interface: String,
        weight: i32,
        #[serde(default)]
        is_fault: bool,
    },
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        weight: i32,
        #[serde(default)]
        is_fault: bool,
    },
    Route {
        destination: String,
        weight: i32,
        #[serde(default)]
        is_fault: bool,
    },
    File {
        path: String,
        #[serde(default)]
        fault_on_present: bool,
        weight: i32,
        #[serde(default)]
        is_fault: bool,
    },
}

impl TrackConfig {
    pub(crate) fn build_probe(&self) -> Box<dyn crate::track::TrackProbe> {
        match self {
            TrackConfig::Interface { interface, weight, is_fault } => {
                Box::new(InterfaceProbe::new(interface, *weight, *is_fault))
            }
            TrackConfig::Script { command, args, weight, is_fault } => {
                Box::new(ScriptProbe::new(command.clone(), command.clone(), args.clone(), *weight, *is_fault))
            }
            TrackConfig::Route { destination, weight, is_fault } => {
                Box::new(RouteProbe::new(destination, *weight, *is_fault))
            }
            TrackConfig::File { path, fault_on_present, weight, is_fault } => {
                Box::new(FileProbe::new(path, *fault_on_present, *weight, *is_fault))
            }
        }
    }
}

/// One virtual router, as configured (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub vrid: u8,
    #[serde(default = "default_version")]
    pub version: u8,
    pub interface: String,
    pub primary_ip: IpAddr,
    pub vips: Vec<IpAddr>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_advert_interval")]
    pub advert_interval: u16,
    #[serde(default = "default_true")]
    pub preempt: bool,
    #[serde(default)]
    pub accept_mode: bool,
    #[serde(default)]
    pub tracks: Vec<TrackConfig>,
}

fn default_version() -> u8 {
    VRRP_VERSION_V3
}

fn default_priority() -> u8 {
    100
}

fn default_advert_interval() -> u16 {
    100
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    /// Per-instance checks (spec §3 invariants 1-4): vrid range, priority
    /// range, non-empty vips, and every vip matching the instance's address
    /// family (derived from `primary_ip`).
    fn validate(&self) -> Result<(), ConfigError> {
        if self.vrid == 0 {
            return Err(invalid(format!("instance {}: vrid must be 1-255", self.name)));
        }
        if self.priority == 0 {
            return Err(invalid(format!("instance {}: priority 0 is reserved for resignation on the wire, not configuration", self.name)));
        }
        if self.vips.is_empty() {
            return Err(invalid(format!("instance {}: at least one vip is required", self.name)));
        }
        let family = AddressFamily::of(self.primary_ip);
        if self.vips.iter().any(|vip| !family.matches(*vip)) {
            return Err(invalid(format!("instance {}: vips must all match the primary_ip's address family", self.name)));
        }
        Ok(())
    }
}

/// A sync group, as configured (spec §4.2): a name plus the member instance
/// names it binds together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<String>,
}

/// Top-level daemon configuration (spec §7 ambient expansion / §9 binary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default = "default_track_poll_interval_ms")]
    pub track_poll_interval_ms: u64,
}

fn default_track_poll_interval_ms() -> u64 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            groups: Vec::new(),
            track_poll_interval_ms: default_track_poll_interval_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: DaemonConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn track_poll_interval(&self) -> Duration {
        Duration::from_millis(self.track_poll_interval_ms)
    }

    /// Cross-instance checks: unique names, unique `(interface, vrid,
    /// family)` triples (spec §3 invariant 5: "no two instances share an
    /// interface+vrid+family"), and every group member name resolving to a
    /// configured instance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_names = std::collections::HashSet::new();
        let mut seen_triples = std::collections::HashSet::new();

        for instance in &self.instances {
            instance.validate()?;
            if !seen_names.insert(instance.name.clone()) {
                return Err(invalid(format!("duplicate instance name: {}", instance.name)));
            }
            let family = AddressFamily::of(instance.primary_ip);
            let triple = (instance.interface.clone(), instance.vrid, matches!(family, AddressFamily::V6));
            if !seen_triples.insert(triple) {
                return Err(invalid(format!(
                    "duplicate (interface, vrid, family) for instance {}: {}/{}",
                    instance.name, instance.interface, instance.vrid
                )));
            }
        }

        for group in &self.groups {
            if group.members.is_empty() {
                return Err(invalid(format!("group {}: must name at least one member", group.name)));
            }
            for member in &group.members {
                if !self.instances.iter().any(|i| &i.name == member) {
                    return Err(invalid(format!("group {}: member {} is not a configured instance", group.name, member)));
                }
            }
        }

        Ok(())
    }

    /// Build an `InstanceRegistry`/`GroupRegistry`/per-instance `Tracker` map
    /// from this config. Groups are resolved after every instance exists, so
    /// member names always find their target (spec §4.2's
    /// `vrrp_sync_set_group` ordering).
    pub fn build(&self, now: MonotonicInstant) -> (InstanceRegistry, GroupRegistry, std::collections::HashMap<crate::types::VirtualRouterId, Tracker>) {
        let mut instances = InstanceRegistry::new();
        let mut groups = GroupRegistry::new();
        let mut trackers = std::collections::HashMap::new();

        for cfg in &self.instances {
            let family = AddressFamily::of(cfg.primary_ip);
            let id = instances.insert(|id| {
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
                trackers.insert(id, tracker);
            }
        }

        for group in &self.groups {
            sync::resolve_group(&mut groups, &mut instances, &group.name, &group.members);
        }

        (instances, groups, trackers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance(name: &str, vrid: u8) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            vrid,
            version: VRRP_VERSION_V3,
            interface: "eth0".to_string(),
            primary_ip: "10.0.0.1".parse().unwrap(),
            vips: vec!["10.0.0.100".parse().unwrap()],
            priority: 100,
            advert_interval: 100,
            preempt: true,
            accept_mode: false,
            tracks: Vec::new(),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_instance_names() {
        let config = DaemonConfig {
            instances: vec![sample_instance("vr1", 1), sample_instance("vr1", 2)],
            groups: Vec::new(),
            track_poll_interval_ms: 1000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_interface_vrid_family() {
        let config = DaemonConfig {
            instances: vec![sample_instance("vr1", 1), sample_instance("vr2", 1)],
            groups: Vec::new(),
            track_poll_interval_ms: 1000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_vip_family_mismatch() {
        let mut instance = sample_instance("vr1", 1);
        instance.vips = vec!["fe80::100".parse().unwrap()];
        let config = DaemonConfig {
            instances: vec![instance],
            groups: Vec::new(),
            track_poll_interval_ms: 1000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_group_with_unknown_member() {
        let config = DaemonConfig {
            instances: vec![sample_instance("vr1", 1)],
            groups: vec![GroupConfig { name: "g1".to_string(), members: vec!["missing".to_string()] }],
            track_poll_interval_ms: 1000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_resolves_group_membership() {
        let config = DaemonConfig {
            instances: vec![sample_instance("vr1", 1), sample_instance("vr2", 2)],
            groups: vec![GroupConfig {
                name: "g1".to_string(),
                members: vec!["vr1".to_string(), "vr2".to_string()],
            }],
            track_poll_interval_ms: 1000,
        };
        assert!(config.validate().is_ok());

        let (instances, groups, _) = config.build(MonotonicInstant::ZERO);
        assert_eq!(groups.len(), 1);
        let vr1 = instances.find_by_name("vr1").unwrap();
        assert!(instances.get(vr1).sync.is_some());
    }

    #[test]
    fn parses_from_json() {
        let json = r#"{
            "instances": [
                {
                    "name": "vr1",
                    "vrid": 1,
                    "interface": "eth0",
                    "primary_ip": "10.0.0.1",
                    "vips": ["10.0.0.100"]
                }
            ],
            "groups": []
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.instances[0].priority, 100);
        assert_eq!(config.instances[0].advert_interval, 100);
    }
}
