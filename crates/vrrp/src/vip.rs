//! Interface & VIP Adapter (spec §4.4, §6: `VipBackend`).
//!
//! Installs/removes virtual IPs and emits gratuitous ARP / unsolicited
//! neighbor advertisements on becoming master. The actual netlink wiring to
//! add/remove kernel addresses is the "network-manipulation primitive"
//! spec §1 places out of scope; `ShellVipBackend` is a minimal concrete
//! stand-in (shells out to `ip`) so the crate is runnable end to end, while
//! `FakeVipBackend` is what the FSM/sync-group test suite actually drives
//! against.

use std::collections::HashSet;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Typed failure kinds for VIP install/remove (spec §6).
#[derive(Debug, Clone, thiserror::Error)]
pub enum VipError {
    #[error("address already in use on another interface")]
    InUse,
    #[error("insufficient permission")]
    NoPermission,
    #[error("interface does not exist")]
    NoInterface,
    #[error("transient failure: {0}")]
    Transient(String),
}

pub type VipResult<T> = Result<T, VipError>;

/// Capability interface the FSM calls into on Master/Backup/Fault
/// transitions (spec §4.4, §6).
#[async_trait]
pub trait VipBackend: Send + Sync {
    async fn install(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()>;
    async fn remove(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()>;
    async fn announce(&self, interface: &str, vips: &[IpAddr], count: u32, spacing: Duration);
}

/// In-memory fake used by tests: records what would have happened instead
/// of touching the kernel.
#[derive(Default)]
pub struct FakeVipBackend {
    installed: Mutex<HashSet<(String, IpAddr)>>,
    announce_calls: Mutex<Vec<(String, Vec<IpAddr>, u32)>>,
    fail_install_for: Mutex<HashSet<IpAddr>>,
}

impl FakeVipBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `install` call for this address fail with `InUse`,
    /// simulating spec §4.1's "EEXIST on another interface" case.
    pub fn fail_install(&self, addr: IpAddr) {
        self.fail_install_for.lock().unwrap().insert(addr);
    }

    pub fn is_installed(&self, interface: &str, vip: IpAddr) -> bool {
        self.installed
            .lock()
            .unwrap()
            .contains(&(interface.to_string(), vip))
    }

    pub fn installed_count(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    pub fn announce_count(&self) -> usize {
        self.announce_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl VipBackend for FakeVipBackend {
    async fn install(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()> {
        let mut fail_set = self.fail_install_for.lock().unwrap();
        for vip in vips {
            if fail_set.remove(vip) {
                return Err(VipError::InUse);
            }
        }
        drop(fail_set);

        let mut installed = self.installed.lock().unwrap();
        for vip in vips {
            installed.insert((interface.to_string(), *vip));
        }
        Ok(())
    }

    async fn remove(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()> {
        let mut installed = self.installed.lock().unwrap();
        for vip in vips {
            installed.remove(&(interface.to_string(), *vip));
        }
        Ok(())
    }

    async fn announce(&self, interface: &str, vips: &[IpAddr], count: u32, _spacing: Duration) {
        self.announce_calls
            .lock()
            .unwrap()
            .push((interface.to_string(), vips.to_vec(), count));
    }
}

/// Shells out to the system `ip` binary. This is a minimal concrete
/// backend, not a replacement for a proper rtnetlink implementation —
/// spec §1 places VIP/route installation internals out of scope.
pub struct ShellVipBackend;

impl ShellVipBackend {
    pub fn new() -> Self {
        Self
    }

    async fn run_ip(args: &[&str]) -> VipResult<()> {
        let output = Command::new("ip")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| VipError::Transient(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Permission denied") {
            Err(VipError::NoPermission)
        } else if stderr.contains("Cannot find device") {
            Err(VipError::NoInterface)
        } else if stderr.contains("File exists") {
            Err(VipError::InUse)
        } else {
            Err(VipError::Transient(stderr.trim().to_string()))
        }
    }
}

impl Default for ShellVipBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VipBackend for ShellVipBackend {
    async fn install(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()> {
        for vip in vips {
            Self::run_ip(&["addr", "add", &format!("{vip}/32"), "dev", interface]).await?;
        }
        Ok(())
    }

    async fn remove(&self, interface: &str, vips: &[IpAddr]) -> VipResult<()> {
        for vip in vips {
            if let Err(e) = Self::run_ip(&["addr", "del", &format!("{vip}/32"), "dev", interface]).await {
                warn!(?e, %vip, interface, "failed to remove VIP");
            }
        }
        Ok(())
    }

    async fn announce(&self, interface: &str, vips: &[IpAddr], count: u32, spacing: Duration) {
        for _ in 0..count {
            for vip in vips {
                debug!(%vip, interface, "sending gratuitous ARP / unsolicited NA");
                send_neighbor_announcement(interface, *vip).await;
            }
            tokio::time::sleep(spacing).await;
        }
    }
}

/// Send a single gratuitous ARP (IPv4) or unsolicited neighbor
/// advertisement (IPv6) for `vip` on `interface` by invoking the standard
/// `arping`/`ndisc6` tools. Crafting the raw Ethernet/ARP or ICMPv6 ND
/// frames ourselves is exactly the kind of packet-I/O detail spec §1 places
/// out of scope; best-effort, failures (including the tool being absent)
/// are logged and otherwise ignored, matching spec §7's treatment of
/// announce-side effects.
async fn send_neighbor_announcement(interface: &str, vip: IpAddr) {
    let result = match vip {
        IpAddr::V4(addr) => {
            Command::new("arping")
                .args(["-U", "-c", "1", "-I", interface, &addr.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        }
        IpAddr::V6(addr) => {
            Command::new("ndisc6")
                .args(["-q", "-s", &addr.to_string(), interface])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
        }
    };

    if let Err(e) = result {
        warn!(%vip, interface, error = ?e, "failed to send neighbor announcement");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_backend_tracks_installed_vips() {
        let backend = FakeVipBackend::new();
        let vip: IpAddr = "10.0.0.100".parse().unwrap();
        backend.install("eth0", &[vip]).await.unwrap();
        assert!(backend.is_installed("eth0", vip));

        backend.remove("eth0", &[vip]).await.unwrap();
        assert!(!backend.is_installed("eth0", vip));
    }

    #[tokio::test]
    async fn fake_backend_honors_injected_failure() {
        let backend = FakeVipBackend::new();
        let vip: IpAddr = "10.0.0.100".parse().unwrap();
        backend.fail_install(vip);

        let result = backend.install("eth0", &[vip]).await;
        assert!(matches!(result, Err(VipError::InUse)));
        assert!(!backend.is_installed("eth0", vip));

        // The injected failure is one-shot.
        backend.install("eth0", &[vip]).await.unwrap();
        assert!(backend.is_installed("eth0", vip));
    }

    #[tokio::test]
    async fn fake_backend_records_announce_calls() {
        let backend = FakeVipBackend::new();
        let vip: IpAddr = "10.0.0.100".parse().unwrap();
        backend
            .announce("eth0", &[vip], 3, Duration::from_millis(1))
            .await;
        assert_eq!(backend.announce_count(), 1);
    }
}
