//! Track Subsystem (spec §4.3): interface, script, route and file probes
//! aggregated into a priority delta and a fault boolean per instance.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Result of evaluating one tracked source (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackResult {
    /// Priority adjustment this source currently contributes.
    pub weight: i32,
    /// True if this source is down and configured to force a fault rather
    /// than merely adjust priority.
    pub faulting: bool,
}

impl TrackResult {
    pub const UP: TrackResult = TrackResult { weight: 0, faulting: false };

    pub fn down(weight: i32, is_fault: bool) -> Self {
        Self { weight, faulting: is_fault }
    }
}

/// A single trackable source. Implementations are polled or pushed to by
/// whatever mechanism suits them (interface state is poll-driven here since
/// netlink event subscription is out of scope per spec §1; scripts are
/// poll-driven on their own interval).
#[async_trait]
pub trait TrackProbe: Send + Sync {
    /// Human-readable name for logging (e.g. "eth0", "check_bgp.sh").
    fn name(&self) -> &str;

    /// Evaluate current state. Returns `TrackResult::UP` when healthy.
    async fn evaluate(&self) -> TrackResult;
}

/// Tracks whether a kernel interface is administratively and/or physically
/// up, via sysfs (`/sys/class/net/<if>/operstate`), since netlink
/// subscriptions are out of scope (spec §1).
pub struct InterfaceProbe {
    name: String,
    interface: String,
    weight: i32,
    is_fault: bool,
}

impl InterfaceProbe {
    pub fn new(interface: impl Into<String>, weight: i32, is_fault: bool) -> Self {
        let interface = interface.into();
        Self {
            name: interface.clone(),
            interface,
            weight,
            is_fault,
        }
    }

    fn operstate_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/class/net/{}/operstate", self.interface))
    }
}

#[async_trait]
impl TrackProbe for InterfaceProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> TrackResult {
        match tokio::fs::read_to_string(self.operstate_path()).await {
            Ok(state) if state.trim() == "up" => TrackResult::UP,
            Ok(state) => {
                debug!(interface = %self.interface, operstate = %state.trim(), "tracked interface down");
                TrackResult::down(self.weight, self.is_fault)
            }
            Err(e) => {
                warn!(interface = %self.interface, error = %e, "failed to read interface operstate");
                TrackResult::down(self.weight, self.is_fault)
            }
        }
    }
}

/// Tracks the exit status of an external script, run on its own polling
/// cadence by the caller (spec §4.3: "script probes ... evaluated on an
/// independent interval").
pub struct ScriptProbe {
    name: String,
    command: String,
    args: Vec<String>,
    weight: i32,
    is_fault: bool,
}

impl ScriptProbe {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        weight: i32,
        is_fault: bool,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            weight,
            is_fault,
        }
    }
}

#[async_trait]
impl TrackProbe for ScriptProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> TrackResult {
        let result = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => TrackResult::UP,
            Ok(status) => {
                debug!(script = %self.command, code = ?status.code(), "track script exited non-zero");
                TrackResult::down(self.weight, self.is_fault)
            }
            Err(e) => {
                warn!(script = %self.command, error = %e, "failed to run track script");
                TrackResult::down(self.weight, self.is_fault)
            }
        }
    }
}

/// Tracks whether a route/rule is present in the kernel's routing table, via
/// `ip route get`/`ip rule list`, since raw rtnetlink queries are out of
/// scope (spec §1).
pub struct RouteProbe {
    name: String,
    destination: String,
    weight: i32,
    is_fault: bool,
}

impl RouteProbe {
    pub fn new(destination: impl Into<String>, weight: i32, is_fault: bool) -> Self {
        let destination = destination.into();
        Self {
            name: format!("route:{destination}"),
            destination,
            weight,
            is_fault,
        }
    }
}

#[async_trait]
impl TrackProbe for RouteProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> TrackResult {
        let result = Command::new("ip")
            .args(["route", "get", &self.destination])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => TrackResult::UP,
            Ok(_) => TrackResult::down(self.weight, self.is_fault),
            Err(e) => {
                warn!(destination = %self.destination, error = %e, "failed to query route");
                TrackResult::down(self.weight, self.is_fault)
            }
        }
    }
}

/// Tracks a file's mere presence (or absence), used for operator-driven
/// manual overrides (spec §4.3: "a sentinel file an operator can touch/rm to
/// force a fault without restarting the daemon").
pub struct FileProbe {
    name: String,
    path: PathBuf,
    /// If true, the file being *present* is the failure condition.
    fault_on_present: bool,
    weight: i32,
    is_fault: bool,
}

impl FileProbe {
    pub fn new(path: impl Into<PathBuf>, fault_on_present: bool, weight: i32, is_fault: bool) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
            fault_on_present,
            weight,
            is_fault,
        }
    }
}

#[async_trait]
impl TrackProbe for FileProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> TrackResult {
        let present = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let down = present == self.fault_on_present;
        if down {
            TrackResult::down(self.weight, self.is_fault)
        } else {
            TrackResult::UP
        }
    }
}

/// In-memory probe for tests: returns whatever `set_down`/`set_up` last
/// configured, avoiding any filesystem or process dependency.
pub struct FakeProbe {
    name: String,
    down: Arc<AtomicBool>,
    weight: i32,
    is_fault: bool,
}

impl FakeProbe {
    pub fn new(name: impl Into<String>, weight: i32, is_fault: bool) -> Self {
        Self {
            name: name.into(),
            down: Arc::new(AtomicBool::new(false)),
            weight,
            is_fault,
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrackProbe for FakeProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> TrackResult {
        if self.down.load(Ordering::SeqCst) {
            TrackResult::down(self.weight, self.is_fault)
        } else {
            TrackResult::UP
        }
    }
}

/// Aggregates a set of probes for one instance into the two signals the FSM
/// needs: a net priority delta and a fault boolean (spec §4.3: "sums of all
/// down sources' weights; a fault flag if any down source is configured to
/// force fault").
#[derive(Default)]
pub struct Tracker {
    probes: Vec<Box<dyn TrackProbe>>,
}

/// Outcome of evaluating every probe attached to an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    pub priority_delta: i32,
    pub faulted: bool,
}

impl Tracker {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn add(&mut self, probe: Box<dyn TrackProbe>) {
        self.probes.push(probe);
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Evaluate every probe concurrently and fold the results. A single slow
    /// probe does not block the others (spec §4.3: "evaluated independently,
    /// in parallel").
    pub async fn evaluate(&self) -> TrackOutcome {
        let results = futures::future::join_all(self.probes.iter().map(|p| async move {
            let result = p.evaluate().await;
            if result != TrackResult::UP {
                debug!(probe = p.name(), weight = result.weight, faulting = result.faulting, "track source down");
            }
            result
        }))
        .await;

        results.into_iter().fold(TrackOutcome::default(), |mut acc, r| {
            acc.priority_delta += r.weight;
            acc.faulted |= r.faulting;
            acc
        })
    }
}
