//! Notifier (spec §4.5): bounded-concurrency, per-scope-serialized dispatch
//! of state-transition scripts/events.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::types::VrrpState;

/// Scope a notification fires under. Instance and group transitions are
/// serialized independently so a slow instance script cannot delay a group
/// script for an unrelated group (spec §4.5: "serialized per scope, not
/// globally").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotifyScope {
    Instance(String),
    Group(String),
}

/// One transition notification.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub scope: NotifyScope,
    pub state: VrrpState,
}

/// Destination for fired notifications.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn notify(&self, event: &NotifyEvent);
}

/// Runs a configured script per scope, passing the new state as an
/// argument, matching keepalived's `notify_*` script convention.
pub struct ScriptNotifySink {
    scripts: HashMap<NotifyScope, String>,
}

impl ScriptNotifySink {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
        }
    }

    pub fn set_script(&mut self, scope: NotifyScope, path: impl Into<String>) {
        self.scripts.insert(scope, path.into());
    }
}

impl Default for ScriptNotifySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotifySink for ScriptNotifySink {
    async fn notify(&self, event: &NotifyEvent) {
        let Some(script) = self.scripts.get(&event.scope) else {
            return;
        };

        let state_arg = event.state.to_string().to_lowercase();
        let result = Command::new(script)
            .arg(&state_arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Err(e) = result {
            warn!(script, error = %e, "notify script failed to execute");
        }
    }
}

/// Recording sink used by the FSM/sync-group test suite: no process
/// spawning, just an append-only log of events in the order they fired.
#[derive(Default)]
pub struct RecordingNotifySink {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotifySink for RecordingNotifySink {
    async fn notify(&self, event: &NotifyEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// Dispatches notifications with bounded concurrency across scopes while
/// guaranteeing in-order, non-overlapping delivery within a single scope
/// (spec §4.5). Fire-and-forget from the caller's perspective: `notify`
/// returns once the event has been queued, not once the script exits.
///
/// Holds its sink as `Arc<dyn NotifySink>` rather than a generic parameter
/// so it can sit in the scheduler's non-generic `Engine` alongside the
/// other `Arc<dyn ...>` boundary traits.
pub struct Notifier {
    sink: Arc<dyn NotifySink>,
    concurrency: Arc<Semaphore>,
    scope_locks: Mutex<HashMap<NotifyScope, Arc<Mutex<()>>>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotifySink>, max_concurrency: usize) -> Self {
        Self {
            sink,
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            scope_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn scope_lock(&self, scope: &NotifyScope) -> Arc<Mutex<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Queue `event` for delivery. Spawns a task bounded by the shared
    /// concurrency semaphore; events within the same scope run in the order
    /// they were queued because each acquires that scope's lock before the
    /// global permit is released.
    pub async fn notify(&self, event: NotifyEvent) {
        let sink = self.sink.clone();
        let concurrency = self.concurrency.clone();
        let lock = self.scope_lock(&event.scope).await;

        tokio::spawn(async move {
            let _scope_guard = lock.lock().await;
            let _permit = match concurrency.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            sink.notify(&event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_event_to_sink() {
        let sink = Arc::new(RecordingNotifySink::new());
        let notifier = Notifier::new(sink.clone(), 4);

        notifier
            .notify(NotifyEvent {
                scope: NotifyScope::Instance("vr1".into()),
                state: VrrpState::Master,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, VrrpState::Master);
    }

    #[tokio::test]
    async fn same_scope_events_preserve_order() {
        let sink = Arc::new(RecordingNotifySink::new());
        let notifier = Notifier::new(sink.clone(), 4);

        for state in [VrrpState::Backup, VrrpState::Master, VrrpState::Fault] {
            notifier
                .notify(NotifyEvent {
                    scope: NotifyScope::Instance("vr1".into()),
                    state,
                })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sink.events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].state, VrrpState::Backup);
        assert_eq!(events[1].state, VrrpState::Master);
        assert_eq!(events[2].state, VrrpState::Fault);
    }
}
