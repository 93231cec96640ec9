//! VRRP failover daemon binary.
//!
//! Thin operator-facing wiring around `vrrp::Scheduler`: load a JSON config,
//! build the registries, bind real sockets, and run until `Ctrl+C`, then
//! resign gracefully. The protocol and coordination logic all live in the
//! `vrrp` library crate; this binary only owns the process lifecycle.

use std::env;
use std::sync::Arc;

use tracing::{error, info};

use vrrp::clock::{MonotonicInstant, SystemClock};
use vrrp::config::DaemonConfig;
use vrrp::notify::{Notifier, ScriptNotifySink};
use vrrp::scheduler::{bind_advert_sockets, Engine, Scheduler};
use vrrp::vip::ShellVipBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::logging::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            info!(path, "loading configuration");
            DaemonConfig::load_from_file(&path)?
        }
        None => {
            info!("no configuration file given, running with an empty config");
            DaemonConfig::default()
        }
    };

    let (instances, groups, trackers) = config.build(MonotonicInstant::ZERO);
    info!(instances = instances.len(), groups = groups.len(), "configuration resolved");

    let clock = Arc::new(SystemClock::new());
    let vip = Arc::new(ShellVipBackend::new());
    let notifier = Arc::new(Notifier::new(Arc::new(ScriptNotifySink::new()), 8));

    let mut engine = Engine::new(clock, vip, notifier);
    engine.instances = instances;
    engine.groups = groups;
    engine.trackers = trackers;

    if let Err(e) = bind_advert_sockets(&mut engine) {
        error!(error = %e, "failed to bind advertisement sockets");
        return Err(Box::new(e));
    }

    let mut scheduler = Scheduler::new(engine, config.track_poll_interval());
    scheduler.start().await?;

    info!("vrrpd running");
    loop {
        tokio::select! {
            result = scheduler.tick() => {
                if let Err(e) = result {
                    error!(error = %e, "scheduler tick failed");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    scheduler.shutdown().await?;
    Ok(())
}
