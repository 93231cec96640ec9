//! Simple VRRP example
//!
//! Runs a single VRRP instance on the loopback interface and prints its
//! state/stats periodically.
//!
//! Usage:
//!   sudo target/release/examples/simple_vrrp [priority]
//!
//! Or with capabilities:
//!   sudo setcap cap_net_admin,cap_net_raw+ep target/release/examples/simple_vrrp
//!   target/release/examples/simple_vrrp [priority]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::interval;

use vrrp::clock::{MonotonicInstant, SystemClock};
use vrrp::config::{DaemonConfig, InstanceConfig};
use vrrp::notify::{Notifier, ScriptNotifySink};
use vrrp::scheduler::{bind_advert_sockets, Engine, Scheduler};
use vrrp::types::VrrpState;
use vrrp::vip::ShellVipBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("vrrp=info").init();

    let args: Vec<String> = env::args().collect();
    let priority: u8 = if args.len() > 1 {
        args[1].parse().unwrap_or(100)
    } else {
        100
    };

    println!("VRRP example node");
    println!("  VRID:            1");
    println!("  Priority:        {priority}");
    println!("  Interface:       lo (loopback)");
    println!("  Virtual IP:      127.0.10.1");
    println!("  Primary IP:      127.0.0.1");
    println!("  Advert interval: 1 second");
    println!();

    if priority == 255 {
        println!("priority 255 = address owner, immediate Master");
    } else {
        println!("starting as Backup, will become Master after master_down_interval");
    }
    println!();

    let config = DaemonConfig {
        instances: vec![InstanceConfig {
            name: "demo".to_string(),
            vrid: 1,
            version: 3,
            interface: "lo".to_string(),
            primary_ip: "127.0.0.1".parse()?,
            vips: vec!["127.0.10.1".parse()?],
            priority,
            advert_interval: 100,
            preempt: true,
            accept_mode: false,
            tracks: Vec::new(),
        }],
        groups: Vec::new(),
        track_poll_interval_ms: 1000,
    };
    config.validate()?;

    let (instances, groups, trackers) = config.build(MonotonicInstant::ZERO);

    let clock = Arc::new(SystemClock::new());
    let vip = Arc::new(ShellVipBackend::new());
    let notifier = Arc::new(Notifier::new(Arc::new(ScriptNotifySink::new()), 4));

    let mut engine = Engine::new(clock, vip, notifier);
    engine.instances = instances;
    engine.groups = groups;
    engine.trackers = trackers;

    bind_advert_sockets(&mut engine)?;
    println!("advertisement socket bound");

    let mut scheduler = Scheduler::new(engine, config.track_poll_interval());
    scheduler.start().await?;

    let vrid = scheduler.engine().instances.iter().next().unwrap().vrid;

    println!("Press Ctrl+C to shut down gracefully...");
    println!();

    let mut status = interval(Duration::from_secs(5));
    status.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            result = scheduler.tick() => {
                result?;
            }
            _ = status.tick() => {
                let vr = scheduler.engine().instances.iter().next().unwrap();
                println!("-- status --");
                println!("  state:              {}", vr.state);
                println!("  effective priority: {}", vr.effective_priority());
                println!("  master transitions: {}", vr.stats.master_transitions);
                println!("  backup transitions: {}", vr.stats.backup_transitions);
                println!("  adverts sent:       {}", vr.stats.adverts_sent);
                println!("  adverts received:   {}", vr.stats.adverts_received);
                println!("  invalid adverts:    {}", vr.stats.invalid_adverts);
                println!("  checksum errors:    {}", vr.stats.checksum_errors);
                println!();
            }
            _ = signal::ctrl_c() => {
                println!();
                println!("received shutdown signal, resigning gracefully...");
                break;
            }
        }
    }

    let was_master = scheduler.engine().instances.iter().any(|vr| vr.vrid == vrid && vr.state == VrrpState::Master);
    scheduler.shutdown().await?;
    if was_master {
        println!("vrid {vrid} resigned as master");
    }

    Ok(())
}
