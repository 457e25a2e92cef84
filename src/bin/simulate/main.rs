mod server;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use healthprobe::{Backend, Poller, ProbeSpec, WorkerPool};
use server::{Behavior, OriginServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Backend health poller simulation")]
struct Args {
    /// Number of simulated origin servers
    #[arg(short, long, default_value_t = 8)]
    backends: usize,

    /// Fraction of origins that always fail
    #[arg(long, default_value_t = 0.25)]
    sick_fraction: f64,

    /// Fraction of origins that accept but never answer
    #[arg(long, default_value_t = 0.1)]
    stall_fraction: f64,

    /// Failure percentage for the remaining, flaky origins
    #[arg(long, default_value_t = 20)]
    flaky_percent: u32,

    /// Mean simulated service latency in milliseconds
    #[arg(short, long, default_value_t = 10.0)]
    latency: f64,

    /// Probe interval in milliseconds
    #[arg(short, long, default_value_t = 500)]
    interval: u64,

    /// Probe timeout in milliseconds
    #[arg(short, long, default_value_t = 250)]
    timeout: u64,

    /// Probes considered for health classification
    #[arg(long, default_value_t = 8)]
    window: u32,

    /// Happy probes required within the window
    #[arg(long, default_value_t = 3)]
    threshold: u32,

    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 15)]
    duration: u64,

    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    report_every: u64,

    /// Render full bitmap details in the status reports
    #[arg(long)]
    details: bool,

    /// Worker threads executing probes
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn pick_behavior(idx: usize, args: &Args) -> Behavior {
    let sick = (args.backends as f64 * args.sick_fraction) as usize;
    let stalling = (args.backends as f64 * args.stall_fraction) as usize;
    if idx < sick {
        Behavior::Sick
    } else if idx < sick + stalling {
        Behavior::Stalling
    } else if args.flaky_percent > 0 {
        Behavior::Flaky(args.flaky_percent)
    } else {
        Behavior::Healthy
    }
}

fn report(poller: &Poller, fleet: &[(OriginServer, Arc<Backend>)], details: bool) -> Result<()> {
    for (origin, backend) in fleet {
        let mut out = Vec::new();
        poller.status(&mut out, backend, details)?;
        let status = String::from_utf8_lossy(&out);
        if details {
            println!(
                "--- {} ({:?}, {} requests seen, healthy={})",
                backend.name(),
                origin.behavior,
                origin.hits(),
                backend.is_healthy()
            );
            print!("{}", status);
        } else {
            println!(
                "{}  {:?}  healthy={}  {}",
                backend.name(),
                origin.behavior,
                backend.is_healthy(),
                status
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    flexi_logger::Logger::with_env_or_str("info")
        .start()
        .expect("failed to initialize logger");
    let args = Args::parse();

    let pool = Arc::new(WorkerPool::new(args.workers, args.backends * 2 + 8));
    let poller = Poller::new(pool);

    let mut fleet = Vec::with_capacity(args.backends);
    for idx in 0..args.backends {
        let origin = OriginServer::spawn(pick_behavior(idx, &args), args.latency);
        let backend = Arc::new(Backend::with_address(format!("origin{:02}", idx), origin.addr));
        let spec = ProbeSpec {
            interval: Duration::from_millis(args.interval),
            timeout: Duration::from_millis(args.timeout),
            window: args.window,
            threshold: args.threshold,
            ..Default::default()
        };
        let host = backend.name().to_string();
        poller.insert(&backend, spec, Some(&host));
        fleet.push((origin, backend));
    }

    println!(
        "Probing {} origins every {}ms (timeout {}ms, window {}, threshold {})",
        args.backends, args.interval, args.timeout, args.window, args.threshold
    );

    let started = Instant::now();
    let total = Duration::from_secs(args.duration);
    let report_every = Duration::from_secs(args.report_every.max(1));
    while started.elapsed() < total {
        let remaining = total.saturating_sub(started.elapsed());
        thread::sleep(remaining.min(report_every));
        println!();
        println!("t+{:.0}s", started.elapsed().as_secs_f64());
        report(&poller, &fleet, args.details)?;
    }

    let healthy = fleet.iter().filter(|(_, b)| b.is_healthy()).count();
    println!();
    println!("final: {}/{} backends healthy", healthy, fleet.len());

    for (_, backend) in &fleet {
        poller.remove(backend);
    }
    Ok(())
}
