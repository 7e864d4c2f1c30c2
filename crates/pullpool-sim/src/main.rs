use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use pullpool::{Pool, PoolConfig, UseError};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: pullpool-sim [--limit <n>] [--requests <n>] [--work-ms <ms>] [--fail-every <k>] [--shrink-to <n>]";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SimArgs {
    limit: usize,
    requests: usize,
    work_ms: u64,
    fail_every: usize,
    shrink_to: Option<usize>,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            limit: pullpool::DEFAULT_LIMIT,
            requests: 8,
            work_ms: 50,
            fail_every: 0,
            shrink_to: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    limit: usize,
    requests: usize,
    created: usize,
    destroyed: usize,
    succeeded: usize,
    failed: usize,
    peak_busy: usize,
}

#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
}

/// Stand-in for an expensive resource such as a connection.
struct SimWorker {
    id: usize,
    served: usize,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let sim = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --limit <n>        Pool concurrency limit [default: 1]");
            eprintln!("  --requests <n>     Number of requests to submit [default: 8]");
            eprintln!("  --work-ms <ms>     Time each request holds its instance [default: 50]");
            eprintln!("  --fail-every <k>   Fail every k-th request, 0 for never [default: 0]");
            eprintln!("  --shrink-to <n>    Lower the limit to n while requests are running");
            process::exit(2);
        }
    };

    init_tracing();

    match run(sim).await {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: JSON serialization failed: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("POOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pullpool={level},pullpool_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<SimArgs, String> {
    let mut sim = SimArgs::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--limit" | "--requests" | "--work-ms" | "--fail-every" | "--shrink-to" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                let value: u64 = raw
                    .parse()
                    .map_err(|_| format!("{flag} expects a non-negative integer, got '{raw}'"))?;
                let count = usize::try_from(value)
                    .map_err(|_| format!("{flag} value {value} is out of range"))?;
                match flag {
                    "--limit" => sim.limit = count,
                    "--requests" => sim.requests = count,
                    "--work-ms" => sim.work_ms = value,
                    "--fail-every" => sim.fail_every = count,
                    _ => sim.shrink_to = Some(count),
                }
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(sim)
}

async fn run(sim: SimArgs) -> anyhow::Result<Summary> {
    let stats = Arc::new(Stats::default());

    let creator_stats = Arc::clone(&stats);
    let pool = Pool::new(
        move || {
            let id = creator_stats.created.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, std::io::Error>(SimWorker { id, served: 0 })
            }
        },
        PoolConfig::new().with_limit(sim.limit),
    )
    .context("invalid pool configuration")?;

    let destroy_stats = Arc::clone(&stats);
    pool.set_destructor(move |worker: SimWorker| {
        let stats = Arc::clone(&destroy_stats);
        async move {
            tracing::debug!(worker = worker.id, served = worker.served, "Worker shut down");
            stats.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    });

    tracing::info!(
        limit = sim.limit,
        requests = sim.requests,
        work_ms = sim.work_ms,
        "Starting simulation"
    );

    let handles: Vec<_> = (1..=sim.requests)
        .map(|n| {
            let stats = Arc::clone(&stats);
            let fail = sim.fail_every > 0 && n % sim.fail_every == 0;
            let work_ms = sim.work_ms;
            pool.submit(move |worker: &mut SimWorker| {
                Box::pin(async move {
                    let now = stats.busy.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.peak_busy.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    stats.busy.fetch_sub(1, Ordering::SeqCst);

                    if fail {
                        return Err(anyhow::anyhow!(
                            "request {n} failed on worker {}",
                            worker.id
                        ));
                    }
                    worker.served += 1;
                    Ok(worker.id)
                })
            })
        })
        .collect();

    if let Some(target) = sim.shrink_to {
        tokio::time::sleep(Duration::from_millis(sim.work_ms / 2)).await;
        pool.set_limit(target)
            .with_context(|| format!("cannot shrink pool to {target}"))?;
    }

    let mut succeeded = 0;
    let mut failed = 0;
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(worker) => {
                tracing::trace!(worker, "Request served");
                succeeded += 1;
            }
            Err(UseError::Work(e)) => {
                tracing::warn!(error = %e, "Request failed");
                failed += 1;
            }
            Err(e) => bail!(e.to_string()),
        }
    }

    pool.destruct().await;

    let summary = Summary {
        limit: pool.limit(),
        requests: sim.requests,
        created: stats.created.load(Ordering::SeqCst),
        destroyed: stats.destroyed.load(Ordering::SeqCst),
        succeeded,
        failed,
        peak_busy: stats.peak_busy.load(Ordering::SeqCst),
    };
    tracing::info!(?summary, "Simulation finished");
    Ok(summary)
}
