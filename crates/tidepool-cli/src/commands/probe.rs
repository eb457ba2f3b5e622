use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tidepool::{ConnectionBroker, PoolConfig, PoolStats, TcpConnectionFactory, TlsConfig};
use tidepool_core::TargetConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub count: u32,
    pub timeout: Option<Duration>,
    pub insecure: bool,
}

/// Timings for one acquire/release cycle.
#[derive(Debug, Clone, serde::Serialize)]
struct Cycle {
    connection_id: u64,
    acquire_ms: f64,
    healthy: bool,
    tls: bool,
}

pub async fn probe(
    path: &Path,
    name: &str,
    options: &ProbeOptions,
    format: &str,
) -> anyhow::Result<()> {
    let (file, pool) = super::load(path)?;
    let target = file.target(name)?.clone();

    let (cycles, stats) = run(pool, &target, options).await?;

    match format {
        "json" => {
            let report = serde_json::json!({
                "target": name,
                "identity": target.identity().to_string(),
                "cycles": cycles,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("probing {name} ({})", target.identity());
            for (i, cycle) in cycles.iter().enumerate() {
                println!(
                    "  #{:<3} conn {:<4} acquired in {:>8.2} ms  {}{}",
                    i + 1,
                    cycle.connection_id,
                    cycle.acquire_ms,
                    if cycle.healthy { "healthy" } else { "UNHEALTHY" },
                    if cycle.tls { " tls" } else { "" },
                );
            }
            println!(
                "pool: created={} closed={} idle={} waits={} timeouts={}",
                stats.created_count, stats.closed_count, stats.idle, stats.wait_count, stats.timeout_count
            );
        }
    }
    Ok(())
}

async fn run(
    pool: PoolConfig,
    target: &TargetConfig,
    options: &ProbeOptions,
) -> anyhow::Result<(Vec<Cycle>, PoolStats)> {
    let broker = ConnectionBroker::start(pool, Arc::new(factory(options.insecure)?));
    let identity = target.identity();
    let mut cycles = Vec::with_capacity(options.count as usize);

    for _ in 0..options.count {
        let started = Instant::now();
        let acquired = broker.acquire(target, options.timeout).await;
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(err) => {
                broker.shutdown().await;
                return Err(err).with_context(|| format!("failed to acquire a connection to {identity}"));
            }
        };
        let acquire_ms = started.elapsed().as_secs_f64() * 1000.0;

        let healthy = conn.check_health().await;
        if !healthy {
            conn.mark_broken();
        }
        cycles.push(Cycle {
            connection_id: conn.id(),
            acquire_ms,
            healthy,
            tls: conn.is_tls(),
        });
        broker.release(conn).await;
    }

    broker.log_stats();
    let stats = broker.pool_stats(Some(&identity)).unwrap_or_default();
    let outstanding = broker.shutdown().await;
    if outstanding > 0 {
        tracing::warn!(outstanding, "connections still borrowed at shutdown");
    }
    Ok((cycles, stats))
}

fn factory(insecure: bool) -> anyhow::Result<TcpConnectionFactory> {
    let tls = if insecure {
        TlsConfig::insecure_no_verify()
    } else {
        TlsConfig::with_webpki_roots()
    }
    .map_err(anyhow::Error::msg)
    .context("failed to build tls configuration")?;
    Ok(TcpConnectionFactory::with_tls(CONNECT_TIMEOUT, tls))
}
