use std::path::Path;

use tidepool::PoolConfig;
use tidepool_core::TidepoolConfig;

pub fn check(path: &Path, format: &str) -> anyhow::Result<()> {
    let (file, pool) = super::load(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report_json(&file, &pool))?),
        _ => println!("{}", report_text(&file, &pool)),
    }

    if file.targets.len() > pool.global_max_targets {
        tracing::warn!(
            targets = file.targets.len(),
            global_max_targets = pool.global_max_targets,
            "more targets configured than the registry keeps; expect LRU eviction"
        );
    }
    Ok(())
}

fn report_text(file: &TidepoolConfig, pool: &PoolConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "pool: size={} overflow={} (cap {}/target), global max {} connections / {} targets\n",
        pool.pool_size,
        pool.max_overflow,
        pool.capacity(),
        pool.global_max_connections,
        pool.global_max_targets,
    ));
    out.push_str(&format!(
        "      idle_timeout={:?} reaper_interval={:?} acquire_timeout={:?}\n",
        pool.idle_timeout, pool.reaper_interval, pool.acquire_timeout_default,
    ));

    if file.targets.is_empty() {
        out.push_str("no targets configured");
        return out;
    }
    out.push_str(&format!("{} target(s):", file.targets.len()));
    for (name, target) in &file.targets {
        out.push_str(&format!(
            "\n  ✓ {name}: {} [{}]",
            target.identity(),
            target.encryption
        ));
    }
    out
}

fn report_json(file: &TidepoolConfig, pool: &PoolConfig) -> serde_json::Value {
    let targets: serde_json::Map<String, serde_json::Value> = file
        .targets
        .iter()
        .map(|(name, target)| {
            let identity = target.identity();
            (
                name.clone(),
                serde_json::json!({
                    "identity": identity.to_string(),
                    "encryption": target.encryption,
                    "credential": identity.credential_fingerprint(),
                }),
            )
        })
        .collect();

    serde_json::json!({
        "pool": {
            "pool_size": pool.pool_size,
            "max_overflow": pool.max_overflow,
            "capacity": pool.capacity(),
            "global_max_connections": pool.global_max_connections,
            "global_max_targets": pool.global_max_targets,
            "idle_timeout_ms": pool.idle_timeout.as_millis() as u64,
            "reaper_interval_ms": pool.reaper_interval.as_millis() as u64,
            "acquire_timeout_default_ms": pool.acquire_timeout_default.as_millis() as u64,
            "health_check_on_acquire": pool.health_check_on_acquire,
            "drain_timeout_ms": pool.drain_timeout.as_millis() as u64,
        },
        "targets": targets,
    })
}
