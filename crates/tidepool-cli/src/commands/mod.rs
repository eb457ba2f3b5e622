pub mod check;
pub mod probe;

use std::path::Path;

use anyhow::Context;
use tidepool::PoolConfig;
use tidepool_core::TidepoolConfig;

/// Load `pool.toml` and resolve its `[pool]` table against the defaults.
pub fn load(path: &Path) -> anyhow::Result<(TidepoolConfig, PoolConfig)> {
    let file = TidepoolConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let pool = PoolConfig::from_section(&file.pool)
        .with_context(|| format!("invalid [pool] settings in {}", path.display()))?;
    Ok((file, pool))
}
