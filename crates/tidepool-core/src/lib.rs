pub mod config;
pub mod duration;
pub mod error;
pub mod target;

pub use config::{PoolSection, TidepoolConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use target::{Encryption, TargetConfig, TargetIdentity};
