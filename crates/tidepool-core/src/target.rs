//! Target configuration and the identity that keys a connection pool.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Transport encryption mode requested for a target.
///
/// Part of the pool identity: the same endpoint reached with and without
/// TLS gets two separate pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    /// Never negotiate TLS.
    Disabled,
    /// Use TLS when the connector has a TLS configuration (default).
    #[default]
    Preferred,
    /// Always use TLS; fail when the connector has no TLS configuration.
    Required,
    /// Like `Required`, but the configuration must verify server certificates.
    Strict,
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::Disabled => write!(f, "disabled"),
            Encryption::Preferred => write!(f, "preferred"),
            Encryption::Required => write!(f, "required"),
            Encryption::Strict => write!(f, "strict"),
        }
    }
}

/// Connection parameters for one logical database endpoint.
///
/// This is what a connector resolves from a request; the pool only needs
/// its [`TargetIdentity`] and hands the full config to the factory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub encryption: Encryption,
    /// Driver-specific discriminators (driver name, application name, ...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TargetConfig {
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: None,
            encryption: Encryption::default(),
            options: BTreeMap::new(),
        }
    }

    /// Builder method: set the password.
    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    /// Builder method: set the encryption mode.
    pub fn with_encryption(self, encryption: Encryption) -> Self {
        Self { encryption, ..self }
    }

    /// Builder method: add a driver-specific discriminator.
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// `host:port` for socket resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Compute the pool identity for these parameters.
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity {
            host: self.host.trim().to_ascii_lowercase(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            encryption: self.encryption,
            credential: self.password.as_deref().map(fingerprint),
            options: self.options.clone(),
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("encryption", &self.encryption)
            .field("options", &self.options)
            .finish()
    }
}

/// Key identifying a target pool. Requests with equal identities share a pool.
///
/// The password only participates as a truncated SHA-256 fingerprint, so
/// identities can be logged and displayed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetIdentity {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub encryption: Encryption,
    credential: Option<String>,
    options: BTreeMap<String, String>,
}

impl TargetIdentity {
    /// Fingerprint of the credential, if the target has a password.
    pub fn credential_fingerprint(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..8])
}
