//! Typed settings consumed by the node core.

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ApiEndpoint;

/// Default control API port.
pub const DEFAULT_SERVICE_PORT: u16 = 62050;

/// Default proxy core API port.
pub const DEFAULT_API_PORT: u16 = 62051;

/// Settings error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be greater than 0")]
    ZeroPort(&'static str),
    #[error("SERVICE_PORT and XRAY_API_PORT must be different")]
    PortClash,
}

/// Everything the agent needs to know about its environment.
///
/// Loading these values (environment, flags) is the binary's job; the core
/// only consumes the typed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Control API bind host.
    pub service_host: String,
    /// Control API bind port.
    pub service_port: u16,
    /// Host the proxy core's API inbound listens on.
    pub api_host: String,
    /// Port the proxy core's API inbound listens on.
    pub api_port: u16,
    /// Proxy core executable.
    pub executable_path: PathBuf,
    /// Proxy core asset directory (geoip/geosite data).
    pub assets_path: PathBuf,
    /// Write the config here instead of piping it through stdin.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Server certificate (PEM).
    pub ssl_cert_file: PathBuf,
    /// Server private key (PEM).
    pub ssl_key_file: PathBuf,
    /// Trust anchor for client certificates (PEM). `None` disables client auth.
    #[serde(default)]
    pub ssl_client_cert_file: Option<PathBuf>,
    /// Inbound allow-list; empty keeps every inbound.
    #[serde(default)]
    pub inbounds: BTreeSet<String>,
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
    /// Upper bound on the start health probe.
    pub startup_timeout: Duration,
    /// Time allowed for a graceful stop before the core is killed.
    pub stop_grace: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            service_host: "0.0.0.0".to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            api_host: "0.0.0.0".to_string(),
            api_port: DEFAULT_API_PORT,
            executable_path: PathBuf::from("/usr/local/bin/xray"),
            assets_path: PathBuf::from("/usr/local/share/xray"),
            config_path: None,
            ssl_cert_file: PathBuf::from("/var/lib/proxy-node/ssl_cert.pem"),
            ssl_key_file: PathBuf::from("/var/lib/proxy-node/ssl_key.pem"),
            ssl_client_cert_file: None,
            inbounds: BTreeSet::new(),
            debug: false,
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl NodeSettings {
    /// Check the invariants the rest of the agent relies on.
    ///
    /// # Errors
    /// Returns error if a port is zero or both ports collide.
    pub const fn validate(&self) -> Result<(), SettingsError> {
        if self.service_port == 0 {
            return Err(SettingsError::ZeroPort("SERVICE_PORT"));
        }
        if self.api_port == 0 {
            return Err(SettingsError::ZeroPort("XRAY_API_PORT"));
        }
        if self.service_port == self.api_port {
            return Err(SettingsError::PortClash);
        }
        Ok(())
    }

    /// Where the injected API inbound should listen.
    #[must_use]
    pub fn api_endpoint(&self) -> ApiEndpoint {
        ApiEndpoint {
            host: self.api_host.clone(),
            port: self.api_port,
            certificate: Some((self.ssl_cert_file.clone(), self.ssl_key_file.clone())),
        }
    }
}
