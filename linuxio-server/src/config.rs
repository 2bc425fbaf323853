//! Runtime configuration.
//!
//! Unlike the sprawling file-backed configuration of larger gateways, this
//! service only has a handful of knobs, all of which are reasonable to pass
//! on the command line and override with environment variables. There is no
//! hot-reload: every field is fixed for the lifetime of the process.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

const ENV_PORT: &str = "LINUXIO_PORT";
const ENV_LOG_FILE: &str = "LINUXIO_LOG_FILE";
const ENV_LOG_DIRECTIVE: &str = "LINUXIO_LOG";
const ENV_SESSION_TTL_SECS: &str = "LINUXIO_SESSION_TTL_SECS";
const ENV_BRIDGE_BIN: &str = "LINUXIO_BRIDGE_BIN";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG_FILE: &str = "/var/log/linuxio/linuxio-server.log";
const DEFAULT_LOG_DIRECTIVE: &str = "info";
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_BRIDGE_BIN: &str = "/usr/libexec/linuxio-bridge";

/// Parsed, validated configuration for one run of the server.
#[derive(Debug, Clone)]
pub struct Conf {
    pub port: u16,
    pub verbose: bool,
    pub log_file: Utf8PathBuf,
    pub log_directive: String,
    /// How long an idle session is kept before the sweeper reclaims it.
    pub session_ttl: Duration,
    /// Path to the `linuxio-bridge` binary the supervisor spawns.
    pub bridge_bin: Utf8PathBuf,
}

impl Conf {
    /// Builds a [`Conf`] from parsed CLI flags, layering environment
    /// variable overrides on top of built-in defaults.
    pub fn from_cli(port: Option<u16>, verbose: bool) -> anyhow::Result<Self> {
        let port = match port {
            Some(port) => port,
            None => match std::env::var(ENV_PORT) {
                Ok(value) => value.parse().map_err(|_| anyhow::anyhow!("{ENV_PORT} must be a valid port number"))?,
                Err(_) => DEFAULT_PORT,
            },
        };

        let log_file = std::env::var(ENV_LOG_FILE).unwrap_or_else(|_| DEFAULT_LOG_FILE.to_owned());
        let log_directive = std::env::var(ENV_LOG_DIRECTIVE).unwrap_or_else(|_| DEFAULT_LOG_DIRECTIVE.to_owned());
        let bridge_bin = std::env::var(ENV_BRIDGE_BIN).unwrap_or_else(|_| DEFAULT_BRIDGE_BIN.to_owned());

        let session_ttl = match std::env::var(ENV_SESSION_TTL_SECS) {
            Ok(value) => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{ENV_SESSION_TTL_SECS} must be an integer number of seconds"))?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_SESSION_TTL,
        };

        Ok(Self {
            port,
            verbose,
            log_file: Utf8PathBuf::from(log_file),
            log_directive,
            session_ttl,
            bridge_bin: Utf8PathBuf::from(bridge_bin),
        })
    }
}

/// Cheaply-cloneable handle to the immutable configuration.
#[derive(Debug, Clone)]
pub struct ConfHandle(Arc<Conf>);

impl ConfHandle {
    pub fn new(conf: Conf) -> Self {
        Self(Arc::new(conf))
    }

    pub fn get(&self) -> &Conf {
        &self.0
    }
}
