//! Daemon configuration record.
//!
//! The core performs no config-file parsing: an external wrapper builds a
//! [`DaemonConfig`] (all types derive `serde::Deserialize`, so any format
//! works) and hands it to [`crate::server::FtpServer`]. The only
//! environment variable the core acknowledges is `AMFTPD_CONFIG`, exposed
//! through [`config_path_from_env`] for wrappers that want the
//! conventional override.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::ident::IdentConfig;
use crate::policy::abuse::AbuseConfig;
use crate::policy::fxp::FxpPolicyConfig;

/// Top-level configuration for one daemon instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the control-channel listener binds to.
    pub bind_addr: IpAddr,
    /// Control-channel port.
    pub port: u16,
    /// Inclusive passive-mode port range.
    pub passive_port_min: u16,
    pub passive_port_max: u16,
    /// Address advertised in PASV replies. Defaults to the control
    /// connection's local address when unset (NAT setups override this).
    pub advertised_addr: Option<IpAddr>,
    /// Banner text on the 220 greeting line.
    pub greeting: String,
    pub tls: TlsSettings,
    pub timeouts: TimeoutSettings,
    pub abuse: AbuseConfig,
    pub fxp: FxpPolicyConfig,
    pub ident: IdentConfig,
    /// Hard cap on simultaneous sessions; further connects get 421.
    pub max_sessions: usize,
    /// Optional cap on simultaneous connections per client IP.
    pub per_ip_connection_cap: Option<u32>,
    /// How long graceful shutdown waits for sessions to drain before
    /// force-closing stragglers.
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 21,
            passive_port_min: 50000,
            passive_port_max: 50999,
            advertised_addr: None,
            greeting: "amftpd ready.".to_string(),
            tls: TlsSettings::default(),
            timeouts: TimeoutSettings::default(),
            abuse: AbuseConfig::default(),
            fxp: FxpPolicyConfig::default(),
            ident: IdentConfig::default(),
            max_sessions: 512,
            per_ip_connection_cap: None,
            shutdown_grace_secs: 10,
        }
    }
}

impl DaemonConfig {
    /// Duration form of the shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// TLS material locations and certificate subject.
///
/// When the files are missing a self-signed certificate is generated and
/// persisted at these paths, so the daemon always comes up with a working
/// FTPS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM certificate chain path.
    pub cert_path: PathBuf,
    /// PEM private key path.
    pub key_path: PathBuf,
    /// Subject common name used when generating a certificate.
    pub subject: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            cert_path: PathBuf::from("amftpd-cert.pem"),
            key_path: PathBuf::from("amftpd-key.pem"),
            subject: "amftpd".to_string(),
        }
    }
}

/// The configurable timeouts from the concurrency model. Expiry of any of
/// them is delivered as a cancellation event at the session's next yield
/// point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Control-read idle timeout applied when the user record carries
    /// none of its own.
    pub idle_secs: u64,
    /// IDENT query timeout.
    pub ident_ms: u64,
    /// TLS handshake timeout (control and data).
    pub tls_handshake_secs: u64,
    /// Data-channel establishment (passive accept / active connect).
    pub data_establish_secs: u64,
    /// Per-chunk transfer progress timeout.
    pub transfer_progress_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings {
            idle_secs: 300,
            ident_ms: 3000,
            tls_handshake_secs: 15,
            data_establish_secs: 30,
            transfer_progress_secs: 60,
        }
    }
}

impl TimeoutSettings {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
    pub fn ident(&self) -> Duration {
        Duration::from_millis(self.ident_ms)
    }
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }
    pub fn data_establish(&self) -> Duration {
        Duration::from_secs(self.data_establish_secs)
    }
    pub fn transfer_progress(&self) -> Duration {
        Duration::from_secs(self.transfer_progress_secs)
    }
}

/// Path of the configuration file the wrapper should load: the
/// `AMFTPD_CONFIG` environment variable when set, otherwise the provided
/// default.
pub fn config_path_from_env(default: impl Into<PathBuf>) -> PathBuf {
    std::env::var_os("AMFTPD_CONFIG").map(PathBuf::from).unwrap_or_else(|| default.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 21);
        assert!(config.passive_port_min <= config.passive_port_max);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.timeouts.ident(), Duration::from_millis(3000));
    }

    #[test]
    fn config_path_falls_back_to_default() {
        // The variable is unset in the test environment.
        std::env::remove_var("AMFTPD_CONFIG");
        assert_eq!(config_path_from_env("amftpd.toml"), PathBuf::from("amftpd.toml"));
    }
}
