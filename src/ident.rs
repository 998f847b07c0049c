//! RFC 1413 IDENT client, cache and policy enforcement.
//!
//! After authentication the session may query the remote peer's identd:
//! connect to port 113, send `"<remote-port> , <local-port>\r\n"`, read a
//! single response line and parse
//! `port , port : USERID : opsystem : username`. Any I/O or parse failure
//! yields a failed result, never an error. Results are cached per peer IP
//! when caching is enabled.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// The RFC 1413 port.
pub const IDENT_PORT: u16 = 113;
const MAX_RESPONSE: usize = 512;

/// IDENT subsystem configuration. The mode flags correspond to the
/// enforcement features; `caching` controls the result cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentConfig {
    /// Master switch; off skips the query entirely.
    pub enabled: bool,
    pub caching: bool,
    pub cache_ttl_secs: u64,
    /// Log outcomes and never deny, whatever the other flags say.
    pub logging_only: bool,
    /// Compare the ident username against the FTP username.
    pub strict_user_match: bool,
    pub deny_on_strict_mismatch: bool,
    /// Ident username to extra session groups.
    pub group_mappings: HashMap<String, Vec<String>>,
    /// Compare the ident username against the TLS client certificate's
    /// common name.
    pub tls_binding: bool,
    pub deny_on_tls_binding_mismatch: bool,
    /// Check that the peer's PTR record contains the ident username.
    pub reverse_dns_check: bool,
    pub deny_on_reverse_dns_mismatch: bool,
}

impl Default for IdentConfig {
    fn default() -> Self {
        IdentConfig {
            enabled: false,
            caching: true,
            cache_ttl_secs: 300,
            logging_only: false,
            strict_user_match: false,
            deny_on_strict_mismatch: false,
            group_mappings: HashMap::new(),
            tls_binding: false,
            deny_on_tls_binding_mismatch: false,
            reverse_dns_check: false,
            deny_on_reverse_dns_mismatch: false,
        }
    }
}

/// Result of one IDENT exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentResult {
    pub ok: bool,
    pub username: Option<String>,
    pub opsystem: Option<String>,
    pub error: Option<String>,
}

impl IdentResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        IdentResult { ok: false, username: None, opsystem: None, error: Some(reason.into()) }
    }
}

/// Reverse-DNS lookup seam for the PTR check. The core ships only the
/// no-op implementation; a wrapper may plug a real resolver.
#[async_trait]
pub trait ReverseDns: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// Always-empty resolver.
pub struct NoReverseDns;

#[async_trait]
impl ReverseDns for NoReverseDns {
    async fn reverse(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// The IDENT client with its per-IP result cache.
pub struct IdentClient {
    config: IdentConfig,
    query_timeout: Duration,
    port: u16,
    cache: moka::sync::Cache<IpAddr, IdentResult>,
}

impl IdentClient {
    pub fn new(config: IdentConfig, query_timeout: Duration) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs.max(1));
        IdentClient {
            config,
            query_timeout,
            port: IDENT_PORT,
            cache: moka::sync::Cache::builder().max_capacity(1024).time_to_live(ttl).build(),
        }
    }

    /// Overrides the identd port, for tests.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn config(&self) -> &IdentConfig {
        &self.config
    }

    /// Queries the remote peer's identd about the connection
    /// `remote -> local`. Never fails: any problem produces a failed
    /// result.
    pub async fn query(&self, remote: SocketAddr, local: SocketAddr) -> IdentResult {
        if self.config.caching {
            if let Some(hit) = self.cache.get(&remote.ip()) {
                debug!(peer = %remote.ip(), "ident cache hit");
                return hit;
            }
        }
        let result = self.query_uncached(remote, local).await;
        if self.config.caching {
            self.cache.insert(remote.ip(), result.clone());
        }
        result
    }

    async fn query_uncached(&self, remote: SocketAddr, local: SocketAddr) -> IdentResult {
        let target = SocketAddr::new(remote.ip(), self.port);
        let attempt = async {
            let mut stream = TcpStream::connect(target).await?;
            let request = format!("{} , {}\r\n", remote.port(), local.port());
            stream.write_all(request.as_bytes()).await?;
            let mut buf = vec![0u8; MAX_RESPONSE];
            let mut filled = 0usize;
            loop {
                let n = stream.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
                if buf[..filled].contains(&b'\n') || filled == buf.len() {
                    break;
                }
            }
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf[..filled]).to_string())
        };
        match timeout(self.query_timeout, attempt).await {
            Ok(Ok(line)) => parse_response(&line),
            Ok(Err(e)) => IdentResult::failed(format!("ident I/O: {e}")),
            Err(_) => IdentResult::failed("ident timeout"),
        }
    }

    /// Applies the enforcement policy to a query result.
    ///
    /// Returns the extra groups to map onto the session, or the denial
    /// reason that aborts the login with a 530-class reply.
    pub fn apply_policy(
        &self,
        result: &IdentResult,
        ftp_username: &str,
        tls_common_name: Option<&str>,
        ptr_name: Option<&str>,
    ) -> Result<Vec<String>, String> {
        let c = &self.config;
        if c.logging_only {
            debug!(
                user = ftp_username,
                ok = result.ok,
                ident = result.username.as_deref().unwrap_or("-"),
                "ident (logging only)"
            );
            return Ok(Vec::new());
        }

        let ident_user = result.username.as_deref();

        if c.strict_user_match {
            let matches = ident_user
                .map(|u| u.eq_ignore_ascii_case(ftp_username))
                .unwrap_or(false);
            if !matches {
                warn!(
                    user = ftp_username,
                    ident = ident_user.unwrap_or("-"),
                    "ident username mismatch"
                );
                if c.deny_on_strict_mismatch {
                    return Err("ident mismatch".to_string());
                }
            }
        }

        if c.tls_binding {
            let matches = match (ident_user, tls_common_name) {
                (Some(u), Some(cn)) => u.eq_ignore_ascii_case(cn),
                _ => false,
            };
            if !matches && c.deny_on_tls_binding_mismatch {
                return Err("ident does not match certificate".to_string());
            }
        }

        if c.reverse_dns_check {
            let matches = match (ident_user, ptr_name) {
                (Some(u), Some(ptr)) => {
                    ptr.to_ascii_lowercase().contains(&u.to_ascii_lowercase())
                }
                _ => false,
            };
            if !matches && c.deny_on_reverse_dns_mismatch {
                return Err("reverse DNS does not match ident".to_string());
            }
        }

        let mut groups = Vec::new();
        if let Some(user) = ident_user {
            for (pattern, mapped) in &c.group_mappings {
                if pattern.eq_ignore_ascii_case(user) {
                    groups.extend(mapped.iter().cloned());
                }
            }
        }
        Ok(groups)
    }
}

/// Parses an identd response line.
fn parse_response(line: &str) -> IdentResult {
    let line = line.trim();
    let mut parts = line.splitn(4, ':');
    let _ports = match parts.next() {
        Some(p) if p.contains(',') => p,
        _ => return IdentResult::failed("malformed ident response"),
    };
    let reply_type = parts.next().map(str::trim).unwrap_or("");
    match reply_type {
        "USERID" => {
            let opsystem = parts.next().map(|s| s.trim().to_string());
            let username = parts.next().map(|s| s.trim().to_string());
            match username {
                Some(u) if !u.is_empty() => {
                    IdentResult { ok: true, username: Some(u), opsystem, error: None }
                }
                _ => IdentResult::failed("empty ident username"),
            }
        }
        "ERROR" => {
            let reason = parts.next().map(str::trim).unwrap_or("unknown");
            IdentResult::failed(format!("identd error: {reason}"))
        }
        other => IdentResult::failed(format!("unknown ident reply type {other:?}")),
    }
}
