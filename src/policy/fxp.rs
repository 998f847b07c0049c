//! FXP (server-to-server transfer) authorization engine.
//!
//! A normalized [`FxpRequest`] is composed at command time from the
//! session, the target path and the data-channel endpoint. Evaluation is
//! a fixed decision order in which the first matching rule wins; the
//! output is [`FxpVerdict::Allow`] or a denial carrying a short human
//! reason that the session turns into a 5xx reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::Deserialize;

use crate::vfs::path::fold_key;

/// TLS protocol versions the daemon negotiates, ordered so that minimum
/// requirements compare naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Transfer direction relative to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote server pushes to us (STOR leg).
    Incoming,
    /// We push to the remote server (RETR leg).
    Outgoing,
}

/// Engine configuration. Policy-level knobs and the global flags live in
/// the same record; the decision order determines which wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FxpPolicyConfig {
    /// Global FXP switch. Off denies everything.
    pub enabled: bool,
    /// When false, only the global switch applies and everything else is
    /// skipped.
    pub evaluate_policy: bool,
    pub allow_admin_fxp: bool,
    pub allow_user_fxp: bool,
    /// Require the per-user FXP capability flag.
    pub require_user_allow_flag: bool,
    /// Sections in which FXP is denied outright.
    pub section_deny: Vec<String>,
    /// When non-empty, FXP is allowed only in these sections.
    pub section_allow: Vec<String>,
    /// Deny transfers whose remote peer is the control peer itself.
    pub deny_same_host: bool,
    /// Peer patterns denied before the allow set is consulted.
    pub deny_hosts: Vec<String>,
    /// Policy trusted peers; unioned with `allowed_peers`.
    pub trusted_hosts: Vec<String>,
    /// Globally allowed peers.
    pub allowed_peers: Vec<String>,
    pub allow_incoming: bool,
    pub allow_outgoing: bool,
    pub allow_secure: bool,
    pub allow_plain: bool,
    pub require_control_tls: bool,
    /// Policy: control and data legs must agree on TLS.
    pub require_matching_tls: bool,
    /// Global per-direction matching-TLS flags.
    pub require_matching_tls_incoming: bool,
    pub require_matching_tls_outgoing: bool,
    /// Policy / global minimum TLS versions per direction. The stricter
    /// of the pair applies.
    pub min_tls_incoming: Option<TlsVersion>,
    pub min_tls_outgoing: Option<TlsVersion>,
    pub global_min_tls_incoming: Option<TlsVersion>,
    pub global_min_tls_outgoing: Option<TlsVersion>,
    /// Deny when the remote ident differs from the account's required
    /// ident.
    pub require_ident_match: bool,
}

impl Default for FxpPolicyConfig {
    fn default() -> Self {
        FxpPolicyConfig {
            enabled: false,
            evaluate_policy: true,
            allow_admin_fxp: true,
            allow_user_fxp: true,
            require_user_allow_flag: true,
            section_deny: Vec::new(),
            section_allow: Vec::new(),
            deny_same_host: true,
            deny_hosts: Vec::new(),
            trusted_hosts: Vec::new(),
            allowed_peers: Vec::new(),
            allow_incoming: true,
            allow_outgoing: true,
            allow_secure: true,
            allow_plain: false,
            require_control_tls: false,
            require_matching_tls: false,
            require_matching_tls_incoming: false,
            require_matching_tls_outgoing: false,
            min_tls_incoming: None,
            min_tls_outgoing: None,
            global_min_tls_incoming: None,
            global_min_tls_outgoing: None,
            require_ident_match: false,
        }
    }
}

/// Normalized request descriptor, composed at command time and never
/// persisted.
#[derive(Debug, Clone)]
pub struct FxpRequest {
    pub username: String,
    pub is_admin: bool,
    /// The account's FXP capability flag.
    pub user_fxp_flag: bool,
    pub section: Option<String>,
    pub path: String,
    pub direction: Direction,
    pub remote_ip: IpAddr,
    pub remote_host: Option<String>,
    pub remote_ident: Option<String>,
    /// Ident string the account is bound to, when any.
    pub required_ident: Option<String>,
    pub control_peer_ip: IpAddr,
    pub control_tls: bool,
    pub data_tls: bool,
    /// PROT P in effect for the data channel.
    pub data_protected: bool,
    pub control_tls_version: Option<TlsVersion>,
    pub data_tls_version: Option<TlsVersion>,
}

/// Engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FxpVerdict {
    Allow,
    Deny(String),
}

impl FxpVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FxpVerdict::Allow)
    }

    fn deny(reason: &str) -> FxpVerdict {
        FxpVerdict::Deny(reason.to_string())
    }
}

/// A single peer pattern: plain IP, CIDR block, hostname or `*`-wildcard
/// hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPattern {
    Ip(IpAddr),
    CidrV4(Ipv4Addr, u8),
    CidrV6(Ipv6Addr, u8),
    Host(String),
    WildcardHost(String),
}

impl FromStr for PeerPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty peer pattern".to_string());
        }
        if let Some((addr, bits)) = s.split_once('/') {
            let bits: u8 = bits.parse().map_err(|_| format!("bad prefix length in {s}"))?;
            return match addr.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) if bits <= 32 => Ok(PeerPattern::CidrV4(v4, bits)),
                Ok(IpAddr::V6(v6)) if bits <= 128 => Ok(PeerPattern::CidrV6(v6, bits)),
                Ok(_) => Err(format!("prefix length out of range in {s}")),
                Err(_) => Err(format!("bad CIDR address in {s}")),
            };
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(PeerPattern::Ip(ip));
        }
        if s.contains('*') || s.contains('?') {
            return Ok(PeerPattern::WildcardHost(s.to_ascii_lowercase()));
        }
        Ok(PeerPattern::Host(s.to_ascii_lowercase()))
    }
}

impl PeerPattern {
    /// Tests the pattern against a peer address and its (optional)
    /// resolved hostname.
    pub fn matches(&self, ip: &IpAddr, host: Option<&str>) -> bool {
        match self {
            PeerPattern::Ip(want) => want == ip,
            PeerPattern::CidrV4(net, bits) => match ip {
                IpAddr::V4(v4) => cidr4_contains(net, *bits, v4),
                IpAddr::V6(_) => false,
            },
            PeerPattern::CidrV6(net, bits) => match ip {
                IpAddr::V6(v6) => cidr6_contains(net, *bits, v6),
                IpAddr::V4(_) => false,
            },
            PeerPattern::Host(want) => {
                host.map(|h| h.eq_ignore_ascii_case(want)).unwrap_or(false)
            }
            PeerPattern::WildcardHost(pattern) => host
                .map(|h| wildcard_matches(pattern, &h.to_ascii_lowercase()))
                .unwrap_or(false),
        }
    }
}

fn cidr4_contains(net: &Ipv4Addr, bits: u8, addr: &Ipv4Addr) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - u32::from(bits));
    (u32::from(*net) & mask) == (u32::from(*addr) & mask)
}

fn cidr6_contains(net: &Ipv6Addr, bits: u8, addr: &Ipv6Addr) -> bool {
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - u32::from(bits));
    (u128::from(*net) & mask) == (u128::from(*addr) & mask)
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

fn parse_patterns(raw: &[String]) -> Vec<PeerPattern> {
    raw.iter().filter_map(|s| s.parse().ok()).collect()
}

fn any_match(patterns: &[PeerPattern], ip: &IpAddr, host: Option<&str>) -> bool {
    patterns.iter().any(|p| p.matches(ip, host))
}

/// Evaluates an FXP request. First matching rule wins.
pub fn evaluate_fxp(config: &FxpPolicyConfig, req: &FxpRequest) -> FxpVerdict {
    // 1. Global switch.
    if !config.enabled {
        return FxpVerdict::deny("FXP disabled");
    }
    // 2. Policy evaluation disabled: only the global switch applies.
    if !config.evaluate_policy {
        return FxpVerdict::Allow;
    }
    // 3. Admin / user gating.
    if req.is_admin {
        if !config.allow_admin_fxp {
            return FxpVerdict::deny("FXP not permitted for admins");
        }
    } else if !config.allow_user_fxp {
        return FxpVerdict::deny("FXP not permitted for users");
    }
    if config.require_user_allow_flag && !req.user_fxp_flag {
        return FxpVerdict::deny("account lacks FXP flag");
    }
    // 4. Section filter.
    if let Some(section) = &req.section {
        let folded = fold_key(section);
        if config.section_deny.iter().any(|s| fold_key(s) == folded) {
            return FxpVerdict::deny("section closed for FXP");
        }
        if !config.section_allow.is_empty()
            && !config.section_allow.iter().any(|s| fold_key(s) == folded)
        {
            return FxpVerdict::deny("section not open for FXP");
        }
    }
    // 5. Same-host protection.
    if config.deny_same_host && req.control_peer_ip == req.remote_ip {
        return FxpVerdict::deny("same host");
    }
    // 6. Peer matching: deny list first, then the allow union. An empty
    // allow union means any peer, subject to the other rules.
    let host = req.remote_host.as_deref();
    if any_match(&parse_patterns(&config.deny_hosts), &req.remote_ip, host) {
        return FxpVerdict::deny("peer is deny-listed");
    }
    let mut allow = parse_patterns(&config.trusted_hosts);
    allow.extend(parse_patterns(&config.allowed_peers));
    if !allow.is_empty() && !any_match(&allow, &req.remote_ip, host) {
        return FxpVerdict::deny("peer not in allow list");
    }
    // 7. Direction toggles.
    match req.direction {
        Direction::Incoming if !config.allow_incoming => {
            return FxpVerdict::deny("incoming FXP disabled")
        }
        Direction::Outgoing if !config.allow_outgoing => {
            return FxpVerdict::deny("outgoing FXP disabled")
        }
        _ => {}
    }
    // 8. TLS posture.
    let is_secure = req.control_tls && (req.data_tls || req.data_protected);
    if is_secure && !config.allow_secure {
        return FxpVerdict::deny("secure FXP disabled");
    }
    if !is_secure && !config.allow_plain {
        return FxpVerdict::deny("plaintext FXP disabled");
    }
    if config.require_control_tls && !req.control_tls {
        return FxpVerdict::deny("control channel must be TLS");
    }
    let matching_required = config.require_matching_tls
        || match req.direction {
            Direction::Incoming => config.require_matching_tls_incoming,
            Direction::Outgoing => config.require_matching_tls_outgoing,
        };
    if matching_required && req.control_tls != req.data_tls {
        return FxpVerdict::deny("control and data TLS must match");
    }
    if is_secure {
        let (policy_min, global_min) = match req.direction {
            Direction::Incoming => (config.min_tls_incoming, config.global_min_tls_incoming),
            Direction::Outgoing => (config.min_tls_outgoing, config.global_min_tls_outgoing),
        };
        if let Some(required) = policy_min.max(global_min) {
            for version in [req.control_tls_version, req.data_tls_version] {
                match version {
                    Some(v) if v >= required => {}
                    _ => return FxpVerdict::deny("TLS version below required minimum"),
                }
            }
        }
    }
    // 9. IDENT cross-check.
    if config.require_ident_match {
        if let Some(required) = &req.required_ident {
            match &req.remote_ident {
                Some(got) if got.eq_ignore_ascii_case(required) => {}
                _ => return FxpVerdict::deny("ident mismatch"),
            }
        }
    }
    // 10. Everything passed.
    FxpVerdict::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FxpPolicyConfig {
        FxpPolicyConfig {
            enabled: true,
            require_user_allow_flag: false,
            allow_plain: true,
            ..FxpPolicyConfig::default()
        }
    }

    fn base_request() -> FxpRequest {
        FxpRequest {
            username: "alice".into(),
            is_admin: false,
            user_fxp_flag: true,
            section: Some("APPS".into()),
            path: "/apps/x".into(),
            direction: Direction::Outgoing,
            remote_ip: "203.0.113.9".parse().unwrap(),
            remote_host: Some("peer.example.net".into()),
            remote_ident: None,
            required_ident: None,
            control_peer_ip: "198.51.100.7".parse().unwrap(),
            control_tls: false,
            data_tls: false,
            data_protected: false,
            control_tls_version: None,
            data_tls_version: None,
        }
    }

    #[test]
    fn global_switch_denies_everything() {
        let mut c = base_config();
        c.enabled = false;
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());
    }

    #[test]
    fn policy_evaluation_off_allows() {
        let mut c = base_config();
        c.evaluate_policy = false;
        c.deny_same_host = true;
        let mut r = base_request();
        r.remote_ip = r.control_peer_ip;
        assert!(evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn same_host_denied() {
        let c = base_config();
        let mut r = base_request();
        r.remote_ip = r.control_peer_ip;
        assert_eq!(evaluate_fxp(&c, &r), FxpVerdict::Deny("same host".into()));
    }

    #[test]
    fn user_flag_gate() {
        let mut c = base_config();
        c.require_user_allow_flag = true;
        let mut r = base_request();
        r.user_fxp_flag = false;
        assert!(!evaluate_fxp(&c, &r).is_allowed());
        r.user_fxp_flag = true;
        assert!(evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn section_filters() {
        let mut c = base_config();
        c.section_deny = vec!["apps".into()];
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());

        let mut c = base_config();
        c.section_allow = vec!["MP3".into()];
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());
        c.section_allow = vec!["apps".into()];
        assert!(evaluate_fxp(&c, &base_request()).is_allowed());
    }

    #[test]
    fn peer_patterns() {
        let p: PeerPattern = "203.0.113.0/24".parse().unwrap();
        assert!(p.matches(&"203.0.113.42".parse().unwrap(), None));
        assert!(!p.matches(&"203.0.114.1".parse().unwrap(), None));

        let p: PeerPattern = "2001:db8::/32".parse().unwrap();
        assert!(p.matches(&"2001:db8::1".parse().unwrap(), None));
        assert!(!p.matches(&"2001:db9::1".parse().unwrap(), None));

        let p: PeerPattern = "*.example.net".parse().unwrap();
        assert!(p.matches(&"203.0.113.9".parse().unwrap(), Some("peer.example.net")));
        assert!(!p.matches(&"203.0.113.9".parse().unwrap(), Some("example.org")));

        assert!("not a pattern /x".parse::<PeerPattern>().is_ok()); // hostname fallback
        assert!("10.0.0.0/33".parse::<PeerPattern>().is_err());
    }

    #[test]
    fn deny_hosts_beat_allow() {
        let mut c = base_config();
        c.deny_hosts = vec!["203.0.113.0/24".into()];
        c.trusted_hosts = vec!["203.0.113.9".into()];
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());
    }

    #[test]
    fn empty_allow_set_means_any() {
        let c = base_config();
        assert!(evaluate_fxp(&c, &base_request()).is_allowed());

        let mut c = base_config();
        c.allowed_peers = vec!["192.0.2.1".into()];
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());
    }

    #[test]
    fn direction_toggles() {
        let mut c = base_config();
        c.allow_incoming = false;
        let mut r = base_request();
        r.direction = Direction::Incoming;
        assert!(!evaluate_fxp(&c, &r).is_allowed());
        r.direction = Direction::Outgoing;
        assert!(evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn require_control_tls() {
        let mut c = base_config();
        c.require_control_tls = true;
        let r = base_request();
        assert!(!evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn tls_posture() {
        // Secure transfer with secure disabled.
        let mut c = base_config();
        c.allow_secure = false;
        let mut r = base_request();
        r.control_tls = true;
        r.data_tls = true;
        r.control_tls_version = Some(TlsVersion::Tls13);
        r.data_tls_version = Some(TlsVersion::Tls13);
        assert!(!evaluate_fxp(&c, &r).is_allowed());

        // Plain transfer with plain disabled.
        let mut c = base_config();
        c.allow_plain = false;
        assert!(!evaluate_fxp(&c, &base_request()).is_allowed());

        // Matching TLS required but legs disagree.
        let mut c = base_config();
        c.require_matching_tls = true;
        let mut r = base_request();
        r.control_tls = true;
        r.data_tls = false;
        r.data_protected = true; // still "secure", but mismatched
        assert!(!evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn minimum_tls_version_is_max_of_policy_and_global() {
        let mut c = base_config();
        c.min_tls_outgoing = Some(TlsVersion::Tls12);
        c.global_min_tls_outgoing = Some(TlsVersion::Tls13);
        let mut r = base_request();
        r.control_tls = true;
        r.data_tls = true;
        r.control_tls_version = Some(TlsVersion::Tls12);
        r.data_tls_version = Some(TlsVersion::Tls13);
        assert!(!evaluate_fxp(&c, &r).is_allowed());
        r.control_tls_version = Some(TlsVersion::Tls13);
        assert!(evaluate_fxp(&c, &r).is_allowed());
    }

    #[test]
    fn ident_cross_check() {
        let mut c = base_config();
        c.require_ident_match = true;
        let mut r = base_request();
        r.required_ident = Some("alice".into());
        r.remote_ident = Some("mallory".into());
        assert!(!evaluate_fxp(&c, &r).is_allowed());
        r.remote_ident = Some("ALICE".into());
        assert!(evaluate_fxp(&c, &r).is_allowed());
    }
}
