//! Abuse limiter: per-IP failed-login and command-rate accounting.
//!
//! Sessions report failed logins and executed commands; the limiter
//! answers with a decision the session enforces. All mutations for one IP
//! serialize on the limiter lock. Stale entries are evicted both
//! opportunistically and by a periodic janitor.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

const FAILED_LOGIN_WINDOW: Duration = Duration::from_secs(600);
const COMMAND_WINDOW: Duration = Duration::from_secs(60);
const LOGIN_BAN: Duration = Duration::from_secs(15 * 60);
const RATE_BAN: Duration = Duration::from_secs(10 * 60);
const THROTTLE_DELAY: Duration = Duration::from_millis(500);

/// Limiter thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Failed logins tolerated per IP inside the 10-minute window.
    pub max_failed_logins_per_ip: u32,
    /// Commands per minute tolerated per session before throttling.
    pub max_commands_per_minute: u32,
    /// Entries untouched for this long are evicted by the janitor.
    pub idle_evict_secs: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        AbuseConfig {
            max_failed_logins_per_ip: 5,
            max_commands_per_minute: 120,
            idle_evict_secs: 3600,
        }
    }
}

/// What the session must do after reporting an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbuseDecision {
    None,
    /// Delay the next command by roughly this much.
    Throttle(Duration),
    /// Close the connection and ban the IP for the duration.
    Ban { duration: Duration, reason: String },
}

struct IpActivity {
    last_touched: Instant,
    failed_logins: u32,
    failed_window_start: Instant,
    commands: u32,
    command_window_start: Instant,
}

impl IpActivity {
    fn new(now: Instant) -> Self {
        IpActivity {
            last_touched: now,
            failed_logins: 0,
            failed_window_start: now,
            commands: 0,
            command_window_start: now,
        }
    }
}

/// Per-IP abuse accounting.
pub struct AbuseLimiter {
    config: AbuseConfig,
    entries: Mutex<HashMap<IpAddr, IpActivity>>,
}

impl AbuseLimiter {
    pub fn new(config: AbuseConfig) -> Self {
        AbuseLimiter { config, entries: Mutex::new(HashMap::new()) }
    }

    /// Records a failed login from `ip`. More than the configured maximum
    /// inside the rolling 10-minute window earns a 15-minute ban.
    pub fn record_failed_login(&self, ip: IpAddr) -> AbuseDecision {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("abuse limiter lock poisoned");
        let entry = entries.entry(ip).or_insert_with(|| IpActivity::new(now));
        entry.last_touched = now;
        if now.duration_since(entry.failed_window_start) > FAILED_LOGIN_WINDOW {
            entry.failed_window_start = now;
            entry.failed_logins = 0;
        }
        entry.failed_logins += 1;
        if entry.failed_logins > self.config.max_failed_logins_per_ip {
            debug!(%ip, count = entry.failed_logins, "failed-login threshold exceeded");
            return AbuseDecision::Ban {
                duration: LOGIN_BAN,
                reason: "too many failed logins".to_string(),
            };
        }
        AbuseDecision::None
    }

    /// Records a command execution. `session_cpm` is the reporting
    /// session's own commands-per-minute count.
    pub fn record_command(&self, ip: IpAddr, session_cpm: u32) -> AbuseDecision {
        let max = self.config.max_commands_per_minute;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("abuse limiter lock poisoned");
        let entry = entries.entry(ip).or_insert_with(|| IpActivity::new(now));
        entry.last_touched = now;
        if now.duration_since(entry.command_window_start) > COMMAND_WINDOW {
            entry.command_window_start = now;
            entry.commands = 0;
        }
        entry.commands += 1;
        if session_cpm > max * 2 || entry.commands > max * 3 {
            return AbuseDecision::Ban {
                duration: RATE_BAN,
                reason: "command flood".to_string(),
            };
        }
        if session_cpm > max {
            return AbuseDecision::Throttle(THROTTLE_DELAY);
        }
        AbuseDecision::None
    }

    /// Evicts entries untouched for longer than the configured idle
    /// threshold. Called by the janitor task.
    pub fn evict_idle(&self) {
        let cutoff = Duration::from_secs(self.config.idle_evict_secs);
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("abuse limiter lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.last_touched) <= cutoff);
        if entries.len() != before {
            debug!(evicted = before - entries.len(), "abuse limiter janitor pass");
        }
    }

    pub fn tracked_ips(&self) -> usize {
        self.entries.lock().expect("abuse limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn failed_logins_ban_after_threshold() {
        let limiter = AbuseLimiter::new(AbuseConfig {
            max_failed_logins_per_ip: 3,
            ..AbuseConfig::default()
        });
        for _ in 0..3 {
            assert_eq!(limiter.record_failed_login(ip(1)), AbuseDecision::None);
        }
        match limiter.record_failed_login(ip(1)) {
            AbuseDecision::Ban { duration, .. } => {
                assert_eq!(duration, Duration::from_secs(900));
            }
            other => panic!("expected ban, got {other:?}"),
        }
        // Another IP is unaffected.
        assert_eq!(limiter.record_failed_login(ip(2)), AbuseDecision::None);
    }

    #[test]
    fn command_rate_decisions() {
        let limiter = AbuseLimiter::new(AbuseConfig {
            max_commands_per_minute: 10,
            ..AbuseConfig::default()
        });
        // Within limits.
        assert_eq!(limiter.record_command(ip(3), 5), AbuseDecision::None);
        // Session in (max, 2*max]: throttle.
        assert_eq!(
            limiter.record_command(ip(3), 11),
            AbuseDecision::Throttle(Duration::from_millis(500))
        );
        assert_eq!(
            limiter.record_command(ip(3), 20),
            AbuseDecision::Throttle(Duration::from_millis(500))
        );
        // Session above 2*max: ban.
        assert!(matches!(limiter.record_command(ip(3), 21), AbuseDecision::Ban { .. }));
    }

    #[test]
    fn ip_wide_flood_bans_even_calm_sessions() {
        let limiter = AbuseLimiter::new(AbuseConfig {
            max_commands_per_minute: 4,
            ..AbuseConfig::default()
        });
        let mut banned = false;
        // 3*max = 12; the 13th command in the window trips the IP ban even
        // though each session reports a low own-rate.
        for _ in 0..13 {
            if matches!(limiter.record_command(ip(4), 1), AbuseDecision::Ban { .. }) {
                banned = true;
            }
        }
        assert!(banned);
    }

    #[test]
    fn eviction_drops_idle_entries() {
        let limiter = AbuseLimiter::new(AbuseConfig {
            idle_evict_secs: 0,
            ..AbuseConfig::default()
        });
        limiter.record_command(ip(5), 1);
        assert_eq!(limiter.tracked_ips(), 1);
        std::thread::sleep(Duration::from_millis(5));
        limiter.evict_idle();
        assert_eq!(limiter.tracked_ips(), 0);
    }
}
