//! Policy engines consulted by sessions: FXP authorization, abuse
//! limiting and the listener ban list.

pub mod abuse;
pub mod bans;
pub mod fxp;

pub use abuse::{AbuseConfig, AbuseDecision, AbuseLimiter};
pub use bans::BanList;
pub use fxp::{evaluate_fxp, Direction, FxpPolicyConfig, FxpRequest, FxpVerdict, TlsVersion};
