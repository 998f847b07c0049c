//! amftpd - A scene-style FTP/FTPS daemon in Rust
//!
//! This library implements an FTP server tailored for release-distribution
//! sites: authenticated users upload and download files through sections with
//! ratio accounting, release tracking, duplicate detection, cross-server (FXP)
//! transfers, and pluggable policy hooks.
//!
//! ## Supported Features
//!
//! - FTP control protocol per RFC 959 with the modern extension set:
//!   RFC 2228 (AUTH/PBSZ/PROT), RFC 2428 (EPRT/EPSV), RFC 3659
//!   (MDTM/MLSD/MLST/SIZE/REST) and RFC 4217 (explicit FTPS)
//! - TLS 1.2/1.3 on control and data channels via rustls, with automatic
//!   self-signed certificate generation on first start
//! - Virtual filesystem composed of pluggable providers: physical mounts,
//!   release/pre/group virtual namespaces and section shortcuts
//! - Per-section credit/ratio accounting with group overrides and free-leech
//! - Persistent binary duplicate store with CRC lists and wildcard search
//! - FXP authorization engine (peer matching, TLS posture, direction rules)
//! - Abuse limiting (failed-login bans, command-rate throttling), IP/CIDR
//!   ban lists and an RFC 1413 IDENT cross-check
//! - Asynchronous operation with the Tokio runtime
//!
//! ## Main Components
//!
//! - `server`: the TCP listener, active-session registry and the
//!   [`server::FtpServer`] construction API (`start`/`stop`/`status`).
//!
//! - `session`: the per-connection control-channel state machine covering
//!   authentication, TLS upgrade, data-channel negotiation and dispatch to
//!   the command handlers.
//!
//! - `vfs`: the virtual filesystem resolver. Providers are consulted in a
//!   fixed order; the first that can handle a path wins.
//!
//! - `store`: user/group/section stores with binary on-disk persistence.
//!
//! - `dupe`: the append-oriented binary duplicate store plus the `AMDP`
//!   scene-interop export format.
//!
//! - `policy`, `credit`, `ident`: the decision engines consulted by
//!   sessions before and during transfers.
//!
//! ## Standards Compliance
//!
//! - RFC 959: File Transfer Protocol
//! - RFC 2228: FTP Security Extensions
//! - RFC 2428: FTP Extensions for IPv6 and NATs
//! - RFC 3659: Extensions to FTP
//! - RFC 4217: Securing FTP with TLS
//! - RFC 1413: Identification Protocol
//!
//! ## Usage
//!
//! Build a [`config::DaemonConfig`], construct the stores, then create an
//! [`server::FtpServer`] and call `start()`. See `demos/basic_server` for a
//! complete, runnable setup.

pub mod config;
pub mod credit;
pub mod data;
pub mod dupe;
pub mod error;
pub mod events;
pub mod ident;
pub mod policy;
pub mod reply;
pub mod script;
pub mod server;
pub mod session;
pub mod store;
pub mod tls;
pub mod vfs;

pub use config::DaemonConfig;
pub use error::{FtpError, FtpResult};
pub use server::FtpServer;
