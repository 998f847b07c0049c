//! Per-connection control-channel session.
//!
//! A session is a single logical task: commands are read one CRLF line
//! at a time and processed strictly in order, so the reply to command N
//! is on the wire before command N+1 is even parsed. Concurrency exists
//! only across sessions. Blocking points (control reads, data
//! establishment, the transfer loop) all yield to the shutdown signal
//! and the idle timeout.

pub mod commands;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::data::PassiveSocket;
use crate::error::{FtpError, FtpResult};
use crate::events::{Event, EventKind};
use crate::policy::abuse::AbuseDecision;
use crate::reply::Reply;
use crate::server::ServerRuntime;
use crate::session::stream::MaybeTlsStream;
use crate::store::user::User;
use crate::vfs::{ResolveCtx, VirtualPath};

const MAX_LINE: usize = 4096;

/// Authentication progress of the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NotLoggedIn,
    /// USER was accepted; waiting for PASS.
    AwaitPass(String),
    LoggedIn,
}

/// TYPE setting; only the transfer semantics differ, the daemon stores
/// bytes verbatim either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Ascii,
    Binary,
}

/// One control connection.
pub struct Session {
    pub(crate) id: u64,
    pub(crate) runtime: Arc<ServerRuntime>,
    pub(crate) stream: MaybeTlsStream,
    pub(crate) inbuf: Vec<u8>,
    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) auth: AuthState,
    pub(crate) user: Option<User>,
    /// Extra groups mapped onto the session by the IDENT policy.
    pub(crate) extra_groups: Vec<String>,
    pub(crate) remote_ident: Option<String>,
    pub(crate) cwd: VirtualPath,
    pub(crate) transfer_type: TransferType,
    pub(crate) pending_passive: Option<PassiveSocket>,
    pub(crate) active_target: Option<SocketAddr>,
    pub(crate) pbsz_done: bool,
    pub(crate) prot_private: bool,
    pub(crate) rename_from: Option<VirtualPath>,
    pub(crate) rest_offset: u64,
    pub(crate) shutdown: watch::Receiver<bool>,
    cmd_window_start: Instant,
    cmds_in_window: u32,
    pub(crate) quitting: bool,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        runtime: Arc<ServerRuntime>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Session {
            id,
            runtime,
            stream: MaybeTlsStream::Plain(stream),
            inbuf: Vec::new(),
            peer,
            local,
            auth: AuthState::NotLoggedIn,
            user: None,
            extra_groups: Vec::new(),
            remote_ident: None,
            cwd: VirtualPath::root(),
            transfer_type: TransferType::Binary,
            pending_passive: None,
            active_target: None,
            pbsz_done: false,
            prot_private: false,
            rename_from: None,
            rest_offset: 0,
            shutdown,
            cmd_window_start: Instant::now(),
            cmds_in_window: 0,
            quitting: false,
        }
    }

    /// Runs the session to completion. All errors are absorbed here; the
    /// listener never sees them.
    pub async fn run(mut self) {
        info!(session = self.id, peer = %self.peer, "session started");
        let greeting = self.runtime.config.greeting.clone();
        if self.reply(Reply::new(220, greeting)).await.is_err() {
            self.finish().await;
            return;
        }

        loop {
            if self.quitting || *self.shutdown.borrow() {
                break;
            }
            let idle = self.idle_timeout();
            let line = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    let _ = self.reply(Reply::new(421, "Service shutting down.")).await;
                    break;
                }
                read = timeout(idle, read_line(&mut self.stream, &mut self.inbuf)) => {
                    match read {
                        Err(_) => {
                            let _ = self.reply(Reply::new(421, "Idle timeout, closing control connection.")).await;
                            break;
                        }
                        Ok(Ok(None)) => break,
                        Ok(Ok(Some(line))) => line,
                        Ok(Err(e)) => {
                            debug!(session = self.id, error = %e, "control read failed");
                            break;
                        }
                    }
                }
            };

            if let Err(e) = self.handle_line(&line).await {
                let closes = e.closes_session();
                let reply = match &e {
                    FtpError::Fatal(detail) => {
                        warn!(session = self.id, detail, "internal error");
                        Reply::new(421, "Internal error, closing control connection.")
                    }
                    other => Reply::new(other.reply_code(), other.to_string()),
                };
                if self.reply(reply).await.is_err() || closes {
                    break;
                }
            }
        }
        self.finish().await;
    }

    /// Parses and dispatches one command line.
    async fn handle_line(&mut self, line: &str) -> FtpResult<()> {
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a),
            None => (line.to_ascii_uppercase(), ""),
        };
        if verb.is_empty() {
            return Err(FtpError::syntax("Empty command"));
        }
        let masked_arg = if verb == "PASS" { "****" } else { arg };
        debug!(session = self.id, verb = %verb, arg = masked_arg, "command");

        self.runtime.stats.command_executed();
        let session_cpm = self.bump_command_rate();
        match self.runtime.abuse.record_command(self.peer.ip(), session_cpm) {
            AbuseDecision::None => {}
            AbuseDecision::Throttle(delay) => tokio::time::sleep(delay).await,
            AbuseDecision::Ban { duration, reason } => {
                self.runtime.bans.ban_ip(self.peer.ip(), Some(duration));
                let _ = self.reply(Reply::new(421, reason)).await;
                self.quitting = true;
                return Ok(());
            }
        }

        if self.auth != AuthState::LoggedIn && !unauthenticated_allowed(&verb) {
            return Err(FtpError::Auth("Please login with USER and PASS.".to_string()));
        }

        // REST arms only the immediately following command; the transfer
        // handlers read it before this reset.
        let result = commands::dispatch(self, &verb, arg).await;
        if verb != "REST" {
            self.rest_offset = 0;
        }
        result
    }

    fn bump_command_rate(&mut self) -> u32 {
        let now = Instant::now();
        if now.duration_since(self.cmd_window_start) > Duration::from_secs(60) {
            self.cmd_window_start = now;
            self.cmds_in_window = 0;
        }
        self.cmds_in_window += 1;
        self.cmds_in_window
    }

    /// Writes one reply and flushes. Replies are on the wire before the
    /// next command is read.
    pub(crate) async fn reply(&mut self, reply: Reply) -> FtpResult<()> {
        let wire = reply.to_wire();
        debug!(session = self.id, code = reply.code(), "reply");
        self.stream.write_all(wire.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.user
            .as_ref()
            .and_then(|u| u.idle_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.runtime.config.timeouts.idle())
    }

    /// Identity for VFS resolution: account groups plus IDENT-mapped
    /// groups.
    pub(crate) fn resolve_ctx(&self) -> ResolveCtx {
        match &self.user {
            Some(user) => {
                let mut groups = user.groups.clone();
                if let Some(primary) = &user.primary_group {
                    if !groups.iter().any(|g| g.eq_ignore_ascii_case(primary)) {
                        groups.push(primary.clone());
                    }
                }
                groups.extend(self.extra_groups.iter().cloned());
                ResolveCtx {
                    username: Some(user.name.clone()),
                    groups,
                    siteop: user.caps.siteop,
                }
            }
            None => ResolveCtx::anonymous(),
        }
    }

    /// The logged-in account or a 530.
    pub(crate) fn require_user(&self) -> FtpResult<&User> {
        self.user.as_ref().ok_or_else(|| FtpError::Auth("Not logged in.".to_string()))
    }

    pub(crate) fn emit(&self, kind: EventKind) -> Event {
        let mut event = Event::new(kind, self.id);
        if let Some(user) = &self.user {
            event = event.user(user.name.clone());
            if let Some(group) = &user.primary_group {
                event = event.group(group.clone());
            }
        }
        event.remote_host(self.peer.ip().to_string())
    }

    async fn finish(&mut self) {
        if self.auth == AuthState::LoggedIn {
            self.runtime.events.publish(self.emit(EventKind::Logout));
        }
        if let Some(user) = &self.user {
            self.runtime.release_login(&user.name);
        }
        let _ = self.stream.shutdown().await;
        self.runtime.deregister_session(self.id);
        self.runtime.stats.connection_closed();
        info!(session = self.id, peer = %self.peer, "session ended");
    }
}

/// Reads one CRLF-terminated line, buffering any pipelined surplus for
/// the next call. `None` means the peer closed the connection.
pub(crate) async fn read_line(
    stream: &mut MaybeTlsStream,
    inbuf: &mut Vec<u8>,
) -> FtpResult<Option<String>> {
    loop {
        if let Some(pos) = inbuf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = inbuf.drain(..=pos).collect();
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&line).to_string()));
        }
        if inbuf.len() > MAX_LINE {
            return Err(FtpError::syntax("Line too long"));
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        inbuf.extend_from_slice(&chunk[..n]);
    }
}

/// The verbs an unauthenticated session may issue.
fn unauthenticated_allowed(verb: &str) -> bool {
    matches!(
        verb,
        "USER" | "PASS" | "AUTH" | "PBSZ" | "PROT" | "FEAT" | "SYST" | "NOOP" | "OPTS" | "HELP"
            | "STAT" | "QUIT"
    )
}
