//! Listener, session registry and the daemon construction API.
//!
//! [`FtpServer`] is built from a configuration record and a set of
//! stores, exposes `start`/`stop` and a status snapshot, and owns the
//! accept loop. Each accepted connection is checked against the ban list
//! and the session caps, then runs as its own task. Per-session errors
//! never propagate here, and graceful shutdown trips one cancellation
//! signal, waits out the grace period and force-closes stragglers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::dupe::DupeStore;
use crate::error::{FtpError, FtpResult};
use crate::events::{EventBus, Rates, RateSampler, Stats, StatsSnapshot};
use crate::ident::{IdentClient, NoReverseDns, ReverseDns};
use crate::policy::abuse::AbuseLimiter;
use crate::policy::bans::BanList;
use crate::script::ScriptHandle;
use crate::session::commands::SiteRegistry;
use crate::session::Session;
use crate::store::section::SectionStore;
use crate::store::user::UserStore;
use crate::vfs::physical::{MountTable, PhysicalProvider, SectionShortcutProvider};
use crate::vfs::pre::{PreProvider, PreRegistry};
use crate::vfs::release::{GroupProvider, ReleaseProvider, ReleaseRegistry};
use crate::vfs::{VfsProvider, VfsResolver};

/// The pluggable persistent state behind one daemon instance.
pub struct Stores {
    pub users: Arc<UserStore>,
    pub sections: Arc<SectionStore>,
    pub mounts: Arc<MountTable>,
    pub releases: Arc<ReleaseRegistry>,
    pub pres: Arc<PreRegistry>,
    pub dupes: Arc<DupeStore>,
}

impl Stores {
    /// Opens every store persisted under one base directory.
    pub fn open(base: impl AsRef<std::path::Path>) -> FtpResult<Self> {
        let base = base.as_ref();
        std::fs::create_dir_all(base)?;
        Ok(Stores {
            users: Arc::new(UserStore::open(base)?),
            sections: Arc::new(SectionStore::open(base)?),
            mounts: Arc::new(MountTable::new()),
            releases: Arc::new(ReleaseRegistry::open(base.join("releases.json"))?),
            pres: Arc::new(PreRegistry::open(base.join("pre.json"))?),
            dupes: Arc::new(DupeStore::open(base.join("dupes"))?),
        })
    }
}

/// One registered session, as the registry sees it. The abort handle is
/// attached right after the task is spawned.
struct SessionInfo {
    peer: SocketAddr,
    user: Option<String>,
    started_unix: i64,
    abort: Option<AbortHandle>,
}

/// Process-wide state shared by the listener and every session. Sessions
/// hold this behind an `Arc`; nothing global.
pub struct ServerRuntime {
    pub config: DaemonConfig,
    pub users: Arc<UserStore>,
    pub sections: Arc<SectionStore>,
    pub mounts: Arc<MountTable>,
    pub resolver: Arc<VfsResolver>,
    pub releases: Arc<ReleaseRegistry>,
    pub pres: Arc<PreRegistry>,
    pub dupes: Arc<DupeStore>,
    pub events: Arc<EventBus>,
    pub stats: Arc<Stats>,
    pub sampler: Arc<RateSampler>,
    pub abuse: Arc<AbuseLimiter>,
    pub bans: Arc<BanList>,
    pub ident: Arc<IdentClient>,
    pub reverse_dns: Arc<dyn ReverseDns>,
    pub script: Arc<ScriptHandle>,
    pub site_commands: Arc<SiteRegistry>,
    pub tls_acceptor: tokio_rustls::TlsAcceptor,
    sessions: Mutex<HashMap<u64, SessionInfo>>,
    login_counts: Mutex<HashMap<String, u32>>,
    next_session_id: AtomicU64,
}

impl ServerRuntime {
    fn next_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register_session(&self, id: u64, info: SessionInfo) {
        self.sessions.lock().expect("session registry lock poisoned").insert(id, info);
    }

    /// No-op when the session already finished and deregistered itself.
    fn set_abort_handle(&self, id: u64, abort: AbortHandle) {
        if let Some(info) =
            self.sessions.lock().expect("session registry lock poisoned").get_mut(&id)
        {
            info.abort = Some(abort);
        }
    }

    pub(crate) fn deregister_session(&self, id: u64) {
        self.sessions.lock().expect("session registry lock poisoned").remove(&id);
    }

    /// Marks a session as logged in under `user` in the registry.
    pub(crate) fn register_user(&self, id: u64, user: &str) {
        if let Some(info) =
            self.sessions.lock().expect("session registry lock poisoned").get_mut(&id)
        {
            info.user = Some(user.to_string());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session registry lock poisoned").len()
    }

    fn connections_from(&self, ip: &std::net::IpAddr) -> u32 {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .values()
            .filter(|info| info.peer.ip() == *ip)
            .count() as u32
    }

    /// Admission check for the concurrent-login limit.
    pub(crate) fn try_acquire_login(&self, user: &str, max_logins: u32) -> bool {
        let key = crate::vfs::path::fold_key(user);
        let mut counts = self.login_counts.lock().expect("login count lock poisoned");
        let count = counts.entry(key).or_insert(0);
        if max_logins > 0 && *count >= max_logins {
            return false;
        }
        *count += 1;
        true
    }

    pub(crate) fn release_login(&self, user: &str) {
        let key = crate::vfs::path::fold_key(user);
        let mut counts = self.login_counts.lock().expect("login count lock poisoned");
        if let Some(count) = counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&key);
            }
        }
    }

    fn session_summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .iter()
            .map(|(id, info)| SessionSummary {
                id: *id,
                peer: info.peer.to_string(),
                user: info.user.clone(),
                started_unix: info.started_unix,
            })
            .collect()
    }

    fn abort_all_sessions(&self) {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        for info in sessions.values() {
            if let Some(abort) = &info.abort {
                abort.abort();
            }
        }
    }
}

/// One row of the status snapshot's session table.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub peer: String,
    pub user: Option<String>,
    pub started_unix: i64,
}

/// Point-in-time view of the whole daemon.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub listening: Option<String>,
    pub stats: StatsSnapshot,
    pub rates_5s: Rates,
    pub rates_1m: Rates,
    pub rates_5m: Rates,
    pub sessions: Vec<SessionSummary>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
    janitor_handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The startable daemon.
pub struct FtpServer {
    runtime: Arc<ServerRuntime>,
    running: Mutex<Option<Running>>,
}

impl FtpServer {
    /// Assembles a runtime from configuration and stores. The VFS
    /// provider chain is fixed: pre, release, group, physical, section
    /// shortcut.
    pub fn new(config: DaemonConfig, stores: Stores) -> FtpResult<Self> {
        let tls_acceptor = crate::tls::build_acceptor(&config.tls)?;
        let providers: Vec<Arc<dyn VfsProvider>> = vec![
            Arc::new(PreProvider::new(stores.pres.clone())),
            Arc::new(ReleaseProvider::new(stores.releases.clone())),
            Arc::new(GroupProvider::new(stores.releases.clone())),
            Arc::new(PhysicalProvider::new(stores.mounts.clone())),
            Arc::new(SectionShortcutProvider::new(stores.sections.clone())),
        ];
        let resolver = Arc::new(VfsResolver::new(providers));
        let ident = Arc::new(IdentClient::new(config.ident.clone(), config.timeouts.ident()));
        let abuse = Arc::new(AbuseLimiter::new(config.abuse.clone()));
        let runtime = Arc::new(ServerRuntime {
            users: stores.users,
            sections: stores.sections,
            mounts: stores.mounts,
            resolver,
            releases: stores.releases,
            pres: stores.pres,
            dupes: stores.dupes,
            events: Arc::new(EventBus::new()),
            stats: Arc::new(Stats::new()),
            sampler: Arc::new(RateSampler::new()),
            abuse,
            bans: Arc::new(BanList::new()),
            ident,
            reverse_dns: Arc::new(NoReverseDns),
            script: Arc::new(ScriptHandle::default()),
            site_commands: Arc::new(SiteRegistry::with_defaults()),
            tls_acceptor,
            sessions: Mutex::new(HashMap::new()),
            login_counts: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            config,
        });
        Ok(FtpServer { runtime, running: Mutex::new(None) })
    }

    /// Shared runtime handle, for wrappers that subscribe to events,
    /// register site commands or swap the script engine.
    pub fn runtime(&self) -> Arc<ServerRuntime> {
        self.runtime.clone()
    }

    /// Binds the listener and starts accepting. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&self) -> FtpResult<SocketAddr> {
        let mut running = self.running.lock().expect("server state lock poisoned");
        if running.is_some() {
            return Err(FtpError::Fatal("server already started".to_string()));
        }
        let bind = SocketAddr::new(self.runtime.config.bind_addr, self.runtime.config.port);
        let listener = std::net::TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_handle =
            tokio::spawn(accept_loop(listener, self.runtime.clone(), shutdown_rx.clone()));
        let janitor_handle = tokio::spawn(janitor_loop(self.runtime.clone(), shutdown_rx));
        *running = Some(Running { shutdown_tx, accept_handle, janitor_handle, local_addr });
        Ok(local_addr)
    }

    /// Graceful shutdown: stop accepting, cancel sessions, wait up to
    /// the grace period, then force-close stragglers.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().expect("server state lock poisoned").take()
        else {
            return;
        };
        info!("shutdown requested");
        let _ = running.shutdown_tx.send(true);
        running.accept_handle.abort();
        running.janitor_handle.abort();

        let grace = self.runtime.config.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        while self.runtime.session_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let stragglers = self.runtime.session_count();
        if stragglers > 0 {
            warn!(stragglers, "force-closing sessions after grace period");
            self.runtime.abort_all_sessions();
        }
        info!("shutdown complete");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().expect("server state lock poisoned").as_ref().map(|r| r.local_addr)
    }

    /// Status snapshot: counters, rolling rates, active sessions.
    pub fn status(&self) -> ServerStatus {
        let runtime = &self.runtime;
        ServerStatus {
            listening: self.local_addr().map(|a| a.to_string()),
            stats: runtime.stats.snapshot(),
            rates_5s: runtime.sampler.rate_over(Duration::from_secs(5)),
            rates_1m: runtime.sampler.rate_over(Duration::from_secs(60)),
            rates_5m: runtime.sampler.rate_over(Duration::from_secs(300)),
            sessions: runtime.session_summaries(),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    runtime: Arc<ServerRuntime>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        if runtime.bans.is_banned(&peer.ip()) {
            debug!(%peer, "rejecting banned peer");
            continue;
        }
        if runtime.session_count() >= runtime.config.max_sessions {
            let _ = socket.write_all(b"421 Too many connections.\r\n").await;
            continue;
        }
        if let Some(cap) = runtime.config.per_ip_connection_cap {
            if runtime.connections_from(&peer.ip()) >= cap {
                let _ = socket.write_all(b"421 Too many connections from your address.\r\n").await;
                continue;
            }
        }

        socket.set_nodelay(true).ok();
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(_) => continue,
        };
        runtime.stats.connection_opened();
        let id = runtime.next_id();
        let session =
            Session::new(id, runtime.clone(), socket, peer, local, shutdown.clone());
        // Register before spawning so the session cannot deregister
        // itself first.
        runtime.register_session(
            id,
            SessionInfo {
                peer,
                user: None,
                started_unix: chrono::Utc::now().timestamp(),
                abort: None,
            },
        );
        let handle = tokio::spawn(session.run());
        runtime.set_abort_handle(id, handle.abort_handle());
    }
    debug!("accept loop stopped");
}

/// Periodic maintenance: rate samples every five seconds, abuse-limiter
/// eviction once a minute.
async fn janitor_loop(runtime: Arc<ServerRuntime>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = 0u32;
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                runtime.sampler.record(&runtime.stats);
                tick += 1;
                if tick % 12 == 0 {
                    runtime.abuse.evict_idle();
                }
            }
        }
    }
}
