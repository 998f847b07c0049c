//! Data-channel negotiation commands (PASV, EPSV, PORT, EPRT, REST) and
//! the shared establishment path every transfer and listing goes
//! through.
//!
//! FXP detection lives here: a PORT/EPRT target or an accepted passive
//! peer that is not the control peer makes the transfer server-to-server,
//! and the policy engine is consulted before any payload can flow. For
//! active mode the engine runs before the connect attempt, so a denied
//! bounce never even opens a socket.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::data;
use crate::error::{FtpError, FtpResult};
use crate::policy::fxp::{evaluate_fxp, Direction, FxpRequest, FxpVerdict};
use crate::reply::Reply;
use crate::session::stream::MaybeTlsStream;
use crate::session::Session;
use crate::vfs::VirtualPath;

pub(crate) async fn pasv(session: &mut Session) -> FtpResult<()> {
    session.require_user()?;
    let bind_ip = session.local.ip();
    let advertised = session.runtime.config.advertised_addr.unwrap_or(bind_ip);
    if !matches!(advertised, IpAddr::V4(_)) {
        return Err(FtpError::protocol(522, "Use EPSV for this address family"));
    }
    let socket = data::open_passive(
        bind_ip,
        advertised,
        session.runtime.config.passive_port_min,
        session.runtime.config.passive_port_max,
    )
    .await?;
    let body = socket
        .pasv_reply_body()
        .ok_or_else(|| FtpError::protocol(522, "Use EPSV for this address family"))?;
    // A fresh PASV replaces (and thereby closes) any pending listener.
    session.pending_passive = Some(socket);
    session.active_target = None;
    session.reply(Reply::new(227, format!("Entering Passive Mode ({body})."))).await
}

pub(crate) async fn epsv(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    if arg.trim().eq_ignore_ascii_case("ALL") {
        // After EPSV ALL we would be entitled to refuse PORT; accepting
        // the restriction is all a minimal peer needs.
        return session.reply(Reply::new(200, "EPSV ALL ok.")).await;
    }
    let bind_ip = session.local.ip();
    let advertised = session.runtime.config.advertised_addr.unwrap_or(bind_ip);
    let socket = data::open_passive(
        bind_ip,
        advertised,
        session.runtime.config.passive_port_min,
        session.runtime.config.passive_port_max,
    )
    .await?;
    let port = socket.port;
    session.pending_passive = Some(socket);
    session.active_target = None;
    session
        .reply(Reply::new(229, format!("Entering Extended Passive Mode (|||{port}|)")))
        .await
}

pub(crate) async fn port(session: &mut Session, arg: &str) -> FtpResult<()> {
    let target = data::parse_port_target(arg)?;
    prepare_active(session, target).await
}

pub(crate) async fn eprt(session: &mut Session, arg: &str) -> FtpResult<()> {
    let target = data::parse_eprt_target(arg)?;
    prepare_active(session, target).await
}

async fn prepare_active(session: &mut Session, target: SocketAddr) -> FtpResult<()> {
    let user = session.require_user()?;
    if !user.caps.active_mode {
        return Err(FtpError::denied("Active mode not permitted"));
    }
    // The target family must match the control connection's family.
    if target.is_ipv4() != session.peer.is_ipv4() {
        return Err(FtpError::protocol(522, "Network protocol mismatch"));
    }
    if target.ip() != session.peer.ip() {
        // Third-party target: this will be an FXP transfer. Run the
        // direction-independent checks now so a forbidden bounce is
        // refused at the PORT and nothing is ever connected.
        let verdict = evaluate_for(session, Direction::Outgoing, target.ip(), &session.cwd);
        if let FxpVerdict::Deny(reason) = verdict {
            return Err(FtpError::denied(reason));
        }
    }
    session.active_target = Some(target);
    session.pending_passive = None;
    session.reply(Reply::new(200, "PORT command successful.")).await
}

pub(crate) async fn rest(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    let offset: u64 =
        arg.trim().parse().map_err(|_| FtpError::bad_argument("Bad REST offset"))?;
    session.rest_offset = offset;
    session
        .reply(Reply::new(350, format!("Restarting at {offset}. Send STOR or RETR.")))
        .await
}

/// Builds the normalized request descriptor for the policy engine.
fn compose_request(
    session: &Session,
    direction: Direction,
    remote_ip: IpAddr,
    path: &VirtualPath,
) -> FxpRequest {
    let user = session.user.as_ref();
    let section = session.runtime.sections.section_for_path(path).map(|s| s.name);
    let control_version = session.stream.tls_version();
    FxpRequest {
        username: user.map(|u| u.name.clone()).unwrap_or_default(),
        is_admin: user.map(|u| u.caps.siteop).unwrap_or(false),
        user_fxp_flag: user.map(|u| u.caps.fxp).unwrap_or(false),
        section,
        path: path.as_str().to_string(),
        direction,
        remote_ip,
        remote_host: None,
        remote_ident: session.remote_ident.clone(),
        required_ident: user.and_then(|u| u.required_ident.clone()),
        control_peer_ip: session.peer.ip(),
        control_tls: session.stream.is_tls(),
        data_tls: session.prot_private,
        data_protected: session.prot_private,
        control_tls_version: control_version,
        // Both legs terminate in the same rustls configuration, so the
        // control floor is the best pre-handshake estimate for the data
        // leg.
        data_tls_version: if session.prot_private { control_version } else { None },
    }
}

fn evaluate_for(
    session: &Session,
    direction: Direction,
    remote_ip: IpAddr,
    path: &VirtualPath,
) -> FxpVerdict {
    let request = compose_request(session, direction, remote_ip, path);
    let verdict = evaluate_fxp(&session.runtime.config.fxp, &request);
    debug!(
        session = session.id,
        remote = %remote_ip,
        ?direction,
        allowed = verdict.is_allowed(),
        "FXP evaluation"
    );
    verdict
}

/// For active mode the policy runs before the 150 reply and before any
/// connection attempt. Passive peers are only known after the accept, so
/// this is a no-op there.
pub(crate) fn precheck_active_fxp(
    session: &Session,
    direction: Direction,
    path: &VirtualPath,
) -> FtpResult<()> {
    if let Some(target) = session.active_target {
        if target.ip() != session.peer.ip() {
            if let FxpVerdict::Deny(reason) = evaluate_for(session, direction, target.ip(), path) {
                return Err(FtpError::denied(reason));
            }
        }
    }
    Ok(())
}

/// Consumes the pending endpoint configuration and produces a ready data
/// stream, TLS-wrapped when `PROT P` is in effect.
pub(crate) async fn open_data(
    session: &mut Session,
    direction: Direction,
    path: &VirtualPath,
) -> FtpResult<MaybeTlsStream> {
    let timeouts = session.runtime.config.timeouts.clone();
    let stream = if let Some(target) = session.active_target.take() {
        if target.ip() != session.peer.ip() {
            if let FxpVerdict::Deny(reason) = evaluate_for(session, direction, target.ip(), path) {
                return Err(FtpError::denied(reason));
            }
        }
        data::connect_active(target, timeouts.data_establish()).await?
    } else if let Some(pending) = session.pending_passive.take() {
        let (stream, peer) = data::accept_passive(pending, timeouts.data_establish()).await?;
        if peer.ip() != session.peer.ip() {
            if let FxpVerdict::Deny(reason) = evaluate_for(session, direction, peer.ip(), path) {
                drop(stream);
                return Err(FtpError::denied(reason));
            }
        }
        stream
    } else {
        return Err(FtpError::protocol(425, "Use PORT or PASV first"));
    };

    let acceptor = session.prot_private.then(|| &session.runtime.tls_acceptor);
    data::protect_data_socket(stream, acceptor, timeouts.tls_handshake()).await
}
