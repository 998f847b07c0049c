//! Authentication and channel-security commands: USER, PASS, AUTH TLS,
//! PBSZ, PROT, QUIT.

use tracing::{debug, info, warn};

use crate::error::{FtpError, FtpResult};
use crate::events::EventKind;
use crate::policy::abuse::AbuseDecision;
use crate::reply::Reply;
use crate::session::stream::MaybeTlsStream;
use crate::session::{AuthState, Session};
use crate::vfs::VirtualPath;

pub(crate) async fn user(session: &mut Session, arg: &str) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_argument("USER requires a name"));
    }
    if session.auth == AuthState::LoggedIn {
        return Err(FtpError::bad_sequence("Already logged in."));
    }
    session.auth = AuthState::AwaitPass(name.to_string());
    session.reply(Reply::new(331, format!("Password required for {name}."))).await
}

pub(crate) async fn pass(session: &mut Session, arg: &str) -> FtpResult<()> {
    let AuthState::AwaitPass(name) = session.auth.clone() else {
        return Err(FtpError::bad_sequence("Login with USER first."));
    };
    session.auth = AuthState::NotLoggedIn;

    let Some(account) = session.runtime.users.authenticate(&name, arg) else {
        session.runtime.stats.login_failed();
        match session.runtime.abuse.record_failed_login(session.peer.ip()) {
            AbuseDecision::Ban { duration, reason } => {
                warn!(peer = %session.peer, %name, "login failures exceeded, banning");
                session.runtime.bans.ban_ip(session.peer.ip(), Some(duration));
                let _ = session.reply(Reply::new(530, reason)).await;
                session.quitting = true;
                return Ok(());
            }
            _ => return Err(FtpError::Auth("Login incorrect.".to_string())),
        }
    };

    if !account.ip_allowed(&session.peer.ip()) {
        session.runtime.stats.login_failed();
        return Err(FtpError::Auth("Connection not allowed from your address.".to_string()));
    }

    if !session.runtime.try_acquire_login(&account.name, account.max_logins) {
        return Err(FtpError::Auth("Too many concurrent logins.".to_string()));
    }

    // IDENT cross-check runs after password verification so identd load
    // is only spent on otherwise valid logins.
    if session.runtime.ident.config().enabled {
        let result = session.runtime.ident.query(session.peer, session.local).await;
        session.remote_ident = result.username.clone();

        if let Some(required) = &account.required_ident {
            let matches = result
                .username
                .as_deref()
                .map(|u| u.eq_ignore_ascii_case(required))
                .unwrap_or(false);
            if account.ident_must_match && !matches {
                session.runtime.release_login(&account.name);
                return Err(FtpError::Auth("IDENT verification failed.".to_string()));
            }
        }

        let ptr = if session.runtime.ident.config().reverse_dns_check {
            session.runtime.reverse_dns.reverse(session.peer.ip()).await
        } else {
            None
        };
        match session.runtime.ident.apply_policy(&result, &account.name, None, ptr.as_deref()) {
            Ok(groups) => session.extra_groups = groups,
            Err(reason) => {
                session.runtime.release_login(&account.name);
                return Err(FtpError::Auth(reason));
            }
        }
    }

    session.cwd = VirtualPath::parse(&account.home).unwrap_or_else(|_| VirtualPath::root());
    let username = account.name.clone();
    session.user = Some(account);
    session.auth = AuthState::LoggedIn;
    session.runtime.register_user(session.id, &username);
    info!(session = session.id, user = %username, "login");
    session.runtime.events.publish(session.emit(EventKind::Login));
    session.reply(Reply::new(230, format!("User {username} logged in."))).await
}

pub(crate) async fn auth_tls(session: &mut Session, arg: &str) -> FtpResult<()> {
    let mechanism = arg.trim();
    if !mechanism.eq_ignore_ascii_case("TLS") && !mechanism.eq_ignore_ascii_case("SSL") {
        return Err(FtpError::protocol(504, "Only AUTH TLS is supported"));
    }
    if session.stream.is_tls() {
        return Err(FtpError::bad_sequence("TLS already active."));
    }
    session.reply(Reply::new(234, "AUTH TLS successful.")).await?;

    // Anything the client pipelined before our 234 cannot survive the
    // handshake.
    if !session.inbuf.is_empty() {
        debug!(session = session.id, "discarding pre-handshake bytes");
        session.inbuf.clear();
    }

    let plain = match std::mem::replace(&mut session.stream, MaybeTlsStream::Detached) {
        MaybeTlsStream::Plain(stream) => stream,
        other => {
            session.stream = other;
            return Err(FtpError::Fatal("control stream in unexpected state".to_string()));
        }
    };
    let handshake = session.runtime.tls_acceptor.accept(plain);
    match tokio::time::timeout(session.runtime.config.timeouts.tls_handshake(), handshake).await {
        Ok(Ok(tls)) => {
            session.stream = MaybeTlsStream::Tls(Box::new(tls));
            info!(session = session.id, "control channel upgraded to TLS");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(session = session.id, error = %e, "TLS handshake failed");
            session.quitting = true;
            Err(FtpError::Cancelled)
        }
        Err(_) => {
            session.quitting = true;
            Err(FtpError::Timeout)
        }
    }
}

pub(crate) async fn pbsz(session: &mut Session, arg: &str) -> FtpResult<()> {
    if !session.stream.is_tls() {
        return Err(FtpError::bad_sequence("PBSZ requires a secured control connection."));
    }
    if arg.trim() != "0" {
        return Err(FtpError::bad_argument("Only PBSZ 0 is supported"));
    }
    session.pbsz_done = true;
    session.reply(Reply::new(200, "PBSZ=0")).await
}

pub(crate) async fn prot(session: &mut Session, arg: &str) -> FtpResult<()> {
    if !session.stream.is_tls() {
        return Err(FtpError::bad_sequence("PROT requires a secured control connection."));
    }
    if !session.pbsz_done {
        return Err(FtpError::bad_sequence("PBSZ must precede PROT."));
    }
    match arg.trim().to_ascii_uppercase().as_str() {
        "C" => {
            session.prot_private = false;
            session.reply(Reply::new(200, "Protection level set to Clear.")).await
        }
        "P" => {
            session.prot_private = true;
            session.reply(Reply::new(200, "Protection level set to Private.")).await
        }
        "S" | "E" => Err(FtpError::protocol(536, "Protection level not supported")),
        _ => Err(FtpError::bad_argument("Unknown protection level")),
    }
}

pub(crate) async fn quit(session: &mut Session) -> FtpResult<()> {
    session.quitting = true;
    session.reply(Reply::new(221, "Goodbye.")).await
}
