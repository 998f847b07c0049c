//! Command dispatch.
//!
//! The verb table is an explicit compile-time registry: every supported
//! command is enumerated here and routed to its handler module. SITE
//! subcommands go through the runtime's site registry, which wrappers
//! extend at startup.

mod access;
mod datachan;
mod fileops;
mod listing;
mod misc;
mod nav;
pub mod site;
mod transfer;

pub use site::{SiteArgs, SiteRegistry};

use crate::error::{FtpError, FtpResult};
use crate::script::{ScriptCommand, ScriptDecision};
use crate::session::Session;

/// Routes one parsed command to its handler. The script engine sees the
/// command first and may veto it.
pub(crate) async fn dispatch(session: &mut Session, verb: &str, arg: &str) -> FtpResult<()> {
    let engine = session.runtime.script.current();
    let decision = engine
        .authorize(&ScriptCommand {
            verb: verb.to_string(),
            argument: arg.to_string(),
            username: session.user.as_ref().map(|u| u.name.clone()),
            path: Some(session.cwd.as_str().to_string()),
            section: None,
        })
        .await;
    if let ScriptDecision::Deny(reason) = decision {
        return Err(FtpError::denied(reason));
    }

    match verb {
        "USER" => access::user(session, arg).await,
        "PASS" => access::pass(session, arg).await,
        "AUTH" => access::auth_tls(session, arg).await,
        "PBSZ" => access::pbsz(session, arg).await,
        "PROT" => access::prot(session, arg).await,
        "QUIT" => access::quit(session).await,

        "FEAT" => misc::feat(session).await,
        "SYST" => misc::syst(session).await,
        "NOOP" => misc::noop(session).await,
        "HELP" => misc::help(session).await,
        "OPTS" => misc::opts(session, arg).await,
        "TYPE" => misc::type_cmd(session, arg).await,
        "MODE" => misc::mode(session, arg).await,
        "STRU" => misc::stru(session, arg).await,
        "STAT" => misc::stat(session, arg).await,

        "PWD" | "XPWD" => nav::pwd(session).await,
        "CWD" => nav::cwd(session, arg).await,
        "CDUP" => nav::cdup(session).await,

        "MKD" | "XMKD" => fileops::mkd(session, arg).await,
        "RMD" | "XRMD" => fileops::rmd(session, arg).await,
        "DELE" => fileops::dele(session, arg).await,
        "RNFR" => fileops::rnfr(session, arg).await,
        "RNTO" => fileops::rnto(session, arg).await,

        "LIST" => listing::list(session, arg).await,
        "NLST" => listing::nlst(session, arg).await,
        "MLSD" => listing::mlsd(session, arg).await,
        "MLST" => listing::mlst(session, arg).await,
        "SIZE" => listing::size(session, arg).await,
        "MDTM" => listing::mdtm(session, arg).await,

        "PASV" => datachan::pasv(session).await,
        "EPSV" => datachan::epsv(session, arg).await,
        "PORT" => datachan::port(session, arg).await,
        "EPRT" => datachan::eprt(session, arg).await,
        "REST" => datachan::rest(session, arg).await,

        "RETR" => transfer::retr(session, arg).await,
        "STOR" => transfer::stor(session, arg, false).await,
        "APPE" => transfer::stor(session, arg, true).await,
        "ABOR" => transfer::abor(session).await,

        "SITE" => site::site(session, arg).await,

        _ => Err(FtpError::syntax("Command not understood")),
    }
}
