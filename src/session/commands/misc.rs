//! Housekeeping commands: FEAT, SYST, NOOP, HELP, OPTS, TYPE, MODE,
//! STRU, STAT.

use crate::error::{FtpError, FtpResult};
use crate::reply::Reply;
use crate::session::{Session, TransferType};
use crate::vfs::Resolution;

pub(crate) async fn feat(session: &mut Session) -> FtpResult<()> {
    let lines = [
        "Features:",
        "AUTH TLS",
        "PBSZ",
        "PROT",
        "EPRT",
        "EPSV",
        "MDTM",
        "MLST type*;size*;modify*;perm*;",
        "MLSD",
        "REST STREAM",
        "SIZE",
        "TVFS",
        "UTF8",
        "End",
    ];
    session.reply(Reply::multi(211, lines.map(String::from))).await
}

pub(crate) async fn syst(session: &mut Session) -> FtpResult<()> {
    session.reply(Reply::new(215, "UNIX Type: L8")).await
}

pub(crate) async fn noop(session: &mut Session) -> FtpResult<()> {
    session.reply(Reply::new(200, "NOOP command successful.")).await
}

pub(crate) async fn help(session: &mut Session) -> FtpResult<()> {
    let lines = [
        "The following commands are recognized:",
        "USER PASS AUTH PBSZ PROT FEAT SYST HELP NOOP OPTS QUIT",
        "TYPE MODE STRU PWD CWD CDUP MKD RMD DELE RNFR RNTO",
        "LIST NLST MLSD MLST STAT SIZE MDTM REST PASV EPSV PORT EPRT",
        "RETR STOR APPE ABOR SITE",
        "Help complete.",
    ];
    session.reply(Reply::multi(214, lines.map(String::from))).await
}

pub(crate) async fn opts(session: &mut Session, arg: &str) -> FtpResult<()> {
    let upper = arg.trim().to_ascii_uppercase();
    if upper == "UTF8 ON" || upper == "UTF8" {
        return session.reply(Reply::new(200, "Always in UTF8 mode.")).await;
    }
    if upper.starts_with("MLST") {
        return session.reply(Reply::new(200, "MLST OPTS type;size;modify;perm;")).await;
    }
    Err(FtpError::bad_argument("Option not understood"))
}

pub(crate) async fn type_cmd(session: &mut Session, arg: &str) -> FtpResult<()> {
    match arg.trim().to_ascii_uppercase().as_str() {
        "A" | "A N" => {
            session.transfer_type = TransferType::Ascii;
            session.reply(Reply::new(200, "Type set to A.")).await
        }
        "I" | "L 8" => {
            session.transfer_type = TransferType::Binary;
            session.reply(Reply::new(200, "Type set to I.")).await
        }
        _ => Err(FtpError::protocol(504, "Type not supported")),
    }
}

pub(crate) async fn mode(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().eq_ignore_ascii_case("S") {
        session.reply(Reply::new(200, "Mode set to S.")).await
    } else {
        Err(FtpError::protocol(504, "Only stream mode is supported"))
    }
}

pub(crate) async fn stru(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().eq_ignore_ascii_case("F") {
        session.reply(Reply::new(200, "Structure set to F.")).await
    } else {
        Err(FtpError::protocol(504, "Only file structure is supported"))
    }
}

/// STAT without an argument reports session state over the control
/// channel; with a path it lists matching entries inline.
pub(crate) async fn stat(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        let user = session
            .user
            .as_ref()
            .map(|u| u.name.clone())
            .unwrap_or_else(|| "not logged in".to_string());
        let lines = vec![
            format!("{} FTP server status:", session.runtime.config.greeting),
            format!("Connected from {}", session.peer),
            format!("Logged in as {user}"),
            format!(
                "TYPE: {}",
                match session.transfer_type {
                    TransferType::Ascii => "ASCII",
                    TransferType::Binary => "Image",
                }
            ),
            "End of status".to_string(),
        ];
        return session.reply(Reply::multi(211, lines)).await;
    }

    // Inline listing; only meaningful once logged in.
    session.require_user()?;
    let path = session.cwd.join(arg)?;
    let ctx = session.resolve_ctx();
    match session.runtime.resolver.resolve(&ctx, &path).await {
        Resolution::Found(node) if node.is_dir() => {
            let children = session.runtime.resolver.list(&ctx, &node.virtual_path).await;
            let mut lines = vec![format!("Status of {}:", path)];
            lines.extend(children.iter().map(super::listing::list_line));
            lines.push("End of status".to_string());
            session.reply(Reply::multi(213, lines)).await
        }
        Resolution::Found(node) => {
            let lines = vec![
                format!("Status of {}:", path),
                super::listing::list_line(&node),
                "End of status".to_string(),
            ];
            session.reply(Reply::multi(213, lines)).await
        }
        Resolution::NotFound(msg) | Resolution::Denied(msg) => Err(FtpError::denied(msg)),
    }
}
