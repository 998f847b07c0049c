//! Directory listings and file facts: LIST, NLST, MLSD, MLST, SIZE,
//! MDTM.

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{FtpError, FtpResult};
use crate::policy::fxp::Direction;
use crate::reply::Reply;
use crate::session::Session;
use crate::vfs::{Resolution, VfsNode, VirtualPath};

use super::datachan;

/// Formats a node as a unix-style `LIST` line.
pub(crate) fn list_line(node: &VfsNode) -> String {
    let (kind, perms) = if node.is_dir() {
        ('d', if node.read_only { "r-xr-xr-x" } else { "rwxrwxr-x" })
    } else {
        ('-', if node.read_only { "r--r--r--" } else { "rw-rw-r--" })
    };
    let modified = node.meta.map(|m| m.modified_unix).unwrap_or(0);
    let when = DateTime::<Utc>::from_timestamp(modified, 0).unwrap_or_else(Utc::now);
    let age = Utc::now().signed_duration_since(when);
    let date = if age.num_days() > 180 || age.num_days() < -1 {
        when.format("%b %e  %Y")
    } else {
        when.format("%b %e %H:%M")
    };
    format!(
        "{kind}{perms}   1 ftp      ftp      {:>12} {date} {}",
        node.size(),
        node.name()
    )
}

/// Formats a node as one MLSD/MLST fact line: semicolon-separated facts
/// terminated by `"; name"`.
pub(crate) fn mlsx_line(node: &VfsNode) -> String {
    let kind = if node.is_dir() { "dir" } else { "file" };
    let perm = match (node.is_dir(), node.read_only) {
        (true, true) => "el",
        (true, false) => "elcmf",
        (false, true) => "rl",
        (false, false) => "rldfw",
    };
    let modified = node.meta.map(|m| m.modified_unix).unwrap_or(0);
    let modify = DateTime::<Utc>::from_timestamp(modified, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S");
    format!(
        "type={kind};size={};modify={modify};perm={perm}; {}",
        node.size(),
        node.name()
    )
}

/// Resolves a listing target: the cwd when no argument, flags stripped.
fn listing_target(session: &Session, arg: &str) -> FtpResult<VirtualPath> {
    let cleaned: Vec<&str> =
        arg.split_whitespace().filter(|w| !w.starts_with('-')).collect();
    let arg = cleaned.join(" ");
    if arg.is_empty() {
        Ok(session.cwd.clone())
    } else {
        session.cwd.join(&arg)
    }
}

async fn resolve_dir(session: &Session, path: &VirtualPath) -> FtpResult<VfsNode> {
    let ctx = session.resolve_ctx();
    match session.runtime.resolver.resolve(&ctx, path).await {
        Resolution::Found(node) => Ok(node),
        Resolution::NotFound(msg) => Err(FtpError::denied(msg)),
        Resolution::Denied(msg) => Err(FtpError::denied(msg)),
    }
}

/// Streams rendered lines over a freshly opened data channel. Shared by
/// the three listing commands.
async fn send_over_data(session: &mut Session, path: &VirtualPath, lines: Vec<String>) -> FtpResult<()> {
    datachan::precheck_active_fxp(session, Direction::Outgoing, path)?;
    session
        .reply(Reply::new(150, "Opening data connection for directory listing."))
        .await?;
    let mut data = datachan::open_data(session, Direction::Outgoing, path).await?;
    let mut payload = lines.join("\r\n");
    if !payload.is_empty() {
        payload.push_str("\r\n");
    }
    let mut src = std::io::Cursor::new(payload.into_bytes());
    let progress = session.runtime.config.timeouts.transfer_progress();
    crate::data::pump(&mut src, &mut data, None, progress, |_| {}).await?;
    data.shutdown().await?;
    session.reply(Reply::new(226, "Transfer complete.")).await
}

pub(crate) async fn list(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    let path = listing_target(session, arg)?;
    let node = resolve_dir(session, &path).await?;
    let ctx = session.resolve_ctx();
    let lines: Vec<String> = if node.is_dir() {
        let children = session.runtime.resolver.list(&ctx, &node.virtual_path).await;
        children.iter().map(list_line).collect()
    } else {
        vec![list_line(&node)]
    };
    send_over_data(session, &path, lines).await
}

pub(crate) async fn nlst(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    let path = listing_target(session, arg)?;
    let node = resolve_dir(session, &path).await?;
    let ctx = session.resolve_ctx();
    let lines: Vec<String> = if node.is_dir() {
        let children = session.runtime.resolver.list(&ctx, &node.virtual_path).await;
        children.iter().map(|n| n.name()).collect()
    } else {
        vec![node.name()]
    };
    send_over_data(session, &path, lines).await
}

pub(crate) async fn mlsd(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    let path = listing_target(session, arg)?;
    let node = resolve_dir(session, &path).await?;
    if !node.is_dir() {
        return Err(FtpError::denied("Not a directory"));
    }
    let ctx = session.resolve_ctx();
    let children = session.runtime.resolver.list(&ctx, &node.virtual_path).await;
    let lines: Vec<String> = children.iter().map(mlsx_line).collect();
    send_over_data(session, &path, lines).await
}

pub(crate) async fn mlst(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    let path =
        if arg.trim().is_empty() { session.cwd.clone() } else { session.cwd.join(arg)? };
    let node = resolve_dir(session, &path).await?;
    let lines = vec![
        format!("Listing {path}"),
        mlsx_line(&node),
        "End".to_string(),
    ];
    session.reply(Reply::multi(250, lines)).await
}

pub(crate) async fn size(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("SIZE requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let node = resolve_dir(session, &path).await?;
    if node.is_dir() {
        return Err(FtpError::denied("Not a plain file"));
    }
    session.reply(Reply::new(213, node.size().to_string())).await
}

pub(crate) async fn mdtm(session: &mut Session, arg: &str) -> FtpResult<()> {
    session.require_user()?;
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("MDTM requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let node = resolve_dir(session, &path).await?;
    let modified = node.meta.map(|m| m.modified_unix).unwrap_or(0);
    let stamp = DateTime::<Utc>::from_timestamp(modified, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S");
    session.reply(Reply::new(213, stamp.to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::NodeMeta;

    fn file_node(name: &str, size: u64, read_only: bool) -> VfsNode {
        let mut node = VfsNode::physical_file(
            VirtualPath::parse(&format!("/x/{name}")).unwrap(),
            std::path::PathBuf::from("/tmp/x"),
            NodeMeta { size, modified_unix: 1_700_000_000 },
            read_only,
        );
        node.read_only = read_only;
        node
    }

    #[test]
    fn mlsx_line_shape() {
        let line = mlsx_line(&file_node("tool.r00", 1234, false));
        // Facts are semicolon-separated and the name follows "; ".
        assert!(line.starts_with("type=file;size=1234;modify="), "{line}");
        assert!(line.ends_with("; tool.r00"), "{line}");
        assert!(line.contains(";perm=rldfw;"), "{line}");

        let dir = VfsNode::virtual_dir(VirtualPath::parse("/x/sub").unwrap());
        let line = mlsx_line(&dir);
        assert!(line.starts_with("type=dir;"), "{line}");
        assert!(line.contains("perm=el;"), "{line}");
    }

    #[test]
    fn list_line_shape() {
        let line = list_line(&file_node("a.bin", 5, true));
        assert!(line.starts_with("-r--r--r--"), "{line}");
        assert!(line.ends_with(" a.bin"), "{line}");
        let line = list_line(&VfsNode::virtual_dir(VirtualPath::parse("/d").unwrap()));
        assert!(line.starts_with("dr-x"), "{line}");
    }
}
