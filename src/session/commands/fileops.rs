//! Write commands on the namespace: MKD, RMD, DELE, RNFR, RNTO.
//!
//! All of them require the upload capability and a writable mount.
//! Creating a directory inside a section is treated as starting a
//! release, which is where duplicate detection fires: a release name
//! already present in the dupe store is refused.

use crate::error::{FtpError, FtpResult};
use crate::events::EventKind;
use crate::reply::Reply;
use crate::session::Session;
use crate::vfs::{NodeKind, Resolution, VirtualPath};

/// Maps the target for a write, rejecting read-only mounts.
pub(crate) fn writable_physical(
    session: &Session,
    path: &VirtualPath,
) -> FtpResult<std::path::PathBuf> {
    let user = session.require_user()?;
    if !user.caps.upload {
        return Err(FtpError::denied("Permission denied"));
    }
    let (physical, mount) = session
        .runtime
        .mounts
        .map_physical(Some(user.name.as_str()), path)
        .ok_or_else(|| FtpError::denied("No such file or directory"))?;
    if mount.read_only {
        return Err(FtpError::denied("Read-only filesystem"));
    }
    Ok(physical)
}

/// Whether `path` starts a new release inside `section`: a directory
/// created anywhere below a section root that is not the root itself.
fn release_name_for(session: &Session, path: &VirtualPath) -> Option<(String, String)> {
    let section = session.runtime.sections.section_for_path(path)?;
    let root = VirtualPath::parse(&section.virtual_root).ok()?;
    if path.depth() <= root.depth() {
        return None;
    }
    Some((section.name, path.file_name()?.to_string()))
}

pub(crate) async fn mkd(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("MKD requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let physical = writable_physical(session, &path)?;

    if let Some((section, release)) = release_name_for(session, &path) {
        if session.runtime.dupes.contains(&section, &release) {
            return Err(FtpError::denied(format!("Duplicate release: {release}")));
        }
    }

    tokio::fs::create_dir(&physical).await.map_err(map_fs_error)?;
    session.runtime.resolver.invalidate(&path);
    session.runtime.resolver.invalidate(&path.parent());
    session.runtime.events.publish(session.emit(EventKind::Mkdir).path(path.as_str()));
    let quoted = path.as_str().replace('"', "\"\"");
    session.reply(Reply::new(257, format!("\"{quoted}\" created."))).await
}

pub(crate) async fn rmd(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("RMD requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let node = resolve_existing(session, &path).await?;
    if node.kind != NodeKind::PhysicalDirectory {
        return Err(FtpError::denied("Not a removable directory"));
    }
    let physical = writable_physical(session, &path)?;
    tokio::fs::remove_dir(&physical).await.map_err(map_fs_error)?;
    session.runtime.resolver.invalidate(&path);
    session.runtime.resolver.invalidate(&path.parent());
    session.runtime.events.publish(session.emit(EventKind::Rmdir).path(path.as_str()));
    session.reply(Reply::new(250, "RMD command successful.")).await
}

pub(crate) async fn dele(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("DELE requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let node = resolve_existing(session, &path).await?;
    if node.kind != NodeKind::PhysicalFile {
        return Err(FtpError::denied("Not a removable file"));
    }
    let physical = writable_physical(session, &path)?;
    tokio::fs::remove_file(&physical).await.map_err(map_fs_error)?;
    session.runtime.resolver.invalidate(&path);
    session.runtime.resolver.invalidate(&path.parent());
    session
        .runtime
        .events
        .publish(session.emit(EventKind::Delete).path(path.as_str()).bytes(node.size()));
    session.reply(Reply::new(250, "DELE command successful.")).await
}

pub(crate) async fn rnfr(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("RNFR requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let node = resolve_existing(session, &path).await?;
    if !matches!(node.kind, NodeKind::PhysicalFile | NodeKind::PhysicalDirectory) {
        return Err(FtpError::denied("Cannot rename virtual entries"));
    }
    session.rename_from = Some(path);
    session.reply(Reply::new(350, "Ready for RNTO.")).await
}

pub(crate) async fn rnto(session: &mut Session, arg: &str) -> FtpResult<()> {
    let Some(source) = session.rename_from.take() else {
        return Err(FtpError::bad_sequence("RNFR required first."));
    };
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("RNTO requires a path"));
    }
    let target = session.cwd.join(arg)?;
    let source_physical = writable_physical(session, &source)?;
    let target_physical = writable_physical(session, &target)?;
    tokio::fs::rename(&source_physical, &target_physical).await.map_err(map_fs_error)?;
    for path in [&source, &target] {
        session.runtime.resolver.invalidate(path);
        session.runtime.resolver.invalidate(&path.parent());
    }
    session.reply(Reply::new(250, "Rename successful.")).await
}

async fn resolve_existing(
    session: &Session,
    path: &VirtualPath,
) -> FtpResult<crate::vfs::VfsNode> {
    let ctx = session.resolve_ctx();
    match session.runtime.resolver.resolve(&ctx, path).await {
        Resolution::Found(node) => Ok(node),
        Resolution::NotFound(msg) => Err(FtpError::denied(msg)),
        Resolution::Denied(msg) => Err(FtpError::denied(msg)),
    }
}

pub(crate) fn map_fs_error(e: std::io::Error) -> FtpError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => FtpError::denied("No such file or directory"),
        ErrorKind::PermissionDenied => FtpError::denied("Permission denied"),
        ErrorKind::AlreadyExists => FtpError::denied("Already exists"),
        ErrorKind::StorageFull => FtpError::Storage,
        _ => FtpError::Io(e),
    }
}
