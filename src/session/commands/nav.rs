//! Directory navigation: PWD, CWD, CDUP.

use crate::error::{FtpError, FtpResult};
use crate::reply::Reply;
use crate::session::Session;
use crate::vfs::Resolution;

pub(crate) async fn pwd(session: &mut Session) -> FtpResult<()> {
    let cwd = session.cwd.as_str().replace('"', "\"\"");
    session.reply(Reply::new(257, format!("\"{cwd}\" is the current directory."))).await
}

pub(crate) async fn cwd(session: &mut Session, arg: &str) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("CWD requires a path"));
    }
    let target = session.cwd.join(arg)?;
    let ctx = session.resolve_ctx();
    match session.runtime.resolver.resolve(&ctx, &target).await {
        Resolution::Found(node) if node.is_dir() => {
            // Shortcut providers return the redirect target as the node's
            // virtual path; following it here is what makes `CWD /APPS`
            // land in the section root.
            session.cwd = node.virtual_path;
            session
                .reply(Reply::new(250, format!("CWD successful. \"{}\"", session.cwd)))
                .await
        }
        Resolution::Found(_) => Err(FtpError::denied("Not a directory")),
        Resolution::NotFound(msg) => Err(FtpError::denied(msg)),
        Resolution::Denied(msg) => Err(FtpError::denied(msg)),
    }
}

pub(crate) async fn cdup(session: &mut Session) -> FtpResult<()> {
    session.cwd = session.cwd.parent();
    session.reply(Reply::new(250, format!("CWD successful. \"{}\"", session.cwd))).await
}
