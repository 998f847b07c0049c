use std::path::PathBuf;

use anyhow::Context;

use amftpd::config::DaemonConfig;
use amftpd::server::{FtpServer, Stores};
use amftpd::store::section::Section;
use amftpd::store::user::{Capabilities, User};
use amftpd::vfs::physical::Mount;
use amftpd::vfs::VirtualPath;

/// Main entry point for the basic server demo
///
/// Initializes the tracing subscriber, seeds a site with one siteop, one
/// section and one mount over the supplied directory, then serves FTP on
/// port 2121 until Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let mut path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                eprintln!(
                    "Usage: basic_server <DIRECTORY>\n\
                     \n\
                     Serves DIRECTORY as section APPS on 127.0.0.1:2121.\n\
                     Login: admin / admin"
                );
                return Ok(());
            }
            _ if arg.starts_with('-') => {
                anyhow::bail!("unknown flag {arg}, run with --help for usage");
            }
            _ => {
                if path.is_some() {
                    anyhow::bail!("unexpected extra argument {arg}");
                }
                path = Some(PathBuf::from(arg));
            }
        }
    }
    let path = path.context("must supply a directory to serve")?;

    let state_dir = std::env::temp_dir().join("amftpd-demo");
    let stores = Stores::open(&state_dir).context("cannot open stores")?;

    let mut admin = User::new("admin", "admin");
    admin.caps = Capabilities { siteop: true, fxp: true, ..Capabilities::default() };
    admin.credits_kib = 1 << 20;
    stores.users.upsert_user(admin).context("cannot seed admin user")?;

    let mut section = Section::new("APPS", "/apps");
    section.upload_multiplier = 3.0;
    stores.sections.upsert(section).context("cannot seed section")?;
    stores.mounts.add(Mount::new(
        VirtualPath::parse("/apps").expect("static path"),
        &path,
    ));

    let config = DaemonConfig {
        bind_addr: "127.0.0.1".parse().expect("static address"),
        port: 2121,
        greeting: "amftpd demo ready.".to_string(),
        ..DaemonConfig::default()
    };

    let server = FtpServer::new(config, stores).context("cannot build server")?;
    let runtime = server.runtime();
    runtime.events.subscribe(|event| {
        eprintln!("event: {:?} {:?} {:?}", event.kind, event.user, event.path);
    });

    let addr = server.start().await.context("cannot start server")?;
    eprintln!("serving {} on ftp://{addr} (admin/admin)", path.display());

    tokio::signal::ctrl_c().await.ok();
    server.stop().await;
    let status = server.status();
    eprintln!("status at exit: {}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
