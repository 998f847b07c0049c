//! SITE command registry.
//!
//! Site commands are an explicit verb-to-handler table built at startup;
//! wrappers extend it with their catalog. The core registers the handful
//! of commands that drive its own registries: DUPE search, NUKE/UNNUKE
//! and PRE labelling, plus the generated HELP.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

use crate::error::{FtpError, FtpResult};
use crate::events::EventKind;
use crate::reply::Reply;
use crate::session::Session;
use crate::store::user::User;
use crate::vfs::pre::PreEntry;
use crate::vfs::VirtualPath;

/// What a site handler gets to work with. Owned snapshot, so handlers
/// are plain `'static` futures.
pub struct SiteArgs {
    pub user: Option<User>,
    pub argument: String,
    pub runtime: Arc<crate::server::ServerRuntime>,
    pub session_id: u64,
}

pub type SiteHandler = Arc<dyn Fn(SiteArgs) -> BoxFuture<'static, FtpResult<Reply>> + Send + Sync>;

struct SiteEntry {
    help: &'static str,
    siteop_only: bool,
    handler: SiteHandler,
}

/// Verb table for SITE subcommands.
#[derive(Default)]
pub struct SiteRegistry {
    commands: RwLock<HashMap<String, SiteEntry>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        SiteRegistry::default()
    }

    /// The registry with the core's built-in commands.
    pub fn with_defaults() -> Self {
        let registry = SiteRegistry::new();
        registry.register("DUPE", "DUPE <pattern> - search the dupe database", false, |args| {
            Box::pin(async move {
                let pattern = args.argument.trim();
                if pattern.is_empty() {
                    return Err(FtpError::bad_argument("DUPE requires a pattern"));
                }
                let hits = args.runtime.dupes.search(pattern, 25)?;
                if hits.is_empty() {
                    return Ok(Reply::new(200, "No matches."));
                }
                let mut lines = vec![format!("Dupe matches for {pattern}:")];
                for hit in hits {
                    let status = if hit.is_nuked() { " [NUKED]" } else { "" };
                    lines.push(format!(
                        "{} / {} ({} files, {} bytes){status}",
                        hit.section, hit.release, hit.file_count, hit.total_bytes
                    ));
                }
                lines.push("End".to_string());
                Ok(Reply::multi(200, lines))
            })
        });
        registry.register(
            "NUKE",
            "NUKE <section> <release> <multiplier> <reason> - mark a release bad",
            true,
            |args| {
                Box::pin(async move {
                    let mut parts = args.argument.splitn(4, ' ');
                    let (Some(section), Some(release), Some(multiplier)) =
                        (parts.next(), parts.next(), parts.next())
                    else {
                        return Err(FtpError::bad_argument(
                            "NUKE <section> <release> <multiplier> <reason>",
                        ));
                    };
                    let reason = parts.next().unwrap_or("no reason").to_string();
                    let multiplier: f64 = multiplier
                        .parse()
                        .map_err(|_| FtpError::bad_argument("Bad multiplier"))?;
                    let Some(entry) =
                        args.runtime.releases.nuke(section, release, &reason, multiplier)?
                    else {
                        return Err(FtpError::denied("No such release"));
                    };
                    args.runtime.dupes.upsert(&entry.release)?;
                    let mut event =
                        crate::events::Event::new(EventKind::Nuke, args.session_id)
                            .section(section)
                            .path(entry.virtual_path.clone())
                            .reason(reason);
                    if let Some(user) = &args.user {
                        event = event.user(user.name.clone());
                    }
                    args.runtime.events.publish(event);
                    Ok(Reply::new(200, format!("{release} nuked.")))
                })
            },
        );
        registry.register("UNNUKE", "UNNUKE <section> <release> - clear a nuke", true, |args| {
            Box::pin(async move {
                let mut parts = args.argument.split_whitespace();
                let (Some(section), Some(release)) = (parts.next(), parts.next()) else {
                    return Err(FtpError::bad_argument("UNNUKE <section> <release>"));
                };
                let Some(entry) = args.runtime.releases.unnuke(section, release)? else {
                    return Err(FtpError::denied("No such release"));
                };
                args.runtime.dupes.upsert(&entry.release)?;
                let mut event = crate::events::Event::new(EventKind::Unnuke, args.session_id)
                    .section(section)
                    .path(entry.virtual_path.clone());
                if let Some(user) = &args.user {
                    event = event.user(user.name.clone());
                }
                args.runtime.events.publish(event);
                Ok(Reply::new(200, format!("{release} unnuked.")))
            })
        });
        registry.register("PRE", "PRE <section> <path> - announce a release", false, |args| {
            Box::pin(async move {
                let Some(user) = args.user.clone() else {
                    return Err(FtpError::Auth("Not logged in.".to_string()));
                };
                let mut parts = args.argument.split_whitespace();
                let (Some(section), Some(raw_path)) = (parts.next(), parts.next()) else {
                    return Err(FtpError::bad_argument("PRE <section> <path>"));
                };
                let path = VirtualPath::parse(raw_path)?;
                let release = path
                    .file_name()
                    .ok_or_else(|| FtpError::bad_argument("PRE path needs a release name"))?
                    .to_string();
                let group = user.primary_group.clone().unwrap_or_default();
                args.runtime.pres.add(PreEntry {
                    section: section.to_string(),
                    release: release.clone(),
                    virtual_path: path.as_str().to_string(),
                    user: user.name.clone(),
                    group: group.clone(),
                    timestamp_unix: chrono::Utc::now().timestamp(),
                })?;
                args.runtime.events.publish(
                    crate::events::Event::new(EventKind::Pre, args.session_id)
                        .user(user.name.clone())
                        .group(group)
                        .section(section)
                        .path(path.as_str()),
                );
                Ok(Reply::new(200, format!("{release} pre'd.")))
            })
        });
        registry
    }

    /// Registers (or replaces) a verb.
    pub fn register(
        &self,
        verb: &str,
        help: &'static str,
        siteop_only: bool,
        handler: impl Fn(SiteArgs) -> BoxFuture<'static, FtpResult<Reply>> + Send + Sync + 'static,
    ) {
        self.commands.write().expect("site registry lock poisoned").insert(
            verb.to_ascii_uppercase(),
            SiteEntry { help, siteop_only, handler: Arc::new(handler) },
        );
    }

    fn lookup(&self, verb: &str) -> Option<(SiteHandler, bool)> {
        self.commands
            .read()
            .expect("site registry lock poisoned")
            .get(&verb.to_ascii_uppercase())
            .map(|e| (e.handler.clone(), e.siteop_only))
    }

    fn help_lines(&self, siteop: bool) -> Vec<String> {
        let commands = self.commands.read().expect("site registry lock poisoned");
        let mut lines: Vec<String> = commands
            .iter()
            .filter(|(_, e)| siteop || !e.siteop_only)
            .map(|(_, e)| e.help.to_string())
            .collect();
        lines.sort();
        lines
    }
}

pub(crate) async fn site(session: &mut Session, arg: &str) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let (verb, rest) = match arg.trim().split_once(' ') {
        Some((v, r)) => (v.to_ascii_uppercase(), r.to_string()),
        None => (arg.trim().to_ascii_uppercase(), String::new()),
    };
    if verb.is_empty() || verb == "HELP" {
        let mut lines = vec!["SITE commands:".to_string()];
        lines.extend(session.runtime.site_commands.help_lines(user.caps.siteop));
        lines.push("End".to_string());
        return session.reply(Reply::multi(214, lines)).await;
    }
    let Some((handler, siteop_only)) = session.runtime.site_commands.lookup(&verb) else {
        return Err(FtpError::syntax("SITE command not understood"));
    };
    if siteop_only && !user.caps.siteop {
        return Err(FtpError::denied("Siteop only"));
    }
    let args = SiteArgs {
        user: Some(user),
        argument: rest,
        runtime: session.runtime.clone(),
        session_id: session.id,
    };
    let reply = handler(args).await?;
    session.reply(reply).await
}
