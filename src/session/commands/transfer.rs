//! File transfers: RETR, STOR, APPE, ABOR.
//!
//! The transfer loop runs inside the session task and keeps watching the
//! control channel, so an ABOR (or QUIT) interrupts the stream and is
//! answered with 426 followed by 226. Byte counters, rate shaping,
//! credits, the release registry and the dupe store are all settled
//! here.

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::credit;
use crate::data::{TokenBucket, CHUNK_SIZE};
use crate::error::{FtpError, FtpResult};
use crate::events::EventKind;
use crate::policy::fxp::Direction;
use crate::reply::Reply;
use crate::session::{read_line, Session};
use crate::vfs::{Resolution, VirtualPath};

use super::datachan;
use super::fileops::map_fs_error;

pub(crate) async fn retr(session: &mut Session, arg: &str) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    if !user.caps.download {
        return Err(FtpError::denied("Permission denied"));
    }
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("RETR requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let ctx = session.resolve_ctx();
    let node = match session.runtime.resolver.resolve(&ctx, &path).await {
        Resolution::Found(node) => node,
        Resolution::NotFound(msg) | Resolution::Denied(msg) => {
            return Err(FtpError::denied(msg))
        }
    };
    if !node.is_file() {
        return Err(FtpError::denied("Not a plain file"));
    }

    // Price the download before anything touches the wire.
    let section = session.runtime.sections.section_for_path(&node.virtual_path);
    let rules = match &section {
        Some(s) => {
            session.runtime.script.current().ratio_overrides(&user.name, &s.name).await
        }
        None => credit::RuleAdjust::default(),
    };
    let group = session.runtime.users.primary_group_of(&user);
    let cost = section
        .as_ref()
        .map(|s| credit::download_cost(s, group.as_ref(), &rules, node.size()))
        .unwrap_or(0);
    let balance =
        session.runtime.users.user(&user.name).map(|u| u.credits_kib).unwrap_or(0);
    if cost > balance {
        return Err(FtpError::denied("Not enough credits."));
    }

    // Open the source before anything goes on the wire so a bad file is
    // a clean 550 rather than a broken transfer.
    let offset = session.rest_offset;
    enum Source {
        File(tokio::fs::File),
        Memory(std::io::Cursor<Vec<u8>>),
    }
    let mut source = match &node.physical_path {
        Some(physical) => {
            let mut file = tokio::fs::File::open(physical).await.map_err(map_fs_error)?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            Source::File(file)
        }
        None => {
            let content = node.content.clone().unwrap_or_default().into_bytes();
            let skip = (offset as usize).min(content.len());
            Source::Memory(std::io::Cursor::new(content[skip..].to_vec()))
        }
    };

    datachan::precheck_active_fxp(session, Direction::Outgoing, &path)?;
    session
        .reply(Reply::new(
            150,
            format!("Opening data connection for {} ({} bytes).", node.name(), node.size()),
        ))
        .await?;
    let mut data = datachan::open_data(session, Direction::Outgoing, &path).await?;

    let mut bucket = user.down_rate_cap_kibs.map(TokenBucket::new);
    let started = Instant::now();
    session.runtime.stats.transfer_started();

    let mut sent = 0u64;
    let outcome = match &mut source {
        Source::File(file) => {
            streamed_copy(session, file, &mut data, bucket.as_mut(), |chunk| {
                sent += chunk.len() as u64;
            })
            .await
        }
        Source::Memory(cursor) => {
            streamed_copy(session, cursor, &mut data, bucket.as_mut(), |chunk| {
                sent += chunk.len() as u64;
            })
            .await
        }
    };

    session.runtime.stats.add_downloaded(sent);
    match outcome {
        Ok(_) => {
            data.shutdown().await.ok();
            session.runtime.stats.transfer_finished(started.elapsed(), false);
            if cost > 0 {
                let (ok, new_balance) =
                    session.runtime.users.consume_credits(&user.name, cost)?;
                if !ok {
                    // A concurrent download drained the balance between
                    // the pre-check and settlement; the transfer already
                    // happened, so the account just bottoms out.
                    warn!(user = %user.name, cost, "credit settlement raced, balance kept");
                }
                if let Some(u) = session.user.as_mut() {
                    u.credits_kib = new_balance;
                }
            }
            session.runtime.events.publish(
                session
                    .emit(EventKind::Download)
                    .path(node.virtual_path.as_str())
                    .bytes(sent)
                    .section(section.map(|s| s.name).unwrap_or_default()),
            );
            session.reply(Reply::new(226, "Transfer complete.")).await
        }
        Err(FtpError::Aborted) => {
            session.runtime.stats.transfer_finished(started.elapsed(), true);
            session.reply(Reply::new(426, "Transfer aborted.")).await?;
            session.reply(Reply::new(226, "Abort successful.")).await
        }
        Err(e) => {
            session.runtime.stats.transfer_finished(started.elapsed(), true);
            Err(e)
        }
    }
}

pub(crate) async fn stor(session: &mut Session, arg: &str, append: bool) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    if arg.trim().is_empty() {
        return Err(FtpError::bad_argument("STOR requires a path"));
    }
    let path = session.cwd.join(arg)?;
    let physical = super::fileops::writable_physical(session, &path)?;

    datachan::precheck_active_fxp(session, Direction::Incoming, &path)?;
    session
        .reply(Reply::new(150, format!("Opening data connection for {}.", path.file_name().unwrap_or("file"))))
        .await?;
    let mut data = datachan::open_data(session, Direction::Incoming, &path).await?;

    let offset = session.rest_offset;
    let mut open = tokio::fs::OpenOptions::new();
    if append {
        open.create(true).append(true);
    } else {
        open.create(true).write(true);
        if offset == 0 {
            open.truncate(true);
        }
    }
    let mut file = open.open(&physical).await.map_err(map_fs_error)?;
    if !append && offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let mut bucket = user.up_rate_cap_kibs.map(TokenBucket::new);
    let started = Instant::now();
    session.runtime.stats.transfer_started();

    let mut received = 0u64;
    let mut crc = crc32fast::Hasher::new();
    let outcome = streamed_copy(session, &mut data, &mut file, bucket.as_mut(), |chunk| {
        received += chunk.len() as u64;
        crc.update(chunk);
    })
    .await;

    session.runtime.stats.add_uploaded(received);
    match outcome {
        Ok(_) => {
            file.flush().await?;
            file.sync_all().await.ok();
            drop(data);
            session.runtime.stats.transfer_finished(started.elapsed(), false);
            session.runtime.resolver.invalidate(&path);
            session.runtime.resolver.invalidate(&path.parent());
            settle_upload(session, &user, &path, received, crc.finalize()).await?;
            session.reply(Reply::new(226, "Transfer complete.")).await
        }
        Err(FtpError::Aborted) => {
            session.runtime.stats.transfer_finished(started.elapsed(), true);
            session.reply(Reply::new(426, "Transfer aborted.")).await?;
            session.reply(Reply::new(226, "Abort successful.")).await
        }
        Err(e) => {
            session.runtime.stats.transfer_finished(started.elapsed(), true);
            Err(e)
        }
    }
}

/// Post-transfer settlement of a completed upload: credits first, then
/// the release registry and the dupe store, then the events.
async fn settle_upload(
    session: &mut Session,
    user: &crate::store::user::User,
    path: &VirtualPath,
    bytes: u64,
    crc: u32,
) -> FtpResult<()> {
    let Some(section) = session.runtime.sections.section_for_path(path) else {
        return Ok(());
    };
    let rules =
        session.runtime.script.current().ratio_overrides(&user.name, &section.name).await;
    let group = session.runtime.users.primary_group_of(user);
    let award = credit::upload_credits(&section, group.as_ref(), &rules, bytes);
    if award > 0 {
        let new_balance = session.runtime.users.award_credits(&user.name, award)?;
        if let Some(u) = session.user.as_mut() {
            u.credits_kib = new_balance;
        }
        debug!(user = %user.name, award, new_balance, "upload credits awarded");
    }

    // Files directly under the section root are not part of a release.
    let section_root =
        VirtualPath::parse(&section.virtual_root).unwrap_or_else(|_| VirtualPath::root());
    let parent = path.parent();
    if parent.depth() > section_root.depth() {
        let release = parent.file_name().unwrap_or_default().to_string();
        let file_name = path.file_name().unwrap_or_default().to_string();
        let group_name = user.primary_group.clone().unwrap_or_default();
        let entry = session.runtime.releases.record_upload(
            &section.name,
            &release,
            &group_name,
            path,
            bytes,
            is_archive_name(&file_name),
            Some((file_name, crc)),
        )?;
        session.runtime.dupes.upsert(&entry.release)?;
        session.runtime.events.publish(
            session
                .emit(EventKind::RaceUpdate)
                .section(section.name.clone())
                .path(parent.as_str())
                .bytes(bytes),
        );
    }

    session.runtime.events.publish(
        session
            .emit(EventKind::Upload)
            .section(section.name)
            .path(path.as_str())
            .bytes(bytes),
    );
    Ok(())
}

/// ABOR outside a transfer clears the pending data-channel state.
pub(crate) async fn abor(session: &mut Session) -> FtpResult<()> {
    session.pending_passive = None;
    session.active_target = None;
    session.reply(Reply::new(226, "No transfer in progress.")).await
}

/// Archive members of a release, by scene convention.
fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".rar") || lower.ends_with(".zip") || lower.ends_with(".7z") {
        return true;
    }
    // .r00 .. .r99 volume extensions.
    match lower.rsplit_once('.') {
        Some((_, ext)) => {
            ext.len() == 3
                && ext.starts_with('r')
                && ext[1..].chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Copies `src` into `dst` chunk-wise while watching the control channel
/// for ABOR and the shutdown signal. Mid-transfer commands other than
/// ABOR/QUIT get an immediate 503 so reply ordering is preserved.
async fn streamed_copy(
    session: &mut Session,
    src: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    mut bucket: Option<&mut TokenBucket>,
    mut on_chunk: impl FnMut(&[u8]),
) -> FtpResult<u64> {
    let progress = session.runtime.config.timeouts.transfer_progress();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = session.shutdown.changed() => {
                return Err(FtpError::Cancelled);
            }
            line = read_line(&mut session.stream, &mut session.inbuf) => {
                match line {
                    Ok(Some(cmd)) => {
                        let verb = cmd.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
                        if verb == "ABOR" || verb == "QUIT" {
                            debug!(session = session.id, verb, "transfer interrupted");
                            if verb == "QUIT" {
                                session.quitting = true;
                            }
                            return Err(FtpError::Aborted);
                        }
                        session.stream.write_all(b"503 Transfer in progress.\r\n").await.ok();
                    }
                    Ok(None) => return Err(FtpError::Cancelled),
                    Err(e) => return Err(e),
                }
            }
            read = timeout(progress, src.read(&mut buf)) => {
                let n = match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(FtpError::Timeout),
                };
                if let Some(bucket) = bucket.as_deref_mut() {
                    bucket.consume(n).await;
                }
                match timeout(progress, dst.write_all(&buf[..n])).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(FtpError::Timeout),
                }
                total += n as u64;
                on_chunk(&buf[..n]);
            }
        }
    }
    timeout(progress, dst.flush()).await.map_err(|_| FtpError::Timeout)??;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names() {
        for name in ["x.rar", "x.r00", "x.R42", "pack.zip", "pack.7z"] {
            assert!(is_archive_name(name), "{name}");
        }
        for name in ["x.nfo", "x.sfv", "x.mp3", "x.r1", "x.rxx", "plain"] {
            assert!(!is_archive_name(name), "{name}");
        }
    }
}
