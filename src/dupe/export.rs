//! Scene dupe export: the `AMDP` interop format other daemons import.
//!
//! Layout: 4-byte magic `AMDP`, u8 version, i32 entry count, then per
//! entry: section, release, group, release-date unix seconds (i64),
//! total bytes (i64), file count (i32), is-nuked (u8), nuke-reason
//! (string), nuke-multiplier (f64). The entries block round-trips
//! bit-identically through export and import.

use std::io::{Read, Write};

use crate::dupe::{DupeStore, NukeStatus, Release};
use crate::error::{FtpError, FtpResult};
use crate::store::binfmt;

const MAGIC: &[u8; 4] = b"AMDP";
const VERSION: u8 = 1;

/// Writes every live release to `dest` in insertion order.
pub fn export(store: &DupeStore, dest: &mut impl Write) -> FtpResult<usize> {
    let releases = store.all()?;
    dest.write_all(MAGIC)?;
    binfmt::write_u8(dest, VERSION)?;
    binfmt::write_i32(dest, releases.len() as i32)?;
    for release in &releases {
        write_entry(dest, release)?;
    }
    Ok(releases.len())
}

/// Reads an `AMDP` stream back into release records. CRC lists are not
/// part of the interop format and come back empty.
pub fn import(src: &mut impl Read) -> FtpResult<Vec<Release>> {
    let mut magic = [0u8; 4];
    src.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(FtpError::bad_argument("not an AMDP stream"));
    }
    let version = binfmt::read_u8(src)?;
    if version != VERSION {
        return Err(FtpError::bad_argument(format!("unsupported AMDP version {version}")));
    }
    let count = binfmt::read_i32(src)?;
    if count < 0 {
        return Err(FtpError::bad_argument("negative AMDP entry count"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_entry(src)?);
    }
    Ok(out)
}

/// Imports a stream and upserts every entry, returning how many were
/// merged.
pub fn import_into(store: &DupeStore, src: &mut impl Read) -> FtpResult<usize> {
    let releases = import(src)?;
    for release in &releases {
        store.upsert(release)?;
    }
    Ok(releases.len())
}

fn write_entry(w: &mut impl Write, r: &Release) -> std::io::Result<()> {
    binfmt::write_string(w, &r.section)?;
    binfmt::write_string(w, &r.release)?;
    binfmt::write_string(w, &r.group)?;
    binfmt::write_i64(w, r.first_seen_unix)?;
    binfmt::write_i64(w, r.total_bytes)?;
    binfmt::write_i32(w, r.file_count)?;
    binfmt::write_u8(w, r.nuke.is_some() as u8)?;
    binfmt::write_string(w, r.nuke.as_ref().map(|n| n.reason.as_str()).unwrap_or(""))?;
    binfmt::write_f64(w, r.nuke.as_ref().map(|n| n.multiplier).unwrap_or(1.0))
}

fn read_entry(r: &mut impl Read) -> FtpResult<Release> {
    let section = binfmt::read_string(r)?;
    let release = binfmt::read_string(r)?;
    let group = binfmt::read_string(r)?;
    let first_seen_unix = binfmt::read_i64(r)?;
    let total_bytes = binfmt::read_i64(r)?;
    let file_count = binfmt::read_i32(r)?;
    let nuked = binfmt::read_u8(r)? != 0;
    let reason = binfmt::read_string(r)?;
    let multiplier = binfmt::read_f64(r)?;
    Ok(Release {
        section,
        release,
        group,
        total_bytes,
        file_count,
        archive_count: 0,
        first_seen_unix,
        last_updated_unix: first_seen_unix,
        nuke: nuked.then_some(NukeStatus { reason, multiplier }),
        crcs: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_block_round_trips_bit_identically() {
        let dir = tempfile::tempdir().unwrap();
        let store = DupeStore::open(dir.path()).unwrap();
        let mut a = Release::new("APPS", "Tool.v1.0-CREW", "CREW");
        a.total_bytes = 123456789;
        a.file_count = 42;
        store.upsert(&a).unwrap();
        let mut b = Release::new("MP3", "Artist-Album-2024-GRP", "GRP");
        b.nuke = Some(NukeStatus { reason: "dupe".into(), multiplier: 2.0 });
        store.upsert(&b).unwrap();

        let mut first = Vec::new();
        export(&store, &mut first).unwrap();

        // Import into a fresh store and export again; the entries block
        // after the header must be byte-identical.
        let dir2 = tempfile::tempdir().unwrap();
        let store2 = DupeStore::open(dir2.path()).unwrap();
        assert_eq!(import_into(&store2, &mut first.as_slice()).unwrap(), 2);
        let mut second = Vec::new();
        export(&store2, &mut second).unwrap();
        assert_eq!(first[9..], second[9..]);

        let imported = store2.find("MP3", "Artist-Album-2024-GRP").unwrap().unwrap();
        assert_eq!(imported.nuke.as_ref().unwrap().reason, "dupe");
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = b"NOPE".to_vec();
        data.push(1);
        assert!(import(&mut data.as_slice()).is_err());
    }
}
