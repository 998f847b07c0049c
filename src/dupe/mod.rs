//! Persistent binary duplicate store.
//!
//! Three files in a directory: `meta.dat` holds release records,
//! `crc.dat` the concatenated CRC lists, `index.dat` the key-to-offset
//! map. Updates append a new meta record and CRC list at the end of their
//! files and then rewrite the index; old records stay in place, so each
//! append is crash-atomic as long as the index rewrite is the last step.
//! A single reader-writer lock protects the index and the file offsets:
//! readers proceed concurrently, writers exclude all others.

pub mod export;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FtpError, FtpResult};
use crate::store::binfmt;
use crate::vfs::path::fold_key;

const META_FILE: &str = "meta.dat";
const CRC_FILE: &str = "crc.dat";
const INDEX_FILE: &str = "index.dat";

/// Nuke status of a release: a reason and a penalty multiplier of at
/// least 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NukeStatus {
    pub reason: String,
    pub multiplier: f64,
}

/// A tracked release. This is the canonical record shared by the dupe
/// store and the in-memory release registry; the store adds only the CRC
/// stream pointer when persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub section: String,
    pub release: String,
    pub group: String,
    pub total_bytes: i64,
    pub file_count: i32,
    pub archive_count: i32,
    pub first_seen_unix: i64,
    pub last_updated_unix: i64,
    pub nuke: Option<NukeStatus>,
    /// Archive filename to CRC32, in upload order.
    pub crcs: Vec<(String, u32)>,
}

impl Release {
    pub fn new(
        section: impl Into<String>,
        release: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Release {
            section: section.into(),
            release: release.into(),
            group: group.into(),
            total_bytes: 0,
            file_count: 0,
            archive_count: 0,
            first_seen_unix: now,
            last_updated_unix: now,
            nuke: None,
            crcs: Vec::new(),
        }
    }

    /// Canonical store key: `UPPER(section)|UPPER(release)`.
    pub fn key(&self) -> String {
        dupe_key(&self.section, &self.release)
    }

    pub fn is_nuked(&self) -> bool {
        self.nuke.is_some()
    }
}

pub fn dupe_key(section: &str, release: &str) -> String {
    format!("{}|{}", fold_key(section), fold_key(release))
}

struct Inner {
    index: HashMap<String, u64>,
    /// Keys in first-insertion order; search iterates this.
    insertion: Vec<String>,
    meta_len: u64,
    crc_len: u64,
}

/// The duplicate store.
pub struct DupeStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl DupeStore {
    /// Opens (or initializes) the store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> FtpResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        for name in [META_FILE, CRC_FILE] {
            let path = dir.join(name);
            if !path.exists() {
                File::create(&path)?;
            }
        }
        let meta_len = std::fs::metadata(dir.join(META_FILE))?.len();
        let crc_len = std::fs::metadata(dir.join(CRC_FILE))?.len();
        let (index, insertion) = load_index(&dir.join(INDEX_FILE))?;
        debug!(releases = index.len(), meta_len, crc_len, "dupe store opened");
        Ok(DupeStore {
            dir,
            inner: RwLock::new(Inner { index, insertion, meta_len, crc_len }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("dupe store lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a release is already known.
    pub fn contains(&self, section: &str, release: &str) -> bool {
        let key = dupe_key(section, release);
        self.inner.read().expect("dupe store lock poisoned").index.contains_key(&key)
    }

    /// Looks a release up by its canonical key.
    pub fn find(&self, section: &str, release: &str) -> FtpResult<Option<Release>> {
        let key = dupe_key(section, release);
        let inner = self.inner.read().expect("dupe store lock poisoned");
        let Some(&offset) = inner.index.get(&key) else { return Ok(None) };
        Ok(Some(self.read_release_at(offset)?))
    }

    /// Inserts or updates a release: appends a fresh CRC list and meta
    /// record, then updates and persists the index. Old records remain on
    /// disk until compaction.
    pub fn upsert(&self, release: &Release) -> FtpResult<()> {
        let mut inner = self.inner.write().expect("dupe store lock poisoned");

        // CRC list first; the meta record points into it.
        let crc_offset = inner.crc_len as i64;
        let mut crc_file =
            BufWriter::new(OpenOptions::new().append(true).open(self.dir.join(CRC_FILE))?);
        let mut crc_bytes = 0u64;
        {
            let mut counter = CountingWriter { inner: &mut crc_file, count: &mut crc_bytes };
            for (name, crc) in &release.crcs {
                binfmt::write_string(&mut counter, name)?;
                binfmt::write_u32(&mut counter, *crc)?;
            }
        }
        crc_file.flush()?;
        crc_file.get_ref().sync_all()?;

        let meta_offset = inner.meta_len;
        let mut meta_file =
            BufWriter::new(OpenOptions::new().append(true).open(self.dir.join(META_FILE))?);
        let mut meta_bytes = 0u64;
        {
            let mut counter = CountingWriter { inner: &mut meta_file, count: &mut meta_bytes };
            write_meta(&mut counter, release, crc_offset, release.crcs.len() as i32)?;
        }
        meta_file.flush()?;
        meta_file.get_ref().sync_all()?;

        inner.crc_len += crc_bytes;
        inner.meta_len += meta_bytes;
        let key = release.key();
        if inner.index.insert(key.clone(), meta_offset).is_none() {
            inner.insertion.push(key);
        }
        save_index(&self.dir.join(INDEX_FILE), &inner.index, &inner.insertion)?;
        Ok(())
    }

    /// Removes a release from the index only; file space is not
    /// reclaimed.
    pub fn remove(&self, section: &str, release: &str) -> FtpResult<bool> {
        let key = dupe_key(section, release);
        let mut inner = self.inner.write().expect("dupe store lock poisoned");
        if inner.index.remove(&key).is_none() {
            return Ok(false);
        }
        inner.insertion.retain(|k| k != &key);
        save_index(&self.dir.join(INDEX_FILE), &inner.index, &inner.insertion)?;
        Ok(true)
    }

    /// Wildcard search (`*`, `?`) over release names, case-insensitive,
    /// capped at `limit` matches in insertion order.
    pub fn search(&self, pattern: &str, limit: usize) -> FtpResult<Vec<Release>> {
        let regex = RegexBuilder::new(&wildcard_to_regex(pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| FtpError::bad_argument(format!("bad pattern: {e}")))?;
        let inner = self.inner.read().expect("dupe store lock poisoned");
        let mut out = Vec::new();
        for key in &inner.insertion {
            if out.len() >= limit {
                break;
            }
            let Some(release_name) = key.split('|').nth(1) else { continue };
            if !regex.is_match(release_name) {
                continue;
            }
            if let Some(&offset) = inner.index.get(key) {
                out.push(self.read_release_at(offset)?);
            }
        }
        Ok(out)
    }

    /// All live releases in insertion order, for export.
    pub fn all(&self) -> FtpResult<Vec<Release>> {
        let inner = self.inner.read().expect("dupe store lock poisoned");
        let mut out = Vec::with_capacity(inner.insertion.len());
        for key in &inner.insertion {
            if let Some(&offset) = inner.index.get(key) {
                out.push(self.read_release_at(offset)?);
            }
        }
        Ok(out)
    }

    fn read_release_at(&self, offset: u64) -> FtpResult<Release> {
        let mut meta = File::open(self.dir.join(META_FILE))?;
        meta.seek(SeekFrom::Start(offset))?;
        let mut meta = BufReader::new(meta);
        let (mut release, crc_offset, crc_count) = read_meta(&mut meta)?;

        if crc_count > 0 {
            let mut crc = File::open(self.dir.join(CRC_FILE))?;
            crc.seek(SeekFrom::Start(crc_offset as u64))?;
            let mut crc = BufReader::new(crc);
            release.crcs.reserve(crc_count as usize);
            for _ in 0..crc_count {
                let name = binfmt::read_string(&mut crc)?;
                let sum = binfmt::read_u32(&mut crc)?;
                release.crcs.push((name, sum));
            }
        }
        Ok(release)
    }
}

struct CountingWriter<'a, W> {
    inner: &'a mut W,
    count: &'a mut u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        *self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_meta(w: &mut impl Write, r: &Release, crc_offset: i64, crc_count: i32) -> std::io::Result<()> {
    binfmt::write_string(w, &r.section)?;
    binfmt::write_string(w, &r.release)?;
    binfmt::write_string(w, &r.group)?;
    binfmt::write_i64(w, r.total_bytes)?;
    binfmt::write_i32(w, r.file_count)?;
    binfmt::write_i32(w, r.archive_count)?;
    binfmt::write_i64(w, r.first_seen_unix)?;
    binfmt::write_i64(w, r.last_updated_unix)?;
    binfmt::write_u8(w, r.nuke.is_some() as u8)?;
    binfmt::write_f64(w, r.nuke.as_ref().map(|n| n.multiplier).unwrap_or(1.0))?;
    binfmt::write_string(w, r.nuke.as_ref().map(|n| n.reason.as_str()).unwrap_or(""))?;
    binfmt::write_i64(w, crc_offset)?;
    binfmt::write_i32(w, crc_count)
}

fn read_meta(r: &mut impl Read) -> std::io::Result<(Release, i64, i32)> {
    let section = binfmt::read_string(r)?;
    let release = binfmt::read_string(r)?;
    let group = binfmt::read_string(r)?;
    let total_bytes = binfmt::read_i64(r)?;
    let file_count = binfmt::read_i32(r)?;
    let archive_count = binfmt::read_i32(r)?;
    let first_seen_unix = binfmt::read_i64(r)?;
    let last_updated_unix = binfmt::read_i64(r)?;
    let nuked = binfmt::read_u8(r)? != 0;
    let multiplier = binfmt::read_f64(r)?;
    let reason = binfmt::read_string(r)?;
    let crc_offset = binfmt::read_i64(r)?;
    let crc_count = binfmt::read_i32(r)?;
    let nuke = nuked.then_some(NukeStatus { reason, multiplier });
    Ok((
        Release {
            section,
            release,
            group,
            total_bytes,
            file_count,
            archive_count,
            first_seen_unix,
            last_updated_unix,
            nuke,
            crcs: Vec::new(),
        },
        crc_offset,
        crc_count,
    ))
}

fn save_index(
    path: &std::path::Path,
    index: &HashMap<String, u64>,
    insertion: &[String],
) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        binfmt::write_i32(&mut w, index.len() as i32)?;
        for key in insertion {
            if let Some(&offset) = index.get(key) {
                binfmt::write_string(&mut w, key)?;
                binfmt::write_i64(&mut w, offset as i64)?;
            }
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

fn load_index(path: &std::path::Path) -> std::io::Result<(HashMap<String, u64>, Vec<String>)> {
    if !path.exists() {
        return Ok((HashMap::new(), Vec::new()));
    }
    let mut r = BufReader::new(File::open(path)?);
    let count = binfmt::read_i32(&mut r)?;
    let mut index = HashMap::with_capacity(count.max(0) as usize);
    let mut insertion = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let key = binfmt::read_string(&mut r)?;
        let offset = binfmt::read_i64(&mut r)?;
        insertion.push(key.clone());
        index.insert(key, offset as u64);
    }
    Ok((index, insertion))
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Release {
        let mut r = Release::new("APPS", name, "CREW");
        r.total_bytes = 1 << 20;
        r.file_count = 25;
        r.archive_count = 23;
        r.crcs = vec![
            (format!("{}.r00", name.to_lowercase()), 0xDEAD_BEEF),
            (format!("{}.r01", name.to_lowercase()), 0x1234_5678),
        ];
        r
    }

    #[test]
    fn write_then_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample("Tool.v1.0-CREW");
        {
            let store = DupeStore::open(dir.path()).unwrap();
            store.upsert(&original).unwrap();
        }
        let store = DupeStore::open(dir.path()).unwrap();
        let found = store.find("apps", "tool.v1.0-crew").unwrap().unwrap();
        assert_eq!(found, original);
        assert_eq!(found.crcs.len(), 2);
    }

    #[test]
    fn update_appends_and_keeps_key_coherent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DupeStore::open(dir.path()).unwrap();
        let mut r = sample("Rel-A");
        store.upsert(&r).unwrap();
        r.file_count = 50;
        r.crcs.push(("rel-a.r02".into(), 0xAAAA_BBBB));
        store.upsert(&r).unwrap();

        assert_eq!(store.len(), 1);
        let found = store.find("APPS", "REL-A").unwrap().unwrap();
        assert_eq!(found.file_count, 50);
        assert_eq!(found.crcs.len(), 3);
        // The canonical key of what the index points at equals the key
        // looked up.
        assert_eq!(found.key(), dupe_key("APPS", "REL-A"));
    }

    #[test]
    fn nuke_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DupeStore::open(dir.path()).unwrap();
        let mut r = sample("Bad.Release-GRP");
        r.nuke = Some(NukeStatus { reason: "mislabeled".into(), multiplier: 3.0 });
        store.upsert(&r).unwrap();
        let found = store.find("APPS", "Bad.Release-GRP").unwrap().unwrap();
        let nuke = found.nuke.unwrap();
        assert_eq!(nuke.reason, "mislabeled");
        assert_eq!(nuke.multiplier, 3.0);
    }

    #[test]
    fn remove_is_index_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = DupeStore::open(dir.path()).unwrap();
        store.upsert(&sample("Gone-REL")).unwrap();
        let meta_len = std::fs::metadata(dir.path().join(META_FILE)).unwrap().len();
        assert!(store.remove("APPS", "Gone-REL").unwrap());
        assert!(!store.remove("APPS", "Gone-REL").unwrap());
        assert!(store.find("APPS", "Gone-REL").unwrap().is_none());
        // Space is not reclaimed.
        assert_eq!(std::fs::metadata(dir.path().join(META_FILE)).unwrap().len(), meta_len);
    }

    #[test]
    fn wildcard_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = DupeStore::open(dir.path()).unwrap();
        for name in ["Tool.v1.0-CREW", "Tool.v2.0-CREW", "Game.Pack-OTHER"] {
            store.upsert(&sample(name)).unwrap();
        }
        let hits = store.search("tool*", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].release, "Tool.v1.0-CREW"); // insertion order
        let hits = store.search("*crew", 1).unwrap();
        assert_eq!(hits.len(), 1);
        let hits = store.search("Tool.v?.0-CREW", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.search("nothing*", 10).unwrap().is_empty());
    }
}
