//! Release registry and the virtual namespaces derived from it.
//!
//! The registry is the in-memory index of tracked releases; the dupe
//! store is its persistent fingerprint companion. Registry state is
//! snapshotted to JSON after each mutation. The release provider exposes
//! the derived views (`/TODAY`, `/0DAY`, `/TODAY-<section>`, `/NUKED`,
//! `/INCOMPLETE`, `/ARCHIVE`) and the group provider the per-group
//! listings under `/GROUPS`. Children of these views resolve to nodes
//! whose virtual path is the release's real home, which sessions treat
//! as a redirect target.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dupe::{dupe_key, NukeStatus, Release};
use crate::error::FtpResult;
use crate::vfs::path::{fold_key, VirtualPath};
use crate::vfs::{ResolveCtx, Resolution, VfsNode, VfsProvider};

const DAY_SECS: i64 = 86_400;

/// A registry entry: the canonical release record plus where it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub release: Release,
    pub virtual_path: String,
    pub complete: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<ReleaseEntry>,
}

/// In-memory release index with JSON snapshot persistence.
pub struct ReleaseRegistry {
    inner: RwLock<HashMap<String, ReleaseEntry>>,
    persist_path: Option<PathBuf>,
}

impl ReleaseRegistry {
    pub fn in_memory() -> Self {
        ReleaseRegistry { inner: RwLock::new(HashMap::new()), persist_path: None }
    }

    /// Opens a registry backed by a JSON snapshot file.
    pub fn open(path: impl Into<PathBuf>) -> FtpResult<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let data = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .map_err(|e| crate::error::FtpError::Fatal(format!("bad release snapshot: {e}")))?;
            for entry in snapshot.entries {
                entries.insert(entry.release.key(), entry);
            }
        }
        Ok(ReleaseRegistry { inner: RwLock::new(entries), persist_path: Some(path) })
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("release registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, section: &str, release: &str) -> Option<ReleaseEntry> {
        self.inner
            .read()
            .expect("release registry lock poisoned")
            .get(&dupe_key(section, release))
            .cloned()
    }

    /// Records one uploaded file of a release, creating the entry on
    /// first sight. Returns the updated entry.
    pub fn record_upload(
        &self,
        section: &str,
        release: &str,
        group: &str,
        virtual_path: &VirtualPath,
        bytes: u64,
        archive: bool,
        crc: Option<(String, u32)>,
    ) -> FtpResult<ReleaseEntry> {
        let mut inner = self.inner.write().expect("release registry lock poisoned");
        let entry = inner.entry(dupe_key(section, release)).or_insert_with(|| ReleaseEntry {
            release: Release::new(section, release, group),
            virtual_path: virtual_path.parent().as_str().to_string(),
            complete: false,
        });
        entry.release.total_bytes += bytes as i64;
        entry.release.file_count += 1;
        if archive {
            entry.release.archive_count += 1;
        }
        entry.release.last_updated_unix = chrono::Utc::now().timestamp();
        if let Some(crc) = crc {
            entry.release.crcs.push(crc);
        }
        let out = entry.clone();
        self.persist(&inner)?;
        Ok(out)
    }

    pub fn mark_complete(&self, section: &str, release: &str) -> FtpResult<bool> {
        let mut inner = self.inner.write().expect("release registry lock poisoned");
        let Some(entry) = inner.get_mut(&dupe_key(section, release)) else { return Ok(false) };
        entry.complete = true;
        self.persist(&inner)?;
        Ok(true)
    }

    /// Marks a release nuked. Multipliers below 1.0 are clamped.
    pub fn nuke(
        &self,
        section: &str,
        release: &str,
        reason: &str,
        multiplier: f64,
    ) -> FtpResult<Option<ReleaseEntry>> {
        let mut inner = self.inner.write().expect("release registry lock poisoned");
        let Some(entry) = inner.get_mut(&dupe_key(section, release)) else { return Ok(None) };
        entry.release.nuke = Some(NukeStatus {
            reason: reason.to_string(),
            multiplier: multiplier.max(1.0),
        });
        let out = entry.clone();
        self.persist(&inner)?;
        Ok(Some(out))
    }

    pub fn unnuke(&self, section: &str, release: &str) -> FtpResult<Option<ReleaseEntry>> {
        let mut inner = self.inner.write().expect("release registry lock poisoned");
        let Some(entry) = inner.get_mut(&dupe_key(section, release)) else { return Ok(None) };
        entry.release.nuke = None;
        let out = entry.clone();
        self.persist(&inner)?;
        Ok(Some(out))
    }

    pub fn all(&self) -> Vec<ReleaseEntry> {
        let mut v: Vec<ReleaseEntry> =
            self.inner.read().expect("release registry lock poisoned").values().cloned().collect();
        v.sort_by(|a, b| a.release.release.cmp(&b.release.release));
        v
    }

    pub fn today(&self) -> Vec<ReleaseEntry> {
        let cutoff = chrono::Utc::now().timestamp() - DAY_SECS;
        self.all().into_iter().filter(|e| e.release.first_seen_unix >= cutoff).collect()
    }

    pub fn today_in_section(&self, section: &str) -> Vec<ReleaseEntry> {
        let folded = fold_key(section);
        self.today().into_iter().filter(|e| fold_key(&e.release.section) == folded).collect()
    }

    pub fn nuked(&self) -> Vec<ReleaseEntry> {
        self.all().into_iter().filter(|e| e.release.is_nuked()).collect()
    }

    pub fn incomplete(&self) -> Vec<ReleaseEntry> {
        self.all().into_iter().filter(|e| !e.complete).collect()
    }

    pub fn by_group(&self, group: &str) -> Vec<ReleaseEntry> {
        let folded = fold_key(group);
        self.all().into_iter().filter(|e| fold_key(&e.release.group) == folded).collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .expect("release registry lock poisoned")
            .values()
            .map(|e| e.release.group.clone())
            .collect();
        names.sort_by_key(|n| fold_key(n));
        names.dedup_by_key(|n| fold_key(n));
        names
    }

    fn persist(&self, inner: &HashMap<String, ReleaseEntry>) -> FtpResult<()> {
        let Some(path) = &self.persist_path else { return Ok(()) };
        let snapshot = Snapshot { entries: inner.values().cloned().collect() };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| crate::error::FtpError::Fatal(format!("snapshot encode: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// The derived release views.
pub struct ReleaseProvider {
    registry: std::sync::Arc<ReleaseRegistry>,
}

impl ReleaseProvider {
    pub fn new(registry: std::sync::Arc<ReleaseRegistry>) -> Self {
        ReleaseProvider { registry }
    }

    fn view_entries(&self, view: &str) -> Option<Vec<ReleaseEntry>> {
        let folded = fold_key(view);
        match folded.as_str() {
            "TODAY" | "0DAY" => Some(self.registry.today()),
            "NUKED" => Some(self.registry.nuked()),
            "INCOMPLETE" => Some(self.registry.incomplete()),
            "ARCHIVE" => Some(self.registry.all()),
            _ => folded
                .strip_prefix("TODAY-")
                .map(|section| self.registry.today_in_section(section)),
        }
    }
}

#[async_trait]
impl VfsProvider for ReleaseProvider {
    fn name(&self) -> &'static str {
        "release"
    }

    fn can_handle(&self, path: &VirtualPath) -> bool {
        match path.segments().next() {
            Some(first) => {
                let folded = fold_key(first);
                matches!(folded.as_str(), "TODAY" | "0DAY" | "NUKED" | "INCOMPLETE" | "ARCHIVE")
                    || folded.starts_with("TODAY-")
            }
            None => false,
        }
    }

    async fn resolve(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution> {
        let mut segments = path.segments();
        let view = segments.next()?;
        let entries = self.view_entries(view)?;
        match (segments.next(), segments.next()) {
            (None, _) => Some(Resolution::Found(VfsNode::virtual_dir(path.clone()))),
            (Some(name), None) => {
                let folded = fold_key(name);
                match entries.iter().find(|e| fold_key(&e.release.release) == folded) {
                    Some(entry) => {
                        let target = VirtualPath::parse(&entry.virtual_path)
                            .unwrap_or_else(|_| VirtualPath::root())
                            .child(&entry.release.release);
                        Some(Resolution::Found(VfsNode::virtual_dir(target)))
                    }
                    None => Some(Resolution::not_found()),
                }
            }
            _ => Some(Resolution::not_found()),
        }
    }

    async fn enumerate(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        if path.depth() != 1 {
            return Vec::new();
        }
        let Some(view) = path.segments().next() else { return Vec::new() };
        let Some(entries) = self.view_entries(view) else { return Vec::new() };
        entries
            .iter()
            .map(|e| VfsNode::virtual_dir(path.child(&e.release.release)))
            .collect()
    }
}

/// Per-group listings under `/GROUPS`.
pub struct GroupProvider {
    registry: std::sync::Arc<ReleaseRegistry>,
}

impl GroupProvider {
    pub fn new(registry: std::sync::Arc<ReleaseRegistry>) -> Self {
        GroupProvider { registry }
    }
}

#[async_trait]
impl VfsProvider for GroupProvider {
    fn name(&self) -> &'static str {
        "group"
    }

    fn can_handle(&self, path: &VirtualPath) -> bool {
        path.segments().next().map(|s| fold_key(s) == "GROUPS").unwrap_or(false)
    }

    async fn resolve(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution> {
        let mut segments = path.segments();
        let _groups = segments.next()?;
        match (segments.next(), segments.next(), segments.next()) {
            (None, ..) => Some(Resolution::Found(VfsNode::virtual_dir(path.clone()))),
            (Some(_), None, _) => Some(Resolution::Found(VfsNode::virtual_dir(path.clone()))),
            (Some(group), Some(name), None) => {
                let folded = fold_key(name);
                match self
                    .registry
                    .by_group(group)
                    .into_iter()
                    .find(|e| fold_key(&e.release.release) == folded)
                {
                    Some(entry) => {
                        let target = VirtualPath::parse(&entry.virtual_path)
                            .unwrap_or_else(|_| VirtualPath::root())
                            .child(&entry.release.release);
                        Some(Resolution::Found(VfsNode::virtual_dir(target)))
                    }
                    None => Some(Resolution::not_found()),
                }
            }
            _ => Some(Resolution::not_found()),
        }
    }

    async fn enumerate(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        let mut segments = path.segments();
        let Some(_groups) = segments.next() else {
            return Vec::new();
        };
        match (segments.next(), segments.next()) {
            (None, _) => self
                .registry
                .group_names()
                .into_iter()
                .map(|g| VfsNode::virtual_dir(path.child(&g)))
                .collect(),
            (Some(group), None) => self
                .registry
                .by_group(group)
                .iter()
                .map(|e| VfsNode::virtual_dir(path.child(&e.release.release)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_entries() -> ReleaseRegistry {
        let reg = ReleaseRegistry::in_memory();
        let vpath = VirtualPath::parse("/apps/Tool.v1.0-CREW/tool.r00").unwrap();
        reg.record_upload("APPS", "Tool.v1.0-CREW", "CREW", &vpath, 4096, true, None).unwrap();
        let vpath = VirtualPath::parse("/mp3/Artist-Album-GRP/01.mp3").unwrap();
        reg.record_upload("MP3", "Artist-Album-GRP", "GRP", &vpath, 8192, false, None).unwrap();
        reg
    }

    #[test]
    fn record_upload_accumulates() {
        let reg = ReleaseRegistry::in_memory();
        let vpath = VirtualPath::parse("/apps/R/a.r00").unwrap();
        reg.record_upload("APPS", "R", "G", &vpath, 100, true, Some(("a.r00".into(), 7)))
            .unwrap();
        let entry = reg
            .record_upload("APPS", "R", "G", &vpath, 200, false, None)
            .unwrap();
        assert_eq!(entry.release.total_bytes, 300);
        assert_eq!(entry.release.file_count, 2);
        assert_eq!(entry.release.archive_count, 1);
        assert_eq!(entry.release.crcs.len(), 1);
        assert_eq!(entry.virtual_path, "/apps/R");
    }

    #[test]
    fn views_filter() {
        let reg = registry_with_entries();
        assert_eq!(reg.today().len(), 2);
        assert_eq!(reg.today_in_section("apps").len(), 1);
        assert_eq!(reg.nuked().len(), 0);
        reg.nuke("APPS", "Tool.v1.0-CREW", "stolen", 3.0).unwrap();
        assert_eq!(reg.nuked().len(), 1);
        reg.unnuke("APPS", "Tool.v1.0-CREW").unwrap();
        assert_eq!(reg.nuked().len(), 0);
        assert_eq!(reg.incomplete().len(), 2);
        reg.mark_complete("APPS", "Tool.v1.0-CREW").unwrap();
        assert_eq!(reg.incomplete().len(), 1);
        assert_eq!(reg.by_group("crew").len(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("releases.json");
        {
            let reg = ReleaseRegistry::open(&path).unwrap();
            let vpath = VirtualPath::parse("/apps/R/a.bin").unwrap();
            reg.record_upload("APPS", "R", "G", &vpath, 123, false, None).unwrap();
            reg.nuke("APPS", "R", "bad", 2.0).unwrap();
        }
        let reg = ReleaseRegistry::open(&path).unwrap();
        let entry = reg.get("apps", "r").unwrap();
        assert_eq!(entry.release.total_bytes, 123);
        assert_eq!(entry.release.nuke.as_ref().unwrap().reason, "bad");
    }

    #[tokio::test]
    async fn provider_views_and_redirects() {
        let reg = std::sync::Arc::new(registry_with_entries());
        let provider = ReleaseProvider::new(reg);
        let ctx = ResolveCtx::anonymous();

        let today = VirtualPath::parse("/TODAY").unwrap();
        assert!(provider.can_handle(&today));
        assert!(matches!(
            provider.resolve(&ctx, &today).await,
            Some(Resolution::Found(_))
        ));
        let listing = provider.enumerate(&ctx, &today).await;
        assert_eq!(listing.len(), 2);

        // Child resolves to the release's real home.
        let child = VirtualPath::parse("/TODAY/tool.v1.0-crew").unwrap();
        match provider.resolve(&ctx, &child).await {
            Some(Resolution::Found(node)) => {
                assert_eq!(node.virtual_path.as_str(), "/apps/Tool.v1.0-CREW");
            }
            other => panic!("unexpected {other:?}"),
        }

        let filtered = VirtualPath::parse("/TODAY-MP3").unwrap();
        assert_eq!(provider.enumerate(&ctx, &filtered).await.len(), 1);
        assert!(!provider.can_handle(&VirtualPath::parse("/apps").unwrap()));
    }

    #[tokio::test]
    async fn group_provider_lists() {
        let reg = std::sync::Arc::new(registry_with_entries());
        let provider = GroupProvider::new(reg);
        let ctx = ResolveCtx::anonymous();

        let root = VirtualPath::parse("/GROUPS").unwrap();
        assert_eq!(provider.enumerate(&ctx, &root).await.len(), 2);
        let crew = VirtualPath::parse("/GROUPS/CREW").unwrap();
        assert_eq!(provider.enumerate(&ctx, &crew).await.len(), 1);
        let child = VirtualPath::parse("/GROUPS/CREW/Tool.v1.0-CREW").unwrap();
        assert!(matches!(
            provider.resolve(&ctx, &child).await,
            Some(Resolution::Found(_))
        ));
    }
}
