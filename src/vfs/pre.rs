//! Pre-release registry and the `/PRE` namespace.
//!
//! Pre entries are an append-only log of advance-published releases,
//! keyed by virtual path and snapshotted to JSON. The provider exposes
//! `/PRE`, `/PRE/<group>`, `/PRE/<group>/<release>` and the date-filtered
//! `/PRE/TODAY`. Non-siteop users cannot list other groups' entries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FtpResult;
use crate::vfs::path::{fold_key, VirtualPath};
use crate::vfs::{ResolveCtx, Resolution, VfsNode, VfsProvider};

const DAY_SECS: i64 = 86_400;

/// One pre announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreEntry {
    pub section: String,
    pub release: String,
    pub virtual_path: String,
    /// The user who labelled the pre.
    pub user: String,
    /// Group credited with the pre, normally the labelling user's
    /// primary group.
    pub group: String,
    pub timestamp_unix: i64,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<PreEntry>,
}

/// The pre log, keyed by folded virtual path.
pub struct PreRegistry {
    inner: RwLock<HashMap<String, PreEntry>>,
    persist_path: Option<PathBuf>,
}

impl PreRegistry {
    pub fn in_memory() -> Self {
        PreRegistry { inner: RwLock::new(HashMap::new()), persist_path: None }
    }

    pub fn open(path: impl Into<PathBuf>) -> FtpResult<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let data = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .map_err(|e| crate::error::FtpError::Fatal(format!("bad pre snapshot: {e}")))?;
            for entry in snapshot.entries {
                entries.insert(fold_key(&entry.virtual_path), entry);
            }
        }
        Ok(PreRegistry { inner: RwLock::new(entries), persist_path: Some(path) })
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("pre registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, entry: PreEntry) -> FtpResult<()> {
        let mut inner = self.inner.write().expect("pre registry lock poisoned");
        inner.insert(fold_key(&entry.virtual_path), entry);
        self.persist(&inner)
    }

    pub fn by_path(&self, path: &VirtualPath) -> Option<PreEntry> {
        self.inner.read().expect("pre registry lock poisoned").get(&path.fold()).cloned()
    }

    pub fn by_group(&self, group: &str) -> Vec<PreEntry> {
        let folded = fold_key(group);
        let mut v: Vec<PreEntry> = self
            .inner
            .read()
            .expect("pre registry lock poisoned")
            .values()
            .filter(|e| fold_key(&e.group) == folded)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.release.cmp(&b.release));
        v
    }

    pub fn today(&self) -> Vec<PreEntry> {
        let cutoff = chrono::Utc::now().timestamp() - DAY_SECS;
        let mut v: Vec<PreEntry> = self
            .inner
            .read()
            .expect("pre registry lock poisoned")
            .values()
            .filter(|e| e.timestamp_unix >= cutoff)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.release.cmp(&b.release));
        v
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .expect("pre registry lock poisoned")
            .values()
            .map(|e| e.group.clone())
            .collect();
        names.sort_by_key(|n| fold_key(n));
        names.dedup_by_key(|n| fold_key(n));
        names
    }

    fn persist(&self, inner: &HashMap<String, PreEntry>) -> FtpResult<()> {
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

/// The `/PRE` namespace.
pub struct PreProvider {
    registry: std::sync::Arc<PreRegistry>,
}

impl PreProvider {
    pub fn new(registry: std::sync::Arc<PreRegistry>) -> Self {
        PreProvider { registry }
    }

    fn may_view(ctx: &ResolveCtx, group: &str) -> bool {
        ctx.siteop || ctx.in_group(group)
    }
}

#[async_trait]
impl VfsProvider for PreProvider {
    fn name(&self) -> &'static str {
        "pre"
    }

    fn can_handle(&self, path: &VirtualPath) -> bool {
        path.segments().next().map(|s| fold_key(s) == "PRE").unwrap_or(false)
    }

    async fn resolve(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution> {
        let mut segments = path.segments();
        let _pre = segments.next()?;
        match (segments.next(), segments.next(), segments.next()) {
            (None, ..) => Some(Resolution::Found(VfsNode::virtual_dir(path.clone()))),
            (Some(group), None, _) => {
                if fold_key(group) == "TODAY" || Self::may_view(ctx, group) {
                    Some(Resolution::Found(VfsNode::virtual_dir(path.clone())))
                } else {
                    Some(Resolution::Denied("Not your group".to_string()))
                }
            }
            (Some(group), Some(name), None) => {
                if !Self::may_view(ctx, group) && fold_key(group) != "TODAY" {
                    return Some(Resolution::Denied("Not your group".to_string()));
                }
                let entries = if fold_key(group) == "TODAY" {
                    self.registry.today()
                } else {
                    self.registry.by_group(group)
                };
                let folded = fold_key(name);
                match entries.into_iter().find(|e| fold_key(&e.release) == folded) {
                    Some(entry) => {
                        let target = VirtualPath::parse(&entry.virtual_path)
                            .unwrap_or_else(|_| VirtualPath::root());
                        Some(Resolution::Found(VfsNode::virtual_dir(target)))
                    }
                    None => Some(Resolution::not_found()),
                }
            }
            _ => Some(Resolution::not_found()),
        }
    }

    async fn enumerate(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        let mut segments = path.segments();
        let Some(_pre) = segments.next() else { return Vec::new() };
        match (segments.next(), segments.next()) {
            (None, _) => {
                // Group directories the caller may see, plus TODAY.
                let mut out = vec![VfsNode::virtual_dir(path.child("TODAY"))];
                for group in self.registry.group_names() {
                    if Self::may_view(ctx, &group) {
                        out.push(VfsNode::virtual_dir(path.child(&group)));
                    }
                }
                out
            }
            (Some(group), None) => {
                let entries = if fold_key(group) == "TODAY" {
                    let mut entries = self.registry.today();
                    entries.retain(|e| Self::may_view(ctx, &e.group));
                    entries
                } else if Self::may_view(ctx, group) {
                    self.registry.by_group(group)
                } else {
                    return Vec::new();
                };
                entries
                    .iter()
                    .map(|e| VfsNode::virtual_dir(path.child(&e.release)))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(release: &str, group: &str, user: &str) -> PreEntry {
        PreEntry {
            section: "APPS".into(),
            release: release.into(),
            virtual_path: format!("/groups/{group}/{release}"),
            user: user.into(),
            group: group.into(),
            timestamp_unix: chrono::Utc::now().timestamp(),
        }
    }

    fn member_ctx(group: &str) -> ResolveCtx {
        ResolveCtx {
            username: Some("alice".into()),
            groups: vec![group.to_string()],
            siteop: false,
        }
    }

    #[test]
    fn registry_basics() {
        let reg = PreRegistry::in_memory();
        reg.add(entry("Tool.v1.0-CREW", "CREW", "alice")).unwrap();
        reg.add(entry("Other-GRP", "GRP", "bob")).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.by_group("crew").len(), 1);
        assert_eq!(reg.today().len(), 2);
        let p = VirtualPath::parse("/groups/CREW/Tool.v1.0-CREW").unwrap();
        assert!(reg.by_path(&p).is_some());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pre.json");
        {
            let reg = PreRegistry::open(&path).unwrap();
            reg.add(entry("Tool.v1.0-CREW", "CREW", "alice")).unwrap();
        }
        let reg = PreRegistry::open(&path).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.by_group("CREW")[0].user, "alice");
    }

    #[tokio::test]
    async fn group_listing_requires_membership() {
        let reg = std::sync::Arc::new(PreRegistry::in_memory());
        reg.add(entry("Tool.v1.0-CREW", "CREW", "alice")).unwrap();
        let provider = PreProvider::new(reg);

        let crew_path = VirtualPath::parse("/PRE/CREW").unwrap();
        let outsider = member_ctx("GRP");
        assert!(matches!(
            provider.resolve(&outsider, &crew_path).await,
            Some(Resolution::Denied(_))
        ));
        assert!(provider.enumerate(&outsider, &crew_path).await.is_empty());

        let member = member_ctx("CREW");
        assert!(matches!(
            provider.resolve(&member, &crew_path).await,
            Some(Resolution::Found(_))
        ));
        assert_eq!(provider.enumerate(&member, &crew_path).await.len(), 1);

        let siteop = ResolveCtx { siteop: true, ..ResolveCtx::default() };
        assert_eq!(provider.enumerate(&siteop, &crew_path).await.len(), 1);
    }

    #[tokio::test]
    async fn today_filters_by_membership() {
        let reg = std::sync::Arc::new(PreRegistry::in_memory());
        reg.add(entry("Tool.v1.0-CREW", "CREW", "alice")).unwrap();
        reg.add(entry("Other-GRP", "GRP", "bob")).unwrap();
        let provider = PreProvider::new(reg);

        let today = VirtualPath::parse("/PRE/TODAY").unwrap();
        let member = member_ctx("CREW");
        assert_eq!(provider.enumerate(&member, &today).await.len(), 1);
        let siteop = ResolveCtx { siteop: true, ..ResolveCtx::default() };
        assert_eq!(provider.enumerate(&siteop, &today).await.len(), 2);
    }

    #[tokio::test]
    async fn pre_child_redirects() {
        let reg = std::sync::Arc::new(PreRegistry::in_memory());
        reg.add(entry("Tool.v1.0-CREW", "CREW", "alice")).unwrap();
        let provider = PreProvider::new(reg);
        let member = member_ctx("CREW");
        let child = VirtualPath::parse("/PRE/CREW/tool.v1.0-crew").unwrap();
        match provider.resolve(&member, &child).await {
            Some(Resolution::Found(node)) => {
                assert_eq!(node.virtual_path.as_str(), "/groups/CREW/Tool.v1.0-CREW");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
