//! Physical mounts and the providers backed by them.
//!
//! A mount maps a virtual-root prefix onto a physical directory. For any
//! virtual path there is at most one best-matching mount: the longest
//! matching prefix wins, and user-mounts outrank global mounts. The
//! section shortcut provider sits after the physical provider in the
//! chain and redirects a bare `/NAME` onto the section's configured
//! virtual root when nothing physical matched.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tracing::trace;

use crate::store::section::SectionStore;
use crate::vfs::path::VirtualPath;
use crate::vfs::{NodeMeta, ResolveCtx, Resolution, VfsNode, VfsProvider};

/// A virtual-root to physical-root mapping.
#[derive(Debug, Clone)]
pub struct Mount {
    pub virtual_root: VirtualPath,
    pub physical_root: PathBuf,
    pub read_only: bool,
    /// Static files attached at the mount root, name to content.
    pub virtual_files: Vec<(String, String)>,
    /// Owning user of a user-mount; `None` for global mounts.
    pub owner: Option<String>,
}

impl Mount {
    pub fn new(virtual_root: VirtualPath, physical_root: impl Into<PathBuf>) -> Self {
        Mount {
            virtual_root,
            physical_root: physical_root.into(),
            read_only: false,
            virtual_files: Vec::new(),
            owner: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn owned_by(mut self, user: impl Into<String>) -> Self {
        self.owner = Some(user.into());
        self
    }

    fn visible_to(&self, user: Option<&str>) -> bool {
        match (&self.owner, user) {
            (None, _) => true,
            (Some(owner), Some(user)) => owner.eq_ignore_ascii_case(user),
            (Some(_), None) => false,
        }
    }
}

/// The mount set, shared between the provider and the admin surface.
#[derive(Default)]
pub struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    pub fn new() -> Self {
        MountTable::default()
    }

    pub fn add(&self, mount: Mount) {
        self.mounts.write().expect("mount table lock poisoned").push(mount);
    }

    /// Best mount for a path under a user identity: user-mounts first,
    /// longest virtual-root prefix within each class.
    pub fn best_match(&self, user: Option<&str>, path: &VirtualPath) -> Option<Mount> {
        let mounts = self.mounts.read().expect("mount table lock poisoned");
        let mut best: Option<&Mount> = None;
        let mut best_rank = (false, 0usize);
        for mount in mounts.iter() {
            if !mount.visible_to(user) || !path.starts_with(&mount.virtual_root) {
                continue;
            }
            let rank = (mount.owner.is_some(), mount.virtual_root.depth());
            if best.is_none() || rank > best_rank {
                best = Some(mount);
                best_rank = rank;
            }
        }
        best.cloned()
    }

    /// Maps a virtual path onto its physical location under the best
    /// mount. Used both by the provider and by write commands that need
    /// the target path before anything exists there.
    pub fn map_physical(&self, user: Option<&str>, path: &VirtualPath) -> Option<(PathBuf, Mount)> {
        let mount = self.best_match(user, path)?;
        let rest = path.strip_prefix(&mount.virtual_root)?;
        let mut physical = mount.physical_root.clone();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            physical.push(segment);
        }
        Some((physical, mount))
    }

    /// Mounts visible to a user whose roots sit strictly below `path`,
    /// used to surface mount points in listings.
    fn roots_below(&self, user: Option<&str>, path: &VirtualPath) -> Vec<VirtualPath> {
        let mounts = self.mounts.read().expect("mount table lock poisoned");
        let mut out = Vec::new();
        for mount in mounts.iter() {
            if !mount.visible_to(user) {
                continue;
            }
            if mount.virtual_root.depth() > path.depth()
                && mount.virtual_root.starts_with(path)
            {
                if let Some(next) = mount.virtual_root.segments().nth(path.depth()) {
                    out.push(path.child(next));
                }
            }
        }
        out
    }
}

/// Longest-prefix physical resolution.
pub struct PhysicalProvider {
    mounts: Arc<MountTable>,
}

impl PhysicalProvider {
    pub fn new(mounts: Arc<MountTable>) -> Self {
        PhysicalProvider { mounts }
    }
}

fn modified_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl VfsProvider for PhysicalProvider {
    fn name(&self) -> &'static str {
        "physical"
    }

    fn can_handle(&self, _path: &VirtualPath) -> bool {
        true
    }

    async fn resolve(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution> {
        let mount = self.mounts.best_match(ctx.username.as_deref(), path)?;

        // Virtual files attached directly under the mount root.
        if let Some(rest) = path.strip_prefix(&mount.virtual_root) {
            if !rest.contains('/') && !rest.is_empty() {
                if let Some((name, content)) =
                    mount.virtual_files.iter().find(|(n, _)| n.eq_ignore_ascii_case(&rest))
                {
                    let mut node = VfsNode::virtual_file(
                        mount.virtual_root.child(name),
                        content.clone(),
                    );
                    node.read_only = true;
                    return Some(Resolution::Found(node));
                }
            }
        }

        let (physical, _) = self.mounts.map_physical(ctx.username.as_deref(), path)?;
        match tokio::fs::metadata(&physical).await {
            Ok(meta) if meta.is_dir() => Some(Resolution::Found(VfsNode::physical_dir(
                path.clone(),
                physical,
                mount.read_only,
            ))),
            Ok(meta) => Some(Resolution::Found(VfsNode::physical_file(
                path.clone(),
                physical,
                NodeMeta { size: meta.len(), modified_unix: modified_unix(&meta) },
                mount.read_only,
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Some(Resolution::Denied("Permission denied".to_string()))
            }
            Err(e) => {
                trace!(%path, error = %e, "physical resolve failed");
                Some(Resolution::NotFound(e.to_string()))
            }
        }
    }

    async fn enumerate(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        let mut out = Vec::new();
        let user = ctx.username.as_deref();

        // Mount points below this path appear as directories even before
        // anything physical exists under them.
        for root in self.mounts.roots_below(user, path) {
            out.push(VfsNode::virtual_dir(root));
        }

        let Some(mount) = self.mounts.best_match(user, path) else { return out };

        if path.starts_with(&mount.virtual_root)
            && path.depth() == mount.virtual_root.depth()
        {
            for (name, content) in &mount.virtual_files {
                out.push(VfsNode::virtual_file(path.child(name), content.clone()));
            }
        }

        let Some((physical, _)) = self.mounts.map_physical(user, path) else { return out };
        let Ok(mut dir) = tokio::fs::read_dir(&physical).await else { return out };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Ok(meta) = entry.metadata().await else { continue };
            let name = entry.file_name().to_string_lossy().to_string();
            let child = path.child(&name);
            if meta.is_dir() {
                out.push(VfsNode::physical_dir(child, entry.path(), mount.read_only));
            } else {
                out.push(VfsNode::physical_file(
                    child,
                    entry.path(),
                    NodeMeta { size: meta.len(), modified_unix: modified_unix(&meta) },
                    mount.read_only,
                ));
            }
        }
        out
    }
}

/// Redirects a bare `/NAME` to the section's virtual root when the
/// physical chain produced nothing for it.
pub struct SectionShortcutProvider {
    sections: Arc<SectionStore>,
}

impl SectionShortcutProvider {
    pub fn new(sections: Arc<SectionStore>) -> Self {
        SectionShortcutProvider { sections }
    }
}

#[async_trait]
impl VfsProvider for SectionShortcutProvider {
    fn name(&self) -> &'static str {
        "section-shortcut"
    }

    fn can_handle(&self, path: &VirtualPath) -> bool {
        path.is_root() || path.depth() == 1
    }

    async fn resolve(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution> {
        if path.is_root() {
            // The namespace root always exists, whatever the mounts say.
            return Some(Resolution::Found(VfsNode::virtual_dir(VirtualPath::root())));
        }
        let name = path.file_name()?;
        let section = self.sections.section(name)?;
        let target = VirtualPath::parse(&section.virtual_root).ok()?;
        if &target == path {
            // A section rooted at its own name resolves physically or not
            // at all; redirecting to itself would loop.
            return None;
        }
        Some(Resolution::Found(VfsNode::virtual_dir(target)))
    }

    async fn enumerate(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        if !path.is_root() {
            return Vec::new();
        }
        self.sections
            .all()
            .into_iter()
            .map(|s| VfsNode::virtual_dir(VirtualPath::root().child(&s.name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::section::Section;

    #[tokio::test]
    async fn longest_prefix_and_user_mounts() {
        let table = MountTable::new();
        table.add(Mount::new(VirtualPath::parse("/apps").unwrap(), "/srv/apps"));
        table.add(Mount::new(VirtualPath::parse("/apps/beta").unwrap(), "/srv/beta"));
        table.add(
            Mount::new(VirtualPath::parse("/apps").unwrap(), "/home/alice/apps")
                .owned_by("alice"),
        );

        let p = VirtualPath::parse("/apps/beta/x").unwrap();
        assert_eq!(
            table.best_match(None, &p).unwrap().physical_root,
            PathBuf::from("/srv/beta")
        );
        // User-mounts outrank global even when shorter.
        assert_eq!(
            table.best_match(Some("ALICE"), &p).unwrap().physical_root,
            PathBuf::from("/home/alice/apps")
        );
        assert_eq!(
            table.best_match(Some("bob"), &p).unwrap().physical_root,
            PathBuf::from("/srv/beta")
        );
    }

    #[tokio::test]
    async fn resolves_real_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.bin"), b"12345").unwrap();

        let table = Arc::new(MountTable::new());
        table.add(Mount::new(VirtualPath::parse("/data").unwrap(), dir.path()));
        let provider = PhysicalProvider::new(table);
        let ctx = ResolveCtx::anonymous();

        let path = VirtualPath::parse("/data/sub/file.bin").unwrap();
        match provider.resolve(&ctx, &path).await {
            Some(Resolution::Found(node)) => {
                assert_eq!(node.kind, crate::vfs::NodeKind::PhysicalFile);
                assert_eq!(node.size(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Missing files fall through the chain.
        let missing = VirtualPath::parse("/data/none").unwrap();
        assert!(provider.resolve(&ctx, &missing).await.is_none());

        let listing = provider.enumerate(&ctx, &VirtualPath::parse("/data").unwrap()).await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name(), "sub");
    }

    #[tokio::test]
    async fn virtual_files_attach_to_mount_root() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(MountTable::new());
        let mut mount = Mount::new(VirtualPath::parse("/data").unwrap(), dir.path());
        mount.virtual_files.push(("README.txt".into(), "rules".into()));
        table.add(mount);
        let provider = PhysicalProvider::new(table);
        let ctx = ResolveCtx::anonymous();

        let path = VirtualPath::parse("/data/readme.txt").unwrap();
        match provider.resolve(&ctx, &path).await {
            Some(Resolution::Found(node)) => {
                assert_eq!(node.kind, crate::vfs::NodeKind::VirtualFile);
                assert_eq!(node.content.as_deref(), Some("rules"));
                assert!(node.read_only);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn section_shortcut_redirects() {
        let sections = Arc::new(SectionStore::in_memory());
        sections.upsert(Section::new("APPS", "/site/apps")).unwrap();
        let provider = SectionShortcutProvider::new(sections);
        let ctx = ResolveCtx::anonymous();

        let path = VirtualPath::parse("/apps").unwrap();
        match provider.resolve(&ctx, &path).await {
            Some(Resolution::Found(node)) => {
                assert_eq!(node.virtual_path.as_str(), "/site/apps");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(provider.resolve(&ctx, &VirtualPath::parse("/nope").unwrap()).await.is_none());
        assert!(!provider.can_handle(&VirtualPath::parse("/a/b").unwrap()));
    }
}
