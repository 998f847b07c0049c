//! Virtual filesystem resolver.
//!
//! The unified path namespace is composed from pluggable providers
//! evaluated in a fixed order; the first provider that can handle a path
//! and produces a final resolution wins. Providers return `None` to pass
//! a path down the chain, which is how a bare `/NAME` falls through the
//! physical provider onto the section shortcut provider.
//!
//! Resolution results are cached in a bounded TTL map keyed by user and
//! normalized path. The cache is a performance aid only; every mutation
//! through the session layer invalidates the affected entries.

pub mod path;
pub mod physical;
pub mod pre;
pub mod release;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

pub use path::VirtualPath;

/// Default TTL of the resolve cache.
pub const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(5);
const RESOLVE_CACHE_CAPACITY: u64 = 4096;

/// Node variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PhysicalFile,
    PhysicalDirectory,
    VirtualFile,
    VirtualDirectory,
}

/// File metadata attached to file nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMeta {
    pub size: u64,
    pub modified_unix: i64,
}

/// A resolved node in the virtual namespace. Virtual nodes never resolve
/// to real file I/O; physical nodes carry the backing path.
#[derive(Debug, Clone, PartialEq)]
pub struct VfsNode {
    pub kind: NodeKind,
    /// Where the node lives in the virtual namespace. Shortcut providers
    /// may return a node whose virtual path differs from the request
    /// path; the session treats that as a redirect target.
    pub virtual_path: VirtualPath,
    pub physical_path: Option<PathBuf>,
    /// Static content of a virtual file.
    pub content: Option<String>,
    pub meta: Option<NodeMeta>,
    /// Writes onto read-only nodes are rejected by the session when a
    /// write command is dispatched.
    pub read_only: bool,
}

impl VfsNode {
    pub fn physical_file(
        virtual_path: VirtualPath,
        physical: PathBuf,
        meta: NodeMeta,
        read_only: bool,
    ) -> Self {
        VfsNode {
            kind: NodeKind::PhysicalFile,
            virtual_path,
            physical_path: Some(physical),
            content: None,
            meta: Some(meta),
            read_only,
        }
    }

    pub fn physical_dir(virtual_path: VirtualPath, physical: PathBuf, read_only: bool) -> Self {
        VfsNode {
            kind: NodeKind::PhysicalDirectory,
            virtual_path,
            physical_path: Some(physical),
            content: None,
            meta: None,
            read_only,
        }
    }

    pub fn virtual_file(virtual_path: VirtualPath, content: impl Into<String>) -> Self {
        let content = content.into();
        let meta = NodeMeta { size: content.len() as u64, modified_unix: 0 };
        VfsNode {
            kind: NodeKind::VirtualFile,
            virtual_path,
            physical_path: None,
            content: Some(content),
            meta: Some(meta),
            read_only: true,
        }
    }

    pub fn virtual_dir(virtual_path: VirtualPath) -> Self {
        VfsNode {
            kind: NodeKind::VirtualDirectory,
            virtual_path,
            physical_path: None,
            content: None,
            meta: None,
            read_only: true,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::PhysicalDirectory | NodeKind::VirtualDirectory)
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    pub fn name(&self) -> String {
        self.virtual_path.file_name().unwrap_or("/").to_string()
    }

    pub fn size(&self) -> u64 {
        self.meta.map(|m| m.size).unwrap_or(0)
    }
}

/// Outcome of a resolution. Errors carry a short human reason only; the
/// session translates them into protocol replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(VfsNode),
    NotFound(String),
    Denied(String),
}

impl Resolution {
    pub fn not_found() -> Self {
        Resolution::NotFound("No such file or directory".to_string())
    }
}

/// Identity under which a resolution runs.
#[derive(Debug, Clone, Default)]
pub struct ResolveCtx {
    pub username: Option<String>,
    pub groups: Vec<String>,
    pub siteop: bool,
}

impl ResolveCtx {
    pub fn anonymous() -> Self {
        ResolveCtx::default()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }
}

/// One provider in the chain.
#[async_trait]
pub trait VfsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap namespace test consulted before `resolve`.
    fn can_handle(&self, path: &VirtualPath) -> bool;

    /// `Some` is a final answer; `None` passes the path down the chain.
    async fn resolve(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Option<Resolution>;

    /// Children of a directory. Best-effort: on I/O error the result is
    /// empty, not an error.
    async fn enumerate(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode>;
}

/// The provider chain plus the resolve cache.
pub struct VfsResolver {
    providers: Vec<Arc<dyn VfsProvider>>,
    cache: moka::sync::Cache<String, Resolution>,
}

impl VfsResolver {
    /// Builds a resolver over `providers`, evaluated in the given order.
    pub fn new(providers: Vec<Arc<dyn VfsProvider>>) -> Self {
        VfsResolver::with_cache_ttl(providers, RESOLVE_CACHE_TTL)
    }

    pub fn with_cache_ttl(providers: Vec<Arc<dyn VfsProvider>>, ttl: Duration) -> Self {
        VfsResolver {
            providers,
            cache: moka::sync::Cache::builder()
                .max_capacity(RESOLVE_CACHE_CAPACITY)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    fn cache_key(ctx: &ResolveCtx, path: &VirtualPath) -> String {
        format!("{}\n{}", ctx.username.as_deref().unwrap_or(""), path.fold())
    }

    /// Resolves a normalized path through the chain.
    pub async fn resolve(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Resolution {
        let key = Self::cache_key(ctx, path);
        if let Some(cached) = self.cache.get(&key) {
            trace!(%path, "vfs resolve cache hit");
            return cached;
        }
        let resolution = self.resolve_uncached(ctx, path).await;
        self.cache.insert(key, resolution.clone());
        resolution
    }

    async fn resolve_uncached(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Resolution {
        for provider in &self.providers {
            if !provider.can_handle(path) {
                continue;
            }
            if let Some(resolution) = provider.resolve(ctx, path).await {
                trace!(%path, provider = provider.name(), "vfs resolved");
                return resolution;
            }
        }
        Resolution::not_found()
    }

    /// Enumerates the children of `path` across every provider that
    /// claims it. Duplicate virtual paths keep the first (highest
    /// priority) node.
    pub async fn list(&self, ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for provider in &self.providers {
            if !provider.can_handle(path) {
                continue;
            }
            for node in provider.enumerate(ctx, path).await {
                if seen.insert(node.virtual_path.fold()) {
                    out.push(node);
                }
            }
        }
        out
    }

    /// Drops cached resolutions for a path, called after writes.
    pub fn invalidate(&self, path: &VirtualPath) {
        let suffix = format!("\n{}", path.fold());
        self.cache.invalidate_entries_if(move |k, _| k.ends_with(&suffix)).ok();
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        prefix: &'static str,
        resolution: Option<Resolution>,
    }

    #[async_trait]
    impl VfsProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn can_handle(&self, path: &VirtualPath) -> bool {
            path.starts_with(&VirtualPath::parse(self.prefix).unwrap())
        }

        async fn resolve(&self, _ctx: &ResolveCtx, _path: &VirtualPath) -> Option<Resolution> {
            self.resolution.clone()
        }

        async fn enumerate(&self, _ctx: &ResolveCtx, path: &VirtualPath) -> Vec<VfsNode> {
            vec![VfsNode::virtual_dir(path.child("entry"))]
        }
    }

    #[tokio::test]
    async fn first_final_answer_wins() {
        let resolver = VfsResolver::new(vec![
            Arc::new(FixedProvider { prefix: "/a", resolution: None }),
            Arc::new(FixedProvider {
                prefix: "/a",
                resolution: Some(Resolution::Denied("no".into())),
            }),
            Arc::new(FixedProvider {
                prefix: "/a",
                resolution: Some(Resolution::Found(VfsNode::virtual_dir(VirtualPath::root()))),
            }),
        ]);
        let ctx = ResolveCtx::anonymous();
        let path = VirtualPath::parse("/a/x").unwrap();
        assert!(matches!(resolver.resolve(&ctx, &path).await, Resolution::Denied(_)));
    }

    #[tokio::test]
    async fn unhandled_paths_are_not_found() {
        let resolver = VfsResolver::new(vec![Arc::new(FixedProvider {
            prefix: "/a",
            resolution: Some(Resolution::Found(VfsNode::virtual_dir(VirtualPath::root()))),
        })]);
        let ctx = ResolveCtx::anonymous();
        let path = VirtualPath::parse("/elsewhere").unwrap();
        assert!(matches!(resolver.resolve(&ctx, &path).await, Resolution::NotFound(_)));
    }

    #[tokio::test]
    async fn cache_is_keyed_per_user() {
        let resolver = VfsResolver::new(vec![Arc::new(FixedProvider {
            prefix: "/a",
            resolution: Some(Resolution::Found(VfsNode::virtual_dir(VirtualPath::root()))),
        })]);
        let path = VirtualPath::parse("/a").unwrap();
        let alice = ResolveCtx { username: Some("alice".into()), ..ResolveCtx::default() };
        let bob = ResolveCtx { username: Some("bob".into()), ..ResolveCtx::default() };
        assert_ne!(
            VfsResolver::cache_key(&alice, &path),
            VfsResolver::cache_key(&bob, &path)
        );
        // Warm then invalidate; both must still resolve afterwards.
        resolver.resolve(&alice, &path).await;
        resolver.invalidate(&path);
        assert!(matches!(resolver.resolve(&alice, &path).await, Resolution::Found(_)));
        assert!(matches!(resolver.resolve(&bob, &path).await, Resolution::Found(_)));
    }
}
