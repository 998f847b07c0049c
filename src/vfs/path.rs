//! Virtual path normalization.
//!
//! Every path entering the resolver goes through [`VirtualPath::parse`]:
//! backslashes become forward slashes, redundant slashes collapse, `.` and
//! `..` segments are resolved with `..` clamped at the root, and embedded
//! NUL bytes are rejected. The normalized form always starts with `/` and
//! never carries a trailing slash (except the root itself), which makes
//! normalization idempotent. Component comparison is case-insensitive
//! across the whole resolver.

use smallvec::SmallVec;

use crate::error::{FtpError, FtpResult};

/// Case-folds a name for use as a map key. Usernames, section names,
/// release names and path components all compare case-insensitively.
pub fn fold_key(s: &str) -> String {
    s.to_uppercase()
}

/// A normalized virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The namespace root, `/`.
    pub fn root() -> Self {
        VirtualPath("/".to_string())
    }

    /// Normalizes raw client input into a virtual path.
    pub fn parse(input: &str) -> FtpResult<Self> {
        if input.contains('\0') {
            return Err(FtpError::bad_argument("Path contains NUL"));
        }
        let cleaned = input.trim().replace('\\', "/");
        let mut segments: SmallVec<[&str; 8]> = SmallVec::new();
        for segment in cleaned.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    // ".." from the root is clamped at the root.
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Ok(VirtualPath::root());
        }
        let mut out = String::with_capacity(cleaned.len() + 1);
        for segment in &segments {
            out.push('/');
            out.push_str(segment);
        }
        Ok(VirtualPath(out))
    }

    /// Resolves `arg` against this path: absolute arguments replace it,
    /// relative arguments append to it.
    pub fn join(&self, arg: &str) -> FtpResult<Self> {
        let trimmed = arg.trim();
        if trimmed.starts_with('/') || trimmed.starts_with('\\') {
            VirtualPath::parse(trimmed)
        } else {
            VirtualPath::parse(&format!("{}/{}", self.0, trimmed))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path components, root excluded.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Final component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent directory; the root is its own parent.
    pub fn parent(&self) -> VirtualPath {
        match self.0.rfind('/') {
            Some(0) | None => VirtualPath::root(),
            Some(idx) => VirtualPath(self.0[..idx].to_string()),
        }
    }

    /// Appends a single literal component.
    pub fn child(&self, name: &str) -> VirtualPath {
        if self.is_root() {
            VirtualPath(format!("/{name}"))
        } else {
            VirtualPath(format!("{}/{name}", self.0))
        }
    }

    /// Case-insensitive segment-wise prefix test. `/Apps/x` starts with
    /// `/apps` but not with `/ap`.
    pub fn starts_with(&self, prefix: &VirtualPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        let mut mine = self.segments();
        for want in prefix.segments() {
            match mine.next() {
                Some(got) if got.eq_ignore_ascii_case(want) => {}
                _ => return false,
            }
        }
        true
    }

    /// The remainder of this path below `prefix`, as a relative string.
    /// Empty when the paths are equal. `None` when `prefix` is not a
    /// prefix of this path.
    pub fn strip_prefix(&self, prefix: &VirtualPath) -> Option<String> {
        if !self.starts_with(prefix) {
            return None;
        }
        let skip = prefix.depth();
        let rest: Vec<&str> = self.segments().skip(skip).collect();
        Some(rest.join("/"))
    }

    /// Uppercased form for cache and registry keys.
    pub fn fold(&self) -> String {
        fold_key(&self.0)
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> String {
        VirtualPath::parse(s).unwrap().as_str().to_string()
    }

    #[test]
    fn normalization_basics() {
        assert_eq!(norm(""), "/");
        assert_eq!(norm("/"), "/");
        assert_eq!(norm("a/b"), "/a/b");
        assert_eq!(norm("//a///b//"), "/a/b");
        assert_eq!(norm("\\apps\\games"), "/apps/games");
        assert_eq!(norm("  /a/b  "), "/a/b");
    }

    #[test]
    fn dot_segments() {
        assert_eq!(norm("/a/./b"), "/a/b");
        assert_eq!(norm("/a/b/.."), "/a");
        assert_eq!(norm("/a/../../b"), "/b");
        assert_eq!(norm("/.."), "/");
        assert_eq!(norm("/../../.."), "/");
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in ["", "/", "a//b/../c", "\\x\\y\\..", "/PRE/GRP/..", "/a/b/c"] {
            let once = norm(input);
            assert_eq!(norm(&once), once);
        }
    }

    #[test]
    fn nul_rejected() {
        assert!(VirtualPath::parse("/a\0b").is_err());
    }

    #[test]
    fn join_absolute_and_relative() {
        let cwd = VirtualPath::parse("/apps/tools").unwrap();
        assert_eq!(cwd.join("/games").unwrap().as_str(), "/games");
        assert_eq!(cwd.join("sub").unwrap().as_str(), "/apps/tools/sub");
        assert_eq!(cwd.join("..").unwrap().as_str(), "/apps");
        assert_eq!(cwd.join("../..").unwrap().as_str(), "/");
    }

    #[test]
    fn prefix_is_case_insensitive() {
        let p = VirtualPath::parse("/Apps/Tools/x").unwrap();
        assert!(p.starts_with(&VirtualPath::parse("/apps").unwrap()));
        assert!(p.starts_with(&VirtualPath::parse("/APPS/tools").unwrap()));
        assert!(!p.starts_with(&VirtualPath::parse("/ap").unwrap()));
        assert_eq!(
            p.strip_prefix(&VirtualPath::parse("/apps").unwrap()).unwrap(),
            "Tools/x"
        );
    }

    #[test]
    fn parent_and_child() {
        let p = VirtualPath::parse("/a/b/c").unwrap();
        assert_eq!(p.parent().as_str(), "/a/b");
        assert_eq!(VirtualPath::root().parent().as_str(), "/");
        assert_eq!(VirtualPath::root().child("x").as_str(), "/x");
        assert_eq!(p.file_name(), Some("c"));
    }
}
