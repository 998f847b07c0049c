//! Sections: the accounting areas of the virtual namespace.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::FtpResult;
use crate::store::binfmt;
use crate::vfs::path::{fold_key, VirtualPath};

const SECTIONS_MAGIC: &[u8; 4] = b"AMSC";
const STORE_VERSION: u8 = 1;

/// A logical area with its own ratio policy. Sections partition the
/// virtual namespace for accounting: the section owning a path is the one
/// whose virtual root is the longest matching prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    /// Virtual root prefix, e.g. `/apps`.
    pub virtual_root: String,
    pub upload_multiplier: f64,
    pub download_multiplier: f64,
    /// Downloads cost nothing in a free-leech section.
    pub free_leech: bool,
}

impl Section {
    pub fn new(name: impl Into<String>, virtual_root: impl Into<String>) -> Self {
        Section {
            name: name.into(),
            virtual_root: virtual_root.into(),
            upload_multiplier: 1.0,
            download_multiplier: 1.0,
            free_leech: false,
        }
    }
}

/// Store of section definitions with interior locking and synchronous
/// persistence.
pub struct SectionStore {
    inner: RwLock<HashMap<String, Section>>,
    persist_path: Option<PathBuf>,
}

impl SectionStore {
    pub fn in_memory() -> Self {
        SectionStore { inner: RwLock::new(HashMap::new()), persist_path: None }
    }

    pub fn open(dir: impl Into<PathBuf>) -> FtpResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("sections.dat");
        let sections = if path.exists() { load_sections(&path)? } else { HashMap::new() };
        Ok(SectionStore { inner: RwLock::new(sections), persist_path: Some(path) })
    }

    pub fn section(&self, name: &str) -> Option<Section> {
        self.inner.read().expect("section store lock poisoned").get(&fold_key(name)).cloned()
    }

    pub fn all(&self) -> Vec<Section> {
        let mut v: Vec<Section> =
            self.inner.read().expect("section store lock poisoned").values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn upsert(&self, section: Section) -> FtpResult<()> {
        let mut inner = self.inner.write().expect("section store lock poisoned");
        inner.insert(fold_key(&section.name), section);
        if let Some(path) = &self.persist_path {
            save_sections(path, &inner)?;
        }
        Ok(())
    }

    /// The section owning a virtual path: deepest virtual root that
    /// prefixes it.
    pub fn section_for_path(&self, path: &VirtualPath) -> Option<Section> {
        let inner = self.inner.read().expect("section store lock poisoned");
        let mut best: Option<(usize, &Section)> = None;
        for section in inner.values() {
            let Ok(root) = VirtualPath::parse(&section.virtual_root) else { continue };
            if path.starts_with(&root) {
                let depth = root.depth();
                if best.map(|(d, _)| depth > d).unwrap_or(true) {
                    best = Some((depth, section));
                }
            }
        }
        best.map(|(_, s)| s.clone())
    }
}

fn save_sections(path: &Path, sections: &HashMap<String, Section>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(SECTIONS_MAGIC)?;
    binfmt::write_u8(&mut w, STORE_VERSION)?;
    binfmt::write_i32(&mut w, sections.len() as i32)?;
    for s in sections.values() {
        binfmt::write_string(&mut w, &s.name)?;
        binfmt::write_string(&mut w, &s.virtual_root)?;
        binfmt::write_f64(&mut w, s.upload_multiplier)?;
        binfmt::write_f64(&mut w, s.download_multiplier)?;
        binfmt::write_bool(&mut w, s.free_leech)?;
    }
    w.flush()?;
    w.get_ref().sync_all()
}

fn load_sections(path: &Path) -> io::Result<HashMap<String, Section>> {
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != SECTIONS_MAGIC {
        return Err(binfmt::invalid_data("bad section store magic"));
    }
    if binfmt::read_u8(&mut r)? != STORE_VERSION {
        return Err(binfmt::invalid_data("unsupported section store version"));
    }
    let count = binfmt::read_i32(&mut r)?;
    let mut sections = HashMap::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = binfmt::read_string(&mut r)?;
        let section = Section {
            virtual_root: binfmt::read_string(&mut r)?,
            upload_multiplier: binfmt::read_f64(&mut r)?,
            download_multiplier: binfmt::read_f64(&mut r)?,
            free_leech: binfmt::read_bool(&mut r)?,
            name,
        };
        sections.insert(fold_key(&section.name), section);
    }
    Ok(sections)
}
