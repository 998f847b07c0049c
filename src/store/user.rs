//! User and group records and their store.
//!
//! Usernames are unique case-insensitively; the store keys on the folded
//! name. Credit balances are mutated only through the store so that
//! concurrent transfers by the same user serialize on the store lock and
//! balance conservation holds.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::error::{FtpError, FtpResult};
use crate::store::binfmt;
use crate::vfs::path::fold_key;

const USERS_MAGIC: &[u8; 4] = b"AMUS";
const GROUPS_MAGIC: &[u8; 4] = b"AMGR";
const STORE_VERSION: u8 = 1;

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// PBKDF2-SHA256 password hash with its salt and round count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub rounds: u32,
    pub salt: Vec<u8>,
    pub hash: Vec<u8>,
}

impl PasswordHash {
    /// Derives a fresh hash with a random salt.
    pub fn derive(password: &str) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hash = vec![0u8; HASH_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut hash);
        PasswordHash { rounds: PBKDF2_ROUNDS, salt, hash }
    }

    /// Fixed-time verification: the comparison always walks the whole
    /// digest regardless of where the first mismatch sits.
    pub fn verify(&self, password: &str) -> bool {
        let mut candidate = vec![0u8; self.hash.len().max(1)];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, self.rounds, &mut candidate);
        if candidate.len() != self.hash.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in candidate.iter().zip(self.hash.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

/// Capability flags gating command authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub download: bool,
    pub upload: bool,
    pub active_mode: bool,
    pub fxp: bool,
    pub siteop: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { download: true, upload: true, active_mode: true, fxp: false, siteop: false }
    }
}

/// A site account.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: PasswordHash,
    /// Home directory in the virtual namespace.
    pub home: String,
    pub primary_group: Option<String>,
    pub groups: Vec<String>,
    pub caps: Capabilities,
    /// Idle timeout override in seconds; the daemon default applies when
    /// unset.
    pub idle_timeout_secs: Option<u64>,
    pub max_logins: u32,
    /// KiB/s caps for downloads and uploads; unlimited when unset.
    pub down_rate_cap_kibs: Option<u32>,
    pub up_rate_cap_kibs: Option<u32>,
    /// Credit balance in KiB.
    pub credits_kib: u64,
    /// Optional allow-mask the control-peer IP must match, e.g.
    /// `192.168.1.*` or an exact address.
    pub ip_mask: Option<String>,
    /// IDENT binding: the ident username the remote must present, and
    /// whether a mismatch denies the login.
    pub required_ident: Option<String>,
    pub ident_must_match: bool,
}

impl User {
    /// A fresh account with default policy and the given password.
    pub fn new(name: impl Into<String>, password: &str) -> Self {
        User {
            name: name.into(),
            password: PasswordHash::derive(password),
            home: "/".to_string(),
            primary_group: None,
            groups: Vec::new(),
            caps: Capabilities::default(),
            idle_timeout_secs: None,
            max_logins: 3,
            down_rate_cap_kibs: None,
            up_rate_cap_kibs: None,
            credits_kib: 0,
            ip_mask: None,
            required_ident: None,
            ident_must_match: false,
        }
    }

    /// Whether the control-peer address passes the account's IP
    /// allow-mask. Accounts without a mask accept any address.
    pub fn ip_allowed(&self, addr: &std::net::IpAddr) -> bool {
        let Some(mask) = &self.ip_mask else { return true };
        let addr = addr.to_string();
        mask_matches(mask, &addr)
    }
}

/// Simple `*`/`?` wildcard match used for IP allow-masks.
fn mask_matches(pattern: &str, value: &str) -> bool {
    // Recursive descent over bytes; patterns are short.
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// Per-section ratio override carried by a group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupRatio {
    pub upload_multiplier: Option<f64>,
    pub download_multiplier: Option<f64>,
}

/// A named set of user references with per-section credit multipliers.
/// Membership does not imply ownership of the member accounts.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub members: Vec<String>,
    /// Keyed by folded section name.
    pub section_ratios: HashMap<String, GroupRatio>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Group { name: name.into(), ..Group::default() }
    }

    pub fn ratio_for(&self, section: &str) -> Option<GroupRatio> {
        self.section_ratios.get(&fold_key(section)).copied()
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
}

/// Store for users and groups. Reader-writer locked; every mutation is
/// written to disk before the call returns when a persistence directory
/// is configured.
pub struct UserStore {
    inner: RwLock<Inner>,
    persist_dir: Option<PathBuf>,
}

impl UserStore {
    /// In-memory store, used by tests and embedders that persist
    /// elsewhere.
    pub fn in_memory() -> Self {
        UserStore { inner: RwLock::new(Inner::default()), persist_dir: None }
    }

    /// Opens (or initializes) a store persisted under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> FtpResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut inner = Inner::default();
        let users_path = dir.join("users.dat");
        if users_path.exists() {
            inner.users = load_users(&users_path)?;
        }
        let groups_path = dir.join("groups.dat");
        if groups_path.exists() {
            inner.groups = load_groups(&groups_path)?;
        }
        debug!(users = inner.users.len(), groups = inner.groups.len(), "user store opened");
        Ok(UserStore { inner: RwLock::new(inner), persist_dir: Some(dir) })
    }

    pub fn user_count(&self) -> usize {
        self.inner.read().expect("user store lock poisoned").users.len()
    }

    /// Case-insensitive lookup.
    pub fn user(&self, name: &str) -> Option<User> {
        self.inner.read().expect("user store lock poisoned").users.get(&fold_key(name)).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.inner.read().expect("user store lock poisoned").groups.get(&fold_key(name)).cloned()
    }

    /// The primary group record for a user, when both exist.
    pub fn primary_group_of(&self, user: &User) -> Option<Group> {
        user.primary_group.as_deref().and_then(|g| self.group(g))
    }

    /// Inserts or replaces a user and persists.
    pub fn upsert_user(&self, user: User) -> FtpResult<()> {
        let mut inner = self.inner.write().expect("user store lock poisoned");
        inner.users.insert(fold_key(&user.name), user);
        self.persist(&inner)
    }

    pub fn remove_user(&self, name: &str) -> FtpResult<bool> {
        let mut inner = self.inner.write().expect("user store lock poisoned");
        let removed = inner.users.remove(&fold_key(name)).is_some();
        if removed {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    pub fn upsert_group(&self, group: Group) -> FtpResult<()> {
        let mut inner = self.inner.write().expect("user store lock poisoned");
        inner.groups.insert(fold_key(&group.name), group);
        self.persist(&inner)
    }

    /// Verifies a password. Returns the account on success. The hash
    /// comparison is fixed-time; a missing account still burns a PBKDF2
    /// derivation so user enumeration by timing stays impractical.
    pub fn authenticate(&self, name: &str, password: &str) -> Option<User> {
        match self.user(name) {
            Some(user) if user.password.verify(password) => Some(user),
            Some(_) => None,
            None => {
                let _ = PasswordHash::derive(password);
                None
            }
        }
    }

    /// Atomically applies a download cost. Returns `(ok, new_balance)`;
    /// a failed consume leaves the balance unchanged.
    pub fn consume_credits(&self, name: &str, cost_kib: u64) -> FtpResult<(bool, u64)> {
        let mut inner = self.inner.write().expect("user store lock poisoned");
        let user = inner
            .users
            .get_mut(&fold_key(name))
            .ok_or_else(|| FtpError::Fatal(format!("unknown user {name}")))?;
        let (ok, new_balance) = crate::credit::try_consume(user.credits_kib, cost_kib);
        if ok {
            user.credits_kib = new_balance;
            self.persist(&inner)?;
        }
        Ok((ok, new_balance))
    }

    /// Atomically awards upload credits; returns the new balance.
    pub fn award_credits(&self, name: &str, credits_kib: u64) -> FtpResult<u64> {
        let mut inner = self.inner.write().expect("user store lock poisoned");
        let user = inner
            .users
            .get_mut(&fold_key(name))
            .ok_or_else(|| FtpError::Fatal(format!("unknown user {name}")))?;
        user.credits_kib = user.credits_kib.saturating_add(credits_kib);
        let balance = user.credits_kib;
        self.persist(&inner)?;
        Ok(balance)
    }

    fn persist(&self, inner: &Inner) -> FtpResult<()> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        save_users(&dir.join("users.dat"), &inner.users)?;
        save_groups(&dir.join("groups.dat"), &inner.groups)?;
        Ok(())
    }
}

fn save_users(path: &Path, users: &HashMap<String, User>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(USERS_MAGIC)?;
    binfmt::write_u8(&mut w, STORE_VERSION)?;
    binfmt::write_i32(&mut w, users.len() as i32)?;
    for user in users.values() {
        write_user(&mut w, user)?;
    }
    w.flush()?;
    w.get_ref().sync_all()
}

fn load_users(path: &Path) -> io::Result<HashMap<String, User>> {
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != USERS_MAGIC {
        return Err(binfmt::invalid_data("bad user store magic"));
    }
    if binfmt::read_u8(&mut r)? != STORE_VERSION {
        return Err(binfmt::invalid_data("unsupported user store version"));
    }
    let count = binfmt::read_i32(&mut r)?;
    let mut users = HashMap::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let user = read_user(&mut r)?;
        users.insert(fold_key(&user.name), user);
    }
    Ok(users)
}

fn write_user(w: &mut impl Write, u: &User) -> io::Result<()> {
    binfmt::write_string(w, &u.name)?;
    binfmt::write_u32(w, u.password.rounds)?;
    binfmt::write_varint(w, u.password.salt.len() as u64)?;
    w.write_all(&u.password.salt)?;
    binfmt::write_varint(w, u.password.hash.len() as u64)?;
    w.write_all(&u.password.hash)?;
    binfmt::write_string(w, &u.home)?;
    binfmt::write_string(w, u.primary_group.as_deref().unwrap_or(""))?;
    binfmt::write_i32(w, u.groups.len() as i32)?;
    for g in &u.groups {
        binfmt::write_string(w, g)?;
    }
    let caps = &u.caps;
    binfmt::write_bool(w, caps.download)?;
    binfmt::write_bool(w, caps.upload)?;
    binfmt::write_bool(w, caps.active_mode)?;
    binfmt::write_bool(w, caps.fxp)?;
    binfmt::write_bool(w, caps.siteop)?;
    binfmt::write_i64(w, u.idle_timeout_secs.map(|v| v as i64).unwrap_or(-1))?;
    binfmt::write_u32(w, u.max_logins)?;
    binfmt::write_i64(w, u.down_rate_cap_kibs.map(|v| v as i64).unwrap_or(-1))?;
    binfmt::write_i64(w, u.up_rate_cap_kibs.map(|v| v as i64).unwrap_or(-1))?;
    binfmt::write_i64(w, u.credits_kib as i64)?;
    binfmt::write_string(w, u.ip_mask.as_deref().unwrap_or(""))?;
    binfmt::write_string(w, u.required_ident.as_deref().unwrap_or(""))?;
    binfmt::write_bool(w, u.ident_must_match)
}

fn read_user(r: &mut impl Read) -> io::Result<User> {
    let name = binfmt::read_string(r)?;
    let rounds = binfmt::read_u32(r)?;
    let salt_len = binfmt::read_varint(r)? as usize;
    if salt_len > 256 {
        return Err(binfmt::invalid_data("salt too long"));
    }
    let mut salt = vec![0u8; salt_len];
    r.read_exact(&mut salt)?;
    let hash_len = binfmt::read_varint(r)? as usize;
    if hash_len > 256 {
        return Err(binfmt::invalid_data("hash too long"));
    }
    let mut hash = vec![0u8; hash_len];
    r.read_exact(&mut hash)?;
    let home = binfmt::read_string(r)?;
    let primary_group = non_empty(binfmt::read_string(r)?);
    let group_count = binfmt::read_i32(r)?;
    let mut groups = Vec::with_capacity(group_count.max(0) as usize);
    for _ in 0..group_count {
        groups.push(binfmt::read_string(r)?);
    }
    let caps = Capabilities {
        download: binfmt::read_bool(r)?,
        upload: binfmt::read_bool(r)?,
        active_mode: binfmt::read_bool(r)?,
        fxp: binfmt::read_bool(r)?,
        siteop: binfmt::read_bool(r)?,
    };
    let idle = binfmt::read_i64(r)?;
    let max_logins = binfmt::read_u32(r)?;
    let down_cap = binfmt::read_i64(r)?;
    let up_cap = binfmt::read_i64(r)?;
    let credits = binfmt::read_i64(r)?;
    let ip_mask = non_empty(binfmt::read_string(r)?);
    let required_ident = non_empty(binfmt::read_string(r)?);
    let ident_must_match = binfmt::read_bool(r)?;
    Ok(User {
        name,
        password: PasswordHash { rounds, salt, hash },
        home,
        primary_group,
        groups,
        caps,
        idle_timeout_secs: (idle >= 0).then_some(idle as u64),
        max_logins,
        down_rate_cap_kibs: (down_cap >= 0).then_some(down_cap as u32),
        up_rate_cap_kibs: (up_cap >= 0).then_some(up_cap as u32),
        credits_kib: credits.max(0) as u64,
        ip_mask,
        required_ident,
        ident_must_match,
    })
}

fn save_groups(path: &Path, groups: &HashMap<String, Group>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(GROUPS_MAGIC)?;
    binfmt::write_u8(&mut w, STORE_VERSION)?;
    binfmt::write_i32(&mut w, groups.len() as i32)?;
    for group in groups.values() {
        binfmt::write_string(&mut w, &group.name)?;
        binfmt::write_i32(&mut w, group.members.len() as i32)?;
        for m in &group.members {
            binfmt::write_string(&mut w, m)?;
        }
        binfmt::write_i32(&mut w, group.section_ratios.len() as i32)?;
        for (section, ratio) in &group.section_ratios {
            binfmt::write_string(&mut w, section)?;
            binfmt::write_f64(&mut w, ratio.upload_multiplier.unwrap_or(-1.0))?;
            binfmt::write_f64(&mut w, ratio.download_multiplier.unwrap_or(-1.0))?;
        }
    }
    w.flush()?;
    w.get_ref().sync_all()
}

fn load_groups(path: &Path) -> io::Result<HashMap<String, Group>> {
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != GROUPS_MAGIC {
        return Err(binfmt::invalid_data("bad group store magic"));
    }
    if binfmt::read_u8(&mut r)? != STORE_VERSION {
        return Err(binfmt::invalid_data("unsupported group store version"));
    }
    let count = binfmt::read_i32(&mut r)?;
    let mut groups = HashMap::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = binfmt::read_string(&mut r)?;
        let member_count = binfmt::read_i32(&mut r)?;
        let mut members = Vec::with_capacity(member_count.max(0) as usize);
        for _ in 0..member_count {
            members.push(binfmt::read_string(&mut r)?);
        }
        let ratio_count = binfmt::read_i32(&mut r)?;
        let mut section_ratios = HashMap::with_capacity(ratio_count.max(0) as usize);
        for _ in 0..ratio_count {
            let section = binfmt::read_string(&mut r)?;
            let up = binfmt::read_f64(&mut r)?;
            let down = binfmt::read_f64(&mut r)?;
            section_ratios.insert(
                section,
                GroupRatio {
                    upload_multiplier: (up >= 0.0).then_some(up),
                    download_multiplier: (down >= 0.0).then_some(down),
                },
            );
        }
        groups.insert(fold_key(&name), Group { name, members, section_ratios });
    }
    Ok(groups)
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
