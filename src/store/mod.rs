//! Process-wide persistent stores.
//!
//! Users, groups and sections live in stores with interior reader-writer
//! locking; mutations persist synchronously to disk before the call
//! returns success. Sessions hold shared references to the stores, never
//! ownership. The on-disk encoding is the little-endian, varint-string
//! format from [`binfmt`].

pub mod binfmt;
pub mod section;
pub mod user;

pub use section::{Section, SectionStore};
pub use user::{Capabilities, Group, PasswordHash, User, UserStore};
