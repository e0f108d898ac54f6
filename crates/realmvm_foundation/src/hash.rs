//! Content hashes and durable object identities.
//!
//! A [`Hashlet`] is the first 20 bytes of a SHA-256 digest. Package ids are
//! the hashlet of the package path; object ids pair the package id with the
//! realm-local creation counter.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a [`Hashlet`] in bytes.
pub const HASHLET_LEN: usize = 20;

/// A truncated SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hashlet(pub [u8; HASHLET_LEN]);

impl Hashlet {
    /// Hashes arbitrary bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; HASHLET_LEN];
        out.copy_from_slice(&digest[..HASHLET_LEN]);
        Self(out)
    }

    /// Returns true for the all-zero hashlet.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

impl fmt::Debug for Hashlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlet({})", self.to_hex())
    }
}

impl fmt::Display for Hashlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of a package (and of its realm): the hash of its path.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PkgId(pub Hashlet);

impl PkgId {
    /// Derives the package id from a package path.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        Self(Hashlet::of(path.as_bytes()))
    }

    /// Returns true for the zero id.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Debug for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PkgId({})", self.0.to_hex())
    }
}

impl fmt::Display for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Durable identity of an object: owning package plus creation time.
///
/// The zero id means the object has never become real.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Package the object was created in.
    pub pkg_id: PkgId,
    /// Realm-local creation counter at the time the object became real.
    pub new_time: u64,
}

impl ObjectId {
    /// Creates an object id.
    #[must_use]
    pub fn new(pkg_id: PkgId, new_time: u64) -> Self {
        Self { pkg_id, new_time }
    }

    /// Returns true if the object has never been assigned an identity.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.new_time == 0 && self.pkg_id.is_zero()
    }

    /// Store key for this object.
    #[must_use]
    pub fn key(&self) -> String {
        format!("oid:{self}")
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pkg_id, self.new_time)
    }
}
