//! Read-only key index: fingerprint of an offered public key → GitHub user id.
//!
//! The index is produced offline (crawl GitHub users, fetch `<user>.keys`,
//! hash each line) and is never written by this server. A small fixed pool
//! of SQLite connections serves concurrent lookups from the connection
//! handlers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use sha2::{Digest, Sha256};

/// Length of the stored fingerprint: the leading bytes of a SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Truncated hash of an authorized-keys line, the index primary key.
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Compute the index fingerprint of an authorized-keys line.
///
/// The line is trimmed of surrounding whitespace before hashing. This must
/// stay bit-identical to the offline indexer or every lookup goes dark.
pub fn fingerprint(line: &str) -> Fingerprint {
    let digest = Sha256::digest(line.trim().as_bytes());
    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    out
}

/// Pooled read-only handle on the on-disk index.
pub struct KeyIndex {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl KeyIndex {
    /// Open `pool_size` read-only connections to the index at `path`.
    ///
    /// Sizes below 3 are raised to 3 so simultaneous resolutions don't
    /// serialize on a single handle.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let pool_size = pool_size.max(3);
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open_with_flags(path, flags)
                .with_context(|| format!("failed to open key index at {}", path.display()))?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns,
            next: AtomicUsize::new(0),
        })
    }

    /// Look up a single fingerprint. `Ok(None)` means not indexed.
    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<i64>> {
        let conn = self.acquire();
        let conn = conn.lock().unwrap();
        Self::query(&conn, fp)
    }

    /// Resolve the offered keys in offer order and return the first hit.
    ///
    /// Holds one pooled handle for the whole sweep, like the lookups of a
    /// single session should.
    pub fn find_user<'a, I>(&self, lines: I) -> Result<Option<i64>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let conn = self.acquire();
        let conn = conn.lock().unwrap();
        for line in lines {
            if let Some(user_id) = Self::query(&conn, &fingerprint(line))? {
                return Ok(Some(user_id));
            }
        }
        Ok(None)
    }

    fn acquire(&self) -> &Mutex<Connection> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[i]
    }

    fn query(conn: &Connection, fp: &Fingerprint) -> Result<Option<i64>> {
        let mut stmt = conn
            .prepare_cached("SELECT user_id FROM key_userid WHERE key_hash = ?1")
            .context("failed to prepare index lookup")?;
        let mut rows = stmt.query(params![&fp[..]])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}
