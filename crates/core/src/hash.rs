//! BLAKE3 content fingerprints

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Files at or above this size are hashed through a memory map
pub const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A BLAKE3 content fingerprint (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a fingerprint from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the fingerprint as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for display
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }

    /// Parse from a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            anyhow::bail!("Invalid fingerprint length: expected 64 characters, got {}", s.len());
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .with_context(|| format!("Invalid fingerprint hex: {s}"))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Fingerprint a byte slice
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
    Fingerprint::from_bytes(*blake3::hash(data).as_bytes())
}

/// Fingerprint a file, streaming small files and memory-mapping large ones
pub fn hash_file(path: &Path) -> std::io::Result<Fingerprint> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len >= MMAP_THRESHOLD {
        return hash_mmap(&file);
    }

    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Fingerprint::from_bytes(*hasher.finalize().as_bytes()))
}

/// Fingerprint a file while keeping at most its first `limit` bytes
///
/// The fingerprint always covers the whole file, so it can be compared with
/// one taken by [`hash_file`] to tell whether the bytes kept are the ones
/// that were fingerprinted earlier.
pub fn read_prefix_and_hash(path: &Path, limit: u64) -> std::io::Result<(Vec<u8>, Fingerprint)> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut prefix = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        hasher.update(chunk);
        let room = limit.saturating_sub(prefix.len());
        prefix.extend_from_slice(&chunk[..room.min(read)]);
    }
    Ok((prefix, Fingerprint::from_bytes(*hasher.finalize().as_bytes())))
}

fn hash_mmap(file: &File) -> std::io::Result<Fingerprint> {
    use memmap2::Mmap;

    // SAFETY: the map is read-only and dropped before returning. A concurrent
    // writer can only change the bytes we hash, which the walker tolerates.
    let mmap = unsafe { Mmap::map(file)? };
    Ok(hash_bytes(&mmap))
}

/// Builds a directory's aggregate fingerprint from its ordered children
///
/// Each child contributes its name, kind tag and fingerprint, length-prefixed
/// so that distinct child lists can never produce the same byte stream.
pub struct DirectoryHasher {
    inner: blake3::Hasher,
    children: usize,
}

impl DirectoryHasher {
    /// Create an empty directory hasher
    pub fn new() -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(b"cst-dir-v1\0");
        Self { inner, children: 0 }
    }

    /// Append one child; callers must feed children in sorted name order
    pub fn push_child(&mut self, name: &str, is_dir: bool, fingerprint: &Fingerprint) {
        self.inner.update(&(name.len() as u64).to_le_bytes());
        self.inner.update(name.as_bytes());
        self.inner.update(&[u8::from(is_dir)]);
        self.inner.update(fingerprint.as_bytes());
        self.children += 1;
    }

    /// Number of children pushed so far
    pub fn child_count(&self) -> usize {
        self.children
    }

    /// Finalize into a fingerprint
    pub fn finalize(self) -> Fingerprint {
        Fingerprint::from_bytes(*self.inner.finalize().as_bytes())
    }
}

impl Default for DirectoryHasher {
    fn default() -> Self {
        Self::new()
    }
}
