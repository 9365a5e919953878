//! Content digest algorithms.
//!
//! The registry maps manifest names to digest computations. `sha256` is the
//! default; `blake3` is a faster alternative; `xor4` is an intentionally
//! weak 4-byte digest kept for exercising the hash-collision paths (content
//! verification must never trust digest equality, and `xor4` makes
//! collisions trivial to construct).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const DEFAULT_HASH_ALGORITHM: &str = "sha256";

pub struct HashAlgorithm {
    pub name: &'static str,
    pub digest_len: usize,
    compute: fn(&Path) -> io::Result<Vec<u8>>,
}

impl HashAlgorithm {
    pub fn compute(&self, path: &Path) -> io::Result<Vec<u8>> {
        (self.compute)(path)
    }
}

impl std::fmt::Debug for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashAlgorithm")
            .field("name", &self.name)
            .field("digest_len", &self.digest_len)
            .finish()
    }
}

static ALGORITHMS: [HashAlgorithm; 3] = [
    HashAlgorithm {
        name: "sha256",
        digest_len: 32,
        compute: compute_sha256,
    },
    HashAlgorithm {
        name: "blake3",
        digest_len: 32,
        compute: compute_blake3,
    },
    HashAlgorithm {
        name: "xor4",
        digest_len: 4,
        compute: compute_xor4,
    },
];

pub fn lookup(name: &str) -> Option<&'static HashAlgorithm> {
    ALGORITHMS.iter().find(|algorithm| algorithm.name == name)
}

fn compute_sha256(path: &Path) -> io::Result<Vec<u8>> {
    use sha2::{Digest, Sha256};
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

fn compute_blake3(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().as_bytes().to_vec())
}

/// XOR of consecutive 4-byte words, zero-padded tail.
fn compute_xor4(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut acc = [0u8; 4];
    let mut offset = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        for &byte in &buf[..read] {
            acc[offset % 4] ^= byte;
            offset += 1;
        }
    }
    Ok(acc.to_vec())
}
