// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SHA-256 helpers. Everything here is blocking and meant for
//! `spawn_blocking`.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use sha2::{Digest, Sha256};

const READ_BUF: usize = 256 * 1024;

/// Lower-case hex of a finished digest.
#[must_use]
pub fn to_hex(hasher: Sha256) -> String { format!("{:x}", hasher.finalize()) }

/// Stable identity used to find an interrupted attempt of the same payload
/// going to (or coming from) the same peer.
///
/// Fields are length-prefixed so that no two field tuples hash alike.
#[must_use]
pub fn resume_key(filename: &str, total_size: u64, content_hash: &str, peer: &str) -> String {
    let mut hasher = Sha256::new();
    let size = total_size.to_string();
    for field in [filename, size.as_str(), content_hash, peer] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    to_hex(hasher)
}

/// Digest and length of a whole file.
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let (hasher, len) = feed(&mut file, u64::MAX)?;
    Ok((to_hex(hasher), len))
}

/// Digest state after the first `len` bytes of `path`.
///
/// Fails with `UnexpectedEof` if the file is shorter than `len`.
pub fn hash_prefix(path: &Path, len: u64) -> io::Result<Sha256> {
    let mut file = File::open(path)?;
    let (hasher, read) = feed(&mut file, len)?;
    if read < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {read}"),
        ));
    }
    Ok(hasher)
}

fn feed(reader: &mut impl Read, limit: u64) -> io::Result<(Sha256, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut total = 0u64;
    while total < limit {
        let want = usize::try_from(limit - total).map_or(buf.len(), |left| left.min(buf.len()));
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher, total))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn resume_key_is_deterministic_and_field_sensitive() {
        let a = resume_key("a.bin", 10, "h", "10.0.0.2:8765");
        assert_eq!(a, resume_key("a.bin", 10, "h", "10.0.0.2:8765"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, resume_key("a.bin", 10, "h", "10.0.0.3:8765"));
        assert_ne!(a, resume_key("a.bin", 11, "h", "10.0.0.2:8765"));
        // Shifting bytes between fields must not collide.
        assert_ne!(resume_key("ab", 1, "c", "d"), resume_key("a", 1, "bc", "d"));
    }

    #[test]
    fn prefix_digest_matches_full_digest_of_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let payload: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&payload).unwrap();

        let (full, len) = hash_file(&path).unwrap();
        assert_eq!(len, payload.len() as u64);
        assert_eq!(full, format!("{:x}", Sha256::digest(&payload)));

        let prefix = hash_prefix(&path, 300_000).unwrap();
        assert_eq!(to_hex(prefix), format!("{:x}", Sha256::digest(&payload[..300_000])));

        assert_eq!(
            hash_prefix(&path, 800_000).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert_eq!(to_hex(hash_prefix(&path, 0).unwrap()), EMPTY_SHA256);
    }
}
