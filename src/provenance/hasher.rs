//! LD-014: BLAKE3 fingerprints for export files and action ids.

use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Fingerprint a file's contents without loading it whole. Returns `"blake3:{hex}"`.
pub fn fingerprint_file(path: &Path) -> Result<String, String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Fingerprint an in-memory byte slice. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash an ordered list of components. Each component is NUL-terminated so
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
