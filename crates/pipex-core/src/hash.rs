use sha1::{Digest, Sha1};

/// Stable identity hash over a type tag and a sequence of string segments,
/// the Rust analogue of the original's `pipex_hash(type, *args)`: a SHA-1
/// digest of the tag and args joined by NUL bytes, hex-encoded.
///
/// Used as the cache key a bucket compares against to decide whether
/// upstream work can be skipped on rewrite, so it must be stable across
/// runs and across processes (ruling out pointer addresses or
/// `std::hash::Hash`, whose `DefaultHasher` is randomly seeded per run).
pub fn pipex_hash(tag: &str, segments: &[&str]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(tag.as_bytes());
    for segment in segments {
        hasher.update([0u8]);
        hasher.update(segment.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
