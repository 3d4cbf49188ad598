//! Size-tiered BLAKE3 file hashing
//!
//! Build-semantics hashing trades completeness for speed on large files by
//! sampling. The worst case of a sampling miss is an unnecessary rebuild,
//! never a wrong artifact, because `hash_file_complete` is the only variant
//! used for integrity and tamper checks.

use chrono::{DateTime, SecondsFormat, Utc};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Files at or below this size are read whole
const TIER_SMALL: u64 = 4 * 1024;
/// Files at or below this size are streamed in chunks
const TIER_MEDIUM: u64 = 1024 * 1024;
/// Files at or below this size are sampled with seeks; above, memory-mapped
const TIER_LARGE: u64 = 100 * 1024 * 1024;

/// Stream buffer for the chunked tier
const CHUNK_SIZE: usize = 4 * 1024;

/// Prefix/suffix window for the seek-sampled tier
const SAMPLE_EDGE: u64 = 256 * 1024;
/// Interior sample size for the seek-sampled tier
const SAMPLE_SIZE: u64 = 16 * 1024;
/// Interior sample count for the seek-sampled tier
const SAMPLE_COUNT: u64 = 8;

/// Prefix/suffix window for the memory-mapped tier
const MMAP_EDGE: u64 = 512 * 1024;
/// Interior sample size for the memory-mapped tier
const MMAP_SAMPLE_SIZE: u64 = 32 * 1024;
/// Interior sample count for the memory-mapped tier
const MMAP_SAMPLE_COUNT: u64 = 16;

/// Result of the two-tier (metadata first, content second) change check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoTierHash {
    /// Hash of path, size, and mtime
    pub metadata_hex: String,
    /// Content hash; empty when the content tier was skipped
    pub content_hex: String,
    /// Whether the content tier actually ran
    pub content_was_hashed: bool,
}

/// Hash a file with the size-tiered strategy
///
/// A missing or unreadable file returns the empty string, a sentinel the
/// caches treat as "changed" rather than an error.
pub fn hash_file(path: &Path) -> String {
    tiered_hash(path).unwrap_or_default()
}

fn tiered_hash(path: &Path) -> io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    let len = metadata.len();

    if len <= TIER_SMALL {
        let bytes = std::fs::read(path)?;
        return Ok(blake3::hash(&bytes).to_hex().to_string());
    }

    let mut file = File::open(path)?;
    if len <= TIER_MEDIUM {
        return hash_chunked(&mut file);
    }
    if len <= TIER_LARGE {
        return hash_sampled(&mut file, len);
    }
    hash_mapped(&file, len)
}

fn hash_chunked(file: &mut File) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Sampled hash: prefix, evenly spaced interior windows, suffix.
///
/// The file length is fed to the hasher first so that a pure length change
/// can never collide with the original.
fn hash_sampled(file: &mut File, len: u64) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&len.to_be_bytes());

    read_region(file, 0, SAMPLE_EDGE, &mut hasher)?;

    let interior_end = len - SAMPLE_EDGE;
    let stride = (interior_end - SAMPLE_EDGE) / (SAMPLE_COUNT + 1);
    for i in 1..=SAMPLE_COUNT {
        let offset = SAMPLE_EDGE + stride * i;
        let window = SAMPLE_SIZE.min(interior_end.saturating_sub(offset));
        read_region(file, offset, window, &mut hasher)?;
    }

    read_region(file, len - SAMPLE_EDGE, SAMPLE_EDGE, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Memory-mapped sampled hash for very large files.
fn hash_mapped(file: &File, len: u64) -> io::Result<String> {
    // Safety: the mapping is read-only and dropped before this function
    // returns; a concurrent writer can at worst change what we hash, which
    // is the same TOCTOU exposure as every other tier.
    let map = unsafe { Mmap::map(file)? };
    let mut hasher = blake3::Hasher::new();
    hasher.update(&len.to_be_bytes());

    hasher.update(&map[..MMAP_EDGE as usize]);

    let interior_end = len - MMAP_EDGE;
    let stride = (interior_end - MMAP_EDGE) / (MMAP_SAMPLE_COUNT + 1);
    for i in 1..=MMAP_SAMPLE_COUNT {
        let offset = MMAP_EDGE + stride * i;
        let end = (offset + MMAP_SAMPLE_SIZE).min(interior_end);
        hasher.update(&map[offset as usize..end as usize]);
    }

    hasher.update(&map[(len - MMAP_EDGE) as usize..]);
    Ok(hasher.finalize().to_hex().to_string())
}

fn read_region(file: &mut File, offset: u64, len: u64, hasher: &mut blake3::Hasher) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut remaining = len as usize;
    let mut buf = [0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE);
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read;
    }
    Ok(())
}

/// Hash every byte of a file
///
/// The only variant permitted for integrity and tamper checks. Returns the
/// empty sentinel for a missing file, like the tiered variant.
pub fn hash_file_complete(path: &Path) -> String {
    let result = (|| -> io::Result<String> {
        let mut file = File::open(path)?;
        hash_chunked(&mut file)
    })();
    result.unwrap_or_default()
}

/// Hash one string
pub fn hash_string(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

/// Hash a sequence of strings, order-sensitive
///
/// Each element is length-prefixed into the hasher so that ["ab", "c"] and
/// ["a", "bc"] cannot collide.
pub fn hash_strings<S: AsRef<str>>(items: &[S]) -> String {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        let bytes = item.as_ref().as_bytes();
        hasher.update(&(bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_hex().to_string()
}

/// Hash a file's identity and filesystem metadata: path, size, mtime
///
/// Returns the empty sentinel when the file is missing, so a deleted source
/// always reads as changed.
pub fn hash_metadata(path: &Path) -> String {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    let mtime: DateTime<Utc> = match metadata.modified() {
        Ok(t) => t.into(),
        Err(_) => return String::new(),
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(&metadata.len().to_be_bytes());
    hasher.update(mtime.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Two-tier change check: metadata first, content only on metadata change
///
/// When the freshly computed metadata hash equals `old_metadata_hex`, the
/// content tier is skipped and `content_was_hashed` is false. A missing
/// file always reports `content_was_hashed = true` with sentinel hashes.
pub fn hash_file_two_tier(path: &Path, old_metadata_hex: &str) -> TwoTierHash {
    if !path.exists() {
        return TwoTierHash {
            metadata_hex: String::new(),
            content_hex: String::new(),
            content_was_hashed: true,
        };
    }

    let metadata_hex = hash_metadata(path);
    if !metadata_hex.is_empty() && metadata_hex == old_metadata_hex {
        return TwoTierHash {
            metadata_hex,
            content_hex: String::new(),
            content_was_hashed: false,
        };
    }

    let content_hex = hash_file(path);
    TwoTierHash {
        metadata_hex,
        content_hex,
        content_was_hashed: true,
    }
}

/// Compare two hex digests, wide-word at a time for digests >= 32 chars
///
/// The compiler vectorizes the 16-byte chunk compares; short strings fall
/// back to a plain byte compare.
pub fn digest_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    if a.len() < 32 {
        return a == b;
    }

    let mut i = 0;
    while i + 16 <= a.len() {
        let x = u128::from_ne_bytes(a[i..i + 16].try_into().unwrap());
        let y = u128::from_ne_bytes(b[i..i + 16].try_into().unwrap());
        if x != y {
            return false;
        }
        i += 16;
    }
    a[i..] == b[i..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        file.sync_all().unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_sentinel() {
        assert_eq!(hash_file(Path::new("/no/such/file")), "");
        assert_eq!(hash_file_complete(Path::new("/no/such/file")), "");
        assert_eq!(hash_metadata(Path::new("/no/such/file")), "");
    }

    #[test]
    fn test_small_tier_matches_whole_hash() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "small.txt", b"hello forge");
        let expected = blake3::hash(b"hello forge").to_hex().to_string();
        assert_eq!(hash_file(&path), expected);
        assert_eq!(hash_file_complete(&path), expected);
    }

    #[test]
    fn test_chunked_tier_matches_whole_hash() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let path = write_file(&dir, "medium.bin", &contents);
        let expected = blake3::hash(&contents).to_hex().to_string();
        assert_eq!(hash_file(&path), expected);
    }

    #[test]
    fn test_sampled_tier_detects_prefix_change() {
        let dir = TempDir::new().unwrap();
        let mut contents: Vec<u8> = vec![7u8; 2 * 1024 * 1024];
        let path = write_file(&dir, "large.bin", &contents);
        let before = hash_file(&path);
        assert_eq!(before.len(), 64);

        contents[100] ^= 0xff;
        let path = write_file(&dir, "large.bin", &contents);
        let after = hash_file(&path);
        assert_ne!(before, after);
    }

    #[test]
    fn test_sampled_tier_detects_length_change() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = vec![7u8; 2 * 1024 * 1024];
        let path = write_file(&dir, "grow.bin", &contents);
        let before = hash_file(&path);

        let longer: Vec<u8> = vec![7u8; 2 * 1024 * 1024 + 1];
        let path = write_file(&dir, "grow.bin", &longer);
        assert_ne!(before, hash_file(&path));
    }

    #[test]
    fn test_two_tier_skips_content_on_metadata_match() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "src.c", b"int main() { return 0; }");

        let first = hash_file_two_tier(&path, "");
        assert!(first.content_was_hashed);
        assert!(!first.content_hex.is_empty());

        let second = hash_file_two_tier(&path, &first.metadata_hex);
        assert!(!second.content_was_hashed);
        assert_eq!(second.metadata_hex, first.metadata_hex);
        assert!(second.content_hex.is_empty());
    }

    #[test]
    fn test_two_tier_missing_file_reports_hashed() {
        let result = hash_file_two_tier(Path::new("/no/such/file"), "");
        assert!(result.content_was_hashed);
        assert_eq!(result.metadata_hex, "");
    }

    #[test]
    fn test_hash_strings_is_unambiguous() {
        assert_ne!(hash_strings(&["ab", "c"]), hash_strings(&["a", "bc"]));
        assert_ne!(hash_strings(&["a", "b"]), hash_strings(&["b", "a"]));
        assert_eq!(hash_strings(&["a", "b"]), hash_strings(&["a", "b"]));
    }

    #[test]
    fn test_digest_eq() {
        let a = blake3::hash(b"x").to_hex().to_string();
        let b = blake3::hash(b"y").to_hex().to_string();
        assert!(digest_eq(&a, &a));
        assert!(!digest_eq(&a, &b));
        assert!(!digest_eq(&a, &a[..32]));
        assert!(digest_eq("short", "short"));
        assert!(!digest_eq("short", "shor_"));
    }
}
