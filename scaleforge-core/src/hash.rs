use std::{fs::File, io::Read, path::Path};

use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 8192;

/// SHA-256 of a file's contents, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Dedup key for one unit of work: SHA-256 over the canonical JSON blob
/// `{"params": {...}, "sha256": <content hash>}`. Keys are sorted (serde_json
/// maps are ordered), so identical content plus identical parameters always
/// produce the same key no matter how the params were assembled.
pub fn fingerprint(path: &Path, params: &serde_json::Value) -> anyhow::Result<String> {
    let content = sha256_file(path)?;
    let blob = serde_json::json!({
        "params": params,
        "sha256": content,
    });
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&blob)?);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents).expect("write temp file");
        file
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let file = temp_file(b"abc");
        let digest = sha256_file(file.path()).expect("hash file");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_ignores_param_insertion_order() {
        let file = temp_file(b"pixels");
        let a = serde_json::json!({"model": "x4plus", "scale": 2});
        let b = serde_json::json!({"scale": 2, "model": "x4plus"});
        assert_eq!(
            fingerprint(file.path(), &a).expect("fingerprint"),
            fingerprint(file.path(), &b).expect("fingerprint"),
        );
    }

    #[test]
    fn fingerprint_changes_with_content_and_params() {
        let file = temp_file(b"pixels");
        let other = temp_file(b"different pixels");
        let params = serde_json::json!({"model": "x4plus", "scale": 2});

        let base = fingerprint(file.path(), &params).expect("fingerprint");
        assert_ne!(base, fingerprint(other.path(), &params).expect("fingerprint"));

        let scaled = serde_json::json!({"model": "x4plus", "scale": 4});
        assert_ne!(base, fingerprint(file.path(), &scaled).expect("fingerprint"));
    }
}
