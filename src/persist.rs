//! Atomic JSON persistence helpers shared by the ledger and the mirror.
//!
//! Writes go to `<path>.tmp` and are renamed into place so a crash mid-write
//! never leaves a torn file. Readers ignore unknown fields, which keeps the
//! on-disk format forward-compatible.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn test_round_trip_and_no_tmp_left_behind() {
        let path = std::env::temp_dir().join(format!("persist-test-{}.json", std::process::id()));
        write_atomic(&path, &Doc { n: 7 }).unwrap();
        let doc: Doc = read_json(&path).unwrap();
        assert_eq!(doc.n, 7);
        assert!(!path.with_extension("tmp").exists());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let path = std::env::temp_dir().join(format!("persist-fwd-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"n": 3, "added_in_future": true}"#).unwrap();
        let doc: Doc = read_json(&path).unwrap();
        assert_eq!(doc.n, 3);
        let _ = std::fs::remove_file(path);
    }
}
