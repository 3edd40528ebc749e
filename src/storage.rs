use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Write `value` as a postcard blob, creating parent directories.
pub fn write_blob<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let data = postcard::to_allocvec(value)?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    postcard::from_bytes(&data).with_context(|| format!("decoding {}", path.display()))
}

/// Where uploaded videos are written before they are verified.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    keep: bool,
}

impl UploadStore {
    /// Creates `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>, keep: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir, keep })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh path for an upload. Client file names are reduced to a safe basename and
    /// prefixed with a UUID, so concurrent uploads of `clip.mp4` never collide.
    pub fn reserve(&self, client_name: Option<&str>) -> PathBuf {
        let base = client_name.map(sanitize).unwrap_or_default();
        let id = uuid::Uuid::new_v4();
        let name = if base.is_empty() {
            format!("{}.video", id)
        } else {
            format!("{}-{}", id, base)
        };
        self.dir.join(name)
    }

    /// Apply the retention policy to a processed upload.
    pub fn finish(&self, path: &Path) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("could not remove upload {}: {}", path.display(), e);
        }
    }
}

fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/labels.bin");
        let labels = vec!["alice.jpg".to_string(), "bob.jpg".to_string()];
        write_blob(&path, &labels).unwrap();
        let back: Vec<String> = read_blob(&path).unwrap();
        assert_eq!(back, labels);
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.bin");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        assert!(read_blob::<Vec<String>>(&path).is_err());
    }

    #[test]
    fn client_names_cannot_escape_the_upload_dir() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\videos\\my clip.mp4"), "myclip.mp4");
        assert_eq!(sanitize("..."), "");

        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path().join("videos"), true).unwrap();
        let a = store.reserve(Some("../clip.mp4"));
        let b = store.reserve(Some("clip.mp4"));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(store.dir()));
        assert!(a.to_string_lossy().ends_with("-clip.mp4"));
        assert!(store.reserve(None).to_string_lossy().ends_with(".video"));
    }

    #[test]
    fn finish_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let keep = UploadStore::open(dir.path(), true).unwrap();
        let discard = UploadStore::open(dir.path(), false).unwrap();

        let kept = keep.reserve(Some("a.mp4"));
        std::fs::write(&kept, b"x").unwrap();
        keep.finish(&kept);
        assert!(kept.exists());

        let dropped = discard.reserve(Some("b.mp4"));
        std::fs::write(&dropped, b"x").unwrap();
        discard.finish(&dropped);
        assert!(!dropped.exists());
    }
}
