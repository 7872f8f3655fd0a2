//! Volume layout: where every artifact of a manual lives on disk.
//!
//! All names derive from the content hash key and the step number, so the
//! layout alone answers "was this already produced?". Writes go through a
//! temp file and a rename; a crashed run never leaves a half-written model
//! that a later run would mistake for a finished one.

use crate::error::GuideError;
use crate::hash::ContentHash;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// File naming scheme rooted at the volume directory.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    root: PathBuf,
}

impl VolumeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the volume directory if needed.
    pub async fn ensure(&self) -> Result<(), GuideError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| GuideError::io(&self.root, e))
    }

    /// Absolute path of a file name inside the volume.
    pub fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path(filename).is_file()
    }

    pub fn image_filename(hash: &ContentHash, index: usize, ext: &str) -> String {
        format!("{}-img-{:03}.{}", hash.key(), index, ext)
    }

    pub fn manual_text_filename(hash: &ContentHash) -> String {
        format!("{}-manual.txt", hash.key())
    }

    pub fn instruction_filename(hash: &ContentHash, step: u32) -> String {
        format!("{}-{}.txt", hash.key(), step)
    }

    pub fn model_filename(hash: &ContentHash, step: u32) -> String {
        format!("{}-{}.glb", hash.key(), step)
    }

    pub fn voice_filename(hash: &ContentHash, step: u32) -> String {
        format!("{}-{}.mp3", hash.key(), step)
    }

    /// Write `bytes` to `filename` inside the volume atomically.
    pub async fn write(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, GuideError> {
        let path = self.path(filename);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }
}

/// Write to `path.tmp`, flush, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GuideError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GuideError::io(parent, e))?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| GuideError::io(&tmp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| GuideError::io(&tmp_path, e))?;
    file.flush().await.map_err(|e| GuideError::io(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| GuideError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed_by_hash_key() {
        let h = ContentHash::of_bytes(b"abc");
        assert_eq!(
            VolumeLayout::image_filename(&h, 7, "png"),
            "ba7816bf8f01cfea-img-007.png"
        );
        assert_eq!(
            VolumeLayout::manual_text_filename(&h),
            "ba7816bf8f01cfea-manual.txt"
        );
        assert_eq!(VolumeLayout::instruction_filename(&h, 3), "ba7816bf8f01cfea-3.txt");
        assert_eq!(VolumeLayout::model_filename(&h, 3), "ba7816bf8f01cfea-3.glb");
        assert_eq!(VolumeLayout::voice_filename(&h, 12), "ba7816bf8f01cfea-12.mp3");
    }

    #[tokio::test]
    async fn write_is_visible_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path().join("volume"));
        layout.ensure().await.unwrap();

        let path = layout.write("a-1.txt", b"Title\n\nBody").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Title\n\nBody");
        assert!(layout.exists("a-1.txt"));
        assert!(!layout.exists("a-1.txt.tmp"));
    }

    #[tokio::test]
    async fn write_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = VolumeLayout::new(dir.path());
        layout.write("x.mp3", b"old").await.unwrap();
        layout.write("x.mp3", b"new").await.unwrap();
        assert_eq!(std::fs::read(layout.path("x.mp3")).unwrap(), b"new");
    }
}
