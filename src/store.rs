//! Durable storage for completed photos.
//!
//! The receive loop hands each completed photo to a [`PhotoStore`] before
//! surfacing it, so the `PhotoReceived` event already carries the saved path.
//! Stores run on the blocking thread pool.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;
use crate::session::CompletedPhoto;

/// Most files sharing one timestamp before a save gives up.
const MAX_SUFFIX: u32 = 10_000;

/// Assigns a durable location to a completed photo.
pub trait PhotoStore: Send + Sync {
    /// Persist `photo` and return where it was written.
    fn save(&self, photo: &CompletedPhoto) -> Result<PathBuf>;
}

/// Writes photos into a directory as `<prefix>_<YYYYmmdd_HHMMSS>[_n].<ext>`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    directory: PathBuf,
    prefix: String,
}

impl DirectoryStore {
    /// Store photos under `directory`, created on first save if missing.
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    /// Target directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl PhotoStore for DirectoryStore {
    fn save(&self, photo: &CompletedPhoto) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory)?;

        let stem = format!("{}_{}", self.prefix, Local::now().format("%Y%m%d_%H%M%S"));
        let extension = sniff_extension(&photo.bytes);

        // Several captures within one second get a numeric suffix.
        for n in 0..MAX_SUFFIX {
            let name = match n {
                0 => format!("{stem}.{extension}"),
                n => format!("{stem}_{n}.{extension}"),
            };
            let path = self.directory.join(name);

            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    std::io::Write::write_all(&mut file, &photo.bytes)?;
                    tracing::info!("Saved {} bytes to {}", photo.len(), path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for {stem} in {}", self.directory.display()),
        )
        .into())
    }
}

/// File extension for an image, from its magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else {
        "bin"
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn jpeg() -> CompletedPhoto {
        CompletedPhoto {
            bytes: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0xFF, 0xD9]),
            uri: None,
            declared_size: Some(7),
            path: None,
        }
    }

    #[test]
    fn test_sniff_extension() {
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xD9]), "jpg");
        assert_eq!(sniff_extension(b"\x89PNG\r\n\x1a\n...."), "png");
        assert_eq!(sniff_extension(b"hello"), "bin");
        assert_eq!(sniff_extension(b""), "bin");
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("nested/photos"), "photo");

        let path = store.save(&jpeg()).unwrap();

        assert!(path.starts_with(store.directory()));
        assert_eq!(path.extension().unwrap(), "jpg");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("photo_"));
        assert_eq!(fs::read(&path).unwrap(), &jpeg().bytes[..]);
    }

    #[test]
    fn test_save_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path(), "cam");

        let paths: Vec<_> = (0..3).map(|_| store.save(&jpeg()).unwrap()).collect();

        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        assert_ne!(paths[0], paths[2]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }
}
