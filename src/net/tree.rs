// src/net/tree.rs

//! `tree://<volume>/<path>` transport for USB sticks and other document trees
//!
//! The URL names a volume rather than a mount point, so the same repository
//! address keeps working wherever the medium is mounted. A [`DocumentTree`]
//! turns volume plus path into a readable document.

use super::{ByteStream, Closer, DownloadSession, Downloader, download_from_stream};
use crate::error::{Error, Result};
use crate::progress::ProgressListener;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::Url;

pub const SCHEME: &str = "tree";

/// Resolves documents inside named volumes
pub trait DocumentTree: Send + Sync {
    fn open(&self, volume: &str, path: &str) -> Result<Box<dyn Read + Send>>;

    fn size(&self, volume: &str, path: &str) -> Result<Option<u64>>;
}

/// Volumes backed by directories on the local filesystem
#[derive(Debug, Default)]
pub struct MountedTrees {
    mounts: RwLock<HashMap<String, PathBuf>>,
}

impl MountedTrees {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&self, volume: &str, root: impl Into<PathBuf>) {
        self.mounts.write().insert(volume.to_string(), root.into());
    }

    pub fn unmount(&self, volume: &str) {
        self.mounts.write().remove(volume);
    }

    fn resolve(&self, volume: &str, path: &str) -> Result<PathBuf> {
        let root = self
            .mounts
            .read()
            .get(volume)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Volume {volume} is not mounted")))?;

        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::NotFound(format!("{volume}/{path}")));
        }
        Ok(root.join(relative))
    }
}

impl DocumentTree for MountedTrees {
    fn open(&self, volume: &str, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(volume, path)?;
        let file = File::open(&full).map_err(|e| Error::from_io(&full.display().to_string(), e))?;
        Ok(Box::new(file))
    }

    fn size(&self, volume: &str, path: &str) -> Result<Option<u64>> {
        let full = self.resolve(volume, path)?;
        Ok(fs::metadata(&full).ok().map(|m| m.len()))
    }
}

pub struct TreeDownloader {
    session: DownloadSession,
    closer: Closer,
    tree: Arc<dyn DocumentTree>,
    volume: String,
    path: String,
}

impl TreeDownloader {
    pub fn new(url: &Url, output: &Path, tree: Arc<dyn DocumentTree>) -> Result<Self> {
        let volume = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Configuration(format!("No volume in {url}")))?
            .to_string();
        let path = percent_decode(url.path());

        Ok(Self {
            session: DownloadSession::new(url.as_str(), output),
            closer: Closer::new(),
            tree,
            volume,
            path,
        })
    }
}

pub(crate) fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(hex) = path.get(i + 1..i + 3)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            decoded.push(byte);
            i += 3;
            continue;
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

impl Downloader for TreeDownloader {
    fn session(&self) -> &DownloadSession {
        &self.session
    }

    fn session_mut(&mut self) -> &mut DownloadSession {
        &mut self.session
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn open(&mut self, _offset: u64) -> Result<ByteStream> {
        let reader = self.tree.open(&self.volume, &self.path)?;
        Ok(ByteStream::new(reader, self.closer.clone()))
    }

    fn total_size(&mut self) -> Result<Option<u64>> {
        self.tree.size(&self.volume, &self.path)
    }

    fn has_changed(&self) -> bool {
        true
    }

    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        download_from_stream(self, false, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    #[test]
    fn test_download_from_mounted_volume() {
        let usb = tempfile::tempdir().unwrap();
        fs::create_dir_all(usb.path().join("fdroid/repo")).unwrap();
        fs::write(usb.path().join("fdroid/repo/my app.apk"), b"apk").unwrap();

        let trees = Arc::new(MountedTrees::new());
        trees.mount("USB-1234", usb.path());

        let out = tempfile::tempdir().unwrap();
        let url = Url::parse("tree://USB-1234/fdroid/repo/my%20app.apk").unwrap();
        let mut downloader = TreeDownloader::new(&url, &out.path().join("a.apk"), trees).unwrap();
        downloader.download(&SilentProgress).unwrap();

        assert_eq!(fs::read(out.path().join("a.apk")).unwrap(), b"apk");
    }

    #[test]
    fn test_unmounted_and_escaping_paths_are_not_found() {
        let trees = MountedTrees::new();
        assert_eq!(
            trees.size("nope", "x").unwrap_err().kind(),
            crate::ErrorKind::NotFound
        );

        let usb = tempfile::tempdir().unwrap();
        trees.mount("usb", usb.path());
        assert!(trees.open("usb", "../etc/passwd").is_err());
    }
}
