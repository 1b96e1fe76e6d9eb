// src/net/local_file.rs

//! `file://` transport
//!
//! Used for repositories on mounted media and in tests. Resumes by seeking
//! past the bytes already copied.

use super::{ByteStream, Closer, DownloadSession, Downloader, download_from_stream};
use crate::error::{Error, Result};
use crate::progress::ProgressListener;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

pub struct LocalFileDownloader {
    session: DownloadSession,
    closer: Closer,
    source_path: PathBuf,
}

impl LocalFileDownloader {
    pub fn new(url: &Url, output: &Path) -> Result<Self> {
        let source_path = url
            .to_file_path()
            .map_err(|_| Error::Configuration(format!("Not a local file URL: {url}")))?;
        Ok(Self::from_path(source_path, url.as_str(), output))
    }

    pub fn from_path(source_path: PathBuf, source: &str, output: &Path) -> Self {
        Self {
            session: DownloadSession::new(source, output),
            closer: Closer::new(),
            source_path,
        }
    }
}

impl Downloader for LocalFileDownloader {
    fn session(&self) -> &DownloadSession {
        &self.session
    }

    fn session_mut(&mut self) -> &mut DownloadSession {
        &mut self.session
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn open(&mut self, offset: u64) -> Result<ByteStream> {
        let context = self.source_path.display().to_string();
        let mut file = File::open(&self.source_path).map_err(|e| Error::from_io(&context, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::from_io(&context, e))?;
        }
        Ok(ByteStream::new(file, self.closer.clone()))
    }

    fn total_size(&mut self) -> Result<Option<u64>> {
        let context = self.source_path.display().to_string();
        let meta = fs::metadata(&self.source_path).map_err(|e| Error::from_io(&context, e))?;
        Ok(Some(meta.len()))
    }

    fn has_changed(&self) -> bool {
        true
    }

    fn download(&mut self, listener: &dyn ProgressListener) -> Result<()> {
        let total = self
            .total_size()?
            .ok_or_else(|| Error::NotFound(self.source_path.display().to_string()))?;
        let existing = fs::metadata(self.output_file()).map(|m| m.len()).unwrap_or(0);

        if existing == total && self.output_file().is_file() {
            debug!("Already have {}, not copying", self.output_file().display());
            self.session.set_total_bytes(Some(total));
            return Ok(());
        }
        let resumable = existing > 0 && existing < total;
        download_from_stream(self, resumable, listener)
    }
}
