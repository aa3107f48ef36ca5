//! Streaming image decompression
//!
//! Images are decoded on the fly while they are written; an uncompressed copy
//! is never materialized. Raw and zip images know their uncompressed length
//! up front. Gzip and xz images are measured with a decode pass into a sink
//! before the device is opened, and the writer reports their progress
//! against the *compressed* bytes the decoder has consumed.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::core::image::{is_image_name, last_segment, Compression};
use crate::error::{PipelineError, ResolutionError};

/// Shared count of source bytes read so far
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Reader wrapper that counts bytes pulled through it
struct CountingReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// An image on local storage, ready to be streamed
#[derive(Debug, Clone)]
pub struct ImageFile {
    path: PathBuf,
    compression: Compression,
    compressed_len: u64,
    uncompressed_len: Option<u64>,
    zip_entry: Option<usize>,
}

impl ImageFile {
    /// Inspect an image; zip archives have their entry chosen here
    pub fn open(path: &Path, compression: Compression) -> Result<Self, PipelineError> {
        let compressed_len = std::fs::metadata(path)
            .map_err(|e| unreadable(path, &e))?
            .len();

        let (uncompressed_len, zip_entry) = match compression {
            Compression::Raw => (Some(compressed_len), None),
            Compression::Zip => {
                let (index, size) = select_zip_entry(path)?;
                (Some(size), Some(index))
            }
            Compression::Gz | Compression::Xz => (None, None),
        };

        debug!(
            "Image {} ({}, {} bytes, uncompressed {:?})",
            path.display(),
            compression,
            compressed_len,
            uncompressed_len
        );

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            compressed_len,
            uncompressed_len,
            zip_entry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn compressed_len(&self) -> u64 {
        self.compressed_len
    }

    /// Uncompressed length, when the format records it
    pub fn uncompressed_len(&self) -> Option<u64> {
        self.uncompressed_len
    }

    /// Bytes the device must hold
    ///
    /// Stream formats are decoded once into a sink to learn their length. A
    /// larger `declared` size wins over the measured one.
    pub fn required_len(&self, declared: Option<u64>) -> Result<u64, PipelineError> {
        let decoded = match self.uncompressed_len {
            Some(len) => len,
            None => self.measure()?,
        };
        if let Some(declared) = declared.filter(|d| *d != decoded) {
            warn!(
                "Declared size {} of {} differs from its decoded size {}",
                declared,
                self.path.display(),
                decoded
            );
        }
        Ok(decoded.max(declared.unwrap_or(0)))
    }

    /// Decode the whole image without storing it, returning its length
    fn measure(&self) -> Result<u64, PipelineError> {
        let len = self.stream(|reader, _| {
            io::copy(reader, &mut io::sink()).map_err(|e| unreadable(&self.path, &e))
        })?;
        debug!("Measured {} at {} decoded bytes", self.path.display(), len);
        Ok(len)
    }

    /// Local percent for `written` output bytes and `consumed` input bytes
    pub fn percent(&self, written: u64, consumed: u64) -> Option<f64> {
        let (done, total) = match self.uncompressed_len {
            Some(total) => (written, total),
            None => (consumed, self.compressed_len),
        };
        if total == 0 {
            return None;
        }
        Some((done as f64 / total as f64 * 100.0).min(100.0))
    }

    /// Run `f` over the decoded byte stream
    ///
    /// The counter passed to `f` tracks compressed bytes consumed.
    pub fn stream<T>(
        &self,
        f: impl FnOnce(&mut dyn Read, &ByteCounter) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        self.stream_counted(ByteCounter::default(), f)
    }

    /// Like [`ImageFile::stream`], counting into a caller-held counter
    pub fn stream_counted<T>(
        &self,
        counter: ByteCounter,
        f: impl FnOnce(&mut dyn Read, &ByteCounter) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let file = File::open(&self.path).map_err(|e| unreadable(&self.path, &e))?;

        match (self.compression, self.zip_entry) {
            (Compression::Zip, Some(index)) => {
                let mut archive = ZipArchive::new(BufReader::new(file))
                    .map_err(|e| unreadable(&self.path, &e))?;
                let entry = archive
                    .by_index(index)
                    .map_err(|e| unreadable(&self.path, &e))?;
                let mut reader = CountingReader {
                    inner: entry,
                    counter: counter.clone(),
                };
                f(&mut reader, &counter)
            }
            (Compression::Gz, _) => {
                let source = CountingReader {
                    inner: BufReader::new(file),
                    counter: counter.clone(),
                };
                f(&mut GzDecoder::new(source), &counter)
            }
            (Compression::Xz, _) => {
                let source = CountingReader {
                    inner: BufReader::new(file),
                    counter: counter.clone(),
                };
                f(&mut XzDecoder::new(source), &counter)
            }
            _ => {
                let mut reader = CountingReader {
                    inner: file,
                    counter: counter.clone(),
                };
                f(&mut reader, &counter)
            }
        }
    }
}

/// Pick the zip entry to write: the first image-named file, else the largest
fn select_zip_entry(path: &Path) -> Result<(usize, u64), PipelineError> {
    let file = File::open(path).map_err(|e| unreadable(path, &e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| unreadable(path, &e))?;

    let mut largest: Option<(usize, u64)> = None;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| unreadable(path, &e))?;
        if entry.is_dir() {
            continue;
        }
        if is_image_name(last_segment(entry.name())) {
            return Ok((index, entry.size()));
        }
        if largest.map_or(true, |(_, size)| entry.size() > size) {
            largest = Some((index, entry.size()));
        }
    }

    largest.ok_or_else(|| {
        ResolutionError::UnreadableImage {
            path: path.to_path_buf(),
            error: "archive contains no files".to_string(),
        }
        .into()
    })
}

fn unreadable(path: &Path, err: &dyn std::fmt::Display) -> PipelineError {
    ResolutionError::UnreadableImage {
        path: path.to_path_buf(),
        error: err.to_string(),
    }
    .into()
}
