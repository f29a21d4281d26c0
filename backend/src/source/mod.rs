//! Input acquisition.
//!
//! An [`XmlSource`] names where a document comes from: a local file, an
//! in-memory upload, or an HTTP URL fetched either in full or as a stream.
//! Opening it yields an [`OpenedSource`], a blocking [`Read`] that can be
//! replayed from the start for multi-pass header policies.
//!
//! Streamed HTTP bodies are forwarded chunk by chunk over a bounded channel
//! and read on a blocking thread by [`ChannelReader`]. Every byte pulled is
//! spilled to an anonymous temp file so a second pass never refetches.

use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{FetchError, FetchResult};

/// Chunks buffered between the HTTP task and the parser thread.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Retries for transient read errors.
pub const MAX_IO_RETRIES: u32 = 3;

/// Delay between retries of a `WouldBlock` read.
const RETRY_DELAY_MS: u64 = 50;

/// How a URL body is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Download the whole body, then parse.
    #[default]
    Full,
    /// Parse while the body is still arriving.
    Streaming,
}

/// Where the XML document comes from.
#[derive(Debug, Clone)]
pub enum XmlSource {
    File(PathBuf),
    Bytes(Bytes),
    Url { url: String, mode: FetchMode },
}

impl XmlSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    pub fn url(url: impl Into<String>, mode: FetchMode) -> Self {
        Self::Url { url: url.into(), mode }
    }

    /// Acquire the byte stream.
    ///
    /// Must be called inside a Tokio runtime. Reading the returned source
    /// blocks, so hand it to a blocking thread.
    pub async fn open(self) -> FetchResult<OpenedSource> {
        match self {
            Self::File(path) => {
                let file = File::open(&path).map_err(|source| FetchError::Open {
                    path: path.clone(),
                    source,
                })?;
                log::info!("Reading {}", path.display());
                Ok(OpenedSource::File(file))
            }
            Self::Bytes(data) => {
                log::info!("Reading {} uploaded bytes", data.len());
                Ok(OpenedSource::Memory(Cursor::new(data)))
            }
            Self::Url { url, mode } => open_url(url, mode).await,
        }
    }
}

impl fmt::Display for XmlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Bytes(data) => write!(f, "upload ({} bytes)", data.len()),
            Self::Url { url, mode: FetchMode::Full } => write!(f, "{}", url),
            Self::Url { url, mode: FetchMode::Streaming } => write!(f, "{} (streaming)", url),
        }
    }
}

async fn open_url(url: String, mode: FetchMode) -> FetchResult<OpenedSource> {
    log::info!("Fetching {}", url);
    let response = reqwest::get(&url).await.map_err(|source| FetchError::Request {
        url: url.clone(),
        source,
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url,
            status: status.as_u16(),
        });
    }

    match mode {
        FetchMode::Full => {
            let body = response
                .bytes()
                .await
                .map_err(|source| FetchError::Request { url: url.clone(), source })?;
            log::info!("Downloaded {} bytes from {}", body.len(), url);
            Ok(OpenedSource::Memory(Cursor::new(body)))
        }
        FetchMode::Streaming => {
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let mut body = response.bytes_stream();
            tokio::spawn(async move {
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(io::Error::other);
                    let failed = chunk.is_err();
                    // Receiver gone means the run stopped.
                    if tx.send(chunk).await.is_err() || failed {
                        break;
                    }
                }
            });
            let reader = ReplayableReader::new(RetryingReader::new(ChannelReader::new(rx)))?;
            Ok(OpenedSource::Stream(reader))
        }
    }
}

// =============================================================================
// Replay
// =============================================================================

/// A reader that can restart from its first byte.
pub trait Replay: Read {
    fn replay(&mut self) -> io::Result<()>;
}

impl Replay for File {
    fn replay(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }
}

impl<T: AsRef<[u8]>> Replay for Cursor<T> {
    fn replay(&mut self) -> io::Result<()> {
        self.set_position(0);
        Ok(())
    }
}

impl<T: Replay + ?Sized> Replay for &mut T {
    fn replay(&mut self) -> io::Result<()> {
        (**self).replay()
    }
}

/// An opened input.
pub enum OpenedSource {
    File(File),
    Memory(Cursor<Bytes>),
    Stream(ReplayableReader<RetryingReader<ChannelReader>>),
}

impl Read for OpenedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(r) => r.read(buf),
            Self::Memory(r) => r.read(buf),
            Self::Stream(r) => r.read(buf),
        }
    }
}

impl Replay for OpenedSource {
    fn replay(&mut self) -> io::Result<()> {
        match self {
            Self::File(r) => r.replay(),
            Self::Memory(r) => r.replay(),
            Self::Stream(r) => r.replay(),
        }
    }
}

// =============================================================================
// Readers
// =============================================================================

/// Blocking reader over a channel of byte chunks.
///
/// An `Err` item is returned once as a read error; a closed channel is EOF.
/// Must not be read from an async context.
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// Retries reads that fail with `Interrupted` or `WouldBlock`.
pub struct RetryingReader<R> {
    inner: R,
    max_retries: u32,
}

impl<R: Read> RetryingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_retries: MAX_IO_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl<R: Read> Read for RetryingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut attempt = 0;
        loop {
            match self.inner.read(buf) {
                Err(e)
                    if attempt < self.max_retries
                        && matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) =>
                {
                    attempt += 1;
                    log::warn!("Read attempt {}/{} failed: {}", attempt, self.max_retries, e);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                    }
                }
                other => return other,
            }
        }
    }
}

/// Forward-only reader made replayable by spilling to a temp file.
pub struct ReplayableReader<R> {
    inner: R,
    spill: File,
    spilled: u64,
    replaying: bool,
}

impl<R: Read> ReplayableReader<R> {
    pub fn new(inner: R) -> io::Result<Self> {
        Ok(Self {
            inner,
            spill: tempfile::tempfile()?,
            spilled: 0,
            replaying: false,
        })
    }

    /// Bytes captured from the inner reader so far.
    pub fn spilled(&self) -> u64 {
        self.spilled
    }
}

impl<R: Read> Read for ReplayableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.replaying {
            return self.spill.read(buf);
        }
        let n = self.inner.read(buf)?;
        self.spill.write_all(&buf[..n])?;
        self.spilled += n as u64;
        Ok(n)
    }
}

impl<R: Read> Replay for ReplayableReader<R> {
    /// Drain whatever the inner reader still holds, then restart from the
    /// spill file.
    fn replay(&mut self) -> io::Result<()> {
        if !self.replaying {
            self.spilled += io::copy(&mut self.inner, &mut self.spill)?;
            self.spill.flush()?;
            self.replaying = true;
            log::debug!("Replaying {} spilled bytes", self.spilled);
        }
        self.spill.seek(SeekFrom::Start(0)).map(|_| ())
    }
}
