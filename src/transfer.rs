//! Whole-file transfer as an intent message followed by positioned chunks.
//!
//! Sending side: `Create`/`Modify` intent, then `FileWriting` chunks at
//! ascending absolute offsets until end of file. The final chunk carries only
//! the remaining bytes. The source is held under a non-blocking exclusive
//! advisory lock for the duration of the send.
//!
//! Receiving side: the intent resets the target to an empty file, each chunk
//! is written at its offset.

use crate::codec::write_message;
use crate::operation::{Message, Operation};
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// Advisory lock on an open source file, released on drop.
pub struct SourceLock {
    file: File,
}

impl SourceLock {
    /// Try to lock without blocking. `Ok(None)` when another process holds it.
    #[cfg(unix)]
    pub fn try_acquire(file: File) -> Result<Option<Self>> {
        use std::os::fd::AsRawFd;
        let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if r == 0 {
            return Ok(Some(Self { file }));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err).context("flock")
        }
    }

    #[cfg(not(unix))]
    pub fn try_acquire(file: File) -> Result<Option<Self>> {
        Ok(Some(Self { file }))
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

#[cfg(unix)]
impl Drop for SourceLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { bytes: u64, chunks: u64 },
    /// Source locked by someone else; nothing was sent
    Locked,
    /// Source disappeared before it could be opened; nothing was sent
    Vanished,
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
pub fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream `source` to the peer: `intent` first, then its bytes in
/// `chunk_size` pieces addressed to the intent's path.
pub async fn send_file<W>(
    stream: &mut W,
    source: &Path,
    intent: &Operation,
    chunk_size: usize,
) -> Result<SendOutcome>
where
    W: AsyncWrite + Unpin,
{
    let Operation::FileWriting { path: wire_path } = Operation::writing(intent)? else {
        bail!("{} does not carry file bytes", intent);
    };
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }

    let file = match File::open(source) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("transfer: {} vanished before send", source.display());
            return Ok(SendOutcome::Vanished);
        }
        Err(e) => return Err(e).with_context(|| format!("open {}", source.display())),
    };
    let Some(mut lock) = SourceLock::try_acquire(file)? else {
        warn!("transfer: {} is locked, skipping send", source.display());
        return Ok(SendOutcome::Locked);
    };

    write_message(stream, &Message::new(intent.clone())?).await?;

    let mut buf = vec![0u8; chunk_size];
    let mut position = 0u64;
    let mut chunks = 0u64;
    loop {
        let n = read_chunk(lock.file(), &mut buf)
            .with_context(|| format!("read {}", source.display()))?;
        if n == 0 {
            break;
        }
        write_message(stream, &Message::chunk(wire_path.clone(), position, buf[..n].to_vec())).await?;
        position += n as u64;
        chunks += 1;
        if n < chunk_size {
            break;
        }
    }
    debug!(
        "transfer: sent {} ({} bytes in {} chunk(s))",
        source.display(),
        position,
        chunks
    );
    Ok(SendOutcome::Sent {
        bytes: position,
        chunks,
    })
}

/// Reset `target` to an empty file, creating parent directories.
pub fn prepare_target(target: &Path) -> Result<()> {
    crate::paths::ensure_parent_exists(target)?;
    if target.is_dir() {
        bail!("{} is a directory", target.display());
    }
    if target.exists() {
        std::fs::remove_file(target).with_context(|| format!("remove {}", target.display()))?;
    }
    File::create(target).with_context(|| format!("create {}", target.display()))?;
    Ok(())
}

/// Write `bytes` at absolute `position` in an existing file.
pub fn write_at(target: &Path, position: u64, bytes: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(target)
        .with_context(|| format!("open {} for writing", target.display()))?;
    f.seek(SeekFrom::Start(position))?;
    f.write_all(bytes)
        .with_context(|| format!("write {} bytes at {} in {}", bytes.len(), position, target.display()))?;
    Ok(())
}
