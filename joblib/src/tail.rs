use std::io;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// How often an idle reader re-checks the file for growth.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum bytes delivered per chunk; matches the wire frame size.
const CHUNK_SIZE: usize = 1024;

/// A byte stream over a file that is still being written.
///
/// Reads advance a cursor against the file size reported by `fstat`. At end
/// of file the reader blocks until either the file grows or the owning job
/// reaches a terminal state, at which point the stream ends cleanly. Each
/// reader owns an independent file descriptor, so any number of them can
/// follow the same job concurrently.
pub struct TailReader {
    file: File,
    last_size: u64,
    done: watch::Receiver<bool>,
    // once the watch sender is gone we fall back to pure polling
    watch_live: bool,
}

impl TailReader {
    /// Open the job output file read-only. `done` must flip to `true` when
    /// the writing job terminates.
    pub async fn open(path: &Path, done: watch::Receiver<bool>) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|err| Error::io(format!("unable to open output file '{}'", path.display()), err))?;
        Ok(Self {
            file,
            last_size: 0,
            done,
            watch_live: true,
        })
    }

    /// Next chunk of output, at most [`CHUNK_SIZE`] bytes.
    ///
    /// Returns `None` on clean end-of-stream: the job is terminal and every
    /// byte written before termination has been delivered. Errors from
    /// `fstat` or `read` end the stream with `Some(Err(_))`.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            let size = match self.file.metadata().await {
                Ok(meta) => meta.len(),
                Err(err) => return Some(Err(err)),
            };

            if size > self.last_size {
                let mut buf = [0u8; CHUNK_SIZE];
                match self.file.read(&mut buf).await {
                    Ok(0) => {} // size raced ahead of visible data; re-poll
                    Ok(n) => {
                        self.last_size += n as u64;
                        return Some(Ok(Bytes::copy_from_slice(&buf[..n])));
                    }
                    Err(err) => return Some(Err(err)),
                }
            } else if *self.done.borrow() {
                return None;
            }

            if self.watch_live {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    changed = self.done.changed() => {
                        if changed.is_err() {
                            self.watch_live = false;
                        }
                    }
                }
            } else {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    /// Drain the remaining stream into one buffer. Test helper, but also
    /// handy for small outputs.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}
