//! Moving artifact bytes between streams and files.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use kiln_artifact::ByteStream;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Errors raised while moving bytes to or from disk.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
  /// The source stream failed.
  #[error("stream failed: {0}")]
  Stream(#[from] kiln_artifact::Error),

  /// Local file I/O failed.
  #[error("io error: {0}")]
  Io(#[from] io::Error),

  /// Fewer (or more) bytes reached the disk than were received.
  #[error("{} holds {actual} bytes, {expected} were received", path.display())]
  Incomplete {
    path: PathBuf,
    expected: u64,
    actual: u64,
  },
}

/// Write `data` to a new file at `path`.
///
/// Returns the number of bytes written. The file is flushed, and the size of
/// whatever is at `path` afterwards is checked against what the stream
/// produced.
pub async fn stream_to_file(mut data: ByteStream, path: &Path) -> Result<u64, TransferError> {
  let mut file = File::create(path).await?;
  let mut received = 0u64;

  while let Some(chunk) = data.next().await {
    let bytes = chunk?;
    file.write_all(&bytes).await?;
    received += bytes.len() as u64;
  }

  file.flush().await?;
  file.sync_all().await?;
  drop(file);

  let actual = tokio::fs::metadata(path).await?.len();
  if actual != received {
    return Err(TransferError::Incomplete {
      path: path.to_path_buf(),
      expected: received,
      actual,
    });
  }

  Ok(received)
}

/// Open `path` as a byte stream, returning it with the file's size.
pub async fn file_stream(path: &Path) -> io::Result<(ByteStream, u64)> {
  let file = File::open(path).await?;
  let size = file.metadata().await?.len();
  let stream = ReaderStream::new(file).map(|r| r.map_err(kiln_artifact::Error::Io));
  Ok((Box::pin(stream), size))
}
