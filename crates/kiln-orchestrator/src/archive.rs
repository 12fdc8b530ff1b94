//! Model archives: gzip-compressed tarballs of a model directory.
//!
//! Compression runs on tokio's blocking pool. Each call spawns exactly one
//! job and joins it before returning, so a caller never observes a
//! partially written archive.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::task;

/// Archive the contents of `src` into `dest`.
///
/// Entries are stored relative to `src`. The archive is flushed and synced
/// to disk before this returns.
pub async fn pack_dir(src: &Path, dest: &Path) -> io::Result<()> {
  let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
  join(task::spawn_blocking(move || pack_dir_blocking(&src, &dest))).await
}

/// Extract the archive at `archive` into the directory `dest`.
pub async fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
  let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
  join(task::spawn_blocking(move || unpack_blocking(&archive, &dest))).await
}

async fn join(handle: task::JoinHandle<io::Result<()>>) -> io::Result<()> {
  handle
    .await
    .map_err(|e| io::Error::other(format!("archive job did not complete: {}", e)))?
}

fn pack_dir_blocking(src: &Path, dest: &Path) -> io::Result<()> {
  let file = File::create(dest)?;
  let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
  builder.follow_symlinks(false);
  builder.append_dir_all(".", src)?;

  let encoder = builder.into_inner()?;
  let mut file = encoder.finish()?;
  file.flush()?;
  file.sync_all()
}

fn unpack_blocking(archive: &Path, dest: &Path) -> io::Result<()> {
  let file = File::open(archive)?;
  let mut archive = tar::Archive::new(GzDecoder::new(file));
  archive.set_preserve_permissions(true);
  archive.unpack(dest)
}

/// Every regular file under `root`, as sorted relative paths.
pub fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  collect_files(root, root, &mut files)?;
  files.sort();
  Ok(files)
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_dir() {
      collect_files(root, &path, files)?;
    } else if let Ok(relative) = path.strip_prefix(root) {
      files.push(relative.to_path_buf());
    }
  }
  Ok(())
}
