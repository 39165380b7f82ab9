//! Zip packing for directory downloads and unpacking for uploads.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{Result, sandbox};

/// Write a zip of everything under `source` to `writer`.
///
/// Entries are named by their path relative to `source` with `/` separators,
/// in file-name order. Directories get a trailing `/` and no content; regular
/// files are deflated. The root itself is not an entry and symlinks are
/// skipped. `writer` does not need to be seekable.
pub fn zip_directory<W: Write>(source: &Path, writer: W) -> Result<()> {
    let mut zip = ZipWriter::new_stream(writer);
    let base_options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let name = entry_name(relative);
        let options = with_permissions(base_options, &entry.metadata()?);

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}

/// Zip `source` on a blocking thread, yielding archive bytes as they are
/// produced.
///
/// Dropping the stream stops the producer at its next write. A failure
/// mid-archive surfaces as a final `Err` item.
pub fn zip_directory_stream(source: PathBuf) -> impl Stream<Item = io::Result<Bytes>> + Send {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);

    tokio::task::spawn_blocking(move || {
        let writer = io::BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx: tx.clone() });
        if let Err(e) = zip_directory(&source, writer) {
            tracing::debug!(source = %source.display(), error = %e, "Directory zip stopped");
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
        }
    });

    ReceiverStream::new(rx)
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Blocking `Write` adapter that forwards chunks into an async channel.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Extract `archive` into `destination`, returning the number of files written.
///
/// Entries whose names resolve outside `destination` are skipped. Directories
/// are created recursively and parent directories are created on demand.
/// Files already extracted stay in place if a later entry fails.
pub fn unzip<R: Read + Seek>(archive: R, destination: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(archive)?;
    let mut extracted = 0;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();

        let target = match sandbox::resolve(destination, &name) {
            Ok(target) => target,
            Err(_) => {
                tracing::warn!(entry = %name, "Skipping zip entry outside destination");
                continue;
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if target.as_path() == destination {
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = create_file(&target, entry.unix_mode())?;
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    Ok(extracted)
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn with_permissions(options: SimpleFileOptions, metadata: &fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn with_permissions(options: SimpleFileOptions, _metadata: &fs::Metadata) -> SimpleFileOptions {
    options
}

#[cfg(unix)]
fn create_file(path: &Path, mode: Option<u32>) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    let mode = mode.map(|m| m & 0o7777).filter(|m| *m != 0).unwrap_or(0o644);
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path, _mode: Option<u32>) -> io::Result<File> {
    File::create(path)
}
