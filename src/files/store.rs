//! File API operations over a [`PathSandbox`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::archive;
use super::detection::{self, SNIFF_LEN, ZIP_MIME};
use super::{FileError, PathSandbox, Result};

/// One row of a directory listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the sandbox root, without a leading slash.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
    /// `ls -l` style mode string, e.g. `drwxr-xr-x`.
    pub permissions: String,
    pub is_readable: bool,
    pub is_writable: bool,
    pub is_executable: bool,
}

/// What a download request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSource {
    File { path: PathBuf, name: String, size: u64 },
    Directory { path: PathBuf, name: String },
}

/// Result of storing one uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub path: String,
    /// Number of files extracted when the upload was a zip archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<usize>,
}

/// Filesystem operations confined to one root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    sandbox: PathSandbox,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            sandbox: PathSandbox::new(root),
        }
    }

    /// List a directory, sorted by name.
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.sandbox.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Entry vanished between readdir and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(self.entry_for(&entry.path(), &metadata));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Read a file as text. Binary content is rejected with its detected type.
    pub async fn read_text(&self, path: &str) -> Result<String> {
        let target = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| io_error(path, e))?;
        if metadata.is_dir() {
            return Err(FileError::InvalidInput(format!("{} is a directory", path)));
        }

        let data = tokio::fs::read(&target).await?;
        let filename = file_name(&target);
        let mime = detection::detect_content_type(&data, Some(&filename));
        if !detection::is_text_content(&mime, &filename) {
            return Err(FileError::Binary { mime });
        }
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Write (create or truncate) a file.
    pub async fn write_text(&self, path: &str, content: &str) -> Result<()> {
        let target = self.require_non_root(path)?;
        write_file(&target, content.as_bytes())
            .await
            .map_err(|e| io_error(path, e))
    }

    /// Create a directory and any missing parents.
    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let target = self.sandbox.resolve(path)?;
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&target).await?;
        Ok(())
    }

    /// Delete a file or a directory tree. The root itself cannot be deleted.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let target = self.require_non_root(path)?;
        let metadata = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| io_error(path, e))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        tracing::info!(path = %path, "Deleted");
        Ok(())
    }

    /// Rename within the sandbox.
    pub async fn rename(&self, source: &str, destination: &str) -> Result<()> {
        let from = self.require_non_root(source)?;
        let to = self.require_non_root(destination)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(source, e))
    }

    /// Resolve a download request to a file or a directory to zip.
    pub async fn download_source(&self, path: &str) -> Result<DownloadSource> {
        let target = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| io_error(path, e))?;
        let name = if target == self.sandbox.base() {
            "files".to_string()
        } else {
            file_name(&target)
        };

        Ok(if metadata.is_dir() {
            DownloadSource::Directory { path: target, name }
        } else {
            DownloadSource::File {
                path: target,
                name,
                size: metadata.len(),
            }
        })
    }

    /// Byte stream for a download source; directories are zipped on the fly.
    pub async fn open_download(
        &self,
        source: &DownloadSource,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>> {
        match source {
            DownloadSource::File { path, .. } => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::pin(tokio_util::io::ReaderStream::new(file)))
            }
            DownloadSource::Directory { path, .. } => {
                Ok(Box::pin(archive::zip_directory_stream(path.clone())))
            }
        }
    }

    /// Store an uploaded file at `dir/filename`, creating `dir` as needed.
    ///
    /// When `extract_archives` is set and the stored file is a zip, it is
    /// extracted into `dir` and removed. The archive is removed on extraction
    /// failure too, and the error is returned.
    pub async fn save_upload<S, E>(
        &self,
        dir: &str,
        filename: &str,
        body: S,
        extract_archives: bool,
    ) -> Result<UploadOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        if filename.trim().is_empty() {
            return Err(FileError::InvalidInput("missing file name".to_string()));
        }
        let dest_dir = self.sandbox.resolve(dir)?;
        let target = self.sandbox.resolve(join_relative(dir, filename))?;
        if target == dest_dir || target == self.sandbox.base() {
            return Err(FileError::InvalidInput(format!("invalid file name: {}", filename)));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(e) = write_body(&target, body).await {
            if let Err(cleanup) = tokio::fs::remove_file(&target).await
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %target.display(), error = %cleanup, "Failed to remove partial upload");
            }
            return Err(e);
        }

        let relative = self.sandbox.relative(&target);
        if !extract_archives || sniff(&target).await? != ZIP_MIME {
            return Ok(UploadOutcome {
                path: relative,
                extracted: None,
            });
        }

        let archive_path = target.clone();
        let extract_into = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dest_dir.clone());
        let result = tokio::task::spawn_blocking(move || -> Result<usize> {
            let file = std::fs::File::open(&archive_path)?;
            archive::unzip(io::BufReader::new(file), &extract_into)
        })
        .await
        .map_err(|e| FileError::Io(io::Error::other(e)))?;

        tokio::fs::remove_file(&target).await?;
        let extracted = result?;
        tracing::info!(archive = %relative, files = extracted, "Extracted uploaded archive");

        Ok(UploadOutcome {
            path: self.sandbox.relative(target.parent().unwrap_or(&dest_dir)),
            extracted: Some(extracted),
        })
    }

    fn require_non_root(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(FileError::InvalidInput("path is required".to_string()));
        }
        let target = self.sandbox.resolve(path)?;
        if target == self.sandbox.base() {
            return Err(FileError::InvalidInput(
                "operation not allowed on the root directory".to_string(),
            ));
        }
        Ok(target)
    }

    fn entry_for(&self, path: &Path, metadata: &std::fs::Metadata) -> FileEntry {
        let mode = file_mode(metadata);
        FileEntry {
            name: file_name(path),
            path: self.sandbox.relative(path),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            mod_time: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default(),
            permissions: mode_string(mode, metadata.is_dir(), metadata.is_symlink()),
            is_readable: mode & 0o444 != 0,
            is_writable: mode & 0o222 != 0,
            is_executable: mode & 0o111 != 0,
        }
    }
}

async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.flush().await
}

async fn sniff(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(detection::detect_content_type(
        &head,
        path.file_name().and_then(|n| n.to_str()),
    ))
}

fn join_relative(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn io_error(path: &str, e: io::Error) -> FileError {
    if e.kind() == io::ErrorKind::NotFound {
        FileError::NotFound {
            path: path.to_string(),
        }
    } else {
        FileError::Io(e)
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o666 }
}

/// Stream `body` into a new file at `target`.
async fn write_body<S, E>(target: &Path, body: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(target).await?;
    let mut body = std::pin::pin!(body);
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|e| FileError::InvalidInput(format!("upload interrupted: {}", e)))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Render permission bits the way `ls -l` does.
pub fn mode_string(mode: u32, is_dir: bool, is_symlink: bool) -> String {
    let kind = if is_dir {
        'd'
    } else if is_symlink {
        'L'
    } else {
        '-'
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        (dir, store)
    }

    fn body(data: &[u8]) -> impl Stream<Item = std::result::Result<Bytes, io::Error>> {
        futures::stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
    }

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            for (name, data) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(0o755, true, false), "drwxr-xr-x");
        assert_eq!(mode_string(0o644, false, false), "-rw-r--r--");
        assert_eq!(mode_string(0o000, false, false), "----------");
    }

    #[tokio::test]
    async fn test_list_is_sorted_with_relative_paths() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("srv/plugins")).unwrap();
        std::fs::write(dir.path().join("srv/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("srv/a.txt"), "aa").unwrap();

        let entries = store.list("srv").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "plugins"]);
        assert_eq!(entries[0].path, "srv/a.txt");
        assert_eq!(entries[0].size, 2);
        assert!(!entries[0].is_dir);
        assert!(entries[2].is_dir);
        assert!(entries[0].is_readable);
    }

    #[tokio::test]
    async fn test_list_root_and_missing() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("top.txt"), "t").unwrap();
        assert_eq!(store.list("").await.unwrap().len(), 1);
        assert_eq!(store.list("/").await.unwrap().len(), 1);
        assert!(matches!(
            store.list("nope").await,
            Err(FileError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_traversal_denied_everywhere() {
        let (_dir, store) = store();
        assert!(matches!(
            store.list("../").await,
            Err(FileError::AccessDenied { .. })
        ));
        assert!(matches!(
            store.read_text("../../etc/passwd").await,
            Err(FileError::AccessDenied { .. })
        ));
        assert!(matches!(
            store.write_text("../x", "y").await,
            Err(FileError::AccessDenied { .. })
        ));
        assert!(matches!(
            store.rename("a", "../b").await,
            Err(FileError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_text() {
        let (_dir, store) = store();
        store.create_dir("cfg/nested").await.unwrap();
        store
            .write_text("cfg/nested/server.properties", "motd=hi\n")
            .await
            .unwrap();
        assert_eq!(
            store.read_text("cfg/nested/server.properties").await.unwrap(),
            "motd=hi\n"
        );
    }

    #[tokio::test]
    async fn test_read_binary_rejected_with_mime() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("img.png"), [0x89, 0x50, 0x4E, 0x47, 0, 0]).unwrap();
        match store.read_text("img.png").await {
            Err(FileError::Binary { mime }) => assert_eq!(mime, "image/png"),
            other => panic!("expected Binary, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_requires_path_and_spares_root() {
        let (dir, store) = store();
        assert!(matches!(
            store.delete("").await,
            Err(FileError::InvalidInput(_))
        ));
        assert!(matches!(
            store.delete("/").await,
            Err(FileError::InvalidInput(_))
        ));

        std::fs::create_dir_all(dir.path().join("old/deep")).unwrap();
        std::fs::write(dir.path().join("old/deep/f"), "x").unwrap();
        store.delete("old").await.unwrap();
        assert!(!dir.path().join("old").exists());
    }

    #[tokio::test]
    async fn test_rename() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        store.rename("a.txt", "b.txt").await.unwrap();
        assert!(dir.path().join("b.txt").exists());
        assert!(matches!(
            store.rename("missing", "c").await,
            Err(FileError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_source_kinds() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("world")).unwrap();
        std::fs::write(dir.path().join("log.txt"), "12345").unwrap();

        match store.download_source("world").await.unwrap() {
            DownloadSource::Directory { name, .. } => assert_eq!(name, "world"),
            other => panic!("expected directory, got {:?}", other),
        }
        match store.download_source("log.txt").await.unwrap() {
            DownloadSource::File { name, size, .. } => {
                assert_eq!(name, "log.txt");
                assert_eq!(size, 5);
            }
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_plain_file() {
        let (dir, store) = store();
        let outcome = store
            .save_upload("uploads", "notes.txt", body(b"hello"), true)
            .await
            .unwrap();
        assert_eq!(outcome.path, "uploads/notes.txt");
        assert!(outcome.extracted.is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("uploads/notes.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_upload_zip_is_extracted_and_removed() {
        let (dir, store) = store();
        let data = zip_bytes(&[("mods/a.jar", "A"), ("readme.md", "R")]);
        let outcome = store
            .save_upload("server", "bundle.zip", body(&data), true)
            .await
            .unwrap();

        assert_eq!(outcome.extracted, Some(2));
        assert!(!dir.path().join("server/bundle.zip").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("server/mods/a.jar")).unwrap(),
            "A"
        );
    }

    #[tokio::test]
    async fn test_upload_corrupt_zip_removed_and_error_returned() {
        let (dir, store) = store();
        let result = store
            .save_upload("server", "broken.zip", body(b"PK\x03\x04garbage"), true)
            .await;
        assert!(result.is_err());
        assert!(!dir.path().join("server/broken.zip").exists());
    }

    #[tokio::test]
    async fn test_interrupted_upload_leaves_no_partial_file() {
        let (dir, store) = store();
        let interrupted = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first half of the ")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);
        let result = store
            .save_upload("uploads", "world.dat", interrupted, true)
            .await;
        assert!(matches!(result, Err(FileError::InvalidInput(_))));
        assert!(!dir.path().join("uploads/world.dat").exists());
        // The destination directory itself is kept
        assert!(dir.path().join("uploads").is_dir());
    }

    #[tokio::test]
    async fn test_upload_directory_keeps_relative_names() {
        let (dir, store) = store();
        let data = zip_bytes(&[("x", "y")]);
        store
            .save_upload("site", "assets/pack.zip", body(&data), false)
            .await
            .unwrap();
        // Not extracted when archive handling is off
        assert!(dir.path().join("site/assets/pack.zip").is_file());
    }

    #[tokio::test]
    async fn test_upload_name_cannot_escape() {
        let (_dir, store) = store();
        let result = store
            .save_upload("a", "../../../evil", body(b"x"), true)
            .await;
        assert!(matches!(result, Err(FileError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn test_open_download_streams_file() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("f.bin"), vec![9u8; 10_000]).unwrap();
        let source = store.download_source("f.bin").await.unwrap();
        let stream = store.open_download(&source).await.unwrap();
        let chunks: Vec<io::Result<Bytes>> = stream.collect().await;
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, 10_000);
    }
}
