//! Component C - archive writer.
//!
//! Walks a directory (`walkdir`) and writes a single DEFLATE-compressed ZIP
//! container with entries at path-relative names. Writing is synchronous
//! file I/O, so it runs inside `spawn_blocking` - the orchestrator just
//! awaits the handle, the same shape used for any CPU/IO-bound task that
//! must not block the async runtime.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Error};
use tokio::sync::mpsc;
use zip::write::FileOptions;
use zip::ZipWriter;

const SMALL_FILE_BUFFER: usize = 1024 * 1024;
const LARGE_FILE_BUFFER: usize = 4 * 1024 * 1024;
const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub current_entry: String,
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

struct Entry {
    absolute: PathBuf,
    relative: String,
    size: u64,
}

/// Writes `source_dir` into `dest_path` as a ZIP archive. On any error the
/// partial destination file is removed so a failure never leaves a
/// half-written archive behind.
pub async fn write_archive(
    source_dir: PathBuf,
    dest_path: PathBuf,
    progress: Option<mpsc::Sender<ProgressEvent>>,
) -> Result<(), Error> {
    write_archive_cancellable(source_dir, dest_path, progress, None).await
}

/// As [`write_archive`], but checked against `cancel` between entries so an
/// external cancellation can interrupt a long compression. A cancelled
/// run surfaces as a plain error; the caller is
/// expected to already know it asked for cancellation.
pub async fn write_archive_cancellable(
    source_dir: PathBuf,
    dest_path: PathBuf,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || write_archive_blocking(&source_dir, &dest_path, progress, cancel))
        .await
        .context("archive writer task panicked")?
}

fn write_archive_blocking(
    source_dir: &Path,
    dest_path: &Path,
    progress: Option<mpsc::Sender<ProgressEvent>>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<(), Error> {
    match write_archive_inner(source_dir, dest_path, &progress, &cancel) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(dest_path);
            Err(err)
        }
    }
}

fn write_archive_inner(
    source_dir: &Path,
    dest_path: &Path,
    progress: &Option<mpsc::Sender<ProgressEvent>>,
    cancel: &Option<Arc<AtomicBool>>,
) -> Result<(), Error> {
    let mut entries = collect_entries(source_dir)?;
    // Large files first, so memory/IO pressure shows up early and can be
    // reported.
    entries.sort_by(|a, b| b.size.cmp(&a.size));

    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    let mut processed_bytes = 0u64;

    let file = File::create(dest_path)
        .with_context(|| format!("unable to create archive at '{}'", dest_path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in &entries {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                anyhow::bail!("compression cancelled");
            }
        }

        writer
            .start_file(&entry.relative, options)
            .with_context(|| format!("unable to start zip entry '{}'", entry.relative))?;

        let buffer_size = if entry.size > LARGE_FILE_THRESHOLD {
            LARGE_FILE_BUFFER
        } else {
            SMALL_FILE_BUFFER
        };
        let mut buffer = vec![0u8; buffer_size];
        let mut source = File::open(&entry.absolute)
            .with_context(|| format!("unable to open '{}'", entry.absolute.display()))?;

        loop {
            let n = source.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            processed_bytes += n as u64;
        }

        if let Some(tx) = progress {
            let _ = tx.try_send(ProgressEvent {
                current_entry: entry.relative.clone(),
                processed_bytes,
                total_bytes,
            });
        }
    }

    writer.finish().context("unable to finalize archive")?;
    Ok(())
}

fn collect_entries(source_dir: &Path) -> Result<Vec<Entry>, Error> {
    let mut entries = Vec::new();
    for dir_entry in walkdir::WalkDir::new(source_dir).into_iter() {
        let dir_entry = dir_entry.context("unable to walk data directory")?;
        if !dir_entry.file_type().is_file() {
            continue;
        }
        let absolute = dir_entry.path().to_path_buf();
        let relative = absolute
            .strip_prefix(source_dir)
            .unwrap_or(&absolute)
            .to_string_lossy()
            .replace('\\', "/");
        let size = dir_entry.metadata()?.len();
        entries.push(Entry {
            absolute,
            relative,
            size,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read as _;

    #[tokio::test]
    async fn round_trip_preserves_contents_including_empty_files() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.bin"), vec![0u8; 1024]).unwrap();
        std::fs::write(source.path().join("empty.txt"), b"").unwrap();
        std::fs::create_dir(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("sub/b.txt"), b"hello").unwrap();

        let dest = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let dest_path = dest.to_path_buf();
        std::fs::remove_file(&dest_path).ok();

        write_archive(source.path().to_path_buf(), dest_path.clone(), None)
            .await
            .unwrap();

        let file = File::open(&dest_path).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.bin", "empty.txt", "sub/b.txt"]);

        let mut empty = zip.by_name("empty.txt").unwrap();
        let mut buf = Vec::new();
        empty.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_and_removes_the_partial_archive() {
        let source = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(source.path().join(format!("{i}.bin")), vec![0u8; 1024]).unwrap();
        }
        let dest = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let dest_path = dest.to_path_buf();
        std::fs::remove_file(&dest_path).ok();

        let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let result = write_archive_cancellable(source.path().to_path_buf(), dest_path.clone(), None, Some(cancel)).await;
        assert!(result.is_err());
        assert!(!dest_path.exists());
    }

    #[tokio::test]
    async fn failure_removes_partial_destination() {
        let dest = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let dest_path = dest.to_path_buf();
        std::fs::remove_file(&dest_path).ok();

        let missing_source = PathBuf::from("/nonexistent/does/not/exist");
        let result = write_archive(missing_source, dest_path.clone(), None).await;
        assert!(result.is_err());
        assert!(!dest_path.exists());
    }
}
