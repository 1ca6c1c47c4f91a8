//! Filtered archive streaming.
//!
//! The engine's output directory is re-packaged as a tar stream for build
//! submission. The walk runs on a blocking task concurrently with the
//! consumer; a bounded channel provides backpressure (the producer cannot
//! outrun the consumer) and carries the producer's terminal error so the
//! consumer observes a read failure rather than a silent truncation.
//!
//! The exclusion pattern is re-applied here even though the engine already
//! received it: the engine does not reliably honor exclusions when exporting
//! build instructions instead of building.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_common::{KilnError, KilnResult};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use walkdir::WalkDir;

const CHANNEL_CAPACITY: usize = 8;

/// Stream the filtered tar rendering of a directory tree.
///
/// The walk runs on a blocking task; dropping the returned stream ends the
/// walk within one file's I/O (the next channel write fails broken-pipe).
pub fn tar_stream(root: PathBuf, exclude: Regex) -> BoxStream<'static, KilnResult<Bytes>> {
    let (tx, rx) = mpsc::channel::<KilnResult<Bytes>>(CHANNEL_CAPACITY);
    let writer_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter { tx: writer_tx };
        if let Err(err) = write_tree(writer, &root, &exclude) {
            // Terminal walk error becomes the consumer's read error.
            let _ = tx.blocking_send(Err(err));
        }
    });
    ReceiverStream::new(rx).boxed()
}

struct ChannelWriter {
    tx: mpsc::Sender<KilnResult<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write the filtered tar rendering of `root` to `out`.
///
/// Walks in lexical directory order, skips the root entry itself, normalizes
/// every path to forward slashes before exclusion matching and header
/// naming, and rejects symlinks whose targets resolve outside `root`.
pub fn write_tree<W: Write>(out: W, root: &Path, exclude: &Regex) -> KilnResult<()> {
    let mut tar = tar::Builder::new(out);

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| KilnError::Io(e.into()))?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let name = slash_name(rel);
        if exclude.is_match(&name) {
            continue;
        }

        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();

        let mut header = tar::Header::new_gnu();
        header.set_mtime(mtime(&metadata));
        header.set_mode(file_mode(&metadata));

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = if target.is_absolute() {
                let rel_target = relativize(root, &target);
                if rel_target.starts_with("..") {
                    return Err(KilnError::LinkEscape { path: name });
                }
                rel_target
            } else {
                target
            };
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            tar.append_link(&mut header, &name, slash_name(&target))?;
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            tar.append_data(&mut header, format!("{}/", name), io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            let file = fs::File::open(entry.path())?;
            tar.append_data(&mut header, &name, file)?;
        }
        // Sockets, fifos and device nodes have no place in a build context.
    }

    tar.into_inner()?;
    Ok(())
}

fn slash_name(path: &Path) -> String {
    if std::path::MAIN_SEPARATOR == '/' {
        path.to_string_lossy().into_owned()
    } else {
        path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
    }
}

fn mtime(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    // No executable-permission bit on this host; mark entries executable so
    // assemble scripts survive the transfer.
    if metadata.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

/// Lexical relative path from `base` to `target` (both absolute).
fn relativize(base: &Path, target: &Path) -> PathBuf {
    let base_components: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();
    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_components.len() {
        rel.push("..");
    }
    for component in &target_components[common..] {
        rel.push(component);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}
