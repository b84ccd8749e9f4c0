//! File chunking and zip streaming for the download commands.
//!
//! Chunks are produced lazily so large files never sit in memory; each chunk
//! is base64-encoded for the JSON envelope payload.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tempfile::TempDir;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::client::ReplyStream;

/// Download stream chunk size in bytes.
pub const CHUNK_SIZE: usize = 2048;

/// Lazily yield base64-encoded chunks of the file at `path`.
pub fn chunk_file(path: &Path) -> Result<ReplyStream> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {} for download", path.display()))?;
    Ok(Box::new(FileChunks {
        reader: BufReader::new(file),
        done: false,
        _scratch: None,
    }))
}

/// Zip `path` (a file or a directory tree) into scratch space, then yield
/// base64-encoded chunks of the archive. Entries are stored uncompressed.
pub fn compress_and_chunk(path: &Path) -> Result<ReplyStream> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let scratch = tempfile::tempdir().context("Failed to create scratch dir for archive")?;
    let zip_path = scratch.path().join(format!("{}.zip", name));

    let mut writer = ZipWriter::new(File::create(&zip_path)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    info!("created archive {}.zip", name);

    if path.is_dir() {
        add_dir_to_zip(&mut writer, path, path, &options)?;
    } else {
        writer.start_file(name.clone(), options.clone())?;
        io::copy(&mut File::open(path)?, &mut writer)?;
        info!("added {} to archive", path.display());
    }
    writer.finish()?;

    let file = File::open(&zip_path)?;
    Ok(Box::new(FileChunks {
        reader: BufReader::new(file),
        done: false,
        _scratch: Some(scratch),
    }))
}

fn add_dir_to_zip(
    writer: &mut ZipWriter<File>,
    base: &Path,
    dir: &Path,
    options: &SimpleFileOptions,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            add_dir_to_zip(writer, base, &path, options)?;
        } else {
            let entry_name = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            writer.start_file(entry_name, options.clone())?;
            io::copy(&mut File::open(&path)?, writer)?;
            info!("added {} to archive", path.display());
        }
    }
    Ok(())
}

struct FileChunks {
    reader: BufReader<File>,
    done: bool,
    // Keeps the archive's scratch directory alive while streaming.
    _scratch: Option<TempDir>,
}

impl Iterator for FileChunks {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = [0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e).context("Failed to read download chunk"));
                }
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }
        Some(Ok(Value::String(BASE64.encode(&buf[..filled]))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect(stream: ReplyStream) -> Vec<String> {
        stream
            .map(|chunk| chunk.unwrap().as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_chunk_file_splits_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let chunks = collect(chunk_file(&path).unwrap());
        assert_eq!(chunks.len(), 3);

        let decoded: Vec<u8> = chunks
            .iter()
            .flat_map(|c| BASE64.decode(c).unwrap())
            .collect();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_chunk_file_empty_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert!(collect(chunk_file(&path).unwrap()).is_empty());
    }

    #[test]
    fn test_chunk_file_missing_file_fails_eagerly() {
        assert!(chunk_file(Path::new("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_compress_and_chunk_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let mut f = File::create(dir.path().join("sub/a.txt")).unwrap();
        f.write_all(b"hello archive").unwrap();

        let chunks = collect(compress_and_chunk(dir.path()).unwrap());
        assert!(!chunks.is_empty());

        let archive: Vec<u8> = chunks
            .iter()
            .flat_map(|c| BASE64.decode(c).unwrap())
            .collect();
        // Zip local file header magic.
        assert_eq!(&archive[..2], b"PK");
    }
}
