//! Gzip compression stage of the backup/restore pipeline.
//!
//! Streams through a fixed-size buffer rather than reading the whole file
//! into memory, since dumps routinely exceed available RAM.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::read::GzDecoder;
use flate2::Compression;

use crate::error::{BackupError, Result};

const STREAM_BUFFER_BYTES: usize = 1024 * 1024;

pub fn compress_file(input_path: &Path, output_path: Option<&Path>) -> Result<PathBuf> {
    if !input_path.exists() {
        return Err(BackupError::input(format!(
            "Input file not found for compression: {}",
            input_path.display()
        )));
    }

    let target = match output_path {
        Some(p) => p.to_path_buf(),
        None => with_appended_extension(input_path, "gz"),
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let source = File::open(input_path)?;
    let mut reader = BufReader::new(source);
    let dest = File::create(&target)?;
    let mut encoder = GzEncoder::new(BufWriter::new(dest), Compression::best());

    let mut buffer = vec![0u8; STREAM_BUFFER_BYTES];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buffer[..read])?;
    }
    encoder.finish()?;

    Ok(target)
}

pub fn decompress_file(input_path: &Path, output_path: Option<&Path>) -> Result<PathBuf> {
    if !input_path.exists() {
        return Err(BackupError::input(format!(
            "Input file not found for decompression: {}",
            input_path.display()
        )));
    }

    let target = match output_path {
        Some(p) => p.to_path_buf(),
        None => {
            if input_path.extension().and_then(|e| e.to_str()) != Some("gz") {
                return Err(BackupError::input(
                    "Auto output path for decompression requires a .gz file.",
                ));
            }
            input_path.with_extension("")
        }
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let source = File::open(input_path)?;
    let mut decoder = GzDecoder::new(BufReader::new(source));
    let dest = File::create(&target)?;
    let mut writer = BufWriter::new(dest);

    let mut buffer = vec![0u8; STREAM_BUFFER_BYTES];
    loop {
        let read = decoder.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
    }
    writer.flush()?;

    Ok(target)
}

fn with_appended_extension(path: &Path, extra: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extra);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn round_trips_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dump.sql");
        std::fs::File::create(&input)
            .unwrap()
            .write_all(b"SELECT 1; -- not actually random data, just sample bytes")
            .unwrap();

        let compressed = compress_file(&input, None).unwrap();
        assert!(compressed.to_string_lossy().ends_with(".sql.gz"));

        let decompressed = decompress_file(&compressed, None).unwrap();
        let original = std::fs::read(&input).unwrap();
        let round_tripped = std::fs::read(&decompressed).unwrap();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn missing_input_errors() {
        let err = compress_file(Path::new("/nonexistent/file.sql"), None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn decompress_without_gz_extension_requires_explicit_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dump.sql");
        std::fs::File::create(&input).unwrap();
        let err = decompress_file(&input, None).unwrap_err();
        assert!(err.to_string().contains("requires a .gz file"));
    }
}
