//! Filesystem operation wrappers.

use std::path::PathBuf;

use {
    base64::Engine,
    base64::engine::general_purpose::STANDARD as BASE64,
    futures::Stream,
    tokio::io::AsyncReadExt,
    tracing::debug,
};

use warden_protocol::{Encoding, FileEntry, FileKind, FileStreamEvent};

use crate::{
    error::{FileError, Result},
    policy::PathPolicy,
};

/// Bytes sampled from the head of a file to decide text vs binary.
const SNIFF_BYTES: usize = 8 * 1024;

/// Chunk size for streamed reads.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Metadata plus the event stream for a streamed read.
pub struct StreamedRead {
    pub mime_type: String,
    pub size: u64,
    pub is_binary: bool,
    pub encoding: Encoding,
    pub events: std::pin::Pin<Box<dyn Stream<Item = FileStreamEvent> + Send>>,
}

/// File operations behind a shared [`PathPolicy`].
#[derive(Debug, Clone)]
pub struct FileOps {
    policy: PathPolicy,
}

impl FileOps {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Create a directory. With `recursive`, missing parents are created and
    /// an existing directory is not an error (mkdir -p semantics).
    pub async fn mkdir(&self, raw: &str, recursive: bool) -> Result<PathBuf> {
        let path = self.policy.resolve(raw)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        result.map_err(|e| FileError::classify(&path, e))?;
        debug!(path = %path.display(), recursive, "mkdir");
        Ok(path)
    }

    /// Write `content` to a file, creating parent directories as needed.
    /// Returns the resolved path and the number of bytes written.
    pub async fn write_file(
        &self,
        raw: &str,
        content: &str,
        encoding: Encoding,
    ) -> Result<(PathBuf, u64)> {
        let path = self.policy.resolve(raw)?;
        let bytes = match encoding {
            Encoding::Utf8 => content.as_bytes().to_vec(),
            Encoding::Base64 => BASE64.decode(content).map_err(|e| FileError::BadEncoding {
                encoding: "base64".into(),
                message: e.to_string(),
            })?,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::classify(parent, e))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "file written");
        Ok((path, bytes.len() as u64))
    }

    /// Read a whole file. Returns `(path, content, size_bytes)`; `content` is
    /// lossy UTF-8 or base64 depending on `encoding`.
    pub async fn read_file(
        &self,
        raw: &str,
        encoding: Encoding,
    ) -> Result<(PathBuf, String, u64)> {
        let path = self.policy.resolve(raw)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        let size = bytes.len() as u64;
        let content = match encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&bytes).into_owned(),
            Encoding::Base64 => BASE64.encode(&bytes),
        };
        Ok((path, content, size))
    }

    /// Delete a file, symlink, or directory tree.
    pub async fn delete(&self, raw: &str) -> Result<PathBuf> {
        let path = self.policy.resolve(raw)?;
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| FileError::classify(&path, e))?;
        debug!(path = %path.display(), "deleted");
        Ok(path)
    }

    /// Rename within the same directory tree.
    pub async fn rename(&self, raw_old: &str, raw_new: &str) -> Result<(PathBuf, PathBuf)> {
        let old = self.policy.resolve(raw_old)?;
        let new = self.policy.resolve(raw_new)?;
        tokio::fs::rename(&old, &new)
            .await
            .map_err(|e| FileError::classify(&old, e))?;
        Ok((old, new))
    }

    /// Move a file to a new location, creating the destination's parents.
    pub async fn move_file(&self, raw_src: &str, raw_dst: &str) -> Result<(PathBuf, PathBuf)> {
        let src = self.policy.resolve(raw_src)?;
        let dst = self.policy.resolve(raw_dst)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::classify(parent, e))?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| FileError::classify(&src, e))?;
        Ok((src, dst))
    }

    /// List a directory, sorted by name.
    pub async fn list(&self, raw: &str) -> Result<Vec<FileEntry>> {
        let path = self.policy.resolve(raw)?;
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| FileError::classify(&path, e))?
        {
            let Ok(file_type) = entry.file_type().await else {
                continue; // raced with deletion
            };
            let kind = if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            };
            let size = if kind == FileKind::File {
                entry.metadata().await.ok().map(|m| m.len())
            } else {
                None
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Open a file for streamed reading.
    ///
    /// Policy and open errors surface here (before any SSE bytes go out);
    /// failures mid-read arrive as a terminal `error` event on the stream.
    /// Binary files stream base64 chunks, text files stream lossy UTF-8.
    pub async fn open_stream(&self, raw: &str) -> Result<StreamedRead> {
        let path = self.policy.resolve(raw)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| FileError::classify(&path, e))?;
        if meta.is_dir() {
            return Err(FileError::Io {
                path: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "is a directory",
                ),
            });
        }

        let mut sniff = vec![0u8; SNIFF_BYTES.min(meta.len() as usize)];
        let mut sniffed = 0;
        while sniffed < sniff.len() {
            match file
                .read(&mut sniff[sniffed..])
                .await
                .map_err(|e| FileError::classify(&path, e))?
            {
                0 => break,
                n => sniffed += n,
            }
        }
        sniff.truncate(sniffed);
        let is_binary = is_binary_sample(&sniff);
        let encoding = if is_binary {
            Encoding::Base64
        } else {
            Encoding::Utf8
        };
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let display_path = path.display().to_string();
        let events = async_stream::stream! {
            // The sniffed head is the first chunk.
            let mut buffered = sniff;
            let mut total: u64 = 0;
            loop {
                if !buffered.is_empty() {
                    total += buffered.len() as u64;
                    for chunk in buffered.chunks(STREAM_CHUNK_BYTES) {
                        yield FileStreamEvent::Chunk {
                            data: encode_chunk(chunk, encoding),
                        };
                    }
                    buffered = Vec::new();
                }
                let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];
                match file.read(&mut chunk).await {
                    Ok(0) => {
                        yield FileStreamEvent::Complete { bytes_read: total };
                        break;
                    },
                    Ok(n) => {
                        chunk.truncate(n);
                        buffered = chunk;
                    },
                    Err(e) => {
                        yield FileStreamEvent::Error {
                            message: format!("read failed on {display_path}: {e}"),
                        };
                        break;
                    },
                }
            }
        };

        Ok(StreamedRead {
            mime_type,
            size: meta.len(),
            is_binary,
            encoding,
            events: Box::pin(events),
        })
    }
}

fn encode_chunk(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Base64 => BASE64.encode(bytes),
    }
}

/// Heuristic: NUL bytes or invalid UTF-8 in the head mean binary.
fn is_binary_sample(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return true;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => false,
        // A multi-byte char may straddle the sample boundary; only the
        // trailing few bytes may be incomplete.
        Err(e) => sample.len() - e.valid_up_to() > 4,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use futures::StreamExt;

    fn ops(root: &Path) -> FileOps {
        FileOps::new(PathPolicy::new(root, &[]))
    }

    #[tokio::test]
    async fn write_then_read_round_trips_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let (_, written) = ops
            .write_file("notes/a.txt", "héllo wörld", Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(written, "héllo wörld".len() as u64);
        let (_, content, size) = ops.read_file("notes/a.txt", Encoding::Utf8).await.unwrap();
        assert_eq!(content, "héllo wörld");
        assert_eq!(size, written);
    }

    #[tokio::test]
    async fn binary_round_trips_through_base64() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let raw: Vec<u8> = (0u8..=255).collect();
        let encoded = BASE64.encode(&raw);
        ops.write_file("blob.bin", &encoded, Encoding::Base64)
            .await
            .unwrap();
        let (_, content, size) = ops.read_file("blob.bin", Encoding::Base64).await.unwrap();
        assert_eq!(size, 256);
        assert_eq!(BASE64.decode(content).unwrap(), raw);
    }

    #[tokio::test]
    async fn bad_base64_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let err = ops
            .write_file("x.bin", "not base64!!!", Encoding::Base64)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::BadEncoding { .. }));
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let err = ops.read_file("ghost.txt", Encoding::Utf8).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn mkdir_non_recursive_requires_parent() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        assert!(ops.mkdir("a/b/c", false).await.is_err());
        ops.mkdir("a/b/c", true).await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn delete_handles_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        ops.write_file("d/f.txt", "x", Encoding::Utf8).await.unwrap();
        ops.delete("d/f.txt").await.unwrap();
        assert!(!dir.path().join("d/f.txt").exists());
        ops.delete("d").await.unwrap();
        assert!(!dir.path().join("d").exists());

        let err = ops.delete("d").await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[tokio::test]
    async fn rename_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        ops.write_file("one.txt", "1", Encoding::Utf8).await.unwrap();
        ops.rename("one.txt", "two.txt").await.unwrap();
        assert!(dir.path().join("two.txt").exists());

        ops.move_file("two.txt", "deep/nested/three.txt")
            .await
            .unwrap();
        assert!(dir.path().join("deep/nested/three.txt").exists());
    }

    #[tokio::test]
    async fn list_reports_kinds_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        ops.write_file("b.txt", "abc", Encoding::Utf8).await.unwrap();
        ops.mkdir("adir", false).await.unwrap();

        let entries = ops.list(".").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "adir");
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].kind, FileKind::File);
        assert_eq!(entries[1].size, Some(3));
    }

    #[tokio::test]
    async fn policy_violation_blocks_all_ops() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        assert!(matches!(
            ops.read_file("/etc/passwd", Encoding::Utf8).await,
            Err(FileError::PathTraversal(_))
        ));
        assert!(matches!(
            ops.write_file("../escape.txt", "x", Encoding::Utf8).await,
            Err(FileError::PathTraversal(_))
        ));
    }

    #[tokio::test]
    async fn stream_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        ops.write_file("t.txt", "stream me", Encoding::Utf8)
            .await
            .unwrap();

        let stream = ops.open_stream("t.txt").await.unwrap();
        assert!(!stream.is_binary);
        assert_eq!(stream.size, 9);
        assert_eq!(stream.mime_type, "text/plain");

        let events: Vec<_> = stream.events.collect().await;
        assert_eq!(events[0], FileStreamEvent::Chunk {
            data: "stream me".into()
        });
        assert_eq!(*events.last().unwrap(), FileStreamEvent::Complete {
            bytes_read: 9
        });
    }

    #[tokio::test]
    async fn stream_binary_file_uses_base64() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let raw = vec![0u8, 1, 2, 255, 254];
        ops.write_file("b.bin", &BASE64.encode(&raw), Encoding::Base64)
            .await
            .unwrap();

        let stream = ops.open_stream("b.bin").await.unwrap();
        assert!(stream.is_binary);
        assert_eq!(stream.encoding, Encoding::Base64);

        let events: Vec<_> = stream.events.collect().await;
        match &events[0] {
            FileStreamEvent::Chunk { data } => {
                assert_eq!(BASE64.decode(data).unwrap(), raw);
            },
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_large_file_chunks_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        let big = "x".repeat(200 * 1024);
        ops.write_file("big.txt", &big, Encoding::Utf8).await.unwrap();

        let stream = ops.open_stream("big.txt").await.unwrap();
        let events: Vec<_> = stream.events.collect().await;
        let chunks = events
            .iter()
            .filter(|e| matches!(e, FileStreamEvent::Chunk { .. }))
            .count();
        assert!(chunks >= 2, "expected multiple chunks, got {chunks}");
        assert_eq!(*events.last().unwrap(), FileStreamEvent::Complete {
            bytes_read: big.len() as u64
        });
    }

    #[tokio::test]
    async fn stream_missing_file_fails_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops(dir.path());
        assert!(matches!(
            ops.open_stream("missing.txt").await,
            Err(FileError::NotFound(_))
        ));
    }

    #[test]
    fn binary_sniffing() {
        assert!(!is_binary_sample(b"plain text"));
        assert!(is_binary_sample(&[b'a', 0, b'b']));
        assert!(!is_binary_sample("héllo".as_bytes()));
        assert!(is_binary_sample(&[0xff, 0xfe, 0x00, 0x01, 0x02, 0x03]));
    }
}
