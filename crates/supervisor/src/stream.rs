//! SSE-shaped event streams over process output buffers.
//!
//! Both `/api/process/{id}/logs/stream` and `/api/execute/stream` speak the
//! same frame sequence: interleaved `stdout`/`stderr` data events carrying
//! resume offsets, then exactly one `exit` event once the process is terminal
//! and the buffers are drained.

use std::sync::{Arc, Mutex};

use {
    chrono::{DateTime, Utc},
    futures::Stream,
    tokio::sync::watch,
};

use warden_protocol::{Encoding, LogOffsets, ProcessStatus, StreamEvent};

use crate::ring::LogBuffer;

/// Terminal details recorded by the reaper.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: i32,
    pub status: ProcessStatus,
    pub end_time: DateTime<Utc>,
}

/// Everything a log stream needs, copied out of the process table so the
/// stream never holds the supervisor lock.
#[derive(Clone)]
pub struct StreamSource {
    pub stdout: Arc<LogBuffer>,
    pub stderr: Arc<LogBuffer>,
    pub status: watch::Receiver<ProcessStatus>,
    pub exit: Arc<Mutex<Option<ExitInfo>>>,
    pub encoding: Encoding,
}

pub(crate) fn decode_chunk(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Base64 => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(bytes)
        },
    }
}

/// Classify a `wait()` result into `(exit_code, status)`.
pub(crate) fn classify_exit(
    result: &std::io::Result<std::process::ExitStatus>,
) -> (i32, ProcessStatus) {
    match result {
        Ok(st) => match st.code() {
            Some(0) => (0, ProcessStatus::Completed),
            Some(c) => (c, ProcessStatus::Failed),
            // Terminated by signal.
            None => (-1, ProcessStatus::Killed),
        },
        Err(_) => (-1, ProcessStatus::Error),
    }
}

/// Stream log events starting at `since` (defaults to the oldest retained
/// byte of each buffer). Ends after the `exit` event.
pub fn stream_events(
    src: StreamSource,
    since: Option<LogOffsets>,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let mut status_rx = src.status.clone();
        let mut offsets = since.unwrap_or(LogOffsets {
            stdout: src.stdout.start_offset(),
            stderr: src.stderr.start_offset(),
        });
        loop {
            let mut emitted = false;

            let out = src.stdout.read_since(offsets.stdout);
            offsets.stdout = out.new_offset;
            if !out.bytes.is_empty() {
                emitted = true;
                yield StreamEvent::Stdout {
                    data: decode_chunk(&out.bytes, src.encoding),
                    offset: out.new_offset,
                };
            }

            let err = src.stderr.read_since(offsets.stderr);
            offsets.stderr = err.new_offset;
            if !err.bytes.is_empty() {
                emitted = true;
                yield StreamEvent::Stderr {
                    data: decode_chunk(&err.bytes, src.encoding),
                    offset: err.new_offset,
                };
            }

            if emitted {
                continue;
            }

            // Buffers drained: either the process is done or we park until
            // something changes.
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() {
                let info = *src.exit.lock().unwrap_or_else(|e| e.into_inner());
                let (code, status) = match info {
                    Some(i) => (i.code, i.status),
                    None => (-1, status),
                };
                yield StreamEvent::Exit { code, status };
                break;
            }

            tokio::select! {
                _ = src.stdout.wait_beyond(offsets.stdout) => {},
                _ = src.stderr.wait_beyond(offsets.stderr) => {},
                _ = status_rx.changed() => {},
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn source(encoding: Encoding) -> (StreamSource, watch::Sender<ProcessStatus>) {
        let (tx, rx) = watch::channel(ProcessStatus::Running);
        let src = StreamSource {
            stdout: Arc::new(LogBuffer::new(1024)),
            stderr: Arc::new(LogBuffer::new(1024)),
            status: rx,
            exit: Arc::new(Mutex::new(None)),
            encoding,
        };
        (src, tx)
    }

    fn finish(src: &StreamSource, tx: &watch::Sender<ProcessStatus>, code: i32) {
        let status = if code == 0 {
            ProcessStatus::Completed
        } else {
            ProcessStatus::Failed
        };
        *src.exit.lock().unwrap() = Some(ExitInfo {
            code,
            status,
            end_time: Utc::now(),
        });
        let _ = tx.send(status);
    }

    #[tokio::test]
    async fn replays_retained_bytes_then_exits() {
        let (src, tx) = source(Encoding::Utf8);
        src.stdout.write(b"1\n2\n");
        src.stderr.write(b"warn\n");
        finish(&src, &tx, 0);

        let events: Vec<_> = stream_events(src, None).collect().await;
        assert_eq!(events[0], StreamEvent::Stdout {
            data: "1\n2\n".into(),
            offset: 4
        });
        assert_eq!(events[1], StreamEvent::Stderr {
            data: "warn\n".into(),
            offset: 5
        });
        assert_eq!(*events.last().unwrap(), StreamEvent::Exit {
            code: 0,
            status: ProcessStatus::Completed
        });
    }

    #[tokio::test]
    async fn since_offset_skips_already_seen_data() {
        let (src, tx) = source(Encoding::Utf8);
        src.stdout.write(b"old-new");
        finish(&src, &tx, 0);

        let since = LogOffsets {
            stdout: 4,
            stderr: 0,
        };
        let events: Vec<_> = stream_events(src, Some(since)).collect().await;
        assert_eq!(events[0], StreamEvent::Stdout {
            data: "new".into(),
            offset: 7
        });
    }

    #[tokio::test]
    async fn wakes_on_late_writes() {
        let (src, tx) = source(Encoding::Utf8);
        let writer_src = src.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            writer_src.stdout.write(b"late");
            finish(&writer_src, &tx, 0);
        });

        let events: Vec<_> = stream_events(src, None).collect().await;
        assert!(
            events.contains(&StreamEvent::Stdout {
                data: "late".into(),
                offset: 4
            }),
            "got: {events:?}"
        );
    }

    #[tokio::test]
    async fn exit_event_is_last_and_single() {
        let (src, tx) = source(Encoding::Utf8);
        src.stdout.write(b"x");
        finish(&src, &tx, 3);

        let events: Vec<_> = stream_events(src, None).collect().await;
        let exits: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Exit { .. }))
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(*events.last().unwrap(), StreamEvent::Exit {
            code: 3,
            status: ProcessStatus::Failed
        });
    }

    #[tokio::test]
    async fn base64_encoding_applies_to_data_frames() {
        let (src, tx) = source(Encoding::Base64);
        src.stdout.write(&[0u8, 159, 146, 150]);
        finish(&src, &tx, 0);

        let events: Vec<_> = stream_events(src, None).collect().await;
        match &events[0] {
            StreamEvent::Stdout { data, .. } => {
                use base64::Engine;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert_eq!(decoded, vec![0u8, 159, 146, 150]);
            },
            other => panic!("expected stdout frame, got {other:?}"),
        }
    }
}
