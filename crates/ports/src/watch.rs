//! TCP readiness watching for `/api/port-watch`.

use std::time::Duration;

use {futures::Stream, tokio::net::TcpStream};

use warden_protocol::PortWatchEvent;

/// Poll `localhost:<port>` for TCP connectability.
///
/// Emits `pending` frames while the port refuses, a single terminal `ready`
/// on the first successful connect, or `timeout` once `deadline` elapses.
pub fn watch_port(
    port: u16,
    interval: Duration,
    deadline: Duration,
) -> impl Stream<Item = PortWatchEvent> + Send {
    async_stream::stream! {
        let started = tokio::time::Instant::now();
        loop {
            let probe =
                tokio::time::timeout(interval, TcpStream::connect(("127.0.0.1", port))).await;
            if matches!(probe, Ok(Ok(_))) {
                yield PortWatchEvent::Ready { port };
                return;
            }
            if started.elapsed() >= deadline {
                yield PortWatchEvent::Timeout { port };
                return;
            }
            yield PortWatchEvent::Pending { port };
            tokio::time::sleep(interval).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn listening_port_reports_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep accepting so connects succeed.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let events: Vec<_> = watch_port(
            port,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .collect()
        .await;
        assert_eq!(*events.last().unwrap(), PortWatchEvent::Ready { port });
    }

    #[tokio::test]
    async fn closed_port_times_out_after_pending() {
        // Bind then drop to get a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let events: Vec<_> = watch_port(
            port,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .collect()
        .await;
        assert_eq!(*events.last().unwrap(), PortWatchEvent::Timeout { port });
        assert!(
            events
                .iter()
                .take(events.len() - 1)
                .all(|e| matches!(e, PortWatchEvent::Pending { .. }))
        );
    }

    #[tokio::test]
    async fn late_listener_is_detected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap();
            loop {
                let _ = listener.accept().await;
            }
        });

        let events: Vec<_> = watch_port(
            port,
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
        .collect()
        .await;
        assert_eq!(*events.last().unwrap(), PortWatchEvent::Ready { port });
    }
}
