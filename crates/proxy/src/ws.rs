//! WebSocket relay between an accepted client socket and a local upstream.
//!
//! Frames pass through one at a time in both directions; nothing is buffered
//! beyond the frame in flight. The relay ends when either side closes or
//! errors.

use {
    axum::extract::ws::{self, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio_tungstenite::{connect_async, tungstenite},
    tracing::{debug, warn},
};

fn client_to_upstream(msg: ws::Message) -> Option<tungstenite::Message> {
    match msg {
        ws::Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        ws::Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        ws::Message::Ping(data) => Some(tungstenite::Message::Ping(data)),
        ws::Message::Pong(data) => Some(tungstenite::Message::Pong(data)),
        ws::Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            }
        }))),
    }
}

fn upstream_to_client(msg: tungstenite::Message) -> Option<ws::Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(ws::Message::Text(text.as_str().into())),
        tungstenite::Message::Binary(data) => Some(ws::Message::Binary(data)),
        tungstenite::Message::Ping(data) => Some(ws::Message::Ping(data)),
        tungstenite::Message::Pong(data) => Some(ws::Message::Pong(data)),
        tungstenite::Message::Close(frame) => {
            Some(ws::Message::Close(frame.map(|f| ws::CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            })))
        },
        // Raw frames only appear when reading in frame mode.
        tungstenite::Message::Frame(_) => None,
    }
}

/// Connect to `upstream_url` and relay frames both ways until either side
/// closes.
pub async fn relay_websocket(client: WebSocket, upstream_url: String) {
    let connected = connect_async(upstream_url.as_str()).await;
    relay(client, upstream_url, connected).await;
}

/// Like [`relay_websocket`] but with a prepared upstream handshake request,
/// so extra headers (proxy port/token, forwarding context) survive the
/// upgrade.
pub async fn relay_websocket_request(
    client: WebSocket,
    upstream_request: axum::http::Request<()>,
) {
    let url = upstream_request.uri().to_string();
    let connected = connect_async(upstream_request).await;
    relay(client, url, connected).await;
}

async fn relay(
    client: WebSocket,
    upstream_url: String,
    connected: Result<
        (
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tungstenite::handshake::client::Response,
        ),
        tungstenite::Error,
    >,
) {
    let upstream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(url = %upstream_url, error = %e, "websocket upstream connect failed");
            // Closing the accepted socket is all we can do this late.
            let mut client = client;
            let _ = client
                .send(ws::Message::Close(Some(ws::CloseFrame {
                    code: 1011,
                    reason: "upstream connect failed".into(),
                })))
                .await;
            return;
        },
    };
    debug!(url = %upstream_url, "websocket relay established");

    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(msg) = client_to_upstream(msg) else {
                continue;
            };
            if up_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = up_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = up_rx.next().await {
            let Some(msg) = upstream_to_client(msg) else {
                continue;
            };
            if client_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    // Either direction finishing tears the whole relay down.
    tokio::select! {
        _ = to_upstream => {},
        _ = to_client => {},
    }
    debug!(url = %upstream_url, "websocket relay closed");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frames_convert_both_ways() {
        let up = client_to_upstream(ws::Message::Text("hi".into())).unwrap();
        assert!(matches!(&up, tungstenite::Message::Text(t) if t.as_str() == "hi"));

        let down = upstream_to_client(tungstenite::Message::Text("yo".into())).unwrap();
        assert!(matches!(&down, ws::Message::Text(t) if t.as_str() == "yo"));
    }

    #[test]
    fn binary_frames_pass_through() {
        let payload = bytes::Bytes::from_static(&[1, 2, 3]);
        let up = client_to_upstream(ws::Message::Binary(payload.clone())).unwrap();
        assert!(matches!(&up, tungstenite::Message::Binary(b) if *b == payload));
    }

    #[test]
    fn close_frames_carry_code_and_reason() {
        let up = client_to_upstream(ws::Message::Close(Some(ws::CloseFrame {
            code: 1001,
            reason: "bye".into(),
        })))
        .unwrap();
        match up {
            tungstenite::Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason.as_str(), "bye");
            },
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn ping_pong_frames_pass_through() {
        let up = client_to_upstream(ws::Message::Ping(bytes::Bytes::from_static(b"p"))).unwrap();
        assert!(matches!(up, tungstenite::Message::Ping(_)));
        let down = upstream_to_client(tungstenite::Message::Pong(bytes::Bytes::new())).unwrap();
        assert!(matches!(down, ws::Message::Pong(_)));
    }
}
