// In-process WebSocket server for stream integration tests.

#![allow(dead_code)]

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// What the client sent on the upgrade request.
#[derive(Debug, Clone)]
pub struct Upgrade {
    pub uri: String,
    pub authorization: Option<String>,
}

pub struct WsServer {
    listener: TcpListener,
}

impl WsServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    /// `ws://` base URL for client configs.
    pub fn host(&self) -> String {
        format!("ws://{}", self.listener.local_addr().unwrap())
    }

    /// Accept one connection and capture its upgrade request.
    pub async fn accept(&self) -> (WebSocketStream<TcpStream>, Upgrade) {
        let (stream, _) = self.listener.accept().await.unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let socket = accept_hdr_async(
            stream,
            move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let upgrade = Upgrade {
                    uri: request.uri().to_string(),
                    authorization: request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(String::from),
                };
                let _ = tx.send(upgrade);
                Ok(response)
            },
        )
        .await
        .unwrap();

        // The callback ran during the handshake, so the value is ready.
        let upgrade = rx.recv().unwrap();
        (socket, upgrade)
    }
}
