//! Shared WebSocket connection helpers
//!
//! [`connect_tls`] opens the raw TLS stream; [`WsConnector`] abstracts the
//! dial so connection tasks only see a text sink and a text stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::adapters::errors::{ExchangeError, ExchangeResult};

/// Type alias for the WebSocket stream with TLS
pub type TlsWebSocketStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ExchangeError> + Send>>;

/// Inbound text frames; ends when the peer closes.
///
/// An `InvalidResponse` item is one undecodable message and the stream goes
/// on; any other error is a transport failure.
pub type FrameStream = Pin<Box<dyn Stream<Item = ExchangeResult<String>> + Send>>;

/// Connect to a WebSocket endpoint with TLS (TLSv1.2 minimum)
pub async fn connect_tls(url: &str) -> Result<TlsWebSocketStream, ExchangeError> {
    let tls = native_tls::TlsConnector::builder()
        .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
        .build()
        .map_err(|e| ExchangeError::ConnectionFailed(format!("TLS error: {}", e)))?;

    let (ws_stream, _response) =
        connect_async_tls_with_config(url, None, false, Some(Connector::NativeTls(tls)))
            .await
            .map_err(|e| ExchangeError::WebSocket(Box::new(e)))?;

    Ok(ws_stream)
}

/// Dials a streaming endpoint
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> ExchangeResult<(FrameSink, FrameStream)>;
}

/// Production connector over `connect_tls`
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsWsConnector;

#[async_trait]
impl WsConnector for TlsWsConnector {
    async fn connect(&self, url: &str) -> ExchangeResult<(FrameSink, FrameStream)> {
        let ws = connect_tls(url).await?;
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| ExchangeError::WebSocket(Box::new(e)))
            .with(|text: String| async move { Ok::<_, ExchangeError>(Message::Text(text)) });

        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|e| ExchangeError::InvalidResponse(format!("non-UTF8 frame: {}", e))),
                ),
                Ok(Message::Close(frame)) => Some(Err(ExchangeError::ConnectionFailed(format!(
                    "closed by peer: {:?}",
                    frame
                )))),
                // Ping/Pong handled by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(ExchangeError::WebSocket(Box::new(e)))),
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
