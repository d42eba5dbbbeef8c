//! In-process streaming endpoint for tests and replays.
//!
//! Every `connect` on [`MemoryConnector`] yields a [`MemorySession`] on the
//! connector's session channel, in dial order. The session plays the exchange:
//! it reads what the client sent and pushes frames back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::adapters::errors::{ExchangeError, ExchangeResult};

use super::websocket::{FrameSink, FrameStream, WsConnector};

#[derive(Debug)]
pub struct MemoryConnector {
    sessions_tx: mpsc::UnboundedSender<MemorySession>,
    refuse: AtomicBool,
    stall: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemorySession>) {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions_tx,
            refuse: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, sessions_rx)
    }

    /// Refuse every dial until switched back
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Leave every dial hanging, like a handshake that never completes
    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Instants of every dial, accepted or refused
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl WsConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> ExchangeResult<(FrameSink, FrameStream)> {
        self.attempts.lock().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ExchangeError::ConnectionFailed(format!("{} refused", url)));
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ExchangeResult<String>>();

        let session = MemorySession {
            url: url.to_string(),
            outbound: out_rx,
            inbound: in_tx,
        };
        self.sessions_tx
            .send(session)
            .map_err(|_| ExchangeError::ConnectionFailed("memory endpoint gone".to_string()))?;

        let sink = futures_util::sink::unfold(out_tx, |tx, text: String| async move {
            tx.send(text)
                .map_err(|_| ExchangeError::ConnectionFailed("session closed".to_string()))?;
            Ok::<_, ExchangeError>(tx)
        });
        let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Server side of one in-memory connection
#[derive(Debug)]
pub struct MemorySession {
    pub url: String,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<ExchangeResult<String>>,
}

impl MemorySession {
    /// Push a frame to the client. False once the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(Ok(text.into())).is_ok()
    }

    /// Push a message the client cannot decode (e.g. a non-UTF-8 binary frame)
    pub fn send_undecodable(&self, reason: &str) -> bool {
        self.inbound
            .send(Err(ExchangeError::InvalidResponse(reason.to_string())))
            .is_ok()
    }

    /// Inject a transport error
    pub fn fail(&self, reason: &str) -> bool {
        self.inbound
            .send(Err(ExchangeError::ConnectionFailed(reason.to_string())))
            .is_ok()
    }

    /// Next frame the client sent
    pub async fn next_text(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_next_text(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// True once the client dropped its side
    pub fn is_client_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    /// Drop the server side; the client stream ends
    pub fn close(self) {}
}
