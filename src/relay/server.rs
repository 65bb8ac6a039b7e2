//! WebSocket push transport. Every connection is a relay subscriber and may
//! also send JSON control requests; replies go back to that connection only.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use super::{ChunkRelay, RelayFrame};
use crate::devices::list_devices;
use crate::error::Error;
use crate::external::ExternalCommand;
use crate::protocol::{ClientRequest, ServerEvent};
use crate::screen::capture::ScreenCapturer;
use crate::screen::ScreenshotOutput;
use crate::stream::manager::ChunkSink;
use crate::stream::{StreamManager, StreamStatus};

/// Encoder chunks buffered between the encoder pump and the relay.
const CHUNK_BUFFER: usize = 64;

pub struct CastServer {
    addr: String,
    manager: StreamManager,
    capturer: ScreenCapturer,
    binary_chunks: bool,
    autostart: bool,
}

impl CastServer {
    pub fn new(addr: String, manager: StreamManager, capturer: ScreenCapturer) -> Self {
        Self {
            addr,
            manager,
            capturer,
            binary_chunks: false,
            autostart: false,
        }
    }

    /// Send video chunks as raw binary messages instead of JSON frames.
    pub fn binary_chunks(mut self, enabled: bool) -> Self {
        self.binary_chunks = enabled;
        self
    }

    /// Start the stream as soon as the server is up.
    pub fn autostart(mut self, enabled: bool) -> Self {
        self.autostart = enabled;
        self
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        info!("Listening on ws://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let relay = ChunkRelay::new();
        let (sink, chunks) = mpsc::channel(CHUNK_BUFFER);
        let status = self.manager.subscribe_status();

        tokio::spawn(pump_chunks(chunks, relay.clone()));
        tokio::spawn(broadcast_status(status.clone(), relay.clone()));

        let shared = Arc::new(Shared {
            relay,
            encoder: self.manager.encoder().clone(),
            manager: Mutex::new(self.manager),
            capturer: self.capturer,
            sink,
            status,
            binary_chunks: self.binary_chunks,
        });

        if self.autostart {
            if let Err(e) = shared.manager.lock().await.start(shared.sink.clone()).await {
                warn!("Autostart failed: {}", e);
            }
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Connection from {}", peer);

            let shared = shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, shared).await {
                    let err_str = e.to_string();
                    // Plain HTTP probes and scanners
                    if !err_str.contains("Connection: upgrade") && !err_str.contains("protocol error")
                    {
                        warn!("Connection error from {}: {}", peer, e);
                    }
                }
            });
        }
    }
}

struct Shared {
    relay: ChunkRelay,
    encoder: ExternalCommand,
    manager: Mutex<StreamManager>,
    capturer: ScreenCapturer,
    sink: ChunkSink,
    status: watch::Receiver<StreamStatus>,
    binary_chunks: bool,
}

impl Shared {
    async fn handle(&self, request: ClientRequest) -> Option<ServerEvent> {
        debug!("Request: {:?}", request);
        match request {
            ClientRequest::StartStream => {
                let mut manager = self.manager.lock().await;
                Some(match manager.start(self.sink.clone()).await {
                    Ok(()) => ServerEvent::status(&manager.status()),
                    Err(e) => report(&e),
                })
            }
            ClientRequest::StopStream => {
                let mut manager = self.manager.lock().await;
                manager.stop().await;
                Some(ServerEvent::status(&manager.status()))
            }
            ClientRequest::StreamStatus => {
                let status = self.status.borrow().clone();
                Some(ServerEvent::status(&status))
            }
            ClientRequest::Screenshot { region } => {
                let region = match region.map(|r| r.to_region()).transpose() {
                    Ok(region) => region,
                    Err(e) => return Some(report(&e)),
                };
                match self
                    .capturer
                    .capture_screenshot(region, &ScreenshotOutput::Memory)
                    .await
                {
                    Ok(shot) => ServerEvent::screenshot(&shot),
                    Err(e) => Some(report(&e)),
                }
            }
            ClientRequest::ListDevices => Some(match list_devices(&self.encoder).await {
                Ok(devices) => ServerEvent::Devices { devices },
                Err(e) => report(&e),
            }),
        }
    }
}

fn report(e: &Error) -> ServerEvent {
    if e.is_client_error() {
        debug!("Rejected request: {}", e);
    } else {
        warn!("Request failed: {}", e);
    }
    ServerEvent::error(e)
}

async fn pump_chunks(mut chunks: mpsc::Receiver<Bytes>, relay: ChunkRelay) {
    while let Some(chunk) = chunks.recv().await {
        relay.broadcast_chunk(chunk).await;
    }
}

async fn broadcast_status(mut status: watch::Receiver<StreamStatus>, relay: ChunkRelay) {
    while status.changed().await.is_ok() {
        let event = ServerEvent::status(&status.borrow_and_update());
        relay.broadcast_event(event).await;
    }
}

fn to_ws_message(frame: RelayFrame, binary_chunks: bool) -> WsMessage {
    match frame {
        RelayFrame::Chunk { data, .. } if binary_chunks => WsMessage::Binary(data.to_vec()),
        RelayFrame::Chunk { seq, data } => {
            WsMessage::Text(ServerEvent::video_chunk(seq, &data).to_json())
        }
        RelayFrame::Event(event) => WsMessage::Text(event.to_json()),
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (id, mut frames) = shared.relay.subscribe().await;
    info!(
        "Subscriber {} connected ({} total)",
        id,
        shared.relay.subscriber_count().await
    );
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<ServerEvent>();
    let binary_chunks = shared.binary_chunks;

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(frame) = frames.recv() => to_ws_message(frame, binary_chunks),
                Some(event) = replies.recv() => WsMessage::Text(event.to_json()),
                else => break,
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = reply_tx.send(ServerEvent::status(&shared.status.borrow()));

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let reply = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => shared.handle(request).await,
                    Err(e) => Some(ServerEvent::bad_request(e.to_string())),
                };
                if let Some(reply) = reply {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    shared.relay.unsubscribe(id).await;
    send_task.abort();
    debug!("Subscriber {} disconnected", id);
    Ok(())
}
