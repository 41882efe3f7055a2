use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU8, Ordering},
};

use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::AbortHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    ConnectionError,
    transport::{Connection, ReadyState, Socket, SocketEvent, Transport},
};

/// [`Transport`] over `tokio-tungstenite` WebSockets (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    type Socket = WsSocket;

    async fn open(&self, endpoint: &str) -> Result<Connection<WsSocket>, ConnectionError> {
        debug!(endpoint = endpoint, "Opening WebSocket");
        let (stream, response) = connect_async(endpoint).await?;
        debug!(status = ?response.status(), "WebSocket handshake completed");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ReadyState::Open.as_u8()),
            outbound: outbound_tx,
            events: events_tx,
            tasks: OnceLock::new(),
        });

        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    writer_shared.fail(e.to_string());
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).is_err() {
                            trace!("Inbound receiver dropped, discarding frame");
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        let _ = reader_shared.events.send(SocketEvent::Pong);
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, "closed by peer".to_owned()));
                        reader_shared.finish(code, reason);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reader_shared.fail(e.to_string());
                        return;
                    }
                }
            }
            reader_shared.finish(None, "stream ended".to_owned());
        });

        let _ = shared.tasks.set([reader.abort_handle(), writer.abort_handle()]);

        Ok(Connection {
            socket: Arc::new(WsSocket { shared }),
            events: events_rx,
            inbound: inbound_rx,
        })
    }
}

/// A WebSocket opened by [`WsTransport`].
#[derive(Debug)]
pub struct WsSocket {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<SocketEvent>,
    tasks: OnceLock<[AbortHandle; 2]>,
}

impl Shared {
    fn is_open(&self) -> bool {
        ReadyState::from_u8(self.state.load(Ordering::Acquire)) == ReadyState::Open
    }

    fn fail(&self, error: String) {
        let _ = self.events.send(SocketEvent::Error(error.clone()));
        self.finish(None, error);
    }

    /// Moves to `Closed` and emits the close event. Only the first caller wins.
    fn finish(&self, code: Option<u16>, reason: String) -> bool {
        let previous = self.state.swap(ReadyState::Closed.as_u8(), Ordering::AcqRel);
        if ReadyState::from_u8(previous) == ReadyState::Closed {
            return false;
        }
        let _ = self.events.send(SocketEvent::Close { code, reason });
        true
    }

    fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.outbound.send(message).map_err(|_| ConnectionError::Closed)
    }
}

impl Socket for WsSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn send(&self, text: String) -> Result<(), ConnectionError> {
        self.shared.send(Message::Text(text.into()))
    }

    fn ping(&self) -> Result<(), ConnectionError> {
        self.shared.send(Message::Ping(Vec::new().into()))
    }

    fn terminate(&self) {
        if self.shared.finish(None, "terminated".to_owned()) {
            debug!("WebSocket terminated");
        }
        if let Some(tasks) = self.shared.tasks.get() {
            for task in tasks {
                task.abort();
            }
        }
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        self.terminate();
    }
}
