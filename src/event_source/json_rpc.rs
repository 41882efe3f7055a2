use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use alloy::{
    primitives::U64,
    rpc::{
        json_rpc::{
            EthNotification, Id, PubSubItem, Request, Response, ResponsePayload, SubId,
        },
        types::{Filter, Header, Log},
    },
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json, value::RawValue};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::AbortHandle,
};

use crate::{
    ConnectionError,
    event_source::{ClientFactory, EventSource},
    transport::Socket,
    types::{Event, EventCallback, EventSelector, LogQuery, Subscription},
};

type ResponseSender = oneshot::Sender<Result<Box<RawValue>, ConnectionError>>;

/// Builds a [`JsonRpcClient`] over every socket the controller opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcClientFactory;

impl<S: Socket> ClientFactory<S> for JsonRpcClientFactory {
    type Client = JsonRpcClient<S>;

    fn build(
        &self,
        socket: Arc<S>,
        inbound: mpsc::UnboundedReceiver<String>,
        chain_id: Option<u64>,
    ) -> Result<Self::Client, ConnectionError> {
        Ok(JsonRpcClient::new(socket, inbound, chain_id))
    }
}

/// Ethereum JSON-RPC 2.0 client multiplexed over a single [`Socket`].
///
/// Requests are correlated by id; `eth_subscription` notifications are dispatched to the callback
/// registered for their subscription id. The client is ready once an `eth_chainId` handshake has
/// completed (and matched the expected chain id, if one was given).
///
/// A subscription becomes active in the frame reader, as soon as the `eth_subscribe` response is
/// read, so a notification following the response right away is not lost.
pub struct JsonRpcClient<S> {
    inner: Arc<Inner<S>>,
    tasks: [AbortHandle; 2],
}

struct Inner<S> {
    socket: Arc<S>,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    subscriptions: Mutex<HashMap<SubId, Subscription>>,
    expected_chain_id: Option<u64>,
    handshake: OnceLock<Result<u64, ConnectionError>>,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    requests: HashMap<u64, ResponseSender>,
    /// `eth_subscribe` requests awaiting their subscription id, by request id.
    subscribes: HashMap<u64, Subscription>,
}

impl<S: Socket> JsonRpcClient<S> {
    /// Creates the client and starts the frame reader and the chain id handshake.
    #[must_use]
    pub fn new(
        socket: Arc<S>,
        inbound: mpsc::UnboundedReceiver<String>,
        expected_chain_id: Option<u64>,
    ) -> Self {
        let inner = Arc::new(Inner {
            socket,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending::default()),
            subscriptions: Mutex::new(HashMap::new()),
            expected_chain_id,
            handshake: OnceLock::new(),
        });

        let reader = tokio::spawn(Inner::read_frames(inner.clone(), inbound));

        let handshake_inner = inner.clone();
        let handshake = tokio::spawn(async move {
            let result = handshake_inner
                .request::<U64>("eth_chainId", json!([]))
                .await
                .map(|id| id.to::<u64>());
            match &result {
                Ok(chain_id) => debug!(chain_id = chain_id, "Chain id handshake completed"),
                Err(e) => warn!(error = %e, "Chain id handshake failed"),
            }
            let _ = handshake_inner.handshake.set(result);
        });

        Self { inner, tasks: [reader.abort_handle(), handshake.abort_handle()] }
    }

    /// Chain id reported by the node, once the handshake completed.
    #[must_use]
    pub fn chain_id(&self) -> Option<u64> {
        self.inner.handshake.get().and_then(|result| result.as_ref().ok().copied())
    }

    /// Sends an arbitrary JSON-RPC request and decodes its result.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Rpc`] for error responses, [`ConnectionError::Closed`] if the
    /// socket goes away first, and [`ConnectionError::Decode`] if the result has the wrong shape.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: impl Into<Cow<'static, str>>,
        params: Value,
    ) -> Result<T, ConnectionError> {
        self.inner.request(method, params).await
    }
}

impl<S: Socket> Inner<S> {
    async fn request<T: DeserializeOwned>(
        &self,
        method: impl Into<Cow<'static, str>>,
        params: Value,
    ) -> Result<T, ConnectionError> {
        let raw = self.call(method.into(), params, None).await?;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Sends one request and waits for its raw result.
    ///
    /// With `subscription`, the request is an `eth_subscribe` whose result id activates it.
    async fn call(
        &self,
        method: Cow<'static, str>,
        params: Value,
        subscription: Option<Subscription>,
    ) -> Result<Box<RawValue>, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(ConnectionError::Closed);
            }
            pending.requests.insert(id, tx);
            if let Some(subscription) = subscription {
                pending.subscribes.insert(id, subscription);
            }
        }

        trace!(id = id, method = %method, "Sending request");
        let payload = serde_json::to_string(&Request::new(method, Id::Number(id), params))?;
        if let Err(e) = self.socket.send(payload) {
            let mut pending = self.pending.lock().await;
            pending.requests.remove(&id);
            pending.subscribes.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    async fn read_frames(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = inbound.recv().await {
            if let Err(e) = self.dispatch(&frame).await {
                warn!(error = %e, "Dropping undecodable frame");
            }
        }

        let mut pending = self.pending.lock().await;
        pending.closed = true;
        pending.subscribes.clear();
        for (_, tx) in pending.requests.drain() {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
        debug!("Frame reader stopped");
    }

    async fn dispatch(&self, frame: &str) -> Result<(), ConnectionError> {
        match serde_json::from_str::<PubSubItem>(frame)? {
            PubSubItem::Notification(notification) => self.notify(notification).await,
            PubSubItem::Response(response) => self.respond(response).await,
        }
    }

    async fn respond(&self, response: Response) -> Result<(), ConnectionError> {
        let Response { id, payload } = response;
        let Id::Number(id) = id else {
            trace!(id = %id, "Response with a foreign id");
            return Ok(());
        };

        let mut pending = self.pending.lock().await;
        let subscribe = pending.subscribes.remove(&id);
        let Some(tx) = pending.requests.remove(&id) else {
            trace!(id = id, "Response for unknown request");
            return Ok(());
        };

        let result = match payload {
            ResponsePayload::Success(raw) => {
                if let Some(subscription) = subscribe {
                    // activate before the caller resumes, notifications may already be queued
                    match serde_json::from_str::<SubId>(raw.get()) {
                        Ok(sub_id) => {
                            self.subscriptions.lock().await.insert(sub_id, subscription);
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.into()));
                            return Ok(());
                        }
                    }
                }
                Ok(raw)
            }
            ResponsePayload::Failure(error) => {
                Err(ConnectionError::Rpc { code: error.code, message: error.message.into_owned() })
            }
        };
        drop(pending);
        let _ = tx.send(result);
        Ok(())
    }

    async fn notify(&self, notification: EthNotification) -> Result<(), ConnectionError> {
        let EthNotification { subscription: sub_id, result } = notification;
        let Some(subscription) = self.subscriptions.lock().await.get(&sub_id).cloned() else {
            trace!(subscription = ?sub_id, "Notification for unknown subscription");
            return Ok(());
        };

        let event = match subscription.selector {
            EventSelector::Block => Event::from(serde_json::from_str::<Header>(result.get())?),
            EventSelector::Address(_) => Event::from(serde_json::from_str::<Log>(result.get())?),
        };
        subscription.deliver(&event);
        Ok(())
    }
}

impl<S: Socket> EventSource for JsonRpcClient<S> {
    fn is_ready(&self) -> Result<bool, ConnectionError> {
        match self.inner.handshake.get() {
            None => Ok(false),
            Some(Err(e)) => Err(e.clone()),
            Some(Ok(actual)) => match self.inner.expected_chain_id {
                Some(expected) if expected != *actual => {
                    Err(ConnectionError::ChainIdMismatch { expected, actual: *actual })
                }
                _ => Ok(true),
            },
        }
    }

    async fn get_block_number(&self) -> Result<u64, ConnectionError> {
        let number: U64 = self.inner.request("eth_blockNumber", json!([])).await?;
        Ok(number.to::<u64>())
    }

    async fn get_logs(&self, query: LogQuery) -> Result<Vec<Log>, ConnectionError> {
        let filter = serde_json::to_value(Filter::from(&query))?;
        self.inner.request("eth_getLogs", Value::Array(vec![filter])).await
    }

    async fn on(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<(), ConnectionError> {
        let params = match selector {
            EventSelector::Block => json!(["newHeads"]),
            EventSelector::Address(address) => json!(["logs", { "address": address }]),
        };
        let subscription = Subscription::new(selector, callback);
        let raw = self.inner.call("eth_subscribe".into(), params, Some(subscription)).await?;
        debug!(selector = %selector, subscription = %raw.get(), "Subscribed");
        Ok(())
    }

    async fn off(
        &self,
        selector: EventSelector,
        callback: EventCallback,
    ) -> Result<(), ConnectionError> {
        let ids: Vec<SubId> = {
            let mut subscriptions = self.inner.subscriptions.lock().await;
            let ids: Vec<SubId> = subscriptions
                .iter()
                .filter(|(_, sub)| sub.is(&selector, &callback))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                subscriptions.remove(id);
            }
            ids
        };

        for id in ids {
            let _: bool = self.inner.request("eth_unsubscribe", json!([id])).await?;
        }
        Ok(())
    }
}

impl<S> Drop for JsonRpcClient<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
