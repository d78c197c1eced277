use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use derive_builder::Builder;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Message, MessageKind, ResponseError, RpcError, Transport, DEFAULT_MAX_MESSAGE_SIZE};

pub type NotificationHandler = Box<dyn Fn(&str, Option<Value>) + Send + Sync>;
pub type RequestHandler =
    Box<dyn Fn(&str, Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;

/// Inbound-message handlers registered before the connection starts
/// pumping. Both default to benign behavior: notifications are dropped with
/// a trace event, requests are answered with method-not-found.
#[derive(Default)]
pub struct ConnectionHandlers {
    pub on_notification: Option<NotificationHandler>,
    pub on_request: Option<RequestHandler>,
}

#[derive(Builder, Clone)]
#[builder(default, setter(into))]
pub struct ConnectionOptions {
    pub max_message_size: usize,
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One duplex JSON-RPC connection. Requests from concurrent callers are
/// multiplexed over the transport by id; inbound notifications are handed to
/// the registered handler on a dedicated dispatcher task so a chatty remote
/// never blocks the read loop.
pub struct Connection {
    outbound: mpsc::Sender<Message>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Message, RpcError>>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    options: ConnectionOptions,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(transport: Transport, handlers: ConnectionHandlers) -> Arc<Self> {
        Self::with_options(transport, handlers, ConnectionOptions::default())
    }

    pub fn with_options(
        transport: Transport,
        handlers: ConnectionHandlers,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let Transport {
            mut sender,
            mut receiver,
        } = transport;
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let pending: Arc<DashMap<u64, oneshot::Sender<Result<Message, RpcError>>>> =
            Default::default();
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let connection = Arc::new(Self {
            outbound: outbound_tx.clone(),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            alive: alive.clone(),
            options,
            shutdown: shutdown.clone(),
        });

        // Writer: the single owner of the transport's send half.
        let writer_alive = alive.clone();
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                if let Err(error) = sender.send(&message).await {
                    if error.is_call_scoped() {
                        warn!(%error, "dropping outbound message");
                        continue;
                    }
                    debug!(%error, "write half failed, closing connection");
                    writer_alive.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        // Notification dispatcher: decouples handler latency from the
        // read loop.
        let ConnectionHandlers {
            on_notification,
            on_request,
        } = handlers;
        let (notification_tx, mut notification_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = notification_rx.recv().await {
                let method = message.method.as_deref().unwrap_or_default();
                match &on_notification {
                    Some(handler) => handler(method, message.params),
                    None => trace!(method, "ignoring notification"),
                }
            }
        });

        // Reader: routes responses to pending calls, notifications to the
        // dispatcher, and answers inbound requests.
        let reader_pending = pending;
        let reader_alive = alive;
        let reader_outbound = outbound_tx;
        let reader_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(Some(message)) => match message.kind() {
                        MessageKind::Response => {
                            let id = message.id.as_ref().and_then(Value::as_u64);
                            match id.and_then(|id| reader_pending.remove(&id)) {
                                Some((_, reply)) => {
                                    let _ = reply.send(Ok(message));
                                }
                                None => trace!(?id, "response for unknown call"),
                            }
                        }
                        MessageKind::Notification => {
                            let _ = notification_tx.send(message);
                        }
                        MessageKind::Request => {
                            let id = message.id.clone().unwrap_or(Value::Null);
                            let method = message.method.as_deref().unwrap_or_default();
                            let response = match &on_request {
                                Some(handler) => match handler(method, message.params) {
                                    Ok(result) => Message::response(id, result),
                                    Err(error) => Message::error_response(id, error),
                                },
                                None => Message::error_response(
                                    id,
                                    ResponseError::method_not_found(method),
                                ),
                            };
                            if reader_outbound.send(response).await.is_err() {
                                break;
                            }
                        }
                    },
                    Err(error) if error.is_call_scoped() => {
                        // e.g. an oversized inbound body: the frame was
                        // drained, the stream is still aligned. The call it
                        // belonged to resolves via its timeout.
                        warn!(%error, "discarding inbound message");
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            // In-flight calls unblock with a transport error.
            let ids: Vec<u64> = reader_pending.iter().map(|entry| *entry.key()).collect();
            for id in ids {
                if let Some((_, reply)) = reader_pending.remove(&id) {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                }
            }
        });

        connection
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.is_alive() {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::request(id, method, params);
        self.check_outbound_size(&message)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        if self.outbound.send(message).await.is_err() {
            self.pending.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(RpcError::Cancelled),
            outcome = tokio::time::timeout(timeout, reply_rx) => match outcome {
                Err(_) => Err(RpcError::Timeout),
                Ok(Err(_)) => Err(RpcError::ConnectionClosed),
                Ok(Ok(result)) => result,
            },
        };
        if outcome.is_err() {
            self.pending.remove(&id);
        }
        let response = outcome?;
        match response.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if !self.is_alive() {
            return Err(RpcError::ConnectionClosed);
        }
        let message = Message::notification(method, params);
        self.check_outbound_size(&message)?;
        self.outbound
            .send(message)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Stop both pump tasks and fail any in-flight calls.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(RpcError::ConnectionClosed));
            }
        }
    }

    fn check_outbound_size(&self, message: &Message) -> Result<(), RpcError> {
        let size = serde_json::to_vec(message)?.len();
        if size > self.options.max_message_size {
            return Err(RpcError::MessageTooLarge {
                size,
                limit: self.options.max_message_size,
            });
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::super::StdioTransport;
    use super::*;

    fn connected_pair(
        handlers_a: ConnectionHandlers,
        handlers_b: ConnectionHandlers,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let conn_a = Connection::new(
            StdioTransport::from_pair(a_read, a_write, DEFAULT_MAX_MESSAGE_SIZE),
            handlers_a,
        );
        let conn_b = Connection::new(
            StdioTransport::from_pair(b_read, b_write, DEFAULT_MAX_MESSAGE_SIZE),
            handlers_b,
        );
        (conn_a, conn_b)
    }

    fn echo_handlers() -> ConnectionHandlers {
        ConnectionHandlers {
            on_notification: None,
            on_request: Some(Box::new(|method, params| {
                Ok(json!({"method": method, "params": params}))
            })),
        }
    }

    #[tokio::test]
    async fn concurrent_in_flight_calls_keep_their_ids() {
        let (client, _server) = connected_pair(Default::default(), echo_handlers());

        let calls = (0..10).map(|n| {
            let client = client.clone();
            async move {
                client
                    .request("echo", Some(json!({"n": n})))
                    .await
                    .unwrap()
            }
        });
        let results = futures::future::join_all(calls).await;
        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result["params"]["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn notifications_reach_the_handler() {
        let seen: Arc<Mutex<Vec<String>>> = Default::default();
        let seen_in_handler = seen.clone();
        let handlers = ConnectionHandlers {
            on_notification: Some(Box::new(move |method, _| {
                seen_in_handler.lock().unwrap().push(method.to_owned());
            })),
            on_request: None,
        };
        let (client, server) = connected_pair(Default::default(), handlers);

        client.notify("one", None).await.unwrap();
        client.notify("two", None).await.unwrap();
        // a request forces a full round trip, ordering the notifications
        // before it on the server side
        let _ = server.request("ping", None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn dropped_peer_unblocks_in_flight_calls() {
        let (client, server) = connected_pair(Default::default(), Default::default());
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request("hang", None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn oversized_request_fails_only_that_call() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let client = Connection::with_options(
            StdioTransport::from_pair(a_read, a_write, DEFAULT_MAX_MESSAGE_SIZE),
            Default::default(),
            ConnectionOptionsBuilder::default()
                .max_message_size(256usize)
                .build()
                .unwrap(),
        );
        let _server = Connection::new(
            StdioTransport::from_pair(b_read, b_write, DEFAULT_MAX_MESSAGE_SIZE),
            echo_handlers(),
        );

        let err = client
            .request("big", Some(json!({"blob": "x".repeat(1024)})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MessageTooLarge { .. }));

        let ok = client.request("small", None).await.unwrap();
        assert_eq!(ok["method"], json!("small"));
    }
}
