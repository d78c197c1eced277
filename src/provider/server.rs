use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::rpc::{Message, MessageKind, ResponseError, RpcError, Transport};

use super::client::methods;
use super::{FileChange, InitConfig, Provider, ProviderError};

/// The wire-side adapter for building providers on this crate: exposes any
/// [`Provider`] implementation over the engine's RPC protocol. Each request
/// is dispatched on its own task, so a slow `evaluate` never blocks
/// `capabilities` probes.
pub struct ProviderServer {
    provider: Arc<dyn Provider>,
}

impl ProviderServer {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Serve one connection until the peer disconnects, sends `shutdown`,
    /// or the token fires.
    #[instrument(skip_all, fields(provider = %self.provider.name()))]
    pub async fn serve(
        &self,
        transport: Transport,
        cancel: CancellationToken,
    ) -> Result<(), RpcError> {
        let Transport {
            mut sender,
            mut receiver,
        } = transport;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(error) = sender.send(&message).await {
                    if !error.is_call_scoped() {
                        break;
                    }
                    warn!(%error, "dropping oversized response");
                }
            }
        });

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };
            match received {
                Ok(Some(message)) => match message.kind() {
                    MessageKind::Request => {
                        let provider = self.provider.clone();
                        let outbound = outbound_tx.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            let id = message.id.clone().unwrap_or(Value::Null);
                            let method = message.method.as_deref().unwrap_or_default().to_owned();
                            let response =
                                match dispatch(&*provider, &cancel, &method, message.params).await
                                {
                                    Ok(result) => Message::response(id, result),
                                    Err(error) => Message::error_response(
                                        id,
                                        ResponseError::internal(error.to_string()),
                                    ),
                                };
                            let _ = outbound.send(response).await;
                        });
                    }
                    MessageKind::Notification
                        if message.method.as_deref() == Some(methods::SHUTDOWN) =>
                    {
                        debug!("peer requested shutdown");
                        break;
                    }
                    MessageKind::Notification | MessageKind::Response => {}
                },
                Err(error) if error.is_call_scoped() => {
                    warn!(%error, "discarding inbound message");
                }
                Ok(None) => break,
                Err(error) => {
                    writer.abort();
                    return Err(error);
                }
            }
        }
        drop(outbound_tx);
        let _ = writer.await;
        self.provider.stop().await;
        Ok(())
    }
}

fn params_field(params: &Option<Value>, field: &str) -> Value {
    params
        .as_ref()
        .and_then(|params| params.get(field))
        .cloned()
        .unwrap_or(Value::Null)
}

fn decode_field<T: serde::de::DeserializeOwned + Default>(
    params: &Option<Value>,
    field: &str,
) -> Result<T, ProviderError> {
    match params_field(params, field) {
        Value::Null => Ok(T::default()),
        value => serde_json::from_value(value)
            .map_err(|error| ProviderError::MalformedResponse(format!("bad {field}: {error}"))),
    }
}

async fn dispatch(
    provider: &dyn Provider,
    cancel: &CancellationToken,
    method: &str,
    params: Option<Value>,
) -> Result<Value, ProviderError> {
    match method {
        methods::CAPABILITIES => Ok(json!(provider.capabilities())),
        methods::INIT => {
            let configs: Vec<InitConfig> = decode_field(&params, "configs")?;
            let result = provider.init(cancel, configs).await?;
            Ok(json!(result))
        }
        methods::EVALUATE => {
            let capability = params_field(&params, "capability");
            let capability = capability.as_str().ok_or_else(|| {
                ProviderError::MalformedResponse("evaluate without capability".to_owned())
            })?;
            let payload = params_field(&params, "payload");
            let response = provider.evaluate(cancel, capability, payload).await?;
            Ok(json!(response))
        }
        methods::DEPENDENCIES => Ok(json!(provider.get_dependencies(cancel).await?)),
        methods::DEPENDENCIES_DAG => Ok(json!(provider.get_dependencies_dag(cancel).await?)),
        methods::NOTIFY_FILE_CHANGES => {
            let changes: Vec<FileChange> = decode_field(&params, "changes")?;
            provider.notify_file_changes(cancel, changes).await?;
            Ok(Value::Null)
        }
        methods::PREPARE => {
            let conditions: Vec<Value> = decode_field(&params, "conditions")?;
            provider.prepare(cancel, conditions).await?;
            Ok(Value::Null)
        }
        other => Err(ProviderError::Evaluation(format!(
            "unsupported method {other:?}"
        ))),
    }
}
