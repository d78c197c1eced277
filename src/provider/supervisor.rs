use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ProviderConfig;
use crate::rpc::{
    Connection, ConnectionHandlers, ConnectionOptions, GrpcTransport, PipeTransport,
    StdioTransport, Transport,
};

use super::client::methods;
use super::{BackoffPolicy, BackoffTable, Capability, ProviderError, RpcProvider};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Pipe,
    Grpc,
}

#[derive(Builder, Clone)]
#[builder(default, setter(into))]
pub struct SupervisorOptions {
    pub startup_deadline: Duration,
    pub poll_interval: Duration,
    pub connection: ConnectionOptions,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            connection: ConnectionOptions::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Owns one provider's process and startup state. `start` either dials a
/// configured address or spawns the binary, then polls `capabilities` until
/// the provider advertises a non-empty set or the startup deadline passes.
pub struct Supervisor {
    config: ProviderConfig,
    options: SupervisorOptions,
    child: Mutex<Option<Child>>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl Supervisor {
    pub fn new(config: ProviderConfig, options: SupervisorOptions) -> Self {
        Self {
            config,
            options,
            child: Mutex::new(None),
            socket_path: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip_all, fields(provider = %self.config.name))]
    pub async fn start(
        &self,
        handlers: ConnectionHandlers,
    ) -> Result<Arc<RpcProvider>, ProviderError> {
        let transport = self.open_transport().await?;
        self.start_with_transport(transport, handlers, false).await
    }

    /// Attach a pre-established channel (an in-process provider or a test
    /// harness). With `assume_works` the capability probe is skipped and the
    /// provider reports every capability as supported.
    pub async fn start_with_transport(
        &self,
        transport: Transport,
        handlers: ConnectionHandlers,
        assume_works: bool,
    ) -> Result<Arc<RpcProvider>, ProviderError> {
        let connection = Connection::with_options(
            transport,
            handlers,
            self.options.connection.clone(),
        );
        let capabilities = if assume_works {
            Vec::new()
        } else {
            self.await_capabilities(&connection).await?
        };
        info!(
            capabilities = capabilities.len(),
            assume_works, "provider started"
        );
        Ok(Arc::new(RpcProvider::new(
            self.config.name.clone(),
            connection,
            capabilities,
            assume_works,
            BackoffTable::new(self.options.backoff),
        )))
    }

    async fn open_transport(&self) -> Result<Transport, ProviderError> {
        let max_size = self.options.connection.max_message_size;
        match (&self.config.address, &self.config.binary_path) {
            (Some(address), _) => match self.config.transport {
                TransportKind::Grpc => GrpcTransport::connect(address, max_size)
                    .await
                    .map_err(|error| ProviderError::Startup(error.to_string())),
                TransportKind::Pipe => {
                    PipeTransport::connect(std::path::Path::new(address), max_size)
                        .await
                        .map_err(|error| ProviderError::Startup(error.to_string()))
                }
                TransportKind::Stdio => Err(ProviderError::Startup(
                    "stdio transport cannot dial an address".to_owned(),
                )),
            },
            (None, Some(binary)) => match self.config.transport {
                TransportKind::Stdio => {
                    let mut child = self.spawn(binary, &[])?;
                    let transport = StdioTransport::from_child(&mut child, max_size)
                        .map_err(|error| ProviderError::Startup(error.to_string()))?;
                    *self.child.lock().await = Some(child);
                    Ok(transport)
                }
                TransportKind::Pipe => {
                    let socket = socket_path_for(&self.config.name);
                    let child = self.spawn(
                        binary,
                        &["--address".to_owned(), socket.display().to_string()],
                    )?;
                    *self.child.lock().await = Some(child);
                    *self.socket_path.lock().await = Some(socket.clone());
                    self.dial_until_ready(|| async {
                        PipeTransport::connect(&socket, max_size).await
                    })
                    .await
                }
                TransportKind::Grpc => {
                    let port = free_local_port()?;
                    let child =
                        self.spawn(binary, &["--port".to_owned(), port.to_string()])?;
                    *self.child.lock().await = Some(child);
                    let address = format!("http://127.0.0.1:{port}");
                    self.dial_until_ready(|| async {
                        GrpcTransport::connect(&address, max_size).await
                    })
                    .await
                }
            },
            (None, None) => Err(ProviderError::Startup(format!(
                "provider {:?} has neither an address nor a binary path",
                self.config.name
            ))),
        }
    }

    fn spawn(&self, binary: &PathBuf, extra_args: &[String]) -> Result<Child, ProviderError> {
        let mut command = Command::new(binary);
        command
            .args(&self.config.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|error| {
            ProviderError::Startup(format!(
                "failed to spawn {:?} for provider {:?}: {error}",
                binary, self.config.name
            ))
        })?;
        if let Some(stderr) = child.stderr.take() {
            let provider = self.config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "{line}");
                }
            });
        }
        Ok(child)
    }

    async fn dial_until_ready<F, Fut>(&self, mut dial: F) -> Result<Transport, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Transport, crate::rpc::RpcError>>,
    {
        let deadline = tokio::time::Instant::now() + self.options.startup_deadline;
        loop {
            match dial().await {
                Ok(transport) => return Ok(transport),
                Err(error) if tokio::time::Instant::now() >= deadline => {
                    self.kill_child().await;
                    return Err(ProviderError::Startup(format!(
                        "could not reach provider {:?} before the startup deadline: {error}",
                        self.config.name
                    )));
                }
                Err(error) => {
                    debug!(provider = %self.config.name, %error, "dial failed, retrying");
                    tokio::time::sleep(self.options.poll_interval).await;
                }
            }
        }
    }

    /// Failure to advertise at least one capability within the deadline is a
    /// fatal startup error.
    async fn await_capabilities(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<Vec<Capability>, ProviderError> {
        let deadline = tokio::time::Instant::now() + self.options.startup_deadline;
        loop {
            match connection.request(methods::CAPABILITIES, None).await {
                Ok(Value::Array(entries)) if !entries.is_empty() => {
                    return serde_json::from_value(Value::Array(entries)).map_err(|error| {
                        ProviderError::MalformedResponse(format!(
                            "capability list did not decode: {error}"
                        ))
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(provider = %self.config.name, %error, "capability probe failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.kill_child().await;
                return Err(ProviderError::CapabilityDeadline(
                    self.options.startup_deadline,
                ));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Kill any owned process and remove temp state. Idempotent.
    pub async fn stop(&self) {
        self.kill_child().await;
        if let Some(socket) = self.socket_path.lock().await.take() {
            if let Err(error) = std::fs::remove_file(&socket) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(socket = %socket.display(), %error, "socket cleanup failed");
                }
            }
        }
    }

    async fn kill_child(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(error) = child.kill().await {
                warn!(provider = %self.config.name, %error, "kill failed");
            }
        }
    }
}

fn socket_path_for(provider: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lsp-lint-{provider}-{}.sock", std::process::id()))
}

fn free_local_port() -> Result<u16, ProviderError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|error| ProviderError::Startup(format!("no free local port: {error}")))?;
    let port = listener
        .local_addr()
        .map_err(|error| ProviderError::Startup(error.to_string()))?
        .port();
    Ok(port)
}
