use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::proto::provider_rpc_client::ProviderRpcClient;
use super::proto::Frame;
use super::{codec, Message, RpcError};

#[async_trait]
pub trait MessageSender: Send {
    async fn send(&mut self, message: &Message) -> Result<(), RpcError>;
}

#[async_trait]
pub trait MessageReceiver: Send {
    async fn recv(&mut self) -> Result<Option<Message>, RpcError>;
}

/// A duplex message channel to one provider. The three concrete transports
/// (child-process stdio, named pipe, gRPC stream) all reduce to this pair.
pub struct Transport {
    pub sender: Box<dyn MessageSender>,
    pub receiver: Box<dyn MessageReceiver>,
}

struct WriteSender<W> {
    writer: W,
    max_size: usize,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSender for WriteSender<W> {
    async fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        codec::write_message(&mut self.writer, message, self.max_size).await
    }
}

struct ReadReceiver<R> {
    reader: R,
    max_size: usize,
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageReceiver for ReadReceiver<R> {
    async fn recv(&mut self) -> Result<Option<Message>, RpcError> {
        codec::read_message(&mut self.reader, self.max_size).await
    }
}

pub struct StdioTransport;

impl StdioTransport {
    /// Take over a spawned child's stdin/stdout as the message channel.
    pub fn from_child(child: &mut Child, max_size: usize) -> Result<Transport, RpcError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Transport("child stdin not piped".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Transport("child stdout not piped".to_owned()))?;
        Ok(Transport {
            sender: Box::new(WriteSender {
                writer: stdin,
                max_size,
            }),
            receiver: Box::new(ReadReceiver {
                reader: BufReader::new(stdout),
                max_size,
            }),
        })
    }

    /// Wrap an arbitrary read/write pair. Used for pre-established channels
    /// (in-process providers) and by tests over `tokio::io::duplex`.
    pub fn from_pair<R, W>(reader: R, writer: W, max_size: usize) -> Transport
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Transport {
            sender: Box::new(WriteSender {
                writer,
                max_size,
            }),
            receiver: Box::new(ReadReceiver {
                reader: BufReader::new(reader),
                max_size,
            }),
        }
    }
}

pub struct PipeTransport;

impl PipeTransport {
    /// Connect to a provider listening on a local named pipe (a unix domain
    /// socket on this platform).
    #[cfg(unix)]
    pub async fn connect(path: &std::path::Path, max_size: usize) -> Result<Transport, RpcError> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Transport {
            sender: Box::new(WriteSender {
                writer: write_half,
                max_size,
            }),
            receiver: Box::new(ReadReceiver {
                reader: BufReader::new(read_half),
                max_size,
            }),
        })
    }

    #[cfg(not(unix))]
    pub async fn connect(path: &std::path::Path, _max_size: usize) -> Result<Transport, RpcError> {
        Err(RpcError::Transport(format!(
            "named pipe transport is not supported on this platform: {}",
            path.display()
        )))
    }
}

pub struct GrpcTransport;

impl GrpcTransport {
    /// Open a bidirectional `Session` stream to a provider's gRPC endpoint.
    /// Each gRPC frame carries exactly one JSON-RPC message, so the stream
    /// exposes the same duplex interface as the byte transports.
    pub async fn connect(address: &str, max_size: usize) -> Result<Transport, RpcError> {
        let endpoint = tonic::transport::Endpoint::from_shared(address.to_owned())
            .map_err(|error| RpcError::Transport(error.to_string()))?
            .http2_keep_alive_interval(std::time::Duration::from_secs(30))
            .keep_alive_timeout(std::time::Duration::from_secs(120));
        let channel = endpoint
            .connect()
            .await
            .map_err(|error| RpcError::Transport(error.to_string()))?;
        let mut client = ProviderRpcClient::new(channel);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(32);
        let inbound = client
            .session(ReceiverStream::new(outbound_rx))
            .await
            .map_err(|status| RpcError::Transport(status.to_string()))?
            .into_inner();

        Ok(Transport {
            sender: Box::new(GrpcSender {
                outbound: outbound_tx,
                max_size,
            }),
            receiver: Box::new(GrpcReceiver { inbound, max_size }),
        })
    }
}

struct GrpcSender {
    outbound: mpsc::Sender<Frame>,
    max_size: usize,
}

#[async_trait]
impl MessageSender for GrpcSender {
    async fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > self.max_size {
            return Err(RpcError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_size,
            });
        }
        self.outbound
            .send(Frame { payload })
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

struct GrpcReceiver {
    inbound: tonic::Streaming<Frame>,
    max_size: usize,
}

#[async_trait]
impl MessageReceiver for GrpcReceiver {
    async fn recv(&mut self) -> Result<Option<Message>, RpcError> {
        let frame = self
            .inbound
            .message()
            .await
            .map_err(|status| RpcError::Transport(status.to_string()))?;
        match frame {
            None => Ok(None),
            Some(frame) if frame.payload.len() > self.max_size => Err(RpcError::MessageTooLarge {
                size: frame.payload.len(),
                limit: self.max_size,
            }),
            Some(frame) => Ok(Some(serde_json::from_slice(&frame.payload)?)),
        }
    }
}
