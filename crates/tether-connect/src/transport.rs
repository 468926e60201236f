//! The RPC boundary: unary `exec` calls and duplex frame streams.
//!
//! The pool, watch, lease, STM and election layers only see the traits in
//! this module; the default implementation speaks gRPC over lazy tonic
//! channels with a JSON codec (the wire schema is an opaque contract), and
//! tests substitute scripted connectors.

use crate::errors::{cast_status, ClientError};
use crate::options::HostOptions;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::Service;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::debug;

/// Per-call options resolved by the pool: the auth token to attach and the
/// request deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub token: Option<String>,
    pub deadline: Option<Duration>,
}

/// A client for one service on one host.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Executes a unary call, with the payload and response as JSON values.
    async fn exec(&self, method: &str, payload: Value, ctx: &CallContext)
        -> Result<Value, ClientError>;

    /// Opens a bidirectional frame stream.
    async fn open_duplex(
        &self,
        method: &str,
        ctx: &CallContext,
    ) -> Result<DuplexStream, ClientError>;
}

/// The write half of a duplex stream; shareable across tasks.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Value) -> Result<(), ClientError>;

    /// Half-closes the sending side.
    fn close(&self);
}

/// The read half of a duplex stream. `None` means the server closed the
/// stream gracefully.
#[async_trait]
pub trait FrameSource: Send {
    async fn next(&mut self) -> Option<Result<Value, ClientError>>;
}

/// A bidirectional stream of frames.
pub struct DuplexStream {
    pub sink: Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl DuplexStream {
    pub fn split(self) -> (Arc<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// Builds service clients for hosts. Injected so tests can substitute mock
/// transports; production uses [`GrpcConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        service: Service,
        options: &HostOptions,
    ) -> Result<Arc<dyn ServiceClient>, ClientError>;
}

/// gRPC codec carrying JSON values; the opaque-codec boundary.
#[derive(Debug, Clone, Default)]
struct JsonCodec;

struct JsonEncoder;
struct JsonDecoder;

impl Encoder for JsonEncoder {
    type Item = Value;
    type Error = Status;

    fn encode(&mut self, item: Value, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))?;
        dst.put_slice(&json);
        Ok(())
    }
}

impl Decoder for JsonDecoder {
    type Item = Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Value>, Status> {
        let buf = src.copy_to_bytes(src.remaining());
        if buf.is_empty() {
            return Ok(Some(Value::Object(Default::default())));
        }
        serde_json::from_slice(&buf)
            .map(Some)
            .map_err(|e| Status::internal(format!("failed to decode response: {e}")))
    }
}

impl Codec for JsonCodec {
    type Encode = Value;
    type Decode = Value;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

/// Default production connector: one lazy tonic channel per (host, service).
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(
        &self,
        address: &str,
        service: Service,
        options: &HostOptions,
    ) -> Result<Arc<dyn ServiceClient>, ClientError> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| ClientError::ConnectFailed(format!("invalid endpoint {address}: {e}")))?;
        if let Some(timeout) = options.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }

        debug!(address, service = %service, "creating grpc channel");
        Ok(Arc::new(GrpcServiceClient {
            service,
            channel: endpoint.connect_lazy(),
        }))
    }
}

struct GrpcServiceClient {
    service: Service,
    channel: Channel,
}

impl GrpcServiceClient {
    fn request_path(&self, method: &str) -> Result<http::uri::PathAndQuery, ClientError> {
        http::uri::PathAndQuery::from_maybe_shared(self.service.method_path(method))
            .map_err(|e| ClientError::ClientRuntime(format!("invalid method path: {e}")))
    }

    fn apply_context<T>(
        request: &mut tonic::Request<T>,
        ctx: &CallContext,
    ) -> Result<(), ClientError> {
        if let Some(token) = &ctx.token {
            let value = token
                .parse()
                .map_err(|_| ClientError::ClientRuntime("invalid auth token metadata".into()))?;
            request.metadata_mut().insert("token", value);
        }
        if let Some(deadline) = ctx.deadline {
            request.set_timeout(deadline);
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceClient for GrpcServiceClient {
    async fn exec(
        &self,
        method: &str,
        payload: Value,
        ctx: &CallContext,
    ) -> Result<Value, ClientError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        let mut request = tonic::Request::new(payload);
        Self::apply_context(&mut request, ctx)?;

        let response = grpc
            .unary(request, self.request_path(method)?, JsonCodec)
            .await
            .map_err(|status| cast_status(&status))?;
        Ok(response.into_inner())
    }

    async fn open_duplex(
        &self,
        method: &str,
        ctx: &CallContext,
    ) -> Result<DuplexStream, ClientError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Value>(16);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        Self::apply_context(&mut request, ctx)?;

        let response = grpc
            .streaming(request, self.request_path(method)?, JsonCodec)
            .await
            .map_err(|status| cast_status(&status))?;

        Ok(DuplexStream {
            sink: Arc::new(GrpcSink {
                tx: Mutex::new(Some(tx)),
            }),
            source: Box::new(GrpcSource {
                inbound: response.into_inner(),
            }),
        })
    }
}

struct GrpcSink {
    tx: Mutex<Option<mpsc::Sender<Value>>>,
}

#[async_trait]
impl FrameSink for GrpcSink {
    async fn send(&self, frame: Value) -> Result<(), ClientError> {
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ClientError::WatchStreamEnded),
            None => Err(ClientError::WatchStreamEnded),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct GrpcSource {
    inbound: tonic::Streaming<Value>,
}

#[async_trait]
impl FrameSource for GrpcSource {
    async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        match self.inbound.message().await {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(status) => Some(Err(cast_status(&status))),
        }
    }
}

/// An in-memory duplex stream backed by channels, used by tests and any
/// transport that is not natively framed.
pub struct ChannelDuplex;

impl ChannelDuplex {
    /// Returns (stream, remote outbound receiver, remote inbound sender):
    /// frames sent on the stream's sink arrive on the receiver, and values
    /// pushed into the sender arrive on the stream's source.
    #[allow(clippy::type_complexity)]
    pub fn new() -> (
        DuplexStream,
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedSender<Result<Value, ClientError>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let stream = DuplexStream {
            sink: Arc::new(ChannelSink {
                tx: Mutex::new(Some(out_tx)),
            }),
            source: Box::new(ChannelSource { rx: in_rx }),
        };
        (stream, out_rx, in_tx)
    }
}

struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, frame: Value) -> Result<(), ClientError> {
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::WatchStreamEnded),
            None => Err(ClientError::WatchStreamEnded),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Value, ClientError>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        self.rx.recv().await
    }
}
