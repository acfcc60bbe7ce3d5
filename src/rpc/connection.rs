use super::{CallArgs, FunctionTable, Handler};
use crate::error::{RpcError, TransportError};
use crate::observability::HaMetrics;
use crate::protocol::packet::{REPLY_BAD_COMMAND, REPLY_CALL_ERROR};
use crate::protocol::value::encode_names;
use crate::protocol::{server_handshake, CallEnvelope, Command, Packet, PacketCodec};
use crate::shutdown::ShutdownSignal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

static CONNECTION_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnectionState {
    Handshake,
    Authenticated,
    Closed,
}

/// Handler for a single accepted connection
pub struct Connection {
    stream: TcpStream,
    codec: PacketCodec,
    functions: Arc<FunctionTable>,
    workers: Arc<Semaphore>,
    password: Arc<str>,
    data_timeout: Duration,
    metrics: Option<Arc<HaMetrics>>,
    shutdown: ShutdownSignal,
    peer_addr: String,
    id: usize,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        functions: Arc<FunctionTable>,
        workers: Arc<Semaphore>,
        password: Arc<str>,
        data_timeout: Duration,
        metrics: Option<Arc<HaMetrics>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let peer_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream,
            codec: PacketCodec::new(8192),
            functions,
            workers,
            password,
            data_timeout,
            metrics,
            shutdown,
            peer_addr,
            id,
            state: ConnectionState::Handshake,
        }
    }

    /// Run the connection until the peer leaves, a transport error occurs or
    /// shutdown is requested.
    pub async fn handle(&mut self) -> Result<(), RpcError> {
        let result = self.run().await;
        self.state = ConnectionState::Closed;
        let _ = self.stream.shutdown().await;
        match result {
            Err(RpcError::Transport(TransportError::Closed)) => Ok(()),
            other => other,
        }
    }

    async fn run(&mut self) -> Result<(), RpcError> {
        loop {
            match self.state {
                ConnectionState::Handshake => {
                    if let Err(e) =
                        server_handshake(&mut self.stream, &self.password, self.data_timeout).await
                    {
                        if let Some(metrics) = &self.metrics {
                            if matches!(e, RpcError::AuthFailed(_)) {
                                metrics.rpc.auth_failures.inc();
                            }
                        }
                        return Err(e);
                    }
                    self.state = ConnectionState::Authenticated;
                }
                ConnectionState::Authenticated => {
                    if self.shutdown.is_shutdown() {
                        return Ok(());
                    }
                    let request = match self.read_packet().await? {
                        Some(packet) => packet,
                        None => return Ok(()),
                    };
                    let reply = self.process(request).await;
                    self.write_packet(&reply).await?;
                }
                ConnectionState::Closed => return Ok(()),
            }
        }
    }

    /// Read one packet. `Ok(None)` on clean EOF between packets.
    async fn read_packet(&mut self) -> Result<Option<Packet>, RpcError> {
        loop {
            if let Some(packet) = self.codec.parse()? {
                return Ok(Some(packet));
            }
            let fill = self.stream.read_buf(self.codec.buffer_mut());
            let read = tokio::select! {
                r = tokio::time::timeout(self.data_timeout, fill) => r,
                _ = self.shutdown.wait() => return Ok(None),
            };
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(TransportError::from(e).into()),
                Err(_) => {
                    debug!("Connection {} idle past data timeout", self.id);
                    return Err(TransportError::Timeout.into());
                }
            };
            if n == 0 {
                if self.codec.buffered() == 0 {
                    return Ok(None);
                }
                return Err(TransportError::Closed.into());
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), RpcError> {
        crate::protocol::send_packet(&mut self.stream, packet, self.data_timeout).await?;
        Ok(())
    }

    async fn process(&self, request: Packet) -> Packet {
        match Command::from_code(request.code) {
            Some(Command::FuncList) => match encode_names(&self.functions.names()) {
                Ok(body) => Packet::ok(body),
                Err(e) => Packet::error(REPLY_CALL_ERROR, e.to_string()),
            },
            Some(Command::CallFunc) => self.call_function(&request.payload).await,
            Some(Command::Auth) => Packet::error(REPLY_BAD_COMMAND, "Already authenticated"),
            None => {
                warn!(
                    "Connection {} from {} sent unknown command {}",
                    self.id, self.peer_addr, request.code
                );
                Packet::error(REPLY_BAD_COMMAND, format!("Unknown command({})", request.code))
            }
        }
    }

    async fn call_function(&self, payload: &[u8]) -> Packet {
        let envelope = match CallEnvelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                debug!("decode func args failed: {}", e);
                return Packet::error(REPLY_CALL_ERROR, "decode func args failed");
            }
        };
        let name = envelope.function_name;
        let handler = match self.functions.get(&name) {
            Some(h) => h,
            None => {
                return Packet::error(
                    REPLY_CALL_ERROR,
                    format!("Function({}) does not exist", name),
                )
            }
        };

        let permit = match self.workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Packet::error(REPLY_CALL_ERROR, "worker pool closed"),
        };
        let args = CallArgs {
            args: envelope.args,
            kwargs: envelope.kwargs,
        };
        let started = Instant::now();
        let joined = match handler {
            Handler::Blocking(f) => {
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    f(args)
                })
                .await
            }
            Handler::Async(f) => {
                let fut = f(args);
                tokio::spawn(async move {
                    let _permit = permit;
                    fut.await
                })
                .await
            }
        };

        let reply = match joined {
            Ok(Ok(value)) => match value.to_bytes() {
                Ok(body) => Packet::ok(body),
                Err(e) => Packet::error(REPLY_CALL_ERROR, e.to_string()),
            },
            Ok(Err(message)) => Packet::error(REPLY_CALL_ERROR, message),
            Err(join_err) => {
                error!("Function({}) panicked: {}", name, join_err);
                Packet::error(REPLY_CALL_ERROR, format!("Function({}) panicked", name))
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .rpc
                .record_call(&name, started.elapsed(), reply.is_ok());
        }
        reply
    }
}
