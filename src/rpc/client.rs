use crate::error::{RpcError, TransportError};
use crate::protocol::packet::{CMD_CALL_FUNC, CMD_FUNC_LIST, REPLY_OK};
use crate::protocol::value::decode_names;
use crate::protocol::{client_handshake, recv_packet, send_packet, CallEnvelope, Packet, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

const BUSY_MESSAGE: &str = "Previous async task is running, please wait for it to complete";

/// Client connection settings
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub conn_timeout: Duration,
    pub data_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            conn_timeout: Duration::from_secs(10),
            data_timeout: Duration::from_secs(300),
        }
    }
}

struct Link {
    stream: Mutex<Option<TcpStream>>,
    busy: AtomicBool,
    broken: AtomicBool,
    data_timeout: Duration,
}

impl Link {
    /// Claim the single call slot
    fn begin(self: &Arc<Self>) -> Result<CallSlot, RpcError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcError::Async(BUSY_MESSAGE.to_string()));
        }
        Ok(CallSlot {
            link: Arc::clone(self),
        })
    }

    async fn exchange(&self, request: Packet) -> Result<Packet, RpcError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::Closed)?;
        let result = async {
            send_packet(stream, &request, self.data_timeout).await?;
            recv_packet(stream, self.data_timeout).await
        }
        .await;
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.broken.store(true, Ordering::Release);
                *guard = None;
                Err(e.into())
            }
        }
    }
}

/// Held for the duration of one call; frees the slot on drop.
struct CallSlot {
    link: Arc<Link>,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        self.link.busy.store(false, Ordering::Release);
    }
}

/// Client for one authenticated connection
pub struct RpcClient {
    addr: String,
    link: Arc<Link>,
    functions: Vec<String>,
}

impl RpcClient {
    /// Connect, authenticate, then fetch the remote function list.
    pub async fn connect(
        addr: &str,
        password: &str,
        options: ClientOptions,
    ) -> Result<Self, RpcError> {
        let mut stream = tokio::time::timeout(options.conn_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)?;
        let _ = stream.set_nodelay(true);
        client_handshake(&mut stream, password, options.data_timeout).await?;

        let link = Arc::new(Link {
            stream: Mutex::new(Some(stream)),
            busy: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            data_timeout: options.data_timeout,
        });
        let mut client = Self {
            addr: addr.to_string(),
            link,
            functions: Vec::new(),
        };
        client.functions = client.list_functions().await?;
        debug!(
            "Connected to {} ({} remote functions)",
            addr,
            client.functions.len()
        );
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Names learned from `FUNC_LIST` at connect time
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }

    /// True once a transport error or an abandoned async call made the
    /// connection unusable.
    pub fn is_broken(&self) -> bool {
        self.link.broken.load(Ordering::Acquire)
    }

    pub async fn list_functions(&self) -> Result<Vec<String>, RpcError> {
        let _slot = self.link.begin()?;
        let reply = self
            .link
            .exchange(Packet::new(CMD_FUNC_LIST, Bytes::new()))
            .await?;
        let body = check_reply(reply)?;
        decode_names(&body)
    }

    /// Synchronous call: returns once the reply arrived.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, RpcError> {
        let _slot = self.link.begin()?;
        let request = call_packet(name, args, kwargs)?;
        let reply = self.link.exchange(request).await?;
        Value::from_bytes(&check_reply(reply)?)
    }

    /// Positional-only convenience wrapper around [`RpcClient::call`]
    pub async fn call_args(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(name, args, BTreeMap::new()).await
    }

    /// Start a call in the background. The connection stays reserved until
    /// the result is collected or abandoned.
    pub fn call_async(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<AsyncCall, RpcError> {
        let slot = self.link.begin()?;
        let request = call_packet(name, args, kwargs)?;
        let link = Arc::clone(&self.link);
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let result = match link.exchange(request).await {
                Ok(reply) => check_reply(reply).and_then(|body| Value::from_bytes(&body)),
                Err(e) => Err(e),
            };
            let _ = tx.send(result);
        });
        Ok(AsyncCall {
            rx,
            handle,
            link: Arc::clone(&self.link),
        })
    }

    pub async fn close(&self) {
        let mut guard = self.link.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
        self.link.broken.store(true, Ordering::Release);
    }
}

/// Pending result of [`RpcClient::call_async`]
pub struct AsyncCall {
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    handle: JoinHandle<()>,
    link: Arc<Link>,
}

impl AsyncCall {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result. On expiry the background call is aborted and the
    /// connection is marked broken, since its framing can no longer be trusted.
    pub async fn get(mut self, timeout: Option<Duration>) -> Result<Value, RpcError> {
        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, &mut self.rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.link.broken.store(true, Ordering::Release);
                    self.handle.abort();
                    return Err(RpcError::CsuTimeout);
                }
            },
            None => (&mut self.rx).await,
        };
        outcome.unwrap_or_else(|_| Err(RpcError::Async("async call worker exited".to_string())))
    }
}

fn call_packet(
    name: &str,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
) -> Result<Packet, RpcError> {
    let envelope = CallEnvelope {
        function_name: name.to_string(),
        args,
        kwargs,
    };
    Ok(Packet::new(CMD_CALL_FUNC, envelope.encode()?))
}

fn check_reply(reply: Packet) -> Result<Bytes, RpcError> {
    match reply.code {
        REPLY_OK => Ok(reply.payload),
        code if code > 0 => Err(RpcError::Call {
            code,
            message: reply.message(),
        }),
        code => Err(RpcError::Protocol {
            code,
            message: reply.message(),
        }),
    }
}
