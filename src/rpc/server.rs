use super::connection::Connection;
use super::FunctionTable;
use crate::error::Result;
use crate::observability::HaMetrics;
use crate::shutdown::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info};

pub const DEFAULT_WORKERS: usize = 30;
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Authenticated RPC server
pub struct RpcServer {
    addr: String,
    password: Arc<str>,
    functions: Arc<FunctionTable>,
    workers: Arc<Semaphore>,
    data_timeout: Duration,
    metrics: Arc<HaMetrics>,
    shutdown: ShutdownSignal,
}

impl RpcServer {
    pub fn new(addr: impl Into<String>, password: &str, functions: FunctionTable) -> Self {
        Self {
            addr: addr.into(),
            password: Arc::from(password),
            functions: Arc::new(functions),
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
            data_timeout: DEFAULT_DATA_TIMEOUT,
            metrics: Arc::new(HaMetrics::new()),
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Bound the number of handler bodies running at once
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HaMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn metrics(&self) -> Arc<HaMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.names()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("pgha rpc server listening on {}", self.addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = shutdown.wait() => break,
            };
            match accepted {
                Ok((stream, addr)) => self.spawn_connection(stream, addr),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!("rpc server on {} stopped accepting", self.addr);
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        info!("New connection from: {}", addr);
        let _ = stream.set_nodelay(true);
        self.metrics.rpc.record_connection();

        let metrics = Arc::clone(&self.metrics);
        let mut conn = Connection::new(
            stream,
            Arc::clone(&self.functions),
            Arc::clone(&self.workers),
            Arc::clone(&self.password),
            self.data_timeout,
            Some(Arc::clone(&metrics)),
            self.shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = conn.handle().await {
                error!("Connection error from {}: {}", addr, e);
            }
            metrics.rpc.record_disconnection();
            info!("Connection closed: {}", addr);
        });
    }
}
