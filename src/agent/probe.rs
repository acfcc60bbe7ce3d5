use crate::error::{PghaError, Result, RpcError};
use crate::protocol::Value;
use crate::rpc::{ClientOptions, RpcClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// WAL position, printed as `XXXXXXXX/XXXXXXXX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

    /// Name of the WAL segment file holding this position
    pub fn wal_file_name(self, timeline: u32, segment_size: u64) -> String {
        let xlog_id = self.0 >> 32;
        let xlog_seg = (self.0 & 0xFFFF_FFFF) / segment_size.max(1);
        format!("{:08X}{:08X}{:08X}", timeline, xlog_id, xlog_seg)
    }
}

impl FromStr for Lsn {
    type Err = PghaError;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| PghaError::Probe(format!("invalid lsn '{}'", s)))?;
        let parse = |part: &str| {
            u64::from_str_radix(part, 16)
                .map_err(|_| PghaError::Probe(format!("invalid lsn '{}'", s)))
        };
        Ok(Lsn((parse(hi)? << 32) + parse(lo)?))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Connection parameters of one database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEndpoint {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
}

impl DbEndpoint {
    pub(crate) fn to_value(&self) -> Value {
        Value::map([
            ("host", Value::from(self.host.as_str())),
            ("port", Value::from(self.port)),
            ("db_name", Value::from(self.db_name.as_str())),
            ("user", Value::from(self.user.as_str())),
            ("password", Value::from(self.password.as_str())),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let text = |name: &str| -> std::result::Result<String, String> {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| format!("endpoint '{}' must be str", name))
        };
        let port = value
            .get("port")
            .and_then(|v| v.as_i64())
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| "endpoint 'port' must be a port number".to_string())?;
        Ok(Self {
            host: text("host")?,
            port,
            db_name: text("db_name")?,
            user: text("user")?,
            password: text("password")?,
        })
    }
}

impl fmt::Display for DbEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Arguments of a trigger function call:
/// `select func(code, msg, host, before_json, after_json)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCall {
    pub function: String,
    /// 1 for a standby change, 2 for a primary change
    pub code: i32,
    pub message: String,
    pub host: String,
    pub before: String,
    pub after: String,
}

impl TriggerCall {
    pub fn sql(&self) -> String {
        format!("select {}($1, $2, $3, $4, $5);", self.function)
    }
}

/// Database-level checks
#[async_trait]
pub trait DbProbe: Send + Sync {
    /// Run `sql` and succeed if it executes within `timeout`
    async fn probe(&self, endpoint: &DbEndpoint, sql: &str, timeout: Duration) -> Result<()>;

    /// Last received or written LSN and its timeline
    async fn last_lsn(&self, endpoint: &DbEndpoint, timeout: Duration) -> Result<(Lsn, u32)>;

    async fn last_wal_file(&self, endpoint: &DbEndpoint, timeout: Duration) -> Result<String>;

    /// Whether `app_name` is streaming from the primary
    async fn replication_streaming(
        &self,
        primary: &DbEndpoint,
        app_name: &str,
        timeout: Duration,
    ) -> Result<bool>;

    async fn call_trigger(&self, endpoint: &DbEndpoint, call: &TriggerCall, timeout: Duration)
        -> Result<()>;
}

/// Runs probes on the database's own host through its agent.
pub struct AgentProbe {
    port: u16,
    password: String,
    options: ClientOptions,
    timeout_slack: Duration,
}

impl AgentProbe {
    pub fn new(port: u16, password: impl Into<String>) -> Self {
        Self {
            port,
            password: password.into(),
            options: ClientOptions::default(),
            timeout_slack: Duration::from_secs(2),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    async fn run(
        &self,
        endpoint: &DbEndpoint,
        name: &str,
        mut args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let addr = format!("{}:{}", endpoint.host, self.port);
        let client = RpcClient::connect(&addr, &self.password, self.options).await?;
        args.insert(0, endpoint.to_value());
        let mut kwargs = BTreeMap::new();
        kwargs.insert("timeout".to_string(), Value::from(timeout.as_secs()));
        let call = client.call_async(name, args, kwargs)?;
        let result = call.get(Some(timeout + self.timeout_slack)).await;
        client.close().await;
        result.map_err(|e| match e {
            RpcError::Call { message, .. } => PghaError::Probe(message),
            other => other.into(),
        })
    }
}

#[async_trait]
impl DbProbe for AgentProbe {
    async fn probe(&self, endpoint: &DbEndpoint, sql: &str, timeout: Duration) -> Result<()> {
        self.run(endpoint, "probe_db", vec![sql.into()], timeout)
            .await
            .map(|_| ())
    }

    async fn last_lsn(&self, endpoint: &DbEndpoint, timeout: Duration) -> Result<(Lsn, u32)> {
        let value = self.run(endpoint, "last_lsn", vec![], timeout).await?;
        let lsn = value
            .get("lsn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PghaError::Probe(format!("last_lsn returned {}", value)))?
            .parse::<Lsn>()?;
        let timeline = value
            .get("timeline")
            .and_then(|v| v.as_i64())
            .unwrap_or(1);
        Ok((lsn, timeline as u32))
    }

    async fn last_wal_file(&self, endpoint: &DbEndpoint, timeout: Duration) -> Result<String> {
        let value = self.run(endpoint, "last_wal_file", vec![], timeout).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PghaError::Probe(format!("last_wal_file returned {}", value)))
    }

    async fn replication_streaming(
        &self,
        primary: &DbEndpoint,
        app_name: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let value = self
            .run(primary, "replication_streaming", vec![app_name.into()], timeout)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn call_trigger(
        &self,
        endpoint: &DbEndpoint,
        call: &TriggerCall,
        timeout: Duration,
    ) -> Result<()> {
        let params = Value::List(vec![
            Value::from(call.code),
            Value::from(call.message.as_str()),
            Value::from(call.host.as_str()),
            Value::from(call.before.as_str()),
            Value::from(call.after.as_str()),
        ]);
        self.run(endpoint, "exec_sql", vec![call.sql().into(), params], timeout)
            .await
            .map(|_| ())
    }
}
