use crate::error::{PghaError, Result, RpcError};
use crate::protocol::Value;
use crate::rpc::{ClientOptions, RpcClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// `(status, message)` returned by every lifecycle operation.
/// A negative status is a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub message: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: 0,
            message: String::new(),
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            message: message.into(),
        }
    }

    pub fn error(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }

    /// Turn a failed reply into [`PghaError::NodeControl`]
    pub fn check(self, op: &str) -> Result<Reply> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(PghaError::NodeControl {
                op: op.to_string(),
                code: self.status,
                message: self.message,
            })
        }
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.status),
            Value::from(self.message.as_str()),
        ])
    }

    pub fn from_value(value: &Value) -> std::result::Result<Self, RpcError> {
        match value.as_list() {
            Some([status, message]) => {
                let status = status
                    .as_i64()
                    .ok_or_else(|| RpcError::Codec("reply status must be int".to_string()))?;
                let status = i32::try_from(status).map_err(|_| {
                    RpcError::Codec(format!("reply status {} out of range", status))
                })?;
                let message = match message {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(Self {
                    status,
                    message,
                })
            }
            _ => Err(RpcError::Codec(format!(
                "expected (status, message) reply, got {}",
                value.type_name()
            ))),
        }
    }
}

/// Where a standby streams from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub repl_user: String,
    pub repl_pass: String,
    pub repl_app_name: String,
}

impl UpstreamConfig {
    fn to_value(&self) -> Value {
        Value::map([
            ("host", Value::from(self.host.as_str())),
            ("port", Value::from(self.port)),
            ("repl_user", Value::from(self.repl_user.as_str())),
            ("repl_pass", Value::from(self.repl_pass.as_str())),
            ("repl_app_name", Value::from(self.repl_app_name.as_str())),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let field = |name: &str| -> std::result::Result<&Value, String> {
            value
                .get(name)
                .ok_or_else(|| format!("upstream config misses '{}'", name))
        };
        let text = |name: &str| -> std::result::Result<String, String> {
            field(name)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("upstream '{}' must be str", name))
        };
        let port = field("port")?
            .as_i64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| "upstream 'port' must be a port number".to_string())?;
        Ok(Self {
            host: text("host")?,
            port,
            repl_user: text("repl_user")?,
            repl_pass: text("repl_pass")?,
            repl_app_name: text("repl_app_name")?,
        })
    }
}

/// Parameters to rebuild a standby from scratch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStandbyParams {
    pub pgdata: String,
    pub port: u16,
    pub upstream: UpstreamConfig,
}

/// Per-host agent operations on one database instance
#[async_trait]
pub trait NodeControl: Send + Sync {
    async fn is_running(&self, pgdata: &str) -> Result<bool>;

    async fn start(&self, pgdata: &str) -> Result<Reply>;

    /// Stop the database. `wait_time` in seconds, 0 means fast shutdown.
    async fn stop(&self, pgdata: &str, wait_time: u64) -> Result<Reply>;

    async fn restart(&self, pgdata: &str) -> Result<Reply>;

    async fn reload(&self, pgdata: &str) -> Result<Reply>;

    async fn promote(&self, pgdata: &str) -> Result<Reply>;

    async fn is_ready(&self, pgdata: &str, port: u16) -> Result<bool>;

    /// Major version recorded in the data directory
    async fn pgdata_version(&self, pgdata: &str) -> Result<u32>;

    async fn rewind(&self, pgdata: &str, source: &UpstreamConfig) -> Result<Reply>;

    /// Kill the WAL receiver so the standby stops applying from upstream
    async fn pause_replica_receive(&self, pgdata: &str, port: u16) -> Result<Reply>;

    async fn change_upstream(&self, pgdata: &str, upstream: &UpstreamConfig) -> Result<Reply>;

    async fn build_standby(&self, params: &BuildStandbyParams) -> Result<Reply>;

    async fn vip_exists(&self, vip: &str) -> Result<bool>;

    async fn add_vip(&self, vip: &str) -> Result<Reply>;

    async fn del_vip(&self, vip: &str) -> Result<Reply>;

    async fn path_exists(&self, path: &str) -> Result<bool>;

    /// Copy WAL files this node is missing from another host's data directory
    async fn cp_delay_wal_from(&self, src_host: &str, src_pgdata: &str, pgdata: &str)
        -> Result<Reply>;

    async fn set_sync_mode(&self, pgdata: &str, sync: bool) -> Result<Reply>;

    /// Delete the data directory, or move it aside when `rename_to` is set
    async fn remove_pgdata(&self, pgdata: &str, rename_to: Option<&str>) -> Result<Reply>;
}

/// Opens a control handle to the agent on a host
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn NodeControl>>;
}

/// [`NodeControl`] over an authenticated RPC connection to the host agent
pub struct RpcNodeControl {
    client: RpcClient,
}

impl RpcNodeControl {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        debug!("agent {} call {}", self.client.addr(), name);
        Ok(self.client.call(name, args, BTreeMap::new()).await?)
    }

    async fn invoke_reply(&self, name: &str, args: Vec<Value>) -> Result<Reply> {
        let value = self.invoke(name, args).await?;
        Ok(Reply::from_value(&value)?)
    }

    async fn invoke_bool(&self, name: &str, args: Vec<Value>) -> Result<bool> {
        let value = self.invoke(name, args).await?;
        value.as_bool().ok_or_else(|| {
            RpcError::Codec(format!("{} returned {}, expected bool", name, value.type_name()))
                .into()
        })
    }
}

#[async_trait]
impl NodeControl for RpcNodeControl {
    async fn is_running(&self, pgdata: &str) -> Result<bool> {
        self.invoke_bool("is_running", vec![pgdata.into()]).await
    }

    async fn start(&self, pgdata: &str) -> Result<Reply> {
        self.invoke_reply("start", vec![pgdata.into()]).await
    }

    async fn stop(&self, pgdata: &str, wait_time: u64) -> Result<Reply> {
        self.invoke_reply("stop", vec![pgdata.into(), wait_time.into()])
            .await
    }

    async fn restart(&self, pgdata: &str) -> Result<Reply> {
        self.invoke_reply("restart", vec![pgdata.into()]).await
    }

    async fn reload(&self, pgdata: &str) -> Result<Reply> {
        self.invoke_reply("reload", vec![pgdata.into()]).await
    }

    async fn promote(&self, pgdata: &str) -> Result<Reply> {
        self.invoke_reply("promote", vec![pgdata.into()]).await
    }

    async fn is_ready(&self, pgdata: &str, port: u16) -> Result<bool> {
        self.invoke_bool("is_ready", vec![pgdata.into(), port.into()])
            .await
    }

    async fn pgdata_version(&self, pgdata: &str) -> Result<u32> {
        let value = self.invoke("pgdata_version", vec![pgdata.into()]).await?;
        value
            .as_i64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                RpcError::Codec(format!("pgdata_version returned {}", value)).into()
            })
    }

    async fn rewind(&self, pgdata: &str, source: &UpstreamConfig) -> Result<Reply> {
        self.invoke_reply("rewind", vec![pgdata.into(), source.to_value()])
            .await
    }

    async fn pause_replica_receive(&self, pgdata: &str, port: u16) -> Result<Reply> {
        self.invoke_reply("pause_replica_receive", vec![pgdata.into(), port.into()])
            .await
    }

    async fn change_upstream(&self, pgdata: &str, upstream: &UpstreamConfig) -> Result<Reply> {
        self.invoke_reply("change_upstream", vec![pgdata.into(), upstream.to_value()])
            .await
    }

    async fn build_standby(&self, params: &BuildStandbyParams) -> Result<Reply> {
        self.invoke_reply(
            "build_standby",
            vec![
                params.pgdata.as_str().into(),
                params.port.into(),
                params.upstream.to_value(),
            ],
        )
        .await
    }

    async fn vip_exists(&self, vip: &str) -> Result<bool> {
        self.invoke_bool("vip_exists", vec![vip.into()]).await
    }

    async fn add_vip(&self, vip: &str) -> Result<Reply> {
        self.invoke_reply("add_vip", vec![vip.into()]).await
    }

    async fn del_vip(&self, vip: &str) -> Result<Reply> {
        self.invoke_reply("del_vip", vec![vip.into()]).await
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        self.invoke_bool("path_exists", vec![path.into()]).await
    }

    async fn cp_delay_wal_from(
        &self,
        src_host: &str,
        src_pgdata: &str,
        pgdata: &str,
    ) -> Result<Reply> {
        self.invoke_reply(
            "cp_delay_wal_from",
            vec![src_host.into(), src_pgdata.into(), pgdata.into()],
        )
        .await
    }

    async fn set_sync_mode(&self, pgdata: &str, sync: bool) -> Result<Reply> {
        self.invoke_reply("set_sync_mode", vec![pgdata.into(), sync.into()])
            .await
    }

    async fn remove_pgdata(&self, pgdata: &str, rename_to: Option<&str>) -> Result<Reply> {
        self.invoke_reply(
            "remove_pgdata",
            vec![pgdata.into(), rename_to.map(Value::from).unwrap_or_default()],
        )
        .await
    }
}

/// Connects to agents listening on a fixed port with a shared password
pub struct RpcAgentConnector {
    port: u16,
    password: String,
    options: ClientOptions,
}

impl RpcAgentConnector {
    pub fn new(port: u16, password: impl Into<String>) -> Self {
        Self {
            port,
            password: password.into(),
            options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl AgentConnector for RpcAgentConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn NodeControl>> {
        let addr = format!("{}:{}", host, self.port);
        let client = RpcClient::connect(&addr, &self.password, self.options).await?;
        Ok(Arc::new(RpcNodeControl::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_value_round_trip() {
        let reply = Reply::error(-1, "pg_ctl failed");
        let back = Reply::from_value(&reply.to_value()).unwrap();
        assert_eq!(back, reply);
        assert!(!back.is_ok());
        assert!(Reply::ok().check("start").is_ok());
        let err = back.check("start").unwrap_err();
        assert!(err.to_string().contains("'start' failed(-1)"));
    }

    #[test]
    fn test_reply_rejects_wrong_shape() {
        assert!(Reply::from_value(&Value::Int(0)).is_err());
        assert!(Reply::from_value(&Value::List(vec![Value::from("x"), Value::Null])).is_err());
    }

    #[test]
    fn test_reply_status_out_of_range() {
        let wide = Value::List(vec![Value::Int(i64::from(i32::MAX) + 1), Value::from("x")]);
        match Reply::from_value(&wide) {
            Err(RpcError::Codec(msg)) => assert!(msg.contains("out of range")),
            other => panic!("unexpected: {:?}", other),
        }
        let narrow = Value::List(vec![Value::Int(-2), Value::from("x")]);
        assert_eq!(Reply::from_value(&narrow).unwrap().status, -2);
    }

    #[test]
    fn test_upstream_config_from_value() {
        let up = UpstreamConfig {
            host: "10.0.0.1".into(),
            port: 5432,
            repl_user: "repl".into(),
            repl_pass: "secret".into(),
            repl_app_name: "stb2".into(),
        };
        assert_eq!(UpstreamConfig::from_value(&up.to_value()).unwrap(), up);
        assert!(UpstreamConfig::from_value(&Value::map([("host", "h")])).is_err());
    }
}
