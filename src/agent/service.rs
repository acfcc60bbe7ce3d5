//! Registration of agent-side functions.
//!
//! A host agent serves these tables over [`crate::rpc::RpcServer`]; the
//! control plane reaches them through [`super::RpcNodeControl`] and
//! [`super::AgentProbe`].

use super::node::{BuildStandbyParams, NodeControl, Reply, UpstreamConfig};
use super::probe::{DbEndpoint, DbProbe, TriggerCall};
use crate::protocol::Value;
use crate::rpc::{CallArgs, FunctionTable, HandlerResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROBE_TIMEOUT_SECS: i64 = 10;

fn register<T, F, Fut>(table: &mut FunctionTable, name: &str, target: &Arc<T>, f: F)
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let target = Arc::clone(target);
    let f = Arc::new(f);
    table.register_async(name, move |args| -> BoxFuture<'static, HandlerResult> {
        let target = Arc::clone(&target);
        let f = Arc::clone(&f);
        async move { f(target, args).await }.boxed()
    });
}

fn reply(result: crate::error::Result<Reply>) -> HandlerResult {
    result.map(|r| r.to_value()).map_err(|e| e.to_string())
}

fn flag(result: crate::error::Result<bool>) -> HandlerResult {
    result.map(Value::Bool).map_err(|e| e.to_string())
}

fn upstream_arg(args: &CallArgs, index: usize) -> Result<UpstreamConfig, String> {
    UpstreamConfig::from_value(args.value(index, "upstream")?)
}

fn port_arg(args: &CallArgs, index: usize) -> Result<u16, String> {
    let port = args.i64(index, "port")?;
    u16::try_from(port).map_err(|_| format!("invalid port {}", port))
}

/// Functions that drive a [`NodeControl`] implementation
pub fn node_control_functions(control: Arc<dyn NodeControl>) -> FunctionTable {
    let mut table = FunctionTable::new();
    register(&mut table, "is_running", &control, |c, a| async move {
        flag(c.is_running(&a.str(0, "pgdata")?).await)
    });
    register(&mut table, "start", &control, |c, a| async move {
        reply(c.start(&a.str(0, "pgdata")?).await)
    });
    register(&mut table, "stop", &control, |c, a| async move {
        let wait_time = a.i64(1, "wait_time").unwrap_or(0).max(0) as u64;
        reply(c.stop(&a.str(0, "pgdata")?, wait_time).await)
    });
    register(&mut table, "restart", &control, |c, a| async move {
        reply(c.restart(&a.str(0, "pgdata")?).await)
    });
    register(&mut table, "reload", &control, |c, a| async move {
        reply(c.reload(&a.str(0, "pgdata")?).await)
    });
    register(&mut table, "promote", &control, |c, a| async move {
        reply(c.promote(&a.str(0, "pgdata")?).await)
    });
    register(&mut table, "is_ready", &control, |c, a| async move {
        flag(c.is_ready(&a.str(0, "pgdata")?, port_arg(&a, 1)?).await)
    });
    register(&mut table, "pgdata_version", &control, |c, a| async move {
        c.pgdata_version(&a.str(0, "pgdata")?)
            .await
            .map(Value::from)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "rewind", &control, |c, a| async move {
        reply(c.rewind(&a.str(0, "pgdata")?, &upstream_arg(&a, 1)?).await)
    });
    register(&mut table, "pause_replica_receive", &control, |c, a| async move {
        reply(
            c.pause_replica_receive(&a.str(0, "pgdata")?, port_arg(&a, 1)?)
                .await,
        )
    });
    register(&mut table, "change_upstream", &control, |c, a| async move {
        reply(
            c.change_upstream(&a.str(0, "pgdata")?, &upstream_arg(&a, 1)?)
                .await,
        )
    });
    register(&mut table, "build_standby", &control, |c, a| async move {
        let params = BuildStandbyParams {
            pgdata: a.str(0, "pgdata")?,
            port: port_arg(&a, 1)?,
            upstream: upstream_arg(&a, 2)?,
        };
        reply(c.build_standby(&params).await)
    });
    register(&mut table, "vip_exists", &control, |c, a| async move {
        flag(c.vip_exists(&a.str(0, "vip")?).await)
    });
    register(&mut table, "add_vip", &control, |c, a| async move {
        reply(c.add_vip(&a.str(0, "vip")?).await)
    });
    register(&mut table, "del_vip", &control, |c, a| async move {
        reply(c.del_vip(&a.str(0, "vip")?).await)
    });
    register(&mut table, "path_exists", &control, |c, a| async move {
        flag(c.path_exists(&a.str(0, "path")?).await)
    });
    register(&mut table, "cp_delay_wal_from", &control, |c, a| async move {
        reply(
            c.cp_delay_wal_from(
                &a.str(0, "src_host")?,
                &a.str(1, "src_pgdata")?,
                &a.str(2, "pgdata")?,
            )
            .await,
        )
    });
    register(&mut table, "set_sync_mode", &control, |c, a| async move {
        reply(c.set_sync_mode(&a.str(0, "pgdata")?, a.bool(1, "sync")?).await)
    });
    register(&mut table, "remove_pgdata", &control, |c, a| async move {
        let rename_to = a.opt_str(1, "rename_to");
        reply(
            c.remove_pgdata(&a.str(0, "pgdata")?, rename_to.as_deref())
                .await,
        )
    });
    table
}

fn endpoint_arg(args: &CallArgs) -> Result<DbEndpoint, String> {
    DbEndpoint::from_value(args.value(0, "endpoint")?)
}

fn timeout_arg(args: &CallArgs) -> Duration {
    let secs = args
        .kwargs
        .get("timeout")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1) as u64)
}

/// Functions that run database checks locally through a [`DbProbe`]
pub fn probe_functions(probe: Arc<dyn DbProbe>) -> FunctionTable {
    let mut table = FunctionTable::new();
    register(&mut table, "probe_db", &probe, |p, a| async move {
        let endpoint = endpoint_arg(&a)?;
        p.probe(&endpoint, &a.str(1, "sql")?, timeout_arg(&a))
            .await
            .map(|_| Value::Null)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "last_lsn", &probe, |p, a| async move {
        let endpoint = endpoint_arg(&a)?;
        let (lsn, timeline) = p
            .last_lsn(&endpoint, timeout_arg(&a))
            .await
            .map_err(|e| e.to_string())?;
        Ok(Value::map([
            ("lsn", Value::from(lsn.to_string())),
            ("timeline", Value::from(timeline)),
        ]))
    });
    register(&mut table, "last_wal_file", &probe, |p, a| async move {
        let endpoint = endpoint_arg(&a)?;
        p.last_wal_file(&endpoint, timeout_arg(&a))
            .await
            .map(Value::from)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "replication_streaming", &probe, |p, a| async move {
        let endpoint = endpoint_arg(&a)?;
        flag(
            p.replication_streaming(&endpoint, &a.str(1, "app_name")?, timeout_arg(&a))
                .await,
        )
    });
    register(&mut table, "exec_sql", &probe, |p, a| async move {
        let endpoint = endpoint_arg(&a)?;
        let sql = a.str(1, "sql")?;
        let params = a.value(2, "params")?;
        let text = |i: usize| {
            params
                .as_list()
                .and_then(|l| l.get(i))
                .map(|v| match v {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        let function = sql
            .strip_prefix("select ")
            .and_then(|rest| rest.split_once('('))
            .map(|(f, _)| f.trim().to_string())
            .ok_or_else(|| format!("unsupported statement: {}", sql))?;
        let call = TriggerCall {
            function,
            code: params
                .as_list()
                .and_then(|l| l.first())
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0),
            message: text(1),
            host: text(2),
            before: text(3),
            after: text(4),
        };
        p.call_trigger(&endpoint, &call, timeout_arg(&a))
            .await
            .map(|_| Value::Null)
            .map_err(|e| e.to_string())
    });
    table
}
