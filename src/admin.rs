//! Operator-facing functions served by the control plane.
//!
//! Long-running operations return a task id immediately; progress is read
//! back through `task_log`.

use crate::error::Result;
use crate::ha::failback::{manual_failback, reset_failback_count};
use crate::ha::lifecycle::{offline, online};
use crate::ha::switchover::{start_switchover, test_can_switch};
use crate::ha::HaContext;
use crate::meta::{ClusterId, FailbackOptions, NodeId};
use crate::protocol::Value;
use crate::rpc::{CallArgs, FunctionTable, HandlerResult};
use crate::task::TaskLogEntry;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

fn register<F, Fut>(table: &mut FunctionTable, name: &str, ctx: &Arc<HaContext>, f: F)
where
    F: Fn(Arc<HaContext>, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    let f = Arc::new(f);
    table.register_async(name, move |args| -> BoxFuture<'static, HandlerResult> {
        let ctx = Arc::clone(&ctx);
        let f = Arc::clone(&f);
        async move { f(ctx, args).await }.boxed()
    });
}

fn done<T: Into<Value>>(result: Result<T>) -> HandlerResult {
    result.map(Into::into).map_err(|e| e.to_string())
}

fn id_arg(args: &CallArgs, index: usize, name: &str) -> std::result::Result<u32, String> {
    let id = args.i64(index, name)?;
    u32::try_from(id).map_err(|_| format!("invalid {} {}", name, id))
}

fn opt_id_arg(
    args: &CallArgs,
    index: usize,
    name: &str,
) -> std::result::Result<Option<u32>, String> {
    match args.value(index, name) {
        Err(_) | Ok(Value::Null) => Ok(None),
        Ok(_) => id_arg(args, index, name).map(Some),
    }
}

fn options_arg(
    args: &CallArgs,
    index: usize,
) -> std::result::Result<Option<FailbackOptions>, String> {
    let map = match args.value(index, "options") {
        Err(_) | Ok(Value::Null) => return Ok(None),
        Ok(Value::Map(m)) => m,
        Ok(other) => {
            return Err(format!(
                "argument 'options' must be map, got {}",
                other.type_name()
            ))
        }
    };
    let flag = |key: &str| map.get(key).and_then(Value::as_bool).unwrap_or(false);
    Ok(Some(FailbackOptions {
        is_rewind: flag("is_rewind"),
        is_rebuild: flag("is_rebuild"),
        rm_pgdata: flag("rm_pgdata"),
    }))
}

fn entry_value(entry: TaskLogEntry) -> Value {
    Value::map([
        ("seq", Value::from(entry.seq)),
        ("level", Value::from(entry.level.code())),
        ("message", Value::from(entry.message)),
        ("time", Value::from(entry.time)),
    ])
}

/// Operations exposed to operators and the management UI
pub fn admin_functions(ctx: Arc<HaContext>) -> FunctionTable {
    let mut table = FunctionTable::new();

    register(&mut table, "switchover", &ctx, |ctx, a| async move {
        let cluster_id: ClusterId = id_arg(&a, 0, "cluster_id")?;
        let target: NodeId = id_arg(&a, 1, "db_id")?;
        done(start_switchover(&ctx, cluster_id, target).await)
    });
    register(&mut table, "test_sr_can_switch", &ctx, |ctx, a| async move {
        let cluster_id: ClusterId = id_arg(&a, 0, "cluster_id")?;
        let target: NodeId = id_arg(&a, 1, "db_id")?;
        let checked = async {
            let topo = ctx.topology(cluster_id).await?;
            test_can_switch(&ctx, &topo, target).await
        }
        .await;
        checked
            .map(|plan| {
                Value::map([
                    ("old_primary", Value::from(plan.old_primary.id)),
                    ("target", Value::from(plan.target.id)),
                    ("wal_path", Value::from(plan.wal_path)),
                ])
            })
            .map_err(|e| e.to_string())
    });
    register(&mut table, "failback", &ctx, |ctx, a| async move {
        let node_id: NodeId = id_arg(&a, 0, "db_id")?;
        let up_db_id = opt_id_arg(&a, 1, "up_db_id")?;
        let options = options_arg(&a, 2)?;
        done(manual_failback(&ctx, node_id, up_db_id, options).await)
    });
    register(&mut table, "reset_failback_count", &ctx, |ctx, a| async move {
        let node_id: NodeId = id_arg(&a, 0, "db_id")?;
        reset_failback_count(&ctx, node_id)
            .await
            .map(|_| Value::Null)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "online", &ctx, |ctx, a| async move {
        let cluster_id: ClusterId = id_arg(&a, 0, "cluster_id")?;
        online(&ctx, cluster_id)
            .await
            .map(|_| Value::Null)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "offline", &ctx, |ctx, a| async move {
        let cluster_id: ClusterId = id_arg(&a, 0, "cluster_id")?;
        offline(&ctx, cluster_id)
            .await
            .map(|_| Value::Null)
            .map_err(|e| e.to_string())
    });
    register(&mut table, "cluster_state", &ctx, |ctx, a| async move {
        let cluster_id: ClusterId = id_arg(&a, 0, "cluster_id")?;
        ctx.store
            .require_cluster(cluster_id)
            .await
            .map(|c| Value::from(c.state.as_str()))
            .map_err(|e| e.to_string())
    });
    register(&mut table, "task_log", &ctx, |ctx, a| async move {
        let task_id = a.i64(0, "task_id")?;
        let after = a.i64(1, "after_seq").unwrap_or(0).max(0) as u64;
        let (state, entries) = ctx
            .tasks
            .log_since(task_id.max(0) as u64, after)
            .ok_or_else(|| format!("task({}) not found", task_id))?;
        Ok(Value::map([
            ("state", Value::from(state.code())),
            (
                "entries",
                Value::List(entries.into_iter().map(entry_value).collect()),
            ),
        ]))
    });
    register(&mut table, "metrics", &ctx, |ctx, _a| async move {
        Ok(Value::map(ctx.metrics.snapshot()))
    });

    table
}
