use anyhow::{Context, Result};
use pgha::admin::admin_functions;
use pgha::agent::{AgentProbe, CommandPinger, HttpLoadBalancer, RpcAgentConnector, ShellFencer};
use pgha::config::Config;
use pgha::ha::discovery::run_discovery;
use pgha::meta::MemoryMetaStore;
use pgha::observability::{init_logging, HaMetrics};
use pgha::shutdown::Shutdown;
use pgha::task::TaskManager;
use pgha::{HaContext, RpcServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line arguments structure
struct CliArgs {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!("pgha v{} - PostgreSQL high-availability control plane", VERSION);
    println!();
    println!("USAGE:");
    println!("    pgha [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>    Path to configuration file (TOML format)");
    println!("    -H, --host <HOST>      Bind address (default: 127.0.0.1)");
    println!("    -p, --port <PORT>      Bind port (default: 4342)");
    println!("    -h, --help             Print help information");
    println!("    -v, --version          Print version information");
    println!();
    println!("CONFIGURATION FILE SECTIONS:");
    println!("    [server]         host, port, password, workers");
    println!("    [agent]          port, password, conn_timeout, data_timeout");
    println!("    [ha]             discovery_interval, restart_retries, restart_delay,");
    println!("                     failback_settle, fence_settle, max_failback_count,");
    println!("                     sql_timeout, task_workers, task_history,");
    println!("                     ping_count, ping_timeout");
    println!("    [load_balancer]  token, timeout");
    println!("    [logging]        level, format, file");
    println!("    [[clusters]]     cluster records to monitor");
    println!("    [[nodes]]        database records of those clusters");
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        host: None,
        port: None,
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => {
                cli.show_help = true;
                return Ok(cli);
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return Ok(cli);
            }
            "-c" | "--config" | "-H" | "--host" | "-p" | "--port" => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires an argument", flag))?;
                match flag {
                    "-c" | "--config" => cli.config_path = Some(PathBuf::from(value)),
                    "-H" | "--host" => cli.host = Some(value.clone()),
                    _ => {
                        let port = value
                            .parse::<u16>()
                            .with_context(|| format!("invalid port number '{}'", value))?;
                        cli.port = Some(port);
                    }
                }
                i += 1;
            }
            other => anyhow::bail!("unknown option '{}', use --help for usage", other),
        }
        i += 1;
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args()?;
    if cli.show_help {
        print_help();
        return Ok(());
    }
    if cli.show_version {
        println!("pgha {}", VERSION);
        return Ok(());
    }

    let mut config = Config::load(cli.config_path.as_deref()).context("load configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    init_logging(&config.log_config()).context("initialize logging")?;

    let store = MemoryMetaStore::with_records(config.clusters.clone(), config.nodes.clone())
        .context("load cluster records")?;
    let options = config.agent.client_options();
    let agents = RpcAgentConnector::new(config.agent.port, config.agent.password.clone())
        .with_options(options);
    let probe =
        AgentProbe::new(config.agent.port, config.agent.password.clone()).with_options(options);
    let lb = HttpLoadBalancer::new(
        config.load_balancer.token.clone(),
        Duration::from_secs(config.load_balancer.timeout),
    );
    let pinger = CommandPinger::new(
        config.ha.ping_count,
        Duration::from_secs(config.ha.ping_timeout),
    );
    let fencer = ShellFencer::new(Duration::from_secs(config.ha.fence_timeout));

    let (shutdown, signal) = Shutdown::new();
    let metrics = Arc::new(HaMetrics::new());
    let ctx = Arc::new(
        HaContext::new(
            Arc::new(store),
            Arc::new(agents),
            Arc::new(probe),
            Arc::new(lb),
            Arc::new(pinger),
            Arc::new(fencer),
        )
        .with_settings(config.ha_settings())
        .with_tasks(Arc::new(
            TaskManager::new(config.ha.task_workers).with_history(config.ha.task_history),
        ))
        .with_metrics(Arc::clone(&metrics))
        .with_shutdown(signal.clone()),
    );

    let server = RpcServer::new(
        config.server_addr(),
        &config.server.password,
        admin_functions(Arc::clone(&ctx)),
    )
    .with_workers(config.server.workers)
    .with_metrics(metrics)
    .with_shutdown(signal);

    info!("pgha v{} starting", VERSION);
    if config.server.password.is_empty() {
        warn!("server password is empty, every client can authenticate");
    }
    let discovery = tokio::spawn(run_discovery(Arc::clone(&ctx)));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
        }
        shutdown.trigger();
    });

    server.run().await.context("rpc server")?;
    let _ = discovery.await;
    info!("pgha stopped");
    Ok(())
}
