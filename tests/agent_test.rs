//! Agent function tables reached through the RPC adapters

mod common;

use common::{FakeAgents, FakeProbe};
use pgha::agent::{
    node_control_functions, probe_functions, AgentConnector, AgentProbe, BuildStandbyParams,
    DbEndpoint, DbProbe, Lsn, RpcAgentConnector, TriggerCall, UpstreamConfig,
};
use pgha::error::PghaError;
use pgha::rpc::{ClientOptions, RpcServer};
use pgha::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const HOST: &str = "127.0.0.1";
const PASSWORD: &str = "agent-pw";

struct Agent {
    port: u16,
    agents: FakeAgents,
    probe: Arc<FakeProbe>,
    _shutdown: Shutdown,
}

async fn start_agent() -> Agent {
    let agents = FakeAgents::default();
    let probe = Arc::new(FakeProbe::default());
    let control = agents.connect(HOST).await.unwrap();
    let mut table = node_control_functions(control);
    table.extend(probe_functions(probe.clone()));

    let listener = TcpListener::bind((HOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown, signal) = Shutdown::new();
    let server =
        RpcServer::new(format!("{}:{}", HOST, port), PASSWORD, table).with_shutdown(signal);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    Agent {
        port,
        agents,
        probe,
        _shutdown: shutdown,
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        conn_timeout: Duration::from_secs(2),
        data_timeout: Duration::from_secs(5),
    }
}

fn upstream() -> UpstreamConfig {
    UpstreamConfig {
        host: "10.0.0.1".to_string(),
        port: 5432,
        repl_user: "repl".to_string(),
        repl_pass: "pw".to_string(),
        repl_app_name: "stb2".to_string(),
    }
}

fn endpoint() -> DbEndpoint {
    DbEndpoint {
        host: HOST.to_string(),
        port: 5432,
        db_name: "postgres".to_string(),
        user: "ha".to_string(),
        password: "pw".to_string(),
    }
}

#[tokio::test]
async fn test_node_control_over_rpc() {
    let agent = start_agent().await;
    let connector = RpcAgentConnector::new(agent.port, PASSWORD).with_options(options());
    let control = connector.connect(HOST).await.unwrap();

    assert!(control.start("/data/pg").await.unwrap().is_ok());
    assert!(control.is_ready("/data/pg", 5432).await.unwrap());
    assert_eq!(control.pgdata_version("/data/pg").await.unwrap(), 14);
    assert!(control
        .change_upstream("/data/pg", &upstream())
        .await
        .unwrap()
        .is_ok());
    assert!(control.add_vip("10.0.0.100").await.unwrap().is_ok());
    assert!(control.vip_exists("10.0.0.100").await.unwrap());
    let params = BuildStandbyParams {
        pgdata: "/data/pg".to_string(),
        port: 5432,
        upstream: upstream(),
    };
    assert!(control.build_standby(&params).await.unwrap().is_ok());
    control
        .cp_delay_wal_from("10.0.0.1", "/data/pg", "/data/pg")
        .await
        .unwrap();
    control
        .remove_pgdata("/data/pg", Some("/data/pg.bak"))
        .await
        .unwrap();

    assert_eq!(
        agent.agents.ops_on(HOST),
        vec![
            "start",
            "is_ready",
            "pgdata_version",
            "change_upstream",
            "add_vip",
            "vip_exists",
            "build_standby",
            "cp_delay_wal_from:10.0.0.1",
            "rename_pgdata",
        ]
    );
    assert_eq!(agent.agents.upstream_of(HOST).as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_failed_operation_reply() {
    let agent = start_agent().await;
    agent.agents.fail_op(HOST, "promote");
    let connector = RpcAgentConnector::new(agent.port, PASSWORD).with_options(options());
    let control = connector.connect(HOST).await.unwrap();

    let reply = control.promote("/data/pg").await.unwrap();
    assert!(!reply.is_ok());
    let err = reply.check("promote").unwrap_err();
    assert!(matches!(err, PghaError::NodeControl { .. }));
}

#[tokio::test]
async fn test_wrong_agent_password() {
    let agent = start_agent().await;
    let connector = RpcAgentConnector::new(agent.port, "nope").with_options(options());
    assert!(connector.connect(HOST).await.is_err());
}

#[tokio::test]
async fn test_probe_over_rpc() {
    let agent = start_agent().await;
    let probe = AgentProbe::new(agent.port, PASSWORD).with_options(options());
    let timeout = Duration::from_secs(2);

    probe.probe(&endpoint(), "select 1", timeout).await.unwrap();

    agent.probe.set_lsn(HOST, 0x3000_0060);
    let (lsn, timeline) = probe.last_lsn(&endpoint(), timeout).await.unwrap();
    assert_eq!(lsn, Lsn(0x3000_0060));
    assert_eq!(timeline, 1);

    agent.probe.set_wal_file("000000010000000000000003");
    assert_eq!(
        probe.last_wal_file(&endpoint(), timeout).await.unwrap(),
        "000000010000000000000003"
    );

    assert!(!probe
        .replication_streaming(&endpoint(), "stb2", timeout)
        .await
        .unwrap());
    agent.probe.set_streaming("stb2", true);
    assert!(probe
        .replication_streaming(&endpoint(), "stb2", timeout)
        .await
        .unwrap());

    agent.probe.set_failing(HOST, true);
    let err = probe.probe(&endpoint(), "select 1", timeout).await.unwrap_err();
    assert!(matches!(err, PghaError::Probe(_)));
}

#[tokio::test]
async fn test_trigger_call_over_rpc() {
    let agent = start_agent().await;
    let probe = AgentProbe::new(agent.port, PASSWORD).with_options(options());
    let call = TriggerCall {
        function: "ha_notify".to_string(),
        code: 2,
        message: "failover".to_string(),
        host: "10.0.0.1".to_string(),
        before: "{}".to_string(),
        after: "{\"primary\":2}".to_string(),
    };

    probe
        .call_trigger(&endpoint(), &call, Duration::from_secs(2))
        .await
        .unwrap();
    let triggers = agent.probe.triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].0, HOST);
    assert_eq!(triggers[0].1, call);
}
