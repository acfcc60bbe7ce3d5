//! RPC server and client over a real TCP socket

use futures::FutureExt;
use pgha::error::{RpcError, TransportError};
use pgha::protocol::packet::{CMD_FUNC_LIST, REPLY_BAD_COMMAND, REPLY_OK};
use pgha::protocol::value::decode_names;
use pgha::protocol::{client_handshake, recv_packet, send_packet, Packet, Value};
use pgha::rpc::{CallArgs, ClientOptions, FunctionTable, HandlerResult, RpcClient, RpcServer};
use pgha::shutdown::Shutdown;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const PASSWORD: &str = "s3cret";

fn functions() -> FunctionTable {
    let mut table = FunctionTable::new();
    table.register("echo", |args: CallArgs| Ok(Value::List(args.args)));
    table.register("add", |args: CallArgs| {
        Ok(Value::Int(args.i64(0, "a")? + args.i64(1, "b")?))
    });
    table.register("fail", |_args: CallArgs| Err("disk on fire".to_string()));
    table.register("boom", |_args: CallArgs| -> HandlerResult { panic!("handler bug") });
    table.register("slow", |_args: CallArgs| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(Value::Null)
    });
    table.register_async("greet", |args: CallArgs| {
        async move {
            let name = args.str(0, "name")?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Value::from(format!("hello {}", name)))
        }
        .boxed()
    });
    table
}

struct TestServer {
    addr: String,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, signal) = Shutdown::new();
    let server = RpcServer::new(addr.clone(), PASSWORD, functions()).with_shutdown(signal);
    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        conn_timeout: Duration::from_secs(2),
        data_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_connect_lists_functions() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    assert_eq!(client.functions(), ["add", "boom", "echo", "fail", "greet", "slow"]);
    assert!(client.has_function("greet"));
    assert!(!client.has_function("missing"));
    assert!(!client.is_broken());
}

#[tokio::test]
async fn test_sync_and_async_handlers() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    let sum = client
        .call_args("add", vec![Value::Int(2), Value::Int(40)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(42));

    let mut kwargs = BTreeMap::new();
    kwargs.insert("b".to_string(), Value::Int(5));
    let sum = client.call("add", vec![Value::Int(1)], kwargs).await.unwrap();
    assert_eq!(sum, Value::Int(6));

    let greeting = client
        .call_args("greet", vec![Value::from("pg1")])
        .await
        .unwrap();
    assert_eq!(greeting.as_str(), Some("hello pg1"));

    let nested = Value::map([("lsn", Value::Int(7)), ("ok", Value::Bool(true))]);
    let echoed = client
        .call_args("echo", vec![nested.clone(), Value::Bytes(vec![0, 1, 2])])
        .await
        .unwrap();
    assert_eq!(echoed, Value::List(vec![nested, Value::Bytes(vec![0, 1, 2])]));
}

#[tokio::test]
async fn test_call_errors_keep_connection_usable() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    match client.call_args("fail", vec![]).await {
        Err(RpcError::Call { code, message }) => {
            assert!(code > 0);
            assert_eq!(message, "disk on fire");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    match client.call_args("missing", vec![]).await {
        Err(RpcError::Call { message, .. }) => assert!(message.contains("does not exist")),
        other => panic!("unexpected reply: {:?}", other),
    }
    match client.call_args("add", vec![Value::from("x")]).await {
        Err(RpcError::Call { message, .. }) => assert!(message.contains("must be int")),
        other => panic!("unexpected reply: {:?}", other),
    }

    assert!(!client.is_broken());
    let sum = client
        .call_args("add", vec![Value::Int(1), Value::Int(1)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(2));
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    match client.call_args("boom", vec![]).await {
        Err(RpcError::Call { message, .. }) => assert!(message.contains("panicked")),
        other => panic!("unexpected reply: {:?}", other),
    }
    let sum = client
        .call_args("add", vec![Value::Int(20), Value::Int(22)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(42));

    let other = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();
    assert!(other.has_function("boom"));
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let server = start_server().await;
    let err = RpcClient::connect(&server.addr, "guess", options())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RpcError::AuthFailed(_)));
}

#[tokio::test]
async fn test_async_call_result_and_busy_slot() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    let pending = client.call_async("slow", vec![], BTreeMap::new()).unwrap();
    let busy = client.call_args("add", vec![Value::Int(1), Value::Int(1)]).await;
    assert!(matches!(busy, Err(RpcError::Async(_))));
    assert!(client.call_async("slow", vec![], BTreeMap::new()).is_err());

    assert_eq!(pending.get(None).await.unwrap(), Value::Null);
    let sum = client
        .call_args("add", vec![Value::Int(3), Value::Int(4)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(7));
}

#[tokio::test]
async fn test_async_call_timeout_breaks_connection() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();

    let pending = client.call_async("slow", vec![], BTreeMap::new()).unwrap();
    let err = pending.get(Some(Duration::from_millis(20))).await.unwrap_err();
    assert_eq!(err, RpcError::CsuTimeout);
    assert!(client.is_broken());

    // the aborted call releases its slot asynchronously
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = client.call_args("echo", vec![]).await.unwrap_err();
    assert_eq!(err, RpcError::Transport(TransportError::Closed));
}

#[tokio::test]
async fn test_raw_commands_after_handshake() {
    let server = start_server().await;
    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    let timeout = Duration::from_secs(2);
    client_handshake(&mut stream, PASSWORD, timeout).await.unwrap();

    send_packet(&mut stream, &Packet::new(CMD_FUNC_LIST, Vec::new()), timeout)
        .await
        .unwrap();
    let reply = recv_packet(&mut stream, timeout).await.unwrap();
    assert_eq!(reply.code, REPLY_OK);
    assert_eq!(decode_names(&reply.payload).unwrap().len(), 6);

    send_packet(&mut stream, &Packet::new(999, Vec::new()), timeout)
        .await
        .unwrap();
    let reply = recv_packet(&mut stream, timeout).await.unwrap();
    assert_eq!(reply.code, REPLY_BAD_COMMAND);
    assert!(reply.message().contains("999"));

    // a second AUTH on an authenticated connection is refused
    send_packet(&mut stream, &Packet::new(0, Vec::new()), timeout)
        .await
        .unwrap();
    let reply = recv_packet(&mut stream, timeout).await.unwrap();
    assert_eq!(reply.code, REPLY_BAD_COMMAND);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = start_server().await;
    let client = RpcClient::connect(&server.addr, PASSWORD, options())
        .await
        .unwrap();
    client.close().await;
    assert!(client.is_broken());

    server.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), server.handle)
        .await
        .unwrap()
        .unwrap();
}
