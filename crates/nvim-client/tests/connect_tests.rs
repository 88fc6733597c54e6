//! End-to-end tests: a `Client` dialing a fake editor served by
//! `nvim_rpc::RpcServer` over TCP and Unix sockets.

use anyhow::Result;
use nvim_client::{Address, Client, ClientError, ConnectionState, Handlers, Value};
use nvim_rpc::{RpcServer, RpcServerHandle};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nvim_client=debug,nvim_rpc=debug")
        .with_test_writer()
        .try_init();
}

fn method(name: &str, id: u64) -> Value {
    Value::Map(vec![
        (Value::from("name"), Value::from(name)),
        (Value::from("id"), Value::from(id)),
    ])
}

/// A fake editor that answers discovery, `vim_eval` and buffer listing.
///
/// Handlers are keyed by numeric id since the client calls by id.
fn editor_handlers() -> Handlers {
    Handlers::new()
        .on_call("0", |_| async {
            let methods = vec![
                method("vim_eval", 5),
                method("vim_get_buffers", 6),
                method("buffer_get_name", 7),
            ];
            // Pair form: [channel_id, {methods}]
            Ok(Value::Array(vec![
                Value::from(42),
                Value::Map(vec![(Value::from("methods"), Value::Array(methods))]),
            ]))
        })
        .on_call("5", |params| async move {
            match params.first().and_then(|v| v.as_str()) {
                Some("1+1") => Ok(Value::from(2)),
                _ => Err(Value::from("E15: Invalid expression")),
            }
        })
        .on_call("6", |_| async {
            Ok(Value::Array(vec![Value::from(1), Value::from(2)]))
        })
        .on_call("7", |params| async move {
            let id = params.first().and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(Value::from(format!("/tmp/buffer{}.txt", id)))
        })
}

async fn serve(address: &Address) -> Result<RpcServerHandle> {
    Ok(RpcServer::bind(address, Arc::new(editor_handlers())).await?)
}

async fn exercise(client: &Client) -> Result<()> {
    let api = client.ready().await?;
    assert_eq!(api.channel_id(), 42);
    assert_eq!(api.len(), 3);

    assert_eq!(client.eval("1+1").await?, Value::from(2));

    let buffers = client.get_buffers().await?;
    let mut names = Vec::new();
    for buffer in &buffers {
        names.push(buffer.get_name().await?);
    }
    assert_eq!(names, vec!["/tmp/buffer1.txt", "/tmp/buffer2.txt"]);

    let err = client.eval("?").await.unwrap_err();
    assert_eq!(err.remote_payload(), Some(&Value::from("E15: Invalid expression")));
    Ok(())
}

#[tokio::test]
async fn test_connect_over_tcp() -> Result<()> {
    init_tracing();
    let mut server = serve(&Address::tcp("127.0.0.1", 0)).await?;
    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .connect(server.addr().clone());
    let _session = server.accept().await;

    exercise(&client).await?;

    client.close();
    assert_eq!(client.closed().await, ConnectionState::ClosedClean);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_connect_over_unix_socket() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let address = Address::unix(dir.path().join("nvim.sock"));
    let mut server = serve(&address).await?;

    let client = Client::connect(address);
    let _session = server.accept().await;

    exercise(&client).await?;
    Ok(())
}

#[tokio::test]
async fn test_editor_calls_back_into_client() -> Result<()> {
    init_tracing();
    let mut server = serve(&Address::tcp("127.0.0.1", 0)).await?;

    let client = Client::builder()
        .handlers(Handlers::new().on_call("client_version", |_| async { Ok(Value::from("0.1.0")) }))
        .connect(server.addr().clone());
    let session = server.accept().await.expect("server accepted the client");
    client.ready().await?;

    assert_eq!(session.invoke("client_version", vec![]).await?, Value::from("0.1.0"));
    Ok(())
}

#[tokio::test]
async fn test_connect_failure_closes_with_error() {
    init_tracing();
    let client = Client::connect(Address::tcp("127.0.0.1", 1));

    let err = client.ready().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(matches!(client.state(), ConnectionState::ClosedWithError(_)));

    let err = client.eval("1+1").await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)));
}

#[tokio::test]
async fn test_server_shutdown_closes_client() -> Result<()> {
    init_tracing();
    let mut server = serve(&Address::tcp("127.0.0.1", 0)).await?;
    let client = Client::connect(server.addr().clone());
    let session = server.accept().await.expect("server accepted the client");
    client.ready().await?;

    session.close();
    drop(session);
    server.shutdown();

    assert_eq!(client.closed().await, ConnectionState::ClosedClean);
    let err = client.eval("1+1").await.unwrap_err();
    assert!(err.is_connection_error());
    Ok(())
}
