//! Integration tests for the msgpack-rpc transport over real sockets.
//!
//! A `RpcServer` plays the editor; `RpcStream::connect` plays the client.

use anyhow::Result;
use nvim_rpc::{Address, Disconnect, Handlers, RpcError, RpcServer, RpcStream, StreamEvent, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handlers for a pretend editor.
fn editor_handlers() -> Handlers {
    Handlers::new()
        .on_call("vim_eval", |params| async move {
            match params.first().and_then(|v| v.as_str()) {
                Some("1+1") => Ok(Value::from("2")),
                Some("2+2") => Ok(Value::from("4")),
                _ => Err(Value::from("E15: Invalid expression")),
            }
        })
        .on_request("slow", |_params, responder| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            responder.result(Value::from("done"));
        })
}

#[tokio::test]
async fn test_tcp_request_response() -> Result<()> {
    let mut server = RpcServer::bind(&Address::tcp("127.0.0.1", 0), Arc::new(editor_handlers())).await?;
    let client = RpcStream::connect(server.addr()).await?;
    let _session = server.accept().await.expect("server accepted the client");

    assert_eq!(client.invoke("vim_eval", vec![Value::from("1+1")]).await?, Value::from("2"));
    assert_eq!(client.invoke("vim_eval", vec![Value::from("2+2")]).await?, Value::from("4"));

    let err = client.invoke("vim_eval", vec![Value::from("?")]).await.unwrap_err();
    assert_eq!(err.remote_payload(), Some(&Value::from("E15: Invalid expression")));

    Ok(())
}

#[tokio::test]
async fn test_server_calls_back_into_client() -> Result<()> {
    let mut server = RpcServer::bind(&Address::tcp("127.0.0.1", 0), Arc::new(Handlers::new())).await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client_handlers = Handlers::new()
        .on_call("client_name", |_| async { Ok(Value::from("nvim-rpc-test")) })
        .on_notification("redraw", move |params| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(params);
            }
        });
    let _client = RpcStream::connect_with_handler(server.addr(), Arc::new(client_handlers)).await?;
    let session = server.accept().await.expect("server accepted the client");

    assert_eq!(session.invoke("client_name", vec![]).await?, Value::from("nvim-rpc-test"));

    session.notify("redraw", vec![Value::from("flush")])?;
    assert_eq!(seen_rx.recv().await, Some(vec![Value::from("flush")]));

    Ok(())
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending_call() -> Result<()> {
    let mut server = RpcServer::bind(&Address::tcp("127.0.0.1", 0), Arc::new(editor_handlers())).await?;
    let client = RpcStream::connect(server.addr()).await?;
    let session = server.accept().await.expect("server accepted the client");

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("slow", vec![]).await }
    });

    // Give the request time to reach the server before it hangs up
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close();
    drop(session);

    match pending.await? {
        Err(RpcError::ConnectionClosed { reason }) => assert_eq!(reason, "connection closed by peer"),
        other => panic!("Expected ConnectionClosed, got: {:?}", other),
    }
    assert_eq!(client.closed().await, Disconnect::Peer);

    Ok(())
}

#[tokio::test]
async fn test_timeout_keeps_connection_usable() -> Result<()> {
    let mut server = RpcServer::bind(&Address::tcp("127.0.0.1", 0), Arc::new(editor_handlers())).await?;
    let client = RpcStream::connect(server.addr()).await?;
    let _session = server.accept().await.expect("server accepted the client");
    let mut events = client.subscribe();

    client.set_timeout(Some(Duration::from_millis(20)));
    let err = client.invoke("slow", vec![]).await.unwrap_err();
    assert!(err.is_retryable());

    // The late answer surfaces as an anomaly, not a failure
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await??;
    assert!(matches!(event, StreamEvent::ProtocolError(RpcError::UnmatchedResponse { .. })));

    client.set_timeout(None);
    assert_eq!(client.invoke("vim_eval", vec![Value::from("1+1")]).await?, Value::from("2"));

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let address = Address::unix(dir.path().join("nvim.sock"));

    let mut server = RpcServer::bind(&address, Arc::new(editor_handlers())).await?;
    let client = RpcStream::connect(&address).await?;
    let _session = server.accept().await.expect("server accepted the client");

    assert_eq!(client.invoke("vim_eval", vec![Value::from("1+1")]).await?, Value::from("2"));

    client.close();
    assert_eq!(client.closed().await, Disconnect::Local);

    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_file_removed_on_drop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nvim.sock");

    let server = RpcServer::bind(&Address::unix(&path), Arc::new(Handlers::new())).await?;
    assert!(path.exists());
    drop(server);

    // The accept task owns the listener and is aborted on drop
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!path.exists());

    Ok(())
}
