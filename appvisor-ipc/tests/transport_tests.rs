//! End-to-end transport tests over a real Unix socket.

use appvisor_ipc::{IpcClient, IpcServer, Request, Response, ResultCode};

#[tokio::test]
async fn test_request_reply_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctrl.sock");

    let server = IpcServer::bind(&path).unwrap();

    let server_task = tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let (mut requests, mut replies) = conn.into_split();

        match requests.recv().await.unwrap() {
            Some(Request::Start { app }) => {
                assert_eq!(app, "echo");
                replies.send(&Response::Done { code: ResultCode::Ok }).await.unwrap();
            }
            other => panic!("unexpected request: {other:?}"),
        }

        // Client disconnect shows up as end of stream.
        assert!(requests.recv().await.unwrap().is_none());
    });

    let mut client = IpcClient::connect(&path).await.unwrap();
    let reply = client.call(&Request::Start { app: "echo".to_string() }).await.unwrap();
    assert!(matches!(reply, Response::Done { code: ResultCode::Ok }));

    drop(client);
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_multiple_events_on_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctrl.sock");

    let server = IpcServer::bind(&path).unwrap();

    tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let (mut requests, mut replies) = conn.into_split();
        requests.recv().await.unwrap();

        for i in 0..3 {
            replies
                .send(&Response::ProcOutput {
                    stream: appvisor_ipc::StdStream::Stdout,
                    line: format!("line {i}"),
                })
                .await
                .unwrap();
        }
        replies
            .send(&Response::ProcExited {
                status: appvisor_core::ExitStatus::exited(0),
            })
            .await
            .unwrap();
    });

    let mut client = IpcClient::connect(&path).await.unwrap();
    client
        .send(&Request::RunProc {
            app: "svc".to_string(),
            proc: None,
            exec: Some("/bin/probe".to_string()),
            args: vec![],
        })
        .await
        .unwrap();

    let mut lines = Vec::new();
    loop {
        match client.recv().await.unwrap() {
            Response::ProcOutput { line, .. } => lines.push(line),
            Response::ProcExited { status } => {
                assert!(status.success());
                break;
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
    assert_eq!(lines, vec!["line 0", "line 1", "line 2"]);
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ctrl.sock");

    drop(IpcServer::bind(&path).unwrap());
    let server = IpcServer::bind(&path).unwrap();

    tokio::spawn(async move {
        let conn = server.accept().await.unwrap();
        let (mut requests, mut replies) = conn.into_split();
        requests.recv().await.unwrap();
        replies
            .send(&Response::Version { version: "test".to_string() })
            .await
            .unwrap();
    });

    let mut client = IpcClient::connect(&path).await.unwrap();
    let reply = client.call(&Request::Version).await.unwrap();
    assert!(matches!(reply, Response::Version { .. }));
}
