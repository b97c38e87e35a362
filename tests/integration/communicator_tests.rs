//! Integration tests for the per-connection protocol engine.
//!
//! Covers header parsing, on-demand stdin requests, heartbeat and
//! disconnect listeners, and the exit/close ordering.

use std::sync::Arc;
use std::time::Duration;

use nailgun::communicator::{Communicator, DisconnectReason};
use nailgun::protocol::ChunkType;
use nailgun::AppError;
use tokio::sync::mpsc;

use super::test_helpers::{connection, WAIT};

const NO_TIMEOUT: Duration = Duration::ZERO;

async fn recv_reason(rx: &mut mpsc::UnboundedReceiver<DisconnectReason>) -> DisconnectReason {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("disconnect within timeout")
        .expect("listener channel open")
}

#[test]
fn communicator_can_be_shared_across_tasks() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Communicator>();
    assert_send_sync::<nailgun::nail::NailContext>();
}

#[tokio::test]
async fn header_chunks_build_command_context() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);

    client.send(ChunkType::Argument, "one").await;
    client.send(ChunkType::Environment, "A=1").await;
    client.send(ChunkType::Argument, "two").await;
    client.send(ChunkType::Environment, "malformed").await;
    client.send(ChunkType::Environment, "A=2").await;
    client.send(ChunkType::WorkingDirectory, "/work").await;
    client.send(ChunkType::Command, "echo").await;

    let context = comm.read_command_context().await.expect("header");
    assert_eq!(context.command, "echo");
    assert_eq!(context.arguments, vec!["one", "two"]);
    assert_eq!(context.working_directory, "/work");
    assert_eq!(context.environment.get("A"), Some("2"));
    assert_eq!(context.environment.len(), 1);
}

#[tokio::test]
async fn heartbeat_during_header_is_ignored() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);

    client.send(ChunkType::Heartbeat, "").await;
    client.send(ChunkType::Argument, "x").await;
    client.send(ChunkType::Heartbeat, "").await;
    client.send(ChunkType::Command, "echo").await;

    let context = comm.read_command_context().await.expect("header");
    assert_eq!(context.arguments, vec!["x"]);
}

#[tokio::test]
async fn stdin_before_command_is_protocol_error() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);

    client.send(ChunkType::Stdin, "early").await;

    let err = comm
        .read_command_context()
        .await
        .expect_err("stdin in header must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn silent_client_times_out_during_header() {
    let (stream, _client) = connection();
    let mut comm = Communicator::new(stream, Duration::from_millis(100));
    assert_eq!(comm.read_timeout(), Some(Duration::from_millis(110)));

    let err = comm
        .read_command_context()
        .await
        .expect_err("silent client must time out");
    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn closed_stream_before_command_is_io_error() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);

    client.send(ChunkType::Argument, "orphan").await;
    drop(client);

    let err = comm
        .read_command_context()
        .await
        .expect_err("closed stream must fail");
    assert!(matches!(err, AppError::Io(_)), "got {err:?}");
}

#[tokio::test]
async fn input_is_requested_only_when_needed() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("cat", &[]).await;
    comm.read_command_context().await.expect("header");
    let comm = Arc::new(comm);

    assert!(
        client.try_next(Duration::from_millis(100)).await.is_none(),
        "no SEND_INPUT before anyone reads"
    );

    let reader = Arc::clone(&comm);
    let first = tokio::spawn(async move {
        let mut buf = [0_u8; 2];
        let n = reader.receive(&mut buf).await.expect("receive");
        buf[..n].to_vec()
    });

    let request = client.next().await.expect("SEND_INPUT");
    assert_eq!(request.kind, ChunkType::SendInput);
    client.send(ChunkType::Stdin, "abc").await;

    assert_eq!(first.await.expect("join"), b"ab");
    assert_eq!(comm.available(), 1);

    let mut buf = [0_u8; 8];
    let n = comm.receive(&mut buf).await.expect("staged byte");
    assert_eq!(&buf[..n], b"c");
    assert!(
        client.try_next(Duration::from_millis(100)).await.is_none(),
        "staged bytes are served without another SEND_INPUT"
    );
}

#[tokio::test]
async fn stdin_eof_ends_input() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("cat", &[]).await;
    comm.read_command_context().await.expect("header");
    let comm = Arc::new(comm);

    let reader = Arc::clone(&comm);
    let read = tokio::spawn(async move {
        let mut buf = [0_u8; 8];
        reader.receive(&mut buf).await.expect("receive")
    });

    assert_eq!(
        client.next().await.map(|chunk| chunk.kind),
        Some(ChunkType::SendInput)
    );
    client.send(ChunkType::StdinEof, "").await;

    assert_eq!(read.await.expect("join"), 0);
    let mut buf = [0_u8; 8];
    assert_eq!(comm.receive(&mut buf).await.expect("receive after eof"), 0);
}

#[tokio::test]
async fn unsolicited_second_stdin_is_internal_error() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("cat", &[]).await;
    comm.read_command_context().await.expect("header");

    let (tx, mut rx) = mpsc::unbounded_channel();
    comm.add_disconnect_listener(move |reason: DisconnectReason| {
        let _ = tx.send(reason);
    });

    client.send(ChunkType::Stdin, "a").await;
    client.send(ChunkType::Stdin, "b").await;

    assert_eq!(recv_reason(&mut rx).await, DisconnectReason::InternalError);
    assert!(!comm.is_client_connected());
}

#[tokio::test]
async fn heartbeat_listeners_fire_per_heartbeat() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("wait", &[]).await;
    comm.read_command_context().await.expect("header");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = comm.add_heartbeat_listener(move || {
        let _ = tx.send(());
    });

    client.send(ChunkType::Heartbeat, "").await;
    client.send(ChunkType::Heartbeat, "").await;
    for _ in 0..2 {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("heartbeat within timeout")
            .expect("listener channel open");
    }

    assert!(comm.remove_heartbeat_listener(id));
    assert!(!comm.remove_heartbeat_listener(id));
    assert!(comm.is_client_connected());
}

#[tokio::test]
async fn heartbeat_timeout_notifies_every_listener_once() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, Duration::from_millis(100));
    client.send_header("wait", &[]).await;
    comm.read_command_context().await.expect("header");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let early = tx.clone();
    comm.add_disconnect_listener(move |reason: DisconnectReason| {
        let _ = early.send(reason);
    });

    assert_eq!(recv_reason(&mut rx).await, DisconnectReason::HeartbeatTimeout);
    assert!(!comm.is_client_connected());

    comm.add_disconnect_listener(move |reason: DisconnectReason| {
        let _ = tx.send(reason);
    });
    assert_eq!(
        recv_reason(&mut rx).await,
        DisconnectReason::HeartbeatTimeout,
        "late listener is notified right away"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no duplicate notifications");
}

#[tokio::test]
async fn client_hangup_is_socket_error() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("wait", &[]).await;
    comm.read_command_context().await.expect("header");

    let (tx, mut rx) = mpsc::unbounded_channel();
    comm.add_disconnect_listener(move |reason: DisconnectReason| {
        let _ = tx.send(reason);
    });
    drop(client);

    assert_eq!(recv_reason(&mut rx).await, DisconnectReason::SocketError);

    let mut buf = [0_u8; 4];
    assert_eq!(
        comm.receive(&mut buf).await.expect("receive"),
        0,
        "stdin reads end once the client is gone"
    );
}

#[tokio::test]
async fn exit_sends_code_once_and_closes_output() {
    let (stream, mut client) = connection();
    let mut comm = Communicator::new(stream, NO_TIMEOUT);
    client.send_header("done", &[]).await;
    comm.read_command_context().await.expect("header");

    let (tx, mut rx) = mpsc::unbounded_channel();
    comm.add_disconnect_listener(move |reason: DisconnectReason| {
        let _ = tx.send(reason);
    });

    comm.send(ChunkType::Stdout, "bye").await.expect("stdout");
    comm.exit(3).await;
    comm.exit(4).await;
    assert!(comm.has_exited());

    let stdout = client.next().await.expect("stdout chunk");
    assert_eq!(stdout.kind, ChunkType::Stdout);
    let exit = client.next().await.expect("exit chunk");
    assert_eq!(
        (exit.kind, exit.payload_text()),
        (ChunkType::Exit, "3".to_owned())
    );
    assert!(client.next().await.is_none(), "stream ends after EXIT");

    assert_eq!(recv_reason(&mut rx).await, DisconnectReason::SessionShutdown);

    let err = comm
        .send(ChunkType::Stdout, "late")
        .await
        .expect_err("output is closed");
    assert!(matches!(err, AppError::Io(_)), "got {err:?}");

    tokio::time::timeout(WAIT, comm.close())
        .await
        .expect("close finishes");
    comm.close().await;
}
