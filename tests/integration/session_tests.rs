//! Integration tests for serving one connection through a pooled session.
//!
//! Each test hands an in-memory connection to a session and checks the
//! exact chunk sequence the client sees.

use std::time::Duration;

use nailgun::nail::{CommandRegistry, Completion, Nail, NailContext, NailFuture};
use nailgun::protocol::ChunkType;
use nailgun::AppError;

use super::test_helpers::{connection, test_pool, wait_until, Transcript};

const TERMINATION: Duration = Duration::from_secs(2);

struct Failing;

impl Nail for Failing {
    fn run<'a>(&'a self, _ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async { Err(AppError::Nail("deliberate failure".into())) })
    }
}

struct Panicking;

impl Nail for Panicking {
    fn run<'a>(&'a self, _ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async { explode() })
    }
}

fn explode() -> nailgun::Result<Completion> {
    panic!("deliberate panic")
}

/// Exits with 7, then fails anyway.
struct ExitThenFail;

impl Nail for ExitThenFail {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            ctx.exit(7).await;
            Err(AppError::Nail("failed after exit".into()))
        })
    }
}

/// Writes its arguments and the `NAME` variable to stdout and stderr.
struct Report;

impl Nail for Report {
    fn run<'a>(&'a self, ctx: &'a mut NailContext) -> NailFuture<'a> {
        Box::pin(async move {
            ctx.stdout.write_all(ctx.arguments.join(",").as_bytes()).await?;
            let name = ctx.environment.get("NAME").unwrap_or("?").to_owned();
            ctx.stderr.write_all(name.as_bytes()).await?;
            Ok(Completion::Returned)
        })
    }
}

fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::with_builtins();
    registry.register("fail", Failing);
    registry.register("panic", Panicking);
    registry.register("exit-then-fail", ExitThenFail);
    registry.register("report", Report);
    registry
}

async fn run_once(command: &str, arguments: &[&str], stdin: &str) -> Transcript {
    let (pool, _control) = test_pool(registry(), 2, TERMINATION);
    let (stream, mut client) = connection();
    pool.take().expect("session").assign(stream).expect("assign");

    client.send_header(command, arguments).await;
    let transcript = client.run_to_exit(stdin).await;
    pool.shutdown().await.expect("pool drains");
    transcript
}

#[tokio::test]
async fn echo_copies_stdin_then_exits_zero() {
    let transcript = run_once("echo", &[], "hi").await;

    assert_eq!(
        transcript.pairs(),
        vec![
            (ChunkType::Stdout, "hi".to_owned()),
            (ChunkType::Exit, "0".to_owned()),
        ]
    );
    assert_eq!(transcript.input_requests, 2, "one for data, one for EOF");
}

#[tokio::test]
async fn explicit_exit_sends_only_exit() {
    let transcript = run_once("exit", &["42"], "").await;

    assert_eq!(transcript.pairs(), vec![(ChunkType::Exit, "42".to_owned())]);
    assert_eq!(transcript.input_requests, 0, "stdin is never requested");
}

#[tokio::test]
async fn unknown_command_exits_898() {
    let transcript = run_once("no-such-thing", &[], "").await;
    assert_eq!(transcript.exit_code(), 898);
    assert_eq!(transcript.chunks.len(), 1);
}

#[tokio::test]
async fn failing_nail_exits_899() {
    assert_eq!(run_once("fail", &[], "").await.exit_code(), 899);
}

#[tokio::test]
async fn panicking_nail_exits_899() {
    assert_eq!(run_once("panic", &[], "").await.exit_code(), 899);
}

#[tokio::test]
async fn first_exit_code_wins() {
    let transcript = run_once("exit-then-fail", &[], "").await;
    assert_eq!(transcript.pairs(), vec![(ChunkType::Exit, "7".to_owned())]);
}

#[tokio::test]
async fn nail_sees_arguments_and_environment() {
    let (pool, _control) = test_pool(registry(), 2, TERMINATION);
    let (stream, mut client) = connection();
    pool.take().expect("session").assign(stream).expect("assign");

    client.send(ChunkType::Argument, "a").await;
    client.send(ChunkType::Argument, "b").await;
    client.send(ChunkType::Environment, "NAME=nailgun").await;
    client.send(ChunkType::WorkingDirectory, "/").await;
    client.send(ChunkType::Command, "report").await;

    let transcript = client.run_to_exit("").await;
    assert_eq!(
        transcript.pairs(),
        vec![
            (ChunkType::Stdout, "a,b".to_owned()),
            (ChunkType::Stderr, "nailgun".to_owned()),
            (ChunkType::Exit, "0".to_owned()),
        ]
    );
    pool.shutdown().await.expect("pool drains");
}

#[tokio::test]
async fn malformed_header_exits_899() {
    let (pool, _control) = test_pool(registry(), 2, TERMINATION);
    let (stream, mut client) = connection();
    pool.take().expect("session").assign(stream).expect("assign");

    client.send(ChunkType::Stdout, "wrong direction").await;

    let exit = client.next().await.expect("exit chunk");
    assert_eq!(
        (exit.kind, exit.payload_text()),
        (ChunkType::Exit, "899".to_owned())
    );
    assert!(client.next().await.is_none());
    pool.shutdown().await.expect("pool drains");
}

#[tokio::test]
async fn session_returns_to_pool_and_serves_again() {
    let (pool, control) = test_pool(registry(), 2, TERMINATION);

    let (stream, mut client) = connection();
    let session = pool.take().expect("session");
    let first_id = session.id();
    session.assign(stream).expect("assign");
    client.send_header("exit", &["1"]).await;
    assert_eq!(client.run_to_exit("").await.exit_code(), 1);

    wait_until(|| pool.idle_count() == 1 && pool.busy_count() == 0).await;

    let (stream, mut client) = connection();
    let session = pool.take().expect("cached session");
    assert_eq!(session.id(), first_id, "idle session is reused");
    session.assign(stream).expect("assign");
    client.send_header("exit", &["2"]).await;
    assert_eq!(client.run_to_exit("").await.exit_code(), 2);

    let stats = control.stats().snapshot();
    assert_eq!(stats["exit"].runs, 2);
    assert_eq!(stats["exit"].active, 0);

    pool.shutdown().await.expect("pool drains");
}

#[tokio::test]
async fn busy_session_rejects_second_assignment() {
    let (pool, _control) = test_pool(registry(), 2, TERMINATION);
    let session = pool.take().expect("session");

    let (first, _first_client) = connection();
    let (second, _second_client) = connection();
    let (third, _third_client) = connection();
    session.assign(first).expect("first assignment");

    // The first stream may still sit in the single-slot queue.
    let second_ok = session.assign(second).is_ok();
    let third = session.assign(third);
    assert!(
        !second_ok || third.is_err(),
        "at most one connection can be queued"
    );

    session.shutdown();
    let err = session
        .assign(connection().0)
        .expect_err("shut down session refuses work");
    assert!(matches!(err, AppError::Session(_)), "got {err:?}");
}
