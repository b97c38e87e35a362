//! Unit tests for client request framing and exit code parsing.

use nailgun::client::{parse_exit_code, CommandRequest};
use nailgun::protocol::ChunkType;
use nailgun::AppError;

#[test]
fn header_chunks_follow_wire_order() {
    let request = CommandRequest {
        command: "echo".into(),
        arguments: vec!["a".into(), "b".into()],
        environment: vec![("HOME".into(), "/home/ng".into())],
        working_directory: "/work".into(),
    };

    let chunks = request.header_chunks();
    let kinds: Vec<ChunkType> = chunks.iter().map(|chunk| chunk.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChunkType::Argument,
            ChunkType::Argument,
            ChunkType::Environment,
            ChunkType::WorkingDirectory,
            ChunkType::Command,
        ]
    );
    assert_eq!(chunks[2].payload_text(), "HOME=/home/ng");
    assert_eq!(chunks[4].payload_text(), "echo");
}

#[test]
fn minimal_request_still_sends_directory() {
    let chunks = CommandRequest::new("ng-version").header_chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].kind, ChunkType::WorkingDirectory);
    assert!(chunks[0].payload.is_empty());
}

#[test]
fn exit_code_tolerates_trailing_newline() {
    assert_eq!(parse_exit_code("0").expect("zero"), 0);
    assert_eq!(parse_exit_code("898\n").expect("newline"), 898);
    assert_eq!(parse_exit_code("-1").expect("negative"), -1);
}

#[test]
fn malformed_exit_code_is_protocol_error() {
    let err = parse_exit_code("done").expect_err("not a number");
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}
