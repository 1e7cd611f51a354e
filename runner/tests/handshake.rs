//! End-to-end handshake tests: a worker-side `RunnerConnection` against a
//! scripted runner peer living on its own thread and runtime.

use std::future::Future;
use std::thread;
use std::time::Duration;

use childlink_runner::codec::{FrameReader, FrameWriter};
use childlink_runner::protocol::{exit_now_notification, parse_completion, start_app_request};
use childlink_runner::{
    AppResult, ChannelHandle, ChannelStream, ConnectionOptions, FatalError, RunnerConnection,
    ServiceRequest, StartParams, connect_to_runner, fatal_channel,
};
use tokio::io::{ReadHalf, WriteHalf};
use url::Url;

struct Peer {
    reader: FrameReader<ReadHalf<ChannelStream>>,
    writer: FrameWriter<WriteHalf<ChannelStream>>,
}

impl Peer {
    async fn send(&mut self, frame: serde_json::Value) {
        self.writer.write_frame(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Option<serde_json::Value> {
        self.reader.read_frame().await.ok().flatten()
    }
}

/// Run `script` as the runner on the other end of `handle`. The channel is
/// closed when the script returns.
fn spawn_peer<F, Fut>(handle: ChannelHandle, script: F) -> thread::JoinHandle<Fut::Output>
where
    F: FnOnce(Peer) -> Fut + Send + 'static,
    Fut: Future,
    Fut::Output: Send + 'static,
{
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let stream = handle.into_stream().unwrap();
            let (read_half, write_half) = tokio::io::split(stream);
            script(Peer {
                reader: FrameReader::new(read_half),
                writer: FrameWriter::new(write_half),
            })
            .await
        })
    })
}

fn echo_request() -> ServiceRequest {
    ServiceRequest::new(Url::parse("app://echo").unwrap())
        .with_qualifier("test")
        .with_user_id(42)
        .with_payload(serde_json::json!({"greeting": "hello"}))
}

#[test]
fn delivers_request_and_reports_result_on_teardown() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(1, &echo_request())).await;
        peer.recv().await
    });

    let (fatal, coordinator) = fatal_channel();
    let (connection, request) =
        connect_to_runner(Some(worker_end), true, ConnectionOptions::default(), fatal)
            .unwrap()
            .expect("request should be delivered");
    assert_eq!(request, echo_request());
    assert_eq!(request.payload()["greeting"], "hello");

    connection.report_result(AppResult::Ok);
    drop(connection);

    let reply = peer.join().unwrap().expect("completion reply");
    assert_eq!(reply["id"], 1);
    assert_eq!(parse_completion(&reply), Some(AppResult::Ok));
    assert_eq!(coordinator.wait(), None);
}

#[test]
fn teardown_without_result_replies_unimplemented() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(7, &echo_request())).await;
        peer.recv().await
    });

    let (fatal, _coordinator) = fatal_channel();
    let (connection, _request) =
        connect_to_runner(Some(worker_end), false, ConnectionOptions::default(), fatal)
            .unwrap()
            .unwrap();
    drop(connection);

    let reply = peer.join().unwrap().unwrap();
    assert_eq!(reply["id"], 7);
    assert_eq!(parse_completion(&reply), Some(AppResult::Unimplemented));
}

#[test]
fn peer_closing_before_request_yields_none_without_fatal() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |_peer| async {});

    let (fatal, coordinator) = fatal_channel();
    let outcome = connect_to_runner(Some(worker_end), true, ConnectionOptions::default(), fatal)
        .unwrap();
    assert!(outcome.is_none());
    peer.join().unwrap();
    assert_eq!(coordinator.wait(), None);
}

#[test]
fn no_handle_and_no_token_yields_none() {
    let (fatal, coordinator) = fatal_channel();
    let outcome = connect_to_runner(None, true, ConnectionOptions::default(), fatal).unwrap();
    assert!(outcome.is_none());
    assert_eq!(coordinator.wait(), None);
}

#[test]
fn close_after_request_is_fatal_with_exit_on_error() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(1, &echo_request())).await;
    });

    let (fatal, coordinator) = fatal_channel();
    let (connection, _request) =
        connect_to_runner(Some(worker_end), true, ConnectionOptions::default(), fatal)
            .unwrap()
            .unwrap();
    peer.join().unwrap();

    assert_eq!(coordinator.wait(), Some(FatalError::ConnectionLost));
    assert_eq!(FatalError::ConnectionLost.exit_code(), 1);
    drop(connection);
}

#[test]
fn close_after_request_is_absorbed_without_exit_on_error() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(1, &echo_request())).await;
    });

    let (fatal, coordinator) = fatal_channel();
    let (connection, _request) =
        connect_to_runner(Some(worker_end), false, ConnectionOptions::default(), fatal)
            .unwrap()
            .unwrap();
    peer.join().unwrap();
    thread::sleep(Duration::from_millis(50));

    drop(connection);
    assert_eq!(coordinator.wait(), None);
}

#[test]
fn exit_now_before_request_is_raised() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(exit_now_notification(7)).await;
    });

    let (fatal, coordinator) = fatal_channel();
    let outcome = connect_to_runner(Some(worker_end), false, ConnectionOptions::default(), fatal)
        .unwrap();
    assert!(outcome.is_none());
    peer.join().unwrap();
    assert_eq!(
        coordinator.wait(),
        Some(FatalError::ExitRequested { code: 7 })
    );
}

#[test]
fn exit_now_after_request_is_raised() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(1, &echo_request())).await;
        let _ = go_rx.await;
        peer.send(exit_now_notification(0)).await;
        peer.recv().await
    });

    let (fatal, coordinator) = fatal_channel();
    let watcher = coordinator
        .spawn_exit_watcher(|code| assert_eq!(code, 0))
        .unwrap();
    let (connection, _request) =
        connect_to_runner(Some(worker_end), false, ConnectionOptions::default(), fatal)
            .unwrap()
            .unwrap();
    go_tx.send(()).unwrap();

    thread::sleep(Duration::from_millis(50));
    drop(connection);
    assert_eq!(
        watcher.join().unwrap(),
        Some(FatalError::ExitRequested { code: 0 })
    );
    peer.join().unwrap();
}

#[test]
fn second_start_app_is_answered_with_error() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let peer = spawn_peer(runner_end, |mut peer| async move {
        peer.send(start_app_request(1, &echo_request())).await;
        let other = ServiceRequest::new(Url::parse("app://other").unwrap());
        peer.send(start_app_request(2, &other)).await;
        let first = peer.recv().await;
        let second = peer.recv().await;
        (first, second)
    });

    let (fatal, _coordinator) = fatal_channel();
    let (connection, request) =
        connect_to_runner(Some(worker_end), false, ConnectionOptions::default(), fatal)
            .unwrap()
            .unwrap();
    assert_eq!(request, echo_request());
    thread::sleep(Duration::from_millis(50));
    drop(connection);

    let (rejection, completion) = peer.join().unwrap();
    let rejection = rejection.unwrap();
    assert_eq!(rejection["id"], 2);
    assert_eq!(rejection["error"]["code"], -32600);
    let completion = completion.unwrap();
    assert_eq!(completion["id"], 1);
    assert_eq!(parse_completion(&completion), Some(AppResult::Unimplemented));
}

#[test]
fn caller_stays_blocked_until_peer_acts() {
    let (worker_end, runner_end) = ChannelHandle::pair();
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let peer = spawn_peer(runner_end, |peer| async move {
        let _ = close_rx.await;
        drop(peer);
    });

    let (fatal, _coordinator) = fatal_channel();
    let worker = thread::spawn(move || {
        let mut connection = RunnerConnection::start(ConnectionOptions::default(), fatal).unwrap();
        connection.bootstrap(Some(worker_end), false)
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!worker.is_finished(), "no timeout applies to the handshake");

    close_tx.send(()).unwrap();
    assert!(worker.join().unwrap().is_none());
    peer.join().unwrap();
}

#[cfg(unix)]
mod unix {
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::{UnixListener, UnixStream};

    use super::*;

    #[test]
    fn inherited_descriptor_from_start_params() {
        let (child_end, runner_end) = UnixStream::pair().unwrap();
        let token = format!("fd:{}", child_end.into_raw_fd());
        let peer = spawn_peer(
            ChannelHandle::from_unix_stream(runner_end),
            |mut peer| async move {
                peer.send(start_app_request(3, &echo_request())).await;
                peer.recv().await
            },
        );

        let options = ConnectionOptions::default()
            .with_start_params(StartParams::from_args(["--runner-channel", token.as_str()]));
        let (fatal, _coordinator) = fatal_channel();
        let (connection, request) = connect_to_runner(None, true, options, fatal)
            .unwrap()
            .unwrap();
        assert_eq!(request, echo_request());
        connection.report_result(AppResult::Aborted);
        drop(connection);

        let reply = peer.join().unwrap().unwrap();
        assert_eq!(parse_completion(&reply), Some(AppResult::Aborted));
    }

    #[test]
    fn socket_path_from_start_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let acceptor = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            spawn_peer(ChannelHandle::from_unix_stream(stream), |mut peer| async move {
                peer.send(start_app_request(1, &echo_request())).await;
                peer.recv().await
            })
            .join()
            .unwrap()
        });

        let options = ConnectionOptions::default().with_start_params(
            StartParams::with_channel_token(format!("unix:{}", path.display())),
        );
        let (fatal, _coordinator) = fatal_channel();
        let (connection, request) = connect_to_runner(None, true, options, fatal)
            .unwrap()
            .unwrap();
        assert_eq!(request.url().as_str(), "app://echo");
        drop(connection);

        let reply = acceptor.join().unwrap().unwrap();
        assert_eq!(parse_completion(&reply), Some(AppResult::Unimplemented));
    }

    #[test]
    fn socket_pair_peer_closing_yields_none() {
        let (worker_end, runner_end) = ChannelHandle::socket_pair().unwrap();
        drop(runner_end);

        let (fatal, coordinator) = fatal_channel();
        let outcome =
            connect_to_runner(Some(worker_end), true, ConnectionOptions::default(), fatal)
                .unwrap();
        assert!(outcome.is_none());
        assert_eq!(coordinator.wait(), None);
    }
}
