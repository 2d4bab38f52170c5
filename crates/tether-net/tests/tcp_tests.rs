//! Tests for the TCP connection service in server and client mode.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tether_core::ShutdownPolicy;
use tether_net::tcp::{ConnectionInput, ConnectionOutput};
use tether_net::{ConnectionService, EndpointConfig, ServiceState};

fn quick_policy() -> ShutdownPolicy {
    ShutdownPolicy::new(Duration::from_millis(500), Duration::from_millis(500))
}

fn start_server<H>(config: EndpointConfig, handler: H) -> (Arc<ConnectionService>, JoinHandle<bool>)
where
    H: Fn(ConnectionInput, ConnectionOutput) + Send + Sync + 'static,
{
    let server = Arc::new(ConnectionService::with_shutdown_policy(
        config.local_only(true),
        quick_policy(),
    ));
    assert_eq!(server.state(), ServiceState::ServerReady, "{}", server.last_error_message());

    let accept_loop = {
        let server = server.clone();
        thread::spawn(move || server.accept(handler))
    };
    (server, accept_loop)
}

fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(flag.load(Ordering::SeqCst));
}

fn client_for(server: &ConnectionService) -> ConnectionService {
    let port = server.config().port.unwrap();
    ConnectionService::new(EndpointConfig::client("127.0.0.1", port).timeout(Duration::from_secs(5)))
}

#[test]
fn test_echo_round_trip() {
    let (server, accept_loop) = start_server(EndpointConfig::server(0, 5, 2), |input, output| {
        for line in input {
            output.println(&line.to_uppercase());
        }
    });

    let client = client_for(&server);
    assert_eq!(client.state(), ServiceState::ClientReady);

    let connection = client.connect().expect("client should connect");
    assert!(connection.output().println("hello"));
    assert_eq!(connection.input().next_line().as_deref(), Some("HELLO"));

    // Repeat calls reuse the open connection.
    let again = client.connect().unwrap();
    assert_eq!(again.id(), connection.id());

    client.close();
    assert!(!connection.is_open());
    assert_eq!(client.state(), ServiceState::Closed);

    server.close();
    assert!(accept_loop.join().unwrap());
    assert!(!server.is_listening());
}

#[test]
fn test_max_concurrent_bounds_running_handlers() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (server, accept_loop) = {
        let active = active.clone();
        let peak = peak.clone();
        start_server(EndpointConfig::server(0, 5, 2), move |input, output| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(150));
            if let Some(line) = input.next_line() {
                output.println(&format!("done {line}"));
            }
            active.fetch_sub(1, Ordering::SeqCst);
        })
    };

    let clients: Vec<_> = (0..5)
        .map(|i| {
            let client = client_for(&server);
            thread::spawn(move || {
                let connection = client.connect().expect("client should connect");
                connection.output().println(&i.to_string());
                let reply = connection.input().next_line();
                client.close();
                reply
            })
        })
        .collect();

    let mut replies: Vec<String> = clients
        .into_iter()
        .map(|c| c.join().unwrap().expect("every client gets a reply"))
        .collect();
    replies.sort();
    assert_eq!(replies, vec!["done 0", "done 1", "done 2", "done 3", "done 4"]);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    server.close();
    assert!(accept_loop.join().unwrap());
}

#[test]
fn test_panicking_handler_does_not_stop_server() {
    let served = Arc::new(AtomicUsize::new(0));
    let (server, accept_loop) = {
        let served = served.clone();
        start_server(EndpointConfig::new().port(0).max_concurrent(1), move |input, output| {
            let line = input.next_line().unwrap_or_default();
            if line == "boom" {
                panic!("handler failure");
            }
            served.fetch_add(1, Ordering::SeqCst);
            output.println("ok");
        })
    };

    let first_client = client_for(&server);
    let first = first_client.connect().unwrap();
    first.output().println("boom");
    // The socket is closed after the panic, so the reply is end of stream.
    assert_eq!(first.input().next_line(), None);

    let second_client = client_for(&server);
    let second = second_client.connect().unwrap();
    second.output().println("fine");
    assert_eq!(second.input().next_line().as_deref(), Some("ok"));
    assert_eq!(served.load(Ordering::SeqCst), 1);

    server.close();
    assert!(accept_loop.join().unwrap());
}

#[test]
fn test_connect_to_closed_port_reports_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = ConnectionService::new(
        EndpointConfig::client("127.0.0.1", port).timeout(Duration::from_secs(2)),
    );
    assert!(client.is_ready());
    assert!(client.connect().is_none());
    assert!(!client.last_error_message().is_empty());
    assert!(client.to_string().contains(", error: "));
}

#[test]
fn test_mode_mismatch_is_reported() {
    let server = ConnectionService::new(EndpointConfig::new().port(0).local_only(true));
    assert!(server.connect().is_none());
    assert_eq!(server.last_error_message(), "Cannot connect in server mode");

    let client = ConnectionService::new(EndpointConfig::client("127.0.0.1", 9));
    assert!(!client.accept(|_, _| {}));
    assert_eq!(client.last_error_message(), "Cannot accept in client mode");

    let unset = ConnectionService::new(EndpointConfig::new());
    assert!(unset.connect().is_none());
    assert!(!unset.accept(|_, _| {}));

    server.close();
}

#[test]
fn test_close_is_idempotent_while_accepting() {
    let (server, accept_loop) = start_server(EndpointConfig::new().port(0), |_, _| {});
    thread::sleep(Duration::from_millis(50));

    server.close();
    server.close();
    assert!(accept_loop.join().unwrap());
    assert_eq!(server.state(), ServiceState::Closed);
    assert_eq!(server.to_string(), "TCP[closed]");
    server.close();
}

#[test]
fn test_server_display() {
    let server = ConnectionService::new(EndpointConfig::server(0, 5, 2).local_only(true));
    let port = server.config().port.unwrap();
    assert_eq!(
        server.to_string(),
        format!(
            "TCP{{server, ready, NetworkProperties{{port: {port}, backlog: 5, maxConcurrent: 2, localOnly: true}}}}"
        )
    );
    server.close();
}

#[test]
fn test_close_cancels_handler_blocked_on_read() {
    let entered = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let (server, accept_loop) = {
        let entered = entered.clone();
        let exited = exited.clone();
        start_server(EndpointConfig::server(0, 5, 1), move |input, _output| {
            entered.store(true, Ordering::SeqCst);
            // The client never writes, so only cancellation ends this read.
            if input.next_line().is_none() {
                exited.store(true, Ordering::SeqCst);
            }
        })
    };

    let client = client_for(&server);
    let connection = client.connect().unwrap();
    wait_for(&entered);

    let started = Instant::now();
    server.close();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(accept_loop.join().unwrap());
    wait_for(&exited);
    assert!(server.last_error_message().is_empty());

    // The server side shut the socket down.
    assert_eq!(connection.input().next_line(), None);
    client.close();
}

#[test]
fn test_close_cancels_handler_blocked_on_write() {
    let entered = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let (server, accept_loop) = {
        let entered = entered.clone();
        let exited = exited.clone();
        start_server(EndpointConfig::server(0, 5, 1), move |_input, output| {
            entered.store(true, Ordering::SeqCst);
            let chunk = "x".repeat(64 * 1024);
            // The client never reads, so the send buffer fills and this parks.
            while output.println(&chunk) {}
            exited.store(true, Ordering::SeqCst);
        })
    };

    let client = client_for(&server);
    let _connection = client.connect().unwrap();
    wait_for(&entered);
    thread::sleep(Duration::from_millis(200));

    let closer = {
        let server = server.clone();
        thread::spawn(move || {
            let started = Instant::now();
            server.close();
            started.elapsed()
        })
    };
    let elapsed = closer.join().unwrap();
    assert!(elapsed < Duration::from_secs(3), "close took {elapsed:?}");
    assert!(accept_loop.join().unwrap());
    wait_for(&exited);

    client.close();
}
