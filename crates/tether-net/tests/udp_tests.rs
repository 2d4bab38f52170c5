//! Tests for the UDP datagram service.

use std::time::{Duration, Instant};

use tether_net::{DatagramService, DatagramState, EndpointConfig, Packet};

fn loopback(timeout: Duration) -> DatagramService {
    let service = DatagramService::new(EndpointConfig::new().port(0).local_only(true).timeout(timeout));
    assert!(service.is_ready(), "{}", service.last_error_message());
    service
}

#[test]
fn test_loopback_round_trip() {
    let receiver = loopback(Duration::from_secs(2));
    let sender = loopback(Duration::from_secs(2));
    let port = receiver.config().port.unwrap();

    let content = "héllo, datagram ✓";
    assert!(sender.send(&Packet::to("127.0.0.1", port, content)));

    let packet = receiver.receive().expect("packet should arrive");
    assert_eq!(packet.content(), content);
    assert_eq!(packet.host(), Some("127.0.0.1"));
    assert_eq!(packet.port(), sender.config().port);

    sender.close();
    receiver.close();
}

#[test]
fn test_packets_arrive_in_order() {
    let receiver = loopback(Duration::from_secs(2));
    let sender = loopback(Duration::from_secs(2));
    let port = receiver.config().port.unwrap();

    for i in 0..5 {
        assert!(sender.send(&Packet::to("127.0.0.1", port, format!("message {i}"))));
    }

    let received: Vec<String> = (0..5)
        .filter_map(|_| receiver.receive())
        .map(Packet::into_content)
        .collect();
    assert_eq!(
        received,
        vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
    );
    assert!(!receiver.has_next());
    assert!(receiver.next().is_none());
}

#[test]
fn test_receive_times_out() {
    let receiver = loopback(Duration::from_millis(200));

    let started = Instant::now();
    assert!(receiver.receive().is_none());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(150));
    assert!(waited < Duration::from_secs(2));
    assert!(receiver.last_error_message().is_empty());
}

#[test]
fn test_next_polls_without_blocking() {
    let receiver = loopback(Duration::from_secs(5));
    let started = Instant::now();
    assert!(receiver.next().is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_send_without_destination_fails() {
    let sender = loopback(Duration::from_secs(1));

    assert!(!sender.send(&Packet::new(EndpointConfig::new().host("127.0.0.1"), "no port")));
    assert_eq!(sender.last_error_message(), "Packet must have destination host and port");

    // A good send clears the previous error.
    let receiver = loopback(Duration::from_secs(1));
    assert!(sender.send(&Packet::to("127.0.0.1", receiver.config().port.unwrap(), "ok")));
    assert!(sender.last_error_message().is_empty());
}

#[test]
fn test_missing_port_is_unset() {
    let service = DatagramService::new(EndpointConfig::new().local_only(true));
    assert_eq!(service.state(), DatagramState::Unset);
    assert_eq!(service.last_error_message(), "Port is required for UDP socket creation");
    assert!(!service.send(&Packet::to("127.0.0.1", 9, "unused")));
    assert!(service.receive().is_none());
    service.close();
    assert_eq!(service.state(), DatagramState::Unset);
}

#[test]
fn test_close_is_idempotent() {
    let receiver = loopback(Duration::from_millis(100));
    let sender = loopback(Duration::from_millis(100));
    let port = receiver.config().port.unwrap();

    assert!(!receiver.has_next());
    sender.send(&Packet::to("127.0.0.1", port, "queued"));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !receiver.has_next() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(receiver.queued(), 1);

    let started = Instant::now();
    receiver.close();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(receiver.state(), DatagramState::Closed);
    assert_eq!(receiver.queued(), 0);
    assert_eq!(receiver.to_string(), "UDP{}");

    receiver.close();
    assert_eq!(receiver.state(), DatagramState::Closed);
}
