
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use harness::{config, connect_a, free_port, pattern, read_all, Capture, Event, RelayHandle};
use nix::sys::signal::Signal;
use tap_relay::relay::BufferSizes;
use tap_relay::{CancelToken, Direction, PipeStatus, RelayError};

fn small(size: usize) -> BufferSizes {
    BufferSizes {
        a_to_b: size,
        b_to_a: size,
    }
}

#[test]
fn large_transfer_through_small_buffer_arrives_intact() {
    let b_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let b_port = b_listener.local_addr().unwrap().port();
    let relay = RelayHandle::spawn(b_port, small(64));

    let payload = pattern(10_000);
    let sink = thread::spawn(move || {
        let (mut b, _) = b_listener.accept().unwrap();
        read_all(&mut b)
    });

    let mut a = connect_a(relay.a_addr);
    a.write_all(&payload).unwrap();
    a.shutdown(Shutdown::Write).unwrap();

    assert_eq!(sink.join().unwrap(), payload);
    assert!(read_all(&mut a).is_empty());

    let capture = relay.capture.clone();
    let report = relay.finish().unwrap();
    assert_eq!(report.a_to_b.status, PipeStatus::Closed);
    assert_eq!(report.a_to_b.received, 10_000);
    assert_eq!(report.a_to_b.delivered, 10_000);
    assert_eq!(report.b_to_a.status, PipeStatus::Closed);

    // spans are contiguous and never exceed the buffer
    let mut expected_offset = 0;
    for (offset, len) in capture.spans(Direction::AtoB) {
        assert_eq!(offset, expected_offset);
        assert!(len > 0 && len <= 64);
        expected_offset += len as u64;
    }
    assert_eq!(expected_offset, 10_000);
}

#[test]
fn stalled_consumer_reports_nothing_consumed_then_drains() {
    const LEN: usize = 4 * 1024 * 1024;

    let b_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let b_port = b_listener.local_addr().unwrap().port();
    let relay = RelayHandle::spawn(b_port, small(64));

    let mut a = connect_a(relay.a_addr);
    let (mut b, _) = b_listener.accept().unwrap();

    let payload = pattern(LEN);
    let mut a_writer = a.try_clone().unwrap();
    let sent = payload.clone();
    let writer = thread::spawn(move || {
        a_writer.write_all(&sent).unwrap();
        a_writer.shutdown(Shutdown::Write).unwrap();
    });

    // B reads nothing until the relay has read from A without B taking any
    let stalled = Event::Remaining {
        direction: Direction::AtoB,
        consumed: 0,
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while !relay.capture.contains(&stalled) {
        assert!(Instant::now() < deadline, "B never stalled the relay");
        thread::sleep(Duration::from_millis(10));
    }

    let received = read_all(&mut b);
    writer.join().unwrap();
    assert_eq!(received.len(), LEN);
    assert!(received == payload, "payload corrupted in transit");

    drop(b);
    assert!(read_all(&mut a).is_empty());

    let report = relay.finish().unwrap();
    assert_eq!(report.a_to_b.status, PipeStatus::Closed);
    assert_eq!(report.a_to_b.received, LEN as u64);
    assert_eq!(report.a_to_b.delivered, LEN as u64);
}

#[test]
fn producer_close_after_partial_delivery_ends_closed() {
    let b_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let b_port = b_listener.local_addr().unwrap().port();
    let relay = RelayHandle::spawn(b_port, small(2048));

    let mut a = connect_a(relay.a_addr);
    let (mut b, _) = b_listener.accept().unwrap();

    a.write_all(&pattern(100)).unwrap();
    let mut first = vec![0u8; 100];
    b.read_exact(&mut first).unwrap();
    assert_eq!(first, pattern(100));

    a.shutdown(Shutdown::Write).unwrap();

    // exactly what was sent, then EOF
    assert!(read_all(&mut b).is_empty());

    drop(b);
    assert!(read_all(&mut a).is_empty());

    let capture = relay.capture.clone();
    let report = relay.finish().unwrap();
    assert_eq!(report.a_to_b.status, PipeStatus::Closed);
    assert_eq!(report.a_to_b.delivered, 100);
    assert_eq!(report.b_to_a.received, 0);
    assert_eq!(capture.shutdowns(Direction::AtoB), 1);
    assert_eq!(capture.shutdowns(Direction::BtoA), 1);
}

#[test]
fn bidirectional_echo_session() {
    let b_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let b_port = b_listener.local_addr().unwrap().port();
    let relay = RelayHandle::spawn(b_port, small(16));

    let echo = thread::spawn(move || {
        let (mut b, _) = b_listener.accept().unwrap();
        let mut buf = [0u8; 256];
        loop {
            let n = b.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            b.write_all(&buf[..n]).unwrap();
        }
    });

    let mut a = connect_a(relay.a_addr);
    for round in 0..5 {
        let message = format!("round {round}: {}", "x".repeat(round * 20));
        a.write_all(message.as_bytes()).unwrap();

        let mut reply = vec![0u8; message.len()];
        a.read_exact(&mut reply).unwrap();
        assert_eq!(reply, message.as_bytes());
    }

    a.shutdown(Shutdown::Write).unwrap();
    assert!(read_all(&mut a).is_empty());
    echo.join().unwrap();

    let report = relay.finish().unwrap();
    assert_eq!(report.a_to_b.delivered, report.b_to_a.delivered);
    assert_eq!(report.a_to_b.status, PipeStatus::Closed);
    assert_eq!(report.b_to_a.status, PipeStatus::Closed);
}

#[test]
fn cancellation_closes_both_peers() {
    let b_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let b_port = b_listener.local_addr().unwrap().port();
    let relay = RelayHandle::spawn(b_port, small(2048));

    let mut a = connect_a(relay.a_addr);
    let (mut b, _) = b_listener.accept().unwrap();

    a.write_all(b"before").unwrap();
    let mut buf = [0u8; 6];
    b.read_exact(&mut buf).unwrap();

    // the detached token is only seen once the wait wakes up
    relay.cancel.cancel(Signal::SIGTERM);
    a.write_all(b"!").unwrap();

    let err = relay.finish().unwrap_err();
    assert!(matches!(err, RelayError::Interrupted(Signal::SIGTERM)));
    assert_eq!(err.exit_code(), 143);

    let rest = read_all(&mut b);
    assert!(rest.len() <= 1);
    assert!(read_all(&mut a).is_empty());
}

#[test]
fn unreachable_b_fails_after_retries() {
    let config = config(free_port(), free_port(), BufferSizes::default());
    let start = Instant::now();

    let err = tap_relay::run_with(&config, Capture::default(), &CancelToken::new()).unwrap_err();

    assert_eq!(err.reason_code(), "socket_setup_failed");
    assert_eq!(err.exit_code(), 1);
    // two pauses between three tries
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[test]
fn cancelled_before_connect_is_interrupted() {
    let config = config(free_port(), free_port(), BufferSizes::default());
    let cancel = CancelToken::new();
    cancel.cancel(Signal::SIGINT);

    let err = tap_relay::run_with(&config, Capture::default(), &cancel).unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(err.exit_code(), 130);
}
