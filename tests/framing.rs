//! End-to-end framing scenarios: real sockets against a live server,
//! deliveries observed on the message queue.

mod common;

use std::io::Write;
use std::thread;
use std::time::Duration;

use common::{frame, ServerHarness};

const POP: Duration = Duration::from_secs(5);

#[test]
fn header_only_frame_is_delivered() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    client.write_all(&[0x00, 0x04, 0x00, 0x00]).unwrap();

    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert_eq!(msg.frame(), &[0x00, 0x04, 0x00, 0x00]);
    assert_eq!(msg.body(), b"");
    assert_eq!(msg.code(), 0);
    assert!(!msg.is_stale());
}

#[test]
fn frame_with_body_is_delivered_intact() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    let wire = frame(10, 0, b"Hello!");
    client.write_all(&wire).unwrap();

    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert_eq!(msg.frame(), wire.as_slice());
    assert_eq!(msg.body(), b"Hello!");
}

#[test]
fn byte_by_byte_transmission_delivers_the_same_frame() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    let wire = frame(10, 3, b"Hello!");
    for &byte in &wire {
        client.write_all(&[byte]).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert_eq!(msg.frame(), wire.as_slice());
    assert_eq!(msg.code(), 3);
}

#[test]
fn undersized_length_is_dropped_and_the_connection_survives() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    // declared length 1 is below the header size
    client.write_all(&[0x00, 0x01, 0x00, 0x00]).unwrap();
    client.write_all(&[0x00, 0x04, 0x00, 0x00]).unwrap();

    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert_eq!(msg.frame(), &[0x00, 0x04, 0x00, 0x00]);

    // the invalid header produced nothing
    assert!(server.queue.is_empty());
}

#[test]
fn oversized_length_is_dropped_and_the_connection_survives() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    // declared length 65535 exceeds the maximum
    client.write_all(&[0xFF, 0xFF, 0x00, 0x00]).unwrap();

    let wire = frame(8, 0, b"ping");
    client.write_all(&wire).unwrap();

    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert_eq!(msg.frame(), wire.as_slice());
    assert!(server.queue.is_empty());
}

#[test]
fn concatenated_frames_arrive_in_order() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    let frames = [
        frame(4, 1, b""),
        frame(9, 2, b"hello"),
        frame(12, 3, b"worlds!!"),
    ];

    let mut wire = Vec::new();
    for f in &frames {
        wire.extend_from_slice(f);
    }
    client.write_all(&wire).unwrap();

    for expected in &frames {
        let msg = server.queue.pop_wait(POP).expect("missing delivery");
        assert_eq!(msg.frame(), expected.as_slice());
    }
}

#[test]
fn envelope_goes_stale_after_disconnect() {
    let server = ServerHarness::start(64, 0);
    let mut client = server.connect();

    client.write_all(&frame(4, 0, b"")).unwrap();
    let msg = server.queue.pop_wait(POP).expect("no delivery");
    assert!(!msg.is_stale());

    drop(client);
    assert!(server.wait_disconnects(1));

    assert!(msg.is_stale());
}

#[test]
fn multi_loop_mode_delivers_from_every_loop() {
    let server = ServerHarness::start(64, 2);

    let mut clients: Vec<_> = (0..4).map(|_| server.connect()).collect();
    assert!(server.wait_connects(4));

    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(&frame(4, i as u16, b"")).unwrap();
    }

    let mut codes = Vec::new();
    for _ in 0..4 {
        let msg = server.queue.pop_wait(POP).expect("missing delivery");
        codes.push(msg.code());
    }
    codes.sort_unstable();
    assert_eq!(codes, vec![0, 1, 2, 3]);
}
