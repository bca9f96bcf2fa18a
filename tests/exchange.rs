mod common;

use std::net::TcpListener;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use common::{both, connect_link, free_port_range, pattern, test_config};
use mpath_tcp::{ChannelManager, Config, Error, Role, StreamState};

#[test]
fn fixed_exchange_matches_across_stream_counts() {
    for n in [1, 8] {
        let link = connect_link(n, test_config());
        let to_client = pattern(1 << 20, 1);
        let to_server = pattern((1 << 20) + 3, 2);
        let mut at_client = vec![0u8; to_client.len()];
        let mut at_server = vec![0u8; to_server.len()];

        let (served, sent) = both(
            || link.server.send_recv_path(link.server_path, &to_client, &mut at_server),
            || link.client.send_recv_path(link.client_path, &to_server, &mut at_client),
        );
        served.unwrap();
        sent.unwrap();
        assert_eq!(at_client, to_client, "{n} streams");
        assert_eq!(at_server, to_server, "{n} streams");
    }
}

#[test]
fn roles_follow_establishment() {
    let link = connect_link(3, test_config());
    for (manager, role) in [(&link.server, Role::Server), (&link.client, Role::Client)] {
        for info in manager.streams() {
            assert_eq!((info.role, info.state), (role, StreamState::Connected));
        }
    }
    assert_eq!(link.client.num_channels(), 3);
    assert!(link.client.window(0).is_ok());
}

#[test]
fn dynamic_exchange_learns_sizes() {
    let link = connect_link(4, test_config());
    for size in [0usize, 1, 8191, 8192, 8193, 3 * (1 << 20) + 5] {
        let payload = pattern(size, 3);
        let mut inbox = vec![0u8; 4 << 20];
        let (received, echoed) = both(
            || link.server.dsend_recv_path(link.server_path, &[], &mut inbox),
            || link.client.dsend_recv_path(link.client_path, &payload, &mut []),
        );
        assert_eq!(received.unwrap(), size);
        assert_eq!(echoed.unwrap(), 0);
        assert_eq!(&inbox[..size], &payload[..]);
    }
}

#[test]
fn oversized_announcement_is_rejected() {
    let link = connect_link(2, test_config());
    let (server_streams, client_streams) = (link.server_streams(), link.client_streams());
    let payload = pattern(100, 4);
    let mut small = [0u8; 10];
    let (received, sent) = both(
        || link.server.dcycle(&[], &mut small, &[], &server_streams),
        || link.client.dcycle(&payload, &mut [], &client_streams, &[]),
    );
    sent.unwrap();
    match received {
        Err(Error::SizeExceeded { declared, max }) => assert_eq!((declared, max), (100, 10)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn cycle_sends_and_receives_on_different_sets() {
    let link = connect_link(4, test_config());
    let (s, c) = (link.server_streams(), link.client_streams());
    let forward = pattern(50_001, 5);
    let backward = pattern(7_777, 6);
    let mut at_server = vec![0u8; forward.len()];
    let mut at_client = vec![0u8; backward.len()];

    let (served, sent) = both(
        || link.server.cycle(&backward, &mut at_server, &s[3..], &s[..3]),
        || link.client.cycle(&forward, &mut at_client, &c[..3], &c[3..]),
    );
    served.unwrap();
    sent.unwrap();
    assert_eq!(at_server, forward);
    assert_eq!(at_client, backward);

    let mut inbox = vec![0u8; 1 << 16];
    let (received, none) = both(
        || link.server.dcycle(&[], &mut inbox, &[], &s[..3]),
        || link.client.dcycle(&backward, &mut [], &c[..3], &[]),
    );
    assert_eq!(received.unwrap(), backward.len());
    assert_eq!(none.unwrap(), 0);
    assert_eq!(&inbox[..backward.len()], &backward[..]);
}

#[test]
fn presplit_buffers_per_channel() {
    let link = connect_link(3, test_config());
    let (s, c) = (link.server_streams(), link.client_streams());
    let parts = [pattern(10, 7), pattern(0, 7), pattern(20_000, 8)];
    let sends: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
    let mut bufs: Vec<Vec<u8>> = parts.iter().map(|p| vec![0u8; p.len()]).collect();

    let (received, sent) = both(
        || {
            let mut recvs: Vec<&mut [u8]> = bufs.iter_mut().map(Vec::as_mut_slice).collect();
            let empty: Vec<&[u8]> = vec![&[][..]; 3];
            link.server.psend_recv(&empty, &mut recvs, &s)
        },
        || {
            let mut none: Vec<&mut [u8]> = (0..3).map(|_| <&mut [u8]>::default()).collect();
            link.client.psend_recv(&sends, &mut none, &c)
        },
    );
    received.unwrap();
    sent.unwrap();
    assert_eq!(bufs, parts);
}

#[test]
fn plain_send_and_recv_with_adaptive_stream_count() {
    let config = Config { min_bytes_per_stream: Some(4096), ..test_config() };
    let link = connect_link(4, config);
    for size in [100, 10_000, 1 << 20] {
        let payload = pattern(size, 9);
        let mut inbox = vec![0u8; size];
        let (received, sent) = both(
            || link.server.recv_path(link.server_path, &mut inbox),
            || link.client.send_path(link.client_path, &payload),
        );
        received.unwrap();
        sent.unwrap();
        assert_eq!(inbox, payload);
    }
}

#[test]
fn barrier_pairs_client_and_server() {
    let link = connect_link(4, test_config());
    let (a, b) = both(|| link.server.barrier_all(), || link.client.barrier_all());
    a.unwrap();
    b.unwrap();
    let (a, b) = both(|| link.server.barrier(2), || link.client.barrier(2));
    a.unwrap();
    b.unwrap();
}

#[test]
fn channels_can_be_closed_and_reopened() {
    let link = connect_link(2, test_config());
    let (s, c) = (link.server_streams(), link.client_streams());
    link.client.close_channels(&c).unwrap();
    link.server.close_channels(&s).unwrap();
    assert!(link.client.streams().iter().all(|info| info.state == StreamState::Closed));

    let mut inbox = [0u8; 4];
    assert!(matches!(link.client.send_recv(b"ping", &mut inbox, &c), Err(Error::NotConnected(_))));

    let (a, b) = both(
        || link.server.reopen_channels(&s, true),
        || link.client.reopen_channels(&c, false),
    );
    a.unwrap();
    b.unwrap();

    let mut at_server = [0u8; 4];
    let (a, b) = both(
        || link.server.send_recv(b"pong", &mut at_server, &s),
        || link.client.send_recv(b"ping", &mut inbox, &c),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(&at_server, b"ping");
    assert_eq!(&inbox, b"pong");
}

#[test]
fn peer_close_fails_the_exchange() {
    let link = connect_link(2, test_config());
    link.client.finalize();
    let mut inbox = vec![0u8; 1 << 16];
    match link.server.recv_path(link.server_path, &mut inbox) {
        Err(Error::RemoteClosed { transferred, .. }) => assert_eq!(transferred, 0),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn partial_establishment_is_reported() {
    let config = Config {
        connect_retries: 2,
        connect_backoff: Duration::from_millis(10),
        accept_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let base = free_port_range(2);
    let _only_first = TcpListener::bind(("0.0.0.0", base)).unwrap();

    let manager = ChannelManager::new(config.clone());
    let path = manager.create_path_without_connect("127.0.0.1", base, 2).unwrap();
    match manager.connect_path(path, false) {
        Err(Error::EstablishFailed { failed, total }) => {
            assert_eq!(failed, manager.path_streams(path).unwrap()[1..].to_vec());
            assert_eq!(total, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let states: Vec<StreamState> = manager.streams().iter().map(|s| s.state).collect();
    assert_eq!(states, vec![StreamState::Connected, StreamState::Failed]);
    manager.destroy_path(path).unwrap();

    // With server fallback the second stream listens and times out while
    // its sibling stays connected.
    let manager = ChannelManager::new(config.clone());
    let path = manager.create_path_without_connect("127.0.0.1", base, 2).unwrap();
    match manager.connect_path(path, true) {
        Err(Error::EstablishFailed { failed, total }) => {
            assert_eq!(failed, manager.path_streams(path).unwrap()[1..].to_vec());
            assert_eq!(total, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let states: Vec<StreamState> = manager.streams().iter().map(|s| s.state).collect();
    assert_eq!(states, vec![StreamState::Connected, StreamState::Failed]);
    manager.destroy_path(path).unwrap();

    // create_path tears the whole path down again.
    let manager = ChannelManager::new(config);
    assert!(matches!(
        manager.create_path("127.0.0.1", base, 2),
        Err(Error::EstablishFailed { .. })
    ));
    assert_eq!(manager.num_channels(), 0);
}

#[test]
fn destroy_waits_for_running_exchange() {
    let link = connect_link(2, test_config());
    let payload = pattern(100_000, 13);
    let mut inbox = vec![0u8; payload.len()];

    thread::scope(|s| {
        let receiving = s.spawn(|| link.client.recv_path(link.client_path, &mut inbox));
        thread::sleep(Duration::from_millis(200));

        let (done, destroyed) = mpsc::channel();
        let client = link.client.clone();
        let path = link.client_path;
        s.spawn(move || {
            let _ = done.send(client.destroy_path(path));
        });
        assert!(matches!(
            destroyed.recv_timeout(Duration::from_millis(300)),
            Err(RecvTimeoutError::Timeout)
        ));

        link.server.send_path(link.server_path, &payload).unwrap();
        receiving.join().unwrap().unwrap();
        destroyed.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    });
    assert_eq!(inbox, payload);
    assert_eq!(link.client.num_channels(), 0);
}
