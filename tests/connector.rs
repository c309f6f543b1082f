use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use socket_connector::net::{Connector, Event, Handle, OnConnectionChange, OnReceive, Peer};
use socket_connector::{Config, Error};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Change(Handle, bool),
    Data(Handle, Vec<u8>),
}

fn recorder() -> (impl OnReceive, impl OnConnectionChange, Receiver<Seen>) {
    let (tx, rx) = mpsc::channel();
    let data_tx = tx.clone();

    let on_receive = move |peer: &Peer, data: &[u8]| {
        let _ = data_tx.send(Seen::Data(peer.handle(), data.to_vec()));
    };
    let on_change = move |peer: &Peer, connected: bool| {
        let _ = tx.send(Seen::Change(peer.handle(), connected));
    };

    (on_receive, on_change, rx)
}

fn next(rx: &Receiver<Seen>) -> Seen {
    rx.recv_timeout(TIMEOUT).expect("no callback within timeout")
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;

    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within timeout");
        thread::sleep(Duration::from_millis(10));
    }
}

fn port_of(connector: &Connector, handle: Handle) -> u16 {
    connector.local_addr(handle).unwrap().port()
}

fn single(max_servers: usize, max_clients: usize) -> Connector {
    Connector::new(Config {
        max_servers,
        max_clients,
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn client_and_server_exchange_messages() {
    let server = single(1, 0);
    let client = single(0, 1);

    let (tx, server_seen) = mpsc::channel();
    let data_tx = tx.clone();
    let listener = server
        .listen(
            0,
            move |peer: &Peer, data: &[u8]| {
                let _ = data_tx.send(Seen::Data(peer.handle(), data.to_vec()));
                peer.send(b"pong").unwrap();
            },
            move |peer: &Peer, connected: bool| {
                let _ = tx.send(Seen::Change(peer.handle(), connected));
            },
        )
        .unwrap();
    let port = port_of(&server, listener);

    let (on_receive, on_change, client_seen) = recorder();
    let conn = client
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap();
    assert_eq!(next(&client_seen), Seen::Change(conn, true));

    let Seen::Change(admitted, true) = next(&server_seen) else {
        panic!("expected admission");
    };
    assert_ne!(admitted, listener);
    assert!(server.is_connected(admitted));

    client.send(conn, b"ping").unwrap();
    assert_eq!(next(&server_seen), Seen::Data(admitted, b"ping".to_vec()));
    assert_eq!(next(&client_seen), Seen::Data(conn, b"pong".to_vec()));

    client.disconnect(conn).unwrap();
    assert_eq!(next(&client_seen), Seen::Change(conn, false));
    assert_eq!(next(&server_seen), Seen::Change(admitted, false));

    wait_until(|| server.client_count(listener).unwrap() == 0);
    assert!(client_seen.try_recv().is_err());
}

#[test]
fn listener_at_capacity_rejects_then_admits_after_release() {
    let connector = Connector::new(Config {
        max_servers: 1,
        max_clients: 0,
        clients_per_server: 1,
        reject_backoff: Duration::from_millis(50),
        ..Config::default()
    })
    .unwrap();
    let events = connector.events().unwrap();

    let (on_receive, on_change, seen) = recorder();
    let listener = connector.listen(0, on_receive, on_change).unwrap();
    let port = port_of(&connector, listener);

    let mut a = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let Seen::Change(ha, true) = next(&seen) else {
        panic!("expected admission of the first client");
    };
    a.write_all(b"ping").unwrap();
    assert_eq!(next(&seen), Seen::Data(ha, b"ping".to_vec()));
    assert_eq!(connector.client_count(listener).unwrap(), 1);

    let mut b = TcpStream::connect(("127.0.0.1", port)).unwrap();
    match events.recv_timeout(TIMEOUT).unwrap() {
        Event::Rejected { server, peer } => {
            assert_eq!(server, listener);
            assert_eq!(peer, b.local_addr().unwrap());
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut buf = [0u8; 8];
    match b.read(&mut buf) {
        Ok(0) => {}
        Err(err) if err.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("rejected client still connected: {other:?}"),
    }
    assert!(seen.try_recv().is_err());
    assert_eq!(connector.client_count(listener).unwrap(), 1);

    connector.disconnect(ha).unwrap();
    assert_eq!(next(&seen), Seen::Change(ha, false));
    assert_eq!(connector.client_count(listener).unwrap(), 0);

    let _c = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(matches!(next(&seen), Seen::Change(_, true)));
    assert_eq!(connector.client_count(listener).unwrap(), 1);
}

#[test]
fn full_registry_refuses_and_stays_unchanged() {
    let connector = single(1, 0);

    let (on_receive, on_change, _seen) = recorder();
    let listener = connector.listen(0, on_receive, on_change).unwrap();

    let (on_receive, on_change, _seen) = recorder();
    let err = connector.listen(0, on_receive, on_change).unwrap_err();

    assert!(matches!(err, Error::NoSpaceForConnection));
    assert!(connector.is_connected(listener));
    assert_eq!(connector.connection_count(), 1);
}

#[test]
fn peer_close_tears_down_once_and_frees_the_slot() {
    let connector = single(0, 1);
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = remote.local_addr().unwrap().port();

    let (on_receive, on_change, seen) = recorder();
    let conn = connector
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap();
    assert_eq!(next(&seen), Seen::Change(conn, true));

    let (mut stream, _) = remote.accept().unwrap();
    stream.write_all(b"hi").unwrap();
    assert_eq!(next(&seen), Seen::Data(conn, b"hi".to_vec()));
    drop(stream);

    assert_eq!(next(&seen), Seen::Change(conn, false));
    wait_until(|| !connector.is_connected(conn) && connector.connection_count() == 0);
    assert!(seen.recv_timeout(Duration::from_millis(100)).is_err());

    let (on_receive, on_change, _seen) = recorder();
    let again = connector.connect("127.0.0.1", port, on_receive, on_change);
    assert!(again.is_ok());
}

#[test]
fn unknown_handles_are_invalid() {
    let connector = single(0, 1);
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = remote.local_addr().unwrap().port();

    assert!(matches!(
        connector.send(Handle::NO_SOCKET, b"x"),
        Err(Error::InvalidHandle(Handle::NO_SOCKET))
    ));
    assert!(matches!(
        connector.send(Handle::from_raw(9999), b"x"),
        Err(Error::InvalidHandle(_))
    ));
    assert!(!connector.is_connected(Handle::NO_SOCKET));

    let (on_receive, on_change, seen) = recorder();
    let conn = connector
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap();
    assert_eq!(next(&seen), Seen::Change(conn, true));

    connector.disconnect(conn).unwrap();
    assert_eq!(next(&seen), Seen::Change(conn, false));

    assert!(matches!(
        connector.disconnect(conn),
        Err(Error::InvalidHandle(h)) if h == conn
    ));
    assert!(matches!(
        connector.send(conn, b"late"),
        Err(Error::InvalidHandle(_))
    ));
    assert!(seen.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn failed_connect_releases_the_slot() {
    let port = {
        let vacant = TcpListener::bind("127.0.0.1:0").unwrap();
        vacant.local_addr().unwrap().port()
    };
    let connector = single(0, 1);

    let (on_receive, on_change, seen) = recorder();
    let err = connector
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap_err();

    assert!(matches!(err, Error::ConnectFailed { .. }));
    assert_eq!(connector.connection_count(), 0);
    assert!(seen.try_recv().is_err());

    let (on_receive, on_change, _seen) = recorder();
    assert!(connector.listen(0, on_receive, on_change).is_ok());
}

#[test]
fn port_in_use_fails_to_bind() {
    let first = single(1, 0);
    let (on_receive, on_change, _seen) = recorder();
    let listener = first.listen(0, on_receive, on_change).unwrap();
    let port = port_of(&first, listener);

    let second = single(1, 0);
    let (on_receive, on_change, _seen) = recorder();
    let err = second.listen(port, on_receive, on_change).unwrap_err();

    assert!(matches!(err, Error::BindFailed { port: p, .. } if p == port));
    assert_eq!(second.connection_count(), 0);
}

#[test]
fn listener_teardown_disconnects_admitted_clients() {
    let connector = Connector::new(Config {
        max_servers: 1,
        max_clients: 0,
        clients_per_server: 2,
        ..Config::default()
    })
    .unwrap();

    let (on_receive, on_change, seen) = recorder();
    let listener = connector.listen(0, on_receive, on_change).unwrap();
    let port = port_of(&connector, listener);

    let mut remote = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let Seen::Change(admitted, true) = next(&seen) else {
        panic!("expected admission");
    };

    connector.disconnect(listener).unwrap();
    assert_eq!(next(&seen), Seen::Change(listener, false));
    assert_eq!(next(&seen), Seen::Change(admitted, false));

    wait_until(|| connector.connection_count() == 0);
    assert!(!connector.is_connected(admitted));

    remote.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(remote.read(&mut buf).unwrap(), 0);
}

#[test]
fn shutdown_closes_everything() {
    let connector = Connector::new(Config {
        max_servers: 1,
        max_clients: 1,
        clients_per_server: 1,
        ..Config::default()
    })
    .unwrap();

    let (on_receive, on_change, seen) = recorder();
    let listener = connector.listen(0, on_receive, on_change).unwrap();
    let port = port_of(&connector, listener);

    let (on_receive, on_change, client_seen) = recorder();
    let conn = connector
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap();
    assert_eq!(next(&client_seen), Seen::Change(conn, true));
    assert!(matches!(next(&seen), Seen::Change(_, true)));

    connector.shutdown();

    assert_eq!(connector.connection_count(), 0);
    assert!(!connector.is_connected(listener));
    assert!(!connector.is_connected(conn));
    assert_eq!(next(&client_seen), Seen::Change(conn, false));

    let (on_receive, on_change, _seen) = recorder();
    assert!(connector.listen(0, on_receive, on_change).is_ok());
}

#[test]
fn reset_by_peer_is_reported_after_teardown() {
    let connector = single(0, 1);
    let events = connector.events().unwrap();
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = remote.local_addr().unwrap().port();

    let (on_receive, on_change, seen) = recorder();
    let conn = connector
        .connect("127.0.0.1", port, on_receive, on_change)
        .unwrap();
    assert_eq!(next(&seen), Seen::Change(conn, true));

    // A zero linger timeout turns close into a reset.
    let (stream, _) = remote.accept().unwrap();
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &raw const linger as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0);
    drop(stream);

    assert_eq!(next(&seen), Seen::Change(conn, false));
    match events.recv_timeout(TIMEOUT).unwrap() {
        Event::ReceiveFailed {
            handle,
            error: Error::ReceiveFailed(err),
        } => {
            assert_eq!(handle, conn);
            assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        }
        other => panic!("unexpected event {other:?}"),
    }

    wait_until(|| !connector.is_connected(conn) && connector.connection_count() == 0);
}

#[test]
fn reconnect_during_listener_cascade_gets_a_live_handle() {
    let connector = Arc::new(
        Connector::new(Config {
            max_servers: 1,
            max_clients: 1,
            clients_per_server: 1,
            ..Config::default()
        })
        .unwrap(),
    );
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote_port = remote.local_addr().unwrap().port();

    let weak: Arc<OnceLock<Weak<Connector>>> = Arc::new(OnceLock::new());
    weak.set(Arc::downgrade(&connector)).unwrap();

    let (admit_tx, admitted) = mpsc::channel();
    let (tx, reconnected) = mpsc::channel();
    let on_change = {
        let weak = Arc::clone(&weak);

        move |peer: &Peer, connected: bool| {
            if connected {
                let _ = admit_tx.send(peer.handle());
                return;
            }

            // The listener itself has no remote address.
            if peer.peer_addr().is_none() {
                return;
            }

            let Some(connector) = weak.get().and_then(Weak::upgrade) else {
                return;
            };

            let result = connector
                .connect(
                    "127.0.0.1",
                    remote_port,
                    |_: &Peer, _: &[u8]| {},
                    |_: &Peer, _: bool| {},
                )
                .map(|new| {
                    let sent = connector.send(new, b"x").is_ok();
                    (new, connector.is_connected(new), sent)
                });
            let _ = tx.send(result);
        }
    };

    let listener = connector
        .listen(0, |_: &Peer, _: &[u8]| {}, on_change)
        .unwrap();
    let port = port_of(&connector, listener);

    let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let admitted = admitted.recv_timeout(TIMEOUT).unwrap();

    connector.disconnect(listener).unwrap();

    let (new, live, sent) = reconnected.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_ne!(new, admitted);
    assert!(live);
    assert!(sent);

    assert!(connector.is_connected(new));
    connector.send(new, b"y").unwrap();

    let (mut accepted, _) = remote.accept().unwrap();
    let mut buf = [0u8; 2];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"xy");
}

#[test]
fn disconnect_from_inside_the_connected_callback_follows_it() {
    let connector = Arc::new(single(0, 1));
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = remote.local_addr().unwrap().port();

    let weak: Arc<OnceLock<Weak<Connector>>> = Arc::new(OnceLock::new());
    weak.set(Arc::downgrade(&connector)).unwrap();

    let (tx, seen) = mpsc::channel();
    let on_change = {
        let weak = Arc::clone(&weak);

        move |peer: &Peer, connected: bool| {
            let _ = tx.send(Seen::Change(peer.handle(), connected));

            if connected {
                if let Some(connector) = weak.get().and_then(Weak::upgrade) {
                    connector.disconnect(peer.handle()).unwrap();
                }
            }
        }
    };

    let conn = connector
        .connect("127.0.0.1", port, |_: &Peer, _: &[u8]| {}, on_change)
        .unwrap();

    assert_eq!(next(&seen), Seen::Change(conn, true));
    assert_eq!(next(&seen), Seen::Change(conn, false));
    assert!(seen.recv_timeout(Duration::from_millis(100)).is_err());

    wait_until(|| !connector.is_connected(conn) && connector.connection_count() == 0);
}
