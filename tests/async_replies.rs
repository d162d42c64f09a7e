//! End-to-end tests for asynchronous handlers and the reply reaper.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use wirelay::{Message, PendingReply, RawFactory, Server, reply_slot};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Async echo completing after a per-request delay: bodies starting with
/// `slow:` take 1500 ms, everything else 100 ms.
fn delayed_echo(msg: &Message<Bytes>) -> PendingReply {
    let (slot, pending) = reply_slot();
    let raw = msg.raw().clone();
    let delay = if raw.starts_with(b"slow:") {
        Duration::from_millis(1500)
    } else {
        Duration::from_millis(100)
    };
    thread::spawn(move || {
        thread::sleep(delay);
        slot.complete(Some(BytesMut::from(&raw[..])));
    });
    pending
}

fn start_async_server() -> (
    SocketAddr,
    wirelay::ShutdownHandle,
    thread::JoinHandle<Result<(), wirelay::ServerError>>,
) {
    let bound = Server::new(RawFactory::new())
        .address(([127, 0, 0, 1], 0).into())
        .async_handler(delayed_echo)
        .bind()
        .expect("ephemeral bind succeeds");
    let addr = bound.local_addr();
    let handle = bound.shutdown_handle();
    let join = thread::spawn(move || bound.run());
    (addr, handle, join)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("server is accepting");
    stream
        .set_read_timeout(Some(CLIENT_TIMEOUT))
        .expect("timeout is settable");
    stream
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = (body.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(body);
    framed
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

#[test]
fn async_reply_reaches_the_client() {
    let (addr, handle, join) = start_async_server();
    let mut client = connect(addr);

    client.write_all(&frame(b"deferred")).expect("request sent");
    assert_eq!(read_frame(&mut client).expect("reply arrives"), b"deferred");

    handle.shutdown();
    join.join().expect("reactor exits").expect("clean shutdown");
}

#[test]
fn fast_reply_overtakes_a_slow_one() {
    let (addr, handle, join) = start_async_server();

    let slow_client = thread::spawn(move || {
        let mut client = connect(addr);
        client.write_all(&frame(b"slow:a")).expect("request sent");
        let body = read_frame(&mut client).expect("reply arrives");
        (Instant::now(), body)
    });
    // Let the slow request reach the reaper first.
    thread::sleep(Duration::from_millis(100));
    let fast_client = thread::spawn(move || {
        let mut client = connect(addr);
        client.write_all(&frame(b"quick")).expect("request sent");
        let body = read_frame(&mut client).expect("reply arrives");
        (Instant::now(), body)
    });

    let (slow_done, slow_body) = slow_client.join().expect("slow client finishes");
    let (fast_done, fast_body) = fast_client.join().expect("fast client finishes");
    assert_eq!(slow_body, b"slow:a");
    assert_eq!(fast_body, b"quick");
    // The reaper's bounded wait re-queues the slow job, so the fast reply is
    // emitted while the slow one is still circulating.
    assert!(
        fast_done < slow_done,
        "fast reply should overtake the slow one"
    );

    handle.shutdown();
    join.join().expect("reactor exits").expect("clean shutdown");
}

#[test]
fn replies_on_one_connection_keep_request_order() {
    let (addr, handle, join) = start_async_server();
    let mut client = connect(addr);

    client.write_all(&frame(b"one")).expect("request sent");
    client.write_all(&frame(b"two")).expect("request sent");
    assert_eq!(read_frame(&mut client).expect("first reply"), b"one");
    assert_eq!(read_frame(&mut client).expect("second reply"), b"two");

    handle.shutdown();
    join.join().expect("reactor exits").expect("clean shutdown");
}

#[test]
fn silent_async_handler_sends_nothing() {
    let quiet = |_msg: &Message<Bytes>| PendingReply::ready(None);
    let bound = Server::new(RawFactory::new())
        .address(([127, 0, 0, 1], 0).into())
        .async_handler(quiet)
        .bind()
        .expect("ephemeral bind succeeds");
    let addr = bound.local_addr();
    let handle = bound.shutdown_handle();
    let join = thread::spawn(move || bound.run());

    let mut client = connect(addr);
    client.write_all(&frame(b"anyone?")).expect("request sent");
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .expect("timeout is settable");
    let mut probe = [0u8; 1];
    match client.read(&mut probe) {
        Ok(0) => panic!("server closed the connection"),
        Ok(_) => panic!("unexpected reply"),
        Err(e) => assert!(
            matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "unexpected read error: {e}"
        ),
    }

    handle.shutdown();
    join.join().expect("reactor exits").expect("clean shutdown");
}
