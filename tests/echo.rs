//! End-to-end tests against real TCP connections: echo round-trips, hangup
//! batches, and the writable re-arm path.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexio::{Config, Connection, Error, EventLoop, TcpListener};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn echo_handler(conn: &Arc<Connection>) -> Result<(), Error> {
    let n = conn.input_len();
    if n == 0 {
        return Ok(());
    }
    let data = conn.next(n)?;
    conn.write(&data)?;
    conn.flush()?;
    Ok(())
}

fn start_echo_server(config: Config) -> (Arc<EventLoop>, SocketAddr, thread::JoinHandle<()>) {
    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").unwrap());
    let addr = listener.local_addr();
    let event_loop = Arc::new(EventLoop::with_config(echo_handler, config));
    let serving = event_loop.clone();
    let handle = thread::spawn(move || {
        let _ = serving.serve(listener);
    });
    // Give the acceptor a moment to arm.
    thread::sleep(Duration::from_millis(50));
    (event_loop, addr, handle)
}

#[test]
fn echo_many_round_trips_on_one_connection() {
    init_tracing();
    let (event_loop, addr, handle) = start_echo_server(Config::default());

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nodelay(true).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut buf = [0u8; 4];
    for _ in 0..10_000 {
        client.write_all(b"ping").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    drop(client);
    event_loop.shutdown(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
}

#[test]
fn simultaneous_resets_fire_every_close() {
    init_tracing();

    let closed = Arc::new(AtomicUsize::new(0));
    let mut config = Config::default();
    let counter = closed.clone();
    config.on_prepare = Some(Arc::new(move |conn: &Arc<Connection>| {
        let counter = counter.clone();
        conn.add_close_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        None
    }));
    let (event_loop, addr, handle) = start_echo_server(config);

    const CONNS: usize = 64;
    let mut clients = Vec::with_capacity(CONNS);
    for _ in 0..CONNS {
        let client = TcpStream::connect(addr).unwrap();
        // RST on drop instead of FIN.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                client.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        clients.push(client);
    }
    thread::sleep(Duration::from_millis(200));
    drop(clients);

    let deadline = Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::SeqCst) != CONNS {
        assert!(
            Instant::now() < deadline,
            "only {}/{} hangup callbacks fired",
            closed.load(Ordering::SeqCst),
            CONNS
        );
        thread::sleep(Duration::from_millis(10));
    }

    event_loop.shutdown(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
}

#[test]
fn write_backpressure_drains_through_rearm() {
    init_tracing();
    let (event_loop, addr, handle) = start_echo_server(Config::default());

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Push enough data that the echoed output cannot fit the server-side
    // socket buffer while the client is not reading: the server's flush
    // must hit EAGAIN, arm write interest, and drain via the poller.
    const TOTAL: usize = 4 * 1024 * 1024;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 239) as u8).collect();

    let writer = thread::spawn(move || {
        let mut sent = 0;
        while sent < TOTAL {
            let n = (TOTAL - sent).min(64 * 1024);
            client.write_all(&payload[sent..sent + n]).unwrap();
            sent += n;
        }
        client
    });

    // Let the echo back-pressure build before reading anything.
    thread::sleep(Duration::from_millis(300));

    let mut client = writer.join().unwrap();
    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    let mut expect = 0usize;
    while received < TOTAL {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed early at {received} bytes");
        for &b in &buf[..n] {
            assert_eq!(b, (expect % 239) as u8, "corrupt byte at offset {expect}");
            expect += 1;
        }
        received += n;
    }
    assert_eq!(received, TOTAL);

    drop(client);
    event_loop.shutdown(Duration::from_secs(5)).unwrap();
    handle.join().unwrap();
}
