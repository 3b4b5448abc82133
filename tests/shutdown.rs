//! Graceful shutdown behavior: idle connections drain fast, busy
//! connections survive a blown deadline.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
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

fn start_server<F>(
    handler: F,
    config: Config,
) -> (Arc<EventLoop>, SocketAddr, thread::JoinHandle<Result<(), Error>>)
where
    F: Fn(&Arc<Connection>) -> Result<(), Error> + Send + Sync + 'static,
{
    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").unwrap());
    let addr = listener.local_addr();
    let event_loop = Arc::new(EventLoop::with_config(handler, config));
    let serving = event_loop.clone();
    let handle = thread::spawn(move || serving.serve(listener));
    thread::sleep(Duration::from_millis(50));
    (event_loop, addr, handle)
}

#[test]
fn idle_connections_close_promptly() {
    init_tracing();
    let (event_loop, addr, handle) = start_server(|_| Ok(()), Config::default());

    const CONNS: usize = 100;
    let mut clients = Vec::with_capacity(CONNS);
    for _ in 0..CONNS {
        clients.push(TcpStream::connect(addr).unwrap());
    }
    // All connections are up and idle: no pending bytes anywhere.
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    event_loop.shutdown(Duration::from_secs(5)).unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "idle drain took {:?}",
        started.elapsed()
    );
    assert!(handle.join().unwrap().is_ok());

    // Every client observes EOF.
    let mut buf = [0u8; 1];
    for mut client in clients {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}

#[test]
fn blown_deadline_leaves_busy_connection_open() {
    init_tracing();
    let slow_handler = |conn: &Arc<Connection>| {
        // Hold the connection non-idle long past the shutdown deadline.
        thread::sleep(Duration::from_secs(3));
        let n = conn.input_len();
        if n > 0 {
            let data = conn.next(n)?;
            conn.write(&data)?;
            conn.flush()?;
        }
        Ok(())
    };
    let (event_loop, addr, handle) = start_server(slow_handler, Config::default());

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"work").unwrap();
    // Let the pump pick the request up before asking for shutdown.
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    let err = event_loop.shutdown(Duration::from_millis(500)).unwrap_err();
    assert!(matches!(err, Error::ShutdownTimeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");

    // The in-flight connection was not forced closed: the slow handler
    // still completes its echo.
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"work");

    drop(client);
    assert!(handle.join().unwrap().is_ok());
}
