//! End-to-end runtime scenarios: sleeping fibers, loopback sockets,
//! timeouts, cancellation and pinning.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use fibrio::{Event, Fiber, IoManager, Scheduler, Socket};
use std::sync::Mutex;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn sleeps_fire_in_deadline_order() {
    init_logs();
    let io = IoManager::new(2, false, "sleep-order").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    for ms in [100u64, 200, 50] {
        let order = Arc::clone(&order);
        let done_tx = done_tx.clone();
        io.schedule_fn(move || {
            fibrio::sleep_ms(ms);
            order.lock().unwrap().push(ms);
            done_tx.send(()).unwrap();
        });
    }

    for _ in 0..3 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("a sleeping fiber never woke");
    }
    assert_eq!(*order.lock().unwrap(), vec![50, 100, 200]);
}

#[test]
fn loopback_echo() {
    init_logs();
    let io = IoManager::new(2, false, "echo-pair").unwrap();
    let (port_tx, port_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    io.schedule_fn(move || {
        let mut listener = Socket::tcp();
        listener.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        listener.listen(16).unwrap();
        port_tx
            .send(listener.local_endpoint().unwrap().port())
            .unwrap();

        let conn = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            let n = conn.recv(&mut buf[got..]).unwrap();
            assert!(n > 0, "peer closed early");
            got += n;
        }
        assert_eq!(&buf, b"PING");
        conn.send_all(&buf).unwrap();
    });

    let port = port_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("listener fiber never published its port");

    io.schedule_fn(move || {
        let mut sock = Socket::tcp();
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        sock.connect(&addr, Some(1000)).unwrap();
        sock.send_all(b"PING").unwrap();

        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            let n = sock.recv(&mut buf[got..]).unwrap();
            assert!(n > 0, "peer closed early");
            got += n;
        }
        assert_eq!(&buf, b"PING");
        done_tx.send(()).unwrap();
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo round trip never completed");
}

#[test]
fn recv_times_out_in_window() {
    init_logs();
    let io = IoManager::new(2, false, "recv-timeout").unwrap();
    // A listener that never writes; the backlog completes the handshake.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    io.schedule_fn(move || {
        let mut sock = Socket::tcp();
        sock.connect(&addr, Some(1000)).unwrap();
        sock.set_recv_timeout(Some(100)).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 16];
        let err = sock.recv(&mut buf).unwrap_err();
        done_tx.send((err, start.elapsed())).unwrap();
    });

    let (err, elapsed) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("recv never returned");
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    assert!(
        elapsed >= Duration::from_millis(95) && elapsed <= Duration::from_millis(200),
        "timeout fired after {:?}",
        elapsed
    );
}

#[test]
fn cancel_during_wait_resumes_the_waiter() {
    init_logs();
    let io = IoManager::new(2, false, "cancel-wait").unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let fd_cell = Arc::new(AtomicI32::new(-1));
    let (done_tx, done_rx) = mpsc::channel();

    let fd_published = Arc::clone(&fd_cell);
    io.schedule_fn(move || {
        let mut sock = Socket::tcp();
        sock.connect(&addr, Some(1000)).unwrap();
        fd_published.store(sock.fd(), Ordering::SeqCst);

        let io = IoManager::current().unwrap();
        io.add_event(sock.fd(), Event::READ, None).unwrap();
        Fiber::yield_hold();

        // Cancelled, not ready: a raw retry must report would-block.
        fibrio::set_hook_enabled(false);
        let mut buf = [0u8; 4];
        let err = sock.recv(&mut buf).unwrap_err();
        fibrio::set_hook_enabled(true);
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        done_tx.send(()).unwrap();
    });

    // Wait for the fiber to park on READ. The fd is published only after
    // connect, so a transient connect-wait registration cannot satisfy this.
    let start = Instant::now();
    while fd_cell.load(Ordering::SeqCst) == -1 || io.waiting_events() == 0 {
        assert!(start.elapsed() < Duration::from_secs(5), "waiter never parked");
        std::thread::sleep(Duration::from_millis(5));
    }

    let fd = fd_cell.load(Ordering::SeqCst);
    assert!(io.cancel_event(fd, Event::READ));
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("cancelled waiter never resumed");
    assert_eq!(io.waiting_events(), 0);
}

#[test]
fn pinned_fiber_stays_on_its_thread() {
    init_logs();
    let sched = Scheduler::new(4, false, "pin").unwrap();
    sched.start().unwrap();

    let tids = sched.thread_ids();
    assert_eq!(tids.len(), 4);
    let target = tids[2];

    let observed = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    let obs = Arc::clone(&observed);
    let fiber = Fiber::spawn(move || {
        for _ in 0..100 {
            obs.lock().unwrap().push(fibrio::gettid());
            Fiber::yield_ready();
        }
        done_tx.send(()).unwrap();
    })
    .unwrap();

    sched.schedule_on(fiber, target);
    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("pinned fiber never finished");
    sched.stop();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 100);
    assert!(
        observed.iter().all(|&tid| tid == target),
        "pinned fiber ran on threads {:?}, expected only {}",
        observed.iter().collect::<std::collections::HashSet<_>>(),
        target
    );
}
