//! TCP echo server on the fibrio runtime.
//!
//! One fiber accepts; every connection gets its own fiber whose blocking
//! recv/send calls suspend instead of occupying a worker thread.
//!
//!     cargo run --example echo
//!     # then: nc 127.0.0.1 5555

use fibrio::{IoManager, Socket};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn main() {
    env_logger::init();

    let io = IoManager::new(num_cpus::get(), false, "echo").unwrap();
    io.schedule_fn(|| {
        let addr = DEFAULT_LISTEN_ADDR.parse().unwrap();
        let mut listener = Socket::tcp();
        listener.bind(&addr).expect("bind");
        listener.listen(128).expect("listen");
        println!(
            "Starting tcp echo server on {}",
            listener.local_endpoint().expect("local endpoint")
        );

        loop {
            let conn = match listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    eprintln!("accept failed: {}", err);
                    break;
                }
            };
            fibrio::spawn(move || {
                let mut buf = [0u8; 16 * 1024];
                loop {
                    match conn.recv(&mut buf) {
                        Ok(0) => break, // eof
                        Ok(n) => {
                            if conn.send_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    loop {
        std::thread::park();
    }
}
