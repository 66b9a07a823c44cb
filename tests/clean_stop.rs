//! Shutdown accounting. This scenario lives in its own test binary because
//! it asserts on the process-wide live-fiber counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fibrio::IoManager;

#[test]
fn thousand_fibers_stop_cleanly() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert_eq!(fibrio::total_fibers(), 0);

    let io = IoManager::new(4, false, "clean-stop").unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    for _ in 0..1000 {
        let hits = Arc::clone(&hits);
        io.schedule_fn(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let start = Instant::now();
    io.stop();
    let stop_elapsed = start.elapsed();

    assert_eq!(hits.load(Ordering::SeqCst), 1000);
    assert!(
        stop_elapsed < Duration::from_secs(1),
        "stop took {:?}",
        stop_elapsed
    );

    drop(io);
    assert_eq!(fibrio::total_fibers(), 0, "fibers leaked past shutdown");
}
