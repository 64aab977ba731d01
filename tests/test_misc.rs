
use evq::Equeue;
use evq::Dispatch;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

#[test]
fn test_break() {
    let q = Equeue::with_size(1024*1024);

    // two immediate events, the handler breaks out of dispatch, so the
    // second must stay pending
    let count = AtomicU32::new(0);
    for _ in 0..2 {
        q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
            q.break_dispatch();
        }).unwrap();
    }

    assert_eq!(q.dispatch(-1), Dispatch::Break);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(q.usage().pending, 1);

    assert_eq!(q.dispatch(-1), Dispatch::Break);
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(q.usage().pending, 0);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_break_preset() {
    let q = Equeue::with_size(1024*1024);

    // a break latched before dispatch lets at most one event run
    let count = AtomicU32::new(0);
    for _ in 0..10 {
        q.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }
    q.break_dispatch();

    assert_eq!(q.dispatch(-1), Dispatch::Break);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(q.usage().pending, 9);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_break_idle() {
    let q = Equeue::with_size(1024*1024);

    // a break with nothing due still wakes an indefinite dispatch
    q.break_dispatch();
    assert_eq!(q.dispatch(-1), Dispatch::Break);
}

#[test]
fn test_break_from_thread() {
    let q = Equeue::with_size(1024*1024);

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            q.break_dispatch();
        });

        assert_eq!(q.dispatch(-1), Dispatch::Break);
    });
}

#[test]
fn test_dispatch_timeout() {
    let q = Equeue::with_size(1024*1024);

    // nothing due, dispatch(0) is a no-op and returns promptly
    let before = q.tick();
    assert_eq!(q.dispatch(0), Dispatch::Timeout);
    assert!(q.tick().wrapping_sub(before) < 100);

    // a timed dispatch waits out its timeout
    let before = q.tick();
    assert_eq!(q.dispatch(100), Dispatch::Timeout);
    assert!(q.tick().wrapping_sub(before) >= 100);
}

#[test]
fn test_tick() {
    let q = Equeue::with_size(1024*1024);

    let before = q.tick();
    thread::sleep(Duration::from_millis(100));
    let elapsed = q.tick().wrapping_sub(before);
    assert!(elapsed >= 100 && elapsed < 10000);
}

#[test]
fn test_default_queue() {
    let q = Equeue::default();

    let count = AtomicU32::new(0);
    q.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();
    q.dispatch(0);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(q.usage().slab_total >= evq::QUEUE_SIZE_DEFAULT - evq::EVENT_SIZE);
    println!("usage: {:?}", q.usage());
}

#[test]
fn test_drop_cleans_up() {
    // events that never ran have their payloads dropped with the queue
    use std::sync::Arc;

    let dropped = Arc::new(AtomicU32::new(0));

    struct Canary(Arc<AtomicU32>);
    impl Drop for Canary {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    {
        let q = Equeue::with_size(1024*1024);
        let canary = Canary(dropped.clone());
        q.call_in(10_000, move || {
            let _ = &canary;
        }).unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}
