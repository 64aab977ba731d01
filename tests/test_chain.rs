
use evq::Equeue;
use evq::Error;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[test]
fn test_chain() {
    let parent = Equeue::with_size(1024*1024);
    let child = Equeue::with_size(1024*1024);
    child.chain(Some(&parent)).unwrap();

    // dispatching the parent also drains the child
    let count = AtomicU32::new(0);
    child.call_in(200, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();
    parent.call_in(100, || {
        count.fetch_add(10, Ordering::SeqCst);
    }).unwrap();

    parent.dispatch(400);
    assert_eq!(count.load(Ordering::SeqCst), 11);

    child.chain(None).unwrap();
    println!("usage: {:?}", parent.usage());
    println!("usage: {:?}", child.usage());
}

#[test]
fn test_chain_immediate() {
    let parent = Equeue::with_size(1024*1024);
    let child = Equeue::with_size(1024*1024);
    child.chain(Some(&parent)).unwrap();

    let count = AtomicU32::new(0);
    for _ in 0..10 {
        child.call(|| {
            count.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
    }

    parent.dispatch(100);
    assert_eq!(count.load(Ordering::SeqCst), 10);

    child.chain(None).unwrap();
}

#[test]
fn test_chain_unchain() {
    let parent = Equeue::with_size(1024*1024);
    let child = Equeue::with_size(1024*1024);
    child.chain(Some(&parent)).unwrap();
    child.chain(None).unwrap();

    // unchained queues are independent again
    let count = AtomicU32::new(0);
    child.call(|| {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    parent.dispatch(100);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    child.dispatch(0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_chain_errors() {
    let a = Equeue::with_size(64*1024);
    let b = Equeue::with_size(64*1024);

    // no self-chains
    assert_eq!(a.chain(Some(&a)), Err(Error::Chain));

    a.chain(Some(&b)).unwrap();

    // no cycles
    assert_eq!(b.chain(Some(&a)), Err(Error::Chain));

    // no re-chaining without unchaining first
    assert_eq!(a.chain(Some(&b)), Err(Error::Chain));

    a.chain(None).unwrap();
    a.chain(Some(&b)).unwrap();
    a.chain(None).unwrap();
}

#[test]
fn test_chain_periodic() {
    let parent = Equeue::with_size(1024*1024);
    let child = Equeue::with_size(1024*1024);
    child.chain(Some(&parent)).unwrap();

    let count = AtomicU32::new(0);
    let id = child.call_every(100, || {
        count.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    parent.dispatch(350);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    assert_eq!(child.cancel(id), true);
    child.chain(None).unwrap();
    println!("usage: {:?}", child.usage());
}
