
use evq::Equeue;

use std::mem::transmute;
use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[test]
fn test_alloc() {
    let mut buffer = vec![0; 1024*1024];
    let q = Equeue::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(100, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    unsafe { q.dealloc_raw(e) };

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_multiple() {
    let mut buffer = vec![0; 1024*1024];
    let q = Equeue::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(100, 1).unwrap();
    let mut es = vec![];
    for _ in 0..100 {
        let e = unsafe { q.alloc_raw(layout) };
        assert!(!e.is_null());
        es.push(e);
    }

    for i in 0..100 {
        unsafe { q.dealloc_raw(es[i]) };
    }

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_alloc_unique() {
    let mut buffer = vec![0; 1024*1024];
    let q = Equeue::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    // no two live payloads may overlap
    let layout = Layout::from_size_align(64, 1).unwrap();
    let mut es = vec![];
    for _ in 0..100 {
        let e = unsafe { q.alloc_raw(layout) };
        assert!(!e.is_null());
        es.push(e as usize);
    }

    let mut sorted = es.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), es.len());
    for pair in sorted.windows(2) {
        assert!(pair[1] - pair[0] >= 64);
    }

    for e in es {
        unsafe { q.dealloc_raw(e as *mut u8) };
    }
}

#[test]
fn test_alloc_conservation() {
    let q = Equeue::with_size(1024*1024);
    let total = q.usage().slab_free;

    let mut es = vec![];
    for i in 0..100 {
        let layout = Layout::from_size_align(i*10 + 1, 1).unwrap();
        let e = unsafe { q.alloc_raw(layout) };
        assert!(!e.is_null());
        es.push(e);
    }

    // free in an interleaved order to force merges on both sides
    for e in es.iter().step_by(2) {
        unsafe { q.dealloc_raw(*e) };
    }
    for e in es.iter().skip(1).step_by(2) {
        unsafe { q.dealloc_raw(*e) };
    }

    // every byte accounted for, coalesced back into one region
    let usage = q.usage();
    assert_eq!(usage.slab_free, total);
    assert_eq!(usage.free_chunks, 1);
    println!("usage: {:?}", usage);
}

#[test]
fn test_alloc_exhaustion() {
    let mut buffer = vec![0; 1024];
    let q = Equeue::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap();

    let layout = Layout::from_size_align(2*1024, 1).unwrap();
    assert_eq!(unsafe { q.alloc_raw(layout) }, ptr::null_mut());

    let layout = Layout::from_size_align(1024, 1).unwrap();
    assert_eq!(unsafe { q.alloc_raw(layout) }, ptr::null_mut());

    let layout = Layout::from_size_align(100, 1).unwrap();
    let e = unsafe { q.alloc_raw(layout) };
    assert!(!e.is_null());
    unsafe { q.dealloc_raw(e) };

    println!("usage: {:?}", q.usage());
}

#[test]
fn test_post_exhaustion_recovers() {
    let q = Equeue::with_size(4096);

    static COUNT: AtomicU32 = AtomicU32::new(0);
    fn cb(_data: *mut u8) {
        COUNT.fetch_add(1, Ordering::SeqCst);
    }

    // post quarter-arena events until the arena runs dry
    let mut accepted = 0;
    loop {
        let id = q.post_raw(0, 0, cb, None, 1024);
        if id.is_null() {
            break;
        }
        accepted += 1;
        assert!(accepted < 100);
    }
    assert!(accepted > 0);

    // draining the accepted events frees their slots, after which
    // posting works again
    q.dispatch(0);
    assert_eq!(COUNT.load(Ordering::SeqCst), accepted);

    let id = q.post_raw(0, 0, cb, None, 1024);
    assert!(!id.is_null());
    q.dispatch(0);
    assert_eq!(COUNT.load(Ordering::SeqCst), accepted + 1);
    println!("usage: {:?}", q.usage());
}
