
use evq::Equeue;

use std::thread;
use std::alloc::Layout;
use std::mem::transmute;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use structopt::StructOpt;


#[derive(Debug, StructOpt, Clone)]
#[structopt(rename_all="kebab")]
struct Opt {
    /// Number of posting threads
    #[structopt(short, long, default_value="8")]
    threads: usize,

    /// Maximum event payload in bytes
    #[structopt(short, long, default_value="512")]
    payload: usize,

    /// Maximum event delay in milliseconds
    #[structopt(short, long, default_value="100")]
    delay: i32,
}

fn main() {
    let opt = Opt::from_args();

    let mut buffer = vec![0; 1024*1024];
    let q = Arc::new(Equeue::with_buffer(
        unsafe { transmute::<&mut [u8], &'static mut [u8]>(buffer.as_mut()) }
    ).unwrap());

    // one dispatch thread
    {
        let q = q.clone();
        thread::spawn(move || {
            q.dispatch_forever();
        });
    }

    // some busywork, n threads, each posting random sizes and delays
    for _ in 0..opt.threads {
        let opt = opt.clone();
        let q = q.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                // we need to use the raw APIs for dynamic sizes
                let layout = Layout::from_size_align(
                    rng.gen_range(1..opt.payload),
                    1
                ).unwrap();
                let e = unsafe { q.alloc_raw(layout) };
                if e.is_null() {
                    // exhausted, give the dispatcher some room
                    thread::sleep(Duration::from_micros(rng.gen_range(0..2000)));
                    continue;
                }

                fn cb(_data: *mut u8) {
                    // do nothing
                }

                unsafe {
                    q.post_raw_in(e, rng.gen_range(0..opt.delay), 0, cb);
                }
            }
        });
    }

    // and now, in our main thread, render a rough usage readout
    loop {
        let usage = q.usage();
        println!(
            "q: {:4} pending ({:6} B), free {:7}/{:7} B in {:3} chunks",
            usage.pending,
            usage.pending_bytes,
            usage.slab_free,
            usage.slab_total,
            usage.free_chunks,
        );

        thread::sleep(Duration::from_millis(100));
    }
}
