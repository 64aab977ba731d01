
// sys.rs provides the host integration, a monotonic millisecond clock
// paired with a latching binary semaphore, and the locking/atomic
// primitives the queue uses for its critical sections.
//
// Under `--cfg loom` the sync primitives swap to loom's models so the
// race tests in tests/test_loom.rs can explore interleavings.
//

use core::time::Duration;

use cfg_if::cfg_if;

use std::time::Instant;

use crate::traits::*;
use crate::util::*;


// Time primitives, the tick intentionally overflows at 2^32
#[allow(non_camel_case_types)] pub type utick = u32;
#[allow(non_camel_case_types)] pub type itick = i32;


// Locking/atomic primitives
cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::Mutex;
        pub(crate) use loom::sync::Condvar;
        pub(crate) use loom::sync::atomic::AtomicBool;
        pub(crate) use loom::sync::atomic::AtomicUsize;
        pub(crate) use loom::sync::atomic::Ordering;
    } else {
        pub(crate) use std::sync::Mutex;
        pub(crate) use std::sync::Condvar;
        pub(crate) use core::sync::atomic::AtomicBool;
        pub(crate) use core::sync::atomic::AtomicUsize;
        pub(crate) use core::sync::atomic::Ordering;
    }
}


// Memory allocation for owned arenas
pub(crate) use std::alloc::alloc;
pub(crate) use std::alloc::dealloc;
pub(crate) use std::alloc::handle_alloc_error;


/// Time/semaphore primitive
///
/// The semaphore is binary and latching, a signal raised while the
/// dispatcher isn't waiting is consumed by the next wait instead of
/// being lost.
#[derive(Debug)]
pub struct SysClock {
    instant: Instant,

    flag: Mutex<bool>,
    cond: Condvar,
}

impl SysClock {
    pub fn new() -> Self {
        Self {
            instant: Instant::now(),

            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        // truncation is the intended mod-2^32 wrap
        self.instant
            .elapsed()
            .as_millis()
            as utick
    }
}

impl Signal for SysClock {
    fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        drop(flag);

        self.cond.notify_one();
    }
}

impl Sema for SysClock {
    fn wait(&self, timeout: Option<itick>) {
        // already signaled?
        let mut flag = self.flag.lock().unwrap();
        if *flag {
            *flag = false;
            return;
        }

        match timeout {
            Some(ticks) => {
                let (mut flag, _) = self.cond
                    .wait_timeout(
                        flag,
                        Duration::from_millis(max(ticks, 0) as u64)
                    )
                    .unwrap();
                if *flag {
                    *flag = false;
                }
            }
            None => {
                while !*flag {
                    flag = self.cond.wait(flag).unwrap();
                }
                *flag = false;
            }
        }
    }
}
