
#![deny(missing_debug_implementations)]

//! A bounded-memory event queue for scheduling work across execution
//! contexts.
//!
//! Events are carved out of a fixed arena, so posting never touches the
//! host allocator and is safe to call from interrupt-style contexts.
//! Events may be immediate, delayed, or periodic, and every post returns
//! an [`Id`] that can be used to cancel the event until it has finished
//! executing. A queue can block in [`Equeue::dispatch`], offload its
//! waiting to an external timer with [`Equeue::background`], or run as
//! part of another queue's dispatch loop with [`Equeue::chain`].

use core::alloc::Layout;
use core::borrow::Borrow;
use core::borrow::BorrowMut;
use core::fmt;
use core::marker::PhantomData;
use core::mem::align_of;
use core::mem::forget;
use core::mem::size_of;
use core::ops::Deref;
use core::ops::DerefMut;
use core::ptr;
use core::ptr::drop_in_place;

use log::debug;
use log::trace;

mod util;
use util::*;

pub mod sys;
use sys::SysClock;
use sys::Mutex;
use sys::AtomicBool;
use sys::AtomicUsize;
use sys::Ordering;

pub mod traits;
use traits::*;

pub use sys::itick;
pub use sys::utick;


/// Minimum size of an event slot, enough for the event header plus a
/// two-word callable payload
pub const EVENT_SIZE: usize = size_of::<Ebuf>() + 2*size_of::<*const usize>();

/// Default arena size used by `Equeue::default`
pub const QUEUE_SIZE_DEFAULT: usize = 32*EVENT_SIZE;

// smallest region worth keeping on the free list
const MIN_SLOT: usize = (EVENT_SIZE + Eptr::ALIGN-1) / Eptr::ALIGN * Eptr::ALIGN;


/// Event queue errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    NoMem,
    Chain,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "Out of memory"),
            Error::Chain => write!(f, "Bad chain"),
        }
    }
}


/// A unique id for a posted event
///
/// Ids encode the event's slot and a generation count, so a stale id
/// held after its event completes can never match a recycled slot. The
/// zero id is reserved to mean "allocation failed".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(u32);

impl Id {
    pub const fn null() -> Id {
        Id(0)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<Id> for u32 {
    fn from(id: Id) -> u32 {
        id.0
    }
}

/// Why dispatch returned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Timeout,
    Break,
}


/// Slab-internal pointer, a byte offset into the arena, zero is null
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
struct Eptr(u32);

impl fmt::Debug for Eptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // these really need to be in hex to be readable
        write!(f, "Eptr(0x{:x})", self.0)
    }
}

impl Eptr {
    // maximum alignment of internal allocations, this must be larger
    // than Ebuf's alignment, and pointer alignment is a common alignment
    const ALIGN: usize = cmax(align_of::<Ebuf>(), align_of::<*const usize>());

    const fn null() -> Eptr {
        Eptr(0)
    }

    const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Event lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Free,
    Pending,
    Inflight,
    Cancelled,
}

/// Internal event header, shared by live slots and free regions
#[derive(Debug)]
struct Ebuf {
    next: Eptr,
    sibling: Eptr,
    size: usize,

    // rotated on free, embedded in exposed ids
    gen: u32,
    state: State,

    target: utick,
    period: itick,

    cb: Option<fn(*mut u8)>,
    drop: Option<fn(*mut u8)>,
}

impl Ebuf {
    unsafe fn data(e: *mut Ebuf) -> *mut u8 {
        e.add(1) as *mut u8
    }

    unsafe fn from_data(p: *mut u8) -> Option<*mut Ebuf> {
        if !p.is_null() {
            Some((p as *mut Ebuf).sub(1))
        } else {
            None
        }
    }
}

/// Queue state guarded by the critical section
#[derive(Debug)]
struct Inner {
    // address-ordered free list
    free: Eptr,
    // pending list, sorted by target with sibling chains for equal
    // targets
    queue: Eptr,
}

/// The update hook installed by [`Equeue::background`]
pub type UpdateFn = Box<dyn FnMut(itick) + Send>;

// raw queue pointer that can cross into the chain closures
#[derive(Copy, Clone)]
struct QueuePtr(*const Equeue);

unsafe impl Send for QueuePtr {}


/// Event queue
///
/// A single dispatcher context drains the queue, while any number of
/// other contexts, including interrupt handlers, may post and cancel
/// events concurrently.
pub struct Equeue {
    // memory management
    slab: *mut u8,
    slab_len: usize,
    owned: bool,
    npw2: u8,

    inner: Mutex<Inner>,
    clock: SysClock,
    break_requested: AtomicBool,

    // external driver hooks
    update: Mutex<Option<UpdateFn>>,
    backgrounded: AtomicBool,
    chained: AtomicUsize,
}

unsafe impl Send for Equeue {}
unsafe impl Sync for Equeue {}

impl fmt::Debug for Equeue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Equeue")
            .field("slab", &self.slab)
            .field("slab_len", &self.slab_len)
            .field("npw2", &self.npw2)
            .finish_non_exhaustive()
    }
}

impl Equeue {
    /// Create an event queue backed by a heap-allocated arena of `size`
    /// bytes
    pub fn with_size(size: usize) -> Equeue {
        // ids split into offset+generation, huge arenas leave no room
        // for the generation half
        assert!(size <= u32::MAX as usize / 2);
        let size = alignup(max(size, Eptr::ALIGN + MIN_SLOT), Eptr::ALIGN);
        let layout = Layout::from_size_align(size, Eptr::ALIGN).unwrap();
        let buffer = unsafe { sys::alloc(layout) };
        if buffer.is_null() {
            sys::handle_alloc_error(layout);
        }
        unsafe { ptr::write_bytes(buffer, 0, size) };

        match Equeue::from_raw_parts(buffer, size, true) {
            Ok(q) => q,
            Err(_) => unreachable!(),
        }
    }

    /// Create an event queue backed by a caller-owned buffer
    ///
    /// The buffer must outlive the queue, which is what the 'static
    /// lifetime enforces.
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Equeue, Error> {
        // align buffer
        let align = buffer.as_mut_ptr().align_offset(Eptr::ALIGN);
        let buffer = buffer.get_mut(align..).ok_or(Error::NoMem)?;

        // go ahead and zero our buffer, this makes the arena state
        // well-defined before any slot is carved out of it
        buffer.fill(0);

        Equeue::from_raw_parts(buffer.as_mut_ptr(), buffer.len(), false)
    }

    fn from_raw_parts(
        slab: *mut u8,
        len: usize,
        owned: bool,
    ) -> Result<Equeue, Error> {
        let len = aligndown(len, Eptr::ALIGN);
        // ids split into offset+generation, we need room for both
        if len < Eptr::ALIGN + MIN_SLOT || len > u32::MAX as usize / 2 {
            return Err(Error::NoMem);
        }

        // the first granule is reserved so offset zero can act as null,
        // the rest starts life as a single free region
        unsafe {
            let r = slab.add(Eptr::ALIGN) as *mut Ebuf;
            r.write(Ebuf {
                next: Eptr::null(),
                sibling: Eptr::null(),
                size: len - Eptr::ALIGN,
                gen: 0,
                state: State::Free,
                target: 0,
                period: 0,
                cb: None,
                drop: None,
            });
        }

        trace!("evq: new queue, {} byte arena", len);
        Ok(Equeue {
            slab: slab,
            slab_len: len,
            owned: owned,
            npw2: npw2(len),

            inner: Mutex::new(Inner {
                free: Eptr(Eptr::ALIGN as u32),
                queue: Eptr::null(),
            }),
            clock: SysClock::new(),
            break_requested: AtomicBool::new(false),

            update: Mutex::new(None),
            backgrounded: AtomicBool::new(false),
            chained: AtomicUsize::new(0),
        })
    }

    //// slab-internal pointer munging ////

    fn ebuf(&self, p: Eptr) -> *mut Ebuf {
        debug_assert!(!p.is_null());
        debug_assert!((p.0 as usize) < self.slab_len);
        unsafe { self.slab.add(p.0 as usize) as *mut Ebuf }
    }

    fn eptr(&self, e: *mut Ebuf) -> Eptr {
        unsafe { Eptr((e as *mut u8).offset_from(self.slab) as u32) }
    }

    fn contains(&self, e: *mut Ebuf) -> bool {
        let p = e as *const u8;
        p >= self.slab as *const u8
            && p < unsafe { self.slab.add(self.slab_len) as *const u8 }
    }

    fn gen_mask(&self) -> u32 {
        u32::MAX >> self.npw2
    }

    unsafe fn make_id(&self, e: *mut Ebuf) -> Id {
        let off = self.eptr(e).0;
        Id(((*e).gen << self.npw2) | off)
    }

    fn decode_id(&self, id: Id) -> Option<(u32, u32)> {
        if id.is_null() {
            return None;
        }

        let off = id.0 & ((1u32 << self.npw2) - 1);
        let gen = id.0 >> self.npw2;
        if off == 0 {
            return None;
        }

        Some((off, gen))
    }

    //// memory management ////

    // First-fit over the address-ordered free list, splitting the
    // chosen region when the remainder is still a usable slot.
    fn alloc_ebuf(&self, inner: &mut Inner, size: usize) -> Option<*mut Ebuf> {
        let nsize = match size_of::<Ebuf>().checked_add(size) {
            Some(nsize) if nsize <= self.slab_len => alignup(nsize, Eptr::ALIGN),
            _ => return None,
        };

        let mut prev: *mut Eptr = &mut inner.free;
        unsafe {
            loop {
                let rp = *prev;
                if rp.is_null() {
                    return None;
                }

                let r = self.ebuf(rp);
                if (*r).size >= nsize {
                    if (*r).size - nsize >= MIN_SLOT {
                        // split, the remainder keeps the region's spot
                        // in the list and inherits its generation
                        let rem = (r as *mut u8).add(nsize) as *mut Ebuf;
                        rem.write(Ebuf {
                            next: (*r).next,
                            sibling: Eptr::null(),
                            size: (*r).size - nsize,
                            gen: (*r).gen,
                            state: State::Free,
                            target: 0,
                            period: 0,
                            cb: None,
                            drop: None,
                        });
                        *prev = self.eptr(rem);
                        (*r).size = nsize;
                    } else {
                        *prev = (*r).next;
                    }

                    (*r).next = Eptr::null();
                    (*r).sibling = Eptr::null();
                    (*r).state = State::Free;
                    (*r).cb = None;
                    (*r).drop = None;
                    return Some(r);
                }

                prev = ptr::addr_of_mut!((*r).next);
            }
        }
    }

    // Address-ordered insert with coalescing of adjacent regions.
    // Rotates the slot's generation so outstanding ids stop validating.
    unsafe fn dealloc_ebuf(&self, inner: &mut Inner, e: *mut Ebuf) {
        debug_assert!(self.contains(e));
        let eoff = self.eptr(e).0;

        (*e).gen = (*e).gen.wrapping_add(1) & self.gen_mask();
        (*e).state = State::Free;
        (*e).sibling = Eptr::null();
        (*e).cb = None;
        (*e).drop = None;

        // find our neighbours
        let mut prev: *mut Eptr = &mut inner.free;
        let mut prev_region: *mut Ebuf = ptr::null_mut();
        loop {
            let np = *prev;
            if np.is_null() || np.0 > eoff {
                break;
            }
            prev_region = self.ebuf(np);
            prev = ptr::addr_of_mut!((*prev_region).next);
        }

        // merge with the following region?
        let next = *prev;
        (*e).next = next;
        if !next.is_null() && eoff as usize + (*e).size == next.0 as usize {
            let n = self.ebuf(next);
            (*e).size += (*n).size;
            (*e).gen = max((*e).gen, (*n).gen);
            (*e).next = (*n).next;
        }
        *prev = self.eptr(e);

        // merge with the preceding region?
        if !prev_region.is_null() {
            let poff = self.eptr(prev_region).0;
            if poff as usize + (*prev_region).size == eoff as usize {
                (*prev_region).size += (*e).size;
                (*prev_region).gen = max((*prev_region).gen, (*e).gen);
                (*prev_region).next = (*e).next;
            }
        }
    }

    //// pending list management ////

    // Sorted insert under modular time, events sharing a target hang
    // off the first such event as a sibling chain in insertion order.
    unsafe fn enqueue(&self, inner: &mut Inner, e: *mut Ebuf, now: utick) {
        debug_assert!((*e).state == State::Pending);
        let dt = sdiff((*e).target, now);

        let mut prev: *mut Eptr = &mut inner.queue;
        loop {
            let pp = *prev;
            if pp.is_null() {
                (*e).next = Eptr::null();
                (*e).sibling = Eptr::null();
                *prev = self.eptr(e);
                return;
            }

            let p = self.ebuf(pp);
            if (*p).target == (*e).target {
                let mut sprev: *mut Eptr = ptr::addr_of_mut!((*p).sibling);
                while !(*sprev).is_null() {
                    let s = self.ebuf(*sprev);
                    sprev = ptr::addr_of_mut!((*s).sibling);
                }
                (*e).next = Eptr::null();
                (*e).sibling = Eptr::null();
                *sprev = self.eptr(e);
                return;
            }

            if sdiff((*p).target, now) > dt {
                (*e).next = pp;
                (*e).sibling = Eptr::null();
                *prev = self.eptr(e);
                return;
            }

            prev = ptr::addr_of_mut!((*p).next);
        }
    }

    // Slice every due event off the front of the pending list, flattened
    // into a run-order chain through the next links. Events posted while
    // the batch executes go to the pending list, never the live batch.
    unsafe fn dequeue_due(&self, inner: &mut Inner, now: utick) -> Eptr {
        let mut batch = Eptr::null();
        let mut tail: *mut Eptr = &mut batch;

        while !inner.queue.is_null() {
            let pp = inner.queue;
            let p = self.ebuf(pp);
            if sdiff((*p).target, now) > 0 {
                break;
            }

            inner.queue = (*p).next;

            // primary first, then its siblings in insertion order
            *tail = pp;
            let mut cur = pp;
            loop {
                let c = self.ebuf(cur);
                (*c).state = State::Inflight;
                let sib = (*c).sibling;
                (*c).sibling = Eptr::null();
                if sib.is_null() {
                    (*c).next = Eptr::null();
                    tail = ptr::addr_of_mut!((*c).next);
                    break;
                }
                (*c).next = sib;
                cur = sib;
            }
        }

        batch
    }

    // Unlink the event with this offset from the pending list, either
    // removing a sibling or promoting the first sibling into the primary
    // position. Offsets are matched before any generation is trusted, so
    // a stale id can never alias payload bytes as a header.
    unsafe fn unlink_id(
        &self,
        inner: &mut Inner,
        off: u32,
        gen: u32,
    ) -> Option<*mut Ebuf> {
        let mut prev: *mut Eptr = &mut inner.queue;
        loop {
            let pp = *prev;
            if pp.is_null() {
                return None;
            }

            let p = self.ebuf(pp);
            if pp.0 == off {
                if (*p).gen != gen {
                    return None;
                }

                let sib = (*p).sibling;
                if !sib.is_null() {
                    let s = self.ebuf(sib);
                    (*s).next = (*p).next;
                    *prev = sib;
                } else {
                    *prev = (*p).next;
                }
                (*p).next = Eptr::null();
                (*p).sibling = Eptr::null();
                return Some(p);
            }

            let mut sprev: *mut Eptr = ptr::addr_of_mut!((*p).sibling);
            loop {
                let sp = *sprev;
                if sp.is_null() {
                    break;
                }
                let s = self.ebuf(sp);
                if sp.0 == off {
                    if (*s).gen != gen {
                        return None;
                    }
                    *sprev = (*s).sibling;
                    (*s).sibling = Eptr::null();
                    return Some(s);
                }
                sprev = ptr::addr_of_mut!((*s).sibling);
            }

            prev = ptr::addr_of_mut!((*p).next);
        }
    }

    // Post an allocated event, minting its id and waking the dispatcher
    // if it became the new head.
    fn post_ebuf(&self, e: *mut Ebuf, delay: itick, period: itick) -> Id {
        let delay = max(delay, 0);
        let period = max(period, 0);

        let (id, is_head) = {
            let mut inner = self.inner.lock().unwrap();
            let now = self.clock.now();
            unsafe {
                (*e).target = now.wrapping_add(delay as utick);
                (*e).period = period;
                (*e).state = State::Pending;
                let id = self.make_id(e);
                self.enqueue(&mut inner, e, now);
                (id, inner.queue == self.eptr(e))
            }
        };

        if is_head {
            self.clock.signal();
        }
        self.notify_update();
        id
    }

    // delay to the head event, None if the queue is empty
    fn head_delay(&self) -> Option<itick> {
        let inner = self.inner.lock().unwrap();
        if inner.queue.is_null() {
            return None;
        }
        let now = self.clock.now();
        let head = self.ebuf(inner.queue);
        Some(max(unsafe { sdiff((*head).target, now) }, 0))
    }

    // Arm the external driver with the delay to the head. The update
    // hook runs under its own mutex with the critical section released,
    // posting back into this queue from inside the hook deadlocks and is
    // not supported.
    fn notify_update(&self) {
        if !self.backgrounded.load(Ordering::SeqCst) {
            return;
        }

        let mut update = self.update.lock().unwrap();
        if let Some(cb) = update.as_mut() {
            let delay = self.head_delay().unwrap_or(-1);
            cb(delay);
        }
    }

    //// operations ////

    /// Millisecond counter
    ///
    /// The underlying tick of the event queue, the number of
    /// milliseconds since an arbitrary point in time. Intentionally
    /// overflows to 0 after 2^32-1.
    pub fn tick(&self) -> utick {
        self.clock.now()
    }

    /// Post a raw event
    ///
    /// Reserves `size` zeroed payload bytes and schedules `cb` to be
    /// called with the payload's address after `delay` milliseconds,
    /// re-arming every `period` milliseconds if `period > 0`. `dtor`,
    /// if any, runs on the payload before the slot is reclaimed.
    ///
    /// Returns the null id if the arena is exhausted. This function is
    /// IRQ safe.
    pub fn post_raw(
        &self,
        delay: itick,
        period: itick,
        cb: fn(*mut u8),
        dtor: Option<fn(*mut u8)>,
        size: usize,
    ) -> Id {
        let e = {
            let mut inner = self.inner.lock().unwrap();
            self.alloc_ebuf(&mut inner, size)
        };
        let Some(e) = e else {
            return Id::null();
        };

        unsafe {
            ptr::write_bytes(Ebuf::data(e), 0, size);
            (*e).cb = Some(cb);
            (*e).drop = dtor;
        }
        self.post_ebuf(e, delay, period)
    }

    /// Cancel an in-flight event
    ///
    /// Returns true if the event was cancelled, false if the id is
    /// stale or the event has already begun executing. When called from
    /// a context other than the dispatcher the cancel races with
    /// dispatch, whichever reaches the critical section first wins; a
    /// call from the dispatcher's own context on a pending event always
    /// succeeds. This function is IRQ safe and never blocks on a running
    /// handler.
    pub fn cancel(&self, id: Id) -> bool {
        let Some((off, gen)) = self.decode_id(id) else {
            return false;
        };

        let e = {
            let mut inner = self.inner.lock().unwrap();
            match unsafe { self.unlink_id(&mut inner, off, gen) } {
                Some(e) => {
                    unsafe { (*e).state = State::Cancelled };
                    e
                }
                None => return false,
            }
        };

        // destructors run outside the critical section
        let (dtor, data) = unsafe { ((*e).drop, Ebuf::data(e)) };
        if let Some(dtor) = dtor {
            dtor(data);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            unsafe { self.dealloc_ebuf(&mut inner, e) };
        }
        self.notify_update();
        true
    }

    /// Query how much time is left until a delayed event is due
    ///
    /// Returns 0 if the event is already due, currently executing, or
    /// the id no longer names a live event. This function is IRQ safe.
    pub fn time_left(&self, id: Id) -> itick {
        let Some((off, gen)) = self.decode_id(id) else {
            return 0;
        };

        let inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        let mut pp = inner.queue;
        while !pp.is_null() {
            let p = self.ebuf(pp);
            unsafe {
                let mut sp = pp;
                while !sp.is_null() {
                    let s = self.ebuf(sp);
                    if sp.0 == off {
                        if (*s).gen == gen {
                            return max(sdiff((*s).target, now), 0);
                        }
                        return 0;
                    }
                    sp = (*s).sibling;
                }
                pp = (*p).next;
            }
        }
        0
    }

    /// Dispatch events
    ///
    /// Executes events until `ms` milliseconds have passed. A negative
    /// `ms` dispatches indefinitely, or until [`Equeue::break_dispatch`]
    /// is called. With `ms == 0` every currently due event is executed
    /// without waiting, which is IRQ safe.
    pub fn dispatch(&self, ms: itick) -> Dispatch {
        let mut tick = self.clock.now();
        let timeout = tick.wrapping_add(ms as utick);

        loop {
            // collect all the events currently due
            let mut es = unsafe {
                let mut inner = self.inner.lock().unwrap();
                self.dequeue_due(&mut inner, tick)
            };

            // dispatch them, outside the critical section
            while !es.is_null() {
                let e = self.ebuf(es);
                let (cb, dtor, period, data) = unsafe {
                    es = (*e).next;
                    (*e).next = Eptr::null();
                    ((*e).cb, (*e).drop, (*e).period, Ebuf::data(e))
                };

                if let Some(cb) = cb {
                    cb(data);
                }

                // reclaim or re-arm
                if period > 0 {
                    let mut inner = self.inner.lock().unwrap();
                    let now = self.clock.now();
                    unsafe {
                        (*e).target = (*e).target.wrapping_add(period as utick);
                        (*e).state = State::Pending;
                        self.enqueue(&mut inner, e, now);
                    }
                } else {
                    if let Some(dtor) = dtor {
                        dtor(data);
                    }
                    let mut inner = self.inner.lock().unwrap();
                    unsafe { self.dealloc_ebuf(&mut inner, e) };
                }
                self.notify_update();

                // a break stops the batch, whatever hasn't run goes back
                // to the pending list untouched
                if self.break_requested.swap(false, Ordering::SeqCst) {
                    if !es.is_null() {
                        let mut inner = self.inner.lock().unwrap();
                        let now = self.clock.now();
                        let mut rp = es;
                        while !rp.is_null() {
                            let r = self.ebuf(rp);
                            unsafe {
                                rp = (*r).next;
                                (*r).next = Eptr::null();
                                (*r).state = State::Pending;
                                self.enqueue(&mut inner, r, now);
                            }
                        }
                        drop(inner);
                        self.notify_update();
                    }
                    return Dispatch::Break;
                }
            }

            if self.break_requested.swap(false, Ordering::SeqCst) {
                return Dispatch::Break;
            }

            // should we stop dispatching soon?
            tick = self.clock.now();
            let mut deadline = -1;
            if ms >= 0 {
                let d = sdiff(timeout, tick);
                if d <= 0 {
                    self.notify_update();
                    return Dispatch::Timeout;
                }
                deadline = d;
            }

            // find the next deadline
            {
                let inner = self.inner.lock().unwrap();
                if !inner.queue.is_null() {
                    let head = self.ebuf(inner.queue);
                    let d = max(unsafe { sdiff((*head).target, tick) }, 0);
                    if deadline < 0 || d < deadline {
                        deadline = d;
                    }
                }
            }

            // an external driver owns the waiting, hand the deadline
            // over and get out of its way
            if self.backgrounded.load(Ordering::SeqCst) {
                self.notify_update();
                return Dispatch::Timeout;
            }

            // wait for something to happen
            self.clock.wait(if deadline < 0 { None } else { Some(deadline) });

            if self.break_requested.swap(false, Ordering::SeqCst) {
                return Dispatch::Break;
            }

            tick = self.clock.now();
        }
    }

    /// Dispatch events indefinitely
    pub fn dispatch_forever(&self) -> Dispatch {
        self.dispatch(-1)
    }

    /// Break out of a running dispatch loop
    ///
    /// Pending events may finish executing, but no new events will be
    /// executed. This function is IRQ safe.
    pub fn break_dispatch(&self) {
        self.break_requested.store(true, Ordering::SeqCst);
        self.clock.signal();
    }

    /// Background this queue onto an external single-shot timer
    ///
    /// While an update hook is installed the queue no longer blocks in
    /// dispatch. Instead, after every change to the pending list, the
    /// hook is called with the delay until the next event is due, or -1
    /// when nothing is pending. The external driver is expected to call
    /// `dispatch(0)` once the indicated delay elapses.
    ///
    /// Passing None disarms the old hook with a -1 update and reverts
    /// the queue to internal waiting.
    pub fn background(&self, update: Option<UpdateFn>) {
        let mut slot = self.update.lock().unwrap();
        if let Some(old) = slot.as_mut() {
            old(-1);
        }

        self.backgrounded.store(update.is_some(), Ordering::SeqCst);
        *slot = update;

        if let Some(cb) = slot.as_mut() {
            if let Some(delay) = self.head_delay() {
                cb(delay);
            }
        }
    }

    /// Chain this queue onto another event queue
    ///
    /// After chaining, dispatching the target also dispatches this
    /// queue's events. The queues keep independent arenas and break
    /// flags. A None target unchains.
    ///
    /// The target must outlive this queue, or at least outlive the
    /// chain; unchain (or drop this queue) before dropping the target.
    ///
    /// Fails with `Error::Chain` if this queue is already chained, the
    /// target is this queue itself, or the chain would form a cycle.
    pub fn chain(&self, target: Option<&Equeue>) -> Result<(), Error> {
        let Some(target) = target else {
            debug!("evq: unchaining queue");
            self.background(None);
            self.chained.store(0, Ordering::SeqCst);
            return Ok(());
        };

        if self.chained.load(Ordering::SeqCst) != 0 {
            return Err(Error::Chain);
        }

        // reject self-chains and anything that would close a cycle
        let mut t = target as *const Equeue;
        while !t.is_null() {
            if ptr::eq(t, self) {
                return Err(Error::Chain);
            }
            t = unsafe { (*t).chained.load(Ordering::SeqCst) } as *const Equeue;
        }

        self.chained.store(target as *const Equeue as usize, Ordering::SeqCst);

        // ride the background hook, keeping one trampoline event posted
        // on the target that dispatches whatever is due here
        let child = QueuePtr(self);
        let parent = QueuePtr(target);
        let mut pending = Id::null();
        self.background(Some(Box::new(move |ms| {
            let parent = parent;
            let parent_q = unsafe { &*parent.0 };
            if !pending.is_null() {
                parent_q.cancel(pending);
                pending = Id::null();
            }
            if ms >= 0 {
                pending = parent_q
                    .call_in(ms, move || {
                        let child = child;
                        unsafe { &*child.0 }.dispatch(0);
                    })
                    .unwrap_or(Id::null());
            }
        })));

        debug!("evq: chained queue onto {:?}", target);
        Ok(())
    }

    //// raw allocation api ////

    /// Allocate a raw payload from the queue's arena
    ///
    /// Returns null on exhaustion. This function is IRQ safe.
    ///
    /// # Safety
    ///
    /// The returned memory must be returned to this queue with
    /// `dealloc_raw` or `post_raw_in`, never the host allocator.
    pub unsafe fn alloc_raw(&self, layout: Layout) -> *mut u8 {
        assert!(layout.align() <= Eptr::ALIGN);

        let mut inner = self.inner.lock().unwrap();
        match self.alloc_ebuf(&mut inner, layout.size()) {
            Some(e) => Ebuf::data(e),
            None => ptr::null_mut(),
        }
    }

    /// Return an unposted raw payload to the arena
    ///
    /// # Safety
    ///
    /// `e` must have come from `alloc_raw` on this queue and must not
    /// have been posted.
    pub unsafe fn dealloc_raw(&self, e: *mut u8) {
        let e = match Ebuf::from_data(e) {
            Some(e) => e,
            None => return, // do nothing
        };
        debug_assert!(self.contains(e));

        let mut inner = self.inner.lock().unwrap();
        self.dealloc_ebuf(&mut inner, e);
    }

    /// Attach a destructor to a raw payload
    ///
    /// # Safety
    ///
    /// `e` must be an unposted payload from `alloc_raw` on this queue.
    pub unsafe fn set_raw_drop(&self, e: *mut u8, dtor: fn(*mut u8)) {
        let e = Ebuf::from_data(e).unwrap();
        debug_assert!(self.contains(e));
        (*e).drop = Some(dtor);
    }

    /// Post a raw payload previously allocated with `alloc_raw`
    ///
    /// # Safety
    ///
    /// `e` must be an unposted payload from `alloc_raw` on this queue;
    /// ownership passes to the queue.
    pub unsafe fn post_raw_in(
        &self,
        e: *mut u8,
        delay: itick,
        period: itick,
        cb: fn(*mut u8),
    ) -> Id {
        let e = Ebuf::from_data(e).unwrap();
        debug_assert!(self.contains(e));
        (*e).cb = Some(cb);
        self.post_ebuf(e, delay, period)
    }
}

impl Default for Equeue {
    fn default() -> Equeue {
        Equeue::with_size(QUEUE_SIZE_DEFAULT)
    }
}

impl Drop for Equeue {
    fn drop(&mut self) {
        // disarm any external driver before tearing down
        self.background(None);

        // collect destructors under the lock, run them outside it
        let mut dtors = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let mut pp = inner.queue;
            while !pp.is_null() {
                let p = self.ebuf(pp);
                unsafe {
                    let mut sp = pp;
                    while !sp.is_null() {
                        let s = self.ebuf(sp);
                        if let Some(dtor) = (*s).drop {
                            dtors.push((dtor, Ebuf::data(s)));
                        }
                        sp = (*s).sibling;
                    }
                    pp = (*p).next;
                }
            }
            inner.queue = Eptr::null();
        }

        if !dtors.is_empty() {
            trace!("evq: dropping queue with {} pending events", dtors.len());
        }
        for (dtor, data) in dtors {
            dtor(data);
        }

        if self.owned {
            unsafe {
                sys::dealloc(
                    self.slab,
                    Layout::from_size_align_unchecked(self.slab_len, Eptr::ALIGN),
                );
            }
        }
    }
}


/// Typed event handle
///
/// An allocated, not-yet-posted event. The payload is accessible through
/// `Deref` until the event is posted, and is cleaned up if the handle is
/// dropped unposted.
pub struct Event<'a, T> {
    q: &'a Equeue,
    e: *mut Ebuf,
    delay: itick,
    period: itick,
    _phantom: PhantomData<T>,
}

impl<T> fmt::Debug for Event<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("q", &self.q)
            .field("e", &self.e)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .finish()
    }
}

impl Equeue {
    pub fn alloc<'a, T: Default>(&'a self) -> Result<Event<'a, T>, Error> {
        self.alloc_from(T::default())
    }

    pub fn alloc_from<'a, T>(&'a self, t: T) -> Result<Event<'a, T>, Error> {
        assert!(align_of::<T>() <= Eptr::ALIGN);

        let e = {
            let mut inner = self.inner.lock().unwrap();
            self.alloc_ebuf(&mut inner, size_of::<T>())
        }.ok_or(Error::NoMem)?;

        unsafe { (Ebuf::data(e) as *mut T).write(t) };
        Ok(Event {
            q: self,
            e: e,
            delay: 0,
            period: 0,
            _phantom: PhantomData,
        })
    }
}

impl<'a, T: Post + Send> Event<'a, T> {
    /// Milliseconds until the event first fires, defaults to 0
    pub fn delay(mut self, delay: itick) -> Self {
        self.delay = delay;
        self
    }

    /// Re-arm period in milliseconds, 0 leaves the event one-shot
    pub fn period(mut self, period: itick) -> Self {
        self.period = period;
        self
    }

    /// Post the event, handing ownership to the queue
    pub fn post(self) -> Id {
        // cb/drop thunks
        fn cb_thunk<T: Post>(e: *mut u8) {
            unsafe { &mut *(e as *mut T) }.post();
        }

        fn drop_thunk<T>(e: *mut u8) {
            unsafe { drop_in_place(e as *mut T) };
        }

        unsafe {
            (*self.e).cb = Some(cb_thunk::<T>);
            (*self.e).drop = Some(drop_thunk::<T>);
        }

        // post and then forget the event, it's up to the queue to
        // reclaim the slot later
        let id = self.q.post_ebuf(self.e, self.delay, self.period);
        forget(self);
        id
    }
}

impl<T> Drop for Event<'_, T> {
    fn drop(&mut self) {
        // make sure we clean up if the event isn't posted
        unsafe {
            drop_in_place(Ebuf::data(self.e) as *mut T);
            let mut inner = self.q.inner.lock().unwrap();
            self.q.dealloc_ebuf(&mut inner, self.e);
        }
    }
}

impl<T> Deref for Event<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(Ebuf::data(self.e) as *const T) }
    }
}

impl<T> DerefMut for Event<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *(Ebuf::data(self.e) as *mut T) }
    }
}

impl<T> AsRef<T> for Event<'_, T> {
    fn as_ref(&self) -> &T {
        self.deref()
    }
}

impl<T> AsMut<T> for Event<'_, T> {
    fn as_mut(&mut self) -> &mut T {
        self.deref_mut()
    }
}

impl<T> Borrow<T> for Event<'_, T> {
    fn borrow(&self) -> &T {
        self.deref()
    }
}

impl<T> BorrowMut<T> for Event<'_, T> {
    fn borrow_mut(&mut self) -> &mut T {
        self.deref_mut()
    }
}

impl Equeue {
    /// Call a closure in the context of the dispatch loop
    ///
    /// IRQ safe, and a handy mechanism for moving work out of interrupt
    /// context. Returns the event's id, or `Error::NoMem` if the arena
    /// is exhausted.
    pub fn call<F: PostOnce + Send>(&self, cb: F) -> Result<Id, Error> {
        self.call_in(0, cb)
    }

    /// Call a closure after `delay` milliseconds
    pub fn call_in<F: PostOnce + Send>(
        &self,
        delay: itick,
        cb: F,
    ) -> Result<Id, Error> {
        // one-shot closures are stored as Option so the thunk can take
        // them out while the destructor stays idempotent
        fn cb_thunk<F: PostOnce>(e: *mut u8) {
            if let Some(cb) = unsafe { (*(e as *mut Option<F>)).take() } {
                cb.post_once();
            }
        }

        fn drop_thunk<F>(e: *mut u8) {
            unsafe { drop_in_place(e as *mut Option<F>) };
        }

        assert!(align_of::<Option<F>>() <= Eptr::ALIGN);

        let e = {
            let mut inner = self.inner.lock().unwrap();
            self.alloc_ebuf(&mut inner, size_of::<Option<F>>())
        }.ok_or(Error::NoMem)?;

        unsafe {
            (Ebuf::data(e) as *mut Option<F>).write(Some(cb));
            (*e).cb = Some(cb_thunk::<F>);
            (*e).drop = Some(drop_thunk::<F>);
        }
        Ok(self.post_ebuf(e, delay, 0))
    }

    /// Call a closure every `period` milliseconds, starting after
    /// `period` milliseconds
    pub fn call_every<F: Post + Send>(
        &self,
        period: itick,
        cb: F,
    ) -> Result<Id, Error> {
        Ok(self.alloc_from(cb)?
            .delay(period)
            .period(period)
            .post())
    }
}


/// Arena usage counters, see [`Equeue::usage`]
#[derive(Debug, Copy, Clone)]
pub struct Usage {
    pub slab_total: usize,
    pub slab_used: usize,
    pub slab_free: usize,
    pub free_chunks: usize,
    pub pending: usize,
    pub pending_bytes: usize,
}

impl Equeue {
    /// Snapshot of the arena's bookkeeping, mostly useful for tests and
    /// debugging
    pub fn usage(&self) -> Usage {
        let inner = self.inner.lock().unwrap();

        let mut slab_free = 0;
        let mut free_chunks = 0;
        let mut fp = inner.free;
        while !fp.is_null() {
            let f = self.ebuf(fp);
            unsafe {
                slab_free += (*f).size;
                free_chunks += 1;
                fp = (*f).next;
            }
        }

        let mut pending = 0;
        let mut pending_bytes = 0;
        let mut pp = inner.queue;
        while !pp.is_null() {
            let p = self.ebuf(pp);
            unsafe {
                let mut sp = pp;
                while !sp.is_null() {
                    let s = self.ebuf(sp);
                    pending += 1;
                    pending_bytes += (*s).size;
                    sp = (*s).sibling;
                }
                pp = (*p).next;
            }
        }

        let slab_total = self.slab_len - Eptr::ALIGN;
        Usage {
            slab_total: slab_total,
            slab_used: slab_total - slab_free,
            slab_free: slab_free,
            free_chunks: free_chunks,
            pending: pending,
            pending_bytes: pending_bytes,
        }
    }
}
