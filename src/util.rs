
use core::mem::size_of;

use crate::sys::{utick, itick};

// max
pub(crate) use core::cmp::max;

// const-context max, for computing alignments
pub(crate) const fn cmax(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

// alignup/aligndown
pub(crate) trait Align {
    fn alignup(self, align: usize) -> Self;
    fn aligndown(self, align: usize) -> Self;
}

impl Align for usize {
    #[inline]
    fn aligndown(self, align: usize) -> usize {
        self - (self % align)
    }

    #[inline]
    fn alignup(self, align: usize) -> usize {
        (self + align-1).aligndown(align)
    }
}

#[inline]
pub(crate) fn aligndown<T: Align>(a: T, align: usize) -> T {
    a.aligndown(align)
}

#[inline]
pub(crate) fn alignup<T: Align>(a: T, align: usize) -> T {
    a.alignup(align)
}

// npw2
pub(crate) trait Npw2 {
    fn npw2(self) -> u8;
}

impl Npw2 for usize {
    #[inline]
    fn npw2(self) -> u8 {
        self.next_power_of_two().trailing_zeros() as u8
    }
}

#[inline]
pub(crate) fn npw2<T: Npw2>(a: T) -> u8 {
    a.npw2()
}

// sdiff, the signed modular difference all due-time decisions use,
// a - b interpreted in the window [-2^31, 2^31)
pub(crate) trait Sdiff {
    type Output;
    fn sdiff(self, b: Self) -> Self::Output;
}

impl Sdiff for utick {
    type Output = itick;

    #[inline]
    fn sdiff(self, b: utick) -> itick {
        debug_assert_eq!(size_of::<utick>(), size_of::<itick>());
        self.wrapping_sub(b) as itick
    }
}

#[inline]
pub(crate) fn sdiff<T: Sdiff>(a: T, b: T) -> <T as Sdiff>::Output {
    a.sdiff(b)
}
