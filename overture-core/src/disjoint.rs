//! Shared buffers with caller-guaranteed disjoint mutation.
//!
//! Decoder workers write frame-wide arrays (pixel planes, motion-vector
//! grids, segmentation maps) concurrently, but always in regions that never
//! overlap: each worker owns a fixed span of rows or columns. `DisjointMut`
//! models that contract: any thread may take a mutable view of a range, and
//! the caller guarantees ranges held at the same time do not overlap. Debug
//! builds verify the guarantee at runtime and panic on violation.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut, Range};

#[cfg(debug_assertions)]
use parking_lot::Mutex;

/// A heap buffer allowing concurrent mutable access to disjoint ranges.
pub struct DisjointMut<T> {
    inner: UnsafeCell<Box<[T]>>,
    #[cfg(debug_assertions)]
    borrows: Mutex<Vec<(Range<usize>, bool)>>,
}

// Safety: all aliasing views are produced through `slice`/`mut_slice`, whose
// contract requires the ranges of simultaneously-live views to be disjoint
// (mutable against anything) or read-only (shared among themselves).
unsafe impl<T: Send + Sync> Sync for DisjointMut<T> {}
unsafe impl<T: Send> Send for DisjointMut<T> {}

impl<T> DisjointMut<T> {
    /// Wrap a buffer.
    pub fn new(data: Vec<T>) -> Self {
        Self {
            inner: UnsafeCell::new(data.into_boxed_slice()),
            #[cfg(debug_assertions)]
            borrows: Mutex::new(Vec::new()),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        // Safety: the length is never mutated through any view.
        unsafe { (&*self.inner.get()).len() }
    }

    /// True when the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recover the underlying storage.
    pub fn into_inner(self) -> Vec<T> {
        self.inner.into_inner().into_vec()
    }

    #[cfg(debug_assertions)]
    fn track(&self, range: &Range<usize>, mutable: bool) {
        let mut borrows = self.borrows.lock();
        for (other, other_mutable) in borrows.iter() {
            let overlaps = range.start < other.end && other.start < range.end;
            if overlaps && (mutable || *other_mutable) {
                panic!(
                    "overlapping DisjointMut access: {:?} vs {:?}",
                    range, other
                );
            }
        }
        borrows.push((range.clone(), mutable));
    }

    #[cfg(debug_assertions)]
    fn untrack(&self, range: &Range<usize>, mutable: bool) {
        let mut borrows = self.borrows.lock();
        let idx = borrows
            .iter()
            .position(|(r, m)| r == range && *m == mutable)
            .expect("DisjointMut borrow not found");
        borrows.swap_remove(idx);
    }

    /// Borrow a range immutably.
    ///
    /// The caller must ensure no simultaneously-live mutable view overlaps
    /// `range`.
    pub fn slice(&self, range: Range<usize>) -> DisjointGuard<'_, T> {
        #[cfg(debug_assertions)]
        self.track(&range, false);
        // Safety: per the type contract, no overlapping mutable view is live.
        let slice = unsafe { &(&*self.inner.get())[range.clone()] };
        DisjointGuard {
            owner: self,
            range,
            mutable: false,
            slice: slice as *const [T] as *mut [T],
            _marker: std::marker::PhantomData,
        }
    }

    /// Borrow a range mutably.
    ///
    /// The caller must ensure no simultaneously-live view overlaps `range`.
    pub fn mut_slice(&self, range: Range<usize>) -> DisjointGuardMut<'_, T> {
        #[cfg(debug_assertions)]
        self.track(&range, true);
        // Safety: per the type contract, no overlapping view is live.
        let slice = unsafe { &mut (&mut *self.inner.get())[range.clone()] };
        DisjointGuardMut {
            owner: self,
            range,
            slice,
        }
    }

    /// Read one element.
    pub fn get(&self, index: usize) -> T
    where
        T: Copy,
    {
        self.slice(index..index + 1)[0]
    }
}

/// Shared view handed out by [`DisjointMut::slice`].
pub struct DisjointGuard<'a, T> {
    owner: &'a DisjointMut<T>,
    range: Range<usize>,
    mutable: bool,
    slice: *mut [T],
    _marker: std::marker::PhantomData<&'a [T]>,
}

impl<T> Deref for DisjointGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: constructed from a live borrow in `slice`.
        unsafe { &*self.slice }
    }
}

impl<T> Drop for DisjointGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.untrack(&self.range, self.mutable);
        #[cfg(not(debug_assertions))]
        {
            let _ = &self.owner;
            let _ = &self.range;
            let _ = self.mutable;
        }
    }
}

/// Mutable view handed out by [`DisjointMut::mut_slice`].
pub struct DisjointGuardMut<'a, T> {
    owner: &'a DisjointMut<T>,
    range: Range<usize>,
    slice: &'a mut [T],
}

impl<T> Deref for DisjointGuardMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.slice
    }
}

impl<T> DerefMut for DisjointGuardMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.slice
    }
}

impl<T> Drop for DisjointGuardMut<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.untrack(&self.range, true);
        #[cfg(not(debug_assertions))]
        let _ = &self.owner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_mutation() {
        let buf = DisjointMut::new(vec![0u8; 16]);
        {
            let mut a = buf.mut_slice(0..8);
            let mut b = buf.mut_slice(8..16);
            a.fill(1);
            b.fill(2);
        }
        assert_eq!(buf.get(0), 1);
        assert_eq!(buf.get(15), 2);
    }

    #[test]
    fn test_shared_reads_may_overlap() {
        let buf = DisjointMut::new(vec![7u8; 4]);
        let a = buf.slice(0..4);
        let b = buf.slice(1..3);
        assert_eq!(a[1], b[0]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "overlapping DisjointMut access")]
    fn test_overlap_panics_in_debug() {
        let buf = DisjointMut::new(vec![0u8; 8]);
        let _a = buf.mut_slice(0..5);
        let _b = buf.mut_slice(4..8);
    }

    #[test]
    fn test_into_inner() {
        let buf = DisjointMut::new(vec![3u16; 4]);
        buf.mut_slice(0..1)[0] = 9;
        assert_eq!(buf.into_inner(), vec![9, 3, 3, 3]);
    }
}
