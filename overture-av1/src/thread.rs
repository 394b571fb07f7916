//! Decode-progress coordination.
//!
//! Every in-flight picture exposes two monotone row counters: block-level
//! progress (symbol parsing) and pixel-level progress (reconstruction plus
//! post-filters). Dependent frames block on the counter matching the data
//! they need. CDF snapshots flow between frames through single-assignment
//! slots with the same wait/signal discipline.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cdf::CdfContext;
use crate::error::{Av1Error, Result};
use overture_core::Picture;

/// What a waiter needs from a reference row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Y = 0,
    Uv = 1,
    Block = 2,
    All = 3,
}

/// The two monotone row-progress counters of one picture.
pub struct Progress {
    counters: [AtomicU32; 2],
    error: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: [AtomicU32::new(0), AtomicU32::new(0)],
            error: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Raw counter value: index 0 is block-level, 1 is pixel-level.
    pub fn get(&self, idx: usize) -> u32 {
        self.counters[idx].load(Ordering::Acquire)
    }

    /// Publish progress up to luma row `y` (pixels).
    pub fn signal(&self, y: u32, plane_type: PlaneType) {
        let _guard = self.lock.lock();
        if plane_type != PlaneType::Y {
            self.counters[0].store(y, Ordering::Release);
        }
        if plane_type != PlaneType::Block {
            self.counters[1].store(y, Ordering::Release);
        }
        self.cond.notify_all();
    }

    /// Mark the picture failed and release all waiters.
    pub fn signal_error(&self) {
        self.error.store(true, Ordering::Release);
        self.signal(u32::MAX, PlaneType::All);
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Block until the counter covers `y_unclipped` (luma pixel rows for
    /// block/luma waits, chroma rows for UV waits).
    pub fn wait(&self, y_unclipped: u32, plane_type: PlaneType, ss_ver: u32, h: u32) -> Result<()> {
        debug_assert!(plane_type != PlaneType::All);
        // convert to luma rows, include the loop-filter delay, clip
        let mut y = y_unclipped << (plane_type as u32 & ss_ver);
        y = y.saturating_add(if plane_type != PlaneType::Block { 8 } else { 0 });
        let y = y.clamp(1, h);
        let idx = (plane_type != PlaneType::Block) as usize;

        if self.counters[idx].load(Ordering::Acquire) < y {
            let mut guard = self.lock.lock();
            while self.counters[idx].load(Ordering::Relaxed) < y {
                self.cond.wait(&mut guard);
            }
        }
        if self.is_error() {
            return Err(Av1Error::InvalidBitstream("reference frame failed to decode"));
        }
        Ok(())
    }
}

/// A picture plus its visibility state and progress counters.
#[derive(Clone)]
pub struct ThreadPicture {
    pub p: Picture,
    pub visible: bool,
    pub flushed: Arc<AtomicBool>,
    pub progress: Option<Arc<Progress>>,
}

impl ThreadPicture {
    pub fn new(p: Picture, visible: bool, threaded: bool) -> Self {
        Self {
            p,
            visible,
            flushed: Arc::new(AtomicBool::new(false)),
            progress: threaded.then(Progress::new),
        }
    }

    pub fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    /// Wait for decode progress of this picture; no-op when untracked.
    pub fn wait_progress(&self, y_unclipped: u32, plane_type: PlaneType) -> Result<()> {
        let Some(progress) = &self.progress else {
            return Ok(());
        };
        progress.wait(
            y_unclipped,
            plane_type,
            self.p.params.layout.ss_ver(),
            self.p.params.h,
        )
    }

    /// Publish decode progress; no-op when untracked.
    pub fn signal_progress(&self, y: u32, plane_type: PlaneType) {
        if let Some(progress) = &self.progress {
            progress.signal(y, plane_type);
        }
    }
}

/// Single-assignment CDF hand-off between frames.
pub struct CdfSlot {
    inner: Mutex<Option<Arc<CdfContext>>>,
    cond: Condvar,
}

impl CdfSlot {
    /// A slot that already holds a context.
    pub fn ready(cdf: Arc<CdfContext>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(cdf)),
            cond: Condvar::new(),
        })
    }

    /// A slot a decoding frame will fill later.
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self, cdf: Arc<CdfContext>) {
        let mut guard = self.inner.lock();
        debug_assert!(guard.is_none(), "CDF slot signalled twice");
        *guard = Some(cdf);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> Arc<CdfContext> {
        let mut guard = self.inner.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        guard.as_ref().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_progress_monotone_wait() {
        let progress = Progress::new();
        let p2 = progress.clone();
        let waiter = std::thread::spawn(move || p2.wait(32, PlaneType::Y, 0, 64));
        std::thread::sleep(Duration::from_millis(10));
        // 32 rows + 8 loop-filter delay
        progress.signal(40, PlaneType::All);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_block_wait_has_no_filter_delay() {
        let progress = Progress::new();
        progress.signal(32, PlaneType::Block);
        assert_eq!(progress.get(0), 32);
        assert_eq!(progress.get(1), 0);
        progress.wait(32, PlaneType::Block, 0, 64).unwrap();
    }

    #[test]
    fn test_error_releases_waiters() {
        let progress = Progress::new();
        let p2 = progress.clone();
        let waiter = std::thread::spawn(move || p2.wait(64, PlaneType::Y, 0, 64));
        std::thread::sleep(Duration::from_millis(10));
        progress.signal_error();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_cdf_slot_handoff() {
        let slot = CdfSlot::pending();
        let s2 = slot.clone();
        let waiter = std::thread::spawn(move || s2.wait());
        std::thread::sleep(Duration::from_millis(10));
        slot.signal(Arc::new(CdfContext::new(64)));
        let _cdf = waiter.join().unwrap();
    }
}
