//! Decoded picture buffers.
//!
//! A [`Picture`] owns up to three planes of pixel data behind a reference
//! count, so the same allocation can sit in an output queue, in reference
//! slots and in an in-flight decoder at once. Plane storage comes from a
//! [`PictureAllocator`], which callers may override to pool or pin memory.
//!
//! Samples wider than 8 bits are stored in the low bits of little-endian
//! `u16` pairs with the upper bits zero. Strides are measured in bytes and
//! may exceed the visible width for alignment.

use std::fmt;
use std::sync::Arc;

use crate::disjoint::{DisjointGuard, DisjointMut};
use crate::error::{Error, Result};

/// Chroma layout of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Luma only.
    I400,
    /// 2x2 chroma subsampling.
    I420,
    /// 2x1 chroma subsampling.
    I422,
    /// No chroma subsampling.
    I444,
}

impl PixelLayout {
    /// Horizontal chroma subsampling shift.
    pub fn ss_hor(self) -> u32 {
        match self {
            Self::I420 | Self::I422 => 1,
            Self::I400 | Self::I444 => 0,
        }
    }

    /// Vertical chroma subsampling shift.
    pub fn ss_ver(self) -> u32 {
        match self {
            Self::I420 => 1,
            _ => 0,
        }
    }

    /// Whether chroma planes are present.
    pub fn has_chroma(self) -> bool {
        self != Self::I400
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I400 => write!(f, "monochrome"),
            Self::I420 => write!(f, "4:2:0"),
            Self::I422 => write!(f, "4:2:2"),
            Self::I444 => write!(f, "4:4:4"),
        }
    }
}

/// Coding type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Key frame: intra only, resets references.
    #[default]
    Key,
    /// Inter frame.
    Inter,
    /// Intra-only frame that keeps references.
    IntraOnly,
    /// Switch frame.
    Switch,
}

impl FrameType {
    /// Whether blocks of this frame may code inter predictions.
    pub fn is_inter_allowed(self) -> bool {
        matches!(self, Self::Inter | Self::Switch)
    }
}

/// Static parameters of a decoded picture.
#[derive(Debug, Clone, Copy)]
pub struct PictureParams {
    /// Visible width in pixels.
    pub w: u32,
    /// Visible height in pixels.
    pub h: u32,
    /// Chroma layout.
    pub layout: PixelLayout,
    /// Frame coding type.
    pub frame_type: FrameType,
    /// Bits per component (8 or 10).
    pub bpc: u8,
    /// Signalled color primaries (passed through unvalidated).
    pub pri: u8,
    /// Signalled transfer characteristics.
    pub trc: u8,
    /// Signalled matrix coefficients.
    pub mtrx: u8,
    /// Signalled chroma sample position.
    pub chr: u8,
    /// Full-range flag.
    pub full_range: bool,
}

/// Plane geometry requested from a [`PictureAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct PlaneRequest {
    /// Byte size of each plane; zero when the plane is absent.
    pub sizes: [usize; 3],
    /// Byte stride of the luma plane and of each chroma plane.
    pub strides: [usize; 2],
}

/// Plane storage returned by a [`PictureAllocator`].
pub struct PictureStorage {
    /// One buffer per plane; empty when the plane is absent.
    pub planes: [Vec<u8>; 3],
    /// Allocator-private cookie handed back on release.
    pub opaque: usize,
}

/// Override hook for picture memory.
pub trait PictureAllocator: Send + Sync {
    /// Allocate plane storage of the requested geometry.
    fn allocate(&self, req: &PlaneRequest) -> Result<PictureStorage>;
    /// Release storage previously handed out by `allocate`.
    fn release(&self, storage: PictureStorage);
}

/// Default allocator backed by the global heap.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl PictureAllocator for HeapAllocator {
    fn allocate(&self, req: &PlaneRequest) -> Result<PictureStorage> {
        let mut planes: [Vec<u8>; 3] = Default::default();
        for (plane, &size) in planes.iter_mut().zip(req.sizes.iter()) {
            if size > 0 {
                let mut buf = Vec::new();
                buf.try_reserve_exact(size)
                    .map_err(|_| Error::OutOfMemory(format!("picture plane of {size} bytes")))?;
                buf.resize(size, 0);
                *plane = buf;
            }
        }
        Ok(PictureStorage { planes, opaque: 0 })
    }

    fn release(&self, storage: PictureStorage) {
        drop(storage);
    }
}

struct PictureInner {
    planes: [DisjointMut<u8>; 3],
    allocator: Arc<dyn PictureAllocator>,
    opaque: usize,
}

impl Drop for PictureInner {
    fn drop(&mut self) {
        let planes = [0, 1, 2].map(|i| {
            std::mem::replace(&mut self.planes[i], DisjointMut::new(Vec::new())).into_inner()
        });
        self.allocator.release(PictureStorage {
            planes,
            opaque: self.opaque,
        });
    }
}

/// A reference-counted decoded picture.
#[derive(Clone)]
pub struct Picture {
    inner: Arc<PictureInner>,
    /// Static parameters.
    pub params: PictureParams,
    /// Byte strides: luma, then chroma.
    pub strides: [usize; 2],
    /// Picture order count (display index).
    pub poc: u32,
}

impl Picture {
    /// Allocate a picture with padded plane geometry.
    pub fn alloc(params: PictureParams, allocator: Arc<dyn PictureAllocator>) -> Result<Self> {
        if params.bpc == 0 || params.bpc > 16 {
            return Err(Error::invalid_param(format!("bpc {}", params.bpc)));
        }
        let hbd = (params.bpc > 8) as usize;
        let aligned_w = (params.w as usize + 127) & !127;
        let aligned_h = (params.h as usize + 127) & !127;
        let has_chroma = params.layout.has_chroma();
        let ss_hor = params.layout.ss_hor() as usize;
        let ss_ver = params.layout.ss_ver() as usize;

        let strides = [
            aligned_w << hbd,
            if has_chroma {
                (aligned_w >> ss_hor) << hbd
            } else {
                0
            },
        ];
        let y_sz = strides[0] * aligned_h;
        let uv_sz = strides[1] * (aligned_h >> ss_ver);
        let req = PlaneRequest {
            sizes: [y_sz, uv_sz, uv_sz],
            strides,
        };

        let storage = allocator.allocate(&req)?;
        for (pl, (buf, &size)) in storage.planes.iter().zip(req.sizes.iter()).enumerate() {
            if buf.len() < size {
                return Err(Error::invalid_param(format!(
                    "allocator returned {} bytes for plane {pl}, need {size}",
                    buf.len()
                )));
            }
        }
        let PictureStorage { planes, opaque } = storage;
        Ok(Self {
            inner: Arc::new(PictureInner {
                planes: planes.map(DisjointMut::new),
                allocator,
                opaque,
            }),
            params,
            strides,
            poc: 0,
        })
    }

    /// Byte stride of a plane.
    pub fn stride(&self, plane: usize) -> usize {
        self.strides[(plane != 0) as usize]
    }

    /// Shared read of an entire plane.
    ///
    /// Only rows already published through the owning decoder's progress
    /// counters carry meaningful data while the picture is being decoded.
    pub fn plane(&self, plane: usize) -> DisjointGuard<'_, u8> {
        let p = &self.inner.planes[plane];
        p.slice(0..p.len())
    }

    /// Raw disjoint-access cell of a plane, for decode-time row writes.
    pub fn plane_cell(&self, plane: usize) -> &DisjointMut<u8> {
        &self.inner.planes[plane]
    }

    /// Number of planes present.
    pub fn num_planes(&self) -> usize {
        if self.params.layout.has_chroma() {
            3
        } else {
            1
        }
    }
}

impl fmt::Debug for Picture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Picture")
            .field("w", &self.params.w)
            .field("h", &self.params.h)
            .field("layout", &self.params.layout)
            .field("bpc", &self.params.bpc)
            .field("poc", &self.poc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(w: u32, h: u32, layout: PixelLayout, bpc: u8) -> PictureParams {
        PictureParams {
            w,
            h,
            layout,
            frame_type: FrameType::Key,
            bpc,
            pri: 2,
            trc: 2,
            mtrx: 2,
            chr: 0,
            full_range: false,
        }
    }

    #[test]
    fn test_alloc_420() {
        let p = Picture::alloc(params(64, 64, PixelLayout::I420, 8), Arc::new(HeapAllocator))
            .unwrap();
        assert_eq!(p.stride(0), 128);
        assert_eq!(p.stride(1), 64);
        assert_eq!(p.plane(0).len(), 128 * 128);
        assert_eq!(p.plane(1).len(), 64 * 64);
        assert_eq!(p.num_planes(), 3);
    }

    #[test]
    fn test_alloc_monochrome() {
        let p = Picture::alloc(params(16, 16, PixelLayout::I400, 8), Arc::new(HeapAllocator))
            .unwrap();
        assert_eq!(p.stride(1), 0);
        assert_eq!(p.plane(1).len(), 0);
        assert_eq!(p.num_planes(), 1);
    }

    #[test]
    fn test_alloc_10bit_doubles_stride() {
        let p = Picture::alloc(params(64, 64, PixelLayout::I444, 10), Arc::new(HeapAllocator))
            .unwrap();
        assert_eq!(p.stride(0), 256);
        assert_eq!(p.stride(1), 256);
    }

    #[test]
    fn test_shared_clone_sees_writes() {
        let p = Picture::alloc(params(16, 16, PixelLayout::I400, 8), Arc::new(HeapAllocator))
            .unwrap();
        let q = p.clone();
        p.plane_cell(0).mut_slice(0..4).fill(9);
        assert_eq!(q.plane(0)[0], 9);
    }

    #[test]
    fn test_custom_allocator_release_called() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl PictureAllocator for Counting {
            fn allocate(&self, req: &PlaneRequest) -> Result<PictureStorage> {
                HeapAllocator.allocate(req)
            }
            fn release(&self, _storage: PictureStorage) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let alloc = Arc::new(Counting::default());
        let p = Picture::alloc(params(16, 16, PixelLayout::I420, 8), alloc.clone()).unwrap();
        let q = p.clone();
        drop(p);
        assert_eq!(alloc.0.load(Ordering::SeqCst), 0);
        drop(q);
        assert_eq!(alloc.0.load(Ordering::SeqCst), 1);
    }
}
