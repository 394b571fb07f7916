//! # Overture Core
//!
//! Core types and utilities shared by the Overture decoder crates:
//! - Error handling types
//! - Bitstream reading/writing utilities
//! - Picture buffer abstractions and allocator hooks
//! - Disjoint-access buffers for cooperating decode workers

pub mod bitstream;
pub mod disjoint;
pub mod error;
pub mod picture;

pub use bitstream::{BitReader, BitWriter};
pub use disjoint::DisjointMut;
pub use error::{BitstreamError, Error, Result};
pub use picture::{
    FrameType, HeapAllocator, Picture, PictureAllocator, PictureParams, PixelLayout,
};
