//! The reconstruction boundary.
//!
//! The block parser drives pixel work through [`ReconOps`], dispatched by
//! component bit depth at frame submission. The baseline implementation
//! shipped here covers what the parser-level tests exercise: DC intra
//! prediction, palette index-map reconstruction and translational inter
//! copies with reference row-progress waits. Residual coefficient syntax,
//! transforms and the post-filters are the province of an external
//! implementation; a stream that needs them fails the frame cleanly rather
//! than desynchronizing.

use crate::block::Av1Block;
use crate::context::BlockContext;
use crate::decoder::FrameContext;
use crate::edge::EdgeFlags;
use crate::error::{Av1Error, Result};
use crate::tables::BlockSize;
use crate::thread::PlaneType;
use crate::tile::{TileContext, TileState};

/// Pixel-domain collaborators invoked by the block parser.
pub trait ReconOps: Send + Sync {
    /// Pass 1: decode residual coefficients into the frame buffer without
    /// touching pixels.
    #[allow(clippy::too_many_arguments)]
    fn read_coef_blocks(
        &self,
        f: &FrameContext,
        t: &mut TileContext,
        ts: &mut TileState,
        a: &mut BlockContext,
        bs: BlockSize,
        b: &Av1Block,
    ) -> Result<()>;

    /// Reconstruct an intra block.
    #[allow(clippy::too_many_arguments)]
    fn recon_b_intra(
        &self,
        f: &FrameContext,
        t: &mut TileContext,
        ts: &mut TileState,
        a: &mut BlockContext,
        bs: BlockSize,
        edge_flags: EdgeFlags,
        b: &Av1Block,
    ) -> Result<()>;

    /// Reconstruct an inter (or intra-block-copy) block; may suspend on
    /// reference row progress.
    #[allow(clippy::too_many_arguments)]
    fn recon_b_inter(
        &self,
        f: &FrameContext,
        t: &mut TileContext,
        ts: &mut TileState,
        a: &mut BlockContext,
        bs: BlockSize,
        b: &Av1Block,
    ) -> Result<()>;

    /// Apply deblock/CDEF/restoration to one superblock row.
    fn filter_sbrow(&self, f: &FrameContext, sby: u32) -> Result<()>;

    /// Snapshot the pre-filter bottom edge of the current superblock row
    /// for the next row's intra prediction.
    fn backup_ipred_edge(&self, f: &FrameContext, t: &TileContext, ts: &TileState) -> Result<()>;
}

/// Select the reconstruction implementation for a component depth.
pub fn recon_ops(bpc: u8) -> &'static dyn ReconOps {
    if bpc > 8 {
        &Baseline::<true>
    } else {
        &Baseline::<false>
    }
}

struct Baseline<const HBD: bool>;

impl<const HBD: bool> Baseline<HBD> {
    fn px_get(plane: &[u8], idx: usize) -> u32 {
        if HBD {
            u16::from_le_bytes([plane[idx * 2], plane[idx * 2 + 1]]) as u32
        } else {
            plane[idx] as u32
        }
    }

    fn px_set(plane: &mut [u8], idx: usize, v: u32) {
        if HBD {
            let b = (v as u16).to_le_bytes();
            plane[idx * 2] = b[0];
            plane[idx * 2 + 1] = b[1];
        } else {
            plane[idx] = v as u8;
        }
    }

    fn px_bytes() -> usize {
        if HBD {
            2
        } else {
            1
        }
    }

    /// Plane geometry of a block: pixel origin, block dims, subsampling.
    fn plane_geom(f: &FrameContext, t: &TileContext, bs: BlockSize, pl: usize) -> PlaneGeom {
        let [bw4, bh4, _, _] = bs.dimensions();
        let layout = f.seq.layout;
        let (ss_hor, ss_ver) = if pl == 0 {
            (0, 0)
        } else {
            (layout.ss_hor(), layout.ss_ver())
        };
        PlaneGeom {
            x0: (t.bx as usize * 4) >> ss_hor,
            y0: (t.by as usize * 4) >> ss_ver,
            w: ((bw4 as usize + ss_hor as usize) >> ss_hor) * 4,
            h: ((bh4 as usize + ss_ver as usize) >> ss_ver) * 4,
            vis_w: (f.cur.p.params.w as usize + (1 << ss_hor) - 1) >> ss_hor,
            vis_h: (f.cur.p.params.h as usize + (1 << ss_ver) - 1) >> ss_ver,
            stride: f.cur.p.stride(pl),
        }
    }

    fn block_has_chroma(f: &FrameContext, t: &TileContext, bs: BlockSize) -> bool {
        let layout = f.seq.layout;
        if !layout.has_chroma() {
            return false;
        }
        let [bw4, bh4, _, _] = bs.dimensions();
        (bw4 as u32 > layout.ss_hor() || t.bx & 1 != 0)
            && (bh4 as u32 > layout.ss_ver() || t.by & 1 != 0)
    }

    /// DC prediction from the available top/left edges, then a constant
    /// fill of the block.
    #[allow(clippy::too_many_arguments)]
    fn predict_dc(
        &self,
        f: &FrameContext,
        t: &TileContext,
        pl: usize,
        g: &PlaneGeom,
        have_top: bool,
        have_left: bool,
    ) {
        let cell = f.cur.p.plane_cell(pl);
        let bpc = f.seq.bpc as u32;
        let mut sum = 0u32;
        let mut n = 0u32;

        let sb_top = t.by & (f.sb_step - 1) == 0;
        if have_top {
            if sb_top {
                // the row above belongs to the previous superblock row:
                // read the pre-filter snapshot
                let sby = (t.by >> f.sb_shift) as usize;
                let edge = &f.ipred_edge[pl];
                let row = (sby - 1) * g.stride;
                let guard = edge.slice(
                    row + g.x0 * Self::px_bytes()..row + (g.x0 + g.w) * Self::px_bytes(),
                );
                for x in 0..g.w {
                    sum += Self::px_get(&guard, x);
                }
            } else {
                let row = (g.y0 - 1) * g.stride;
                let guard = cell.slice(
                    row + g.x0 * Self::px_bytes()..row + (g.x0 + g.w) * Self::px_bytes(),
                );
                for x in 0..g.w {
                    sum += Self::px_get(&guard, x);
                }
            }
            n += g.w as u32;
        }
        if have_left {
            for y in 0..g.h {
                let row = (g.y0 + y) * g.stride;
                let guard = cell
                    .slice(row + (g.x0 - 1) * Self::px_bytes()..row + g.x0 * Self::px_bytes());
                sum += Self::px_get(&guard, 0);
            }
            n += g.h as u32;
        }
        let dc = if n > 0 {
            (sum + n / 2) / n
        } else {
            1 << (bpc - 1)
        };

        for y in 0..g.h {
            let row = (g.y0 + y) * g.stride;
            let mut guard = cell.mut_slice(
                row + g.x0 * Self::px_bytes()..row + (g.x0 + g.w) * Self::px_bytes(),
            );
            for x in 0..g.w {
                Self::px_set(&mut guard, x, dc);
            }
        }
    }

    /// Palette reconstruction from the decoded color-index map.
    fn predict_palette(
        &self,
        f: &FrameContext,
        pal: &[u16; 8],
        pal_idx: &[u8],
        pl: usize,
        g: &PlaneGeom,
    ) {
        let cell = f.cur.p.plane_cell(pl);
        for y in 0..g.h {
            let row = (g.y0 + y) * g.stride;
            let mut guard = cell.mut_slice(
                row + g.x0 * Self::px_bytes()..row + (g.x0 + g.w) * Self::px_bytes(),
            );
            for x in 0..g.w {
                let idx = pal_idx[y * g.w + x] as usize;
                Self::px_set(&mut guard, x, pal[idx] as u32);
            }
        }
    }

    /// Full-pel translational copy with edge clamping.
    #[allow(clippy::too_many_arguments)]
    fn copy_inter(
        &self,
        f: &FrameContext,
        src_pic: &overture_core::Picture,
        b: &Av1Block,
        pl: usize,
        g: &PlaneGeom,
        avg_with: Option<&overture_core::Picture>,
        mv: [crate::refmvs::Mv; 2],
    ) {
        let (ss_hor, ss_ver) = if pl == 0 {
            (0, 0)
        } else {
            (f.seq.layout.ss_hor(), f.seq.layout.ss_ver())
        };
        let _ = b;
        let dst_cell = f.cur.p.plane_cell(pl);

        for y in 0..g.h {
            let dst_row = (g.y0 + y) * g.stride;
            let mut vals = vec![0u32; g.w];
            for (ref_i, pic) in [Some(src_pic), avg_with]
                .into_iter()
                .flatten()
                .enumerate()
            {
                let src_cell = pic.plane_cell(pl);
                let stride = pic.stride(pl);
                let dy = (mv[ref_i].y as i32) >> (3 + ss_ver as i32);
                let dx = (mv[ref_i].x as i32) >> (3 + ss_hor as i32);
                let sy = ((g.y0 + y) as i32 + dy).clamp(0, g.vis_h as i32 - 1) as usize;
                for (x, val) in vals.iter_mut().enumerate() {
                    let sx = ((g.x0 + x) as i32 + dx).clamp(0, g.vis_w as i32 - 1) as usize;
                    let guard = src_cell.slice(
                        sy * stride + sx * Self::px_bytes()
                            ..sy * stride + (sx + 1) * Self::px_bytes(),
                    );
                    let v = Self::px_get(&guard, 0);
                    *val = if ref_i == 0 { v } else { (*val + v + 1) >> 1 };
                }
            }
            let mut guard = dst_cell.mut_slice(
                dst_row + g.x0 * Self::px_bytes()..dst_row + (g.x0 + g.w) * Self::px_bytes(),
            );
            for (x, &v) in vals.iter().enumerate() {
                Self::px_set(&mut guard, x, v);
            }
        }
    }
}

struct PlaneGeom {
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
    vis_w: usize,
    vis_h: usize,
    stride: usize,
}

impl<const HBD: bool> ReconOps for Baseline<HBD> {
    fn read_coef_blocks(
        &self,
        _f: &FrameContext,
        _t: &mut TileContext,
        _ts: &mut TileState,
        _a: &mut BlockContext,
        _bs: BlockSize,
        b: &Av1Block,
    ) -> Result<()> {
        if !b.skip {
            return Err(Av1Error::UnsupportedProfile(
                "residual coefficients need an external ReconOps",
            ));
        }
        Ok(())
    }

    fn recon_b_intra(
        &self,
        f: &FrameContext,
        t: &mut TileContext,
        ts: &mut TileState,
        _a: &mut BlockContext,
        bs: BlockSize,
        _edge_flags: EdgeFlags,
        b: &Av1Block,
    ) -> Result<()> {
        if !b.skip {
            return Err(Av1Error::UnsupportedProfile(
                "residual coefficients need an external ReconOps",
            ));
        }
        let have_top = t.by > ts.tiling.row_start;
        let have_left = t.bx > ts.tiling.col_start;
        let [bw4, bh4, _, _] = bs.dimensions();
        let layout = f.seq.layout;
        let (cbw4, cbh4) = (
            (bw4 as u32 + layout.ss_hor()) >> layout.ss_hor(),
            (bh4 as u32 + layout.ss_ver()) >> layout.ss_ver(),
        );

        let n_planes = if Self::block_has_chroma(f, t, bs) { 3 } else { 1 };
        for pl in 0..n_planes {
            let g = Self::plane_geom(f, t, bs, pl);
            let pal_sz = b.pal_sz[(pl != 0) as usize];
            if pal_sz > 0 {
                let pal = if f.blocks.is_some() {
                    f.pal.slice(t.pal_record_idx(f)..t.pal_record_idx(f) + 1)[0][pl]
                } else {
                    t.pal[pl]
                };
                let (luma_len, chroma_len) = t.pal_idx_lens(bw4 as u32, bh4 as u32, cbw4, cbh4);
                let idx_data: Vec<u8> = if f.blocks.is_some() {
                    // pass 2 replays the recorded index buffer in parse order
                    let len = if pl == 0 { luma_len } else { chroma_len };
                    let base = if pl == 2 {
                        // V shares the U map
                        ts.pal_idx_cursor - chroma_len
                    } else {
                        let base = ts.pal_idx_cursor;
                        ts.pal_idx_cursor += len;
                        base
                    };
                    f.pal_idx.slice(base..base + len).to_vec()
                } else if pl == 0 {
                    t.pal_idx_scratch[..luma_len].to_vec()
                } else {
                    t.pal_idx_scratch[luma_len..luma_len + chroma_len].to_vec()
                };
                // the map is stored at full block granularity
                let map_w = if pl == 0 {
                    bw4 as usize * 4
                } else {
                    cbw4 as usize * 4
                };
                let mut rows = Vec::with_capacity(g.w * g.h);
                for y in 0..g.h {
                    rows.extend_from_slice(&idx_data[y * map_w..y * map_w + g.w]);
                }
                self.predict_palette(f, &pal, &rows, pl, &g);
            } else {
                self.predict_dc(f, t, pl, &g, have_top, have_left);
            }
        }
        Ok(())
    }

    fn recon_b_inter(
        &self,
        f: &FrameContext,
        t: &mut TileContext,
        ts: &mut TileState,
        _a: &mut BlockContext,
        bs: BlockSize,
        b: &Av1Block,
    ) -> Result<()> {
        if !b.skip {
            return Err(Av1Error::UnsupportedProfile(
                "residual coefficients need an external ReconOps",
            ));
        }
        let _ = ts;
        let [bw4, bh4, _, _] = bs.dimensions();

        if b.refs[0] < 0 {
            // intra block copy reads this frame's already-decoded area
            let dx = (b.mv[0].x as i32) >> 3;
            let dy = (b.mv[0].y as i32) >> 3;
            if dy + bh4 as i32 * 4 > 0 && dx + bw4 as i32 * 4 > 0 {
                return Err(Av1Error::InvalidBitstream(
                    "intra block copy source overlaps destination",
                ));
            }
            let cur = f.cur.p.clone();
            let n_planes = if Self::block_has_chroma(f, t, bs) { 3 } else { 1 };
            for pl in 0..n_planes {
                let g = Self::plane_geom(f, t, bs, pl);
                self.copy_inter(f, &cur, b, pl, &g, None, [b.mv[0], b.mv[0]]);
            }
            return Ok(());
        }

        let refp = f.refp[b.refs[0] as usize]
            .as_ref()
            .ok_or(Av1Error::ReferenceMissing(b.refs[0] as usize))?;
        // bottom luma row this prediction reads, before the filter delay
        let bottom = (t.by * 4 + bh4 as u32 * 4) as i32 + ((b.mv[0].y as i32) >> 3);
        refp.wait_progress(bottom.max(0) as u32, PlaneType::Y)?;

        let second = if b.refs[1] >= 0 {
            let refp2 = f.refp[b.refs[1] as usize]
                .as_ref()
                .ok_or(Av1Error::ReferenceMissing(b.refs[1] as usize))?;
            let bottom2 = (t.by * 4 + bh4 as u32 * 4) as i32 + ((b.mv[1].y as i32) >> 3);
            refp2.wait_progress(bottom2.max(0) as u32, PlaneType::Y)?;
            Some(refp2.p.clone())
        } else {
            None
        };

        let n_planes = if Self::block_has_chroma(f, t, bs) { 3 } else { 1 };
        for pl in 0..n_planes {
            let g = Self::plane_geom(f, t, bs, pl);
            self.copy_inter(f, &refp.p, b, pl, &g, second.as_ref(), [b.mv[0], b.mv[1]]);
        }
        Ok(())
    }

    fn filter_sbrow(&self, _f: &FrameContext, _sby: u32) -> Result<()> {
        // deblock, CDEF and restoration kernels live behind the external
        // boundary; the baseline leaves pixels untouched
        Ok(())
    }

    fn backup_ipred_edge(&self, f: &FrameContext, t: &TileContext, ts: &TileState) -> Result<()> {
        let sby = (t.by >> f.sb_shift) as usize;
        let n_planes = if f.seq.layout.has_chroma() { 3 } else { 1 };
        for pl in 0..n_planes {
            let ss_ver = if pl == 0 { 0 } else { f.seq.layout.ss_ver() };
            let ss_hor = if pl == 0 { 0 } else { f.seq.layout.ss_hor() };
            let stride = f.cur.p.stride(pl);
            let vis_h = (f.cur.p.params.h as usize + (1 << ss_ver) - 1) >> ss_ver;
            let row_end = ((((t.by + f.sb_step) * 4) as usize) >> ss_ver).min(vis_h);
            if row_end == 0 {
                continue;
            }
            let src_row = (row_end - 1) * stride;
            let x0 = ((ts.tiling.col_start * 4) as usize >> ss_hor) * Self::px_bytes();
            let x1 = (((ts.tiling.col_end * 4) as usize) >> ss_hor) * Self::px_bytes();
            let src = f.cur.p.plane_cell(pl).slice(src_row + x0..src_row + x1);
            let dst_row = sby * stride;
            let mut dst = f.ipred_edge[pl].mut_slice(dst_row + x0..dst_row + x1);
            dst.copy_from_slice(&src);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_depth() {
        // both depths resolve to a usable implementation
        let _ = recon_ops(8);
        let _ = recon_ops(10);
    }

    #[test]
    fn test_pixel_helpers() {
        let mut buf8 = [0u8; 4];
        Baseline::<false>::px_set(&mut buf8, 2, 200);
        assert_eq!(Baseline::<false>::px_get(&buf8, 2), 200);

        let mut buf16 = [0u8; 8];
        Baseline::<true>::px_set(&mut buf16, 1, 1023);
        assert_eq!(Baseline::<true>::px_get(&buf16, 1), 1023);
        // low bits of the second byte only
        assert_eq!(buf16[3], 0x03);
    }
}
