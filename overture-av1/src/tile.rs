//! Tile state and the partition descender.
//!
//! A tile owns its arithmetic decoder, its CDF copy and its running
//! quantizer/loop-filter state. `decode_tile_sbrow` walks one superblock row
//! of a tile: it seeds per-superblock CDEF and loop-restoration state, then
//! runs the recursive partition descent that hands each leaf to the block
//! parser.

use parking_lot::{Condvar, Mutex};

use crate::block::{decode_b, Av1Block};
use crate::cdf::CdfContext;
use crate::context::BlockContext;
use crate::decoder::FrameContext;
use crate::edge::{EdgeNode, EdgeTree};
use crate::env::{gather_left_partition_prob, gather_top_partition_prob, get_partition_ctx};
use crate::error::{Av1Error, Result};
use crate::headers::RestorationType;
use crate::msac::Msac;
use crate::refmvs::{RefMvFrame, TileRect};
use crate::tables::*;
use crate::warp::WarpedMotionParams;
use overture_core::picture::PixelLayout;

/// One loop-restoration unit's parameters.
#[derive(Debug, Clone, Copy)]
pub struct RestorationUnit {
    pub rtype: RestorationType,
    pub filter_h: [i8; 3],
    pub filter_v: [i8; 3],
    pub sgr_idx: u8,
    pub sgr_weights: [i8; 2],
}

impl Default for RestorationUnit {
    fn default() -> Self {
        Self {
            rtype: RestorationType::None,
            filter_h: [3, -7, 15],
            filter_v: [3, -7, 15],
            sgr_idx: 0,
            sgr_weights: [-32, 31],
        }
    }
}

/// Per-128x128 filter bookkeeping filled during parsing.
#[derive(Debug, Clone)]
pub struct LfMask {
    pub cdef_idx: [i8; 4],
    pub lr: [[RestorationUnit; 4]; 3],
    pub noskip_mask: [u32; 32],
}

impl Default for LfMask {
    fn default() -> Self {
        Self {
            cdef_idx: [-1; 4],
            lr: [[RestorationUnit::default(); 4]; 3],
            noskip_mask: [0; 32],
        }
    }
}

/// Loop-filter level per segment, filter dimension, reference and
/// global-motion class.
pub type LfLevels = [[[[u8; 2]; 8]; 4]; 8];

/// Compute the per-class loop-filter levels for the given running deltas.
pub fn calc_lf_values(
    hdr: &crate::headers::FrameHeader,
    lf_delta: &[i8; 4],
) -> LfLevels {
    let mut out: LfLevels = [[[[0; 2]; 8]; 4]; 8];
    let lf = &hdr.loopfilter;
    if lf.level_y[0] == 0 && lf.level_y[1] == 0 {
        return out;
    }
    let n_seg = if hdr.segmentation.enabled { 8 } else { 1 };
    for s in 0..n_seg {
        let segd = hdr.segmentation.enabled.then(|| &hdr.segmentation.seg_data[s]);
        let base_levels = [
            (lf.level_y[0], lf_delta[0], segd.map_or(0, |d| d.delta_lf_y_v)),
            (lf.level_y[1], lf_delta[1], segd.map_or(0, |d| d.delta_lf_y_h)),
            (lf.level_u, lf_delta[2], segd.map_or(0, |d| d.delta_lf_u)),
            (lf.level_v, lf_delta[3], segd.map_or(0, |d| d.delta_lf_v)),
        ];
        for (dir, &(base_lvl, delta, seg_delta)) in base_levels.iter().enumerate() {
            let base = ((base_lvl as i32 + delta as i32).clamp(0, 63) + seg_delta as i32)
                .clamp(0, 63);
            if !lf.mode_ref_delta_enabled {
                for r in 0..8 {
                    out[s][dir][r] = [base as u8; 2];
                }
            } else {
                let sh = (base >= 32) as i32;
                let intra =
                    (base + (lf.ref_deltas[0] as i32) * (1 << sh)).clamp(0, 63) as u8;
                out[s][dir][0] = [intra; 2];
                for r in 1..8 {
                    for m in 0..2 {
                        let delta =
                            lf.mode_deltas[m] as i32 + lf.ref_deltas[r] as i32;
                        out[s][dir][r][m] =
                            (base + delta * (1 << sh)).clamp(0, 63) as u8;
                    }
                }
            }
        }
    }
    out
}

/// Dequantizer scales per segment, plane and DC/AC.
pub type DequantTables = [[[u16; 2]; 3]; 8];

/// Build the dequantizer tables for a quantizer index.
pub fn init_quant_tables(
    seq: &crate::headers::SequenceHeader,
    hdr: &crate::headers::FrameHeader,
    qidx: u8,
) -> DequantTables {
    let mut dq: DequantTables = [[[0; 2]; 3]; 8];
    let hbd = seq.bpc > 8;
    let n_seg = if hdr.segmentation.enabled { 8 } else { 1 };
    for (i, seg) in dq.iter_mut().enumerate().take(n_seg) {
        let yac = if hdr.segmentation.enabled {
            (qidx as i32 + hdr.segmentation.seg_data[i].delta_q as i32).clamp(0, 255) as u8
        } else {
            qidx
        };
        let clip = |v: i32| v.clamp(0, 255) as u8;
        let ydc = clip(yac as i32 + hdr.quant.ydc_delta as i32);
        let udc = clip(yac as i32 + hdr.quant.udc_delta as i32);
        let uac = clip(yac as i32 + hdr.quant.uac_delta as i32);
        let vdc = clip(yac as i32 + hdr.quant.vdc_delta as i32);
        let vac = clip(yac as i32 + hdr.quant.vac_delta as i32);
        seg[0] = [dq_value(hbd, ydc, true), dq_value(hbd, yac, false)];
        seg[1] = [dq_value(hbd, udc, true), dq_value(hbd, uac, false)];
        seg[2] = [dq_value(hbd, vdc, true), dq_value(hbd, vac, false)];
    }
    dq
}

/// Per-tile parsing state, exclusively owned by one worker at a time.
pub struct TileState {
    pub msac: Msac,
    pub cdf: CdfContext,
    pub tile_row: u32,
    pub tile_col: u32,
    /// Tile bounds in 4x4 units.
    pub tiling: TileRect,
    pub last_qidx: u8,
    pub last_delta_lf: [i8; 4],
    /// Superblock-local dequant tables, present while the running
    /// quantizer index diverges from the frame default.
    pub dq_custom: Option<Box<DequantTables>>,
    /// Superblock-local loop-filter levels, likewise.
    pub lflvl_custom: Option<Box<LfLevels>>,
    /// Running loop-restoration reference values for subexp coding.
    pub lr_ref: [RestorationUnit; 3],
    /// Frame-threading cursors into the shared palette-index and
    /// coefficient buffers.
    pub pal_idx_cursor: usize,
    pub cf_cursor: usize,
}

impl TileState {
    pub fn set_custom_dq(&mut self, f: &FrameContext, qidx: u8) {
        self.dq_custom = Some(Box::new(init_quant_tables(&f.seq, &f.hdr, qidx)));
    }

    pub fn set_custom_lflvl(&mut self, f: &FrameContext) {
        self.lflvl_custom = Some(Box::new(calc_lf_values(&f.hdr, &self.last_delta_lf)));
    }

    /// Active dequant tables: superblock-local when a delta-q diverged.
    pub fn dq<'a>(&'a self, f: &'a FrameContext) -> &'a DequantTables {
        self.dq_custom.as_deref().unwrap_or(&f.dq)
    }
}

/// A tile slot: the state plus the sbrow progress other workers and the
/// post-filter wait on.
pub struct TileCell {
    pub state: Mutex<TileState>,
    pub progress: Mutex<i32>,
    pub cond: Condvar,
}

impl TileCell {
    pub fn new(state: TileState, first_sbrow: i32) -> Self {
        Self {
            state: Mutex::new(state),
            progress: Mutex::new(first_sbrow),
            cond: Condvar::new(),
        }
    }

    pub fn signal_progress(&self, sby: i32) {
        *self.progress.lock() = sby;
        self.cond.notify_all();
    }

    pub fn wait_progress(&self, sby: i32) {
        let mut guard = self.progress.lock();
        while *guard <= sby {
            self.cond.wait(&mut guard);
        }
    }
}

/// Per-worker traversal state.
pub struct TileContext {
    pub bx: u32,
    pub by: u32,
    pub l: BlockContext,
    /// Scratch palette of the block being parsed (single-pass schedule).
    pub pal: [[u16; 8]; 3],
    /// Chroma palette sizes, tracked in luma coordinates.
    pub pal_sz_uv: [[u8; 32]; 2],
    /// Above/left palette colors per 4x4 unit and plane.
    pub al_pal: [[[[u16; 8]; 3]; 32]; 2],
    pub pal_idx_scratch: Vec<u8>,
    /// CDEF indices of the current superblock's 64x64 quadrants.
    pub cdef_idx: [i8; 4],
    pub cdef_quadrant: usize,
    pub warpmv: WarpedMotionParams,
    pub tl_4x4_filter: [u8; 2],
}

impl Default for TileContext {
    fn default() -> Self {
        Self {
            bx: 0,
            by: 0,
            l: BlockContext::default(),
            pal: [[0; 8]; 3],
            pal_sz_uv: [[0; 32]; 2],
            al_pal: [[[[0; 8]; 3]; 32]; 2],
            pal_idx_scratch: vec![0; 2 * 32 * 32 * 16],
            cdef_idx: [-1; 4],
            cdef_quadrant: 0,
            warpmv: WarpedMotionParams::default(),
            tl_4x4_filter: [0; 2],
        }
    }
}

impl TileContext {
    /// Index of the recorded palette for the current block position.
    pub fn pal_record_idx(&self, f: &FrameContext) -> usize {
        let by = self.by as usize;
        let bx = self.bx as usize;
        ((by >> 1) + (bx & 1)) * (f.b4_stride >> 1) + ((bx >> 1) + (by & 1))
    }

    /// Palette-index buffer lengths for the current block, luma and chroma.
    pub fn pal_idx_lens(&self, bw4: u32, bh4: u32, cbw4: u32, cbh4: u32) -> (usize, usize) {
        (
            (bw4 * bh4 * 16) as usize,
            (cbw4 * cbh4 * 16) as usize,
        )
    }

    /// Index of the 128x128 filter mask covering the current position.
    pub fn lf_mask_idx(&self, f: &FrameContext) -> usize {
        (self.by as usize >> 5) * f.sb128w + (self.bx as usize >> 5)
    }

    /// Frame-level view for reference-MV candidate searches.
    pub fn refmv_view<'a>(&self, f: &'a FrameContext) -> RefMvFrame<'a> {
        let temporal = if f.hdr.use_ref_frame_mvs {
            f.ref_mvs.iter().flatten().next().map(|arc| &**arc)
        } else {
            None
        };
        RefMvFrame {
            cells: f.mvs.as_ref().expect("motion grid present"),
            b4_stride: f.b4_stride,
            bw4: f.bw4,
            bh4: f.bh4,
            gmv: &f.hdr.gmv,
            hp: f.hdr.hp,
            force_integer_mv: f.hdr.force_integer_mv,
            temporal,
            temporal_stride: f.b4_stride,
        }
    }
}

/// Update the loop-filter transform-size strips for a decoded block.
pub(crate) fn fill_lf_tx_strips(
    t: &mut TileContext,
    a: &mut BlockContext,
    b: &Av1Block,
    bx4: usize,
    by4: usize,
    cbx4: usize,
    cby4: usize,
    has_chroma: bool,
) {
    let [bw4, bh4, _, _] = BlockSize::from_index(b.bs).dimensions();
    let ytx = TxSize::from_u8(if b.intra { b.tx } else { b.max_ytx }).info();
    a.tx_lpf_y[bx4..(bx4 + bw4 as usize).min(32)].fill(ytx.h);
    t.l.tx_lpf_y[by4..(by4 + bh4 as usize).min(32)].fill(ytx.w);
    if has_chroma {
        let uvtx = TxSize::from_u8(b.uvtx).info();
        let cbw4 = bw4.div_ceil(2) as usize;
        let cbh4 = bh4.div_ceil(2) as usize;
        a.tx_lpf_uv[cbx4..(cbx4 + cbw4).min(32)].fill(uvtx.h);
        t.l.tx_lpf_uv[cby4..(cby4 + cbh4).min(32)].fill(uvtx.w);
    }
}

/// Seed a tile's state at frame setup.
#[allow(clippy::too_many_arguments)]
pub fn setup_tile(
    f: &FrameContext,
    in_cdf: &CdfContext,
    data: std::sync::Arc<Vec<u8>>,
    start: usize,
    end: usize,
    tile_row: u32,
    tile_col: u32,
    tile_start_off: usize,
) -> TileState {
    let sb_shift = f.sb_shift;
    let col_sb_start = f.hdr.tiling.col_start_sb[tile_col as usize];
    let col_sb_end = f.hdr.tiling.col_start_sb[tile_col as usize + 1];
    let row_sb_start = f.hdr.tiling.row_start_sb[tile_row as usize];
    let row_sb_end = f.hdr.tiling.row_start_sb[tile_row as usize + 1];

    TileState {
        msac: Msac::new(data, start, end, !f.hdr.disable_cdf_update),
        cdf: in_cdf.clone(),
        tile_row,
        tile_col,
        tiling: TileRect {
            col_start: col_sb_start << sb_shift,
            col_end: (col_sb_end << sb_shift).min(f.bw4),
            row_start: row_sb_start << sb_shift,
            row_end: (row_sb_end << sb_shift).min(f.bh4),
        },
        last_qidx: f.hdr.quant.yac,
        last_delta_lf: [0; 4],
        dq_custom: None,
        lflvl_custom: None,
        lr_ref: [RestorationUnit::default(); 3],
        pal_idx_cursor: tile_start_off * 2,
        cf_cursor: tile_start_off * 3,
    }
}

/// Recursive partition descent from one tree node.
#[allow(clippy::too_many_arguments)]
pub fn decode_sb(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    pass: u8,
    bl: BlockLevel,
    edges: &EdgeTree,
    node_idx_or_root: Option<usize>,
) -> Result<()> {
    let node = match node_idx_or_root {
        Some(idx) => edges.node(idx),
        None => edges.root(f.seq.sb128),
    };
    let hsz = bl.half_size4();
    let have_h_split = f.bw4 > t.bx + hsz;
    let have_v_split = f.bh4 > t.by + hsz;

    if !have_h_split && !have_v_split {
        debug_assert!(bl != BlockLevel::Bl8x8);
        let EdgeNode::Branch { split, .. } = node else {
            return Err(Av1Error::InvalidBitstream("partition underflow"));
        };
        return decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[0]));
    }

    let bx8 = ((t.bx & 31) >> 1) as usize;
    let by8 = ((t.by & 31) >> 1) as usize;
    let i422 = f.seq.layout == PixelLayout::I422;

    let bp;
    if have_h_split && have_v_split {
        if pass == 2 {
            let blocks = f.blocks.as_ref().expect("pass-2 block records");
            let b = blocks.slice(
                t.by as usize * f.b4_stride + t.bx as usize
                    ..t.by as usize * f.b4_stride + t.bx as usize + 1,
            )[0];
            bp = if b.bl == bl as u8 {
                BlockPartition::from_index(b.bp)
            } else {
                BlockPartition::Split
            };
        } else {
            let ctx = get_partition_ctx(a, &t.l, bl, by8, bx8);
            let n_part = if bl == BlockLevel::Bl8x8 {
                N_SUB8X8_PARTITIONS
            } else if bl == BlockLevel::Bl128x128 {
                N_PARTITIONS - 2
            } else {
                N_PARTITIONS
            };
            let pc = &mut ts.cdf.m.partition[bl as usize][ctx];
            bp = BlockPartition::from_index(ts.msac.decode_symbol_adapt(pc, n_part));
            if i422 && bp.slices_vertically() {
                let b = blocks_for_partition(bl, bp);
                let narrow = b[0].dimensions()[0].min(b[1].dimensions()[0]) < 2;
                if narrow {
                    return Err(Av1Error::InvalidBitstream(
                        "vertical slice below 8x8 in 4:2:2",
                    ));
                }
            }
        }
        let b = blocks_for_partition(bl, bp);

        match bp {
            BlockPartition::None => {
                decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().o)?;
            }
            BlockPartition::H => {
                decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().h[0])?;
                t.by += hsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().h[1])?;
                t.by -= hsz;
            }
            BlockPartition::V => {
                decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().v[0])?;
                t.bx += hsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().v[1])?;
                t.bx -= hsz;
            }
            BlockPartition::Split => match node {
                EdgeNode::Tip { split, .. } => {
                    debug_assert!(hsz == 1);
                    decode_b(t, ts, f, a, pass, bl, BlockSize::Bs4x4, bp, split[0])?;
                    let tl_filter = t.tl_4x4_filter;
                    t.bx += 1;
                    decode_b(t, ts, f, a, pass, bl, BlockSize::Bs4x4, bp, split[1])?;
                    t.bx -= 1;
                    t.by += 1;
                    decode_b(t, ts, f, a, pass, bl, BlockSize::Bs4x4, bp, split[2])?;
                    t.bx += 1;
                    t.tl_4x4_filter = tl_filter;
                    decode_b(t, ts, f, a, pass, bl, BlockSize::Bs4x4, bp, split[3])?;
                    t.bx -= 1;
                    t.by -= 1;
                }
                EdgeNode::Branch { split, .. } => {
                    decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[0]))?;
                    t.bx += hsz;
                    decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[1]))?;
                    t.bx -= hsz;
                    t.by += hsz;
                    decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[2]))?;
                    t.bx += hsz;
                    decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[3]))?;
                    t.bx -= hsz;
                    t.by -= hsz;
                }
            },
            BlockPartition::TTopSplit => {
                let EdgeNode::Branch { tts, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("t-partition at leaf level"));
                };
                decode_b(t, ts, f, a, pass, bl, b[0], bp, tts[0])?;
                t.bx += hsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, tts[1])?;
                t.bx -= hsz;
                t.by += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, tts[2])?;
                t.by -= hsz;
            }
            BlockPartition::TBottomSplit => {
                let EdgeNode::Branch { tbs, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("t-partition at leaf level"));
                };
                decode_b(t, ts, f, a, pass, bl, b[0], bp, tbs[0])?;
                t.by += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, tbs[1])?;
                t.bx += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, tbs[2])?;
                t.bx -= hsz;
                t.by -= hsz;
            }
            BlockPartition::TLeftSplit => {
                let EdgeNode::Branch { tls, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("t-partition at leaf level"));
                };
                decode_b(t, ts, f, a, pass, bl, b[0], bp, tls[0])?;
                t.by += hsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, tls[1])?;
                t.by -= hsz;
                t.bx += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, tls[2])?;
                t.bx -= hsz;
            }
            BlockPartition::TRightSplit => {
                let EdgeNode::Branch { trs, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("t-partition at leaf level"));
                };
                decode_b(t, ts, f, a, pass, bl, b[0], bp, trs[0])?;
                t.bx += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, trs[1])?;
                t.by += hsz;
                decode_b(t, ts, f, a, pass, bl, b[1], bp, trs[2])?;
                t.by -= hsz;
                t.bx -= hsz;
            }
            BlockPartition::H4 => {
                let EdgeNode::Branch { h4, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("h4 at leaf level"));
                };
                let qsz = hsz >> 1;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, h4[0])?;
                t.by += qsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, h4[1])?;
                t.by += qsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, h4[2])?;
                t.by += qsz;
                if t.by < f.bh4 {
                    decode_b(t, ts, f, a, pass, bl, b[0], bp, h4[3])?;
                }
                t.by -= qsz * 3;
            }
            BlockPartition::V4 => {
                let EdgeNode::Branch { v4, .. } = node else {
                    return Err(Av1Error::InvalidBitstream("v4 at leaf level"));
                };
                let qsz = hsz >> 1;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, v4[0])?;
                t.bx += qsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, v4[1])?;
                t.bx += qsz;
                decode_b(t, ts, f, a, pass, bl, b[0], bp, v4[2])?;
                t.bx += qsz;
                if t.bx < f.bw4 {
                    decode_b(t, ts, f, a, pass, bl, b[0], bp, v4[3])?;
                }
                t.bx -= qsz * 3;
            }
        }
    } else if have_h_split {
        let is_split = if pass == 2 {
            let blocks = f.blocks.as_ref().expect("pass-2 block records");
            let b = blocks.slice(
                t.by as usize * f.b4_stride + t.bx as usize
                    ..t.by as usize * f.b4_stride + t.bx as usize + 1,
            )[0];
            b.bl != bl as u8
        } else {
            let ctx = get_partition_ctx(a, &t.l, bl, by8, bx8);
            let p = gather_top_partition_prob(&ts.cdf.m.partition[bl as usize][ctx], bl);
            ts.msac.decode_bool(p)
        };

        debug_assert!(bl != BlockLevel::Bl8x8);
        if is_split {
            let EdgeNode::Branch { split, .. } = node else {
                return Err(Av1Error::InvalidBitstream("partition underflow"));
            };
            bp = BlockPartition::Split;
            decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[0]))?;
            t.bx += hsz;
            decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[1]))?;
            t.bx -= hsz;
        } else {
            bp = BlockPartition::H;
            let b = blocks_for_partition(bl, bp);
            decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().h[0])?;
        }
    } else {
        debug_assert!(have_v_split);
        let is_split = if pass == 2 {
            let blocks = f.blocks.as_ref().expect("pass-2 block records");
            let b = blocks.slice(
                t.by as usize * f.b4_stride + t.bx as usize
                    ..t.by as usize * f.b4_stride + t.bx as usize + 1,
            )[0];
            b.bl != bl as u8
        } else {
            let ctx = get_partition_ctx(a, &t.l, bl, by8, bx8);
            let p = gather_left_partition_prob(&ts.cdf.m.partition[bl as usize][ctx], bl);
            ts.msac.decode_bool(p)
        };

        debug_assert!(bl != BlockLevel::Bl8x8);
        if is_split {
            let EdgeNode::Branch { split, .. } = node else {
                return Err(Av1Error::InvalidBitstream("partition underflow"));
            };
            bp = BlockPartition::Split;
            decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[0]))?;
            t.by += hsz;
            decode_sb(t, ts, f, a, pass, bl.deeper(), edges, Some(split[2]))?;
            t.by -= hsz;
        } else {
            bp = BlockPartition::V;
            let b = blocks_for_partition(bl, bp);
            decode_b(t, ts, f, a, pass, bl, b[0], bp, node.common().v[0])?;
        }
    }

    if pass != 2 && (bp != BlockPartition::Split || bl == BlockLevel::Bl8x8) {
        let blocks = blocks_for_partition(bl, bp);
        let (min_w4, min_h4) = if bp == BlockPartition::Split {
            (1, 1)
        } else {
            let d0 = blocks[0].dimensions();
            let d1 = blocks[1].dimensions();
            (d0[0].min(d1[0]), d0[1].min(d1[1]))
        };
        let span = (hsz as usize).max(1);
        a.partition[bx8..(bx8 + span).min(16)].fill(partition_ctx_byte(min_w4));
        t.l.partition[by8..(by8 + span).min(16)].fill(partition_ctx_byte(min_h4));
    }

    Ok(())
}

/// Decode one superblock row of one tile.
pub fn decode_tile_sbrow(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    pass: u8,
    edges: &EdgeTree,
) -> Result<()> {
    let root_bl = if f.seq.sb128 {
        BlockLevel::Bl128x128
    } else {
        BlockLevel::Bl64x64
    };
    let sb_step = f.sb_step;
    let tile_row = ts.tile_row as usize;
    let frame_is_inter = f.hdr.frame_type.is_inter_allowed();

    t.l.reset(!frame_is_inter, pass);
    let a_row_base = tile_row * f.a_cols;

    if pass == 2 {
        t.bx = ts.tiling.col_start;
        while t.bx < ts.tiling.col_end {
            let a_idx = a_row_base + (t.bx >> f.a_shift) as usize;
            let mut a_guard = f.a.mut_slice(a_idx..a_idx + 1);
            decode_sb(t, ts, f, &mut a_guard[0], pass, root_bl, edges, None)?;
            drop(a_guard);
            t.bx += sb_step;
        }
        f.recon.backup_ipred_edge(f, t, ts)?;
        return Ok(());
    }

    // inter references must have parsed far enough for temporal MV probes
    if f.n_frame_threads > 1 && f.hdr.use_ref_frame_mvs {
        for refp in f.refp.iter().flatten() {
            refp.wait_progress(4 * (t.by + sb_step), crate::thread::PlaneType::Block)?;
        }
    }
    t.pal_sz_uv[1] = [0; 32];

    let ss_ver = (f.seq.layout == PixelLayout::I420) as u32;
    let ss_hor = (f.seq.layout != PixelLayout::I444) as u32;

    t.bx = ts.tiling.col_start;
    while t.bx < ts.tiling.col_end {
        t.cdef_idx = [-1; 4];
        t.cdef_quadrant = (((t.bx & 16) >> 4) + ((t.by & 16) >> 3)) as usize;

        // loop-restoration unit parameters
        for p in 0..3usize {
            if f.hdr.restoration.rtype[p] == RestorationType::None {
                continue;
            }
            let p_shift_v = if p > 0 { ss_ver } else { 0 };
            let p_shift_h = if p > 0 { ss_hor } else { 0 };
            let by = t.by >> p_shift_v;
            let bx = t.bx >> p_shift_h;
            let bh = f.bh4 >> p_shift_v;
            let bw = f.bw4 >> p_shift_h;

            let unit_size_log2 = f.hdr.restoration.unit_size_log2[(p > 0) as usize];
            let b_unit_size = 1u32 << (unit_size_log2 - 2);
            let mask = b_unit_size - 1;
            if by & mask != 0 || bx & mask != 0 {
                continue;
            }
            let half_unit = b_unit_size >> 1;
            // round half up at frame boundaries with more than one unit
            if (by != 0 && by + half_unit > bh) || (bx != 0 && bx + half_unit > bw) {
                continue;
            }
            let unit_idx = (((t.by & 16) >> 3) + ((t.bx & 16) >> 4)) as usize;
            let frame_type = f.hdr.restoration.rtype[p];

            let mut lr = ts.lr_ref[p];
            lr.rtype = if frame_type == RestorationType::Switchable {
                match ts
                    .msac
                    .decode_symbol_adapt(&mut ts.cdf.m.restore_switchable, 3)
                {
                    0 => RestorationType::None,
                    1 => RestorationType::Wiener,
                    _ => RestorationType::SgrProj,
                }
            } else {
                let set = ts.msac.decode_bool_adapt(match frame_type {
                    RestorationType::Wiener => &mut ts.cdf.m.restore_wiener,
                    _ => &mut ts.cdf.m.restore_sgrproj,
                });
                if set {
                    frame_type
                } else {
                    RestorationType::None
                }
            };

            if lr.rtype == RestorationType::Wiener {
                lr.filter_v[0] = if p == 0 {
                    (ts.msac
                        .decode_subexp((ts.lr_ref[p].filter_v[0] as i32 + 5) as u32, 16, 1)
                        - 5) as i8
                } else {
                    0
                };
                lr.filter_v[1] = (ts
                    .msac
                    .decode_subexp((ts.lr_ref[p].filter_v[1] as i32 + 23) as u32, 32, 2)
                    - 23) as i8;
                lr.filter_v[2] = (ts
                    .msac
                    .decode_subexp((ts.lr_ref[p].filter_v[2] as i32 + 17) as u32, 64, 3)
                    - 17) as i8;
                lr.filter_h[0] = if p == 0 {
                    (ts.msac
                        .decode_subexp((ts.lr_ref[p].filter_h[0] as i32 + 5) as u32, 16, 1)
                        - 5) as i8
                } else {
                    0
                };
                lr.filter_h[1] = (ts
                    .msac
                    .decode_subexp((ts.lr_ref[p].filter_h[1] as i32 + 23) as u32, 32, 2)
                    - 23) as i8;
                lr.filter_h[2] = (ts
                    .msac
                    .decode_subexp((ts.lr_ref[p].filter_h[2] as i32 + 17) as u32, 64, 3)
                    - 17) as i8;
                lr.sgr_weights = ts.lr_ref[p].sgr_weights;
                ts.lr_ref[p] = lr;
            } else if lr.rtype == RestorationType::SgrProj {
                const SGR_PARAMS: [[u8; 2]; 16] = [
                    [1, 1], [1, 1], [1, 1], [1, 1], [1, 1], [1, 1], [1, 1], [1, 1],
                    [1, 1], [1, 1], [0, 1], [0, 1], [0, 1], [0, 1], [1, 0], [1, 0],
                ];
                let idx = ts.msac.decode_bools(4) as usize;
                lr.sgr_idx = idx as u8;
                lr.sgr_weights[0] = if SGR_PARAMS[idx][0] != 0 {
                    (ts.msac
                        .decode_subexp((ts.lr_ref[p].sgr_weights[0] as i32 + 96) as u32, 128, 4)
                        - 96) as i8
                } else {
                    0
                };
                lr.sgr_weights[1] = if SGR_PARAMS[idx][1] != 0 {
                    (ts.msac
                        .decode_subexp((ts.lr_ref[p].sgr_weights[1] as i32 + 32) as u32, 128, 4)
                        - 32) as i8
                } else {
                    (128 - lr.sgr_weights[0] as i32).clamp(-32, 95) as i8
                };
                lr.filter_v = ts.lr_ref[p].filter_v;
                lr.filter_h = ts.lr_ref[p].filter_h;
                ts.lr_ref[p] = lr;
            }

            f.lf_masks[t.lf_mask_idx(f)].lock().lr[p][unit_idx] = lr;
        }

        let a_idx = a_row_base + (t.bx >> f.a_shift) as usize;
        {
            let mut a_guard = f.a.mut_slice(a_idx..a_idx + 1);
            decode_sb(t, ts, f, &mut a_guard[0], pass, root_bl, edges, None)?;
        }

        // flush this superblock's CDEF indices into the filter mask
        {
            let mut mask = f.lf_masks[t.lf_mask_idx(f)].lock();
            if f.seq.sb128 {
                mask.cdef_idx = t.cdef_idx;
            } else {
                mask.cdef_idx[t.cdef_quadrant] = t.cdef_idx[t.cdef_quadrant];
            }
        }

        if ts.msac.has_error() {
            return Err(Av1Error::InvalidBitstream("tile payload exhausted"));
        }
        t.bx += sb_step;
    }

    if pass != 1 {
        f.recon.backup_ipred_edge(f, t, ts)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{FrameHeader, LoopFilterParams};

    fn header_with_lf(levels: [u8; 2]) -> FrameHeader {
        let mut hdr = crate::obu::test_support::blank_frame_header();
        hdr.loopfilter = LoopFilterParams {
            level_y: levels,
            level_u: 12,
            level_v: 12,
            sharpness: 0,
            mode_ref_delta_enabled: false,
            ref_deltas: [1, 0, 0, 0, -1, 0, -1, -1],
            mode_deltas: [0, 0],
        };
        hdr
    }

    #[test]
    fn test_lf_values_disabled() {
        let hdr = header_with_lf([0, 0]);
        let lvl = calc_lf_values(&hdr, &[0; 4]);
        assert_eq!(lvl[0][0][0][0], 0);
    }

    #[test]
    fn test_lf_values_flat_without_deltas() {
        let hdr = header_with_lf([32, 28]);
        let lvl = calc_lf_values(&hdr, &[0; 4]);
        assert_eq!(lvl[0][0][3][0], 32);
        assert_eq!(lvl[0][1][5][1], 28);
        assert_eq!(lvl[0][2][0][0], 12);
    }

    #[test]
    fn test_lf_values_running_delta() {
        let hdr = header_with_lf([32, 32]);
        let lvl = calc_lf_values(&hdr, &[8, -40, 0, 0]);
        assert_eq!(lvl[0][0][0][0], 40);
        // clamped at zero
        assert_eq!(lvl[0][1][0][0], 0);
    }

    #[test]
    fn test_quant_tables_follow_segment_deltas() {
        let seq = crate::obu::test_support::blank_sequence_header();
        let mut hdr = crate::obu::test_support::blank_frame_header();
        hdr.quant.yac = 100;
        hdr.segmentation.enabled = true;
        hdr.segmentation.seg_data[1].delta_q = 20;
        let dq = init_quant_tables(&seq, &hdr, hdr.quant.yac);
        assert!(dq[1][0][1] > dq[0][0][1]);
        // DC scale tracks below AC
        assert!(dq[0][0][0] < dq[0][0][1]);
    }

    #[test]
    fn test_restoration_unit_defaults_match_subexp_seed() {
        let u = RestorationUnit::default();
        assert_eq!(u.filter_v, [3, -7, 15]);
        assert_eq!(u.sgr_weights, [-32, 31]);
    }
}
