//! The frame pipeline.
//!
//! `submit_frame` binds a parsed frame header to a frame context: it
//! captures references, allocates the picture and per-frame scratch, wires
//! the CDF hand-off and publishes the reference-slot updates. `decode_frame`
//! then runs the pass schedule over the frame's tiles, either inline or on
//! the slot's worker thread when frame threading is enabled.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::block::Av1Block;
use crate::cdf::CdfContext;
use crate::context::BlockContext;
use crate::edge::EdgeTree;
use crate::error::{Av1Error, Result};
use crate::headers::{FrameHeader, RefState, SequenceHeader, PRIMARY_REF_NONE};
use crate::recon::{recon_ops, ReconOps};
use crate::refmvs::RefMvCell;
use crate::thread::{CdfSlot, PlaneType, ThreadPicture};
use crate::tile::{
    decode_tile_sbrow, init_quant_tables, setup_tile, DequantTables, LfMask, TileCell,
    TileContext,
};
use overture_core::picture::{HeapAllocator, PictureParams};
use overture_core::{DisjointMut, Picture, PictureAllocator};

/// Decoder configuration.
#[derive(Clone)]
pub struct DecoderConfig {
    /// Frame-level pipeline depth; 1 disables frame threading.
    pub n_frame_threads: usize,
    /// Intra-frame tile workers; 1 serializes tiles.
    pub n_tile_threads: usize,
    /// Picture allocator override.
    pub allocator: Option<Arc<dyn PictureAllocator>>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            n_frame_threads: 1,
            n_tile_threads: 1,
            allocator: None,
        }
    }
}

impl std::fmt::Debug for DecoderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderConfig")
            .field("n_frame_threads", &self.n_frame_threads)
            .field("n_tile_threads", &self.n_tile_threads)
            .field("custom_allocator", &self.allocator.is_some())
            .finish()
    }
}

/// One coded range of tiles within a frame's payload.
pub(crate) struct TileGroup {
    pub data: Arc<Vec<u8>>,
    pub range: std::ops::Range<usize>,
    pub start: u32,
    pub end: u32,
}

/// Everything one frame's decode needs, immutable once submitted.
pub struct FrameContext {
    pub seq: Arc<SequenceHeader>,
    pub hdr: Arc<FrameHeader>,
    pub refp: [Option<ThreadPicture>; 7],
    pub cur: ThreadPicture,
    pub cur_poc: u32,
    pub refpoc: [u32; 7],
    pub mvs: Option<Arc<DisjointMut<RefMvCell>>>,
    pub ref_mvs: [Option<Arc<DisjointMut<RefMvCell>>>; 7],
    pub cur_segmap: Option<Arc<DisjointMut<u8>>>,
    pub prev_segmap: Option<Arc<DisjointMut<u8>>>,
    pub bw4: u32,
    pub bh4: u32,
    pub sb128w: usize,
    pub sb128h: usize,
    pub sb_shift: u32,
    pub sb_step: u32,
    pub sbh: u32,
    pub b4_stride: usize,
    /// Above neighbor strips, one per superblock column and tile row.
    pub a: DisjointMut<BlockContext>,
    /// Elements of `a` per tile row, and the column-to-element shift.
    pub a_cols: usize,
    pub a_shift: u32,
    /// Per-128x128 filter bookkeeping; tiles narrower than the mask share
    /// elements, so access is mutex-guarded.
    pub lf_masks: Vec<Mutex<LfMask>>,
    pub lf_lvl: crate::tile::LfLevels,
    pub dq: DequantTables,
    pub jnt_weights: [[u8; 7]; 7],
    /// Pass-1 block records for the pass-2 replay.
    pub blocks: Option<DisjointMut<Av1Block>>,
    pub pal: DisjointMut<[[u16; 8]; 3]>,
    pub pal_idx: DisjointMut<u8>,
    /// Pass-1 coefficient buffer handed to the reconstruction callbacks.
    pub cf: DisjointMut<i32>,
    pub ipred_edge: [DisjointMut<u8>; 3],
    pub tile_groups: Vec<TileGroup>,
    pub tile_start_off: Vec<usize>,
    pub in_cdf_slot: Arc<CdfSlot>,
    pub out_cdf: Option<Arc<CdfSlot>>,
    pub recon: &'static dyn ReconOps,
    pub n_frame_threads: usize,
    pub n_tile_threads: usize,
    pub edges: Arc<EdgeTree>,
}

struct FrameSlotState {
    job: Option<Box<FrameContext>>,
    busy: bool,
    result: Option<Result<()>>,
    out_delayed: Option<ThreadPicture>,
    shutdown: bool,
}

struct FrameSlot {
    state: Mutex<FrameSlotState>,
    cond: Condvar,
}

impl FrameSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FrameSlotState {
                job: None,
                busy: false,
                result: None,
                out_delayed: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        })
    }
}

/// One reference slot.
#[derive(Default)]
struct RefSlot {
    p: Option<ThreadPicture>,
    segmap: Option<Arc<DisjointMut<u8>>>,
    refmvs: Option<Arc<DisjointMut<RefMvCell>>>,
    refpoc: [u32; 7],
    gmv: Option<[crate::warp::WarpedMotionParams; 7]>,
    seg: Option<crate::headers::SegmentationParams>,
    loopfilter: Option<crate::headers::LoopFilterParams>,
}

/// The AV1 decoder.
pub struct Decoder {
    pub(crate) config: DecoderConfig,
    pub(crate) seq: Option<Arc<SequenceHeader>>,
    pub(crate) pending_hdr: Option<Arc<FrameHeader>>,
    pub(crate) pending_tiles: Vec<TileGroup>,
    pub(crate) tiles_seen: u32,
    refs: [RefSlot; 8],
    cdf_slots: [Option<Arc<CdfSlot>>; 8],
    out_queue: VecDeque<Picture>,
    frame_slots: Vec<Arc<FrameSlot>>,
    workers: Vec<std::thread::JoinHandle<()>>,
    next_slot: usize,
    allocator: Arc<dyn PictureAllocator>,
    edges: Arc<EdgeTree>,
    frame_counter: u32,
}

impl Decoder {
    /// Create a decoder with the given configuration.
    pub fn new(config: DecoderConfig) -> Self {
        let allocator = config
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(HeapAllocator));
        let n_fc = config.n_frame_threads.max(1);
        let mut frame_slots = Vec::with_capacity(n_fc);
        let mut workers = Vec::new();
        for _ in 0..n_fc {
            frame_slots.push(FrameSlot::new());
        }
        if n_fc > 1 {
            for slot in &frame_slots {
                let slot = slot.clone();
                workers.push(std::thread::spawn(move || frame_worker(slot)));
            }
        }
        Self {
            config,
            seq: None,
            pending_hdr: None,
            pending_tiles: Vec::new(),
            tiles_seen: 0,
            refs: Default::default(),
            cdf_slots: Default::default(),
            out_queue: VecDeque::new(),
            frame_slots,
            workers,
            next_slot: 0,
            allocator,
            edges: Arc::new(EdgeTree::new()),
            frame_counter: 0,
        }
    }

    /// Create a decoder with the default configuration.
    pub fn new_default() -> Self {
        Self::new(DecoderConfig::default())
    }

    pub(crate) fn ref_state(&self) -> RefState {
        let mut state = RefState::default();
        for (i, slot) in self.refs.iter().enumerate() {
            state.ref_poc[i] = slot.p.as_ref().map(|p| p.p.poc);
            state.gmv[i] = slot.gmv;
            state.seg[i] = slot.seg.clone();
            state.loopfilter[i] = slot.loopfilter.clone();
        }
        state
    }

    pub(crate) fn drain_output(&mut self) -> Vec<Picture> {
        self.out_queue.drain(..).collect()
    }

    /// Emit a previously decoded reference picture.
    pub(crate) fn show_existing(&mut self, idx: usize) -> Result<()> {
        let slot = self.refs[idx]
            .p
            .clone()
            .ok_or(Av1Error::ReferenceMissing(idx))?;
        slot.wait_progress(slot.p.params.h, PlaneType::Y)?;
        if !slot.is_flushed() {
            self.out_queue.push_back(slot.p.clone());
        }
        Ok(())
    }

    /// Bind the pending header and tile data to a frame context and kick
    /// off its decode.
    pub(crate) fn submit_frame(&mut self) -> Result<()> {
        let seq = self.seq.clone().ok_or(Av1Error::NoSequenceHeader)?;
        let hdr = self.pending_hdr.take().expect("pending frame header");
        let tile_groups = std::mem::take(&mut self.pending_tiles);
        self.tiles_seen = 0;

        let n_fc = self.frame_slots.len();
        let threaded = n_fc > 1;

        // capture references before anything mutates the slots
        let mut refp: [Option<ThreadPicture>; 7] = Default::default();
        let mut refpoc = [0u32; 7];
        let mut ref_mvs: [Option<Arc<DisjointMut<RefMvCell>>>; 7] = Default::default();
        if hdr.frame_type.is_inter_allowed() {
            for i in 0..7 {
                let slot = &self.refs[hdr.refidx[i] as usize];
                let p = slot
                    .p
                    .as_ref()
                    .ok_or(Av1Error::ReferenceMissing(hdr.refidx[i] as usize))?;
                refpoc[i] = p.p.poc;
                refp[i] = Some(p.clone());
                if hdr.use_ref_frame_mvs {
                    ref_mvs[i] = slot.refmvs.clone();
                }
            }
        }

        // geometry
        let bw4 = (hdr.width + 7) >> 3 << 1;
        let bh4 = (hdr.height + 7) >> 3 << 1;
        let sb128w = ((bw4 + 31) >> 5) as usize;
        let sb128h = ((bh4 + 31) >> 5) as usize;
        let sb_shift = 4 + seq.sb128 as u32;
        let sb_step = 16u32 << seq.sb128 as u32;
        let sbh = (bh4 + sb_step - 1) >> sb_shift;
        let b4_stride = ((bw4 + 31) & !31) as usize;

        let params = PictureParams {
            w: hdr.width,
            h: hdr.height,
            layout: seq.layout,
            frame_type: hdr.frame_type,
            bpc: seq.bpc,
            pri: seq.pri,
            trc: seq.trc,
            mtrx: seq.mtrx,
            chr: seq.chr,
            full_range: seq.color_range,
        };
        let mut picture = Picture::alloc(params, self.allocator.clone())
            .map_err(|e| Av1Error::OutOfMemory(e.to_string()))?;
        picture.poc = hdr.frame_offset;
        let cur = ThreadPicture::new(picture, hdr.show_frame, threaded);

        // entropy hand-off
        let in_cdf_slot = if hdr.primary_ref_frame == PRIMARY_REF_NONE {
            CdfSlot::ready(Arc::new(CdfContext::new(hdr.quant.yac)))
        } else {
            let slot = hdr.refidx[hdr.primary_ref_frame as usize] as usize;
            self.cdf_slots[slot]
                .clone()
                .ok_or(Av1Error::ReferenceMissing(slot))?
        };
        let out_cdf = hdr.refresh_context.then(CdfSlot::pending);

        // motion grid and segmentation map
        let needs_mvs = hdr.frame_type.is_inter_allowed() || hdr.allow_intrabc;
        let mvs = needs_mvs.then(|| {
            Arc::new(DisjointMut::new(vec![
                RefMvCell::default();
                sb128h * 32 * b4_stride
            ]))
        });
        let (cur_segmap, prev_segmap) = if hdr.segmentation.enabled {
            let prev = if hdr.segmentation.temporal && hdr.primary_ref_frame != PRIMARY_REF_NONE
            {
                let slot = hdr.refidx[hdr.primary_ref_frame as usize] as usize;
                self.refs[slot].segmap.clone()
            } else {
                None
            };
            let cur = if hdr.segmentation.update_map {
                Arc::new(DisjointMut::new(vec![0u8; b4_stride * sb128h * 32]))
            } else if let Some(prev) = prev.clone() {
                prev
            } else {
                Arc::new(DisjointMut::new(vec![0u8; b4_stride * sb128h * 32]))
            };
            (Some(cur), prev)
        } else {
            (None, None)
        };

        // per-frame scratch
        let uses_2pass = threaded && hdr.refresh_context;
        let tiling = &hdr.tiling;
        let n_tiles = (tiling.cols * tiling.rows) as usize;
        let mut tile_start_off = vec![0usize; n_tiles];
        if uses_2pass {
            let mut idx = 0;
            for tile_row in 0..tiling.rows as usize {
                let row_off = tiling.row_start_sb[tile_row] as usize
                    * sb_step as usize
                    * 4
                    * sb128w
                    * 128;
                let b_diff = (tiling.row_start_sb[tile_row + 1]
                    - tiling.row_start_sb[tile_row]) as usize
                    * sb_step as usize
                    * 4;
                for tile_col in 0..tiling.cols as usize {
                    tile_start_off[idx] = row_off
                        + b_diff * tiling.col_start_sb[tile_col] as usize * sb_step as usize * 4;
                    idx += 1;
                }
            }
        }
        let px_area = sb128w * sb128h * 128 * 128;
        let blocks = uses_2pass.then(|| {
            DisjointMut::new(vec![Av1Block::default(); sb128h * 32 * b4_stride])
        });
        let pal = DisjointMut::new(if uses_2pass {
            vec![[[0u16; 8]; 3]; sb128w * sb128h * 16 * 16]
        } else {
            Vec::new()
        });
        let pal_idx = DisjointMut::new(if uses_2pass {
            vec![0u8; px_area * 2]
        } else {
            Vec::new()
        });
        let cf = DisjointMut::new(if uses_2pass {
            vec![0i32; px_area * 3]
        } else {
            Vec::new()
        });

        let hbd_bytes = 1 + (seq.bpc > 8) as usize;
        let ipred_edge = [0, 1, 2].map(|pl| {
            let present = pl == 0 || seq.layout.has_chroma();
            let stride = sb128w * 128 * hbd_bytes;
            DisjointMut::new(if present {
                vec![0u8; sbh as usize * stride]
            } else {
                Vec::new()
            })
        });

        let a_shift = if seq.sb128 { 5 } else { 4 };
        let a_cols = ((bw4 as usize) + (1 << a_shift) - 1) >> a_shift;
        let a = DisjointMut::new(vec![
            BlockContext::default();
            a_cols * tiling.rows as usize
        ]);
        let lf_masks = (0..sb128w * sb128h)
            .map(|_| Mutex::new(LfMask::default()))
            .collect();
        let lf_lvl = crate::tile::calc_lf_values(&hdr, &[0; 4]);
        let dq = init_quant_tables(&seq, &hdr, hdr.quant.yac);

        // joint-compound weights from reference distances
        let mut jnt_weights = [[0u8; 7]; 7];
        if hdr.switchable_comp_refs && seq.jnt_comp {
            const QUANT_DIST_WEIGHT: [[u32; 2]; 3] = [[2, 3], [2, 5], [2, 7]];
            const QUANT_DIST_LOOKUP: [[u8; 2]; 4] = [[9, 7], [11, 5], [12, 4], [13, 3]];
            for i in 0..7 {
                for j in (i + 1)..7 {
                    let d1 = crate::env::get_poc_diff(
                        seq.order_hint_n_bits,
                        refpoc[i],
                        hdr.frame_offset,
                    )
                    .unsigned_abs()
                    .min(31);
                    let d0 = crate::env::get_poc_diff(
                        seq.order_hint_n_bits,
                        refpoc[j],
                        hdr.frame_offset,
                    )
                    .unsigned_abs()
                    .min(31);
                    let order = (d0 <= d1) as usize;
                    let mut k = 2;
                    for (kk, w) in QUANT_DIST_WEIGHT.iter().enumerate() {
                        let c0 = w[order];
                        let c1 = w[1 - order];
                        if (d0 > d1 && d0 * c0 < d1 * c1) || (d0 <= d1 && d0 * c0 > d1 * c1) {
                            k = kk;
                            break;
                        }
                    }
                    jnt_weights[i][j] = QUANT_DIST_LOOKUP[k][order];
                }
            }
        }

        let f = Box::new(FrameContext {
            recon: recon_ops(seq.bpc),
            seq,
            hdr: hdr.clone(),
            refp,
            cur: cur.clone(),
            cur_poc: hdr.frame_offset,
            refpoc,
            mvs,
            ref_mvs,
            cur_segmap,
            prev_segmap,
            a_cols,
            a_shift,
            bw4,
            bh4,
            sb128w,
            sb128h,
            sb_shift,
            sb_step,
            sbh,
            b4_stride,
            a,
            lf_masks,
            lf_lvl,
            dq,
            jnt_weights,
            blocks,
            pal,
            pal_idx,
            cf,
            ipred_edge,
            tile_groups,
            tile_start_off,
            in_cdf_slot: in_cdf_slot.clone(),
            out_cdf: out_cdf.clone(),
            n_frame_threads: n_fc,
            n_tile_threads: self.config.n_tile_threads.max(1),
            edges: self.edges.clone(),
        });

        self.frame_counter += 1;
        debug!(
            poc = hdr.frame_offset,
            frame = self.frame_counter,
            ?threaded,
            "submitting frame"
        );

        if !threaded {
            let res = decode_frame(&f);
            match res {
                Ok(()) => {
                    self.update_refs(&f, in_cdf_slot, out_cdf);
                    if f.cur.visible && !f.cur.is_flushed() {
                        self.out_queue.push_back(f.cur.p.clone());
                    }
                    Ok(())
                }
                Err(e) => {
                    warn!("dropping frame {}: {e}", hdr.frame_offset);
                    Err(e)
                }
            }
        } else {
            // reference slots must reflect this frame before the next
            // submission; consumers gate on its progress counters
            self.update_refs(&f, in_cdf_slot, out_cdf);

            let slot = self.frame_slots[self.next_slot].clone();
            self.next_slot = (self.next_slot + 1) % n_fc;

            let mut state = slot.state.lock();
            while state.busy || state.job.is_some() {
                slot.cond.wait(&mut state);
            }
            if let Some(prev) = state.out_delayed.take() {
                let failed = matches!(state.result, Some(Err(_)));
                if let Some(Err(e)) = state.result.take() {
                    warn!("dropped delayed frame: {e}");
                }
                if !failed && prev.visible && !prev.is_flushed() {
                    self.out_queue.push_back(prev.p.clone());
                }
            }
            state.out_delayed = Some(cur);
            state.job = Some(f);
            slot.cond.notify_all();
            Ok(())
        }
    }

    fn update_refs(
        &mut self,
        f: &FrameContext,
        in_cdf: Arc<CdfSlot>,
        out_cdf: Option<Arc<CdfSlot>>,
    ) {
        let hdr = &f.hdr;
        for i in 0..8 {
            if hdr.refresh_frame_flags & (1 << i) == 0 {
                continue;
            }
            let slot = &mut self.refs[i];
            slot.p = Some(f.cur.clone());
            slot.segmap = f.cur_segmap.clone();
            slot.refmvs = if hdr.allow_intrabc {
                None
            } else {
                f.mvs.clone()
            };
            slot.refpoc = f.refpoc;
            slot.gmv = Some(hdr.gmv);
            slot.seg = Some(hdr.segmentation.clone());
            slot.loopfilter = Some(hdr.loopfilter.clone());
            self.cdf_slots[i] = Some(out_cdf.clone().unwrap_or_else(|| in_cdf.clone()));
        }
    }

    /// Wait for all in-flight frames and emit the delayed pictures in
    /// submission order.
    pub fn finish(&mut self) -> Vec<Picture> {
        let n_fc = self.frame_slots.len();
        for i in 0..n_fc {
            let slot = self.frame_slots[(self.next_slot + i) % n_fc].clone();
            let mut state = slot.state.lock();
            while state.busy || state.job.is_some() {
                slot.cond.wait(&mut state);
            }
            if let Some(prev) = state.out_delayed.take() {
                let failed = matches!(state.result, Some(Err(_)));
                if let Some(Err(e)) = state.result.take() {
                    warn!("dropped delayed frame: {e}");
                }
                if !failed && prev.visible && !prev.is_flushed() {
                    self.out_queue.push_back(prev.p.clone());
                }
            }
        }
        self.drain_output()
    }

    /// Invalidate the output queue and mark in-flight pictures so they are
    /// not emitted even if they complete.
    pub fn flush(&mut self) {
        for slot in &self.frame_slots {
            let state = slot.state.lock();
            if let Some(delayed) = &state.out_delayed {
                delayed.mark_flushed();
            }
        }
        for slot in self.frame_slots.clone() {
            let mut state = slot.state.lock();
            while state.busy || state.job.is_some() {
                slot.cond.wait(&mut state);
            }
            state.out_delayed = None;
            state.result = None;
        }
        self.out_queue.clear();
        self.pending_hdr = None;
        self.pending_tiles.clear();
        self.tiles_seen = 0;
        self.next_slot = 0;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        for slot in &self.frame_slots {
            let mut state = slot.state.lock();
            state.shutdown = true;
            slot.cond.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn frame_worker(slot: Arc<FrameSlot>) {
    loop {
        let job = {
            let mut state = slot.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.job.take() {
                    state.busy = true;
                    break job;
                }
                slot.cond.wait(&mut state);
            }
        };

        let res = decode_frame(&job);
        if let Err(e) = &res {
            // release everyone gated on this picture
            if let Some(progress) = &job.cur.progress {
                progress.signal_error();
            }
            if let Some(out) = &job.out_cdf {
                out.signal(job.in_cdf_slot.wait());
            }
            warn!("frame decode failed: {e}");
        }

        let mut state = slot.state.lock();
        state.busy = false;
        state.result = Some(res);
        slot.cond.notify_all();
    }
}

/// Run the pass schedule for one submitted frame.
pub(crate) fn decode_frame(f: &FrameContext) -> Result<()> {
    let in_cdf = f.in_cdf_slot.wait();
    let tiling = &f.hdr.tiling;
    let cols = tiling.cols as usize;
    let rows = tiling.rows as usize;
    let n_tiles = cols * rows;

    // slice the tile payloads and seed per-tile state
    let mut tiles: Vec<TileCell> = Vec::with_capacity(n_tiles);
    let mut update_set = false;
    for group in &f.tile_groups {
        let mut pos = group.range.start;
        for j in group.start..=group.end {
            let tile_row = j / tiling.cols;
            let tile_col = j % tiling.cols;
            let size = if j == group.end {
                group.range.end.saturating_sub(pos)
            } else {
                let n = tiling.n_bytes as usize;
                if pos + n > group.range.end {
                    return Err(Av1Error::InvalidBitstream("tile size prefix truncated"));
                }
                let mut sz = 0usize;
                for k in 0..n {
                    sz |= (group.data[pos + k] as usize) << (k * 8);
                }
                pos += n;
                sz + 1
            };
            if size == 0 || pos + size > group.range.end {
                return Err(Av1Error::InvalidBitstream("tile size exceeds payload"));
            }
            if tiles.len() >= n_tiles {
                return Err(Av1Error::InvalidBitstream("too many tiles"));
            }
            let off = f.tile_start_off.get(tiles.len()).copied().unwrap_or(0);
            let ts = setup_tile(
                f,
                &in_cdf,
                group.data.clone(),
                pos,
                pos + size,
                tile_row,
                tile_col,
                off,
            );
            let first_sbrow = tiling.row_start_sb[tile_row as usize] as i32;
            tiles.push(TileCell::new(ts, first_sbrow));
            if j == tiling.update && f.hdr.refresh_context {
                update_set = true;
            }
            pos += size;
        }
    }
    if tiles.len() != n_tiles {
        return Err(Av1Error::InvalidBitstream("missing tiles"));
    }

    let uses_2pass = f.n_frame_threads > 1 && f.hdr.refresh_context;
    let passes: &[u8] = if uses_2pass { &[1, 2] } else { &[0] };
    let frame_is_inter = f.hdr.frame_type.is_inter_allowed();
    let mut cdf_published = false;

    for &pass in passes {
        let progress_plane = match pass {
            0 => PlaneType::All,
            1 => PlaneType::Block,
            _ => PlaneType::Y,
        };

        {
            let mut guard = f.a.mut_slice(0..f.a.len());
            for ctx in guard.iter_mut() {
                ctx.reset(!frame_is_inter, pass);
            }
        }

        if f.n_tile_threads <= 1 {
            run_pass_serial(f, &tiles, pass, progress_plane)?;
        } else {
            run_pass_parallel(f, &tiles, pass, progress_plane)?;
        }

        if pass <= 1 && f.hdr.refresh_context && !cdf_published {
            let out = if update_set {
                Arc::new(tiles[tiling.update as usize].state.lock().cdf.promoted())
            } else {
                in_cdf.clone()
            };
            if let Some(slot) = &f.out_cdf {
                slot.signal(out);
            }
            cdf_published = true;
        }

        if pass == 1 {
            for (i, cell) in tiles.iter().enumerate() {
                let mut ts = cell.state.lock();
                let off = f.tile_start_off.get(i).copied().unwrap_or(0);
                ts.pal_idx_cursor = off * 2;
                ts.cf_cursor = off * 3;
                let first = tiling.row_start_sb[ts.tile_row as usize] as i32;
                drop(ts);
                cell.signal_progress(first);
            }
        }
    }

    f.cur.signal_progress(u32::MAX, PlaneType::All);
    Ok(())
}

fn run_pass_serial(
    f: &FrameContext,
    tiles: &[TileCell],
    pass: u8,
    progress_plane: PlaneType,
) -> Result<()> {
    let tiling = &f.hdr.tiling;
    let cols = tiling.cols as usize;
    let mut t = TileContext::default();

    for tile_row in 0..tiling.rows as usize {
        for sby in tiling.row_start_sb[tile_row]..tiling.row_start_sb[tile_row + 1] {
            t.by = sby << f.sb_shift;
            for tile_col in 0..cols {
                let cell = &tiles[tile_row * cols + tile_col];
                let mut ts = cell.state.lock();
                decode_tile_sbrow(&mut t, &mut ts, f, pass, &f.edges)?;
            }
            if pass != 1 {
                f.recon.filter_sbrow(f, sby)?;
            }
            f.cur
                .signal_progress((sby + 1) * f.sb_step * 4, progress_plane);
        }
    }
    Ok(())
}

enum Task {
    Tile(usize),
    SbRow(usize, u32),
}

fn run_pass_parallel(
    f: &FrameContext,
    tiles: &[TileCell],
    pass: u8,
    progress_plane: PlaneType,
) -> Result<()> {
    let tiling = &f.hdr.tiling;
    let cols = tiling.cols as usize;
    let rows = tiling.rows as usize;

    let mut task_list = VecDeque::new();
    if pass == 2 {
        // per-sbrow tasks so the post-filter can chase the reconstruction
        for tile_row in 0..rows {
            for sby in tiling.row_start_sb[tile_row]..tiling.row_start_sb[tile_row + 1] {
                for tile_col in 0..cols {
                    task_list.push_back(Task::SbRow(tile_row * cols + tile_col, sby));
                }
            }
        }
    } else {
        for idx in 0..tiles.len() {
            task_list.push_back(Task::Tile(idx));
        }
    }

    let queue = Mutex::new(task_list);
    let error: Mutex<Option<Av1Error>> = Mutex::new(None);
    let n_workers = f.n_tile_threads.min(tiles.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..n_workers {
            scope.spawn(|| {
                let mut t = TileContext::default();
                loop {
                    if error.lock().is_some() {
                        return;
                    }
                    let Some(task) = queue.lock().pop_front() else {
                        return;
                    };
                    let res = run_task(f, tiles, &mut t, pass, &task);
                    if let Err(e) = res {
                        *error.lock() = Some(e);
                        // release the post-filter and any sbrow waiters
                        for cell in tiles {
                            cell.signal_progress(i32::MAX);
                        }
                        return;
                    }
                }
            });
        }

        // post-filter in row order behind the reconstruction
        for tile_row in 0..rows {
            for sby in tiling.row_start_sb[tile_row]..tiling.row_start_sb[tile_row + 1] {
                for tile_col in 0..cols {
                    tiles[tile_row * cols + tile_col].wait_progress(sby as i32);
                }
                if error.lock().is_some() {
                    return;
                }
                if pass != 1 {
                    if let Err(e) = f.recon.filter_sbrow(f, sby) {
                        *error.lock() = Some(e);
                        return;
                    }
                }
                f.cur
                    .signal_progress((sby + 1) * f.sb_step * 4, progress_plane);
            }
        }
    });

    match error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn run_task(
    f: &FrameContext,
    tiles: &[TileCell],
    t: &mut TileContext,
    pass: u8,
    task: &Task,
) -> Result<()> {
    let tiling = &f.hdr.tiling;
    match *task {
        Task::Tile(idx) => {
            let cell = &tiles[idx];
            let mut ts = cell.state.lock();
            let row = ts.tile_row as usize;
            for sby in tiling.row_start_sb[row]..tiling.row_start_sb[row + 1] {
                t.by = sby << f.sb_shift;
                decode_tile_sbrow(t, &mut ts, f, pass, &f.edges)?;
                cell.signal_progress(sby as i32 + 1);
            }
            Ok(())
        }
        Task::SbRow(idx, sby) => {
            let cell = &tiles[idx];
            // wait until the previous sbrow of this tile is done
            {
                let mut guard = cell.progress.lock();
                while (*guard as u32) < sby {
                    cell.cond.wait(&mut guard);
                }
            }
            let mut ts = cell.state.lock();
            t.by = sby << f.sb_shift;
            decode_tile_sbrow(t, &mut ts, f, pass, &f.edges)?;
            drop(ts);
            cell.signal_progress(sby as i32 + 1);
            Ok(())
        }
    }
}
