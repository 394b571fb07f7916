//! Per-block parsing.
//!
//! `decode_b` consumes the symbols of one leaf block in canonical order:
//! skip-mode, segment id, skip, CDEF index, quantizer and loop-filter
//! deltas, the intra/inter split and everything hanging off it, then hands
//! the block to the reconstruction callbacks and writes its categorical
//! state back into the neighbor strips, the motion grid and the
//! segmentation map.

use crate::cdf::CdfMvContext;
use crate::context::BlockContext;
use crate::decoder::FrameContext;
use crate::edge::EdgeFlags;
use crate::env;
use crate::error::{Av1Error, Result};
use crate::headers::TxfmMode;
use crate::refmvs::{
    find_ref_mvs, splat_intrabc_mv, splat_intraref, splat_oneref_mv, splat_tworef_mv, Mv,
};
use crate::tables::*;
use crate::tile::{TileContext, TileState};
use crate::warp::{find_affine_int, WarpSample, WarpType};
use overture_core::picture::PixelLayout;

/// Everything the parser records about one leaf block.
#[derive(Debug, Clone, Copy)]
pub struct Av1Block {
    pub bl: u8,
    pub bp: u8,
    pub bs: u8,
    pub intra: bool,
    pub seg_id: u8,
    pub skip_mode: bool,
    pub skip: bool,
    pub y_mode: u8,
    pub y_angle: i8,
    pub uv_mode: u8,
    pub uv_angle: i8,
    pub cfl_alpha: [i8; 2],
    pub pal_sz: [u8; 2],
    pub tx: u8,
    pub uvtx: u8,
    pub max_ytx: u8,
    pub tx_split: [u16; 2],
    pub inter_mode: u8,
    pub comp_type: u8,
    pub refs: [i8; 2],
    pub drl_idx: u8,
    pub mv: [Mv; 2],
    pub interintra_type: u8,
    pub interintra_mode: u8,
    pub motion_mode: u8,
    pub wedge_idx: u8,
    pub mask_sign: bool,
    pub filter: [u8; 2],
}

impl Default for Av1Block {
    fn default() -> Self {
        Self {
            bl: 0,
            bp: 0,
            bs: BlockSize::Bs4x4 as u8,
            intra: true,
            seg_id: 0,
            skip_mode: false,
            skip: false,
            y_mode: DC_PRED,
            y_angle: 0,
            uv_mode: DC_PRED,
            uv_angle: 0,
            cfl_alpha: [0; 2],
            pal_sz: [0; 2],
            tx: TxSize::Tx4x4 as u8,
            uvtx: TxSize::Tx4x4 as u8,
            max_ytx: TxSize::Tx4x4 as u8,
            tx_split: [0; 2],
            inter_mode: 0,
            comp_type: COMP_INTER_NONE,
            refs: [-1, -1],
            drl_idx: 0,
            mv: [Mv::default(); 2],
            interintra_type: INTER_INTRA_NONE,
            interintra_mode: 0,
            motion_mode: MM_TRANSLATION,
            wedge_idx: 0,
            mask_sign: false,
            filter: [FILTER_8TAP_REGULAR; 2],
        }
    }
}

fn read_mv_component_diff(
    ts: &mut TileState,
    comp_idx: usize,
    use_dmv: bool,
    have_fp: bool,
    have_hp: bool,
) -> i32 {
    let cdf = if use_dmv {
        &mut ts.cdf.dmv
    } else {
        &mut ts.cdf.mv
    };
    let comp = &mut cdf.comp[comp_idx];
    let sign = ts.msac.decode_bool_adapt(&mut comp.sign);
    let cl = ts.msac.decode_symbol_adapt(&mut comp.classes, 11) as u32;
    let up;
    let fp;
    let hp;

    if cl == 0 {
        up = ts.msac.decode_bool_adapt(&mut comp.class0) as u32;
        if have_fp {
            fp = ts
                .msac
                .decode_symbol_adapt(&mut comp.class0_fp[up as usize], 4) as u32;
            hp = if have_hp {
                ts.msac.decode_bool_adapt(&mut comp.class0_hp) as u32
            } else {
                1
            };
        } else {
            fp = 3;
            hp = 1;
        }
    } else {
        let mut v = 1 << cl;
        for n in 0..cl as usize {
            v |= (ts.msac.decode_bool_adapt(&mut comp.class_n[n]) as u32) << n;
        }
        up = v;
        if have_fp {
            fp = ts.msac.decode_symbol_adapt(&mut comp.class_n_fp, 4) as u32;
            hp = if have_hp {
                ts.msac.decode_bool_adapt(&mut comp.class_n_hp) as u32
            } else {
                1
            };
        } else {
            fp = 3;
            hp = 1;
        }
    }

    let diff = ((up << 3) | (fp << 1) | hp) as i32 + 1;
    if sign {
        -diff
    } else {
        diff
    }
}

fn read_mv_residual(ts: &mut TileState, ref_mv: &mut Mv, use_dmv: bool, have_fp: bool, hp: bool) {
    let joint = {
        let cdf: &mut CdfMvContext = if use_dmv {
            &mut ts.cdf.dmv
        } else {
            &mut ts.cdf.mv
        };
        ts.msac.decode_symbol_adapt(&mut cdf.joint, 4)
    };
    match joint {
        j if j == MV_JOINT_HV => {
            ref_mv.y = (ref_mv.y as i32 + read_mv_component_diff(ts, 0, use_dmv, have_fp, hp))
                as i16;
            ref_mv.x = (ref_mv.x as i32 + read_mv_component_diff(ts, 1, use_dmv, have_fp, hp))
                as i16;
        }
        j if j == MV_JOINT_H => {
            ref_mv.x = (ref_mv.x as i32 + read_mv_component_diff(ts, 1, use_dmv, have_fp, hp))
                as i16;
        }
        j if j == MV_JOINT_V => {
            ref_mv.y = (ref_mv.y as i32 + read_mv_component_diff(ts, 0, use_dmv, have_fp, hp))
                as i16;
        }
        _ => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn read_tx_tree(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    from: TxSize,
    depth: u32,
    masks: &mut [u16; 2],
    x_off: u32,
    y_off: u32,
) {
    let bx4 = (t.bx & 31) as usize;
    let by4 = (t.by & 31) as usize;
    let t_dim = from.info();
    let is_split = if depth < 2 && from > TxSize::Tx4x4 {
        let cat = (2 * (4 - t_dim.max as u32)).saturating_sub(depth).min(6) as usize;
        let a_ctx = (a.tx[bx4] < t_dim.lw) as usize;
        let l_ctx = (t.l.tx[by4] < t_dim.lh) as usize;
        let split = ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.txpart[cat][a_ctx + l_ctx]);
        if split {
            masks[depth as usize] |= 1 << (y_off * 4 + x_off);
        }
        split
    } else {
        false
    };

    if is_split && t_dim.max > 1 {
        let sub = t_dim.sub;
        let sub_dim = sub.info();
        let txsw = sub_dim.w as u32;
        let txsh = sub_dim.h as u32;

        read_tx_tree(t, ts, f, a, sub, depth + 1, masks, x_off * 2, y_off * 2);
        t.bx += txsw;
        if t_dim.w >= t_dim.h && t.bx < f.bw4 {
            read_tx_tree(t, ts, f, a, sub, depth + 1, masks, x_off * 2 + 1, y_off * 2);
        }
        t.bx -= txsw;
        t.by += txsh;
        if t_dim.h >= t_dim.w && t.by < f.bh4 {
            read_tx_tree(t, ts, f, a, sub, depth + 1, masks, x_off * 2, y_off * 2 + 1);
            t.bx += txsw;
            if t_dim.w >= t_dim.h && t.bx < f.bw4 {
                read_tx_tree(t, ts, f, a, sub, depth + 1, masks, x_off * 2 + 1, y_off * 2 + 1);
            }
            t.bx -= txsw;
        }
        t.by -= txsh;
    } else {
        let w = t_dim.w as usize;
        let h = t_dim.h as usize;
        let aval = if is_split { 0 } else { t_dim.lw };
        let lval = if is_split { 0 } else { t_dim.lh };
        a.tx[bx4..(bx4 + w).min(32)].fill(aval);
        t.l.tx[by4..(by4 + h).min(32)].fill(lval);
    }
}

/// Deinterleave a segment-id difference around its prediction.
pub fn neg_deinterleave(diff: i32, r#ref: i32, max: i32) -> i32 {
    if r#ref == 0 {
        return diff;
    }
    if r#ref >= max - 1 {
        return max - diff - 1;
    }
    if 2 * r#ref < max {
        if diff <= 2 * r#ref {
            if diff & 1 != 0 {
                r#ref + ((diff + 1) >> 1)
            } else {
                r#ref - (diff >> 1)
            }
        } else {
            diff
        }
    } else if diff <= 2 * (max - r#ref - 1) {
        if diff & 1 != 0 {
            r#ref + ((diff + 1) >> 1)
        } else {
            r#ref - (diff >> 1)
        }
    } else {
        max - (diff + 1)
    }
}

/// Bitmasks over the above/left edges marking 4x4 positions whose cell
/// codes exactly the probed single reference.
fn find_matching_ref(
    t: &TileContext,
    ts: &TileState,
    f: &FrameContext,
    intra_edge_flags: EdgeFlags,
    bw4: u32,
    bh4: u32,
    w4: u32,
    h4: u32,
    have_left: bool,
    have_top: bool,
    r#ref: i8,
    masks: &mut [u64; 2],
) {
    let Some(mvs) = f.mvs.as_ref() else { return };
    let stride = f.b4_stride;
    let pos = t.by as usize * stride + t.bx as usize;
    let mut count = 0;
    let mut have_topleft = have_top && have_left;
    let mut have_topright = bw4.max(bh4) < 32
        && have_top
        && t.bx + bw4 < ts.tiling.col_end
        && intra_edge_flags.contains(EdgeFlags::I444_TOP_HAS_RIGHT);

    let matches = |cell: &crate::refmvs::RefMvCell| {
        cell.ref_frame[0] == r#ref && cell.ref_frame[1] == -1
    };

    if have_top {
        let row = pos - stride;
        let guard = mvs.slice(row..row + w4 as usize);
        let cell = guard[0];
        if matches(&cell) {
            masks[0] |= 1;
            count = 1;
        }
        let mut aw4 = BlockSize::from_index(cell.bs).dimensions()[0] as u32;
        if aw4 >= bw4 {
            let off = t.bx & (aw4 - 1);
            if off != 0 {
                have_topleft = false;
            }
            if aw4 - off > bw4 {
                have_topright = false;
            }
        } else {
            let mut mask = 1u64 << aw4;
            let mut x = aw4;
            while x < w4 {
                let cell = guard[x as usize];
                if matches(&cell) {
                    masks[0] |= mask;
                    count += 1;
                    if count >= 8 {
                        return;
                    }
                }
                aw4 = BlockSize::from_index(cell.bs).dimensions()[0] as u32;
                mask <<= aw4;
                x += aw4;
            }
        }
    }
    if have_left {
        let cell = mvs.get(pos - 1);
        if matches(&cell) {
            masks[1] |= 1;
            count += 1;
            if count >= 8 {
                return;
            }
        }
        let mut lh4 = BlockSize::from_index(cell.bs).dimensions()[1] as u32;
        if lh4 >= bh4 {
            if t.by & (lh4 - 1) != 0 {
                have_topleft = false;
            }
        } else {
            let mut mask = 1u64 << lh4;
            let mut y = lh4;
            while y < h4 {
                let cell = mvs.get(pos + y as usize * stride - 1);
                if matches(&cell) {
                    masks[1] |= mask;
                    count += 1;
                    if count >= 8 {
                        return;
                    }
                }
                lh4 = BlockSize::from_index(cell.bs).dimensions()[1] as u32;
                mask <<= lh4;
                y += lh4;
            }
        }
    }
    if have_topleft && matches(&mvs.get(pos - 1 - stride)) {
        masks[1] |= 1 << 32;
        count += 1;
        if count >= 8 {
            return;
        }
    }
    if have_topright && matches(&mvs.get(pos + bw4 as usize - stride)) {
        masks[0] |= 1 << 32;
    }
}

/// Fit a warp model from the matching-ref neighbor samples; an unusable
/// fit leaves the model as identity.
fn derive_warpmv(
    t: &mut TileContext,
    f: &FrameContext,
    bw4: u32,
    bh4: u32,
    masks: &[u64; 2],
    mv: Mv,
) {
    let Some(mvs) = f.mvs.as_ref() else { return };
    let stride = f.b4_stride;
    let pos = t.by as usize * stride + t.bx as usize;
    let mut samples: Vec<WarpSample> = Vec::with_capacity(8);

    let mut add_sample = |dx: i32, dy: i32, sx: i32, sy: i32, cell: &crate::refmvs::RefMvCell| {
        let dims = BlockSize::from_index(cell.bs).dimensions();
        let src = [
            16 * (2 * dx + sx * dims[0] as i32) - 8,
            16 * (2 * dy + sy * dims[1] as i32) - 8,
        ];
        WarpSample {
            src,
            dst: [src[0] + cell.mv[0].x as i32, src[1] + cell.mv[0].y as i32],
        }
    };

    if masks[0] as u32 == 1 && masks[1] >> 32 == 0 {
        let cell = mvs.get(pos - stride);
        let off = (t.bx & (BlockSize::from_index(cell.bs).dimensions()[0] as u32 - 1)) as i32;
        samples.push(add_sample(-off, 0, 1, -1, &cell));
    } else {
        let mut off = 0u32;
        let mut xmask = masks[0] as u32;
        while samples.len() < 8 && xmask != 0 {
            let tz = xmask.trailing_zeros();
            off += tz;
            let cell = mvs.get(pos + off as usize - stride);
            samples.push(add_sample(off as i32, 0, 1, -1, &cell));
            xmask >>= tz + 1;
            off += 1;
        }
    }
    if samples.len() < 8 && masks[1] as u32 == 1 {
        let cell = mvs.get(pos - 1);
        let off = (t.by & (BlockSize::from_index(cell.bs).dimensions()[1] as u32 - 1)) as i32;
        samples.push(add_sample(0, -off, -1, 1, &cell));
    } else {
        let mut off = 0u32;
        let mut ymask = masks[1] as u32;
        while samples.len() < 8 && ymask != 0 {
            let tz = ymask.trailing_zeros();
            off += tz;
            let cell = mvs.get(pos + off as usize * stride - 1);
            samples.push(add_sample(0, off as i32, -1, 1, &cell));
            ymask >>= tz + 1;
            off += 1;
        }
    }
    if samples.len() < 8 && masks[1] >> 32 != 0 {
        let cell = mvs.get(pos - 1 - stride);
        samples.push(add_sample(0, 0, -1, -1, &cell));
    }
    if samples.len() < 8 && masks[0] >> 32 != 0 {
        let cell = mvs.get(pos + bw4 as usize - stride);
        samples.push(add_sample(bw4 as i32, 0, 1, -1, &cell));
    }
    debug_assert!(!samples.is_empty());

    // discard samples whose displacement disagrees with the block vector
    let thresh = 4 * (bw4.max(bh4).clamp(4, 28) as i32);
    let kept: Vec<WarpSample> = samples
        .iter()
        .copied()
        .filter(|s| {
            let mvd = (s.dst[0] - s.src[0] - mv.x as i32).abs()
                + (s.dst[1] - s.src[1] - mv.y as i32).abs();
            mvd <= thresh
        })
        .collect();
    let fit = if kept.is_empty() { &samples[..1] } else { &kept[..] };

    t.warpmv = Default::default();
    if find_affine_int(fit, bw4, bh4, mv, t.bx, t.by, &mut t.warpmv)
        && t.warpmv.compute_shear_params()
    {
        t.warpmv.wm_type = WarpType::Affine;
    } else {
        t.warpmv = Default::default();
    }
}

/// The thinned overlappable-neighbor probe: only every other 4x4 cell of
/// the strip is examined.
fn findoddzero(buf: &[u8]) -> bool {
    buf.iter().step_by(2).any(|&v| v == 0)
}

#[allow(clippy::too_many_arguments)]
fn read_pal_plane(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &BlockContext,
    b: &mut Av1Block,
    pass: u8,
    pl: usize,
    sz_ctx: usize,
    bx4: usize,
    by4: usize,
) {
    let pal_sz =
        2 + ts
            .msac
            .decode_symbol_adapt(&mut ts.cdf.m.pal_sz[pl][sz_ctx], 7) as usize;
    b.pal_sz[pl] = pal_sz as u8;
    let mut cache = [0u16; 16];
    let mut used_cache = [0u16; 8];
    let mut n_cache = 0usize;

    let l_sz = if pl != 0 {
        t.pal_sz_uv[1][by4] as usize
    } else {
        t.l.pal_sz[by4] as usize
    };
    // don't reuse the above palette across 64-pixel boundaries
    let a_sz = if by4 & 15 != 0 {
        if pl != 0 {
            t.pal_sz_uv[0][bx4] as usize
        } else {
            a.pal_sz[bx4] as usize
        }
    } else {
        0
    };
    let l_pal = t.al_pal[1][by4][pl];
    let a_pal = t.al_pal[0][bx4][pl];

    // sorted merge of the left and above palettes
    let (mut li, mut ai) = (0usize, 0usize);
    while li < l_sz && ai < a_sz {
        if l_pal[li] < a_pal[ai] {
            if n_cache == 0 || cache[n_cache - 1] != l_pal[li] {
                cache[n_cache] = l_pal[li];
                n_cache += 1;
            }
            li += 1;
        } else {
            if a_pal[ai] == l_pal[li] {
                li += 1;
            }
            if n_cache == 0 || cache[n_cache - 1] != a_pal[ai] {
                cache[n_cache] = a_pal[ai];
                n_cache += 1;
            }
            ai += 1;
        }
    }
    while li < l_sz {
        if n_cache == 0 || cache[n_cache - 1] != l_pal[li] {
            cache[n_cache] = l_pal[li];
            n_cache += 1;
        }
        li += 1;
    }
    while ai < a_sz {
        if n_cache == 0 || cache[n_cache - 1] != a_pal[ai] {
            cache[n_cache] = a_pal[ai];
            n_cache += 1;
        }
        ai += 1;
    }

    // reused cache entries
    let mut i = 0usize;
    for n in 0..n_cache {
        if i >= pal_sz {
            break;
        }
        if ts.msac.decode_bool(128 << 7) {
            used_cache[i] = cache[n];
            i += 1;
        }
    }
    let n_used_cache = i;

    // new entries, ascending with delta coding
    let mut pal = [0u16; 8];
    if i < pal_sz {
        let bpc = f.seq.bpc as u32;
        let mut prev = ts.msac.decode_bools(bpc) as u16;
        pal[i] = prev;
        i += 1;
        if i < pal_sz {
            let mut bits = bpc - 3 + ts.msac.decode_bools(2);
            let max = (1u32 << bpc) - 1;
            while i < pal_sz {
                let delta = ts.msac.decode_bools(bits);
                let v = (prev as u32 + delta + (pl == 0) as u32).min(max) as u16;
                prev = v;
                pal[i] = v;
                i += 1;
                if prev as u32 + (pl == 0) as u32 >= max {
                    for j in i..pal_sz {
                        pal[j] = pal[j - 1];
                    }
                    break;
                }
                bits = bits.min(1 + overture_core::bitstream::ulog2(max - prev as u32 - (pl == 0) as u32));
            }
        }
        // merge cache hits with the new entries, keeping ascending order
        let mut merged = [0u16; 8];
        let mut n = 0usize;
        let mut m = n_used_cache;
        for slot in merged.iter_mut().take(pal_sz) {
            if n < n_used_cache && (m >= pal_sz || used_cache[n] <= pal[m]) {
                *slot = used_cache[n];
                n += 1;
            } else {
                *slot = pal[m];
                m += 1;
            }
        }
        pal = merged;
    } else {
        pal[..n_used_cache].copy_from_slice(&used_cache[..n_used_cache]);
    }

    if pass != 0 {
        let idx = t.pal_record_idx(f);
        f.pal.mut_slice(idx..idx + 1)[0][pl] = pal;
    } else {
        t.pal[pl] = pal;
    }
}

#[allow(clippy::too_many_arguments)]
fn read_pal_uv(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &BlockContext,
    b: &mut Av1Block,
    pass: u8,
    sz_ctx: usize,
    bx4: usize,
    by4: usize,
) {
    read_pal_plane(t, ts, f, a, b, pass, 1, sz_ctx, bx4, by4);

    // V plane coding
    let bpc = f.seq.bpc as u32;
    let n = b.pal_sz[1] as usize;
    let mut pal = [0u16; 8];
    if ts.msac.decode_bool(128 << 7) {
        let bits = bpc - 4 + ts.msac.decode_bools(2);
        let max = (1u32 << bpc) - 1;
        let mut prev = ts.msac.decode_bools(bpc) as u16;
        pal[0] = prev;
        for slot in pal.iter_mut().take(n).skip(1) {
            let mut delta = ts.msac.decode_bools(bits) as i32;
            if delta != 0 && ts.msac.decode_bool(128 << 7) {
                delta = -delta;
            }
            let v = ((prev as i32 + delta) & max as i32) as u16;
            prev = v;
            *slot = v;
        }
    } else {
        for slot in pal.iter_mut().take(n) {
            *slot = ts.msac.decode_bools(bpc) as u16;
        }
    }
    if pass != 0 {
        let idx = t.pal_record_idx(f);
        f.pal.mut_slice(idx..idx + 1)[0][2] = pal;
    } else {
        t.pal[2] = pal;
    }
}

/// Per-diagonal palette neighbor ordering: computes the context class and
/// symbol-to-entry remapping for every cell of wave-front diagonal `i`.
fn order_palette(
    pal_idx: &[u8],
    stride: usize,
    i: usize,
    first: usize,
    last: usize,
    order: &mut [[u8; 8]; 64],
    ctx: &mut [u8; 64],
) {
    let mut have_top = i > first;
    let mut off = first + (i - first) * stride;

    for (n, j) in (last..=first).rev().enumerate() {
        let have_left = j > 0;
        debug_assert!(have_left || have_top);

        let mut mask = 0u8;
        let mut o_idx = 0usize;
        let mut add = |v: u8, order: &mut [[u8; 8]; 64]| {
            debug_assert!(v < 8);
            order[n][o_idx] = v;
            o_idx += 1;
            mask |= 1 << v;
        };

        if !have_left {
            ctx[n] = 0;
            add(pal_idx[off - stride], order);
        } else if !have_top {
            ctx[n] = 0;
            add(pal_idx[off - 1], order);
        } else {
            let l = pal_idx[off - 1];
            let t = pal_idx[off - stride];
            let tl = pal_idx[off - stride - 1];
            let same_t_l = t == l;
            let same_t_tl = t == tl;
            let same_l_tl = l == tl;
            if same_t_l && same_t_tl && same_l_tl {
                ctx[n] = 4;
                add(t, order);
            } else if same_t_l {
                ctx[n] = 3;
                add(t, order);
                add(tl, order);
            } else if same_t_tl || same_l_tl {
                ctx[n] = 2;
                add(tl, order);
                add(if same_t_tl { l } else { t }, order);
            } else {
                ctx[n] = 1;
                add(t.min(l), order);
                add(t.max(l), order);
                add(tl, order);
            }
        }
        for bit in 0..8u8 {
            if mask & (1 << bit) == 0 {
                order[n][o_idx] = bit;
                o_idx += 1;
            }
        }
        debug_assert_eq!(o_idx, 8);

        have_top = true;
        off += stride;
        off -= 1;
    }
}

#[allow(clippy::too_many_arguments)]
fn read_pal_indices(
    ts: &mut TileState,
    pal_idx: &mut [u8],
    pal_sz: usize,
    pl: usize,
    w4: usize,
    h4: usize,
    bw4: usize,
    bh4: usize,
) {
    let stride = bw4 * 4;
    pal_idx[0] = ts.msac.decode_uniform(pal_sz as u32) as u8;
    let mut order = [[0u8; 8]; 64];
    let mut ctx = [0u8; 64];
    for i in 1..4 * (w4 + h4) - 1 {
        let first = i.min(w4 * 4 - 1);
        let last = (i as i64 - h4 as i64 * 4 + 1).max(0) as usize;
        order_palette(pal_idx, stride, i, first, last, &mut order, &mut ctx);
        for (m, j) in (last..=first).rev().enumerate() {
            let color_idx = ts.msac.decode_symbol_adapt(
                &mut ts.cdf.m.color_map[pl][pal_sz - 2][ctx[m] as usize],
                pal_sz,
            ) as usize;
            pal_idx[(i - j) * stride + j] = order[m][color_idx];
        }
    }
    // replicate into invisible cells beyond the frame edge
    if bw4 > w4 {
        for y in 0..4 * h4 {
            let last = pal_idx[y * stride + 4 * w4 - 1];
            pal_idx[y * stride + 4 * w4..y * stride + stride].fill(last);
        }
    }
    if h4 < bh4 {
        let (head, tail) = pal_idx.split_at_mut(stride * 4 * h4);
        let src = &head[stride * (4 * h4 - 1)..stride * 4 * h4];
        for y in 0..(bh4 - h4) * 4 {
            tail[y * stride..(y + 1) * stride].copy_from_slice(src);
        }
    }
}

fn read_vartx_tree(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    b: &mut Av1Block,
    bs: BlockSize,
    bx4: usize,
    by4: usize,
) {
    let b_dim = bs.dimensions();
    let bw4 = b_dim[0] as usize;
    let bh4 = b_dim[1] as usize;

    b.tx_split = [0; 2];
    b.max_ytx = max_ytx_for_bs(bs) as u8;
    let layout = f.seq.layout;
    let (ss_hor, ss_ver) = (layout.ss_hor(), layout.ss_ver());
    if f.hdr.segmentation.lossless[b.seg_id as usize] || b.max_ytx == TxSize::Tx4x4 as u8 {
        b.max_ytx = TxSize::Tx4x4 as u8;
        b.uvtx = TxSize::Tx4x4 as u8;
        if f.hdr.txfm_mode == TxfmMode::Switchable {
            a.tx[bx4..(bx4 + bw4).min(32)].fill(0);
            t.l.tx[by4..(by4 + bh4).min(32)].fill(0);
        }
    } else if f.hdr.txfm_mode != TxfmMode::Switchable || b.skip {
        if f.hdr.txfm_mode == TxfmMode::Switchable {
            a.tx[bx4..(bx4 + bw4).min(32)].fill(b_dim[2]);
            t.l.tx[by4..(by4 + bh4).min(32)].fill(b_dim[3]);
        }
        b.uvtx = max_uvtx_for_bs(bs, ss_hor, ss_ver) as u8;
    } else {
        let max_ytx = TxSize::from_u8(b.max_ytx);
        let ytx = max_ytx.info();
        let mut masks = b.tx_split;
        let mut y = 0;
        while y < bh4 {
            let mut x = 0;
            while x < bw4 {
                read_tx_tree(
                    t,
                    ts,
                    f,
                    a,
                    max_ytx,
                    0,
                    &mut masks,
                    (x / ytx.w as usize) as u32,
                    (y / ytx.h as usize) as u32,
                );
                t.bx += ytx.w as u32;
                x += ytx.w as usize;
            }
            t.bx -= bw4 as u32;
            t.by += ytx.h as u32;
            y += ytx.h as usize;
        }
        t.by -= bh4 as u32;
        b.tx_split = masks;
        b.uvtx = max_uvtx_for_bs(bs, ss_hor, ss_ver) as u8;
    }
}

impl TxSize {
    pub(crate) fn from_u8(v: u8) -> TxSize {
        use TxSize::*;
        const ALL: [TxSize; N_RECT_TX_SIZES] = [
            Tx4x4, Tx8x8, Tx16x16, Tx32x32, Tx64x64, Rtx4x8, Rtx8x4, Rtx8x16, Rtx16x8, Rtx16x32,
            Rtx32x16, Rtx32x64, Rtx64x32, Rtx4x16, Rtx16x4, Rtx8x32, Rtx32x8, Rtx16x64, Rtx64x16,
        ];
        ALL[v as usize]
    }
}

fn get_prev_frame_segid(
    f: &FrameContext,
    by: usize,
    bx: usize,
    w4: usize,
    h4: usize,
) -> Result<u8> {
    let Some(prev) = f.prev_segmap.as_ref() else {
        return Ok(0);
    };
    // the primary reference must have parsed at least this far
    if let Some(refp) = f
        .refp
        .get(f.hdr.primary_ref_frame as usize)
        .and_then(|p| p.as_ref())
    {
        refp.wait_progress(((by + h4) * 4) as u32, crate::thread::PlaneType::Block)?;
    }
    let stride = f.b4_stride;
    let mut seg_id = 8u8;
    for y in by..by + h4 {
        let row = prev.slice(y * stride + bx..y * stride + bx + w4);
        for &v in row.iter() {
            seg_id = seg_id.min(v);
        }
    }
    debug_assert!(seg_id < 8);
    Ok(seg_id)
}

struct SegCtx {
    seg_id: u8,
    seg_pred: bool,
}

#[allow(clippy::too_many_arguments)]
fn read_segment_id(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    w4: usize,
    h4: usize,
    have_top: bool,
    have_left: bool,
    skip: Option<bool>,
) -> Result<SegCtx> {
    let bx4 = (t.bx & 31) as usize;
    let by4 = (t.by & 31) as usize;
    let seg = &f.hdr.segmentation;

    if seg.temporal {
        let pred_ctx = (a.seg_pred[bx4] + t.l.seg_pred[by4]) as usize;
        if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.seg_pred[pred_ctx])
        {
            let seg_id = get_prev_frame_segid(f, t.by as usize, t.bx as usize, w4, h4)?;
            return Ok(SegCtx {
                seg_id,
                seg_pred: true,
            });
        }
    }

    let segmap = f.cur_segmap.as_ref().expect("segmentation map present");
    let (pred_seg_id, seg_ctx) = env::get_cur_frame_segid(
        t.by as usize,
        t.bx as usize,
        have_top,
        have_left,
        f.b4_stride,
        |pos| segmap.get(pos),
    );

    let seg_id = match skip {
        Some(true) => pred_seg_id,
        _ => {
            let diff = ts
                .msac
                .decode_symbol_adapt(&mut ts.cdf.m.seg_id[seg_ctx], NUM_SEGMENTS)
                as i32;
            let last_active = seg.last_active_segid as i32;
            let id = neg_deinterleave(diff, pred_seg_id as i32, last_active + 1);
            if id > last_active || id < 0 {
                return Err(Av1Error::InvalidBitstream("segment id out of range"));
            }
            id as u8
        }
    };
    Ok(SegCtx {
        seg_id,
        seg_pred: false,
    })
}

/// Decode one leaf block.
#[allow(clippy::too_many_arguments)]
pub fn decode_b(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    pass: u8,
    bl: BlockLevel,
    bs: BlockSize,
    bp: BlockPartition,
    intra_edge_flags: EdgeFlags,
) -> Result<()> {
    let b_dim = bs.dimensions();
    let bx4 = (t.bx & 31) as usize;
    let by4 = (t.by & 31) as usize;
    let layout = f.seq.layout;
    let ss_ver = (layout == PixelLayout::I420) as u32;
    let ss_hor = (layout != PixelLayout::I444) as u32;
    let cbx4 = bx4 >> ss_hor;
    let cby4 = by4 >> ss_ver;
    let bw4 = b_dim[0] as u32;
    let bh4 = b_dim[1] as u32;
    let w4 = bw4.min(f.bw4 - t.bx);
    let h4 = bh4.min(f.bh4 - t.by);
    let cbw4 = (bw4 + ss_hor) >> ss_hor;
    let cbh4 = (bh4 + ss_ver) >> ss_ver;
    let have_left = t.bx > ts.tiling.col_start;
    let have_top = t.by > ts.tiling.row_start;
    let has_chroma = layout.has_chroma()
        && (bw4 > ss_hor || t.bx & 1 != 0)
        && (bh4 > ss_ver || t.by & 1 != 0);
    let frame_is_inter = f.hdr.frame_type.is_inter_allowed();

    if pass == 2 {
        let blocks = f.blocks.as_ref().expect("pass-2 block records");
        let idx = t.by as usize * f.b4_stride + t.bx as usize;
        let b = blocks.slice(idx..idx + 1)[0];
        if b.intra {
            f.recon
                .recon_b_intra(f, t, ts, a, bs, intra_edge_flags, &b)?;
            if has_chroma {
                t.l.uvmode[cby4..cby4 + cbh4 as usize].fill(b.uv_mode);
                a.uvmode[cbx4..cbx4 + cbw4 as usize].fill(b.uv_mode);
            }
            let y_mode_nofilt = if b.y_mode == FILTER_PRED {
                DC_PRED
            } else {
                b.y_mode
            };
            t.l.mode[by4..by4 + bh4 as usize].fill(y_mode_nofilt);
            a.mode[bx4..bx4 + bw4 as usize].fill(y_mode_nofilt);
        } else {
            if b.comp_type == COMP_INTER_NONE && b.motion_mode == MM_WARP {
                let mut masks = [0u64; 2];
                find_matching_ref(
                    t,
                    ts,
                    f,
                    intra_edge_flags,
                    bw4,
                    bh4,
                    w4,
                    h4,
                    have_left,
                    have_top,
                    b.refs[0],
                    &mut masks,
                );
                derive_warpmv(t, f, bw4, bh4, &masks, b.mv[0]);
            }
            f.recon.recon_b_inter(f, t, ts, a, bs, &b)?;

            t.l.filter[0][by4..by4 + bh4 as usize].fill(b.filter[0]);
            a.filter[0][bx4..bx4 + bw4 as usize].fill(b.filter[0]);
            t.l.filter[1][by4..by4 + bh4 as usize].fill(b.filter[1]);
            a.filter[1][bx4..bx4 + bw4 as usize].fill(b.filter[1]);
            if has_chroma {
                t.l.uvmode[cby4..cby4 + cbh4 as usize].fill(DC_PRED);
                a.uvmode[cbx4..cbx4 + cbw4 as usize].fill(DC_PRED);
            }
        }
        t.l.intra[by4..by4 + bh4 as usize].fill(b.intra as u8);
        a.intra[bx4..bx4 + bw4 as usize].fill(b.intra as u8);
        return Ok(());
    }

    let cw4 = (w4 + ss_hor) >> ss_hor;
    let ch4 = (h4 + ss_ver) >> ss_ver;
    let mut b = Av1Block {
        bl: bl as u8,
        bp: bp as u8,
        bs: bs as u8,
        ..Default::default()
    };

    // skip_mode
    b.skip_mode = if f.hdr.skip_mode_enabled && bw4.min(bh4) > 1 {
        let smctx = (a.skip_mode[bx4] + t.l.skip_mode[by4]) as usize;
        ts.msac
            .decode_bool_adapt(&mut ts.cdf.m.skip_mode[smctx])
    } else {
        false
    };

    // segment_id, pre-skip branch
    let mut seg_pred = false;
    if f.hdr.segmentation.enabled {
        if !f.hdr.segmentation.update_map {
            b.seg_id = if f.prev_segmap.is_some() {
                get_prev_frame_segid(f, t.by as usize, t.bx as usize, w4 as usize, h4 as usize)?
            } else {
                0
            };
        } else if f.hdr.segmentation.preskip {
            let sc = read_segment_id(
                t,
                ts,
                f,
                a,
                w4 as usize,
                h4 as usize,
                have_top,
                have_left,
                None,
            )?;
            b.seg_id = sc.seg_id;
            seg_pred = sc.seg_pred;
        }
    } else {
        b.seg_id = 0;
    }

    // skip
    let sctx = (a.skip[bx4] + t.l.skip[by4]) as usize;
    b.skip = b.skip_mode || ts.msac.decode_bool_adapt(&mut ts.cdf.m.skip[sctx]);

    // segment_id, post-skip branch
    if f.hdr.segmentation.enabled
        && f.hdr.segmentation.update_map
        && !f.hdr.segmentation.preskip
    {
        let sc = read_segment_id(
            t,
            ts,
            f,
            a,
            w4 as usize,
            h4 as usize,
            have_top,
            have_left,
            Some(b.skip),
        )?;
        b.seg_id = sc.seg_id;
        seg_pred = sc.seg_pred;
    }

    // cdef index, once per 64x64 quadrant
    if !b.skip && f.seq.cdef && !f.hdr.coded_lossless && !f.hdr.allow_intrabc {
        let idx = if f.seq.sb128 {
            (((t.bx & 16) >> 4) + ((t.by & 16) >> 3)) as usize
        } else {
            t.cdef_quadrant
        };
        if t.cdef_idx[idx] == -1 {
            let v = ts.msac.decode_bools(f.hdr.cdef.n_bits) as i8;
            t.cdef_idx[idx] = v;
            if bw4 > 16 {
                t.cdef_idx[idx + 1] = v;
            }
            if bh4 > 16 {
                t.cdef_idx[idx + 2] = v;
            }
            if bw4 == 32 && bh4 == 32 {
                t.cdef_idx[idx + 3] = v;
            }
        }
    }

    // delta-q / delta-lf at superblock-aligned positions
    let sb_mask = 31 >> (!f.seq.sb128) as u32;
    if t.bx & sb_mask == 0 && t.by & sb_mask == 0 {
        let prev_qidx = ts.last_qidx;
        let sb_size = if f.seq.sb128 {
            BlockSize::Bs128x128
        } else {
            BlockSize::Bs64x64
        };
        let have_delta_q = f.hdr.delta.q.present && (bs != sb_size || !b.skip);
        let prev_delta_lf = ts.last_delta_lf;
        if have_delta_q {
            let mut delta_q = ts.msac.decode_symbol_adapt(&mut ts.cdf.m.delta_q, 4) as i32;
            if delta_q == 3 {
                let n_bits = 1 + ts.msac.decode_bools(3);
                delta_q = (ts.msac.decode_bools(n_bits) + 1 + (1 << n_bits)) as i32;
            }
            if delta_q != 0 {
                if ts.msac.decode_bool(128 << 7) {
                    delta_q = -delta_q;
                }
                delta_q *= 1 << f.hdr.delta.q.res_log2;
            }
            ts.last_qidx = (ts.last_qidx as i32 + delta_q).clamp(1, 255) as u8;

            if f.hdr.delta.lf.present {
                let n_lfs = if f.hdr.delta.lf.multi {
                    if layout != PixelLayout::I400 {
                        4
                    } else {
                        2
                    }
                } else {
                    1
                };
                for i in 0..n_lfs {
                    let cdf_idx = i + f.hdr.delta.lf.multi as usize;
                    let mut delta_lf =
                        ts.msac.decode_symbol_adapt(&mut ts.cdf.m.delta_lf[cdf_idx], 4) as i32;
                    if delta_lf == 3 {
                        let n_bits = 1 + ts.msac.decode_bools(3);
                        delta_lf = (ts.msac.decode_bools(n_bits) + 1 + (1 << n_bits)) as i32;
                    }
                    if delta_lf != 0 {
                        if ts.msac.decode_bool(128 << 7) {
                            delta_lf = -delta_lf;
                        }
                        delta_lf *= 1 << f.hdr.delta.lf.res_log2;
                    }
                    ts.last_delta_lf[i] =
                        (ts.last_delta_lf[i] as i32 + delta_lf).clamp(-63, 63) as i8;
                }
            }
        }
        if ts.last_qidx == f.hdr.quant.yac {
            ts.dq_custom = None;
        } else if ts.last_qidx != prev_qidx {
            ts.set_custom_dq(f, ts.last_qidx);
        }
        if ts.last_delta_lf == [0; 4] {
            ts.lflvl_custom = None;
        } else if ts.last_delta_lf != prev_delta_lf {
            ts.set_custom_lflvl(f);
        }
    }

    // intra/inter classification
    b.intra = if b.skip_mode {
        false
    } else if frame_is_inter {
        let ictx = env::get_intra_ctx(a, &t.l, by4, bx4, have_top, have_left);
        !ts.msac.decode_bool_adapt(&mut ts.cdf.m.intra[ictx])
    } else if f.hdr.allow_intrabc {
        !ts.msac.decode_bool_adapt(&mut ts.cdf.m.intrabc)
    } else {
        true
    };

    if b.intra {
        decode_b_intra(
            t, ts, f, a, pass, bs, intra_edge_flags, &mut b, bx4, by4, cbx4, cby4, bw4, bh4, w4,
            h4, cbw4, cbh4, cw4, ch4, has_chroma, frame_is_inter,
        )?;
    } else if !frame_is_inter {
        decode_b_intrabc(
            t, ts, f, a, pass, bs, bp, &mut b, bx4, by4, cbx4, cby4, bw4, bh4, cbw4, cbh4,
            has_chroma,
        )?;
    } else {
        decode_b_inter(
            t,
            ts,
            f,
            a,
            pass,
            bs,
            bp,
            intra_edge_flags,
            &mut b,
            bx4,
            by4,
            cbx4,
            cby4,
            bw4,
            bh4,
            w4,
            h4,
            cbw4,
            cbh4,
            have_top,
            have_left,
            has_chroma,
        )?;
    }

    // segmentation map writeback
    if f.hdr.segmentation.enabled && f.hdr.segmentation.update_map {
        let segmap = f.cur_segmap.as_ref().expect("segmentation map present");
        let stride = f.b4_stride;
        for y in 0..bh4 as usize {
            let row = (t.by as usize + y) * stride + t.bx as usize;
            let w = (bw4 as usize).min(stride - t.bx as usize);
            segmap.mut_slice(row..row + w).fill(b.seg_id);
        }
    }
    t.l.seg_pred[by4..by4 + bh4 as usize].fill(seg_pred as u8);
    a.seg_pred[bx4..bx4 + bw4 as usize].fill(seg_pred as u8);
    t.l.skip_mode[by4..by4 + bh4 as usize].fill(b.skip_mode as u8);
    a.skip_mode[bx4..bx4 + bw4 as usize].fill(b.skip_mode as u8);
    t.l.intra[by4..by4 + bh4 as usize].fill(b.intra as u8);
    a.intra[bx4..bx4 + bw4 as usize].fill(b.intra as u8);
    t.l.skip[by4..by4 + bh4 as usize].fill(b.skip as u8);
    a.skip[bx4..bx4 + bw4 as usize].fill(b.skip as u8);

    if b.skip {
        // a skipped block leaves no coefficients behind
        t.l.lcoef[by4..by4 + bh4 as usize].fill(0x40);
        a.lcoef[bx4..bx4 + bw4 as usize].fill(0x40);
        if has_chroma {
            for pl in 0..2 {
                t.l.ccoef[pl][cby4..cby4 + cbh4 as usize].fill(0x40);
                a.ccoef[pl][cbx4..cbx4 + cbw4 as usize].fill(0x40);
            }
        }
    } else {
        let mut lf_mask = f.lf_masks[t.lf_mask_idx(f)].lock();
        let mask = (((1u64 << bw4) - 1) << bx4) as u32;
        for y in 0..bh4 as usize {
            lf_mask.noskip_mask[by4 + y] |= mask;
        }
    }

    if pass == 1 {
        let blocks = f.blocks.as_ref().expect("pass-1 block records");
        let idx = t.by as usize * f.b4_stride + t.bx as usize;
        blocks.mut_slice(idx..idx + 1)[0] = b;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode_b_intra(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    pass: u8,
    bs: BlockSize,
    intra_edge_flags: EdgeFlags,
    b: &mut Av1Block,
    bx4: usize,
    by4: usize,
    cbx4: usize,
    cby4: usize,
    bw4: u32,
    bh4: u32,
    w4: u32,
    h4: u32,
    cbw4: u32,
    cbh4: u32,
    cw4: u32,
    ch4: u32,
    has_chroma: bool,
    frame_is_inter: bool,
) -> Result<()> {
    let b_dim = bs.dimensions();

    b.y_mode = if frame_is_inter {
        let cdf = &mut ts.cdf.m.y_mode[bs.size_group()];
        ts.msac.decode_symbol_adapt(cdf, N_INTRA_PRED_MODES)
    } else {
        let a_ctx = INTRA_MODE_CONTEXT[a.mode[bx4] as usize] as usize;
        let l_ctx = INTRA_MODE_CONTEXT[t.l.mode[by4] as usize] as usize;
        let cdf = &mut ts.cdf.kfym[a_ctx][l_ctx];
        ts.msac.decode_symbol_adapt(cdf, N_INTRA_PRED_MODES)
    };

    // angle delta for directional modes
    b.y_angle = if b_dim[2] + b_dim[3] >= 2 && b.y_mode >= VERT_PRED && b.y_mode <= VERT_LEFT_PRED
    {
        let acdf = &mut ts.cdf.m.angle_delta[(b.y_mode - VERT_PRED) as usize];
        ts.msac.decode_symbol_adapt(acdf, 7) as i8 - 3
    } else {
        0
    };

    if has_chroma {
        let cfl_allowed = cfl_allowed(bs);
        let cdf = &mut ts.cdf.m.uv_mode[cfl_allowed as usize][b.y_mode as usize];
        b.uv_mode = ts
            .msac
            .decode_symbol_adapt(cdf, N_UV_INTRA_PRED_MODES - (!cfl_allowed) as usize);

        if b.uv_mode == CFL_PRED as u8 && cfl_allowed {
            let sign = ts.msac.decode_symbol_adapt(&mut ts.cdf.m.cfl_sign, 8) as u32 + 1;
            let sign_u = sign * 0x56 >> 8;
            let sign_v = sign - sign_u * 3;
            b.cfl_alpha[0] = if sign_u != 0 {
                let ctx = ((sign_u == 2) as usize) * 3 + sign_v as usize;
                let alpha =
                    ts.msac.decode_symbol_adapt(&mut ts.cdf.m.cfl_alpha[ctx], 16) as i8 + 1;
                if sign_u == 1 {
                    -alpha
                } else {
                    alpha
                }
            } else {
                0
            };
            b.cfl_alpha[1] = if sign_v != 0 {
                let ctx = ((sign_v == 2) as usize) * 3 + sign_u as usize;
                let alpha =
                    ts.msac.decode_symbol_adapt(&mut ts.cdf.m.cfl_alpha[ctx], 16) as i8 + 1;
                if sign_v == 1 {
                    -alpha
                } else {
                    alpha
                }
            } else {
                0
            };
        } else if b_dim[2] + b_dim[3] >= 2
            && b.uv_mode >= VERT_PRED
            && b.uv_mode <= VERT_LEFT_PRED
        {
            let acdf = &mut ts.cdf.m.angle_delta[(b.uv_mode - VERT_PRED) as usize];
            b.uv_angle = ts.msac.decode_symbol_adapt(acdf, 7) as i8 - 3;
        }
    }

    b.pal_sz = [0, 0];
    if f.hdr.allow_screen_content_tools && bw4.max(bh4) <= 16 && bw4 + bh4 >= 4 {
        let sz_ctx = (b_dim[2] + b_dim[3] - 2) as usize;
        if b.y_mode == DC_PRED {
            let pal_ctx =
                (a.pal_sz[bx4] > 0) as usize + (t.l.pal_sz[by4] > 0) as usize;
            if ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.pal_y[sz_ctx][pal_ctx])
            {
                read_pal_plane(t, ts, f, a, b, pass, 0, sz_ctx, bx4, by4);
            }
        }
        if has_chroma && b.uv_mode == DC_PRED {
            let pal_ctx = (b.pal_sz[0] > 0) as usize;
            if ts.msac.decode_bool_adapt(&mut ts.cdf.m.pal_uv[pal_ctx]) {
                read_pal_uv(t, ts, f, a, b, pass, sz_ctx, bx4, by4);
            }
        }
    }

    if b.y_mode == DC_PRED
        && b.pal_sz[0] == 0
        && b_dim[2].max(b_dim[3]) <= 3
        && f.seq.filter_intra
    {
        if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.use_filter_intra[bs as usize])
        {
            b.y_mode = FILTER_PRED;
            b.y_angle = ts.msac.decode_symbol_adapt(&mut ts.cdf.m.filter_intra, 5) as i8;
        }
    }

    if b.pal_sz[0] > 0 {
        let (luma_len, _) = t.pal_idx_lens(bw4, bh4, cbw4, cbh4);
        if pass != 0 {
            let base = ts.pal_idx_cursor;
            ts.pal_idx_cursor += luma_len;
            let mut guard = f.pal_idx.mut_slice(base..base + luma_len);
            read_pal_indices(
                ts,
                &mut guard,
                b.pal_sz[0] as usize,
                0,
                w4 as usize,
                h4 as usize,
                bw4 as usize,
                bh4 as usize,
            );
        } else {
            let mut scratch = std::mem::take(&mut t.pal_idx_scratch);
            read_pal_indices(
                ts,
                &mut scratch[..luma_len],
                b.pal_sz[0] as usize,
                0,
                w4 as usize,
                h4 as usize,
                bw4 as usize,
                bh4 as usize,
            );
            t.pal_idx_scratch = scratch;
        }
    }
    if has_chroma && b.pal_sz[1] > 0 {
        let (luma_len, chroma_len) = t.pal_idx_lens(bw4, bh4, cbw4, cbh4);
        if pass != 0 {
            let base = ts.pal_idx_cursor;
            ts.pal_idx_cursor += chroma_len;
            let mut guard = f.pal_idx.mut_slice(base..base + chroma_len);
            read_pal_indices(
                ts,
                &mut guard,
                b.pal_sz[1] as usize,
                1,
                cw4 as usize,
                ch4 as usize,
                cbw4 as usize,
                cbh4 as usize,
            );
        } else {
            let mut scratch = std::mem::take(&mut t.pal_idx_scratch);
            read_pal_indices(
                ts,
                &mut scratch[luma_len..luma_len + chroma_len],
                b.pal_sz[1] as usize,
                1,
                cw4 as usize,
                ch4 as usize,
                cbw4 as usize,
                cbh4 as usize,
            );
            t.pal_idx_scratch = scratch;
        }
    }

    let t_dim;
    if f.hdr.segmentation.lossless[b.seg_id as usize] {
        b.tx = TxSize::Tx4x4 as u8;
        b.uvtx = TxSize::Tx4x4 as u8;
        t_dim = TxSize::Tx4x4.info();
    } else {
        let mut tx = max_ytx_for_bs(bs);
        b.uvtx = max_uvtx_for_bs(bs, f.seq.layout.ss_hor(), f.seq.layout.ss_ver()) as u8;
        let mut dim = tx.info();
        if f.hdr.txfm_mode == TxfmMode::Switchable && dim.max > 0 {
            let tctx = env::get_tx_ctx(a, &t.l, &dim, by4, bx4);
            let tx_cdf = &mut ts.cdf.m.txsz[(dim.max - 1) as usize][tctx];
            let mut depth = ts
                .msac
                .decode_symbol_adapt(tx_cdf, (dim.max as usize + 1).min(3))
                as i32;
            while depth > 0 {
                tx = dim.sub;
                dim = tx.info();
                depth -= 1;
            }
        }
        b.tx = tx as u8;
        t_dim = dim;
    }

    if pass == 1 {
        f.recon.read_coef_blocks(f, t, ts, a, bs, b)?;
    } else {
        f.recon.recon_b_intra(f, t, ts, a, bs, intra_edge_flags, b)?;
    }

    crate::tile::fill_lf_tx_strips(t, a, b, bx4, by4, cbx4, cby4, has_chroma);

    // context updates
    a.tx_intra[bx4..bx4 + bw4 as usize].fill(t_dim.lw as i8);
    t.l.tx_intra[by4..by4 + bh4 as usize].fill(t_dim.lh as i8);
    let y_mode_nofilt = if b.y_mode == FILTER_PRED {
        DC_PRED
    } else {
        b.y_mode
    };
    t.l.mode[by4..by4 + bh4 as usize].fill(y_mode_nofilt);
    a.mode[bx4..bx4 + bw4 as usize].fill(y_mode_nofilt);
    t.l.pal_sz[by4..by4 + bh4 as usize].fill(b.pal_sz[0]);
    a.pal_sz[bx4..bx4 + bw4 as usize].fill(b.pal_sz[0]);
    if b.pal_sz[0] > 0 {
        let pal = if pass != 0 {
            f.pal.slice(t.pal_record_idx(f)..t.pal_record_idx(f) + 1)[0][0]
        } else {
            t.pal[0]
        };
        for x in 0..bw4 as usize {
            t.al_pal[0][bx4 + x][0] = pal;
        }
        for y in 0..bh4 as usize {
            t.al_pal[1][by4 + y][0] = pal;
        }
    }
    if has_chroma {
        t.l.uvmode[cby4..cby4 + cbh4 as usize].fill(b.uv_mode);
        a.uvmode[cbx4..cbx4 + cbw4 as usize].fill(b.uv_mode);
        // chroma palettes are tracked in luma coordinates
        t.pal_sz_uv[1][by4..by4 + bh4 as usize].fill(b.pal_sz[1]);
        t.pal_sz_uv[0][bx4..bx4 + bw4 as usize].fill(b.pal_sz[1]);
        if b.pal_sz[1] > 0 {
            for pl in 1..3 {
                let pal = if pass != 0 {
                    f.pal.slice(t.pal_record_idx(f)..t.pal_record_idx(f) + 1)[0][pl]
                } else {
                    t.pal[pl]
                };
                for x in 0..bw4 as usize {
                    t.al_pal[0][bx4 + x][pl] = pal;
                }
                for y in 0..bh4 as usize {
                    t.al_pal[1][by4 + y][pl] = pal;
                }
            }
        }
    } else {
        t.pal_sz_uv[1][by4..by4 + bh4 as usize].fill(0);
        t.pal_sz_uv[0][bx4..bx4 + bw4 as usize].fill(0);
    }

    if frame_is_inter || f.hdr.allow_intrabc {
        a.tx[bx4..bx4 + bw4 as usize].fill(t_dim.lw);
        t.l.tx[by4..by4 + bh4 as usize].fill(t_dim.lh);
        if let Some(mvs) = f.mvs.as_ref() {
            splat_intraref(
                mvs,
                f.b4_stride,
                t.by as usize,
                t.bx as usize,
                bs,
                y_mode_nofilt,
            );
        }
    }
    if frame_is_inter {
        t.l.comp_type[by4..by4 + bh4 as usize].fill(COMP_INTER_NONE);
        a.comp_type[bx4..bx4 + bw4 as usize].fill(COMP_INTER_NONE);
        t.l.ref_frame[0][by4..by4 + bh4 as usize].fill(-1);
        a.ref_frame[0][bx4..bx4 + bw4 as usize].fill(-1);
        t.l.ref_frame[1][by4..by4 + bh4 as usize].fill(-1);
        a.ref_frame[1][bx4..bx4 + bw4 as usize].fill(-1);
        for dir in 0..2 {
            t.l.filter[dir][by4..by4 + bh4 as usize].fill(N_SWITCHABLE_FILTERS as u8);
            a.filter[dir][bx4..bx4 + bw4 as usize].fill(N_SWITCHABLE_FILTERS as u8);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode_b_intrabc(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    pass: u8,
    bs: BlockSize,
    _bp: BlockPartition,
    b: &mut Av1Block,
    bx4: usize,
    by4: usize,
    cbx4: usize,
    cby4: usize,
    bw4: u32,
    bh4: u32,
    cbw4: u32,
    cbh4: u32,
    has_chroma: bool,
) -> Result<()> {
    let b_dim = bs.dimensions();
    let res = find_ref_mvs(
        [-1, -1],
        bs,
        t.by,
        t.bx,
        ts.tiling,
        &t.refmv_view(f),
    );

    b.mv[0] = if res.mvlist[0][0].is_valid() && !res.mvlist[0][0].is_zero() {
        res.mvlist[0][0]
    } else if res.mvlist[0][1].is_valid() && !res.mvlist[0][1].is_zero() {
        res.mvlist[0][1]
    } else if (t.by as i32) - (16 << f.seq.sb128 as i32) < ts.tiling.row_start as i32 {
        Mv {
            y: 0,
            x: (-(512 << f.seq.sb128 as i32) - 2048) as i16,
        }
    } else {
        Mv {
            y: (-(512 << f.seq.sb128 as i32)) as i16,
            x: 0,
        }
    };

    read_mv_residual(ts, &mut b.mv[0], true, false, false);
    b.refs = [-1, -1];
    read_vartx_tree(t, ts, f, a, b, bs, bx4, by4);

    if pass == 1 {
        f.recon.read_coef_blocks(f, t, ts, a, bs, b)?;
    } else {
        f.recon.recon_b_inter(f, t, ts, a, bs, b)?;
    }

    if let Some(mvs) = f.mvs.as_ref() {
        splat_intrabc_mv(mvs, f.b4_stride, t.by as usize, t.bx as usize, bs, b.mv[0]);
    }

    a.tx_intra[bx4..bx4 + bw4 as usize].fill(b_dim[2] as i8);
    t.l.tx_intra[by4..by4 + bh4 as usize].fill(b_dim[3] as i8);
    t.l.mode[by4..by4 + bh4 as usize].fill(DC_PRED);
    a.mode[bx4..bx4 + bw4 as usize].fill(DC_PRED);
    t.l.pal_sz[by4..by4 + bh4 as usize].fill(0);
    a.pal_sz[bx4..bx4 + bw4 as usize].fill(0);
    // chroma palette state is tracked in luma coordinates
    t.pal_sz_uv[1][by4..by4 + bh4 as usize].fill(0);
    t.pal_sz_uv[0][bx4..bx4 + bw4 as usize].fill(0);
    if has_chroma {
        t.l.uvmode[cby4..cby4 + cbh4 as usize].fill(DC_PRED);
        a.uvmode[cbx4..cbx4 + cbw4 as usize].fill(DC_PRED);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn decode_b_inter(
    t: &mut TileContext,
    ts: &mut TileState,
    f: &FrameContext,
    a: &mut BlockContext,
    pass: u8,
    bs: BlockSize,
    _bp: BlockPartition,
    intra_edge_flags: EdgeFlags,
    b: &mut Av1Block,
    bx4: usize,
    by4: usize,
    cbx4: usize,
    cby4: usize,
    bw4: u32,
    bh4: u32,
    w4: u32,
    h4: u32,
    cbw4: u32,
    cbh4: u32,
    have_top: bool,
    have_left: bool,
    has_chroma: bool,
) -> Result<()> {
    let is_comp;
    let mut has_subpel_filter;

    if b.skip_mode {
        is_comp = true;
    } else if f.hdr.switchable_comp_refs && bw4.min(bh4) > 1 {
        let ctx = env::get_comp_ctx(a, &t.l, by4, bx4, have_top, have_left);
        is_comp = ts.msac.decode_bool_adapt(&mut ts.cdf.m.comp[ctx]);
    } else {
        is_comp = false;
    }

    if b.skip_mode {
        b.refs = f.hdr.skip_mode_refs;
        b.comp_type = COMP_INTER_AVG;
        b.inter_mode = NEARESTMV_NEARESTMV;
        b.drl_idx = 0;
        has_subpel_filter = false;

        let res = find_ref_mvs(b.refs, bs, t.by, t.bx, ts.tiling, &t.refmv_view(f));
        b.mv[0] = res.stack[0].this_mv;
        b.mv[1] = res.stack[0].comp_mv;
        if !f.hdr.hp {
            env::unset_hp_bit(&mut b.mv[0]);
            env::unset_hp_bit(&mut b.mv[1]);
        }
    } else if is_comp {
        let dir_ctx = env::get_comp_dir_ctx(a, &t.l, by4, bx4, have_top, have_left);
        let counts = env::RefCounts::gather(a, &t.l, by4, bx4, have_top, have_left);
        if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.comp_dir[dir_ctx])
        {
            // bidirectional: forward reference
            let ctx1 = counts.comp_fwd_p0();
            if ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.comp_fwd_ref[0][ctx1])
            {
                let ctx2 = counts.comp_fwd_p2();
                b.refs[0] = 2 + ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.comp_fwd_ref[2][ctx2])
                    as i8;
            } else {
                let ctx2 = counts.comp_fwd_p1();
                b.refs[0] = ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.comp_fwd_ref[1][ctx2])
                    as i8;
            }
            // backward reference
            let ctx3 = counts.comp_bwd_p0();
            if ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.comp_bwd_ref[0][ctx3])
            {
                b.refs[1] = 6;
            } else {
                let ctx4 = counts.comp_bwd_p1();
                b.refs[1] = 4 + ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.comp_bwd_ref[1][ctx4])
                    as i8;
            }
        } else {
            // unidirectional
            let uctx = counts.uni_p();
            if ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.comp_uni_ref[0][uctx])
            {
                b.refs = [4, 6];
            } else {
                let uctx1 = counts.uni_p1();
                b.refs[0] = 0;
                b.refs[1] = 1 + ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.comp_uni_ref[1][uctx1])
                    as i8;
                if b.refs[1] == 2 {
                    let uctx2 = counts.uni_p2();
                    b.refs[1] += ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.comp_uni_ref[2][uctx2])
                        as i8;
                }
            }
        }

        let res = find_ref_mvs(b.refs, bs, t.by, t.bx, ts.tiling, &t.refmv_view(f));
        let ctx = res.ctx as usize;
        b.inter_mode = ts.msac.decode_symbol_adapt(
            &mut ts.cdf.m.comp_inter_mode[ctx & 7],
            N_COMP_INTER_PRED_MODES,
        );

        let im = COMP_INTER_PRED_MODES[b.inter_mode as usize];
        b.drl_idx = 0;
        if b.inter_mode == NEWMV_NEWMV {
            if res.n_mvs > 1 {
                let drl_ctx = env::get_drl_context(&res.stack, 0);
                b.drl_idx += ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx]) as u8;
                if b.drl_idx == 1 && res.n_mvs > 2 {
                    let drl_ctx = env::get_drl_context(&res.stack, 1);
                    b.drl_idx += ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx])
                        as u8;
                }
            }
        } else if im[0] == NEARMV || im[1] == NEARMV {
            b.drl_idx = 1;
            if res.n_mvs > 2 {
                let drl_ctx = env::get_drl_context(&res.stack, 1);
                b.drl_idx += ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx]) as u8;
                if b.drl_idx == 2 && res.n_mvs > 3 {
                    let drl_ctx = env::get_drl_context(&res.stack, 2);
                    b.drl_idx += ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx])
                        as u8;
                }
            }
        }

        has_subpel_filter = bw4.min(bh4) == 1 || b.inter_mode != GLOBALMV_GLOBALMV;
        for idx in 0..2 {
            let mv = match im[idx] {
                m if m == NEARESTMV || m == NEARMV => {
                    let mut mv = if idx == 0 {
                        res.stack[b.drl_idx as usize].this_mv
                    } else {
                        res.stack[b.drl_idx as usize].comp_mv
                    };
                    if !f.hdr.hp {
                        env::unset_hp_bit(&mut mv);
                    }
                    mv
                }
                m if m == GLOBALMV => {
                    has_subpel_filter |= f.hdr.gmv[b.refs[idx] as usize].wm_type
                        == WarpType::Translation;
                    env::get_gmv_2d(
                        &f.hdr.gmv[b.refs[idx] as usize],
                        t.bx,
                        t.by,
                        bw4,
                        bh4,
                        f.hdr.hp,
                        f.hdr.force_integer_mv,
                    )
                }
                _ => {
                    let mut mv = if idx == 0 {
                        res.stack[b.drl_idx as usize].this_mv
                    } else {
                        res.stack[b.drl_idx as usize].comp_mv
                    };
                    read_mv_residual(ts, &mut mv, false, !f.hdr.force_integer_mv, f.hdr.hp);
                    mv
                }
            };
            b.mv[idx] = mv;
        }

        // joint-weighted vs. segmented vs. wedge compound
        let mut is_segwedge = false;
        if f.seq.masked_compound {
            let mask_ctx = env::get_mask_comp_ctx(a, &t.l, by4, bx4);
            is_segwedge = ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.mask_comp[mask_ctx]);
        }

        if !is_segwedge {
            if f.seq.jnt_comp {
                let jnt_ctx = env::get_jnt_comp_ctx(
                    f.seq.order_hint_n_bits,
                    f.cur_poc,
                    f.refpoc[b.refs[0] as usize],
                    f.refpoc[b.refs[1] as usize],
                    a,
                    &t.l,
                    by4,
                    bx4,
                );
                b.comp_type = COMP_INTER_WEIGHTED_AVG
                    + ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.jnt_comp[jnt_ctx]) as u8;
            } else {
                b.comp_type = COMP_INTER_AVG;
            }
        } else {
            if wedge_allowed(bs) {
                let ctx = wedge_ctx(bs);
                b.comp_type = COMP_INTER_WEDGE
                    - ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.wedge_comp[ctx]) as u8;
                if b.comp_type == COMP_INTER_WEDGE {
                    b.wedge_idx = ts
                        .msac
                        .decode_symbol_adapt(&mut ts.cdf.m.wedge_idx[ctx], 16);
                }
            } else {
                b.comp_type = COMP_INTER_SEG;
            }
            b.mask_sign = ts.msac.decode_bool(128 << 7);
        }
    } else {
        b.comp_type = COMP_INTER_NONE;

        // single reference, 6-way tree
        let counts = env::RefCounts::gather(a, &t.l, by4, bx4, have_top, have_left);
        if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.ref_bit[0][counts.single_p1()])
        {
            if ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.ref_bit[1][counts.single_p2()])
            {
                b.refs[0] = 6;
            } else {
                b.refs[0] = 4 + ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.ref_bit[5][counts.single_p6()])
                    as i8;
            }
        } else if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.ref_bit[2][counts.single_p3()])
        {
            b.refs[0] = 2 + ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.ref_bit[4][counts.single_p5()])
                as i8;
        } else {
            b.refs[0] = ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.ref_bit[3][counts.single_p4()])
                as i8;
        }
        b.refs[1] = -1;

        let res = find_ref_mvs(
            [b.refs[0], -1],
            bs,
            t.by,
            t.bx,
            ts.tiling,
            &t.refmv_view(f),
        );
        let ctx = res.ctx as usize;

        // mode parsing and mv derivation from the candidate stack
        if ts
            .msac
            .decode_bool_adapt(&mut ts.cdf.m.newmv_mode[ctx & 7])
        {
            if !ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.globalmv_mode[(ctx >> 3) & 1])
            {
                b.inter_mode = GLOBALMV;
                b.mv[0] = env::get_gmv_2d(
                    &f.hdr.gmv[b.refs[0] as usize],
                    t.bx,
                    t.by,
                    bw4,
                    bh4,
                    f.hdr.hp,
                    f.hdr.force_integer_mv,
                );
                has_subpel_filter = bw4.min(bh4) == 1
                    || f.hdr.gmv[b.refs[0] as usize].wm_type == WarpType::Translation;
            } else {
                has_subpel_filter = true;
                if ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.refmv_mode[(ctx >> 4) & 15])
                {
                    b.inter_mode = NEARMV;
                    b.drl_idx = 1;
                    if res.n_mvs > 2 {
                        let drl_ctx = env::get_drl_context(&res.stack, 1);
                        b.drl_idx += ts
                            .msac
                            .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx])
                            as u8;
                        if b.drl_idx == 2 && res.n_mvs > 3 {
                            let drl_ctx = env::get_drl_context(&res.stack, 2);
                            b.drl_idx += ts
                                .msac
                                .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx])
                                as u8;
                        }
                    }
                } else {
                    b.inter_mode = NEARESTMV;
                    b.drl_idx = 0;
                }
                if b.drl_idx >= 2 {
                    b.mv[0] = res.stack[b.drl_idx as usize].this_mv;
                } else {
                    b.mv[0] = res.mvlist[0][b.drl_idx as usize];
                    if !f.hdr.hp {
                        env::unset_hp_bit(&mut b.mv[0]);
                    }
                }
            }
        } else {
            has_subpel_filter = true;
            b.inter_mode = NEWMV;
            b.drl_idx = 0;
            if res.n_mvs > 1 {
                let drl_ctx = env::get_drl_context(&res.stack, 0);
                b.drl_idx += ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx]) as u8;
                if b.drl_idx == 1 && res.n_mvs > 2 {
                    let drl_ctx = env::get_drl_context(&res.stack, 1);
                    b.drl_idx += ts
                        .msac
                        .decode_bool_adapt(&mut ts.cdf.m.drl_bit[drl_ctx])
                        as u8;
                }
            }
            b.mv[0] = if res.n_mvs > 1 {
                res.stack[b.drl_idx as usize].this_mv
            } else {
                let mut mv = res.mvlist[0][0];
                if !f.hdr.hp {
                    env::unset_hp_bit(&mut mv);
                }
                mv
            };
            read_mv_residual(ts, &mut b.mv[0], false, !f.hdr.force_integer_mv, f.hdr.hp);
        }

        // interintra flags
        let ii_sz_grp = bs.size_group();
        if f.seq.inter_intra
            && interintra_allowed(bs)
            && ts
                .msac
                .decode_bool_adapt(&mut ts.cdf.m.interintra[ii_sz_grp])
        {
            b.interintra_mode = ts.msac.decode_symbol_adapt(
                &mut ts.cdf.m.interintra_mode[ii_sz_grp],
                N_INTER_INTRA_PRED_MODES,
            );
            let wctx = wedge_ctx(bs);
            b.interintra_type = INTER_INTRA_BLEND
                + ts
                    .msac
                    .decode_bool_adapt(&mut ts.cdf.m.interintra_wedge[wctx])
                    as u8;
            if b.interintra_type == INTER_INTRA_WEDGE {
                b.wedge_idx = ts
                    .msac
                    .decode_symbol_adapt(&mut ts.cdf.m.wedge_idx[wctx], 16);
            }
        } else {
            b.interintra_type = INTER_INTRA_NONE;
        }

        // motion variation
        if f.hdr.switchable_motion_mode
            && b.interintra_type == INTER_INTRA_NONE
            && bw4.min(bh4) >= 2
            // not already warped by global motion
            && !(!f.hdr.force_integer_mv
                && b.inter_mode == GLOBALMV
                && f.hdr.gmv[b.refs[0] as usize].wm_type as u8 > WarpType::Translation as u8)
            // has overlappable neighbors
            && ((have_left && findoddzero(&t.l.intra[by4 + 1..by4 + (h4 as usize)]))
                || (have_top && findoddzero(&a.intra[bx4 + 1..bx4 + (w4 as usize)])))
        {
            let mut masks = [0u64; 2];
            find_matching_ref(
                t,
                ts,
                f,
                intra_edge_flags,
                bw4,
                bh4,
                w4,
                h4,
                have_left,
                have_top,
                b.refs[0],
                &mut masks,
            );
            let allow_warp = !f.hdr.force_integer_mv
                && f.hdr.warp_motion
                && (masks[0] | masks[1]) != 0;

            b.motion_mode = if allow_warp {
                ts.msac
                    .decode_symbol_adapt(&mut ts.cdf.m.motion_mode[bs as usize], 3)
            } else {
                ts.msac.decode_bool_adapt(&mut ts.cdf.m.obmc[bs as usize]) as u8
            };
            if b.motion_mode == MM_WARP {
                has_subpel_filter = false;
                derive_warpmv(t, f, bw4, bh4, &masks, b.mv[0]);
            }
        } else {
            b.motion_mode = MM_TRANSLATION;
        }
    }

    // subpel filter
    let filter: [u8; 2] = if f.hdr.subpel_filter_switchable {
        if has_subpel_filter {
            let comp = b.comp_type != COMP_INTER_NONE;
            let ctx1 = env::get_filter_ctx(a, &t.l, comp, 0, b.refs[0], by4, bx4);
            let f0 = ts.msac.decode_symbol_adapt(
                &mut ts.cdf.m.filter[0][ctx1],
                N_SWITCHABLE_FILTERS,
            );
            if f.seq.dual_filter {
                let ctx2 = env::get_filter_ctx(a, &t.l, comp, 1, b.refs[0], by4, bx4);
                let f1 = ts.msac.decode_symbol_adapt(
                    &mut ts.cdf.m.filter[1][ctx2],
                    N_SWITCHABLE_FILTERS,
                );
                [f0, f1]
            } else {
                [f0, f0]
            }
        } else {
            [FILTER_8TAP_REGULAR; 2]
        }
    } else {
        [f.hdr.subpel_filter_mode; 2]
    };
    b.filter = filter;

    read_vartx_tree(t, ts, f, a, b, bs, bx4, by4);

    if pass == 1 {
        f.recon.read_coef_blocks(f, t, ts, a, bs, b)?;
    } else {
        f.recon.recon_b_inter(f, t, ts, a, bs, b)?;
    }

    crate::tile::fill_lf_tx_strips(t, a, b, bx4, by4, cbx4, cby4, has_chroma);

    // context updates
    if let Some(mvs) = f.mvs.as_ref() {
        if is_comp {
            splat_tworef_mv(
                mvs,
                f.b4_stride,
                t.by as usize,
                t.bx as usize,
                bs,
                b.inter_mode,
                b.refs,
                [b.mv[0], b.mv[1]],
            );
        } else {
            splat_oneref_mv(
                mvs,
                f.b4_stride,
                t.by as usize,
                t.bx as usize,
                bs,
                b.inter_mode,
                b.refs[0],
                b.mv[0],
                b.interintra_type != INTER_INTRA_NONE,
            );
        }
    }
    t.l.pal_sz[by4..by4 + bh4 as usize].fill(0);
    a.pal_sz[bx4..bx4 + bw4 as usize].fill(0);
    // chroma palette state is tracked in luma coordinates
    t.pal_sz_uv[1][by4..by4 + bh4 as usize].fill(0);
    t.pal_sz_uv[0][bx4..bx4 + bw4 as usize].fill(0);
    if has_chroma {
        t.l.uvmode[cby4..cby4 + cbh4 as usize].fill(DC_PRED);
        a.uvmode[cbx4..cbx4 + cbw4 as usize].fill(DC_PRED);
    }
    let b_dim = bs.dimensions();
    a.tx_intra[bx4..bx4 + bw4 as usize].fill(b_dim[2] as i8);
    t.l.tx_intra[by4..by4 + bh4 as usize].fill(b_dim[3] as i8);
    t.l.comp_type[by4..by4 + bh4 as usize].fill(b.comp_type);
    a.comp_type[bx4..bx4 + bw4 as usize].fill(b.comp_type);
    for dir in 0..2 {
        t.l.filter[dir][by4..by4 + bh4 as usize].fill(filter[dir]);
        a.filter[dir][bx4..bx4 + bw4 as usize].fill(filter[dir]);
    }
    t.l.mode[by4..by4 + bh4 as usize].fill(b.inter_mode);
    a.mode[bx4..bx4 + bw4 as usize].fill(b.inter_mode);
    t.l.ref_frame[0][by4..by4 + bh4 as usize].fill(b.refs[0]);
    a.ref_frame[0][bx4..bx4 + bw4 as usize].fill(b.refs[0]);
    t.l.ref_frame[1][by4..by4 + bh4 as usize].fill(b.refs[1]);
    a.ref_frame[1][bx4..bx4 + bw4 as usize].fill(b.refs[1]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neg_deinterleave() {
        // no reference: identity
        assert_eq!(neg_deinterleave(3, 0, 8), 3);
        // reference at the top of the range mirrors
        assert_eq!(neg_deinterleave(0, 7, 8), 7);
        assert_eq!(neg_deinterleave(1, 7, 8), 6);
        // small reference: odd diffs go up, even go down
        assert_eq!(neg_deinterleave(0, 2, 8), 2);
        assert_eq!(neg_deinterleave(1, 2, 8), 3);
        assert_eq!(neg_deinterleave(2, 2, 8), 1);
        assert_eq!(neg_deinterleave(3, 2, 8), 4);
        assert_eq!(neg_deinterleave(4, 2, 8), 0);
        assert_eq!(neg_deinterleave(5, 2, 8), 5);
    }

    #[test]
    fn test_findoddzero() {
        // only even offsets within the passed slice are examined
        assert!(findoddzero(&[0, 1, 1, 1]));
        assert!(!findoddzero(&[1, 0, 1, 0]));
        assert!(!findoddzero(&[]));
    }

    #[test]
    fn test_order_palette_contexts() {
        // 4x4 map, stride 4, all neighbors equal
        let mut pal_idx = [0u8; 16];
        pal_idx[0] = 2;
        pal_idx[1] = 2;
        pal_idx[4] = 2;
        let mut order = [[0u8; 8]; 64];
        let mut ctx = [0u8; 64];
        // diagonal 2 contains cell (1,1) with top=left=topleft=2
        order_palette(&pal_idx, 4, 2, 1, 1, &mut order, &mut ctx);
        assert_eq!(ctx[0], 4);
        assert_eq!(order[0][0], 2);
        // remaining entries ascend, skipping the emitted one
        assert_eq!(order[0][1], 0);
        assert_eq!(order[0][2], 1);
        assert_eq!(order[0][3], 3);
    }

    #[test]
    fn test_order_palette_distinct_neighbors() {
        let mut pal_idx = [0u8; 16];
        pal_idx[0] = 3; // topleft
        pal_idx[1] = 1; // top
        pal_idx[4] = 2; // left
        let mut order = [[0u8; 8]; 64];
        let mut ctx = [0u8; 64];
        order_palette(&pal_idx, 4, 2, 1, 1, &mut order, &mut ctx);
        assert_eq!(ctx[0], 1);
        assert_eq!(order[0][0], 1); // min(top, left)
        assert_eq!(order[0][1], 2); // max(top, left)
        assert_eq!(order[0][2], 3); // topleft
        assert_eq!(order[0][3], 0);
    }
}
