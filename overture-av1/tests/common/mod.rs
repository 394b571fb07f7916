//! Test-side bitstream construction: a range encoder matching the
//! decoder's coder, plus OBU/header writers mirroring the parsed syntax.

#![allow(dead_code)]

use overture_av1::cdf::CdfContext;
use overture_av1::env::{gather_left_partition_prob, gather_top_partition_prob};
use overture_av1::tables::BlockLevel;
use overture_core::BitWriter;

const EC_PROB_SHIFT: u32 = 6;
const EC_MIN_PROB: u32 = 4;

/// Multisymbol range encoder compatible with the decoder.
pub struct MsacEncoder {
    low: u64,
    rng: u16,
    cnt: i16,
    precarry: Vec<u16>,
    pub allow_update_cdf: bool,
}

impl Default for MsacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MsacEncoder {
    pub fn new() -> Self {
        Self {
            low: 0,
            rng: 0x8000,
            cnt: -9,
            precarry: Vec::new(),
            allow_update_cdf: true,
        }
    }

    fn store(&mut self, fl: u16, fh: u16, nms: u16) {
        let r = self.rng as u32;
        let u = if fl >= 32768 {
            r
        } else {
            (((r >> 8) * ((fl as u32) >> EC_PROB_SHIFT)) >> (7 - EC_PROB_SHIFT))
                + EC_MIN_PROB * nms as u32
        };
        let v = (((r >> 8) * ((fh as u32) >> EC_PROB_SHIFT)) >> (7 - EC_PROB_SHIFT))
            + EC_MIN_PROB * (nms as u32 - 1);
        self.push((r - u) as u64, (u - v) as u16);
    }

    fn push(&mut self, l: u64, new_rng: u16) {
        let mut low = l + self.low;
        let mut c = self.cnt;
        let d = new_rng.leading_zeros() as i16;
        let mut s = c + d;
        if s >= 0 {
            c += 16;
            let mut m = (1u64 << c) - 1;
            if s >= 8 {
                self.precarry.push((low >> c) as u16);
                low &= m;
                c -= 8;
                m >>= 8;
            }
            self.precarry.push((low >> c) as u16);
            s = c + d - 24;
            low &= m;
        }
        self.low = low << d;
        self.rng = new_rng << d;
        self.cnt = s;
    }

    pub fn symbol(&mut self, symbol: usize, cdf: &mut [u16], n_symbols: usize) {
        let nms = (n_symbols + 1 - symbol) as u16;
        let fl = if symbol > 0 { cdf[symbol - 1] } else { 32768 };
        let fh = if symbol < n_symbols { cdf[symbol] } else { 0 };
        self.store(fl, fh, nms);
        if self.allow_update_cdf {
            let count = cdf[n_symbols];
            let rate = 4 + (count >> 4) + (n_symbols > 2) as u16;
            for c in &mut cdf[..symbol] {
                *c += (32768 - *c) >> rate;
            }
            for c in &mut cdf[symbol..n_symbols] {
                *c -= *c >> rate;
            }
            cdf[n_symbols] = count + (count < 32) as u16;
        }
    }

    pub fn bool_adapt(&mut self, val: bool, cdf: &mut [u16; 2]) {
        self.bool_prob(val, cdf[0]);
        if self.allow_update_cdf {
            let count = cdf[1];
            let rate = 4 + (count >> 4);
            if val {
                cdf[0] += (32768 - cdf[0]) >> rate;
            } else {
                cdf[0] -= cdf[0] >> rate;
            }
            cdf[1] = count + (count < 32) as u16;
        }
    }

    pub fn bool_prob(&mut self, val: bool, prob: u16) {
        let (fl, fh, nms) = if val { (prob, 0, 1) } else { (32768, prob, 2) };
        self.store(fl, fh, nms);
    }

    pub fn bool_equi(&mut self, val: bool) {
        let r = self.rng as u32;
        let v = ((r >> 8 << 7) + EC_MIN_PROB) as u16;
        if val {
            self.push((r - v as u32) as u64, v);
        } else {
            self.push(0, (r - v as u32) as u16);
        }
    }

    pub fn bools(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.bool_equi((value >> i) & 1 != 0);
        }
    }

    pub fn uniform(&mut self, value: u32, n: u32) {
        assert!(n > 0 && value < n);
        if n == 1 {
            return;
        }
        let l = 31 - n.leading_zeros() + 1;
        let m = (1 << l) - n;
        if value < m {
            self.bools(value, l - 1);
        } else {
            let coded = value + m;
            self.bools(coded >> 1, l - 1);
            self.bool_equi(coded & 1 != 0);
        }
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let l = self.low;
        let mut c = self.cnt;
        let mut s: i16 = 10;
        let m: u64 = 0x3fff;
        let mut e = ((l + m) & !m) | (m + 1);
        s += c;
        if s > 0 {
            let mut n = (1u64 << (c + 16)) - 1;
            loop {
                self.precarry.push((e >> (c + 16)) as u16);
                e &= n;
                s -= 8;
                c -= 8;
                n >>= 8;
                if s <= 0 {
                    break;
                }
            }
        }
        let mut carry = 0u32;
        let mut offs = self.precarry.len();
        let mut out = vec![0u8; offs];
        while offs > 0 {
            offs -= 1;
            carry += self.precarry[offs] as u32;
            out[offs] = carry as u8;
            carry >>= 8;
        }
        out
    }
}

/// Wrap a payload in an OBU with a leb128 size field.
pub fn obu(obu_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![(obu_type << 3) | 0x02];
    let mut size = payload.len();
    loop {
        let mut byte = (size & 0x7f) as u8;
        size >>= 7;
        if size > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if size == 0 {
            break;
        }
    }
    out.extend_from_slice(payload);
    out
}

pub const OBU_SEQ_HDR: u8 = 1;
pub const OBU_TD: u8 = 2;
pub const OBU_FRAME_HDR: u8 = 3;
pub const OBU_TILE_GRP: u8 = 4;

/// Sequence-level choices the writers and scenarios share.
#[derive(Clone, Copy)]
pub struct SeqSpec {
    pub width: u32,
    pub height: u32,
    pub monochrome: bool,
    pub order_hint_bits: u32,
    pub screen_content: bool,
}

impl SeqSpec {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            monochrome: true,
            order_hint_bits: 0,
            screen_content: false,
        }
    }

    pub fn with_chroma(mut self) -> Self {
        self.monochrome = false;
        self
    }

    pub fn with_order_hint(mut self, bits: u32) -> Self {
        self.order_hint_bits = bits;
        self
    }

    pub fn with_screen_content(mut self) -> Self {
        self.screen_content = true;
        self
    }

    fn dim_bits(v: u32) -> u32 {
        (32 - (v - 1).leading_zeros()).max(1)
    }
}

/// Serialize a sequence header OBU for these choices.
pub fn seq_obu(s: &SeqSpec) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(0, 3); // profile 0
    w.write_bit(false); // still_picture
    w.write_bit(false); // reduced_still_picture
    w.write_bit(false); // timing_info_present
    w.write_bits(0, 5); // one operating point
    w.write_bits(0, 12); // idc
    w.write_bits(0, 5); // level

    let wb = SeqSpec::dim_bits(s.width);
    let hb = SeqSpec::dim_bits(s.height);
    w.write_bits(wb as u64 - 1, 4);
    w.write_bits(hb as u64 - 1, 4);
    w.write_bits(s.width as u64 - 1, wb);
    w.write_bits(s.height as u64 - 1, hb);

    w.write_bit(false); // frame id numbers
    w.write_bit(false); // sb128
    w.write_bit(false); // filter intra
    w.write_bit(false); // intra edge filter
    w.write_bit(false); // interintra
    w.write_bit(false); // masked compound
    w.write_bit(false); // warped motion
    w.write_bit(false); // dual filter
    let order_hint = s.order_hint_bits > 0;
    w.write_bit(order_hint);
    if order_hint {
        w.write_bit(false); // jnt_comp
        w.write_bit(false); // ref_frame_mvs
    }
    if s.screen_content {
        w.write_bit(false); // not adaptive
        w.write_bit(true); // forced on
        w.write_bit(true); // integer-mv adaptive
    } else {
        w.write_bit(false);
        w.write_bit(false); // off
    }
    if order_hint {
        w.write_bits(s.order_hint_bits as u64 - 1, 3);
    }
    w.write_bit(false); // superres
    w.write_bit(false); // cdef
    w.write_bit(false); // restoration

    w.write_bit(false); // high bitdepth
    w.write_bit(s.monochrome);
    w.write_bit(false); // color description
    if s.monochrome {
        w.write_bit(false); // color range
    } else {
        w.write_bit(false); // color range; profile 0 is 4:2:0
        w.write_bits(0, 2); // chroma sample position
        w.write_bit(false); // separate uv delta q
    }
    w.write_bit(false); // film grain
    w.align_to_byte();
    obu(OBU_SEQ_HDR, w.data())
}

/// Frame-level choices for the header writer.
#[derive(Clone, Copy)]
pub struct FrameSpec {
    pub key: bool,
    pub order_hint: u32,
    pub error_resilient: bool,
    pub primary_ref: Option<u8>,
    pub refresh_flags: u8,
    pub base_q: u8,
    pub delta_q_present: bool,
    pub refresh_context: bool,
    pub log2_tile_cols: u32,
    pub allow_intrabc: bool,
}

impl FrameSpec {
    pub fn key(base_q: u8) -> Self {
        Self {
            key: true,
            order_hint: 0,
            error_resilient: true,
            primary_ref: None,
            refresh_flags: 0xff,
            base_q,
            delta_q_present: false,
            refresh_context: true,
            log2_tile_cols: 0,
            allow_intrabc: false,
        }
    }

    pub fn inter(base_q: u8, order_hint: u32) -> Self {
        Self {
            key: false,
            order_hint,
            error_resilient: true,
            primary_ref: None,
            refresh_flags: 0,
            base_q,
            delta_q_present: false,
            refresh_context: false,
            log2_tile_cols: 0,
            allow_intrabc: false,
        }
    }
}

/// Serialize a frame header OBU consistent with `SeqSpec`.
pub fn frame_hdr_obu(s: &SeqSpec, f: &FrameSpec) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bit(false); // show_existing_frame
    w.write_bits(if f.key { 0 } else { 1 }, 2); // frame_type
    w.write_bit(true); // show_frame
    if !f.key {
        w.write_bit(f.error_resilient);
    }
    w.write_bit(false); // disable_cdf_update
    if s.screen_content {
        // allow_screen_content_tools is forced on by the sequence; only
        // the adaptive integer-mv choice is coded
        w.write_bit(false);
    }
    w.write_bit(false); // frame_size_override
    if s.order_hint_bits > 0 {
        w.write_bits(f.order_hint as u64, s.order_hint_bits);
    }
    if !f.key && !f.error_resilient {
        w.write_bits(f.primary_ref.unwrap_or(7) as u64, 3);
    }
    if !f.key {
        w.write_bits(f.refresh_flags as u64, 8);
    }
    if f.key {
        // frame size from sequence maximum, no custom render size
        w.write_bit(false);
        if s.screen_content {
            w.write_bit(f.allow_intrabc);
        }
    } else {
        if s.order_hint_bits > 0 {
            w.write_bit(false); // no short ref signaling
        }
        for _ in 0..7 {
            w.write_bits(0, 3); // all references from slot 0
        }
        w.write_bit(false); // render size
        w.write_bit(true); // high precision mv
        w.write_bit(false); // filter not switchable
        w.write_bits(0, 2); // 8-tap regular
        w.write_bit(false); // motion mode not switchable
        // use_ref_frame_mvs is only coded when seq.ref_frame_mvs is on
    }
    w.write_bit(!f.refresh_context); // disable_frame_end_update_cdf

    // tile info: uniform spacing
    w.write_bit(true);
    let sb_cols = (s.width + 63) / 64;
    let sb_rows = (s.height + 63) / 64;
    let max_log2_cols = {
        let mut k = 0;
        while (1 << k) < sb_cols.min(64) {
            k += 1;
        }
        k
    };
    for _ in 0..f.log2_tile_cols {
        w.write_bit(true);
    }
    if f.log2_tile_cols < max_log2_cols {
        w.write_bit(false);
    }
    let max_log2_rows = {
        let mut k = 0;
        while (1 << k) < sb_rows.min(64) {
            k += 1;
        }
        k
    };
    if max_log2_rows > 0 {
        w.write_bit(false);
    }
    let cols = 1u32 << f.log2_tile_cols;
    if cols > 1 {
        w.write_bits(0, f.log2_tile_cols); // context update tile 0
        w.write_bits(0, 2); // one-byte tile size prefixes
    }

    // quantization
    w.write_bits(f.base_q as u64, 8);
    w.write_bit(false); // ydc delta
    if !s.monochrome {
        w.write_bit(false); // udc delta
        w.write_bit(false); // uac delta
    }
    w.write_bit(false); // qm

    w.write_bit(false); // segmentation

    if f.base_q > 0 {
        w.write_bit(f.delta_q_present);
        if f.delta_q_present {
            w.write_bits(0, 2); // res_log2
            if !f.allow_intrabc {
                w.write_bit(false); // delta_lf
            }
        }
    }

    if !f.allow_intrabc {
        // loop filter off
        w.write_bits(0, 6);
        w.write_bits(0, 6);
        w.write_bits(0, 3); // sharpness
        w.write_bit(false); // mode_ref_deltas
    }

    w.write_bit(false); // tx mode: largest
    if !f.key {
        w.write_bit(false); // single reference mode
    }
    // allow_warped_motion is only coded when the sequence enables it
    w.write_bit(false); // reduced tx set
    if !f.key {
        for _ in 0..7 {
            w.write_bit(false); // gm_is_global
        }
    }
    w.align_to_byte();
    obu(OBU_FRAME_HDR, w.data())
}

/// Wrap raw tile payloads into a tile-group OBU, prefixing all but the
/// last tile with its size.
pub fn tile_group_obu(n_tiles_total: u32, tiles: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut w = BitWriter::new();
    if n_tiles_total > 1 {
        w.write_bit(false); // whole frame in this group
        w.align_to_byte();
        payload.extend_from_slice(w.data());
    }
    for (i, tile) in tiles.iter().enumerate() {
        if i + 1 < tiles.len() {
            payload.push((tile.len() - 1) as u8); // one-byte size prefix
        }
        payload.extend_from_slice(tile);
    }
    obu(OBU_TILE_GRP, &payload)
}

/// Tile symbol encoder bound to a CDF snapshot.
pub struct TileEnc {
    pub cdf: CdfContext,
    pub enc: MsacEncoder,
}

impl TileEnc {
    pub fn new(cdf: CdfContext) -> Self {
        Self {
            cdf,
            enc: MsacEncoder::new(),
        }
    }

    pub fn partition(&mut self, bl: BlockLevel, ctx: usize, bp: usize, n_part: usize) {
        self.enc
            .symbol(bp, &mut self.cdf.m.partition[bl as usize][ctx], n_part);
    }

    /// Implied-partition split bool when only the horizontal halves fit.
    pub fn split_bool_top(&mut self, bl: BlockLevel, ctx: usize, split: bool) {
        let p = gather_top_partition_prob(&self.cdf.m.partition[bl as usize][ctx], bl);
        self.enc.bool_prob(split, p as u16);
    }

    /// Implied-partition split bool when only the vertical halves fit.
    pub fn split_bool_left(&mut self, bl: BlockLevel, ctx: usize, split: bool) {
        let p = gather_left_partition_prob(&self.cdf.m.partition[bl as usize][ctx], bl);
        self.enc.bool_prob(split, p as u16);
    }

    pub fn skip(&mut self, ctx: usize, v: bool) {
        self.enc.bool_adapt(v, &mut self.cdf.m.skip[ctx]);
    }

    pub fn kf_ymode(&mut self, a_ctx: usize, l_ctx: usize, mode: usize) {
        self.enc.symbol(mode, &mut self.cdf.kfym[a_ctx][l_ctx], 13);
    }

    pub fn uv_mode(&mut self, cfl_allowed: bool, y_mode: usize, mode: usize) {
        let n = if cfl_allowed { 14 } else { 13 };
        self.enc
            .symbol(mode, &mut self.cdf.m.uv_mode[cfl_allowed as usize][y_mode], n);
    }

    pub fn intra_bool(&mut self, ctx: usize, is_inter: bool) {
        self.enc.bool_adapt(is_inter, &mut self.cdf.m.intra[ctx]);
    }

    pub fn intrabc_bool(&mut self, is_intra: bool) {
        // the parser inverts the draw
        self.enc.bool_adapt(!is_intra, &mut self.cdf.m.intrabc);
    }

    pub fn delta_q(&mut self, delta: i32) {
        let abs = delta.unsigned_abs() as usize;
        assert!(abs < 3, "larger deltas need the escape path");
        self.enc.symbol(abs, &mut self.cdf.m.delta_q, 4);
        if delta != 0 {
            self.enc.bool_prob(delta < 0, 128 << 7);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.enc.finalize()
    }
}

/// The palette neighbor ordering used when coding the color-index map:
/// returns the context class and symbol remap for a cell from its decoded
/// top/left/top-left neighbors.
pub fn palette_order(
    top: Option<u8>,
    left: Option<u8>,
    topleft: Option<u8>,
) -> (usize, [u8; 8]) {
    let mut order = [0u8; 8];
    let mut used = 0u8;
    let mut n = 0usize;
    let mut push = |v: u8, order: &mut [u8; 8], used: &mut u8, n: &mut usize| {
        order[*n] = v;
        *used |= 1 << v;
        *n += 1;
    };
    let ctx = match (top, left) {
        (Some(t), Some(l)) => {
            let tl = topleft.expect("interior cells have all three neighbors");
            if t == l && l == tl {
                push(t, &mut order, &mut used, &mut n);
                4
            } else if t == l {
                push(t, &mut order, &mut used, &mut n);
                push(tl, &mut order, &mut used, &mut n);
                3
            } else if t == tl || l == tl {
                push(tl, &mut order, &mut used, &mut n);
                push(if t == tl { l } else { t }, &mut order, &mut used, &mut n);
                2
            } else {
                push(t.min(l), &mut order, &mut used, &mut n);
                push(t.max(l), &mut order, &mut used, &mut n);
                push(tl, &mut order, &mut used, &mut n);
                1
            }
        }
        (Some(t), None) => {
            push(t, &mut order, &mut used, &mut n);
            0
        }
        (None, Some(l)) => {
            push(l, &mut order, &mut used, &mut n);
            0
        }
        (None, None) => unreachable!("first cell is coded separately"),
    };
    for bit in 0..8u8 {
        if used & (1 << bit) == 0 {
            order[n] = bit;
            n += 1;
        }
    }
    (ctx, order)
}
