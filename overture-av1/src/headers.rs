//! Sequence and frame header interpretation.
//!
//! Parses the subset of the header syntax that conditions block parsing and
//! the pipeline: geometry, feature enables, tiling, quantization,
//! segmentation, delta-q/lf, loop filter, CDEF, loop restoration, reference
//! mapping, global motion and film grain passthrough. Scalability and
//! decoder-model syntax is not supported.

use crate::error::{Av1Error, Result};
use crate::tables::NUM_SEGMENTS;
use crate::warp::{WarpType, WarpedMotionParams};
use overture_core::picture::{FrameType, PixelLayout};
use overture_core::BitReader;

pub const PRIMARY_REF_NONE: u8 = 7;

/// Tri-state sequence-level feature switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqSwitch {
    Off,
    On,
    /// Signalled per frame.
    Adaptive,
}

/// Immutable per-sequence coding parameters.
#[derive(Debug, Clone)]
pub struct SequenceHeader {
    pub profile: u8,
    pub still_picture: bool,
    pub reduced_still_picture: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub frame_width_bits: u32,
    pub frame_height_bits: u32,
    pub frame_id_numbers_present: bool,
    pub delta_frame_id_n_bits: u32,
    pub frame_id_n_bits: u32,
    pub sb128: bool,
    pub filter_intra: bool,
    pub intra_edge_filter: bool,
    pub inter_intra: bool,
    pub masked_compound: bool,
    pub warped_motion: bool,
    pub dual_filter: bool,
    pub order_hint: bool,
    pub jnt_comp: bool,
    pub ref_frame_mvs: bool,
    pub screen_content_tools: SeqSwitch,
    pub force_integer_mv: SeqSwitch,
    pub order_hint_n_bits: u32,
    pub super_res: bool,
    pub cdef: bool,
    pub restoration: bool,
    pub bpc: u8,
    pub monochrome: bool,
    pub layout: PixelLayout,
    pub pri: u8,
    pub trc: u8,
    pub mtrx: u8,
    pub chr: u8,
    pub color_range: bool,
    pub separate_uv_delta_q: bool,
    pub film_grain_present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TileInfo {
    pub uniform: bool,
    pub log2_cols: u32,
    pub log2_rows: u32,
    pub cols: u32,
    pub rows: u32,
    /// Tile column boundaries in superblock units, `cols + 1` entries.
    pub col_start_sb: Vec<u32>,
    /// Tile row boundaries in superblock units, `rows + 1` entries.
    pub row_start_sb: Vec<u32>,
    /// Tile whose final CDF state becomes the frame output.
    pub update: u32,
    /// Byte width of the per-tile size prefix.
    pub n_bytes: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuantParams {
    pub yac: u8,
    pub ydc_delta: i8,
    pub udc_delta: i8,
    pub uac_delta: i8,
    pub vdc_delta: i8,
    pub vac_delta: i8,
    pub qm: bool,
    pub qm_y: u8,
    pub qm_u: u8,
    pub qm_v: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentData {
    pub delta_q: i16,
    pub delta_lf_y_v: i8,
    pub delta_lf_y_h: i8,
    pub delta_lf_u: i8,
    pub delta_lf_v: i8,
    pub ref_frame: i8,
    pub skip: bool,
    pub globalmv: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentationParams {
    pub enabled: bool,
    pub update_map: bool,
    pub temporal: bool,
    pub update_data: bool,
    pub preskip: bool,
    pub last_active_segid: u8,
    pub seg_data: [SegmentData; NUM_SEGMENTS],
    pub lossless: [bool; NUM_SEGMENTS],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaQParams {
    pub present: bool,
    pub res_log2: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaLfParams {
    pub present: bool,
    pub res_log2: u32,
    pub multi: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaParams {
    pub q: DeltaQParams,
    pub lf: DeltaLfParams,
}

#[derive(Debug, Clone, Default)]
pub struct LoopFilterParams {
    pub level_y: [u8; 2],
    pub level_u: u8,
    pub level_v: u8,
    pub sharpness: u8,
    pub mode_ref_delta_enabled: bool,
    pub ref_deltas: [i8; 8],
    pub mode_deltas: [i8; 2],
}

#[derive(Debug, Clone, Default)]
pub struct CdefParams {
    pub damping: u8,
    pub n_bits: u32,
    pub y_strengths: Vec<(u8, u8)>,
    pub uv_strengths: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorationType {
    #[default]
    None,
    Switchable,
    Wiener,
    SgrProj,
}

#[derive(Debug, Clone, Default)]
pub struct RestorationParams {
    pub rtype: [RestorationType; 3],
    /// log2 unit size for luma and chroma, in pixels.
    pub unit_size_log2: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxfmMode {
    Only4x4,
    #[default]
    Largest,
    Switchable,
}

/// Film grain parameters are carried, not synthesized.
#[derive(Debug, Clone, Default)]
pub struct FilmGrainData {
    pub apply: bool,
    pub seed: u16,
    pub update: bool,
    pub ref_idx: u8,
    pub payload_bits: u32,
}

/// Immutable per-frame coding parameters.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub show_existing_frame: bool,
    pub existing_frame_idx: u8,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub error_resilient: bool,
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: bool,
    pub force_integer_mv: bool,
    pub frame_offset: u32,
    pub primary_ref_frame: u8,
    pub refresh_frame_flags: u8,
    pub width: u32,
    pub height: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub allow_intrabc: bool,
    pub refidx: [u8; 7],
    pub hp: bool,
    pub subpel_filter_mode: u8,
    pub subpel_filter_switchable: bool,
    pub switchable_motion_mode: bool,
    pub use_ref_frame_mvs: bool,
    pub refresh_context: bool,
    pub tiling: TileInfo,
    pub quant: QuantParams,
    pub segmentation: SegmentationParams,
    pub delta: DeltaParams,
    pub loopfilter: LoopFilterParams,
    pub cdef: CdefParams,
    pub restoration: RestorationParams,
    pub txfm_mode: TxfmMode,
    pub switchable_comp_refs: bool,
    pub skip_mode_allowed: bool,
    pub skip_mode_enabled: bool,
    pub skip_mode_refs: [i8; 2],
    pub warp_motion: bool,
    pub reduced_txtp_set: bool,
    pub gmv: [WarpedMotionParams; 7],
    pub film_grain: FilmGrainData,
    pub coded_lossless: bool,
    pub all_lossless: bool,
}

impl FrameHeader {
    pub fn is_intra(&self) -> bool {
        matches!(self.frame_type, FrameType::Key | FrameType::IntraOnly)
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

fn check(r: &BitReader) -> Result<()> {
    if r.has_error() {
        Err(Av1Error::InvalidBitstream("header truncated"))
    } else {
        Ok(())
    }
}

/// Parse a sequence header OBU payload.
pub fn parse_sequence_header(r: &mut BitReader) -> Result<SequenceHeader> {
    let profile = r.get(3) as u8;
    if profile > 2 {
        return Err(Av1Error::UnsupportedProfile("profile > 2"));
    }
    let still_picture = r.get(1) != 0;
    let reduced_still_picture = r.get(1) != 0;
    if reduced_still_picture && !still_picture {
        return Err(Av1Error::InvalidBitstream("reduced header without still picture"));
    }

    if reduced_still_picture {
        let _seq_level_idx = r.get(5);
    } else {
        let timing_info_present = r.get(1) != 0;
        if timing_info_present {
            return Err(Av1Error::UnsupportedProfile("timing info"));
        }
        let n_operating_points = r.get(5) + 1;
        for _ in 0..n_operating_points {
            let _idc = r.get(12);
            let level = r.get(5);
            if level > 7 {
                let _tier = r.get(1);
            }
        }
    }

    let frame_width_bits = r.get(4) + 1;
    let frame_height_bits = r.get(4) + 1;
    let max_width = r.get(frame_width_bits) + 1;
    let max_height = r.get(frame_height_bits) + 1;

    let mut frame_id_numbers_present = false;
    let mut delta_frame_id_n_bits = 0;
    let mut frame_id_n_bits = 0;
    if !reduced_still_picture {
        frame_id_numbers_present = r.get(1) != 0;
        if frame_id_numbers_present {
            delta_frame_id_n_bits = r.get(4) + 2;
            frame_id_n_bits = r.get(3) + delta_frame_id_n_bits + 1;
        }
    }

    let sb128 = r.get(1) != 0;
    let filter_intra = r.get(1) != 0;
    let intra_edge_filter = r.get(1) != 0;

    let mut hdr = SequenceHeader {
        profile,
        still_picture,
        reduced_still_picture,
        max_width,
        max_height,
        frame_width_bits,
        frame_height_bits,
        frame_id_numbers_present,
        delta_frame_id_n_bits,
        frame_id_n_bits,
        sb128,
        filter_intra,
        intra_edge_filter,
        inter_intra: false,
        masked_compound: false,
        warped_motion: false,
        dual_filter: false,
        order_hint: false,
        jnt_comp: false,
        ref_frame_mvs: false,
        screen_content_tools: SeqSwitch::Adaptive,
        force_integer_mv: SeqSwitch::Adaptive,
        order_hint_n_bits: 0,
        super_res: false,
        cdef: false,
        restoration: false,
        bpc: 8,
        monochrome: false,
        layout: PixelLayout::I420,
        pri: 2,
        trc: 2,
        mtrx: 2,
        chr: 0,
        color_range: false,
        separate_uv_delta_q: false,
        film_grain_present: false,
    };

    if !reduced_still_picture {
        hdr.inter_intra = r.get(1) != 0;
        hdr.masked_compound = r.get(1) != 0;
        hdr.warped_motion = r.get(1) != 0;
        hdr.dual_filter = r.get(1) != 0;
        hdr.order_hint = r.get(1) != 0;
        if hdr.order_hint {
            hdr.jnt_comp = r.get(1) != 0;
            hdr.ref_frame_mvs = r.get(1) != 0;
        }
        hdr.screen_content_tools = if r.get(1) != 0 {
            SeqSwitch::Adaptive
        } else if r.get(1) != 0 {
            SeqSwitch::On
        } else {
            SeqSwitch::Off
        };
        hdr.force_integer_mv = if hdr.screen_content_tools == SeqSwitch::Off {
            SeqSwitch::Off
        } else if r.get(1) != 0 {
            SeqSwitch::Adaptive
        } else if r.get(1) != 0 {
            SeqSwitch::On
        } else {
            SeqSwitch::Off
        };
        if hdr.order_hint {
            hdr.order_hint_n_bits = r.get(3) + 1;
        }
    } else {
        hdr.screen_content_tools = SeqSwitch::Off;
        hdr.force_integer_mv = SeqSwitch::Off;
    }

    hdr.super_res = r.get(1) != 0;
    hdr.cdef = r.get(1) != 0;
    hdr.restoration = r.get(1) != 0;

    // color config
    let high_bitdepth = r.get(1) != 0;
    if profile == 2 && high_bitdepth && r.get(1) != 0 {
        return Err(Av1Error::UnsupportedProfile("12-bit"));
    }
    hdr.bpc = if high_bitdepth { 10 } else { 8 };
    hdr.monochrome = if profile == 1 { false } else { r.get(1) != 0 };
    if r.get(1) != 0 {
        hdr.pri = r.get(8) as u8;
        hdr.trc = r.get(8) as u8;
        hdr.mtrx = r.get(8) as u8;
    }
    if hdr.monochrome {
        hdr.color_range = r.get(1) != 0;
        hdr.layout = PixelLayout::I400;
    } else if hdr.pri == 1 && hdr.trc == 13 && hdr.mtrx == 0 {
        hdr.color_range = true;
        hdr.layout = PixelLayout::I444;
    } else {
        hdr.color_range = r.get(1) != 0;
        hdr.layout = match profile {
            0 => PixelLayout::I420,
            1 => PixelLayout::I444,
            _ => PixelLayout::I422,
        };
        if hdr.layout == PixelLayout::I420 {
            hdr.chr = r.get(2) as u8;
        }
    }
    if !hdr.monochrome {
        hdr.separate_uv_delta_q = r.get(1) != 0;
    }
    hdr.film_grain_present = r.get(1) != 0;

    check(r)?;
    Ok(hdr)
}

fn read_delta_q(r: &mut BitReader) -> i8 {
    if r.get(1) != 0 {
        r.get_signed(6) as i8
    } else {
        0
    }
}

fn tile_log2(blk_size: u32, target: u32) -> u32 {
    let mut k = 0;
    while (blk_size << k) < target {
        k += 1;
    }
    k
}

fn parse_tile_info(r: &mut BitReader, seq: &SequenceHeader, bw4: u32, bh4: u32) -> Result<TileInfo> {
    let sb_shift = if seq.sb128 { 5 } else { 4 };
    let sb_cols = (bw4 + (1 << sb_shift) - 1) >> sb_shift;
    let sb_rows = (bh4 + (1 << sb_shift) - 1) >> sb_shift;
    let sb_size_log2 = sb_shift + 2;

    let max_tile_width_sb = 4096 >> sb_size_log2;
    let max_tile_area_sb = (4096u32 * 2304) >> (2 * sb_size_log2);
    let min_log2_cols = tile_log2(max_tile_width_sb, sb_cols);
    let max_log2_cols = tile_log2(1, sb_cols.min(64));
    let max_log2_rows = tile_log2(1, sb_rows.min(64));
    let min_log2_tiles = tile_log2(max_tile_area_sb, sb_cols * sb_rows).max(min_log2_cols);

    let mut info = TileInfo {
        uniform: r.get(1) != 0,
        ..Default::default()
    };

    if info.uniform {
        info.log2_cols = min_log2_cols;
        while info.log2_cols < max_log2_cols && r.get(1) != 0 {
            info.log2_cols += 1;
        }
        let tile_w = (sb_cols + (1 << info.log2_cols) - 1) >> info.log2_cols;
        let mut sbx = 0;
        while sbx < sb_cols {
            info.col_start_sb.push(sbx);
            sbx += tile_w;
        }
        info.col_start_sb.push(sb_cols);
        info.cols = info.col_start_sb.len() as u32 - 1;

        let min_log2_rows = min_log2_tiles.saturating_sub(info.log2_cols);
        info.log2_rows = min_log2_rows;
        while info.log2_rows < max_log2_rows && r.get(1) != 0 {
            info.log2_rows += 1;
        }
        let tile_h = (sb_rows + (1 << info.log2_rows) - 1) >> info.log2_rows;
        let mut sby = 0;
        while sby < sb_rows {
            info.row_start_sb.push(sby);
            sby += tile_h;
        }
        info.row_start_sb.push(sb_rows);
        info.rows = info.row_start_sb.len() as u32 - 1;
    } else {
        let mut widest = 0;
        let mut sbx = 0;
        while sbx < sb_cols {
            info.col_start_sb.push(sbx);
            let max_w = (sb_cols - sbx).min(max_tile_width_sb);
            let w = r.get_uniform(max_w) + 1;
            widest = widest.max(w);
            sbx += w;
        }
        info.col_start_sb.push(sb_cols);
        info.cols = info.col_start_sb.len() as u32 - 1;
        info.log2_cols = tile_log2(1, info.cols);

        let max_tile_height_sb = (max_tile_area_sb / widest).max(1);
        let mut sby = 0;
        while sby < sb_rows {
            info.row_start_sb.push(sby);
            let max_h = (sb_rows - sby).min(max_tile_height_sb);
            let h = r.get_uniform(max_h) + 1;
            sby += h;
        }
        info.row_start_sb.push(sb_rows);
        info.rows = info.row_start_sb.len() as u32 - 1;
        info.log2_rows = tile_log2(1, info.rows);
    }

    if info.cols * info.rows > 1 {
        info.update = r.get(info.log2_cols + info.log2_rows);
        info.n_bytes = r.get(2) + 1;
    }
    if info.update >= info.cols * info.rows {
        return Err(Av1Error::InvalidBitstream("context update tile out of range"));
    }
    Ok(info)
}

fn parse_segmentation(
    r: &mut BitReader,
    primary_ref_none: bool,
    prev: Option<&SegmentationParams>,
) -> Result<SegmentationParams> {
    let mut seg = SegmentationParams {
        enabled: r.get(1) != 0,
        ..Default::default()
    };
    if !seg.enabled {
        return Ok(seg);
    }

    if primary_ref_none {
        seg.update_map = true;
        seg.temporal = false;
        seg.update_data = true;
    } else {
        seg.update_map = r.get(1) != 0;
        seg.temporal = seg.update_map && r.get(1) != 0;
        seg.update_data = r.get(1) != 0;
    }

    if seg.update_data {
        for data in seg.seg_data.iter_mut() {
            *data = SegmentData {
                ref_frame: -1,
                ..Default::default()
            };
            if r.get(1) != 0 {
                data.delta_q = r.get_signed(8) as i16;
            }
            if r.get(1) != 0 {
                data.delta_lf_y_v = r.get_signed(6) as i8;
            }
            if r.get(1) != 0 {
                data.delta_lf_y_h = r.get_signed(6) as i8;
            }
            if r.get(1) != 0 {
                data.delta_lf_u = r.get_signed(6) as i8;
            }
            if r.get(1) != 0 {
                data.delta_lf_v = r.get_signed(6) as i8;
            }
            if r.get(1) != 0 {
                data.ref_frame = r.get(3) as i8;
            }
            data.skip = r.get(1) != 0;
            data.globalmv = r.get(1) != 0;
        }
    } else if let Some(prev) = prev {
        seg.seg_data = prev.seg_data;
    }

    for (i, data) in seg.seg_data.iter().enumerate() {
        if data.delta_q != 0
            || (data.delta_lf_y_v | data.delta_lf_y_h | data.delta_lf_u | data.delta_lf_v) != 0
            || data.ref_frame >= 0
            || data.skip
            || data.globalmv
        {
            seg.last_active_segid = i as u8;
        }
        if data.ref_frame >= 0 || data.skip || data.globalmv {
            seg.preskip = true;
        }
    }
    Ok(seg)
}

fn parse_loopfilter(
    r: &mut BitReader,
    has_chroma: bool,
    skip_coded: bool,
) -> Result<LoopFilterParams> {
    let mut lf = LoopFilterParams {
        ref_deltas: [1, 0, 0, 0, -1, 0, -1, -1],
        ..Default::default()
    };
    if skip_coded {
        lf.mode_ref_delta_enabled = true;
        return Ok(lf);
    }
    lf.level_y[0] = r.get(6) as u8;
    lf.level_y[1] = r.get(6) as u8;
    if has_chroma && (lf.level_y[0] != 0 || lf.level_y[1] != 0) {
        lf.level_u = r.get(6) as u8;
        lf.level_v = r.get(6) as u8;
    }
    lf.sharpness = r.get(3) as u8;
    lf.mode_ref_delta_enabled = r.get(1) != 0;
    if lf.mode_ref_delta_enabled && r.get(1) != 0 {
        for delta in lf.ref_deltas.iter_mut() {
            if r.get(1) != 0 {
                *delta = r.get_signed(6) as i8;
            }
        }
        for delta in lf.mode_deltas.iter_mut() {
            if r.get(1) != 0 {
                *delta = r.get_signed(6) as i8;
            }
        }
    }
    Ok(lf)
}

fn parse_cdef(r: &mut BitReader, seq: &SequenceHeader, skip_coded: bool) -> Result<CdefParams> {
    let mut cdef = CdefParams {
        damping: 3,
        n_bits: 0,
        y_strengths: vec![(0, 0)],
        uv_strengths: vec![(0, 0)],
    };
    if !seq.cdef || skip_coded {
        return Ok(cdef);
    }
    cdef.damping = r.get(2) as u8 + 3;
    cdef.n_bits = r.get(2);
    cdef.y_strengths.clear();
    cdef.uv_strengths.clear();
    for _ in 0..1u32 << cdef.n_bits {
        cdef.y_strengths.push((r.get(4) as u8, r.get(2) as u8));
        if !seq.monochrome {
            cdef.uv_strengths.push((r.get(4) as u8, r.get(2) as u8));
        }
    }
    Ok(cdef)
}

fn parse_restoration(
    r: &mut BitReader,
    seq: &SequenceHeader,
    skip_coded: bool,
) -> Result<RestorationParams> {
    let mut lr = RestorationParams {
        unit_size_log2: [8, 8],
        ..Default::default()
    };
    if !seq.restoration || skip_coded {
        return Ok(lr);
    }
    let n_planes = if seq.monochrome { 1 } else { 3 };
    let mut uses_lr = false;
    let mut uses_chroma_lr = false;
    for p in 0..n_planes {
        lr.rtype[p] = match r.get(2) {
            0 => RestorationType::None,
            1 => RestorationType::Switchable,
            2 => RestorationType::Wiener,
            _ => RestorationType::SgrProj,
        };
        if lr.rtype[p] != RestorationType::None {
            uses_lr = true;
            if p > 0 {
                uses_chroma_lr = true;
            }
        }
    }
    if uses_lr {
        let mut shift = if seq.sb128 {
            1 + r.get(1)
        } else {
            let s = r.get(1);
            if s != 0 {
                s + r.get(1)
            } else {
                s
            }
        };
        shift = shift.min(2);
        lr.unit_size_log2[0] = 6 + shift;
        lr.unit_size_log2[1] = lr.unit_size_log2[0];
        if seq.layout == PixelLayout::I420 && uses_chroma_lr {
            lr.unit_size_log2[1] -= r.get(1);
        }
    }
    Ok(lr)
}

fn parse_gmv(
    r: &mut BitReader,
    hp: bool,
    prev: Option<&[WarpedMotionParams; 7]>,
) -> Result<[WarpedMotionParams; 7]> {
    let defaults = [WarpedMotionParams::default(); 7];
    let mut gmv = defaults;
    for (i, wm) in gmv.iter_mut().enumerate() {
        let ref_wm = prev.map_or(WarpedMotionParams::default(), |p| p[i]);
        if r.get(1) == 0 {
            continue;
        }
        wm.wm_type = if r.get(1) != 0 {
            WarpType::RotZoom
        } else if r.get(1) != 0 {
            WarpType::Translation
        } else {
            WarpType::Affine
        };

        if wm.wm_type != WarpType::Translation {
            wm.matrix[2] = (1 << 16) + 2 * r.get_subexp((ref_wm.matrix[2] - (1 << 16)) >> 1, 12);
            wm.matrix[3] = 2 * r.get_subexp(ref_wm.matrix[3] >> 1, 12);
            if wm.wm_type == WarpType::Affine {
                wm.matrix[4] = 2 * r.get_subexp(ref_wm.matrix[4] >> 1, 12);
                wm.matrix[5] =
                    (1 << 16) + 2 * r.get_subexp((ref_wm.matrix[5] - (1 << 16)) >> 1, 12);
            } else {
                wm.matrix[4] = -wm.matrix[3];
                wm.matrix[5] = wm.matrix[2];
            }
        }

        let (bits, shift) = if wm.wm_type == WarpType::Translation {
            if hp {
                (9, 3)
            } else {
                (8, 4)
            }
        } else {
            (12, 10)
        };
        wm.matrix[0] = r.get_subexp(ref_wm.matrix[0] >> shift, bits) * (1 << shift);
        wm.matrix[1] = r.get_subexp(ref_wm.matrix[1] >> shift, bits) * (1 << shift);
    }
    check(r)?;
    Ok(gmv)
}

fn parse_film_grain(r: &mut BitReader, seq: &SequenceHeader, show: bool) -> Result<FilmGrainData> {
    let mut fg = FilmGrainData::default();
    if !seq.film_grain_present || !show {
        return Ok(fg);
    }
    fg.apply = r.get(1) != 0;
    if !fg.apply {
        return Ok(fg);
    }
    fg.seed = r.get(16) as u16;
    fg.update = true;
    // scaling points and AR coefficients are carried as an opaque payload
    let start = r.bit_position();
    let num_y_points = r.get(4).min(14);
    for _ in 0..num_y_points {
        r.get(8);
        r.get(8);
    }
    let chroma_scaling_from_luma = if seq.monochrome { false } else { r.get(1) != 0 };
    let (num_cb, num_cr) = if seq.monochrome || chroma_scaling_from_luma {
        (0, 0)
    } else {
        let cb = r.get(4).min(10);
        for _ in 0..cb {
            r.get(8);
            r.get(8);
        }
        let cr = r.get(4).min(10);
        for _ in 0..cr {
            r.get(8);
            r.get(8);
        }
        (cb, cr)
    };
    r.get(2); // grain_scaling
    let ar_coeff_lag = r.get(2);
    let n_y_ar = 2 * ar_coeff_lag * (ar_coeff_lag + 1);
    for _ in 0..if num_y_points > 0 { n_y_ar } else { 0 } {
        r.get(8);
    }
    let n_uv_ar = n_y_ar + (num_y_points > 0) as u32;
    for _ in 0..if num_cb > 0 || chroma_scaling_from_luma { n_uv_ar } else { 0 } {
        r.get(8);
    }
    for _ in 0..if num_cr > 0 || chroma_scaling_from_luma { n_uv_ar } else { 0 } {
        r.get(8);
    }
    r.get(2); // ar_coeff_shift
    r.get(2); // grain_scale_shift
    if num_cb > 0 {
        r.get(8);
        r.get(8);
        r.get(9);
    }
    if num_cr > 0 {
        r.get(8);
        r.get(8);
        r.get(9);
    }
    r.get(1); // overlap flag
    r.get(1); // clip to restricted range
    fg.payload_bits = (r.bit_position() - start) as u32;
    check(r)?;
    Ok(fg)
}

/// Per-slot reference state the frame header parser consults for order
/// hints and inherited tables.
#[derive(Default)]
pub struct RefState {
    /// Order hint of each reference slot, when occupied.
    pub ref_poc: [Option<u32>; 8],
    /// Global motion models published with each slot.
    pub gmv: [Option<[WarpedMotionParams; 7]>; 8],
    /// Segmentation tables published with each slot.
    pub seg: [Option<SegmentationParams>; 8],
    /// Loop-filter deltas published with each slot.
    pub loopfilter: [Option<LoopFilterParams>; 8],
}

impl RefState {
    fn primary_slot(&self, hdr: &FrameHeader) -> Option<usize> {
        if hdr.primary_ref_frame == PRIMARY_REF_NONE {
            None
        } else {
            Some(hdr.refidx[hdr.primary_ref_frame as usize] as usize)
        }
    }
}

/// Parse a frame header OBU payload.
pub fn parse_frame_header(
    r: &mut BitReader,
    seq: &SequenceHeader,
    refs: &RefState,
) -> Result<FrameHeader> {
    let mut hdr = blank_header();

    if seq.reduced_still_picture {
        hdr.frame_type = FrameType::Key;
        hdr.show_frame = true;
        hdr.showable_frame = false;
        hdr.error_resilient = true;
        hdr.refresh_frame_flags = 0xff;
        hdr.disable_cdf_update = r.get(1) != 0;
    } else {
        hdr.show_existing_frame = r.get(1) != 0;
        if hdr.show_existing_frame {
            hdr.existing_frame_idx = r.get(3) as u8;
            if seq.frame_id_numbers_present {
                r.get(seq.frame_id_n_bits);
            }
            check(r)?;
            return Ok(hdr);
        }
        hdr.frame_type = match r.get(2) {
            0 => FrameType::Key,
            1 => FrameType::Inter,
            2 => FrameType::IntraOnly,
            _ => FrameType::Switch,
        };
        hdr.show_frame = r.get(1) != 0;
        hdr.showable_frame = if hdr.show_frame {
            hdr.frame_type != FrameType::Key
        } else {
            r.get(1) != 0
        };
        hdr.error_resilient = if hdr.frame_type == FrameType::Switch
            || (hdr.frame_type == FrameType::Key && hdr.show_frame)
        {
            true
        } else {
            r.get(1) != 0
        };
        hdr.disable_cdf_update = r.get(1) != 0;
    }

    hdr.allow_screen_content_tools = match seq.screen_content_tools {
        SeqSwitch::Adaptive => r.get(1) != 0,
        SeqSwitch::On => true,
        SeqSwitch::Off => false,
    };
    if hdr.allow_screen_content_tools {
        hdr.force_integer_mv = match seq.force_integer_mv {
            SeqSwitch::Adaptive => r.get(1) != 0,
            SeqSwitch::On => true,
            SeqSwitch::Off => false,
        };
    }
    if hdr.is_intra() {
        hdr.force_integer_mv = true;
    }

    if seq.frame_id_numbers_present {
        r.get(seq.frame_id_n_bits);
    }

    let frame_size_override = if seq.reduced_still_picture {
        false
    } else if hdr.frame_type == FrameType::Switch {
        true
    } else {
        r.get(1) != 0
    };

    hdr.frame_offset = if seq.order_hint {
        r.get(seq.order_hint_n_bits)
    } else {
        0
    };

    hdr.primary_ref_frame = if hdr.error_resilient || hdr.is_intra() {
        PRIMARY_REF_NONE
    } else {
        r.get(3) as u8
    };

    hdr.refresh_frame_flags = if hdr.frame_type == FrameType::Switch
        || (hdr.frame_type == FrameType::Key && hdr.show_frame)
    {
        0xff
    } else {
        r.get(8) as u8
    };
    if hdr.frame_type == FrameType::IntraOnly && hdr.refresh_frame_flags == 0xff {
        return Err(Av1Error::InvalidBitstream("intra-only frame refreshing all slots"));
    }

    let mut read_frame_size = |r: &mut BitReader, hdr: &mut FrameHeader| -> Result<()> {
        if frame_size_override {
            hdr.width = r.get(seq.frame_width_bits) + 1;
            hdr.height = r.get(seq.frame_height_bits) + 1;
        } else {
            hdr.width = seq.max_width;
            hdr.height = seq.max_height;
        }
        if seq.super_res && r.get(1) != 0 {
            return Err(Av1Error::UnsupportedProfile("superres"));
        }
        if r.get(1) != 0 {
            hdr.render_width = r.get(16) + 1;
            hdr.render_height = r.get(16) + 1;
        } else {
            hdr.render_width = hdr.width;
            hdr.render_height = hdr.height;
        }
        Ok(())
    };

    if hdr.is_intra() {
        read_frame_size(r, &mut hdr)?;
        hdr.allow_intrabc =
            hdr.allow_screen_content_tools && hdr.frame_type == FrameType::Key && r.get(1) != 0;
        hdr.hp = !hdr.force_integer_mv;
    } else {
        if seq.order_hint && r.get(1) != 0 {
            return Err(Av1Error::UnsupportedProfile("short ref signaling"));
        }
        for idx in hdr.refidx.iter_mut() {
            *idx = r.get(3) as u8;
            if seq.frame_id_numbers_present {
                r.get(seq.delta_frame_id_n_bits);
            }
        }
        if frame_size_override && !hdr.error_resilient {
            let mut found = false;
            for _ in 0..7 {
                if r.get(1) != 0 {
                    // the size is inherited from the reference; all our
                    // references keep the sequence maximum
                    hdr.width = seq.max_width;
                    hdr.height = seq.max_height;
                    hdr.render_width = hdr.width;
                    hdr.render_height = hdr.height;
                    if seq.super_res && r.get(1) != 0 {
                        return Err(Av1Error::UnsupportedProfile("superres"));
                    }
                    found = true;
                    break;
                }
            }
            if !found {
                read_frame_size(r, &mut hdr)?;
            }
        } else {
            read_frame_size(r, &mut hdr)?;
        }
        hdr.hp = !hdr.force_integer_mv && r.get(1) != 0;
        hdr.subpel_filter_switchable = r.get(1) != 0;
        hdr.subpel_filter_mode = if hdr.subpel_filter_switchable {
            0
        } else {
            r.get(2) as u8
        };
        hdr.switchable_motion_mode = r.get(1) != 0;
        hdr.use_ref_frame_mvs = !hdr.error_resilient
            && seq.ref_frame_mvs
            && seq.order_hint
            && r.get(1) != 0;
    }

    hdr.refresh_context = if seq.reduced_still_picture || hdr.disable_cdf_update {
        false
    } else {
        r.get(1) == 0
    };

    let bw4 = (hdr.width + 7) >> 3 << 1;
    let bh4 = (hdr.height + 7) >> 3 << 1;
    hdr.tiling = parse_tile_info(r, seq, bw4, bh4)?;

    // quantization
    hdr.quant.yac = r.get(8) as u8;
    hdr.quant.ydc_delta = read_delta_q(r);
    if seq.layout.has_chroma() {
        let diff_uv_delta = seq.separate_uv_delta_q && r.get(1) != 0;
        hdr.quant.udc_delta = read_delta_q(r);
        hdr.quant.uac_delta = read_delta_q(r);
        if diff_uv_delta {
            hdr.quant.vdc_delta = read_delta_q(r);
            hdr.quant.vac_delta = read_delta_q(r);
        } else {
            hdr.quant.vdc_delta = hdr.quant.udc_delta;
            hdr.quant.vac_delta = hdr.quant.uac_delta;
        }
    }
    hdr.quant.qm = r.get(1) != 0;
    if hdr.quant.qm {
        hdr.quant.qm_y = r.get(4) as u8;
        hdr.quant.qm_u = r.get(4) as u8;
        hdr.quant.qm_v = if seq.separate_uv_delta_q {
            r.get(4) as u8
        } else {
            hdr.quant.qm_u
        };
    }

    let primary_slot = refs.primary_slot(&hdr);
    hdr.segmentation = parse_segmentation(
        r,
        primary_slot.is_none(),
        primary_slot.and_then(|s| refs.seg[s].as_ref()),
    )?;
    for i in 0..NUM_SEGMENTS {
        let q = hdr.quant.yac as i32 + hdr.segmentation.seg_data[i].delta_q as i32;
        hdr.segmentation.lossless[i] = q.clamp(0, 255) == 0
            && hdr.quant.ydc_delta == 0
            && hdr.quant.udc_delta == 0
            && hdr.quant.uac_delta == 0
            && hdr.quant.vdc_delta == 0
            && hdr.quant.vac_delta == 0;
    }
    let n_segs = if hdr.segmentation.enabled {
        NUM_SEGMENTS
    } else {
        1
    };
    hdr.coded_lossless = hdr.segmentation.lossless[..n_segs].iter().all(|&l| l);
    hdr.all_lossless = hdr.coded_lossless;

    // delta q / lf
    if hdr.quant.yac > 0 {
        hdr.delta.q.present = r.get(1) != 0;
        if hdr.delta.q.present {
            hdr.delta.q.res_log2 = r.get(2);
            if !hdr.allow_intrabc {
                hdr.delta.lf.present = r.get(1) != 0;
                if hdr.delta.lf.present {
                    hdr.delta.lf.res_log2 = r.get(2);
                    hdr.delta.lf.multi = r.get(1) != 0;
                }
            }
        }
    }

    let skip_filters = hdr.coded_lossless || hdr.allow_intrabc;
    hdr.loopfilter = parse_loopfilter(r, seq.layout.has_chroma(), skip_filters)?;
    if let Some(prev) = primary_slot.and_then(|s| refs.loopfilter[s].as_ref()) {
        if !hdr.loopfilter.mode_ref_delta_enabled {
            hdr.loopfilter.ref_deltas = prev.ref_deltas;
            hdr.loopfilter.mode_deltas = prev.mode_deltas;
        }
    }
    hdr.cdef = parse_cdef(r, seq, skip_filters)?;
    hdr.restoration = parse_restoration(r, seq, hdr.all_lossless || hdr.allow_intrabc)?;

    hdr.txfm_mode = if hdr.coded_lossless {
        TxfmMode::Only4x4
    } else if r.get(1) != 0 {
        TxfmMode::Switchable
    } else {
        TxfmMode::Largest
    };

    if !hdr.is_intra() {
        hdr.switchable_comp_refs = r.get(1) != 0;
    }

    derive_skip_mode(&mut hdr, seq, refs);
    if hdr.skip_mode_allowed {
        hdr.skip_mode_enabled = r.get(1) != 0;
    }

    hdr.warp_motion = if !hdr.error_resilient && !hdr.is_intra() && seq.warped_motion {
        r.get(1) != 0
    } else {
        false
    };
    hdr.reduced_txtp_set = r.get(1) != 0;

    if !hdr.is_intra() {
        let prev_gmv = primary_slot.and_then(|s| refs.gmv[s].as_ref());
        hdr.gmv = parse_gmv(r, hdr.hp, prev_gmv)?;
    }
    hdr.film_grain = parse_film_grain(r, seq, hdr.show_frame || hdr.showable_frame)?;

    check(r)?;
    Ok(hdr)
}

/// Derive the skip-mode reference pair from the order hints of the frame's
/// references: the nearest forward and backward references when both exist,
/// otherwise the two nearest forward ones.
fn derive_skip_mode(hdr: &mut FrameHeader, seq: &SequenceHeader, refs: &RefState) {
    hdr.skip_mode_allowed = false;
    hdr.skip_mode_refs = [-1, -1];
    if hdr.is_intra() || !hdr.switchable_comp_refs || !seq.order_hint {
        return;
    }
    let bits = seq.order_hint_n_bits;
    let cur = hdr.frame_offset;
    let mut fwd: Option<(usize, u32)> = None;
    let mut bwd: Option<(usize, u32)> = None;
    for i in 0..7 {
        let Some(poc) = refs.ref_poc[hdr.refidx[i] as usize] else {
            continue;
        };
        let d = crate::env::get_poc_diff(bits, poc, cur);
        if d < 0 {
            if fwd.map_or(true, |(_, p)| crate::env::get_poc_diff(bits, poc, p) > 0) {
                fwd = Some((i, poc));
            }
        } else if d > 0 && bwd.map_or(true, |(_, p)| crate::env::get_poc_diff(bits, poc, p) < 0) {
            bwd = Some((i, poc));
        }
    }
    match (fwd, bwd) {
        (Some((f, _)), Some((b, _))) => {
            hdr.skip_mode_allowed = true;
            hdr.skip_mode_refs = [f.min(b) as i8, f.max(b) as i8];
        }
        (Some((f, fpoc)), None) => {
            // second-nearest forward reference
            let mut second: Option<(usize, u32)> = None;
            for i in 0..7 {
                if i == f {
                    continue;
                }
                let Some(poc) = refs.ref_poc[hdr.refidx[i] as usize] else {
                    continue;
                };
                if crate::env::get_poc_diff(bits, poc, cur) < 0
                    && poc != fpoc
                    && second.map_or(true, |(_, p)| crate::env::get_poc_diff(bits, poc, p) > 0)
                {
                    second = Some((i, poc));
                }
            }
            if let Some((s, _)) = second {
                hdr.skip_mode_allowed = true;
                hdr.skip_mode_refs = [f.min(s) as i8, f.max(s) as i8];
            }
        }
        _ => {}
    }
}

fn blank_header() -> FrameHeader {
    FrameHeader {
        show_existing_frame: false,
        existing_frame_idx: 0,
        frame_type: FrameType::Key,
        show_frame: false,
        showable_frame: false,
        error_resilient: false,
        disable_cdf_update: false,
        allow_screen_content_tools: false,
        force_integer_mv: false,
        frame_offset: 0,
        primary_ref_frame: PRIMARY_REF_NONE,
        refresh_frame_flags: 0,
        width: 0,
        height: 0,
        render_width: 0,
        render_height: 0,
        allow_intrabc: false,
        refidx: [0; 7],
        hp: false,
        subpel_filter_mode: 0,
        subpel_filter_switchable: false,
        switchable_motion_mode: false,
        use_ref_frame_mvs: false,
        refresh_context: false,
        tiling: TileInfo::default(),
        quant: QuantParams::default(),
        segmentation: SegmentationParams::default(),
        delta: DeltaParams::default(),
        loopfilter: LoopFilterParams::default(),
        cdef: CdefParams::default(),
        restoration: RestorationParams::default(),
        txfm_mode: TxfmMode::Largest,
        switchable_comp_refs: false,
        skip_mode_allowed: false,
        skip_mode_enabled: false,
        skip_mode_refs: [-1, -1],
        warp_motion: false,
        reduced_txtp_set: false,
        gmv: [WarpedMotionParams::default(); 7],
        film_grain: FilmGrainData::default(),
        coded_lossless: false,
        all_lossless: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overture_core::BitWriter;

    fn write_min_sequence(w: &mut BitWriter) {
        w.write_bits(0, 3); // profile 0
        w.write_bit(false); // still_picture
        w.write_bit(false); // reduced_still_picture
        w.write_bit(false); // timing_info
        w.write_bits(0, 5); // one operating point
        w.write_bits(0, 12);
        w.write_bits(0, 5);
        w.write_bits(5, 4); // width bits - 1
        w.write_bits(5, 4); // height bits - 1
        w.write_bits(63, 6); // max width 64
        w.write_bits(63, 6); // max height 64
        w.write_bit(false); // frame ids
        w.write_bit(false); // sb128
        w.write_bit(false); // filter intra
        w.write_bit(false); // intra edge filter
        w.write_bit(false); // interintra
        w.write_bit(false); // masked compound
        w.write_bit(false); // warped motion
        w.write_bit(false); // dual filter
        w.write_bit(false); // order hint
        w.write_bit(false); // scc: not adaptive
        w.write_bit(false); // scc: off
        w.write_bit(false); // superres
        w.write_bit(false); // cdef
        w.write_bit(false); // restoration
        w.write_bit(false); // high bitdepth
        w.write_bit(true); // monochrome
        w.write_bit(false); // color description
        w.write_bit(false); // color range
        w.write_bit(false); // film grain
    }

    #[test]
    fn test_sequence_header_roundtrip() {
        let mut w = BitWriter::new();
        write_min_sequence(&mut w);
        w.align_to_byte();
        let data = w.into_data();
        let mut r = BitReader::new(&data);
        let seq = parse_sequence_header(&mut r).unwrap();
        assert_eq!(seq.profile, 0);
        assert_eq!(seq.max_width, 64);
        assert_eq!(seq.max_height, 64);
        assert!(!seq.sb128);
        assert!(seq.monochrome);
        assert_eq!(seq.layout, PixelLayout::I400);
        assert_eq!(seq.bpc, 8);
        assert_eq!(seq.screen_content_tools, SeqSwitch::Off);
    }

    #[test]
    fn test_sequence_rejects_timing_info() {
        let mut w = BitWriter::new();
        w.write_bits(0, 3);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(true); // timing info present
        w.align_to_byte();
        let data = w.into_data();
        let mut r = BitReader::new(&data);
        assert!(matches!(
            parse_sequence_header(&mut r),
            Err(Av1Error::UnsupportedProfile(_))
        ));
    }

    #[test]
    fn test_tile_log2() {
        assert_eq!(tile_log2(64, 1), 0);
        assert_eq!(tile_log2(64, 64), 0);
        assert_eq!(tile_log2(64, 65), 1);
        assert_eq!(tile_log2(1, 64), 6);
    }

    #[test]
    fn test_truncated_header_is_error() {
        let data = [0u8; 2];
        let mut r = BitReader::new(&data);
        // runs off the end of two zero bytes long before completion
        assert!(parse_sequence_header(&mut r).is_err());
    }
}
