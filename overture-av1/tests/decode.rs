//! End-to-end decode scenarios over synthetic bitstreams.

mod common;

use common::*;
use overture_av1::cdf::CdfContext;
use overture_av1::tables::BlockLevel;
use overture_av1::{Av1Error, Decoder, DecoderConfig};
use overture_core::Picture;

fn decoder(n_frame_threads: usize, n_tile_threads: usize) -> Decoder {
    Decoder::new(DecoderConfig {
        n_frame_threads,
        n_tile_threads,
        allocator: None,
    })
}

fn visible_luma(picture: &Picture) -> Vec<u8> {
    let stride = picture.stride(0);
    let plane = picture.plane(0);
    let mut out = Vec::new();
    for y in 0..picture.params.h as usize {
        out.extend_from_slice(&plane[y * stride..y * stride + picture.params.w as usize]);
    }
    out
}

fn visible_plane(picture: &Picture, pl: usize) -> Vec<u8> {
    let layout = picture.params.layout;
    let (ss_hor, ss_ver) = if pl == 0 {
        (0, 0)
    } else {
        (layout.ss_hor() as usize, layout.ss_ver() as usize)
    };
    let stride = picture.stride(pl);
    let plane = picture.plane(pl);
    let w = (picture.params.w as usize + (1 << ss_hor) - 1) >> ss_hor;
    let h = (picture.params.h as usize + (1 << ss_ver) - 1) >> ss_ver;
    let mut out = Vec::new();
    for y in 0..h {
        out.extend_from_slice(&plane[y * stride..y * stride + w]);
    }
    out
}

/// Key-frame tile: one unsplit DC block, skip set.
fn dc_key_tile(cdf: CdfContext, partition_level: BlockLevel) -> Vec<u8> {
    let mut te = TileEnc::new(cdf);
    te.partition(partition_level, 0, 0, 10);
    te.skip(0, true);
    te.kf_ymode(0, 0, 0);
    te.finish()
}

#[test]
fn minimal_keyframe_decodes_to_dc() {
    let seq = SeqSpec::new(16, 16);
    let frame = FrameSpec::key(60);

    let mut stream = seq_obu(&seq);
    stream.extend(frame_hdr_obu(&seq, &frame));
    let tile = dc_key_tile(CdfContext::new(60), BlockLevel::Bl16x16);
    stream.extend(tile_group_obu(1, &[tile]));

    let mut dec = decoder(1, 1);
    let pictures = dec.decode(&stream).unwrap();
    assert_eq!(pictures.len(), 1);
    let p = &pictures[0];
    assert_eq!(p.poc, 0);
    assert_eq!(p.num_planes(), 1);
    assert_eq!(p.params.w, 16);
    assert!(visible_luma(p).iter().all(|&v| v == 128));
}

#[test]
fn two_tile_keyframe_with_delta_q() {
    let seq = SeqSpec::new(128, 32).with_chroma();
    let mut frame = FrameSpec::key(100);
    frame.log2_tile_cols = 1;
    frame.delta_q_present = true;

    // each tile covers one 64x64 superblock cut to 64x32 by the frame edge
    let make_tile = |delta: i32| {
        let mut te = TileEnc::new(CdfContext::new(100));
        te.split_bool_top(BlockLevel::Bl64x64, 0, false);
        te.skip(0, true);
        te.delta_q(delta);
        te.kf_ymode(0, 0, 0);
        te.uv_mode(false, 0, 0);
        te.finish()
    };

    let mut stream = seq_obu(&seq);
    stream.extend(frame_hdr_obu(&seq, &frame));
    stream.extend(tile_group_obu(2, &[make_tile(0), make_tile(1)]));

    let mut dec = decoder(1, 1);
    let pictures = dec.decode(&stream).unwrap();
    assert_eq!(pictures.len(), 1);
    let p = &pictures[0];
    assert_eq!(p.num_planes(), 3);
    assert!(visible_luma(p).iter().all(|&v| v == 128));
    assert!(visible_plane(p, 1).iter().all(|&v| v == 128));
    assert!(visible_plane(p, 2).iter().all(|&v| v == 128));
}

#[test]
fn two_tile_keyframe_parallel_tiles_match() {
    let seq = SeqSpec::new(128, 32).with_chroma();
    let mut frame = FrameSpec::key(100);
    frame.log2_tile_cols = 1;
    frame.delta_q_present = true;

    let make_tile = |delta: i32| {
        let mut te = TileEnc::new(CdfContext::new(100));
        te.split_bool_top(BlockLevel::Bl64x64, 0, false);
        te.skip(0, true);
        te.delta_q(delta);
        te.kf_ymode(0, 0, 0);
        te.uv_mode(false, 0, 0);
        te.finish()
    };

    let mut stream = seq_obu(&seq);
    stream.extend(frame_hdr_obu(&seq, &frame));
    stream.extend(tile_group_obu(2, &[make_tile(2), make_tile(-2)]));

    let mut serial = decoder(1, 1);
    let baseline = serial.decode(&stream).unwrap();
    let mut parallel = decoder(1, 4);
    let threaded = parallel.decode(&stream).unwrap();
    assert_eq!(baseline.len(), 1);
    assert_eq!(threaded.len(), 1);
    assert_eq!(visible_luma(&baseline[0]), visible_luma(&threaded[0]));
}

/// Inter tile: one unsplit block predicted with NEARESTMV from LAST.
fn nearestmv_tile(cdf: CdfContext) -> Vec<u8> {
    let mut te = TileEnc::new(cdf);
    te.partition(BlockLevel::Bl64x64, 0, 0, 10);
    te.skip(0, true);
    te.intra_bool(0, true);
    // single-reference tree: LAST is three zero branches
    te.enc.bool_adapt(false, &mut te.cdf.m.ref_bit[0][1]);
    te.enc.bool_adapt(false, &mut te.cdf.m.ref_bit[2][1]);
    te.enc.bool_adapt(false, &mut te.cdf.m.ref_bit[3][1]);
    // NEARESTMV: not-new, not-global, nearest
    te.enc.bool_adapt(true, &mut te.cdf.m.newmv_mode[0]);
    te.enc.bool_adapt(true, &mut te.cdf.m.globalmv_mode[1]);
    te.enc.bool_adapt(false, &mut te.cdf.m.refmv_mode[0]);
    te.finish()
}

fn inter_stream() -> Vec<u8> {
    let seq = SeqSpec::new(64, 64).with_order_hint(7);
    let mut stream = seq_obu(&seq);

    let key = FrameSpec::key(60);
    stream.extend(frame_hdr_obu(&seq, &key));
    stream.extend(tile_group_obu(
        1,
        &[dc_key_tile(CdfContext::new(60), BlockLevel::Bl64x64)],
    ));

    let inter = FrameSpec::inter(60, 1);
    stream.extend(frame_hdr_obu(&seq, &inter));
    stream.extend(tile_group_obu(1, &[nearestmv_tile(CdfContext::new(60))]));
    stream
}

#[test]
fn inter_frame_copies_reference() {
    let stream = inter_stream();
    let mut dec = decoder(1, 1);
    let mut pictures = dec.decode(&stream).unwrap();
    pictures.extend(dec.finish());
    assert_eq!(pictures.len(), 2);
    assert_eq!(visible_luma(&pictures[0]), visible_luma(&pictures[1]));
    assert_eq!(pictures[1].poc, 1);
}

#[test]
fn inter_frame_waits_on_reference_progress() {
    // frame threading makes the inter block gate on the key frame's
    // pixel-progress counter
    let stream = inter_stream();
    let mut dec = decoder(2, 1);
    let mut pictures = dec.decode(&stream).unwrap();
    pictures.extend(dec.finish());
    assert_eq!(pictures.len(), 2);
    assert_eq!(visible_luma(&pictures[0]), visible_luma(&pictures[1]));
}

#[test]
fn missing_reference_is_rejected() {
    let seq = SeqSpec::new(64, 64).with_order_hint(7);
    let mut stream = seq_obu(&seq);
    let inter = FrameSpec::inter(60, 1);
    stream.extend(frame_hdr_obu(&seq, &inter));
    stream.extend(tile_group_obu(1, &[nearestmv_tile(CdfContext::new(60))]));

    let mut dec = decoder(1, 1);
    assert!(matches!(
        dec.decode(&stream),
        Err(Av1Error::ReferenceMissing(_))
    ));
}

/// Encode the wave-front color-index map for a visible `w4 x h4` region.
fn encode_palette_map(
    te: &mut TileEnc,
    w4: usize,
    h4: usize,
    pal_sz: usize,
    value: impl Fn(usize, usize) -> u8,
) {
    let w = w4 * 4;
    let h = h4 * 4;
    let mut map = vec![0u8; w * h];
    map[0] = value(0, 0);
    te.enc.uniform(map[0] as u32, pal_sz as u32);
    for i in 1..(w + h - 1) {
        let first = i.min(w - 1);
        let last = i.saturating_sub(h - 1);
        for j in (last..=first).rev() {
            let (x, y) = (j, i - j);
            let v = value(x, y);
            let top = (y > 0).then(|| map[(y - 1) * w + x]);
            let left = (x > 0).then(|| map[y * w + x - 1]);
            let tl = (y > 0 && x > 0).then(|| map[(y - 1) * w + x - 1]);
            let (ctx, order) = palette_order(top, left, tl);
            let sym = order.iter().position(|&o| o == v).unwrap();
            te.enc
                .symbol(sym, &mut te.cdf.m.color_map[0][pal_sz - 2][ctx], pal_sz);
            map[y * w + x] = v;
        }
    }
}

/// Palette entries {10, 50, 200}: size symbol, cache pass-over, then the
/// ascending delta-coded colors.
fn encode_palette_colors(te: &mut TileEnc, sz_ctx: usize) {
    te.enc
        .bool_adapt(true, &mut te.cdf.m.pal_y[sz_ctx][0]);
    te.enc.symbol(1, &mut te.cdf.m.pal_sz[0][sz_ctx], 7);
    te.enc.bools(10, 8);
    te.enc.bools(3, 2); // delta width 5 + 3
    te.enc.bools(39, 8); // 10 -> 50
    te.enc.bools(149, 8); // 50 -> 200
}

#[test]
fn palette_block_reconstructs_pattern() {
    let seq = SeqSpec::new(8, 8).with_screen_content();
    let frame = FrameSpec::key(60);

    let mut te = TileEnc::new(CdfContext::new(60));
    te.partition(BlockLevel::Bl8x8, 0, 0, 4);
    te.skip(0, true);
    te.kf_ymode(0, 0, 0);
    encode_palette_colors(&mut te, 0);
    encode_palette_map(&mut te, 2, 2, 3, |x, y| ((x + y) % 3) as u8);
    let tile = te.finish();

    let mut stream = seq_obu(&seq);
    stream.extend(frame_hdr_obu(&seq, &frame));
    stream.extend(tile_group_obu(1, &[tile]));

    let mut dec = decoder(1, 1);
    let pictures = dec.decode(&stream).unwrap();
    assert_eq!(pictures.len(), 1);
    let luma = visible_luma(&pictures[0]);
    let palette = [10u8, 50, 200];
    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(luma[y * 8 + x], palette[(x + y) % 3], "at ({x},{y})");
        }
    }
}

#[test]
fn palette_block_at_frame_edge() {
    // a 32x16 coded block over a 24x16 frame: the invisible right columns
    // replicate and must not disturb the visible pattern
    let seq = SeqSpec::new(24, 16).with_screen_content();
    let frame = FrameSpec::key(60);

    let mut te = TileEnc::new(CdfContext::new(60));
    te.split_bool_top(BlockLevel::Bl32x32, 0, false);
    te.skip(0, true);
    te.kf_ymode(0, 0, 0);
    encode_palette_colors(&mut te, 3);
    encode_palette_map(&mut te, 6, 4, 3, |x, y| ((x + y) % 3) as u8);
    let tile = te.finish();

    let mut stream = seq_obu(&seq);
    stream.extend(frame_hdr_obu(&seq, &frame));
    stream.extend(tile_group_obu(1, &[tile]));

    let mut dec = decoder(1, 1);
    let pictures = dec.decode(&stream).unwrap();
    assert_eq!(pictures.len(), 1);
    let luma = visible_luma(&pictures[0]);
    let palette = [10u8, 50, 200];
    for y in 0..16 {
        for x in 0..24 {
            assert_eq!(luma[y * 24 + x], palette[(x + y) % 3], "at ({x},{y})");
        }
    }
}

fn two_pass_stream() -> Vec<u8> {
    let seq = SeqSpec::new(64, 64);
    let mut stream = seq_obu(&seq);

    // key frame that publishes its adapted CDFs
    let key = FrameSpec::key(60);
    let mut te = TileEnc::new(CdfContext::new(60));
    te.partition(BlockLevel::Bl64x64, 0, 0, 10);
    te.skip(0, true);
    te.kf_ymode(0, 0, 0);
    let final_cdf = te.cdf.clone();
    let key_tile = te.finish();
    stream.extend(frame_hdr_obu(&seq, &key));
    stream.extend(tile_group_obu(1, &[key_tile]));

    // inter frame that inherits them through its primary reference
    let mut inter = FrameSpec::inter(60, 0);
    inter.error_resilient = false;
    inter.primary_ref = Some(0);
    stream.extend(frame_hdr_obu(&seq, &inter));
    stream.extend(tile_group_obu(1, &[nearestmv_tile(final_cdf.promoted())]));
    stream
}

#[test]
fn frame_threading_matches_single_thread() {
    let stream = two_pass_stream();

    let mut single = decoder(1, 1);
    let mut out_single = single.decode(&stream).unwrap();
    out_single.extend(single.finish());

    let mut threaded = decoder(2, 1);
    let mut out_threaded = threaded.decode(&stream).unwrap();
    out_threaded.extend(threaded.finish());

    assert_eq!(out_single.len(), 2);
    assert_eq!(out_threaded.len(), 2);
    for (a, b) in out_single.iter().zip(out_threaded.iter()) {
        assert_eq!(visible_luma(a), visible_luma(b));
        assert_eq!(a.poc, b.poc);
    }
}

#[test]
fn oversized_tile_drops_frame_and_recovers() {
    let seq = SeqSpec::new(128, 32).with_chroma();
    let mut frame = FrameSpec::key(100);
    frame.log2_tile_cols = 1;

    let make_tile = || {
        let mut te = TileEnc::new(CdfContext::new(100));
        te.split_bool_top(BlockLevel::Bl64x64, 0, false);
        te.skip(0, true);
        te.kf_ymode(0, 0, 0);
        te.uv_mode(false, 0, 0);
        te.finish()
    };

    let mut dec = decoder(1, 1);

    // a good key frame first, so slot 0 holds a picture
    let mut good = seq_obu(&seq);
    good.extend(frame_hdr_obu(&seq, &frame));
    good.extend(tile_group_obu(2, &[make_tile(), make_tile()]));
    let pictures = dec.decode(&good).unwrap();
    assert_eq!(pictures.len(), 1);

    // same frame, but the first tile declares more bytes than remain
    let mut bad_group = Vec::new();
    bad_group.push(0u8); // tile_start_and_end_present = 0 (byte aligned)
    bad_group.push(200); // size prefix far past the payload end
    bad_group.extend(make_tile());
    bad_group.extend(make_tile());
    let mut bad = frame_hdr_obu(&seq, &frame);
    bad.extend(obu(OBU_TILE_GRP, &bad_group));
    assert!(matches!(
        dec.decode(&bad),
        Err(Av1Error::InvalidBitstream(_))
    ));

    // the prior reference survived: showing it still works
    let mut show = overture_core::BitWriter::new();
    show.write_bit(true); // show_existing_frame
    show.write_bits(0, 3); // slot 0
    show.align_to_byte();
    let show_obu = obu(OBU_FRAME_HDR, show.data());
    let pictures = dec.decode(&show_obu).unwrap();
    assert_eq!(pictures.len(), 1);
    assert!(visible_luma(&pictures[0]).iter().all(|&v| v == 128));

    // and the next coded frame decodes normally
    let mut next = frame_hdr_obu(&seq, &frame);
    next.extend(tile_group_obu(2, &[make_tile(), make_tile()]));
    let pictures = dec.decode(&next).unwrap();
    assert_eq!(pictures.len(), 1);
}

#[test]
fn flush_discards_in_flight_pictures() {
    let stream = two_pass_stream();
    let mut dec = decoder(2, 1);
    let early = dec.decode(&stream).unwrap();
    dec.flush();
    let drained = dec.finish();
    // at most the first frame escaped before the flush
    assert!(early.len() + drained.len() <= 1);
}
