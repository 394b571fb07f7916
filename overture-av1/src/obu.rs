//! Open Bitstream Unit framing.
//!
//! Walks the typed OBU stream, routes sequence and frame headers to the
//! header parsers, collects tile-group byte ranges and submits a frame once
//! its last tile has arrived. Fused frame OBUs (header plus tile group in
//! one unit) are handled the same way.

use std::sync::Arc;

use tracing::debug;

use crate::decoder::{Decoder, TileGroup};
use crate::error::{Av1Error, Result};
use crate::headers::{parse_frame_header, parse_sequence_header};
use overture_core::{BitReader, Picture};

const OBU_SEQ_HDR: u32 = 1;
const OBU_TD: u32 = 2;
const OBU_FRAME_HDR: u32 = 3;
const OBU_TILE_GRP: u32 = 4;
const OBU_METADATA: u32 = 5;
const OBU_FRAME: u32 = 6;
const OBU_REDUNDANT_FRAME_HDR: u32 = 7;
const OBU_PADDING: u32 = 15;

fn read_leb128(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..8 {
        let Some(&byte) = data.get(*pos) else {
            return Err(Av1Error::InvalidBitstream("leb128 truncated"));
        };
        *pos += 1;
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Av1Error::InvalidBitstream("leb128 too long"))
}

impl Decoder {
    /// Feed a buffer of OBUs; returns the pictures delivered so far.
    ///
    /// With frame threading enabled, pictures surface with pipeline delay;
    /// call [`Decoder::finish`] to drain the tail.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Picture>> {
        let data = Arc::new(data.to_vec());
        let mut pos = 0;
        while pos < data.len() {
            pos = self.parse_obu(&data, pos)?;
        }
        Ok(self.drain_output())
    }

    fn parse_obu(&mut self, data: &Arc<Vec<u8>>, mut pos: usize) -> Result<usize> {
        let header = data[pos];
        if header & 0x80 != 0 {
            return Err(Av1Error::InvalidBitstream("obu forbidden bit set"));
        }
        let obu_type = u32::from(header >> 3) & 0xf;
        let has_extension = header & 0x04 != 0;
        let has_size = header & 0x02 != 0;
        pos += 1;
        if has_extension {
            if pos >= data.len() {
                return Err(Av1Error::InvalidBitstream("obu extension truncated"));
            }
            pos += 1;
        }
        let size = if has_size {
            read_leb128(data, &mut pos)? as usize
        } else {
            data.len() - pos
        };
        if pos + size > data.len() {
            return Err(Av1Error::InvalidBitstream("obu payload truncated"));
        }
        let payload = pos..pos + size;

        match obu_type {
            OBU_SEQ_HDR => {
                let mut r = BitReader::new(&data[payload.clone()]);
                let seq = parse_sequence_header(&mut r)?;
                debug!(
                    w = seq.max_width,
                    h = seq.max_height,
                    bpc = seq.bpc,
                    layout = %seq.layout,
                    "sequence header"
                );
                self.seq = Some(Arc::new(seq));
            }
            OBU_TD => {
                self.pending_hdr = None;
                self.pending_tiles.clear();
                self.tiles_seen = 0;
            }
            OBU_FRAME_HDR | OBU_FRAME => {
                let seq = self.seq.clone().ok_or(Av1Error::NoSequenceHeader)?;
                let refs = self.ref_state();
                let mut r = BitReader::new(&data[payload.clone()]);
                let hdr = parse_frame_header(&mut r, &seq, &refs)?;
                if hdr.show_existing_frame {
                    self.show_existing(hdr.existing_frame_idx as usize)?;
                } else {
                    let n_tiles = hdr.tiling.cols * hdr.tiling.rows;
                    self.pending_hdr = Some(Arc::new(hdr));
                    self.pending_tiles.clear();
                    self.tiles_seen = 0;
                    if obu_type == OBU_FRAME {
                        // the tile group starts at the next byte boundary
                        let hdr_bytes = r.flush();
                        let group_range = payload.start + hdr_bytes..payload.end;
                        self.queue_tile_group(data.clone(), group_range, 0, n_tiles - 1)?;
                    }
                }
            }
            OBU_TILE_GRP => {
                let Some(hdr) = self.pending_hdr.clone() else {
                    return Err(Av1Error::InvalidBitstream("tile group without frame header"));
                };
                let n_tiles = hdr.tiling.cols * hdr.tiling.rows;
                let mut r = BitReader::new(&data[payload.clone()]);
                let (start, end) = if n_tiles > 1 && r.get(1) != 0 {
                    let bits = hdr.tiling.log2_cols + hdr.tiling.log2_rows;
                    (r.get(bits), r.get(bits))
                } else {
                    (0, n_tiles - 1)
                };
                if r.has_error() || end < start || end >= n_tiles {
                    return Err(Av1Error::InvalidBitstream("bad tile group header"));
                }
                let hdr_bytes = r.flush();
                let group_range = payload.start + hdr_bytes..payload.end;
                self.queue_tile_group(data.clone(), group_range, start, end)?;
            }
            OBU_METADATA | OBU_PADDING | OBU_REDUNDANT_FRAME_HDR => {}
            _ => {
                debug!(obu_type, "skipping unknown obu");
            }
        }
        Ok(payload.end)
    }

    fn queue_tile_group(
        &mut self,
        data: Arc<Vec<u8>>,
        range: std::ops::Range<usize>,
        start: u32,
        end: u32,
    ) -> Result<()> {
        let hdr = self.pending_hdr.as_ref().expect("pending frame header");
        let n_tiles = hdr.tiling.cols * hdr.tiling.rows;
        if start != self.tiles_seen {
            return Err(Av1Error::InvalidBitstream("tile group out of order"));
        }
        self.tiles_seen = end + 1;
        self.pending_tiles.push(TileGroup {
            data,
            range,
            start,
            end,
        });
        if self.tiles_seen == n_tiles {
            self.submit_frame()?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128() {
        let data = [0x2a];
        let mut pos = 0;
        assert_eq!(read_leb128(&data, &mut pos).unwrap(), 42);
        assert_eq!(pos, 1);

        let data = [0x80, 0x01];
        let mut pos = 0;
        assert_eq!(read_leb128(&data, &mut pos).unwrap(), 128);
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_leb128_truncated() {
        let data = [0x80];
        let mut pos = 0;
        assert!(read_leb128(&data, &mut pos).is_err());
    }

    #[test]
    fn test_forbidden_bit_rejected() {
        let mut dec = Decoder::new_default();
        assert!(dec.decode(&[0x80, 0x00]).is_err());
    }

    #[test]
    fn test_tile_group_requires_header() {
        let mut dec = Decoder::new_default();
        // tile group OBU (type 4) with size 1
        let res = dec.decode(&[(4 << 3) | 0x02, 0x01, 0x00]);
        assert!(res.is_err());
    }
}
