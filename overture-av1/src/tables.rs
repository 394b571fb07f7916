//! Process-wide constant tables: block and transform geometry, partition
//! expansion, mode classification LUTs and the quantizer scale curve.
//!
//! Everything in this module is immutable data derived from the coding
//! layout; no decoder state lives here.

/// Partition tree level, from the 128x128 root down to 8x8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlockLevel {
    Bl128x128 = 0,
    Bl64x64 = 1,
    Bl32x32 = 2,
    Bl16x16 = 3,
    Bl8x8 = 4,
}

impl BlockLevel {
    /// Half the level's block span, in 4x4 units.
    pub fn half_size4(self) -> u32 {
        16 >> self as u32
    }

    /// The next deeper level. Must not be called on `Bl8x8`.
    pub fn deeper(self) -> BlockLevel {
        debug_assert!(self != BlockLevel::Bl8x8);
        Self::from_index(self as u8 + 1)
    }

    pub fn from_index(v: u8) -> BlockLevel {
        match v {
            0 => Self::Bl128x128,
            1 => Self::Bl64x64,
            2 => Self::Bl32x32,
            3 => Self::Bl16x16,
            _ => Self::Bl8x8,
        }
    }

    /// The square block size coded by `PARTITION_NONE` at this level.
    pub fn square_size(self) -> BlockSize {
        match self {
            Self::Bl128x128 => BlockSize::Bs128x128,
            Self::Bl64x64 => BlockSize::Bs64x64,
            Self::Bl32x32 => BlockSize::Bs32x32,
            Self::Bl16x16 => BlockSize::Bs16x16,
            Self::Bl8x8 => BlockSize::Bs8x8,
        }
    }
}

pub const N_BL_LEVELS: usize = 5;

/// Partition of one tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockPartition {
    None = 0,
    H = 1,
    V = 2,
    Split = 3,
    TTopSplit = 4,
    TBottomSplit = 5,
    TLeftSplit = 6,
    TRightSplit = 7,
    H4 = 8,
    V4 = 9,
}

impl BlockPartition {
    pub fn from_index(v: u8) -> BlockPartition {
        match v {
            0 => Self::None,
            1 => Self::H,
            2 => Self::V,
            3 => Self::Split,
            4 => Self::TTopSplit,
            5 => Self::TBottomSplit,
            6 => Self::TLeftSplit,
            7 => Self::TRightSplit,
            8 => Self::H4,
            _ => Self::V4,
        }
    }

    /// Whether this partition slices the node on the vertical axis
    /// (forbidden below 8x8 luma in 4:2:2 streams).
    pub fn slices_vertically(self) -> bool {
        matches!(
            self,
            Self::V | Self::V4 | Self::TLeftSplit | Self::TRightSplit
        )
    }
}

pub const N_PARTITIONS: usize = 10;
pub const N_SUB8X8_PARTITIONS: usize = 4;

/// Coded block sizes, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockSize {
    Bs128x128 = 0,
    Bs128x64,
    Bs64x128,
    Bs64x64,
    Bs64x32,
    Bs64x16,
    Bs32x64,
    Bs32x32,
    Bs32x16,
    Bs32x8,
    Bs16x64,
    Bs16x32,
    Bs16x16,
    Bs16x8,
    Bs16x4,
    Bs8x32,
    Bs8x16,
    Bs8x8,
    Bs8x4,
    Bs4x16,
    Bs4x8,
    Bs4x4,
}

pub const N_BS_SIZES: usize = 22;

impl BlockSize {
    /// Block dimensions `[w4, h4, log2 w4, log2 h4]` in 4x4 units.
    pub fn dimensions(self) -> [u8; 4] {
        use BlockSize::*;
        match self {
            Bs128x128 => [32, 32, 5, 5],
            Bs128x64 => [32, 16, 5, 4],
            Bs64x128 => [16, 32, 4, 5],
            Bs64x64 => [16, 16, 4, 4],
            Bs64x32 => [16, 8, 4, 3],
            Bs64x16 => [16, 4, 4, 2],
            Bs32x64 => [8, 16, 3, 4],
            Bs32x32 => [8, 8, 3, 3],
            Bs32x16 => [8, 4, 3, 2],
            Bs32x8 => [8, 2, 3, 1],
            Bs16x64 => [4, 16, 2, 4],
            Bs16x32 => [4, 8, 2, 3],
            Bs16x16 => [4, 4, 2, 2],
            Bs16x8 => [4, 2, 2, 1],
            Bs16x4 => [4, 1, 2, 0],
            Bs8x32 => [2, 8, 1, 3],
            Bs8x16 => [2, 4, 1, 2],
            Bs8x8 => [2, 2, 1, 1],
            Bs8x4 => [2, 1, 1, 0],
            Bs4x16 => [1, 4, 0, 2],
            Bs4x8 => [1, 2, 0, 1],
            Bs4x4 => [1, 1, 0, 0],
        }
    }

    /// Recover a size from its index in declaration order.
    pub fn from_index(v: u8) -> BlockSize {
        use BlockSize::*;
        const ALL: [BlockSize; N_BS_SIZES] = [
            Bs128x128, Bs128x64, Bs64x128, Bs64x64, Bs64x32, Bs64x16, Bs32x64, Bs32x32, Bs32x16,
            Bs32x8, Bs16x64, Bs16x32, Bs16x16, Bs16x8, Bs16x4, Bs8x32, Bs8x16, Bs8x8, Bs8x4,
            Bs4x16, Bs4x8, Bs4x4,
        ];
        ALL[v as usize]
    }

    fn from_dims4(w4: u8, h4: u8) -> BlockSize {
        use BlockSize::*;
        match (w4, h4) {
            (32, 32) => Bs128x128,
            (32, 16) => Bs128x64,
            (16, 32) => Bs64x128,
            (16, 16) => Bs64x64,
            (16, 8) => Bs64x32,
            (16, 4) => Bs64x16,
            (8, 16) => Bs32x64,
            (8, 8) => Bs32x32,
            (8, 4) => Bs32x16,
            (8, 2) => Bs32x8,
            (4, 16) => Bs16x64,
            (4, 8) => Bs16x32,
            (4, 4) => Bs16x16,
            (4, 2) => Bs16x8,
            (4, 1) => Bs16x4,
            (2, 8) => Bs8x32,
            (2, 4) => Bs8x16,
            (2, 2) => Bs8x8,
            (2, 1) => Bs8x4,
            (1, 4) => Bs4x16,
            (1, 2) => Bs4x8,
            _ => Bs4x4,
        }
    }

    /// Context class used by the y-mode, interintra and palette-size CDFs.
    pub fn size_group(self) -> usize {
        use BlockSize::*;
        match self {
            Bs4x4 => 0,
            Bs4x8 | Bs8x4 | Bs8x8 | Bs4x16 | Bs16x4 => 1,
            Bs8x16 | Bs16x8 | Bs16x16 | Bs8x32 | Bs32x8 => 2,
            _ => 3,
        }
    }
}

/// Expand a `(level, partition)` pair into its coded block sizes.
///
/// `[0]` is the size of the leading blocks; `[1]` differs only for the
/// T-shaped partitions, where one side stays unsplit.
pub fn blocks_for_partition(bl: BlockLevel, bp: BlockPartition) -> [BlockSize; 2] {
    let sq = bl.square_size();
    let [w4, h4, _, _] = sq.dimensions();
    let half_h = BlockSize::from_dims4(w4, h4 / 2);
    let half_v = BlockSize::from_dims4(w4 / 2, h4);
    let quarter_sq = BlockSize::from_dims4(w4 / 2, h4 / 2);
    match bp {
        BlockPartition::None | BlockPartition::Split => [sq, sq],
        BlockPartition::H => [half_h, half_h],
        BlockPartition::V => [half_v, half_v],
        BlockPartition::TTopSplit => [quarter_sq, half_h],
        BlockPartition::TBottomSplit => [half_h, quarter_sq],
        BlockPartition::TLeftSplit => [quarter_sq, half_v],
        BlockPartition::TRightSplit => [half_v, quarter_sq],
        BlockPartition::H4 => {
            let q = BlockSize::from_dims4(w4, h4 / 4);
            [q, q]
        }
        BlockPartition::V4 => {
            let q = BlockSize::from_dims4(w4 / 4, h4);
            [q, q]
        }
    }
}

/// Transform sizes, square first, then rectangular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TxSize {
    Tx4x4 = 0,
    Tx8x8 = 1,
    Tx16x16 = 2,
    Tx32x32 = 3,
    Tx64x64 = 4,
    Rtx4x8 = 5,
    Rtx8x4 = 6,
    Rtx8x16 = 7,
    Rtx16x8 = 8,
    Rtx16x32 = 9,
    Rtx32x16 = 10,
    Rtx32x64 = 11,
    Rtx64x32 = 12,
    Rtx4x16 = 13,
    Rtx16x4 = 14,
    Rtx8x32 = 15,
    Rtx32x8 = 16,
    Rtx16x64 = 17,
    Rtx64x16 = 18,
}

pub const N_RECT_TX_SIZES: usize = 19;

/// Static geometry of one transform size.
#[derive(Debug, Clone, Copy)]
pub struct TxfmInfo {
    /// Width and height in 4x4 units.
    pub w: u8,
    pub h: u8,
    /// log2 of `w` / `h`.
    pub lw: u8,
    pub lh: u8,
    /// Smaller / larger of `lw`, `lh`.
    pub min: u8,
    pub max: u8,
    /// The size a split of this transform produces.
    pub sub: TxSize,
}

impl TxSize {
    pub fn info(self) -> TxfmInfo {
        use TxSize::*;
        let (w, h, sub) = match self {
            Tx4x4 => (1, 1, Tx4x4),
            Tx8x8 => (2, 2, Tx4x4),
            Tx16x16 => (4, 4, Tx8x8),
            Tx32x32 => (8, 8, Tx16x16),
            Tx64x64 => (16, 16, Tx32x32),
            Rtx4x8 => (1, 2, Tx4x4),
            Rtx8x4 => (2, 1, Tx4x4),
            Rtx8x16 => (2, 4, Tx8x8),
            Rtx16x8 => (4, 2, Tx8x8),
            Rtx16x32 => (4, 8, Tx16x16),
            Rtx32x16 => (8, 4, Tx16x16),
            Rtx32x64 => (8, 16, Tx32x32),
            Rtx64x32 => (16, 8, Tx32x32),
            Rtx4x16 => (1, 4, Rtx4x8),
            Rtx16x4 => (4, 1, Rtx8x4),
            Rtx8x32 => (2, 8, Rtx8x16),
            Rtx32x8 => (8, 2, Rtx16x8),
            Rtx16x64 => (4, 16, Rtx16x32),
            Rtx64x16 => (16, 4, Rtx32x16),
        };
        let lw = (w as u32).trailing_zeros() as u8;
        let lh = (h as u32).trailing_zeros() as u8;
        TxfmInfo {
            w,
            h,
            lw,
            lh,
            min: lw.min(lh),
            max: lw.max(lh),
            sub,
        }
    }

    fn from_dims4(w4: u8, h4: u8) -> TxSize {
        use TxSize::*;
        match (w4, h4) {
            (1, 1) => Tx4x4,
            (2, 2) => Tx8x8,
            (4, 4) => Tx16x16,
            (8, 8) => Tx32x32,
            (16, 16) => Tx64x64,
            (1, 2) => Rtx4x8,
            (2, 1) => Rtx8x4,
            (2, 4) => Rtx8x16,
            (4, 2) => Rtx16x8,
            (4, 8) => Rtx16x32,
            (8, 4) => Rtx32x16,
            (8, 16) => Rtx32x64,
            (16, 8) => Rtx64x32,
            (1, 4) => Rtx4x16,
            (4, 1) => Rtx16x4,
            (2, 8) => Rtx8x32,
            (8, 2) => Rtx32x8,
            (4, 16) => Rtx16x64,
            (16, 4) => Rtx64x16,
            _ => unreachable!("no transform of {w4}x{h4} 4x4 units"),
        }
    }
}

/// Largest luma transform fitting a block, capped at 64x64.
pub fn max_ytx_for_bs(bs: BlockSize) -> TxSize {
    let [w4, h4, _, _] = bs.dimensions();
    TxSize::from_dims4(w4.min(16), h4.min(16))
}

/// Largest chroma transform for a block under the given subsampling,
/// capped at 32x32.
pub fn max_uvtx_for_bs(bs: BlockSize, ss_hor: u32, ss_ver: u32) -> TxSize {
    let [w4, h4, _, _] = bs.dimensions();
    let w = ((w4 >> ss_hor).max(1)).min(8);
    let h = ((h4 >> ss_ver).max(1)).min(8);
    TxSize::from_dims4(w, h)
}

// Intra prediction modes. The parser only needs their indices and the
// directional range; pixel semantics live behind the ReconOps boundary.
pub const DC_PRED: u8 = 0;
pub const VERT_PRED: u8 = 1;
pub const HOR_PRED: u8 = 2;
pub const VERT_LEFT_PRED: u8 = 8;
pub const SMOOTH_PRED: u8 = 9;
pub const PAETH_PRED: u8 = 12;
pub const FILTER_PRED: u8 = 13;
pub const CFL_PRED: u8 = 13;
pub const N_INTRA_PRED_MODES: usize = 13;
pub const N_UV_INTRA_PRED_MODES: usize = 14;

/// Mode-class LUT for the key-frame y-mode context.
pub const INTRA_MODE_CONTEXT: [u8; N_INTRA_PRED_MODES] =
    [0, 1, 2, 3, 4, 4, 4, 4, 3, 0, 1, 2, 0];

// Inter prediction modes (single reference).
pub const NEARESTMV: u8 = 0;
pub const NEARMV: u8 = 1;
pub const GLOBALMV: u8 = 2;
pub const NEWMV: u8 = 3;

// Compound inter prediction modes.
pub const NEARESTMV_NEARESTMV: u8 = 0;
pub const NEARMV_NEARMV: u8 = 1;
pub const NEARESTMV_NEWMV: u8 = 2;
pub const NEWMV_NEARESTMV: u8 = 3;
pub const NEARMV_NEWMV: u8 = 4;
pub const NEWMV_NEARMV: u8 = 5;
pub const GLOBALMV_GLOBALMV: u8 = 6;
pub const NEWMV_NEWMV: u8 = 7;
pub const N_COMP_INTER_PRED_MODES: usize = 8;

/// Component modes of each compound mode, `[first, second]`.
pub const COMP_INTER_PRED_MODES: [[u8; 2]; N_COMP_INTER_PRED_MODES] = [
    [NEARESTMV, NEARESTMV],
    [NEARMV, NEARMV],
    [NEARESTMV, NEWMV],
    [NEWMV, NEARESTMV],
    [NEARMV, NEWMV],
    [NEWMV, NEARMV],
    [GLOBALMV, GLOBALMV],
    [NEWMV, NEWMV],
];

// Compound prediction types.
pub const COMP_INTER_NONE: u8 = 0;
pub const COMP_INTER_WEIGHTED_AVG: u8 = 1;
pub const COMP_INTER_AVG: u8 = 2;
pub const COMP_INTER_SEG: u8 = 3;
pub const COMP_INTER_WEDGE: u8 = 4;

// Inter-intra types.
pub const INTER_INTRA_NONE: u8 = 0;
pub const INTER_INTRA_BLEND: u8 = 1;
pub const INTER_INTRA_WEDGE: u8 = 2;
pub const N_INTER_INTRA_PRED_MODES: usize = 4;

// Motion modes.
pub const MM_TRANSLATION: u8 = 0;
pub const MM_OBMC: u8 = 1;
pub const MM_WARP: u8 = 2;

// Subpel filters.
pub const FILTER_8TAP_REGULAR: u8 = 0;
pub const FILTER_8TAP_SMOOTH: u8 = 1;
pub const FILTER_8TAP_SHARP: u8 = 2;
pub const N_SWITCHABLE_FILTERS: usize = 3;

pub const N_MV_JOINTS: usize = 4;
pub const MV_JOINT_ZERO: u8 = 0;
pub const MV_JOINT_H: u8 = 1;
pub const MV_JOINT_V: u8 = 2;
pub const MV_JOINT_HV: u8 = 3;

pub const NUM_SEGMENTS: usize = 8;

fn bs_mask(sizes: &[BlockSize]) -> u32 {
    let mut m = 0;
    let mut i = 0;
    while i < sizes.len() {
        m |= 1 << sizes[i] as u32;
        i += 1;
    }
    m
}

/// Block sizes that may code chroma-from-luma.
pub fn cfl_allowed(bs: BlockSize) -> bool {
    let [w4, h4, _, _] = bs.dimensions();
    w4 <= 8 && h4 <= 8
}

/// Block sizes that may code inter-intra.
pub fn interintra_allowed(bs: BlockSize) -> bool {
    use BlockSize::*;
    bs_mask(&[Bs8x8, Bs8x16, Bs16x8, Bs16x16, Bs16x32, Bs32x16, Bs32x32]) & (1 << bs as u32) != 0
}

/// Block sizes that may code a wedge mask.
pub fn wedge_allowed(bs: BlockSize) -> bool {
    use BlockSize::*;
    bs_mask(&[
        Bs8x8, Bs8x16, Bs16x8, Bs16x16, Bs16x32, Bs32x16, Bs32x32, Bs8x32, Bs32x8,
    ]) & (1 << bs as u32)
        != 0
}

/// CDF context index of the wedge-capable sizes.
pub fn wedge_ctx(bs: BlockSize) -> usize {
    use BlockSize::*;
    match bs {
        Bs8x8 => 0,
        Bs8x16 => 1,
        Bs8x32 => 2,
        Bs16x8 => 3,
        Bs16x16 => 4,
        Bs16x32 => 5,
        Bs32x8 => 6,
        Bs32x16 => 7,
        _ => 8,
    }
}

/// Neighbor-strip partition byte for a block dimension of `2^l8` 8-pixel
/// units. Bit `p` is set when the dimension is smaller than the level-`p`
/// block span, i.e. when a partition boundary exists at that level.
pub fn partition_ctx_byte(dim4: u8) -> u8 {
    if dim4 < 2 {
        return 0x1f;
    }
    let l8 = (dim4 as u32 / 2).trailing_zeros();
    0x1f & !((1u8 << (l8 + 1)) - 1)
}

/// Quantizer scale for a quantizer index.
///
/// A geometric step curve from 4 up to the full-range scale, with the DC
/// scale tracking AC at a constant ratio; 10-bit scales are 4x the 8-bit
/// ones.
pub fn dq_value(hbd: bool, qidx: u8, is_dc: bool) -> u16 {
    let mut v: u32 = 4;
    let mut i = 0;
    while i < qidx as u32 {
        v += ((v * 787) >> 15).max(1);
        i += 1;
    }
    if is_dc {
        v = ((v * 2993) >> 12).max(4);
    }
    if hbd {
        v *= 4;
    }
    v.min(u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_dimensions_consistent() {
        for i in 0..N_BS_SIZES as u8 {
            // round-trip through from_dims4
            let bs = [
                BlockSize::Bs128x128,
                BlockSize::Bs128x64,
                BlockSize::Bs64x128,
                BlockSize::Bs64x64,
                BlockSize::Bs64x32,
                BlockSize::Bs64x16,
                BlockSize::Bs16x64,
                BlockSize::Bs32x64,
                BlockSize::Bs32x32,
                BlockSize::Bs32x16,
                BlockSize::Bs32x8,
                BlockSize::Bs16x32,
                BlockSize::Bs16x16,
                BlockSize::Bs16x8,
                BlockSize::Bs16x4,
                BlockSize::Bs8x32,
                BlockSize::Bs8x16,
                BlockSize::Bs8x8,
                BlockSize::Bs8x4,
                BlockSize::Bs4x16,
                BlockSize::Bs4x8,
                BlockSize::Bs4x4,
            ][i as usize];
            let [w4, h4, lw, lh] = bs.dimensions();
            assert_eq!(1 << lw, w4 as u32);
            assert_eq!(1 << lh, h4 as u32);
            assert_eq!(BlockSize::from_dims4(w4, h4), bs);
        }
    }

    #[test]
    fn test_partition_expansion() {
        use BlockPartition::*;
        use BlockSize::*;
        assert_eq!(blocks_for_partition(BlockLevel::Bl128x128, None)[0], Bs128x128);
        assert_eq!(blocks_for_partition(BlockLevel::Bl128x128, H)[0], Bs128x64);
        assert_eq!(
            blocks_for_partition(BlockLevel::Bl64x64, TTopSplit),
            [Bs32x32, Bs64x32]
        );
        assert_eq!(
            blocks_for_partition(BlockLevel::Bl64x64, TRightSplit),
            [Bs32x64, Bs32x32]
        );
        assert_eq!(blocks_for_partition(BlockLevel::Bl32x32, H4)[0], Bs32x8);
        assert_eq!(blocks_for_partition(BlockLevel::Bl16x16, V4)[0], Bs4x16);
    }

    #[test]
    fn test_max_tx() {
        assert_eq!(max_ytx_for_bs(BlockSize::Bs128x128), TxSize::Tx64x64);
        assert_eq!(max_ytx_for_bs(BlockSize::Bs64x32), TxSize::Rtx64x32);
        assert_eq!(max_ytx_for_bs(BlockSize::Bs16x4), TxSize::Rtx16x4);
        // 4:2:0 chroma of a 64x64 block is 32x32
        assert_eq!(max_uvtx_for_bs(BlockSize::Bs64x64, 1, 1), TxSize::Tx32x32);
        // 4:2:2 chroma of a 64x64 block is 32x64, capped at 32x32
        assert_eq!(max_uvtx_for_bs(BlockSize::Bs64x64, 1, 0), TxSize::Tx32x32);
        // 4:2:0 chroma of a 4x16 block keeps a legal 4x8 shape
        assert_eq!(max_uvtx_for_bs(BlockSize::Bs4x16, 1, 1), TxSize::Rtx4x8);
    }

    #[test]
    fn test_tx_split_chain_terminates() {
        let mut tx = TxSize::Tx64x64;
        for _ in 0..8 {
            let sub = tx.info().sub;
            if sub == tx {
                break;
            }
            tx = sub;
        }
        assert_eq!(tx, TxSize::Tx4x4);
    }

    #[test]
    fn test_partition_ctx_byte() {
        // 128-wide: no boundary at any level
        assert_eq!(partition_ctx_byte(32), 0x00);
        // 64-wide: boundary only at the 128 level
        assert_eq!(partition_ctx_byte(16), 0x10);
        // 8-wide: boundaries at 128..16
        assert_eq!(partition_ctx_byte(2), 0x1e);
        // 4-wide: boundaries at every level
        assert_eq!(partition_ctx_byte(1), 0x1f);
    }

    #[test]
    fn test_dq_curve_monotone() {
        let mut last = 0;
        for q in 0..=255u8 {
            let v = dq_value(false, q, false);
            assert!(v > last || q == 0, "q={q}");
            last = v;
        }
        assert_eq!(dq_value(false, 0, false), 4);
        assert!(dq_value(true, 128, false) > dq_value(false, 128, false));
        assert!(dq_value(false, 128, true) < dq_value(false, 128, false));
    }
}
