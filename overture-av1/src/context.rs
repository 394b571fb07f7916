//! Neighbor context strips.
//!
//! Two strips per tile track the categorical state of the most recently
//! decoded blocks: one along the top of the current superblock row, one down
//! the left edge of the current superblock. Both are indexed in 4x4 units
//! within a 32-unit window (the span of one 128x128 superblock); the
//! partition strip is indexed in 8-pixel units.

use crate::tables::{DC_PRED, N_SWITCHABLE_FILTERS, NEARESTMV};

/// One strip of categorical neighbor state.
#[derive(Clone)]
pub struct BlockContext {
    pub mode: [u8; 32],
    pub lcoef: [u8; 32],
    pub ccoef: [[u8; 32]; 2],
    pub seg_pred: [u8; 32],
    pub skip: [u8; 32],
    pub skip_mode: [u8; 32],
    pub intra: [u8; 32],
    pub comp_type: [u8; 32],
    pub pal_sz: [u8; 32],
    pub ref_frame: [[i8; 32]; 2],
    pub filter: [[u8; 32]; 2],
    pub tx_intra: [i8; 32],
    pub tx: [u8; 32],
    pub tx_lpf_y: [u8; 32],
    pub tx_lpf_uv: [u8; 32],
    pub partition: [u8; 16],
    pub uvmode: [u8; 32],
}

impl Default for BlockContext {
    fn default() -> Self {
        let mut ctx = Self {
            mode: [0; 32],
            lcoef: [0; 32],
            ccoef: [[0; 32]; 2],
            seg_pred: [0; 32],
            skip: [0; 32],
            skip_mode: [0; 32],
            intra: [0; 32],
            comp_type: [0; 32],
            pal_sz: [0; 32],
            ref_frame: [[0; 32]; 2],
            filter: [[0; 32]; 2],
            tx_intra: [0; 32],
            tx: [0; 32],
            tx_lpf_y: [0; 32],
            tx_lpf_uv: [0; 32],
            partition: [0; 16],
            uvmode: [0; 32],
        };
        ctx.reset(true, 0);
        ctx
    }
}

impl BlockContext {
    /// Reset a strip for a new superblock row or tile.
    ///
    /// Pass 2 replays recorded blocks and only consults the mode-related
    /// fields, so the rest keeps its pass-1 values untouched.
    pub fn reset(&mut self, keyframe: bool, pass: u8) {
        self.intra.fill(keyframe as u8);
        self.uvmode.fill(DC_PRED);
        if keyframe {
            self.mode.fill(DC_PRED);
        }

        if pass == 2 {
            return;
        }

        self.partition.fill(0);
        self.skip.fill(0);
        self.skip_mode.fill(0);
        self.tx_lpf_y.fill(2);
        self.tx_lpf_uv.fill(1);
        self.tx_intra.fill(-1);
        self.tx.fill(4);
        if !keyframe {
            for r in &mut self.ref_frame {
                r.fill(-1);
            }
            self.comp_type.fill(0);
            self.mode.fill(NEARESTMV);
        }
        self.lcoef.fill(0x40);
        for c in &mut self.ccoef {
            c.fill(0x40);
        }
        for f in &mut self.filter {
            f.fill(N_SWITCHABLE_FILTERS as u8);
        }
        self.seg_pred.fill(0);
        self.pal_sz.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_reset() {
        let mut ctx = BlockContext::default();
        ctx.reset(true, 0);
        assert!(ctx.intra.iter().all(|&v| v == 1));
        assert!(ctx.mode.iter().all(|&v| v == DC_PRED));
        assert!(ctx.tx_intra.iter().all(|&v| v == -1));
        assert!(ctx.lcoef.iter().all(|&v| v == 0x40));
    }

    #[test]
    fn test_interframe_reset() {
        let mut ctx = BlockContext::default();
        ctx.reset(false, 0);
        assert!(ctx.intra.iter().all(|&v| v == 0));
        assert!(ctx.ref_frame[0].iter().all(|&v| v == -1));
        assert!(ctx.mode.iter().all(|&v| v == NEARESTMV));
    }

    #[test]
    fn test_pass2_reset_preserves_parse_state() {
        let mut ctx = BlockContext::default();
        ctx.skip.fill(1);
        ctx.partition.fill(0x1f);
        ctx.reset(true, 2);
        // pass 2 never reads these; they keep their previous values
        assert!(ctx.skip.iter().all(|&v| v == 1));
        assert!(ctx.partition.iter().all(|&v| v == 0x1f));
        // but the mode-related fields are reinitialized
        assert!(ctx.intra.iter().all(|&v| v == 1));
    }
}
