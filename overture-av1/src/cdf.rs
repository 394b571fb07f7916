//! Adaptive CDF tables.
//!
//! One `CdfContext` covers every adaptive symbol the block parser draws.
//! Each tile starts from a snapshot of the frame's input context and evolves
//! its own copy; when the frame signals `refresh_context`, the update tile's
//! final state is promoted (with adaptation counters cleared) as the frame's
//! output context.
//!
//! A CDF of `n` symbols occupies `n + 1` slots: `n - 1` descending 15-bit
//! probability points, a terminating zero, and the adaptation counter.
//! Contexts are seeded with flat distributions over each alphabet; the
//! quantizer index chooses the coefficient seed bin for parity with the
//! reference schedule, which flat seeding collapses to a single bin.

use crate::tables::{
    N_BL_LEVELS, N_BS_SIZES, N_COMP_INTER_PRED_MODES, N_INTER_INTRA_PRED_MODES,
    N_INTRA_PRED_MODES, N_PARTITIONS, N_SWITCHABLE_FILTERS, N_UV_INTRA_PRED_MODES, NUM_SEGMENTS,
};

/// Flat `n`-symbol seed over an `N = max_syms + 1` array.
fn flat<const N: usize>(n: usize) -> [u16; N] {
    debug_assert!(n < N);
    let mut cdf = [0u16; N];
    for i in 0..n - 1 {
        cdf[i] = (32768 - 32768 * (i + 1) / n) as u16;
    }
    cdf
}

fn flat_bool() -> [u16; 2] {
    [16384, 0]
}

/// Per-component motion-vector CDFs.
#[derive(Clone)]
pub struct CdfMvComponent {
    pub classes: [u16; 12],
    pub sign: [u16; 2],
    pub class0: [u16; 2],
    pub class0_fp: [[u16; 5]; 2],
    pub class0_hp: [u16; 2],
    pub class_n: [[u16; 2]; 10],
    pub class_n_fp: [u16; 5],
    pub class_n_hp: [u16; 2],
}

impl Default for CdfMvComponent {
    fn default() -> Self {
        Self {
            classes: flat(11),
            sign: flat_bool(),
            class0: flat_bool(),
            class0_fp: [flat(4); 2],
            class0_hp: flat_bool(),
            class_n: [flat_bool(); 10],
            class_n_fp: flat(4),
            class_n_hp: flat_bool(),
        }
    }
}

/// Joint + per-component motion-vector CDFs.
#[derive(Clone, Default)]
pub struct CdfMvContext {
    pub joint: [u16; 5],
    pub comp: [CdfMvComponent; 2],
}

/// Coefficient CDFs consumed by the `read_coef_blocks` collaborator.
#[derive(Clone)]
pub struct CdfCoefContext {
    pub skip: [[[u16; 2]; 13]; 5],
    pub dc_sign: [[[u16; 2]; 3]; 2],
    pub eob_hi_bit: [[[[u16; 2]; 9]; 2]; 5],
}

impl Default for CdfCoefContext {
    fn default() -> Self {
        Self {
            skip: [[flat_bool(); 13]; 5],
            dc_sign: [[flat_bool(); 3]; 2],
            eob_hi_bit: [[[flat_bool(); 9]; 2]; 5],
        }
    }
}

/// Mode CDFs drawn by the block parser and partition descender.
#[derive(Clone)]
pub struct CdfModeContext {
    pub partition: [[[u16; N_PARTITIONS + 1]; 4]; N_BL_LEVELS],
    pub skip_mode: [[u16; 2]; 3],
    pub skip: [[u16; 2]; 3],
    pub seg_pred: [[u16; 2]; 3],
    pub seg_id: [[u16; NUM_SEGMENTS + 1]; 3],
    pub delta_q: [u16; 5],
    pub delta_lf: [[u16; 5]; 5],
    pub intra: [[u16; 2]; 4],
    pub intrabc: [u16; 2],
    pub y_mode: [[u16; N_INTRA_PRED_MODES + 1]; 4],
    pub angle_delta: [[u16; 8]; 8],
    pub uv_mode: [[[u16; N_UV_INTRA_PRED_MODES + 1]; N_INTRA_PRED_MODES]; 2],
    pub cfl_sign: [u16; 9],
    pub cfl_alpha: [[u16; 17]; 6],
    pub pal_y: [[[u16; 2]; 3]; 7],
    pub pal_uv: [[u16; 2]; 2],
    pub pal_sz: [[[u16; 8]; 7]; 2],
    pub color_map: [[[[u16; 9]; 5]; 7]; 2],
    pub use_filter_intra: [[u16; 2]; N_BS_SIZES],
    pub filter_intra: [u16; 6],
    pub txsz: [[[u16; 4]; 3]; 4],
    pub txpart: [[[u16; 2]; 3]; 7],
    pub comp: [[u16; 2]; 5],
    pub comp_dir: [[u16; 2]; 5],
    pub ref_bit: [[[u16; 2]; 3]; 6],
    pub comp_fwd_ref: [[[u16; 2]; 3]; 3],
    pub comp_bwd_ref: [[[u16; 2]; 3]; 2],
    pub comp_uni_ref: [[[u16; 2]; 3]; 3],
    pub comp_inter_mode: [[u16; N_COMP_INTER_PRED_MODES + 1]; 8],
    pub newmv_mode: [[u16; 2]; 6],
    pub globalmv_mode: [[u16; 2]; 2],
    pub refmv_mode: [[u16; 2]; 6],
    pub drl_bit: [[u16; 2]; 3],
    pub interintra: [[u16; 2]; 4],
    pub interintra_mode: [[u16; N_INTER_INTRA_PRED_MODES + 1]; 4],
    pub interintra_wedge: [[u16; 2]; 9],
    pub wedge_comp: [[u16; 2]; 9],
    pub wedge_idx: [[u16; 17]; 9],
    pub mask_comp: [[u16; 2]; 6],
    pub jnt_comp: [[u16; 2]; 6],
    pub motion_mode: [[u16; 4]; N_BS_SIZES],
    pub obmc: [[u16; 2]; N_BS_SIZES],
    pub filter: [[[u16; N_SWITCHABLE_FILTERS + 1]; 8]; 2],
    pub restore_wiener: [u16; 2],
    pub restore_sgrproj: [u16; 2],
    pub restore_switchable: [u16; 4],
}

impl Default for CdfModeContext {
    fn default() -> Self {
        // partition alphabets shrink at the root and leaf levels
        let mut partition = [[flat::<{ N_PARTITIONS + 1 }>(N_PARTITIONS); 4]; N_BL_LEVELS];
        partition[0] = [flat(N_PARTITIONS - 2); 4];
        partition[N_BL_LEVELS - 1] = [flat(4); 4];
        // the smallest tx-depth class codes a 2-symbol alphabet
        let mut txsz = [[flat::<4>(3); 3]; 4];
        txsz[0] = [flat(2); 3];
        Self {
            partition,
            skip_mode: [flat_bool(); 3],
            skip: [flat_bool(); 3],
            seg_pred: [flat_bool(); 3],
            seg_id: [flat(NUM_SEGMENTS); 3],
            delta_q: flat(4),
            delta_lf: [flat(4); 5],
            intra: [flat_bool(); 4],
            intrabc: flat_bool(),
            y_mode: [flat(N_INTRA_PRED_MODES); 4],
            angle_delta: [flat(7); 8],
            uv_mode: [
                [flat(N_UV_INTRA_PRED_MODES - 1); N_INTRA_PRED_MODES],
                [flat(N_UV_INTRA_PRED_MODES); N_INTRA_PRED_MODES],
            ],
            cfl_sign: flat(8),
            cfl_alpha: [flat(16); 6],
            pal_y: [[flat_bool(); 3]; 7],
            pal_uv: [flat_bool(); 2],
            pal_sz: [[flat(7); 7]; 2],
            color_map: Self::default_color_map(),
            use_filter_intra: [flat_bool(); N_BS_SIZES],
            filter_intra: flat(5),
            txsz,
            txpart: [[flat_bool(); 3]; 7],
            comp: [flat_bool(); 5],
            comp_dir: [flat_bool(); 5],
            ref_bit: [[flat_bool(); 3]; 6],
            comp_fwd_ref: [[flat_bool(); 3]; 3],
            comp_bwd_ref: [[flat_bool(); 3]; 2],
            comp_uni_ref: [[flat_bool(); 3]; 3],
            comp_inter_mode: [flat(N_COMP_INTER_PRED_MODES); 8],
            newmv_mode: [flat_bool(); 6],
            globalmv_mode: [flat_bool(); 2],
            refmv_mode: [flat_bool(); 6],
            drl_bit: [flat_bool(); 3],
            interintra: [flat_bool(); 4],
            interintra_mode: [flat(N_INTER_INTRA_PRED_MODES); 4],
            interintra_wedge: [flat_bool(); 9],
            wedge_comp: [flat_bool(); 9],
            wedge_idx: [flat(16); 9],
            mask_comp: [flat_bool(); 6],
            jnt_comp: [flat_bool(); 6],
            motion_mode: [flat(3); N_BS_SIZES],
            obmc: [flat_bool(); N_BS_SIZES],
            filter: [[flat(N_SWITCHABLE_FILTERS); 8]; 2],
            restore_wiener: flat_bool(),
            restore_sgrproj: flat_bool(),
            restore_switchable: flat(3),
        }
    }
}

impl CdfModeContext {
    fn default_color_map() -> [[[[u16; 9]; 5]; 7]; 2] {
        let mut out = [[[[0u16; 9]; 5]; 7]; 2];
        for pl in &mut out {
            for (sz, per_sz) in pl.iter_mut().enumerate() {
                // palette sizes run 2..=8
                *per_sz = [flat(sz + 2); 5];
            }
        }
        out
    }
}

/// A complete CDF snapshot.
#[derive(Clone)]
pub struct CdfContext {
    pub m: CdfModeContext,
    /// Key-frame y-mode CDFs, contexted by both neighbor mode classes.
    pub kfym: [[[u16; N_INTRA_PRED_MODES + 1]; 5]; 5],
    pub mv: CdfMvContext,
    /// Intra-block-copy motion vectors adapt separately.
    pub dmv: CdfMvContext,
    pub coef: CdfCoefContext,
}

impl CdfContext {
    /// Fresh context for a frame with no primary reference.
    ///
    /// `qidx` selects the coefficient seed bin in the reference schedule;
    /// the flat seeds used here are identical across bins, so it only
    /// documents intent at the call sites.
    pub fn new(qidx: u8) -> Self {
        let _ = qidx;
        Self {
            m: CdfModeContext::default(),
            kfym: [[flat(N_INTRA_PRED_MODES); 5]; 5],
            mv: CdfMvContext::default(),
            dmv: CdfMvContext::default(),
            coef: CdfCoefContext::default(),
        }
    }

    /// Promote a tile's final state to a frame output context:
    /// probabilities carry over, adaptation counters restart.
    pub fn promoted(&self) -> Self {
        let mut out = self.clone();
        out.reset_counts();
        out
    }

    fn reset_counts(&mut self) {
        fn rc<const N: usize>(cdf: &mut [u16; N], n: usize) {
            cdf[n] = 0;
        }

        let m = &mut self.m;
        for per_bl in &mut m.partition {
            for cdf in per_bl {
                rc(cdf, N_PARTITIONS);
            }
        }
        for cdf in &mut m.skip_mode {
            rc(cdf, 1);
        }
        for cdf in &mut m.skip {
            rc(cdf, 1);
        }
        for cdf in &mut m.seg_pred {
            rc(cdf, 1);
        }
        for cdf in &mut m.seg_id {
            rc(cdf, NUM_SEGMENTS);
        }
        rc(&mut m.delta_q, 4);
        for cdf in &mut m.delta_lf {
            rc(cdf, 4);
        }
        for cdf in &mut m.intra {
            rc(cdf, 1);
        }
        rc(&mut m.intrabc, 1);
        for cdf in &mut m.y_mode {
            rc(cdf, N_INTRA_PRED_MODES);
        }
        for cdf in &mut m.angle_delta {
            rc(cdf, 7);
        }
        for per_cfl in &mut m.uv_mode {
            for cdf in per_cfl {
                rc(cdf, N_UV_INTRA_PRED_MODES);
            }
        }
        rc(&mut m.cfl_sign, 8);
        for cdf in &mut m.cfl_alpha {
            rc(cdf, 16);
        }
        for per_sz in &mut m.pal_y {
            for cdf in per_sz {
                rc(cdf, 1);
            }
        }
        for cdf in &mut m.pal_uv {
            rc(cdf, 1);
        }
        for per_pl in &mut m.pal_sz {
            for cdf in per_pl {
                rc(cdf, 7);
            }
        }
        for per_pl in &mut m.color_map {
            for per_sz in per_pl {
                for cdf in per_sz {
                    rc(cdf, 8);
                }
            }
        }
        for cdf in &mut m.use_filter_intra {
            rc(cdf, 1);
        }
        rc(&mut m.filter_intra, 5);
        for per_max in &mut m.txsz {
            for cdf in per_max {
                rc(cdf, 3);
            }
        }
        for per_cat in &mut m.txpart {
            for cdf in per_cat {
                rc(cdf, 1);
            }
        }
        for cdf in &mut m.comp {
            rc(cdf, 1);
        }
        for cdf in &mut m.comp_dir {
            rc(cdf, 1);
        }
        for group in &mut m.ref_bit {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for group in &mut m.comp_fwd_ref {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for group in &mut m.comp_bwd_ref {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for group in &mut m.comp_uni_ref {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for cdf in &mut m.comp_inter_mode {
            rc(cdf, N_COMP_INTER_PRED_MODES);
        }
        for cdf in &mut m.newmv_mode {
            rc(cdf, 1);
        }
        for cdf in &mut m.globalmv_mode {
            rc(cdf, 1);
        }
        for cdf in &mut m.refmv_mode {
            rc(cdf, 1);
        }
        for cdf in &mut m.drl_bit {
            rc(cdf, 1);
        }
        for cdf in &mut m.interintra {
            rc(cdf, 1);
        }
        for cdf in &mut m.interintra_mode {
            rc(cdf, N_INTER_INTRA_PRED_MODES);
        }
        for cdf in &mut m.interintra_wedge {
            rc(cdf, 1);
        }
        for cdf in &mut m.wedge_comp {
            rc(cdf, 1);
        }
        for cdf in &mut m.wedge_idx {
            rc(cdf, 16);
        }
        for cdf in &mut m.mask_comp {
            rc(cdf, 1);
        }
        for cdf in &mut m.jnt_comp {
            rc(cdf, 1);
        }
        for cdf in &mut m.motion_mode {
            rc(cdf, 3);
        }
        for cdf in &mut m.obmc {
            rc(cdf, 1);
        }
        for per_dir in &mut m.filter {
            for cdf in per_dir {
                rc(cdf, N_SWITCHABLE_FILTERS);
            }
        }
        rc(&mut m.restore_wiener, 1);
        rc(&mut m.restore_sgrproj, 1);
        rc(&mut m.restore_switchable, 3);

        for per_a in &mut self.kfym {
            for cdf in per_a {
                rc(cdf, N_INTRA_PRED_MODES);
            }
        }
        for mv in [&mut self.mv, &mut self.dmv] {
            rc(&mut mv.joint, 4);
            for comp in &mut mv.comp {
                rc(&mut comp.classes, 11);
                rc(&mut comp.sign, 1);
                rc(&mut comp.class0, 1);
                for cdf in &mut comp.class0_fp {
                    rc(cdf, 4);
                }
                rc(&mut comp.class0_hp, 1);
                for cdf in &mut comp.class_n {
                    rc(cdf, 1);
                }
                rc(&mut comp.class_n_fp, 4);
                rc(&mut comp.class_n_hp, 1);
            }
        }
        for group in &mut self.coef.skip {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for group in &mut self.coef.dc_sign {
            for cdf in group {
                rc(cdf, 1);
            }
        }
        for per_tx in &mut self.coef.eob_hi_bit {
            for group in per_tx {
                for cdf in group {
                    rc(cdf, 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_shape() {
        let cdf: [u16; 5] = flat(4);
        assert_eq!(cdf, [24576, 16384, 8192, 0, 0]);
    }

    #[test]
    fn test_partition_alphabets() {
        let m = CdfModeContext::default();
        // root level codes 8 symbols: entry 7 terminates
        assert_eq!(m.partition[0][0][7], 0);
        assert!(m.partition[0][0][6] > 0);
        // leaf level codes 4 symbols
        assert_eq!(m.partition[4][0][3], 0);
        assert!(m.partition[4][0][2] > 0);
        // mid levels code all 10
        assert!(m.partition[2][0][8] > 0);
        assert_eq!(m.partition[2][0][9], 0);
    }

    #[test]
    fn test_promotion_clears_counts() {
        let mut cdf = CdfContext::new(128);
        cdf.m.skip[0][1] = 17;
        cdf.m.partition[1][2][N_PARTITIONS] = 32;
        let out = cdf.promoted();
        assert_eq!(out.m.skip[0][1], 0);
        assert_eq!(out.m.partition[1][2][N_PARTITIONS], 0);
        // probability points survive
        assert_eq!(out.m.skip[0][0], cdf.m.skip[0][0]);
    }
}
