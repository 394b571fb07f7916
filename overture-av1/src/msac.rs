//! Multisymbol adaptive arithmetic decoder.
//!
//! Range coder over 15-bit cumulative distributions. A CDF of `N` symbols is
//! stored as `N + 1` values: `cdf[i]` is the probability mass above symbol
//! `i` (so `cdf[N - 1] == 0`), and the final slot holds a saturating hit
//! count that schedules the adaptation rate, fast for young contexts and
//! slower as the count grows.
//!
//! The decoder consumes at most one byte past the last byte a draw actually
//! needed. Refilling past the end of the payload latches a sticky error flag
//! that callers check once per superblock row and at tile completion; after
//! that point draws keep returning well-formed symbols from an all-ones
//! window. The `rng` field is left observable as a cheap checkpoint oracle.

type EcWin = usize;

const EC_PROB_SHIFT: u32 = 6;
const EC_MIN_PROB: u32 = 4;
const EC_WIN_SIZE: u32 = usize::BITS;

/// Arithmetic decoder state over one tile payload.
///
/// Owns a handle on the frame's coded data so tile state can migrate
/// between workers without borrowing it.
pub struct Msac {
    data: std::sync::Arc<Vec<u8>>,
    pos: usize,
    end: usize,
    dif: EcWin,
    /// Current range; observable for test oracles.
    pub rng: u32,
    cnt: i32,
    /// Whether symbol draws adapt their CDFs.
    pub allow_update_cdf: bool,
}

impl Msac {
    /// Initialize over the `start..end` byte range of a frame payload.
    pub fn new(
        data: std::sync::Arc<Vec<u8>>,
        start: usize,
        end: usize,
        allow_update_cdf: bool,
    ) -> Self {
        debug_assert!(start <= end && end <= data.len());
        let mut s = Self {
            data,
            pos: start,
            end,
            dif: 0,
            rng: 0x8000,
            cnt: -15,
            allow_update_cdf,
        };
        s.refill();
        s
    }

    /// Sticky error predicate: true once draws have consumed more padding
    /// than the one byte of lookahead the coder is allowed.
    ///
    /// Bits are tracked as a debt counter; a valid payload never drives it
    /// below the initial debt, while a truncated one keeps sinking it with
    /// every further draw.
    pub fn has_error(&self) -> bool {
        self.cnt < -15
    }

    fn refill(&mut self) {
        let mut c = EC_WIN_SIZE as i32 - 24 - self.cnt;
        let mut dif = self.dif;
        loop {
            if self.pos >= self.end {
                // set the remaining bits to one (an inverted zero tail)
                dif |= !(!(0xff as EcWin) << c);
                break;
            }
            dif |= ((self.data[self.pos] ^ 0xff) as EcWin) << c;
            self.pos += 1;
            c -= 8;
            if c < 0 {
                break;
            }
        }
        self.dif = dif;
        self.cnt = EC_WIN_SIZE as i32 - 24 - c;
    }

    fn norm(&mut self, dif: EcWin, rng: u32) {
        debug_assert!(rng <= 0xffff);
        let d = 15 - (31 - rng.leading_zeros()) as i32;
        let cnt = self.cnt;
        self.dif = dif << d;
        self.rng = rng << d;
        self.cnt = cnt - d;
        // unsigned compare avoids redundant refills at eob
        if (cnt as u32) < (d as u32) {
            self.refill();
        }
    }

    /// Non-adaptive binary draw; `f` is the 15-bit probability of `true`.
    pub fn decode_bool(&mut self, f: u32) -> bool {
        let r = self.rng;
        let dif = self.dif;
        let v = ((r >> 8) * (f >> EC_PROB_SHIFT) >> (7 - EC_PROB_SHIFT)) + EC_MIN_PROB;
        let vw = (v as EcWin) << (EC_WIN_SIZE - 16);
        let hi = dif >= vw;
        if hi {
            self.norm(dif - vw, r - v);
        } else {
            self.norm(dif, v);
        }
        !hi
    }

    /// Equiprobable binary draw.
    pub fn decode_bool_equi(&mut self) -> bool {
        let r = self.rng;
        let dif = self.dif;
        let v = (r >> 8 << 7) + EC_MIN_PROB;
        let vw = (v as EcWin) << (EC_WIN_SIZE - 16);
        let hi = dif >= vw;
        if hi {
            self.norm(dif - vw, r - v);
        } else {
            self.norm(dif, v);
        }
        !hi
    }

    /// Adaptive binary draw over a 2-entry CDF (probability + hit count).
    pub fn decode_bool_adapt(&mut self, cdf: &mut [u16; 2]) -> bool {
        let bit = self.decode_bool(cdf[0] as u32);
        if self.allow_update_cdf {
            let count = cdf[1];
            let rate = 4 + (count >> 4);
            if bit {
                cdf[0] += (32768 - cdf[0]) >> rate;
            } else {
                cdf[0] -= cdf[0] >> rate;
            }
            cdf[1] = count + (count < 32) as u16;
        }
        bit
    }

    /// Adaptive multisymbol draw. Returns a symbol in `0..n_symbols`;
    /// `cdf` holds `n_symbols + 1` entries.
    pub fn decode_symbol_adapt(&mut self, cdf: &mut [u16], n_symbols: usize) -> u8 {
        debug_assert!(n_symbols < 16 && cdf.len() > n_symbols);
        let c = (self.dif >> (EC_WIN_SIZE - 16)) as u32;
        let r = self.rng >> 8;
        let mut u;
        let mut v = self.rng;
        let mut val = 0usize;
        loop {
            u = v;
            v = r * ((cdf[val] >> EC_PROB_SHIFT) as u32);
            v >>= 7 - EC_PROB_SHIFT;
            v += EC_MIN_PROB * (n_symbols - val) as u32;
            if c >= v {
                break;
            }
            val += 1;
        }
        debug_assert!(u <= self.rng);
        self.norm(
            self.dif.wrapping_sub((v as EcWin) << (EC_WIN_SIZE - 16)),
            u - v,
        );
        if self.allow_update_cdf {
            let count = cdf[n_symbols];
            let rate = 4 + (count >> 4) + (n_symbols > 2) as u16;
            for c in &mut cdf[..val] {
                *c += (32768 - *c) >> rate;
            }
            for c in &mut cdf[val..n_symbols] {
                *c -= *c >> rate;
            }
            cdf[n_symbols] = count + (count < 32) as u16;
        }
        val as u8
    }

    /// `n` raw equiprobable bits.
    pub fn decode_bools(&mut self, n: u32) -> u32 {
        let mut v = 0;
        for _ in 0..n {
            v = v << 1 | self.decode_bool_equi() as u32;
        }
        v
    }

    /// Equiprobable draw in `[0, n)` through the range coder.
    /// `n == 1` consumes nothing.
    pub fn decode_uniform(&mut self, n: u32) -> u32 {
        debug_assert!(n > 0);
        if n == 1 {
            return 0;
        }
        let l = overture_core::bitstream::ulog2(n) + 1;
        let m = (1 << l) - n;
        let v = self.decode_bools(l - 1);
        if v < m {
            v
        } else {
            (v << 1) - m + self.decode_bool_equi() as u32
        }
    }

    /// Sub-exponential draw recentered around `reference`, result in `[0, n)`.
    pub fn decode_subexp(&mut self, reference: u32, n: u32, mut k: u32) -> i32 {
        debug_assert!(n >> k == 8);
        let mut a = 0;
        if self.decode_bool_equi() {
            if self.decode_bool_equi() {
                k += self.decode_bool_equi() as u32 + 1;
            }
            a = 1 << k;
        }
        let v = self.decode_bools(k) + a;
        (if reference * 2 <= n {
            overture_core::bitstream::inv_recenter(reference, v)
        } else {
            n - 1 - overture_core::bitstream::inv_recenter(n - 1 - reference, v)
        }) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msac(bytes: &[u8], allow_update_cdf: bool) -> Msac {
        let data = Arc::new(bytes.to_vec());
        let end = data.len();
        Msac::new(data, 0, end, allow_update_cdf)
    }

    // Minimal range encoder matching the decoder's conventions, used to
    // produce known symbol streams.
    pub struct TestEncoder {
        low: u64,
        rng: u16,
        cnt: i16,
        precarry: Vec<u16>,
        pub allow_update_cdf: bool,
    }

    impl TestEncoder {
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

        pub fn encode_symbol(&mut self, symbol: usize, cdf: &mut [u16], n_symbols: usize) {
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

        pub fn encode_bool(&mut self, val: bool, cdf: &mut [u16; 2]) {
            self.encode_bool_prob(val, cdf[0]);
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

        pub fn encode_bool_prob(&mut self, val: bool, prob: u16) {
            let (fl, fh, nms) = if val { (prob, 0, 1) } else { (32768, prob, 2) };
            self.store(fl, fh, nms);
        }

        pub fn encode_bool_equi(&mut self, val: bool) {
            let r = self.rng as u32;
            let v = ((r >> 8 << 7) + EC_MIN_PROB) as u16;
            if val {
                self.push((r - v as u32) as u64, v);
            } else {
                self.push(0, (r - v as u32) as u16);
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

    fn flat(n: usize) -> Vec<u16> {
        let mut cdf = vec![0u16; n + 1];
        for i in 0..n {
            cdf[i] = (32768 - 32768 * (i + 1) / n) as u16;
        }
        cdf
    }

    #[test]
    fn test_bool_roundtrip() {
        let pattern = [true, false, false, true, true, true, false, true];
        let mut enc = TestEncoder::new();
        let mut cdf = [16384u16, 0];
        for &b in &pattern {
            enc.encode_bool(b, &mut cdf);
        }
        let bytes = enc.finalize();

        let mut dec = msac(&bytes, true);
        let mut cdf = [16384u16, 0];
        for &b in &pattern {
            assert_eq!(dec.decode_bool_adapt(&mut cdf), b);
        }
        assert!(!dec.has_error());
    }

    #[test]
    fn test_symbol_roundtrip_with_adaptation() {
        let symbols = [0usize, 3, 3, 1, 0, 2, 3, 3, 3, 0, 1, 2];
        let mut enc = TestEncoder::new();
        let mut cdf = flat(4);
        for &s in &symbols {
            enc.encode_symbol(s, &mut cdf, 4);
        }
        let enc_cdf = cdf.clone();
        let bytes = enc.finalize();

        let mut dec = msac(&bytes, true);
        let mut cdf = flat(4);
        for &s in &symbols {
            assert_eq!(dec.decode_symbol_adapt(&mut cdf, 4) as usize, s);
        }
        // both sides evolved the CDF identically
        assert_eq!(cdf, enc_cdf);
    }

    #[test]
    fn test_equi_bits_roundtrip() {
        let mut enc = TestEncoder::new();
        for i in 0..64u32 {
            enc.encode_bool_equi(i % 3 == 0);
        }
        let bytes = enc.finalize();
        let mut dec = msac(&bytes, true);
        for i in 0..64u32 {
            assert_eq!(dec.decode_bool_equi(), i % 3 == 0);
        }
    }

    #[test]
    fn test_uniform_one_consumes_nothing() {
        let mut dec = msac(&[0x55; 4], true);
        let rng = dec.rng;
        let dif = dec.dif;
        assert_eq!(dec.decode_uniform(1), 0);
        assert_eq!(dec.rng, rng);
        assert_eq!(dec.dif, dif);
    }

    #[test]
    fn test_cdf_stays_well_formed() {
        let mut dec = msac(&[0xa7, 0x30, 0x9c, 0x11, 0xf2, 0x68, 0x0b, 0x5e], true);
        let mut cdf = flat(8);
        for _ in 0..200 {
            dec.decode_symbol_adapt(&mut cdf, 8);
            let mut last = 32768u16;
            for &c in &cdf[..8] {
                assert!(c <= last, "cdf must be non-increasing");
                last = c;
            }
            assert_eq!(cdf[7], 0);
            assert!(cdf[8] <= 32);
        }
    }

    #[test]
    fn test_error_is_sticky_and_draws_continue() {
        let mut dec = msac(&[0xff], true);
        for _ in 0..100 {
            let v = dec.decode_bools(8);
            assert!(v <= 0xff);
        }
        assert!(dec.has_error());
    }

    #[test]
    fn test_adaptation_disabled_leaves_cdf_untouched() {
        let mut dec = msac(&[0x12, 0x34, 0x56, 0x78], false);
        let mut cdf = flat(4);
        let orig = cdf.clone();
        dec.decode_symbol_adapt(&mut cdf, 4);
        assert_eq!(cdf, orig);
    }

    #[test]
    fn test_rng_checkpoint_deterministic() {
        let data = [0x91, 0x5d, 0x22, 0x08, 0x73];
        let mut a = msac(&data, true);
        let mut b = msac(&data, true);
        let mut cdf_a = flat(6);
        let mut cdf_b = flat(6);
        for _ in 0..20 {
            a.decode_symbol_adapt(&mut cdf_a, 6);
            b.decode_symbol_adapt(&mut cdf_b, 6);
            assert_eq!(a.rng, b.rng);
        }
    }
}
