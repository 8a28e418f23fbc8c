//! Rolling fingerprints over a sliding byte window: Adler-style sums and Rabin polynomials.
//!
//! `check` computes a window's value from scratch; `roll` slides the window one byte
//! in O(1). For any window, rolling into it yields exactly the value `check` would.

use crate::error::{ReduceError, ReduceResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default irreducible polynomial x^32 + x^7 + x^3 + x^2 + 1 (the x^32 term is implicit)
pub const DEFAULT_RABIN_POLYNOMIAL: u32 = 0x0000_008D;

/// Common contract of the rolling checksums
pub trait RollingChecksum {
    /// Forget the current window
    fn reset(&mut self);
    /// Compute the checksum of `buf[offset..offset + len]` and make it the current window
    fn check(&mut self, buf: &[u8], offset: usize, len: usize);
    /// Drop the oldest byte of the window and append `byte`
    fn roll(&mut self, byte: u8);
    /// Current checksum value
    fn value(&self) -> u32;
}

/// Rolling fingerprint algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FingerprintAlgorithm {
    /// Adler/rsync style sum checksum
    Adler32 {
        /// Constant added to every byte (rsync uses 0, librsync 31)
        offset: u32,
    },
    /// Rabin polynomial fingerprint over GF(2)
    Rabin {
        /// Lower 32 bits of a degree-32 irreducible polynomial
        polynomial: u32,
    },
}

impl Default for FingerprintAlgorithm {
    fn default() -> Self {
        FingerprintAlgorithm::Adler32 { offset: 0 }
    }
}

impl FingerprintAlgorithm {
    /// Parse a configuration name (`adler32`, `rabin`) with default parameters
    pub fn from_name(name: &str) -> ReduceResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adler32" | "adler" => Ok(FingerprintAlgorithm::Adler32 { offset: 0 }),
            "rabin" => Ok(FingerprintAlgorithm::Rabin {
                polynomial: DEFAULT_RABIN_POLYNOMIAL,
            }),
            _ => Err(ReduceError::UnsupportedAlgorithm {
                kind: "fingerprint",
                name: name.to_string(),
            }),
        }
    }

    /// Build a fresh fingerprinter
    pub fn build(&self) -> Fingerprinter {
        match *self {
            FingerprintAlgorithm::Adler32 { offset } => {
                Fingerprinter::Adler32(Adler32Fingerprinter::new(offset))
            }
            FingerprintAlgorithm::Rabin { polynomial } => {
                Fingerprinter::Rabin(RabinFingerprinter::new(polynomial))
            }
        }
    }
}

/// A configured rolling fingerprinter
#[derive(Debug, Clone)]
pub enum Fingerprinter {
    /// Sum checksum
    Adler32(Adler32Fingerprinter),
    /// Polynomial checksum
    Rabin(RabinFingerprinter),
}

impl RollingChecksum for Fingerprinter {
    fn reset(&mut self) {
        match self {
            Fingerprinter::Adler32(f) => f.reset(),
            Fingerprinter::Rabin(f) => f.reset(),
        }
    }

    fn check(&mut self, buf: &[u8], offset: usize, len: usize) {
        match self {
            Fingerprinter::Adler32(f) => f.check(buf, offset, len),
            Fingerprinter::Rabin(f) => f.check(buf, offset, len),
        }
    }

    fn roll(&mut self, byte: u8) {
        match self {
            Fingerprinter::Adler32(f) => f.roll(byte),
            Fingerprinter::Rabin(f) => f.roll(byte),
        }
    }

    fn value(&self) -> u32 {
        match self {
            Fingerprinter::Adler32(f) => f.value(),
            Fingerprinter::Rabin(f) => f.value(),
        }
    }
}

/// Adler-style checksum: `a` is the sum of window bytes, `b` the position-weighted sum.
#[derive(Debug, Clone)]
pub struct Adler32Fingerprinter {
    offset: u32,
    a: u32,
    b: u32,
    window: VecDeque<u8>,
}

impl Adler32Fingerprinter {
    /// Create with the given per-byte offset constant
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            a: 0,
            b: 0,
            window: VecDeque::new(),
        }
    }
}

impl RollingChecksum for Adler32Fingerprinter {
    fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
        self.window.clear();
    }

    fn check(&mut self, buf: &[u8], offset: usize, len: usize) {
        self.reset();
        for &byte in &buf[offset..offset + len] {
            let v = byte as u32 + self.offset;
            self.a = self.a.wrapping_add(v);
            self.b = self.b.wrapping_add(self.a);
            self.window.push_back(byte);
        }
    }

    fn roll(&mut self, byte: u8) {
        let len = self.window.len() as u32;
        let Some(out) = self.window.pop_front() else {
            // Empty window: rolling degenerates to appending.
            let v = byte as u32 + self.offset;
            self.a = v;
            self.b = v;
            self.window.push_back(byte);
            return;
        };
        let out = out as u32 + self.offset;
        let new = byte as u32 + self.offset;
        self.a = self.a.wrapping_sub(out).wrapping_add(new);
        self.b = self
            .b
            .wrapping_sub(len.wrapping_mul(out))
            .wrapping_add(self.a);
        self.window.push_back(byte);
    }

    fn value(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }
}

/// Rabin fingerprint: the window read as a polynomial over GF(2), reduced modulo P.
///
/// The four lane tables hold `i(x) * x^(32 + 8k) mod P` for `k = 0..4`, so a 32-bit
/// residue can be multiplied by x^32 with four lookups, and by x^8 with one.
#[derive(Debug, Clone)]
pub struct RabinFingerprinter {
    polynomial: u32,
    lanes: [[u32; 256]; 4],
    /// `b(x) * x^(8 * window_len) mod P`, rebuilt when the window length changes
    out_table: Vec<u32>,
    out_table_len: usize,
    value: u32,
    window: VecDeque<u8>,
}

impl RabinFingerprinter {
    /// Create for the given polynomial (x^32 term implicit)
    pub fn new(polynomial: u32) -> Self {
        Self {
            polynomial,
            lanes: Self::lane_tables(polynomial),
            out_table: Vec::new(),
            out_table_len: 0,
            value: 0,
            window: VecDeque::new(),
        }
    }

    fn lane_tables(polynomial: u32) -> [[u32; 256]; 4] {
        // mods[i] == x^(32 + i) mod P
        let mut mods = [0u32; 32];
        mods[0] = polynomial;
        for i in 1..32 {
            let last = mods[i - 1];
            let mut this = last << 1;
            if last & 0x8000_0000 != 0 {
                this ^= polynomial;
            }
            mods[i] = this;
        }

        let mut lanes = [[0u32; 256]; 4];
        for i in 0..256usize {
            for bit in 0..8 {
                if i & (1 << bit) != 0 {
                    for (lane, table) in lanes.iter_mut().enumerate() {
                        table[i] ^= mods[bit + lane * 8];
                    }
                }
            }
        }
        lanes
    }

    /// `w(x) * x^32 mod P`
    fn mul_x32(&self, w: u32) -> u32 {
        self.lanes[0][(w & 0xff) as usize]
            ^ self.lanes[1][((w >> 8) & 0xff) as usize]
            ^ self.lanes[2][((w >> 16) & 0xff) as usize]
            ^ self.lanes[3][((w >> 24) & 0xff) as usize]
    }

    /// `w(x) * x^8 mod P`
    fn mul_x8(&self, w: u32) -> u32 {
        (w << 8) ^ self.lanes[0][(w >> 24) as usize]
    }

    fn mul_x8n(&self, mut w: u32, n: usize) -> u32 {
        for _ in 0..n / 4 {
            w = self.mul_x32(w);
        }
        for _ in 0..n % 4 {
            w = self.mul_x8(w);
        }
        w
    }

    fn ensure_out_table(&mut self, len: usize) {
        if self.out_table_len == len && !self.out_table.is_empty() {
            return;
        }
        let table: Vec<u32> = (0..256u32).map(|b| self.mul_x8n(b, len)).collect();
        self.out_table = table;
        self.out_table_len = len;
    }

    /// The configured polynomial
    pub fn polynomial(&self) -> u32 {
        self.polynomial
    }
}

impl RollingChecksum for RabinFingerprinter {
    fn reset(&mut self) {
        self.value = 0;
        self.window.clear();
    }

    fn check(&mut self, buf: &[u8], offset: usize, len: usize) {
        self.reset();
        self.ensure_out_table(len);
        for &byte in &buf[offset..offset + len] {
            self.value = self.mul_x8(self.value) ^ byte as u32;
            self.window.push_back(byte);
        }
    }

    fn roll(&mut self, byte: u8) {
        let len = self.window.len();
        match self.window.pop_front() {
            Some(out) => {
                self.ensure_out_table(len);
                self.value =
                    self.mul_x8(self.value) ^ byte as u32 ^ self.out_table[out as usize];
            }
            None => self.value = byte as u32,
        }
        self.window.push_back(byte);
    }

    fn value(&self) -> u32 {
        self.value
    }
}
