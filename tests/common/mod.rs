//! Synthetic instrument files for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

pub const HH_T2_WRAP: i64 = 33_552_000;

/// Packed little-endian writer
#[derive(Default)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn chars(&mut self, s: &str, len: usize) -> &mut Self {
        let mut field = s.as_bytes().to_vec();
        field.resize(len, 0);
        self.0.extend_from_slice(&field);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32s(&mut self, v: i32, n: usize) -> &mut Self {
        for _ in 0..n {
            self.i32(v);
        }
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
}

/// A regular photon record of a HydraHarp T2 file
pub fn hh_photon(channel: u32, time: u32) -> u32 {
    (channel << 25) | time
}

/// A special record of a HydraHarp file
pub fn hh_special(channel: u32, field: u32) -> u32 {
    (1 << 31) | (channel << 25) | field
}

/// HydraHarp 1.0 file in T2 (`mode` 2) or T3 (`mode` 3) with a base
/// resolution of 1 ps, no binning and no input channels.
pub fn hydraharp(mode: i32, records: &[u32]) -> Vec<u8> {
    let mut b = Bytes::default();
    b.chars("HydraHarp", 16)
        .chars("1.0", 6)
        // creator, version, file time, CRLF, comment
        .chars("photoncorr tests", 18)
        .chars("0.1", 12)
        .chars("16/10/26 12:00:00", 18)
        .chars("\r\n", 2)
        .chars("", 256)
        // curves, bits per record, active curve, mode, sub mode, binning
        .i32(0)
        .i32(32)
        .i32(0)
        .i32(mode)
        .i32(0)
        .i32(0)
        .f64(1.0)
        .i32(0)
        .i32(1000)
        .i32s(0, 3)
        // display settings
        .i32s(0, 5)
        .i32s(0, 16)
        .i32s(0, 9)
        .i32s(0, 4)
        .chars("", 20)
        // hardware
        .chars("HydraHarp 400", 16)
        .chars("930001", 8)
        .i32(1234)
        .i32(0)
        .i32s(1, 20)
        .f64(1.0)
        .i64(0)
        .i32(0)
        .i32s(0, 7)
        // TTTR sub-header
        .i32(80_000_000)
        .i32s(0, 3)
        .i64(records.len() as i64);
    for &record in records {
        b.u32(record);
    }
    b.0
}

/// Writes `data` into a fresh temporary directory.
pub fn write_file(name: &str, data: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    (dir, path)
}
