//! Fixed-layout pieces of the PicoQuant headers.
//!
//! All structures are little endian and packed to two bytes, and every field
//! width is even, so a structure is simply its fields back to back. Each
//! piece is read from the stream as one exact-size block and then parsed,
//! which keeps short reads (a fatal condition) apart from field decoding.

use std::io::{self, ErrorKind, Read};

use serde::Serialize;
use winnow::binary::{le_f32, le_f64, le_i32, le_i64, le_u32};
use winnow::combinator::repeat;
use winnow::error::ContextError;
use winnow::token::take;
use winnow::Parser;

use crate::{DecodeError, Phase};

pub(crate) type Input<'i> = &'i [u8];
pub(crate) type PResult<T> = Result<T, ContextError>;

/// A structure with a fixed on-disk size.
pub(crate) trait Block: Sized {
    const SIZE: usize;

    fn parse(input: &mut Input<'_>) -> PResult<Self>;
}

pub(crate) fn int32(input: &mut Input<'_>) -> PResult<i32> {
    le_i32.parse_next(input)
}

pub(crate) fn uint32(input: &mut Input<'_>) -> PResult<u32> {
    le_u32.parse_next(input)
}

pub(crate) fn int64(input: &mut Input<'_>) -> PResult<i64> {
    le_i64.parse_next(input)
}

pub(crate) fn float32(input: &mut Input<'_>) -> PResult<f32> {
    le_f32.parse_next(input)
}

pub(crate) fn float64(input: &mut Input<'_>) -> PResult<f64> {
    le_f64.parse_next(input)
}

fn bytes<'i>(input: &mut Input<'i>, len: usize) -> PResult<&'i [u8]> {
    take(len).parse_next(input)
}

/// A NUL padded character array of `len` bytes. Everything from the first
/// NUL on is ignored, as is trailing whitespace.
pub(crate) fn chars(input: &mut Input<'_>, len: usize) -> PResult<String> {
    let raw = bytes(input, len)?;
    Ok(nul_terminated(raw))
}

pub(crate) fn nul_terminated(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

impl Block for i32 {
    const SIZE: usize = 4;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        int32(input)
    }
}

impl Block for u32 {
    const SIZE: usize = 4;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        uint32(input)
    }
}

/// How a curve is mapped on the instrument's display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DisplayCurve {
    pub map_to: i32,
    pub show: i32,
}

impl Block for DisplayCurve {
    const SIZE: usize = 8;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(DisplayCurve {
            map_to: int32(input)?,
            show: int32(input)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Param {
    pub start: f32,
    pub step: f32,
    pub stop: f32,
}

impl Block for Param {
    const SIZE: usize = 12;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(Param {
            start: float32(input)?,
            step: float32(input)?,
            stop: float32(input)?,
        })
    }
}

/// Who wrote the file and when. Opens most main headers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
    pub file_time: String,
    pub comment: String,
}

impl Block for Creator {
    const SIZE: usize = 306;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        let name = chars(input, 18)?;
        let version = chars(input, 12)?;
        let file_time = chars(input, 18)?;
        let _crlf = bytes(input, 2)?;
        let comment = chars(input, 256)?;
        Ok(Creator {
            name,
            version,
            file_time,
            comment,
        })
    }
}

/// The display and repeat settings of the acquisition software, laid out
/// identically in every main header.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DisplaySettings {
    pub lin_log: i32,
    pub time_axis_from: i32,
    pub time_axis_to: i32,
    pub count_axis_from: i32,
    pub count_axis_to: i32,
    pub curves: Vec<DisplayCurve>,
    pub params: Vec<Param>,
    pub repeat_mode: i32,
    pub repeats_per_curve: i32,
    pub repeat_time: i32,
    pub repeat_wait_time: i32,
    pub script_name: String,
}

impl Block for DisplaySettings {
    const SIZE: usize = 20 + 8 * DisplayCurve::SIZE + 3 * Param::SIZE + 16 + 20;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(DisplaySettings {
            lin_log: int32(input)?,
            time_axis_from: int32(input)?,
            time_axis_to: int32(input)?,
            count_axis_from: int32(input)?,
            count_axis_to: int32(input)?,
            curves: display_curves(input)?,
            params: params(input)?,
            repeat_mode: int32(input)?,
            repeats_per_curve: int32(input)?,
            repeat_time: int32(input)?,
            repeat_wait_time: int32(input)?,
            script_name: chars(input, 20)?,
        })
    }
}

fn display_curves(input: &mut Input<'_>) -> PResult<Vec<DisplayCurve>> {
    repeat(8, DisplayCurve::parse).parse_next(input)
}

fn params(input: &mut Input<'_>) -> PResult<Vec<Param>> {
    repeat(3, Param::parse).parse_next(input)
}

fn malformed(phase: Phase, err: ContextError) -> DecodeError {
    DecodeError::read(
        phase,
        io::Error::new(ErrorKind::InvalidData, format!("malformed block: {}", err)),
    )
}

/// Converts a count decoded from a header field, which must not be negative.
pub(crate) fn element_count(count: impl Into<i64>, phase: Phase) -> Result<usize, DecodeError> {
    let count = count.into();
    usize::try_from(count).map_err(|_| {
        DecodeError::read(
            phase,
            io::Error::new(
                ErrorKind::InvalidData,
                format!("negative element count {}", count),
            ),
        )
    })
}

/// Reads exactly one block. A short read is fatal.
pub(crate) fn read_block<B: Block, R: Read + ?Sized>(
    reader: &mut R,
    phase: Phase,
) -> Result<B, DecodeError> {
    let mut buf = vec![0u8; B::SIZE];
    reader
        .read_exact(&mut buf)
        .map_err(|e| DecodeError::read(phase, e))?;
    let mut input = buf.as_slice();
    B::parse(&mut input).map_err(|e| malformed(phase, e))
}

/// Reads exactly `count` consecutive blocks, the count having been decoded
/// from an earlier field. Failing to read all of them is fatal.
pub(crate) fn read_blocks<B: Block, R: Read + ?Sized>(
    reader: &mut R,
    count: i64,
    phase: Phase,
) -> Result<Vec<B>, DecodeError> {
    let count = element_count(count, phase)?;
    let len = count
        .checked_mul(B::SIZE)
        .ok_or(DecodeError::Allocation { requested: count })?;

    // Grows with the data actually present instead of trusting the count
    // with one large allocation.
    let mut buf = Vec::new();
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| DecodeError::read(phase, e))?;
    if buf.len() != len {
        return Err(DecodeError::read(
            phase,
            io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {} elements, stream ended after {} bytes", count, buf.len()),
            ),
        ));
    }

    let mut input = buf.as_slice();
    repeat(count, B::parse)
        .parse_next(&mut input)
        .map_err(|e| malformed(phase, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_padding_is_ignored() {
        assert_eq!(nul_terminated(b"HydraHarp\0\0\0junk\0\0\0"), "HydraHarp");
        assert_eq!(nul_terminated(b"2.0 \0\0"), "2.0");
        assert_eq!(nul_terminated(b"full"), "full");
    }

    #[test]
    fn read_blocks_reads_count() {
        let mut data: Vec<u8> = Vec::new();
        for v in [3i32, -1, 7] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let values: Vec<i32> = read_blocks(&mut &data[..], 3, Phase::Header).unwrap();
        assert_eq!(values, vec![3, -1, 7]);
    }

    #[test]
    fn read_blocks_short_is_fatal() {
        let data = 5u32.to_le_bytes();
        let result = read_blocks::<u32, _>(&mut &data[..], 2, Phase::Tail("test"));
        match result {
            Err(DecodeError::Read { phase, source }) => {
                assert_eq!(phase, Phase::Tail("test"));
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("Expected a read error, got {:?}", other),
        }
    }

    #[test]
    fn read_blocks_rejects_negative_count() {
        let empty: &[u8] = &[];
        let result = read_blocks::<u32, _>(&mut &empty[..], -4, Phase::Header);
        assert!(matches!(result, Err(DecodeError::Read { .. })));
    }

    #[test]
    fn display_settings_size() {
        assert_eq!(DisplaySettings::SIZE, 156);
        let data = vec![0u8; DisplaySettings::SIZE];
        let mut input = &data[..];
        let settings = DisplaySettings::parse(&mut input).unwrap();
        assert!(input.is_empty());
        assert_eq!(settings.curves.len(), 8);
        assert_eq!(settings.params.len(), 3);
    }

    #[test]
    fn display_curve_block() {
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        let curve: DisplayCurve = read_block(&mut &data[..], Phase::Header).unwrap();
        assert_eq!(curve, DisplayCurve { map_to: 2, show: 1 });
    }
}
