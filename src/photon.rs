//! Canonical photon records and the grammar every stage reads and writes.
//!
//! A stream is either text, one comma separated record per line, or binary,
//! where each record occupies a fixed number of little-endian bytes laid out
//! like the record in memory (including alignment padding).

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StageError;

/// Absolute T2 times are picoseconds since the start of the measurement.
pub type Picosecond = i64;
pub type Channel = u32;
/// Index of the excitation pulse since the start of the measurement.
pub type Pulse = i64;

/// The grammar of a record stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    T2,
    T3,
    Bins,
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordMode::T2 => "t2",
            RecordMode::T3 => "t3",
            RecordMode::Bins => "bins",
        };
        f.write_str(name)
    }
}

impl FromStr for RecordMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "t2" => Ok(RecordMode::T2),
            "t3" => Ok(RecordMode::T3),
            "bins" | "interactive" => Ok(RecordMode::Bins),
            other => Err(format!("Unknown record mode {:?}", other)),
        }
    }
}

/// Behavior shared by the canonical records: a fixed binary size and a
/// textual form. `Display` writes the text form without a newline.
pub trait CanonicalRecord: Copy + fmt::Debug + fmt::Display + Sized {
    const MODE: RecordMode;
    const BINARY_SIZE: usize;

    /// Writes the record into `buf`, which is exactly `BINARY_SIZE` long.
    fn write_binary(&self, buf: &mut [u8]);
    /// Reads a record from `buf`, which is exactly `BINARY_SIZE` long.
    fn read_binary(buf: &[u8]) -> Self;
    fn parse_text(line: &str) -> Option<Self>;
}

/// Upper bound of [`CanonicalRecord::BINARY_SIZE`] over all records.
const MAX_BINARY_SIZE: usize = 32;

/// A photon tagged with its absolute arrival time.
///
/// Records are ordered by time alone; the channel only takes part in
/// equality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct T2 {
    pub channel: Channel,
    pub time: Picosecond,
}

impl T2 {
    pub fn new(channel: Channel, time: Picosecond) -> Self {
        T2 { channel, time }
    }
}

impl PartialOrd for T2 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for T2 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl fmt::Display for T2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.channel, self.time)
    }
}

impl CanonicalRecord for T2 {
    const MODE: RecordMode = RecordMode::T2;
    const BINARY_SIZE: usize = 16;

    fn write_binary(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.channel.to_le_bytes());
        buf[4..8].fill(0);
        buf[8..16].copy_from_slice(&self.time.to_le_bytes());
    }

    fn read_binary(buf: &[u8]) -> Self {
        T2 {
            channel: u32::from_le_bytes(le_array(&buf[0..4])),
            time: i64::from_le_bytes(le_array(&buf[8..16])),
        }
    }

    fn parse_text(line: &str) -> Option<Self> {
        let mut fields = line.split(',').map(str::trim);
        let channel = fields.next()?.parse().ok()?;
        let time = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(T2 { channel, time })
    }
}

/// A photon tagged with the pulse it followed and its delay within that
/// pulse, in instrument bins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct T3 {
    pub channel: Channel,
    pub pulse: Pulse,
    pub time: i64,
}

impl T3 {
    pub fn new(channel: Channel, pulse: Pulse, time: i64) -> Self {
        T3 {
            channel,
            pulse,
            time,
        }
    }
}

impl PartialOrd for T3 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for T3 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pulse
            .cmp(&other.pulse)
            .then(self.time.cmp(&other.time))
    }
}

impl fmt::Display for T3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.channel, self.pulse, self.time)
    }
}

impl CanonicalRecord for T3 {
    const MODE: RecordMode = RecordMode::T3;
    const BINARY_SIZE: usize = 24;

    fn write_binary(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.channel.to_le_bytes());
        buf[4..8].fill(0);
        buf[8..16].copy_from_slice(&self.pulse.to_le_bytes());
        buf[16..24].copy_from_slice(&self.time.to_le_bytes());
    }

    fn read_binary(buf: &[u8]) -> Self {
        T3 {
            channel: u32::from_le_bytes(le_array(&buf[0..4])),
            pulse: i64::from_le_bytes(le_array(&buf[8..16])),
            time: i64::from_le_bytes(le_array(&buf[16..24])),
        }
    }

    fn parse_text(line: &str) -> Option<Self> {
        let mut fields = line.split(',').map(str::trim);
        let channel = fields.next()?.parse().ok()?;
        let pulse = fields.next()?.parse().ok()?;
        let time = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(T3 {
            channel,
            pulse,
            time,
        })
    }
}

/// A single histogram bin, either read from an interactive-mode curve or
/// produced by the histogram stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub curve: u32,
    pub left: f64,
    pub right: f64,
    pub counts: u64,
}

impl fmt::Display for HistogramBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.3},{:.3},{}",
            self.curve, self.left, self.right, self.counts
        )
    }
}

impl CanonicalRecord for HistogramBin {
    const MODE: RecordMode = RecordMode::Bins;
    const BINARY_SIZE: usize = 32;

    fn write_binary(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.curve.to_le_bytes());
        buf[4..8].fill(0);
        buf[8..16].copy_from_slice(&self.left.to_le_bytes());
        buf[16..24].copy_from_slice(&self.right.to_le_bytes());
        buf[24..32].copy_from_slice(&self.counts.to_le_bytes());
    }

    fn read_binary(buf: &[u8]) -> Self {
        HistogramBin {
            curve: u32::from_le_bytes(le_array(&buf[0..4])),
            left: f64::from_le_bytes(le_array(&buf[8..16])),
            right: f64::from_le_bytes(le_array(&buf[16..24])),
            counts: u64::from_le_bytes(le_array(&buf[24..32])),
        }
    }

    fn parse_text(line: &str) -> Option<Self> {
        let mut fields = line.split(',').map(str::trim);
        let curve = fields.next()?.parse().ok()?;
        let left = fields.next()?.parse().ok()?;
        let right = fields.next()?.parse().ok()?;
        let counts = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(HistogramBin {
            curve,
            left,
            right,
            counts,
        })
    }
}

/// Copies a slice of known length into an array for `from_le_bytes`.
#[inline]
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    arr
}

/// Any canonical record, as produced by a decoder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Record {
    T2(T2),
    T3(T3),
    Bin(HistogramBin),
}

impl Record {
    pub fn mode(&self) -> RecordMode {
        match self {
            Record::T2(_) => RecordMode::T2,
            Record::T3(_) => RecordMode::T3,
            Record::Bin(_) => RecordMode::Bins,
        }
    }
}

impl From<T2> for Record {
    fn from(t2: T2) -> Self {
        Record::T2(t2)
    }
}

impl From<T3> for Record {
    fn from(t3: T3) -> Self {
        Record::T3(t3)
    }
}

impl From<HistogramBin> for Record {
    fn from(bin: HistogramBin) -> Self {
        Record::Bin(bin)
    }
}

/// Writes canonical records to a byte stream in text or binary form.
///
/// No buffering happens here, wrap the output in a `BufWriter` when needed.
pub struct RecordWriter<W: Write> {
    out: W,
    binary: bool,
    buf: [u8; MAX_BINARY_SIZE],
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, binary: bool) -> Self {
        RecordWriter {
            out,
            binary,
            buf: [0u8; MAX_BINARY_SIZE],
            written: 0,
        }
    }

    pub fn write<P: CanonicalRecord>(&mut self, record: &P) -> io::Result<()> {
        if self.binary {
            let buf = &mut self.buf[..P::BINARY_SIZE];
            record.write_binary(buf);
            self.out.write_all(buf)?;
        } else {
            writeln!(self.out, "{}", record)?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn write_record(&mut self, record: &Record) -> io::Result<()> {
        match record {
            Record::T2(t2) => self.write(t2),
            Record::T3(t3) => self.write(t3),
            Record::Bin(bin) => self.write(bin),
        }
    }

    /// Number of records written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads canonical records from a byte stream in text or binary form.
///
/// End of stream is reported as `Ok(None)`. A record cut short by the end of
/// the stream (the writer went away mid-record) is logged and also treated
/// as the end of the stream.
pub struct RecordReader<R: BufRead> {
    input: R,
    binary: bool,
    line: String,
    line_number: u64,
    buf: [u8; MAX_BINARY_SIZE],
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R, binary: bool) -> Self {
        RecordReader {
            input,
            binary,
            line: String::new(),
            line_number: 0,
            buf: [0u8; MAX_BINARY_SIZE],
        }
    }

    pub fn next<P: CanonicalRecord>(&mut self) -> Result<Option<P>, StageError> {
        if self.binary {
            self.next_binary()
        } else {
            self.next_text()
        }
    }

    /// An iterator over the remaining records of type `P`.
    pub fn records<P: CanonicalRecord>(&mut self) -> Records<'_, R, P> {
        Records {
            reader: self,
            _record: PhantomData,
        }
    }

    fn next_binary<P: CanonicalRecord>(&mut self) -> Result<Option<P>, StageError> {
        let size = P::BINARY_SIZE;
        let mut filled = 0;
        while filled < size {
            match self.input.read(&mut self.buf[filled..size]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < size {
            warn!(
                "Input ended in the middle of a {} record ({} of {} bytes), treating it as the end of the stream",
                P::MODE,
                filled,
                size
            );
            return Ok(None);
        }
        Ok(Some(P::read_binary(&self.buf[..size])))
    }

    fn next_text<P: CanonicalRecord>(&mut self) -> Result<Option<P>, StageError> {
        loop {
            self.line.clear();
            let n = self.input.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let complete = self.line.ends_with('\n');
            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            // Every written record ends with a newline
            if !complete {
                warn!(
                    "Input ended in the middle of line {} ({:?}), treating it as the end of the stream",
                    self.line_number, text
                );
                return Ok(None);
            }
            return match P::parse_text(text) {
                Some(record) => Ok(Some(record)),
                None => Err(StageError::Parse {
                    line: self.line_number,
                    text: text.to_string(),
                }),
            };
        }
    }
}

/// Iterator wrapper for [`RecordReader`]
pub struct Records<'a, R: BufRead, P> {
    reader: &'a mut RecordReader<R>,
    _record: PhantomData<P>,
}

impl<'a, R: BufRead, P: CanonicalRecord> Iterator for Records<'a, R, P> {
    type Item = Result<P, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next::<P>().transpose()
    }
}

/// Reads a whole stream into memory. Handy for tests and small files.
pub fn read_all<P: CanonicalRecord, R: Read>(input: R, binary: bool) -> Result<Vec<P>, StageError> {
    let mut reader = RecordReader::new(io::BufReader::new(input), binary);
    reader.records::<P>().collect()
}
