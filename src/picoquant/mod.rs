//! Decoding of PicoQuant instrument files.
//!
//! A file starts with a 22 byte identity naming the instrument and the
//! format version. The rest of the file (main header, measurement
//! sub-header, records) depends entirely on that pair, so [`open`] reads the
//! identity, selects a [`Format`] and hands the remaining bytes over to the
//! matching decoder.

pub mod block;
pub mod hydraharp;
pub mod picoharp;
pub mod timeharp;
pub(crate) mod tttr;

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use serde::Serialize;

use crate::photon::{HistogramBin, Record, RecordMode};
use crate::picoquant::block::{chars, Block, Input, PResult};
use crate::{DecodeError, Phase};

/// The leading bytes of every supported file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub ident: String,
    pub format_version: String,
}

impl Block for FileIdentity {
    const SIZE: usize = 22;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(FileIdentity {
            ident: chars(input, 16)?,
            format_version: chars(input, 6)?,
        })
    }
}

impl FileIdentity {
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self, DecodeError> {
        block::read_block(reader, Phase::Identity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Vendor {
    PicoHarp,
    HydraHarp,
    TimeHarp,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Vendor::PicoHarp => "PicoHarp",
            Vendor::HydraHarp => "HydraHarp",
            Vendor::TimeHarp => "TimeHarp",
        };
        f.write_str(name)
    }
}

lazy_static! {
    static ref SIGNATURES: HashMap<&'static str, Vendor> = {
        let mut m = HashMap::new();
        m.insert("PicoHarp 300", Vendor::PicoHarp);
        m.insert("HydraHarp", Vendor::HydraHarp);
        m.insert("TimeHarp 200", Vendor::TimeHarp);
        m
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PicoHarpVersion {
    V20,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HydraHarpVersion {
    V10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeHarpVersion {
    V20,
    V60,
}

/// A supported (instrument, format version) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    PicoHarp(PicoHarpVersion),
    HydraHarp(HydraHarpVersion),
    TimeHarp(TimeHarpVersion),
}

impl Vendor {
    /// Looks up the vendor from the identity string.
    pub fn from_ident(ident: &str) -> Result<Self, DecodeError> {
        SIGNATURES
            .get(ident)
            .copied()
            .ok_or_else(|| DecodeError::FormatUnrecognized {
                ident: ident.to_string(),
            })
    }

    pub fn format(self, version: &str) -> Result<Format, DecodeError> {
        let format = match (self, version) {
            (Vendor::PicoHarp, "2.0") => Format::PicoHarp(PicoHarpVersion::V20),
            (Vendor::HydraHarp, "1.0") => Format::HydraHarp(HydraHarpVersion::V10),
            (Vendor::TimeHarp, "2.0") => Format::TimeHarp(TimeHarpVersion::V20),
            (Vendor::TimeHarp, "6.0") => Format::TimeHarp(TimeHarpVersion::V60),
            _ => {
                return Err(DecodeError::FormatVersionUnsupported {
                    vendor: self.to_string(),
                    version: version.to_string(),
                })
            }
        };
        Ok(format)
    }
}

impl Format {
    pub fn identify(identity: &FileIdentity) -> Result<Self, DecodeError> {
        Vendor::from_ident(&identity.ident)?.format(&identity.format_version)
    }

    pub fn vendor(&self) -> Vendor {
        match self {
            Format::PicoHarp(_) => Vendor::PicoHarp,
            Format::HydraHarp(_) => Vendor::HydraHarp,
            Format::TimeHarp(_) => Vendor::TimeHarp,
        }
    }

    /// Decodes the headers that follow the identity and prepares the record
    /// stream. No records are read yet.
    pub fn open<'r, R: Read + 'r>(
        self,
        identity: FileIdentity,
        reader: R,
        options: DecodeOptions,
    ) -> Result<Decoded<'r>, DecodeError> {
        debug!("Decoding a {:?} file", self);
        let body = match self {
            Format::PicoHarp(PicoHarpVersion::V20) => picoharp::open_v20(reader, options)?,
            Format::HydraHarp(HydraHarpVersion::V10) => hydraharp::open_v10(reader, options)?,
            Format::TimeHarp(version) => timeharp::open(version, reader, options)?,
        };
        Ok(Decoded {
            identity,
            format: self,
            header: body.header,
            resolution: body.resolution,
            records: body.records,
        })
    }
}

/// An external marker event found in a TTTR stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    /// 1-based index of the raw record
    pub record: u64,
    /// Bit mask of the marker inputs
    pub channels: u32,
    /// Picoseconds for T2 streams, pulse number for T3 streams
    pub time: i64,
}

/// Receives the markers of a stream, which are never emitted as records.
pub trait MarkerSink {
    fn marker(&mut self, marker: Marker);
}

/// Logs every marker. The default sink.
pub struct LogMarkers;

impl MarkerSink for LogMarkers {
    fn marker(&mut self, marker: Marker) {
        info!(
            "External marker: {:#x} at record {} (time {})",
            marker.channels, marker.record, marker.time
        );
    }
}

impl MarkerSink for Vec<Marker> {
    fn marker(&mut self, marker: Marker) {
        self.push(marker);
    }
}

impl MarkerSink for crossbeam::channel::Sender<Marker> {
    fn marker(&mut self, marker: Marker) {
        if self.send(marker).is_err() {
            debug!("Marker receiver is gone, dropping marker");
        }
    }
}

/// Knobs of the decoders.
pub struct DecodeOptions {
    /// Report TimeHarp TTTR histogram bins counted from the other end of the
    /// histogram (`NumberOfChannels - 1 - bin`).
    pub reverse_histogram_channels: bool,
    pub markers: Box<dyn MarkerSink>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            reverse_histogram_channels: false,
            markers: Box::new(LogMarkers),
        }
    }
}

impl fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("reverse_histogram_channels", &self.reverse_histogram_channels)
            .finish()
    }
}

impl DecodeOptions {
    pub fn with_reverse_histogram_channels(mut self, reverse: bool) -> Self {
        self.reverse_histogram_channels = reverse;
        self
    }

    pub fn with_markers(mut self, markers: Box<dyn MarkerSink>) -> Self {
        self.markers = markers;
        self
    }
}

/// Counters kept while decoding a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Raw records read
    pub records: u64,
    pub photons: u64,
    pub overflows: u64,
    pub markers: u64,
    pub inconsistent_overflows: u64,
}

/// A lazily decoded sequence of canonical records.
pub trait RecordStream {
    fn mode(&self) -> RecordMode;
    fn next_record(&mut self) -> Result<Option<Record>, DecodeError>;
    fn stats(&self) -> DecodeStats;
}

/// Body of a file: either pre-binned curves or a TTTR sub-header.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Measurement<C, T> {
    Interactive(Vec<C>),
    Tttr(T),
}

/// The decoded headers of any supported file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Header {
    PicoHarp(picoharp::PicoHarpHeader),
    HydraHarp(hydraharp::HydraHarpHeader),
    TimeHarp(timeharp::TimeHarpHeader),
}

/// An opened file: its headers, the resolution of its time values and the
/// stream of its records.
pub struct Decoded<'r> {
    pub identity: FileIdentity,
    pub format: Format,
    pub header: Header,
    /// Instrument resolution in seconds. T3 delays count in units of it,
    /// T2 times are always picoseconds.
    pub resolution: f64,
    pub records: Box<dyn RecordStream + 'r>,
}

impl<'r> Decoded<'r> {
    pub fn mode(&self) -> RecordMode {
        self.records.mode()
    }

    pub fn stats(&self) -> DecodeStats {
        self.records.stats()
    }
}

impl<'r> fmt::Debug for Decoded<'r> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoded")
            .field("identity", &self.identity)
            .field("format", &self.format)
            .field("resolution", &self.resolution)
            .field("mode", &self.mode())
            .finish()
    }
}

impl<'r> Iterator for Decoded<'r> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next_record().transpose()
    }
}

/// Reads the identity from `reader` and opens the file with the matching
/// decoder.
pub fn open<'r, R: Read + 'r>(
    mut reader: R,
    options: DecodeOptions,
) -> Result<Decoded<'r>, DecodeError> {
    let identity = FileIdentity::read(&mut reader)?;
    info!(
        "Found a {} file, format version {}",
        identity.ident, identity.format_version
    );
    let format = Format::identify(&identity)?;
    format.open(identity, reader, options)
}

/// Returns the record mode of the file at `path`, reading only its headers.
pub fn probe(path: &Path) -> Result<RecordMode, DecodeError> {
    let file = File::open(path).map_err(|e| DecodeError::read(Phase::Identity, e))?;
    let decoded = open(BufReader::new(file), DecodeOptions::default())?;
    Ok(decoded.mode())
}

/// What a vendor decoder produces after the identity.
pub(crate) struct Body<'r> {
    pub header: Header,
    pub resolution: f64,
    pub records: Box<dyn RecordStream + 'r>,
}

/// One interactive-mode curve: its index, the width of its bins in
/// nanoseconds and its counts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Curve {
    pub index: u32,
    pub resolution_ns: f64,
    pub counts: Vec<u32>,
}

/// Emits the bins of pre-binned curves, curve after curve.
pub(crate) struct InteractiveStream {
    curves: Vec<Curve>,
    curve: usize,
    bin: usize,
    stats: DecodeStats,
}

impl InteractiveStream {
    pub(crate) fn new(curves: Vec<Curve>) -> Self {
        InteractiveStream {
            curves,
            curve: 0,
            bin: 0,
            stats: DecodeStats::default(),
        }
    }
}

impl RecordStream for InteractiveStream {
    fn mode(&self) -> RecordMode {
        RecordMode::Bins
    }

    fn next_record(&mut self) -> Result<Option<Record>, DecodeError> {
        while let Some(curve) = self.curves.get(self.curve) {
            if let Some(&counts) = curve.counts.get(self.bin) {
                let left = self.bin as f64 * curve.resolution_ns;
                self.bin += 1;
                self.stats.records += 1;
                return Ok(Some(Record::Bin(HistogramBin {
                    curve: curve.index,
                    left,
                    right: self.bin as f64 * curve.resolution_ns,
                    counts: u64::from(counts),
                })));
            }
            self.curve += 1;
            self.bin = 0;
        }
        Ok(None)
    }

    fn stats(&self) -> DecodeStats {
        self.stats
    }
}

/// Reads the count arrays following the curve headers, one per curve.
pub(crate) fn read_counts<R: Read + ?Sized>(
    reader: &mut R,
    lengths: impl IntoIterator<Item = i64>,
) -> Result<Vec<Vec<u32>>, DecodeError> {
    lengths
        .into_iter()
        .map(|len| block::read_blocks::<u32, _>(reader, len, Phase::Tail("curve counts")))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Byte builders for synthetic instrument files.

    /// Little-endian writer for packed structures.
    pub struct Bytes(pub Vec<u8>);

    impl Bytes {
        pub fn new() -> Self {
            Bytes(Vec::new())
        }

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

        pub fn f32(&mut self, v: f32) -> &mut Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn f64(&mut self, v: f64) -> &mut Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn identity(&mut self, ident: &str, version: &str) -> &mut Self {
            self.chars(ident, 16).chars(version, 6)
        }

        /// CreatorName, CreatorVersion, FileTime, CRLF and Comment
        pub fn creator_strings(&mut self) -> &mut Self {
            self.chars("photoncorr", 18)
                .chars("0.1", 12)
                .chars("16/10/26 12:00:00", 18)
                .chars("\r\n", 2)
                .chars("synthetic", 256)
        }

        /// DisplayLinLog, the four axis limits, DisplayCurve[8], Param[3],
        /// the four repeat fields and ScriptName
        pub fn display_block(&mut self) -> &mut Self {
            self.i32s(0, 5).i32s(0, 16).i32s(0, 9).i32s(0, 4).chars("", 20)
        }

        pub fn build(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    /// A HydraHarp T2 file with one module, no input channels and the given
    /// raw records.
    pub fn hydraharp_t2(records: &[u32]) -> Vec<u8> {
        let mut bytes = Bytes::new();
        bytes
            .identity("HydraHarp", "1.0")
            .creator_strings()
            .i32(0)
            .i32(32)
            .i32(0)
            .i32(2)
            .i32(0)
            .i32(0)
            .f64(1.0)
            .i32(0)
            .i32(1000)
            .i32s(0, 3)
            .display_block()
            .chars("HydraHarp 400", 16)
            .chars("930001", 8)
            .i32(1234)
            .i32(0)
            .i32s(1, 20)
            .f64(1.0)
            .i64(0)
            .i32(0)
            .i32s(0, 7)
            .i32(80_000_000)
            .i32s(0, 3)
            .i64(records.len() as i64);
        for &record in records {
            bytes.u32(record);
        }
        bytes.build()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Bytes;
    use super::*;

    #[test]
    fn identity_is_twenty_two_bytes() {
        let mut bytes = Bytes::new();
        bytes.identity("HydraHarp", "1.0").chars("rest", 4);
        let data = bytes.build();
        let mut reader = &data[..];
        let identity = FileIdentity::read(&mut reader).unwrap();
        assert_eq!(identity.ident, "HydraHarp");
        assert_eq!(identity.format_version, "1.0");
        assert_eq!(reader, b"rest");
    }

    #[test]
    fn known_signatures() {
        let id = |ident: &str, version: &str| FileIdentity {
            ident: ident.to_string(),
            format_version: version.to_string(),
        };
        assert_eq!(
            Format::identify(&id("PicoHarp 300", "2.0")).unwrap(),
            Format::PicoHarp(PicoHarpVersion::V20)
        );
        assert_eq!(
            Format::identify(&id("HydraHarp", "1.0")).unwrap(),
            Format::HydraHarp(HydraHarpVersion::V10)
        );
        assert_eq!(
            Format::identify(&id("TimeHarp 200", "6.0")).unwrap(),
            Format::TimeHarp(TimeHarpVersion::V60)
        );
        assert_eq!(
            Format::identify(&id("TimeHarp 200", "2.0")).unwrap().vendor(),
            Vendor::TimeHarp
        );
    }

    #[test]
    fn unknown_ident_is_unrecognized() {
        let mut bytes = Bytes::new();
        bytes.identity("FooHarp", "1.0");
        let data = bytes.build();
        match open(&data[..], DecodeOptions::default()) {
            Err(DecodeError::FormatUnrecognized { ident }) => assert_eq!(ident, "FooHarp"),
            other => panic!("Expected FormatUnrecognized, got {:?}", other),
        };
    }

    #[test]
    fn unknown_version_is_unsupported() {
        for (ident, version) in [("TimeHarp 200", "5.0"), ("PicoHarp 300", "3.0"), ("HydraHarp", "2.0")] {
            let mut bytes = Bytes::new();
            bytes.identity(ident, version);
            let data = bytes.build();
            match open(&data[..], DecodeOptions::default()) {
                Err(DecodeError::FormatVersionUnsupported { version: v, .. }) => assert_eq!(v, version),
                other => panic!("Expected FormatVersionUnsupported, got {:?}", other),
            };
        }
    }

    #[test]
    fn short_identity_is_a_read_error() {
        let data = b"PicoHarp 300\0\0\0\0";
        match open(&data[..], DecodeOptions::default()) {
            Err(DecodeError::Read { phase, .. }) => assert_eq!(phase, Phase::Identity),
            other => panic!("Expected a read error, got {:?}", other),
        };
    }

    #[test]
    fn interactive_stream_walks_all_curves() {
        let mut stream = InteractiveStream::new(vec![
            Curve {
                index: 0,
                resolution_ns: 0.5,
                counts: vec![3, 4],
            },
            Curve {
                index: 1,
                resolution_ns: 0.5,
                counts: vec![],
            },
            Curve {
                index: 2,
                resolution_ns: 1.0,
                counts: vec![9],
            },
        ]);
        let mut bins = Vec::new();
        while let Some(Record::Bin(bin)) = stream.next_record().unwrap() {
            bins.push(bin);
        }
        assert_eq!(bins.len(), 3);
        assert_eq!(
            bins[1],
            HistogramBin {
                curve: 0,
                left: 0.5,
                right: 1.0,
                counts: 4
            }
        );
        assert_eq!(bins[2].curve, 2);
        assert_eq!(bins[2].right, 1.0);
        assert_eq!(stream.stats().records, 3);
    }
}
