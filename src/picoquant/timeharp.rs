//! TimeHarp 200, file format versions 2.0 and 6.0.
//!
//! Both versions share the measurement settings and the curve layout. They
//! differ in the leading strings of the main header, in what a board
//! records and in the TTTR sub-header, and the bit order of the TTTR record
//! was turned around in 6.0.
//!
//! The TTTR mode of these boards is reverse start-stop: a photon starts the
//! TDC and the next sync stops it, so histogram bins count backwards from
//! the sync. The raw bin is reported unless
//! [`DecodeOptions::reverse_histogram_channels`] asks for
//! `NumberOfChannels - 1 - bin`.

use std::io::Read;

use serde::Serialize;

use crate::photon::RecordMode;
use crate::picoquant::block::{
    self, chars, float32, int32, Block, Creator, DisplaySettings, Input, PResult,
};
use crate::picoquant::tttr::{bits, RawEvent, RecordLayout, TttrStream};
use crate::picoquant::{
    read_counts, Body, Curve, DecodeOptions, Header, InteractiveStream, MarkerSink, Measurement,
    RecordStream, TimeHarpVersion,
};
use crate::{DecodeError, Phase};

const MODE_INTERACTIVE: i32 = 0;
const MODE_TTTR: i32 = 1;

/// Rollover of the 16 bit time tag (a sync counter)
const WRAP: i64 = 65_536;
/// Bin flag of overflow records
const OVERFLOW_BIN: u32 = 0x800;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MainHeader {
    /// Version 2.0 files only store the file time and the comment
    pub creator: Creator,
    /// Only present in version 2.0 files
    pub hardware_version: Option<String>,
    pub number_of_channels: i32,
    pub number_of_curves: i32,
    pub bits_per_channel: i32,
    pub routing_channels: i32,
    pub number_of_boards: i32,
    pub active_curve: i32,
    pub measurement_mode: i32,
    /// Called the histogramming mode in version 2.0
    pub sub_mode: i32,
    pub range_no: i32,
    pub offset: i32,
    pub acquisition_time: i32,
    pub stop_at: i32,
    pub stop_on_overflow: i32,
    pub restart: i32,
    pub display: DisplaySettings,
}

const SETTINGS_SIZE: usize = 14 * 4 + DisplaySettings::SIZE;

fn main_header(
    input: &mut Input<'_>,
    creator: Creator,
    hardware_version: Option<String>,
) -> PResult<MainHeader> {
    Ok(MainHeader {
        creator,
        hardware_version,
        number_of_channels: int32(input)?,
        number_of_curves: int32(input)?,
        bits_per_channel: int32(input)?,
        routing_channels: int32(input)?,
        number_of_boards: int32(input)?,
        active_curve: int32(input)?,
        measurement_mode: int32(input)?,
        sub_mode: int32(input)?,
        range_no: int32(input)?,
        offset: int32(input)?,
        acquisition_time: int32(input)?,
        stop_at: int32(input)?,
        stop_on_overflow: int32(input)?,
        restart: int32(input)?,
        display: DisplaySettings::parse(input)?,
    })
}

struct V20Main(MainHeader);

impl Block for V20Main {
    const SIZE: usize = 6 + 18 + 2 + 256 + SETTINGS_SIZE;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        let hardware_version = chars(input, 6)?;
        let file_time = chars(input, 18)?;
        let _crlf = chars(input, 2)?;
        let comment = chars(input, 256)?;
        let creator = Creator {
            file_time,
            comment,
            ..Creator::default()
        };
        main_header(input, creator, Some(hardware_version)).map(V20Main)
    }
}

struct V60Main(MainHeader);

impl Block for V60Main {
    const SIZE: usize = Creator::SIZE + SETTINGS_SIZE;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        let creator = Creator::parse(input)?;
        main_header(input, creator, None).map(V60Main)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Board {
    /// Only present in version 6.0 files
    pub hardware_ident: Option<String>,
    /// Only present in version 6.0 files
    pub hardware_version: Option<String>,
    pub board_serial: i32,
    pub cfd_zero_cross: i32,
    pub cfd_discriminator_min: i32,
    pub sync_level: i32,
    pub curve_offset: i32,
    /// Nanoseconds
    pub resolution: f32,
}

fn board(
    input: &mut Input<'_>,
    hardware_ident: Option<String>,
    hardware_version: Option<String>,
) -> PResult<Board> {
    Ok(Board {
        hardware_ident,
        hardware_version,
        board_serial: int32(input)?,
        cfd_zero_cross: int32(input)?,
        cfd_discriminator_min: int32(input)?,
        sync_level: int32(input)?,
        curve_offset: int32(input)?,
        resolution: float32(input)?,
    })
}

struct V20Board(Board);

impl Block for V20Board {
    const SIZE: usize = 24;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        board(input, None, None).map(V20Board)
    }
}

struct V60Board(Board);

impl Block for V60Board {
    const SIZE: usize = 16 + 8 + 24;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        let ident = chars(input, 16)?;
        let version = chars(input, 8)?;
        board(input, Some(ident), Some(version)).map(V60Board)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TttrHeader {
    /// Nanoseconds
    pub glob_clock: i32,
    /// Only present in version 6.0 files
    pub ext_devices: Option<i32>,
    pub reserved: Vec<i32>,
    pub sync_rate: i32,
    pub average_cfd_rate: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub number_of_records: i32,
    pub spec_header_length: i32,
    pub spec_header: Vec<i32>,
}

struct V20Tttr(TttrHeader);

impl Block for V20Tttr {
    const SIZE: usize = 12 * 4;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(V20Tttr(TttrHeader {
            glob_clock: int32(input)?,
            ext_devices: None,
            reserved: (0..6).map(|_| int32(input)).collect::<PResult<_>>()?,
            sync_rate: int32(input)?,
            average_cfd_rate: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            number_of_records: int32(input)?,
            spec_header_length: 0,
            spec_header: Vec::new(),
        }))
    }
}

struct V60Tttr(TttrHeader);

impl Block for V60Tttr {
    const SIZE: usize = 13 * 4;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(V60Tttr(TttrHeader {
            glob_clock: int32(input)?,
            ext_devices: Some(int32(input)?),
            reserved: (0..5).map(|_| int32(input)).collect::<PResult<_>>()?,
            sync_rate: int32(input)?,
            average_cfd_rate: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            number_of_records: int32(input)?,
            spec_header_length: int32(input)?,
            spec_header: Vec::new(),
        }))
    }
}

/// Header of one interactive-mode curve. The two trailing words are
/// unnamed reserved space in version 2.0 files.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurveHeader {
    pub curve_index: i32,
    pub time_of_recording: i32,
    pub board_serial: i32,
    pub cfd_zero_cross: i32,
    pub cfd_discriminator_min: i32,
    pub sync_level: i32,
    pub curve_offset: i32,
    pub routing_channel: i32,
    pub sub_mode: i32,
    pub meas_mode: i32,
    pub p1: f32,
    pub p2: f32,
    pub p3: f32,
    pub range_no: i32,
    pub offset: i32,
    pub acquisition_time: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub sync_rate: i32,
    pub cfd_count_rate: i32,
    pub tdc_count_rate: i32,
    pub integral_count: i32,
    /// Nanoseconds per bin
    pub resolution: f32,
    pub ext_devices: i32,
    pub reserved: i32,
}

impl Block for CurveHeader {
    const SIZE: usize = 100;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(CurveHeader {
            curve_index: int32(input)?,
            time_of_recording: int32(input)?,
            board_serial: int32(input)?,
            cfd_zero_cross: int32(input)?,
            cfd_discriminator_min: int32(input)?,
            sync_level: int32(input)?,
            curve_offset: int32(input)?,
            routing_channel: int32(input)?,
            sub_mode: int32(input)?,
            meas_mode: int32(input)?,
            p1: float32(input)?,
            p2: float32(input)?,
            p3: float32(input)?,
            range_no: int32(input)?,
            offset: int32(input)?,
            acquisition_time: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            sync_rate: int32(input)?,
            cfd_count_rate: int32(input)?,
            tdc_count_rate: int32(input)?,
            integral_count: int32(input)?,
            resolution: float32(input)?,
            ext_devices: int32(input)?,
            reserved: int32(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeHarpHeader {
    pub main: MainHeader,
    pub boards: Vec<Board>,
    pub measurement: Measurement<CurveHeader, TttrHeader>,
}

/// Fields shared by both record layouts once they are pulled apart.
/// `reverse` holds the number of histogram channels when bins are to be
/// counted from the other end.
fn tttr_event(timetag: u32, bin: u32, route: u32, valid: u32, reverse: Option<u32>) -> RawEvent {
    if valid == 0 {
        return if bin & OVERFLOW_BIN != 0 {
            RawEvent::Overflow { count: 1 }
        } else {
            RawEvent::Marker {
                channels: bin & 0x7,
                field: timetag,
            }
        };
    }
    let dtime = match reverse {
        Some(channels) => (channels - 1).saturating_sub(bin),
        None => bin,
    };
    RawEvent::T3 {
        channel: route,
        nsync: timetag,
        dtime,
    }
}

/// timetag 0-15, bin 16-27, route 28-29, valid 30
struct V20Layout {
    reverse: Option<u32>,
}

impl RecordLayout for V20Layout {
    const MODE: RecordMode = RecordMode::T3;
    const WRAP: i64 = WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        tttr_event(
            bits(raw, 0, 16),
            bits(raw, 16, 12),
            bits(raw, 28, 2),
            bits(raw, 30, 1),
            self.reverse,
        )
    }
}

/// reserved 0, valid 1, route 2-3, bin 4-15, timetag 16-31
struct V60Layout {
    reverse: Option<u32>,
}

impl RecordLayout for V60Layout {
    const MODE: RecordMode = RecordMode::T3;
    const WRAP: i64 = WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        tttr_event(
            bits(raw, 16, 16),
            bits(raw, 4, 12),
            bits(raw, 2, 2),
            bits(raw, 1, 1),
            self.reverse,
        )
    }
}

fn tttr_stream<'r, R: Read + 'r>(
    version: TimeHarpVersion,
    reader: R,
    declared: i64,
    reverse: Option<u32>,
    markers: Box<dyn MarkerSink>,
) -> Box<dyn RecordStream + 'r> {
    match version {
        TimeHarpVersion::V20 => Box::new(TttrStream::new(
            reader,
            V20Layout { reverse },
            declared,
            markers,
        )),
        TimeHarpVersion::V60 => Box::new(TttrStream::new(
            reader,
            V60Layout { reverse },
            declared,
            markers,
        )),
    }
}

fn board_resolution(boards: &[Board]) -> f64 {
    match boards.first() {
        Some(board) => f64::from(board.resolution) * 1e-9,
        None => {
            warn!("File lists no boards, the resolution is unknown");
            0.0
        }
    }
}

pub(crate) fn open<'r, R: Read + 'r>(
    version: TimeHarpVersion,
    mut reader: R,
    options: DecodeOptions,
) -> Result<Body<'r>, DecodeError> {
    let main = match version {
        TimeHarpVersion::V20 => block::read_block::<V20Main, _>(&mut reader, Phase::Header)?.0,
        TimeHarpVersion::V60 => block::read_block::<V60Main, _>(&mut reader, Phase::Header)?.0,
    };
    debug!(
        "TimeHarp header: {} boards, {} channels, measurement mode {}",
        main.number_of_boards, main.number_of_channels, main.measurement_mode
    );

    let number_of_boards = i64::from(main.number_of_boards);
    let boards: Vec<Board> = match version {
        TimeHarpVersion::V20 => {
            block::read_blocks::<V20Board, _>(&mut reader, number_of_boards, Phase::Tail("boards"))?
                .into_iter()
                .map(|b| b.0)
                .collect()
        }
        TimeHarpVersion::V60 => {
            block::read_blocks::<V60Board, _>(&mut reader, number_of_boards, Phase::Tail("boards"))?
                .into_iter()
                .map(|b| b.0)
                .collect()
        }
    };

    let (measurement, resolution, records) = match main.measurement_mode {
        MODE_INTERACTIVE => {
            let curves: Vec<CurveHeader> = block::read_blocks(
                &mut reader,
                i64::from(main.number_of_curves),
                Phase::SubHeader,
            )?;
            let counts = read_counts(
                &mut reader,
                curves.iter().map(|_| i64::from(main.number_of_channels)),
            )?;
            let resolution = match curves.first() {
                Some(curve) => f64::from(curve.resolution) * 1e-9,
                None => board_resolution(&boards),
            };
            let stream: Box<dyn RecordStream + 'r> = Box::new(InteractiveStream::new(
                curves
                    .iter()
                    .zip(counts)
                    .map(|(c, counts)| Curve {
                        index: c.curve_index.max(0) as u32,
                        resolution_ns: f64::from(c.resolution),
                        counts,
                    })
                    .collect(),
            ));
            (Measurement::Interactive(curves), resolution, stream)
        }
        MODE_TTTR => {
            let mut tttr = match version {
                TimeHarpVersion::V20 => {
                    block::read_block::<V20Tttr, _>(&mut reader, Phase::SubHeader)?.0
                }
                TimeHarpVersion::V60 => {
                    block::read_block::<V60Tttr, _>(&mut reader, Phase::SubHeader)?.0
                }
            };
            tttr.spec_header = block::read_blocks(
                &mut reader,
                i64::from(tttr.spec_header_length),
                Phase::Tail("special header"),
            )?;
            let reverse = if options.reverse_histogram_channels {
                debug!(
                    "Counting histogram bins back from {} channels",
                    main.number_of_channels
                );
                Some(main.number_of_channels.max(1) as u32)
            } else {
                None
            };
            let stream = tttr_stream(
                version,
                reader,
                i64::from(tttr.number_of_records),
                reverse,
                options.markers,
            );
            (Measurement::Tttr(tttr), board_resolution(&boards), stream)
        }
        mode => {
            return Err(DecodeError::MeasurementModeUnsupported {
                vendor: "TimeHarp".to_string(),
                mode,
            })
        }
    };

    Ok(Body {
        header: Header::TimeHarp(TimeHarpHeader {
            main,
            boards,
            measurement,
        }),
        resolution,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photon::{Record, T3};
    use crate::picoquant::testing::Bytes;
    use crate::picoquant::{open as open_file, Marker};
    use assert_approx_eq::assert_approx_eq;

    fn settings(bytes: &mut Bytes, mode: i32, channels: i32, curves: i32, boards: i32) {
        bytes
            .i32(channels)
            .i32(curves)
            .i32(32)
            .i32(1)
            .i32(boards)
            .i32(0)
            .i32(mode)
            .i32s(0, 3)
            .i32(1000)
            .i32s(0, 3)
            .display_block();
    }

    fn v20_file(mode: i32, channels: i32, curves: i32) -> Bytes {
        let mut bytes = Bytes::new();
        bytes
            .identity("TimeHarp 200", "2.0")
            .chars("1.0", 6)
            .chars("16/10/26", 18)
            .chars("\r\n", 2)
            .chars("v2", 256);
        settings(&mut bytes, mode, channels, curves, 1);
        // One board at 0.25 ns
        bytes.i32s(0, 5).f32(0.25);
        bytes
    }

    fn v60_file(mode: i32, channels: i32) -> Bytes {
        let mut bytes = Bytes::new();
        bytes.identity("TimeHarp 200", "6.0").creator_strings();
        settings(&mut bytes, mode, channels, 0, 1);
        bytes
            .chars("TimeHarp 200", 16)
            .chars("6.0", 8)
            .i32s(0, 5)
            .f32(0.25);
        bytes
    }

    fn v20_record(timetag: u32, bin: u32, route: u32, valid: u32) -> u32 {
        (valid << 30) | (route << 28) | (bin << 16) | timetag
    }

    fn v60_record(timetag: u32, bin: u32, route: u32, valid: u32) -> u32 {
        (timetag << 16) | (bin << 4) | (route << 2) | (valid << 1)
    }

    fn decode(data: &[u8], options: DecodeOptions) -> (Vec<Record>, f64) {
        let decoded = open_file(data, options).unwrap();
        let resolution = decoded.resolution;
        (decoded.collect::<Result<_, _>>().unwrap(), resolution)
    }

    #[test]
    fn block_sizes() {
        assert_eq!(V20Main::SIZE, 494);
        assert_eq!(V60Main::SIZE, 518);
        assert_eq!(V60Board::SIZE, 48);
        assert_eq!(CurveHeader::SIZE, 100);
    }

    #[test]
    fn v20_tttr_becomes_t3() {
        let mut bytes = v20_file(MODE_TTTR, 4096, 0);
        bytes.i32(100).i32s(0, 6).i32(1_000_000).i32s(0, 3).i32(4);
        bytes
            .u32(v20_record(5, 100, 1, 1))
            .u32(v20_record(0, OVERFLOW_BIN, 0, 0))
            .u32(v20_record(9, 2, 0, 0))
            .u32(v20_record(3, 7, 3, 1));

        let (tx, rx) = crossbeam::channel::unbounded::<Marker>();
        let options = DecodeOptions::default().with_markers(Box::new(tx));
        let (records, resolution) = decode(&bytes.build(), options);
        assert_eq!(
            records,
            vec![
                T3::new(1, 5, 100).into(),
                T3::new(3, WRAP + 3, 7).into()
            ]
        );
        assert_approx_eq!(resolution, 0.25e-9);

        let marker = rx.try_recv().unwrap();
        assert_eq!(marker.channels, 2);
        assert_eq!(marker.time, WRAP + 9);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn v60_bins_reverse_only_when_asked() {
        let mut bytes = v60_file(MODE_TTTR, 4096);
        bytes.i32(100).i32(0).i32s(0, 5).i32(1_000_000).i32s(0, 3).i32(1).i32(2);
        bytes.i32(11).i32(12);
        bytes.u32(v60_record(8, 100, 2, 1));
        let data = bytes.build();

        let (raw, _) = decode(&data, DecodeOptions::default());
        assert_eq!(raw, vec![T3::new(2, 8, 100).into()]);

        let options = DecodeOptions::default().with_reverse_histogram_channels(true);
        let (reversed, _) = decode(&data, options);
        assert_eq!(reversed, vec![T3::new(2, 8, 3995).into()]);

        let decoded = open_file(&data[..], DecodeOptions::default()).unwrap();
        match decoded.header {
            Header::TimeHarp(ref header) => match header.measurement {
                Measurement::Tttr(ref tttr) => {
                    assert_eq!(tttr.spec_header, vec![11, 12]);
                    assert_eq!(tttr.ext_devices, Some(0));
                }
                _ => panic!("Expected a TTTR sub-header"),
            },
            _ => panic!("Expected a TimeHarp header"),
        }
    }

    #[test]
    fn v60_short_special_header() {
        let mut bytes = v60_file(MODE_TTTR, 4096);
        bytes.i32(100).i32(0).i32s(0, 5).i32(1_000_000).i32s(0, 3).i32(0).i32(3);
        bytes.i32(11);
        let data = bytes.build();
        match open_file(&data[..], DecodeOptions::default()) {
            Err(DecodeError::Read { phase, .. }) => {
                assert_eq!(phase, Phase::Tail("special header"))
            }
            other => panic!("Expected a read error, got {:?}", other),
        };
    }

    #[test]
    fn v20_interactive_curves() {
        let mut bytes = v20_file(MODE_INTERACTIVE, 3, 2);
        for index in 0..2 {
            bytes
                .i32(index)
                .i32s(0, 9)
                .f32(0.0)
                .f32(0.0)
                .f32(0.0)
                .i32s(0, 9)
                .f32(0.5)
                .i32s(0, 2);
        }
        for count in 1..=6u32 {
            bytes.u32(count);
        }
        let (records, resolution) = decode(&bytes.build(), DecodeOptions::default());
        assert_eq!(records.len(), 6);
        match records[5] {
            Record::Bin(bin) => {
                assert_eq!(bin.curve, 1);
                assert_eq!(bin.counts, 6);
                assert_approx_eq!(bin.left, 1.0);
                assert_approx_eq!(bin.right, 1.5);
            }
            ref other => panic!("Expected a bin, got {:?}", other),
        }
        assert_approx_eq!(resolution, 0.5e-9);
    }
}
