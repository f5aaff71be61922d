//! PicoHarp 300, file format version 2.0.

use std::io::Read;

use serde::Serialize;

use crate::photon::RecordMode;
use crate::picoquant::block::{
    self, chars, float32, int32, int64, Block, Creator, DisplaySettings, Input, PResult,
};
use crate::picoquant::tttr::{bits, RawEvent, RecordLayout, TttrStream};
use crate::picoquant::{
    read_counts, Body, Curve, DecodeOptions, Header, InteractiveStream, Measurement, RecordStream,
};
use crate::{DecodeError, Phase};

const MODE_INTERACTIVE: i32 = 0;
const MODE_T2: i32 = 2;
const MODE_T3: i32 = 3;

/// Rollover of the 28 bit T2 time tag
const T2_WRAP: i64 = 210_698_240;
/// Rollover of the 16 bit T3 sync counter
const T3_WRAP: i64 = 65_536;
/// T2 time tags count in units of 4 ps
const T2_TICK_PS: i64 = 4;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MainHeader {
    pub creator: Creator,
    pub number_of_curves: i32,
    pub bits_per_record: i32,
    pub routing_channels: i32,
    pub number_of_boards: i32,
    pub active_curve: i32,
    pub measurement_mode: i32,
    pub sub_mode: i32,
    pub range_no: i32,
    pub offset: i32,
    pub acquisition_time: i32,
    pub stop_at: i32,
    pub stop_on_overflow: i32,
    pub restart: i32,
    pub display: DisplaySettings,
}

impl Block for MainHeader {
    const SIZE: usize = Creator::SIZE + 13 * 4 + DisplaySettings::SIZE;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(MainHeader {
            creator: Creator::parse(input)?,
            number_of_curves: int32(input)?,
            bits_per_record: int32(input)?,
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
}

/// Settings of one input of the router.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RouterChannel {
    pub input_type: i32,
    pub input_level: i32,
    pub input_edge: i32,
    pub cfd_present: i32,
    pub cfd_level: i32,
    pub cfd_zero_cross: i32,
}

impl Block for RouterChannel {
    const SIZE: usize = 24;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(RouterChannel {
            input_type: int32(input)?,
            input_level: int32(input)?,
            input_edge: int32(input)?,
            cfd_present: int32(input)?,
            cfd_level: int32(input)?,
            cfd_zero_cross: int32(input)?,
        })
    }
}

/// A board, followed on disk by its router channels.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Board {
    pub hardware_ident: String,
    pub hardware_version: String,
    pub hardware_serial: i32,
    pub sync_divider: i32,
    pub cfd_zero_cross0: i32,
    pub cfd_level0: i32,
    pub cfd_zero_cross1: i32,
    pub cfd_level1: i32,
    /// Nanoseconds
    pub resolution: f32,
    pub router_model_code: i32,
    pub router_enabled: i32,
    pub router_channels: Vec<RouterChannel>,
}

impl Block for Board {
    const SIZE: usize = 60;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(Board {
            hardware_ident: chars(input, 16)?,
            hardware_version: chars(input, 8)?,
            hardware_serial: int32(input)?,
            sync_divider: int32(input)?,
            cfd_zero_cross0: int32(input)?,
            cfd_level0: int32(input)?,
            cfd_zero_cross1: int32(input)?,
            cfd_level1: int32(input)?,
            resolution: float32(input)?,
            router_model_code: int32(input)?,
            router_enabled: int32(input)?,
            router_channels: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TttrHeader {
    pub ext_devices: i32,
    pub reserved: [i32; 2],
    pub input_rate0: i32,
    pub input_rate1: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub number_of_records: i32,
    pub image_header_size: i32,
    pub image_header: Vec<u32>,
}

impl Block for TttrHeader {
    const SIZE: usize = 36;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(TttrHeader {
            ext_devices: int32(input)?,
            reserved: [int32(input)?, int32(input)?],
            input_rate0: int32(input)?,
            input_rate1: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            number_of_records: int32(input)?,
            image_header_size: int32(input)?,
            image_header: Vec::new(),
        })
    }
}

/// Header of one interactive-mode curve.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurveHeader {
    pub curve_index: i32,
    pub time_of_recording: i32,
    pub hardware_ident: String,
    pub hardware_version: String,
    pub hardware_serial: i32,
    pub sync_divider: i32,
    pub cfd_zero_cross0: i32,
    pub cfd_level0: i32,
    pub cfd_zero_cross1: i32,
    pub cfd_level1: i32,
    pub offset: i32,
    pub routing_channel: i32,
    pub ext_devices: i32,
    pub meas_mode: i32,
    pub sub_mode: i32,
    pub p1: f32,
    pub p2: f32,
    pub p3: f32,
    pub range_no: i32,
    /// Nanoseconds per bin
    pub resolution: f32,
    pub channels: i32,
    pub acquisition_time: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub input_rate0: i32,
    pub input_rate1: i32,
    pub hist_count_rate: i32,
    pub integral_count: i64,
    pub reserved: i32,
    pub data_offset: i32,
    pub router_model_code: i32,
    pub router_enabled: i32,
    pub router_channel: RouterChannel,
}

impl Block for CurveHeader {
    const SIZE: usize = 172;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(CurveHeader {
            curve_index: int32(input)?,
            time_of_recording: int32(input)?,
            hardware_ident: chars(input, 16)?,
            hardware_version: chars(input, 8)?,
            hardware_serial: int32(input)?,
            sync_divider: int32(input)?,
            cfd_zero_cross0: int32(input)?,
            cfd_level0: int32(input)?,
            cfd_zero_cross1: int32(input)?,
            cfd_level1: int32(input)?,
            offset: int32(input)?,
            routing_channel: int32(input)?,
            ext_devices: int32(input)?,
            meas_mode: int32(input)?,
            sub_mode: int32(input)?,
            p1: float32(input)?,
            p2: float32(input)?,
            p3: float32(input)?,
            range_no: int32(input)?,
            resolution: float32(input)?,
            channels: int32(input)?,
            acquisition_time: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            input_rate0: int32(input)?,
            input_rate1: int32(input)?,
            hist_count_rate: int32(input)?,
            integral_count: int64(input)?,
            reserved: int32(input)?,
            data_offset: int32(input)?,
            router_model_code: int32(input)?,
            router_enabled: int32(input)?,
            router_channel: RouterChannel::parse(input)?,
        })
    }
}

/// Everything in a PicoHarp file in front of the data.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PicoHarpHeader {
    pub main: MainHeader,
    pub boards: Vec<Board>,
    pub measurement: Measurement<CurveHeader, TttrHeader>,
}

/// time 0-27, channel 28-31
struct T2Layout;

impl RecordLayout for T2Layout {
    const MODE: RecordMode = RecordMode::T2;
    const WRAP: i64 = T2_WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        let time = bits(raw, 0, 28);
        let channel = bits(raw, 28, 4);
        if channel != 0xF {
            return RawEvent::T2 { channel, time };
        }
        match time & 0xF {
            0 => RawEvent::Overflow { count: 1 },
            markers => RawEvent::Marker {
                channels: markers,
                field: time,
            },
        }
    }
}

/// nsync 0-15, dtime 16-27, channel 28-31
struct T3Layout;

impl RecordLayout for T3Layout {
    const MODE: RecordMode = RecordMode::T3;
    const WRAP: i64 = T3_WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        let nsync = bits(raw, 0, 16);
        let dtime = bits(raw, 16, 12);
        let channel = bits(raw, 28, 4);
        match channel {
            // Routed inputs are numbered from 1
            0 => return RawEvent::Invalid,
            0xF => {}
            _ => {
                return RawEvent::T3 {
                    channel: channel - 1,
                    nsync,
                    dtime,
                }
            }
        }
        if dtime == 0 {
            RawEvent::Overflow { count: 1 }
        } else {
            RawEvent::Marker {
                channels: dtime & 0xF,
                field: nsync,
            }
        }
    }
}

fn board_resolution(boards: &[Board]) -> f64 {
    match boards.first() {
        Some(board) => f64::from(board.resolution) * 1e-9,
        None => {
            warn!("File lists no boards, assuming the base resolution of 4 ps");
            T2_TICK_PS as f64 * 1e-12
        }
    }
}

pub(crate) fn open_v20<'r, R: Read + 'r>(
    mut reader: R,
    options: DecodeOptions,
) -> Result<Body<'r>, DecodeError> {
    let main: MainHeader = block::read_block(&mut reader, Phase::Header)?;
    debug!(
        "PicoHarp header: {} boards, {} curves, measurement mode {}",
        main.number_of_boards, main.number_of_curves, main.measurement_mode
    );

    let number_of_boards = block::element_count(main.number_of_boards, Phase::Tail("boards"))?;
    let mut boards = Vec::new();
    for _ in 0..number_of_boards {
        let mut board: Board = block::read_block(&mut reader, Phase::Tail("boards"))?;
        board.router_channels = block::read_blocks(
            &mut reader,
            i64::from(main.routing_channels),
            Phase::Tail("router channels"),
        )?;
        boards.push(board);
    }

    let (measurement, resolution, records): (_, _, Box<dyn RecordStream + 'r>) =
        match main.measurement_mode {
            MODE_INTERACTIVE => {
                let curves: Vec<CurveHeader> = block::read_blocks(
                    &mut reader,
                    i64::from(main.number_of_curves),
                    Phase::SubHeader,
                )?;
                let counts =
                    read_counts(&mut reader, curves.iter().map(|c| i64::from(c.channels)))?;
                let resolution = match curves.first() {
                    Some(curve) => f64::from(curve.resolution) * 1e-9,
                    None => board_resolution(&boards),
                };
                let stream = InteractiveStream::new(
                    curves
                        .iter()
                        .zip(counts)
                        .map(|(c, counts)| Curve {
                            index: c.curve_index.max(0) as u32,
                            resolution_ns: f64::from(c.resolution),
                            counts,
                        })
                        .collect(),
                );
                (Measurement::Interactive(curves), resolution, Box::new(stream))
            }
            mode @ (MODE_T2 | MODE_T3) => {
                let mut tttr: TttrHeader = block::read_block(&mut reader, Phase::SubHeader)?;
                tttr.image_header = block::read_blocks(
                    &mut reader,
                    i64::from(tttr.image_header_size),
                    Phase::Tail("image header"),
                )?;
                let declared = i64::from(tttr.number_of_records);
                let markers = options.markers;
                if mode == MODE_T2 {
                    let stream = TttrStream::new(reader, T2Layout, declared, markers)
                        .with_tick(T2_TICK_PS);
                    (
                        Measurement::Tttr(tttr),
                        T2_TICK_PS as f64 * 1e-12,
                        Box::new(stream),
                    )
                } else {
                    let stream = TttrStream::new(reader, T3Layout, declared, markers);
                    (
                        Measurement::Tttr(tttr),
                        board_resolution(&boards),
                        Box::new(stream),
                    )
                }
            }
            mode => {
                return Err(DecodeError::MeasurementModeUnsupported {
                    vendor: "PicoHarp".to_string(),
                    mode,
                })
            }
        };

    Ok(Body {
        header: Header::PicoHarp(PicoHarpHeader {
            main,
            boards,
            measurement,
        }),
        resolution,
        records,
    })
}
