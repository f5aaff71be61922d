//! HydraHarp 400, file format version 1.0.

use std::io::Read;

use serde::Serialize;

use crate::photon::RecordMode;
use crate::picoquant::block::{
    self, chars, float32, float64, int32, int64, Block, Creator, DisplaySettings, Input, PResult,
};
use crate::picoquant::tttr::{bits, RawEvent, RecordLayout, TttrStream};
use crate::picoquant::{
    read_counts, Body, Curve, DecodeOptions, Header, InteractiveStream, Measurement, RecordStream,
};
use crate::{DecodeError, Phase};

const MODE_INTERACTIVE: i32 = 0;
const MODE_T2: i32 = 2;
const MODE_T3: i32 = 3;

/// Rollover of the 25 bit T2 time tag, in picoseconds
const T2_WRAP: i64 = 33_552_000;
/// Rollover of the 10 bit T3 sync counter
const T3_WRAP: i64 = 1024;
/// Special channel number of overflow records
const OVERFLOW_CHANNEL: u32 = 0x3F;
/// The header has room for this many modules whatever the number installed
const MAX_MODULES: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ModuleInfo {
    pub model: i32,
    pub version: i32,
}

impl Block for ModuleInfo {
    const SIZE: usize = 8;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(ModuleInfo {
            model: int32(input)?,
            version: int32(input)?,
        })
    }
}

fn modules(input: &mut Input<'_>) -> PResult<Vec<ModuleInfo>> {
    (0..MAX_MODULES).map(|_| ModuleInfo::parse(input)).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MainHeader {
    pub creator: Creator,
    pub number_of_curves: i32,
    pub bits_per_record: i32,
    pub active_curve: i32,
    pub measurement_mode: i32,
    pub sub_mode: i32,
    pub binning: i32,
    /// Picoseconds
    pub resolution: f64,
    pub offset: i32,
    pub acquisition_time: i32,
    pub stop_at: i32,
    pub stop_on_overflow: i32,
    pub restart: i32,
    pub display: DisplaySettings,
    pub hardware_ident: String,
    pub hardware_part_no: String,
    pub hardware_serial: i32,
    pub number_of_modules: i32,
    /// Only the installed modules are kept
    pub modules: Vec<ModuleInfo>,
    /// Picoseconds
    pub base_resolution: f64,
    pub inputs_enabled: i64,
    pub input_channels_present: i32,
    pub ref_clock_source: i32,
    pub ext_devices: i32,
    pub marker_settings: i32,
    pub sync_divider: i32,
    pub sync_cfd_level: i32,
    pub sync_cfd_zero_cross: i32,
    pub sync_offset: i32,
}

impl Block for MainHeader {
    const SIZE: usize = Creator::SIZE
        + 6 * 4
        + 8
        + 5 * 4
        + DisplaySettings::SIZE
        + 16
        + 8
        + 2 * 4
        + MAX_MODULES * ModuleInfo::SIZE
        + 8
        + 8
        + 8 * 4;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        let mut header = MainHeader {
            creator: Creator::parse(input)?,
            number_of_curves: int32(input)?,
            bits_per_record: int32(input)?,
            active_curve: int32(input)?,
            measurement_mode: int32(input)?,
            sub_mode: int32(input)?,
            binning: int32(input)?,
            resolution: float64(input)?,
            offset: int32(input)?,
            acquisition_time: int32(input)?,
            stop_at: int32(input)?,
            stop_on_overflow: int32(input)?,
            restart: int32(input)?,
            display: DisplaySettings::parse(input)?,
            hardware_ident: chars(input, 16)?,
            hardware_part_no: chars(input, 8)?,
            hardware_serial: int32(input)?,
            number_of_modules: int32(input)?,
            modules: modules(input)?,
            base_resolution: float64(input)?,
            inputs_enabled: int64(input)?,
            input_channels_present: int32(input)?,
            ref_clock_source: int32(input)?,
            ext_devices: int32(input)?,
            marker_settings: int32(input)?,
            sync_divider: int32(input)?,
            sync_cfd_level: int32(input)?,
            sync_cfd_zero_cross: int32(input)?,
            sync_offset: int32(input)?,
        };
        let installed = header.number_of_modules.clamp(0, MAX_MODULES as i32) as usize;
        header.modules.truncate(installed);
        Ok(header)
    }
}

/// Settings of one detector input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct InputChannel {
    pub module_index: i32,
    pub cfd_level: i32,
    pub cfd_zero_cross: i32,
    pub offset: i32,
}

impl Block for InputChannel {
    const SIZE: usize = 16;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(InputChannel {
            module_index: int32(input)?,
            cfd_level: int32(input)?,
            cfd_zero_cross: int32(input)?,
            offset: int32(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TttrHeader {
    pub sync_rate: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub image_header_size: i32,
    pub number_of_records: i64,
    pub image_header: Vec<u32>,
}

impl Block for TttrHeader {
    const SIZE: usize = 24;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(TttrHeader {
            sync_rate: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            image_header_size: int32(input)?,
            number_of_records: int64(input)?,
            image_header: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurveHeader {
    pub curve_index: i32,
    pub time_of_recording: i32,
    pub hardware_ident: String,
    pub hardware_version: String,
    pub hardware_serial: i32,
    pub number_of_modules: i32,
    pub modules: Vec<ModuleInfo>,
    pub base_resolution: f64,
    pub inputs_enabled: i64,
    pub input_channels_present: i32,
    pub ref_clock_source: i32,
    pub ext_devices: i32,
    pub marker_settings: i32,
    pub sync_divider: i32,
    pub sync_cfd_level: i32,
    pub sync_cfd_zero_cross: i32,
    pub sync_offset: i32,
    pub input_module_index: i32,
    pub input_cfd_level: i32,
    pub input_cfd_zero_cross: i32,
    pub input_offset: i32,
    pub input_channel: i32,
    pub meas_mode: i32,
    pub sub_mode: i32,
    pub binning: i32,
    /// Picoseconds per bin
    pub resolution: f64,
    pub offset: i32,
    pub acquisition_time: i32,
    pub stop_after: i32,
    pub stop_reason: i32,
    pub p1: f32,
    pub p2: f32,
    pub p3: f32,
    pub sync_rate: i32,
    pub input_rate: i32,
    pub hist_count_rate: i32,
    pub integral_count: i64,
    pub histogram_bins: i32,
    pub data_offset: i32,
}

impl Block for CurveHeader {
    const SIZE: usize = 264;

    fn parse(input: &mut Input<'_>) -> PResult<Self> {
        Ok(CurveHeader {
            curve_index: int32(input)?,
            time_of_recording: int32(input)?,
            hardware_ident: chars(input, 16)?,
            hardware_version: chars(input, 8)?,
            hardware_serial: int32(input)?,
            number_of_modules: int32(input)?,
            modules: modules(input)?,
            base_resolution: float64(input)?,
            inputs_enabled: int64(input)?,
            input_channels_present: int32(input)?,
            ref_clock_source: int32(input)?,
            ext_devices: int32(input)?,
            marker_settings: int32(input)?,
            sync_divider: int32(input)?,
            sync_cfd_level: int32(input)?,
            sync_cfd_zero_cross: int32(input)?,
            sync_offset: int32(input)?,
            input_module_index: int32(input)?,
            input_cfd_level: int32(input)?,
            input_cfd_zero_cross: int32(input)?,
            input_offset: int32(input)?,
            input_channel: int32(input)?,
            meas_mode: int32(input)?,
            sub_mode: int32(input)?,
            binning: int32(input)?,
            resolution: float64(input)?,
            offset: int32(input)?,
            acquisition_time: int32(input)?,
            stop_after: int32(input)?,
            stop_reason: int32(input)?,
            p1: float32(input)?,
            p2: float32(input)?,
            p3: float32(input)?,
            sync_rate: int32(input)?,
            input_rate: int32(input)?,
            hist_count_rate: int32(input)?,
            integral_count: int64(input)?,
            histogram_bins: int32(input)?,
            data_offset: int32(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HydraHarpHeader {
    pub main: MainHeader,
    pub input_channels: Vec<InputChannel>,
    pub input_rates: Vec<i32>,
    pub measurement: Measurement<CurveHeader, TttrHeader>,
}

/// time 0-24, channel 25-30, special 31
struct T2Layout;

impl RecordLayout for T2Layout {
    const MODE: RecordMode = RecordMode::T2;
    const WRAP: i64 = T2_WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        let time = bits(raw, 0, 25);
        let channel = bits(raw, 25, 6);
        if bits(raw, 31, 1) == 0 {
            // Channel 0 is reserved for the sync input
            return RawEvent::T2 {
                channel: channel + 1,
                time,
            };
        }
        match channel {
            OVERFLOW_CHANNEL => RawEvent::Overflow { count: time },
            0 => RawEvent::T2 { channel: 0, time },
            markers => RawEvent::Marker {
                channels: markers,
                field: time,
            },
        }
    }
}

/// nsync 0-9, dtime 10-24, channel 25-30, special 31
struct T3Layout;

impl RecordLayout for T3Layout {
    const MODE: RecordMode = RecordMode::T3;
    const WRAP: i64 = T3_WRAP;

    fn decode(&self, raw: u32) -> RawEvent {
        let nsync = bits(raw, 0, 10);
        let dtime = bits(raw, 10, 15);
        let channel = bits(raw, 25, 6);
        if bits(raw, 31, 1) == 0 {
            return RawEvent::T3 {
                channel,
                nsync,
                dtime,
            };
        }
        match channel {
            OVERFLOW_CHANNEL => RawEvent::Overflow { count: nsync },
            markers => RawEvent::Marker {
                channels: markers,
                field: nsync,
            },
        }
    }
}

pub(crate) fn open_v10<'r, R: Read + 'r>(
    mut reader: R,
    options: DecodeOptions,
) -> Result<Body<'r>, DecodeError> {
    let main: MainHeader = block::read_block(&mut reader, Phase::Header)?;
    debug!(
        "HydraHarp header: {} modules, {} inputs, measurement mode {}",
        main.number_of_modules, main.input_channels_present, main.measurement_mode
    );

    let inputs = i64::from(main.input_channels_present);
    let input_channels = block::read_blocks(&mut reader, inputs, Phase::Tail("input channels"))?;
    let input_rates = block::read_blocks(&mut reader, inputs, Phase::Tail("input rates"))?;

    let (measurement, resolution, records): (_, _, Box<dyn RecordStream + 'r>) =
        match main.measurement_mode {
            MODE_INTERACTIVE => {
                let curves: Vec<CurveHeader> = block::read_blocks(
                    &mut reader,
                    i64::from(main.number_of_curves),
                    Phase::SubHeader,
                )?;
                let counts = read_counts(
                    &mut reader,
                    curves.iter().map(|c| i64::from(c.histogram_bins)),
                )?;
                let resolution = curves
                    .first()
                    .map(|c| c.resolution)
                    .unwrap_or(main.resolution)
                    * 1e-12;
                let stream = InteractiveStream::new(
                    curves
                        .iter()
                        .zip(counts)
                        .map(|(c, counts)| Curve {
                            index: c.curve_index.max(0) as u32,
                            resolution_ns: c.resolution * 1e-3,
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
                let declared = tttr.number_of_records;
                if mode == MODE_T2 {
                    let stream = TttrStream::new(reader, T2Layout, declared, options.markers);
                    (Measurement::Tttr(tttr), 1e-12, Box::new(stream))
                } else {
                    let resolution =
                        main.base_resolution * 2f64.powi(main.binning) * 1e-12;
                    let stream = TttrStream::new(reader, T3Layout, declared, options.markers);
                    (Measurement::Tttr(tttr), resolution, Box::new(stream))
                }
            }
            mode => {
                return Err(DecodeError::MeasurementModeUnsupported {
                    vendor: "HydraHarp".to_string(),
                    mode,
                })
            }
        };

    Ok(Body {
        header: Header::HydraHarp(HydraHarpHeader {
            main,
            input_channels,
            input_rates,
            measurement,
        }),
        resolution,
        records,
    })
}
