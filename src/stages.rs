//! The processing stages of the tool chain.
//!
//! Each stage reads one byte stream and writes another, so that the stages
//! can run as separate processes chained by pipes. A stage ends when its
//! input ends or when the consumer of its output goes away.

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};

use crate::configuration::AppConfig;
use crate::histogram::Histogram;
use crate::pairing::PulseWindowPairer;
use crate::photon::{CanonicalRecord, RecordMode, RecordReader, RecordWriter, T2, T3};
use crate::picoquant::{self, DecodeOptions, Decoded, LogMarkers};
use crate::StageError;

/// Record counts of a finished stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub records_in: u64,
    pub records_out: u64,
    /// The output was closed before the stage was done with it
    pub downstream_closed: bool,
}

/// Counts processed records and logs every `every`th one.
struct Progress {
    stage: &'static str,
    every: u64,
    limit: Option<u64>,
    count: u64,
}

impl Progress {
    fn new(stage: &'static str, config: &AppConfig) -> Self {
        Progress {
            stage,
            every: config.print_every,
            limit: config.number,
            count: 0,
        }
    }

    fn done(&self) -> bool {
        self.limit.map_or(false, |limit| self.count >= limit)
    }

    fn tick(&mut self) {
        self.count += 1;
        if self.every > 0 && self.count % self.every == 0 {
            info!("{}: {} records", self.stage, self.count);
        }
    }
}

/// Turns a failed write into `Ok(true)` when the reading end of our output
/// was closed, which is a normal way for a pipeline to end.
fn downstream_closed(result: io::Result<()>) -> Result<bool, StageError> {
    match result {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            info!("Output closed by the next stage, stopping");
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

fn expect_mode(
    stage: &'static str,
    expected: &'static str,
    accepted: &[RecordMode],
    found: RecordMode,
) -> Result<(), StageError> {
    if accepted.contains(&found) {
        Ok(())
    } else {
        Err(StageError::ModeMismatch {
            stage,
            expected,
            found,
        })
    }
}

fn decode_options(config: &AppConfig) -> DecodeOptions {
    DecodeOptions::default()
        .with_reverse_histogram_channels(config.decode.reverse_histogram_channels)
        .with_markers(Box::new(LogMarkers))
}

/// Opens an instrument file with the decode options of `config`.
pub fn open_input<'r, R: Read + 'r>(
    input: R,
    config: &AppConfig,
) -> Result<Decoded<'r>, StageError> {
    Ok(picoquant::open(BufReader::new(input), decode_options(config))?)
}

/// Decodes an instrument file into canonical records.
pub fn run_decode<R: Read, W: Write>(
    input: R,
    output: W,
    config: &AppConfig,
) -> Result<StageReport, StageError> {
    let mut decoded = open_input(input, config)?;
    info!(
        "Decoding {} records with a resolution of {:e} s",
        decoded.mode(),
        decoded.resolution
    );
    let mut writer = RecordWriter::new(BufWriter::new(output), config.binary_out);
    let mut progress = Progress::new("decode", config);
    let mut report = StageReport::default();

    while !progress.done() {
        let record = match decoded.next() {
            Some(record) => record?,
            None => break,
        };
        progress.tick();
        if downstream_closed(writer.write_record(&record))? {
            report.downstream_closed = true;
            break;
        }
    }
    if !report.downstream_closed {
        report.downstream_closed = downstream_closed(writer.flush())?;
    }

    let stats = decoded.stats();
    info!(
        "Decoded {} records: {} photons, {} overflows, {} markers",
        stats.records, stats.photons, stats.overflows, stats.markers
    );
    if stats.inconsistent_overflows > 0 {
        warn!(
            "{} overflow records claimed more than one rollover",
            stats.inconsistent_overflows
        );
    }
    report.records_in = progress.count;
    report.records_out = writer.written();
    Ok(report)
}

/// Pairs photons of the same excitation pulse. Reads and writes T3 records.
pub fn run_correlate<R: Read, W: Write>(
    input: R,
    output: W,
    config: &AppConfig,
) -> Result<StageReport, StageError> {
    expect_mode("correlate", "t3", &[RecordMode::T3], config.mode)?;
    let mut reader = RecordReader::new(BufReader::new(input), config.binary_in);
    let mut writer = RecordWriter::new(BufWriter::new(output), config.binary_out);
    let mut pairer = PulseWindowPairer::new(config.queue_size, config.correlate_successive)?;
    let mut progress = Progress::new("correlate", config);
    let mut report = StageReport::default();

    'stream: loop {
        let photon = if progress.done() {
            None
        } else {
            reader.next::<T3>()?
        };
        match photon {
            Some(photon) => {
                progress.tick();
                pairer.push(photon)?;
            }
            None => pairer.flush(),
        }
        while let Some(pair) = pairer.next()? {
            if downstream_closed(writer.write(&pair))? {
                report.downstream_closed = true;
                break 'stream;
            }
        }
        if photon.is_none() {
            break;
        }
    }
    if !report.downstream_closed {
        report.downstream_closed = downstream_closed(writer.flush())?;
    }

    report.records_in = progress.count;
    report.records_out = writer.written();
    info!(
        "Correlated {} photons into {} pairs",
        report.records_in, report.records_out
    );
    Ok(report)
}

fn fill_histogram<P, R>(
    reader: &mut RecordReader<R>,
    histogram: &mut Histogram,
    progress: &mut Progress,
    value: impl Fn(&P) -> (u32, f64),
) -> Result<(), StageError>
where
    P: CanonicalRecord,
    R: io::BufRead,
{
    while !progress.done() {
        match reader.next::<P>()? {
            Some(record) => {
                progress.tick();
                let (channel, time) = value(&record);
                histogram.add(channel, time);
            }
            None => break,
        }
    }
    Ok(())
}

/// Histograms the times of T2 or T3 records per channel. The bins are
/// written once the input ends.
pub fn run_histogram<R: Read, W: Write>(
    input: R,
    output: W,
    config: &AppConfig,
) -> Result<StageReport, StageError> {
    expect_mode(
        "histogram",
        "t2 or t3",
        &[RecordMode::T2, RecordMode::T3],
        config.mode,
    )?;
    let mut histogram = Histogram::new(config.histogram.edges()?, config.channels);
    let mut reader = RecordReader::new(BufReader::new(input), config.binary_in);
    let mut progress = Progress::new("histogram", config);

    match config.mode {
        RecordMode::T2 => fill_histogram(&mut reader, &mut histogram, &mut progress, |r: &T2| {
            (r.channel, r.time as f64)
        })?,
        _ => fill_histogram(&mut reader, &mut histogram, &mut progress, |r: &T3| {
            (r.channel, r.time as f64)
        })?,
    }
    if histogram.dropped() > 0 {
        info!(
            "{} records fell outside the histogram range or channels",
            histogram.dropped()
        );
    }

    let mut writer = RecordWriter::new(BufWriter::new(output), config.binary_out);
    let mut report = StageReport::default();
    for bin in histogram.bins() {
        if downstream_closed(writer.write(&bin))? {
            report.downstream_closed = true;
            break;
        }
    }
    if !report.downstream_closed {
        report.downstream_closed = downstream_closed(writer.flush())?;
    }
    report.records_in = progress.count;
    report.records_out = writer.written();
    Ok(report)
}

/// Writes the identity, resolution and the full header of an instrument
/// file in human readable form.
pub fn print_header<R: Read, W: Write>(
    input: R,
    mut output: W,
    config: &AppConfig,
) -> Result<(), StageError> {
    let decoded = open_input(input, config)?;
    writeln!(
        output,
        "{} {} ({:?})",
        decoded.identity.ident, decoded.identity.format_version, decoded.format
    )?;
    writeln!(output, "Mode: {}", decoded.mode())?;
    writeln!(output, "Resolution: {:e} s", decoded.resolution)?;
    writeln!(output, "{:#?}", decoded.header)?;
    output.flush()?;
    Ok(())
}

/// Writes only the resolution of an instrument file, in seconds.
pub fn print_resolution<R: Read, W: Write>(
    input: R,
    mut output: W,
    config: &AppConfig,
) -> Result<(), StageError> {
    let decoded = open_input(input, config)?;
    writeln!(output, "{:e}", decoded.resolution)?;
    output.flush()?;
    Ok(())
}
