//! Runs the photoncorr stages from the command line.
//!
//! ```bash
//! photoncorr decode -i measurement.ht3 -b | photoncorr correlate -a -b | photoncorr histogram -a
//! photoncorr pipeline -i measurement.ht3 decode correlate histogram
//! ```

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

#[macro_use]
extern crate log;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use libphotoncorr::configuration::{AppConfig, AppConfigBuilder};
use libphotoncorr::histogram::Scale;
use libphotoncorr::logging::setup_logger;
use libphotoncorr::photon::RecordMode;
use libphotoncorr::pipeline::{Endpoint, Pipeline, StageSpec};
use libphotoncorr::{picoquant, stages};

#[derive(Parser)]
#[command(name = "photoncorr", version)]
#[command(about = "Decode PicoQuant photon counting files and correlate the photons", long_about = None)]
struct Cli {
    /// Configuration file. Defaults to config.toml in the platform config
    /// directory, if it exists
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Input and output of a single stage.
#[derive(Args, Clone, Debug)]
struct StreamArgs {
    /// Input file, standard input if absent
    #[arg(short = 'i', long)]
    file_in: Option<PathBuf>,

    /// Output file, standard output if absent
    #[arg(short = 'o', long)]
    file_out: Option<PathBuf>,

    /// Write binary records instead of text
    #[arg(short = 'b', long)]
    binary_out: bool,

    /// Log progress every this many records
    #[arg(short = 'p', long)]
    print_every: Option<u64>,

    /// Stop after this many records
    #[arg(short = 'n', long)]
    number: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an instrument file into T2, T3 or histogram records
    Decode {
        #[command(flatten)]
        stream: StreamArgs,

        /// Print the resolution of the file in seconds and exit
        #[arg(short = 'r', long)]
        resolution: bool,

        /// Flip TimeHarp histogram channels
        #[arg(long)]
        reverse_channels: bool,
    },

    /// Pair the photons of each excitation pulse
    Correlate {
        #[command(flatten)]
        stream: StreamArgs,

        /// Read binary records instead of text
        #[arg(short = 'a', long)]
        binary_in: bool,

        /// Record type of the input
        #[arg(short = 'm', long)]
        mode: Option<RecordMode>,

        /// Initial capacity of the photon queue
        #[arg(short = 'q', long)]
        queue_size: Option<usize>,

        /// Report the delay between the paired photons
        #[arg(long)]
        successive: bool,
    },

    /// Histogram photon times per channel
    Histogram {
        #[command(flatten)]
        stream: StreamArgs,

        /// Read binary records instead of text
        #[arg(short = 'a', long)]
        binary_in: bool,

        /// Record type of the input
        #[arg(short = 'm', long)]
        mode: Option<RecordMode>,

        /// Number of channels to histogram
        #[arg(long)]
        channels: Option<usize>,

        #[arg(long)]
        bins: Option<usize>,

        #[arg(long)]
        lower: Option<f64>,

        #[arg(long)]
        upper: Option<f64>,

        /// linear, log or log-zero
        #[arg(long)]
        scale: Option<Scale>,
    },

    /// Print the headers of an instrument file
    Header {
        /// Input file, standard input if absent
        #[arg(short = 'i', long)]
        file_in: Option<PathBuf>,

        /// Output file, standard output if absent
        #[arg(short = 'o', long)]
        file_out: Option<PathBuf>,
    },

    /// Run several stages as a chain of processes
    Pipeline {
        /// Input of the first stage, standard input if absent
        #[arg(short = 'i', long)]
        file_in: Option<PathBuf>,

        /// Output of the last stage, standard output if absent
        #[arg(short = 'o', long)]
        file_out: Option<PathBuf>,

        /// The last stage writes binary records
        #[arg(short = 'b', long)]
        binary_out: bool,

        /// Record type entering the first record stage, found from the
        /// input file when the chain starts with decode
        #[arg(short = 'm', long)]
        mode: Option<RecordMode>,

        /// The stages, in order
        #[arg(required = true)]
        stages: Vec<StageName>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StageName {
    Decode,
    Correlate,
    Histogram,
}

impl StageName {
    fn subcommand(self) -> &'static str {
        match self {
            StageName::Decode => "decode",
            StageName::Correlate => "correlate",
            StageName::Histogram => "histogram",
        }
    }
}

fn open_in(path: &Option<PathBuf>) -> Result<Box<dyn Read>> {
    Ok(match path {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Could not open {:?}", path))?,
        ),
        None => Box::new(io::stdin()),
    })
}

fn open_out(path: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Could not create {:?}", path))?,
        ),
        None => Box::new(io::stdout()),
    })
}

fn apply_stream(builder: &mut AppConfigBuilder, stream: &StreamArgs, config: &AppConfig) {
    builder
        .with_binary_out(stream.binary_out)
        .with_print_every(stream.print_every.unwrap_or(config.print_every))
        .with_number(stream.number.or(config.number));
}

fn finish(builder: &AppConfigBuilder) -> Result<AppConfig> {
    let config = builder.build();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Starts one process per stage and waits for all of them.
fn run_pipeline(
    cli: &Cli,
    config: &AppConfig,
    file_in: &Option<PathBuf>,
    file_out: &Option<PathBuf>,
    binary_out: bool,
    mode: Option<RecordMode>,
    names: &[StageName],
) -> Result<()> {
    let mut mode = match (mode, names.first(), file_in) {
        (Some(mode), _, _) => mode,
        (None, Some(StageName::Decode), Some(path)) => probe(path)?,
        _ => config.mode,
    };

    let program = std::env::current_exe().context("Could not locate the photoncorr binary")?;
    let mut pipeline = Pipeline::new(program);
    let last = names.len() - 1;
    for (i, &name) in names.iter().enumerate() {
        match name {
            StageName::Decode if i > 0 => bail!("decode can only be the first stage"),
            _ if mode == RecordMode::Bins && i > 0 => {
                bail!("Histogram records cannot be consumed by the {} stage", name.subcommand())
            }
            _ => {}
        }

        let mut spec = StageSpec::new(name.subcommand());
        if let Some(path) = &cli.config {
            spec.arg("--config").arg(path.display().to_string());
        }
        if cli.verbose {
            spec.arg("--verbose");
        }
        if i > 0 {
            spec.arg("--binary-in");
        }
        if i < last || binary_out {
            spec.arg("--binary-out");
        }
        if name != StageName::Decode {
            spec.arg("--mode").arg(mode.to_string());
        }
        mode = match name {
            StageName::Decode => mode,
            StageName::Correlate => RecordMode::T3,
            StageName::Histogram => RecordMode::Bins,
        };
        pipeline.stage(spec);
    }

    let input = file_in.clone().map_or(Endpoint::Inherit, Endpoint::Path);
    let output = file_out.clone().map_or(Endpoint::Inherit, Endpoint::Path);
    let report = pipeline.input(input).output(output).spawn()?.wait()?;
    if !report.success() {
        let failed: Vec<&str> = report.failed().collect();
        bail!("Pipeline stages failed: {}", failed.join(", "));
    }
    Ok(())
}

fn probe(path: &Path) -> Result<RecordMode> {
    picoquant::probe(path).with_context(|| format!("Could not read the headers of {:?}", path))
}

fn run(cli: &Cli, config: AppConfig) -> Result<()> {
    let mut builder = AppConfigBuilder::from_config(&config);
    match &cli.command {
        Commands::Decode {
            stream,
            resolution,
            reverse_channels,
        } => {
            apply_stream(&mut builder, stream, &config);
            if *reverse_channels {
                builder.with_reverse_histogram_channels(true);
            }
            let config = finish(&builder)?;
            let input = open_in(&stream.file_in)?;
            let output = open_out(&stream.file_out)?;
            if *resolution {
                stages::print_resolution(input, output, &config)?;
            } else {
                stages::run_decode(input, output, &config).context("Decoding failed")?;
            }
        }
        Commands::Correlate {
            stream,
            binary_in,
            mode,
            queue_size,
            successive,
        } => {
            apply_stream(&mut builder, stream, &config);
            builder
                .with_binary_in(*binary_in)
                .with_mode(mode.unwrap_or(config.mode))
                .with_queue_size(queue_size.unwrap_or(config.queue_size))
                .with_correlate_successive(*successive || config.correlate_successive);
            let config = finish(&builder)?;
            stages::run_correlate(open_in(&stream.file_in)?, open_out(&stream.file_out)?, &config)
                .context("Correlation failed")?;
        }
        Commands::Histogram {
            stream,
            binary_in,
            mode,
            channels,
            bins,
            lower,
            upper,
            scale,
        } => {
            apply_stream(&mut builder, stream, &config);
            builder
                .with_binary_in(*binary_in)
                .with_mode(mode.unwrap_or(config.mode))
                .with_channels(channels.unwrap_or(config.channels))
                .with_bins(bins.unwrap_or(config.histogram.bins))
                .with_limits(
                    lower.unwrap_or(config.histogram.lower),
                    upper.unwrap_or(config.histogram.upper),
                )
                .with_scale(scale.unwrap_or(config.histogram.scale));
            let config = finish(&builder)?;
            stages::run_histogram(open_in(&stream.file_in)?, open_out(&stream.file_out)?, &config)
                .context("Histogramming failed")?;
        }
        Commands::Header { file_in, file_out } => {
            stages::print_header(open_in(file_in)?, open_out(file_out)?, &config)?;
        }
        Commands::Pipeline {
            file_in,
            file_out,
            binary_out,
            mode,
            stages: names,
        } => run_pipeline(cli, &config, file_in, file_out, *binary_out, *mode, names)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("photoncorr: {:#}", anyhow::Error::from(e));
            process::exit(2);
        }
    };
    let config = AppConfigBuilder::from_config(&config)
        .with_verbose(config.verbose || cli.verbose)
        .build();
    if let Err(e) = setup_logger(&config) {
        eprintln!("photoncorr: could not set up logging: {}", e);
    }

    if let Err(e) = run(&cli, config) {
        error!("{:#}", e);
        process::exit(1);
    }
}
