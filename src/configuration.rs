//! All things related to user-facing configurations.

use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::histogram::{Edges, Scale};
use crate::photon::RecordMode;
use crate::ConfigError;

/// Name of the configuration file inside the platform config directory
pub const CONFIG_FILENAME: &str = "config.toml";

/// Options of the decode stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecodeConfig {
    /// Flip TimeHarp histogram channels so that larger numbers mean later
    /// arrivals. TimeHarp boards count backwards from the sync.
    pub reverse_histogram_channels: bool,
}

/// Bin edges of the histogram stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistogramConfig {
    pub bins: usize,
    pub lower: f64,
    pub upper: f64,
    pub scale: Scale,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        HistogramConfig {
            bins: 1000,
            lower: 0.0,
            upper: 1e6,
            scale: Scale::Linear,
        }
    }
}

impl HistogramConfig {
    pub fn edges(&self) -> Result<Edges, ConfigError> {
        Edges::new(self.scale, self.lower, self.upper, self.bins)
    }
}

/// Configuration shared by all stages.
///
/// It can be serialized so that it can be saved on disk as a configuration
/// file. Command line flags are applied on top of it through the
/// [`AppConfigBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Record type of the stage input
    pub mode: RecordMode,
    pub channels: usize,
    pub queue_size: usize,
    pub correlate_successive: bool,
    pub binary_in: bool,
    pub binary_out: bool,
    /// Log progress every this many records, 0 turns it off
    pub print_every: u64,
    /// Stop after this many records
    pub number: Option<u64>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    // Tables go last, TOML can't put plain values after them
    pub decode: DecodeConfig,
    pub histogram: HistogramConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfigBuilder::default().build()
    }
}

impl AppConfig {
    pub fn try_from_config_path(config_path: &Path) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(&read_to_string(config_path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads the given file, or the one in the platform config directory if
    /// it exists, or falls back to the defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            info!("Reading configuration from {:?}", path);
            return AppConfig::try_from_config_path(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                info!("Reading configuration from {:?}", path);
                AppConfig::try_from_config_path(&path)
            }
            _ => {
                debug!("No configuration file found, using defaults");
                Ok(AppConfig::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::EmptyQueue);
        }
        self.histogram.edges().map(|_| ())
    }

    /// Log level matching the `verbose` flag
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

/// `config.toml` inside the platform configuration directory, when the
/// platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "photoncorr", "photoncorr")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
}

#[derive(Clone)]
pub struct AppConfigBuilder {
    mode: RecordMode,
    channels: usize,
    queue_size: usize,
    correlate_successive: bool,
    binary_in: bool,
    binary_out: bool,
    print_every: u64,
    number: Option<u64>,
    verbose: bool,
    log_file: Option<PathBuf>,
    decode: DecodeConfig,
    histogram: HistogramConfig,
}

impl AppConfigBuilder {
    /// Generate an instance with default values. Useful mainly for quick
    /// testing.
    pub fn default() -> AppConfigBuilder {
        AppConfigBuilder {
            mode: RecordMode::T3,
            channels: 2,
            queue_size: 100_000,
            correlate_successive: false,
            binary_in: false,
            binary_out: false,
            print_every: 0,
            number: None,
            verbose: false,
            log_file: None,
            decode: DecodeConfig::default(),
            histogram: HistogramConfig::default(),
        }
    }

    /// Starts from an existing configuration, e.g. one read from disk.
    pub fn from_config(config: &AppConfig) -> AppConfigBuilder {
        AppConfigBuilder {
            mode: config.mode,
            channels: config.channels,
            queue_size: config.queue_size,
            correlate_successive: config.correlate_successive,
            binary_in: config.binary_in,
            binary_out: config.binary_out,
            print_every: config.print_every,
            number: config.number,
            verbose: config.verbose,
            log_file: config.log_file.clone(),
            decode: config.decode,
            histogram: config.histogram,
        }
    }

    pub fn build(&self) -> AppConfig {
        AppConfig {
            mode: self.mode,
            channels: self.channels,
            queue_size: self.queue_size,
            correlate_successive: self.correlate_successive,
            binary_in: self.binary_in,
            binary_out: self.binary_out,
            print_every: self.print_every,
            number: self.number,
            verbose: self.verbose,
            log_file: self.log_file.clone(),
            decode: self.decode,
            histogram: self.histogram,
        }
    }

    pub fn with_mode(&mut self, mode: RecordMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn with_channels(&mut self, channels: usize) -> &mut Self {
        self.channels = channels;
        self
    }

    pub fn with_queue_size(&mut self, queue_size: usize) -> &mut Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_correlate_successive(&mut self, successive: bool) -> &mut Self {
        self.correlate_successive = successive;
        self
    }

    pub fn with_binary_in(&mut self, binary_in: bool) -> &mut Self {
        self.binary_in = binary_in;
        self
    }

    pub fn with_binary_out(&mut self, binary_out: bool) -> &mut Self {
        self.binary_out = binary_out;
        self
    }

    pub fn with_print_every(&mut self, print_every: u64) -> &mut Self {
        self.print_every = print_every;
        self
    }

    pub fn with_number(&mut self, number: Option<u64>) -> &mut Self {
        self.number = number;
        self
    }

    pub fn with_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    pub fn with_log_file(&mut self, log_file: Option<PathBuf>) -> &mut Self {
        self.log_file = log_file;
        self
    }

    pub fn with_reverse_histogram_channels(&mut self, reverse: bool) -> &mut Self {
        self.decode.reverse_histogram_channels = reverse;
        self
    }

    pub fn with_histogram(&mut self, histogram: HistogramConfig) -> &mut Self {
        self.histogram = histogram;
        self
    }

    pub fn with_bins(&mut self, bins: usize) -> &mut Self {
        self.histogram.bins = bins;
        self
    }

    pub fn with_limits(&mut self, lower: f64, upper: f64) -> &mut Self {
        self.histogram.lower = lower;
        self.histogram.upper = upper;
        self
    }

    pub fn with_scale(&mut self, scale: Scale) -> &mut Self {
        self.histogram.scale = scale;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Helper method to test config-dependent things without actually caring
    /// about the different config values
    fn setup_default_config() -> AppConfigBuilder {
        AppConfigBuilder::default()
            .with_mode(RecordMode::T3)
            .with_channels(4)
            .with_queue_size(1024)
            .with_correlate_successive(false)
            .with_print_every(0)
            .with_bins(100)
            .with_limits(0.0, 1000.0)
            .with_scale(Scale::Linear)
            .clone()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
        assert!(setup_default_config().build().validate().is_ok());
    }

    #[test]
    fn zero_queue_is_rejected() {
        let cfg = setup_default_config().with_queue_size(0).build();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyQueue)));
    }

    #[test]
    fn bad_histogram_is_rejected() {
        let cfg = setup_default_config().with_bins(0).build();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoBins)));
        let cfg = setup_default_config().with_limits(5.0, 1.0).build();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidLimits { .. })));
        let cfg = setup_default_config().with_scale(Scale::Log).build();
        assert!(matches!(cfg.validate(), Err(ConfigError::NonPositiveLogLimit(_))));
    }

    #[test]
    fn builder_roundtrips_a_config() {
        let cfg = setup_default_config()
            .with_number(Some(10))
            .with_log_file(Some(PathBuf::from("run.log")))
            .with_reverse_histogram_channels(true)
            .build();
        assert_eq!(AppConfigBuilder::from_config(&cfg).build(), cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode = \"t2\"\nqueue_size = 8\n\n[histogram]\nscale = \"log-zero\"\nlower = 1.0").unwrap();
        let cfg = AppConfig::try_from_config_path(file.path()).unwrap();
        assert_eq!(cfg.mode, RecordMode::T2);
        assert_eq!(cfg.queue_size, 8);
        assert_eq!(cfg.channels, 2);
        assert_eq!(cfg.histogram.scale, Scale::LogZero);
        assert_eq!(cfg.histogram.bins, 1000);
        assert!(!cfg.decode.reverse_histogram_channels);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_size = \"many\"").unwrap();
        assert!(matches!(
            AppConfig::try_from_config_path(file.path()),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            AppConfig::try_from_config_path(Path::new("/no/such/photoncorr.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn explicit_path_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channels = 7").unwrap();
        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.channels, 7);
    }

    #[test]
    fn verbose_raises_log_level() {
        assert_eq!(AppConfig::default().log_level(), log::LevelFilter::Info);
        let cfg = setup_default_config().with_verbose(true).build();
        assert_eq!(cfg.log_level(), log::LevelFilter::Debug);
    }
}
