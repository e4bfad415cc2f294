use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use crate::{config::PerfConfig, error::Result};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Measures frame rate, bitrate and system load of a running GStreamer pipeline",
    author = env!("CARGO_PKG_AUTHORS")
)]
pub struct Args {
    /// Pipeline description in gst-launch syntax
    #[arg(long, value_name = "DESCRIPTION", env = "PIPELINE_PERF_PIPELINE")]
    pub pipeline: String,

    /// Name of the element whose pad is measured
    #[arg(long, value_name = "NAME", default_value = "perf")]
    pub element: String,

    /// Static pad of the element that buffers are observed on
    #[arg(long, value_name = "PAD", default_value = "src")]
    pub pad: String,

    /// Append the system CPU load to every report
    #[arg(long)]
    pub print_cpu_load: bool,

    /// Query nvidia-smi for GPU encoder stats on every report
    #[arg(long)]
    pub gpu_stats: bool,

    /// Samples in the bitrate moving average, 0 averages all samples
    #[arg(long, value_name = "SAMPLES")]
    pub bitrate_window_size: Option<u32>,

    /// Milliseconds between bitrate calculations
    #[arg(long, value_name = "MILLISECONDS", value_parser = clap::value_parser!(u32).range(1..))]
    pub bitrate_interval: Option<u32>,

    /// JSON file with the perf configuration, flags override its values
    #[arg(long, value_name = "FILE", env = "PIPELINE_PERF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write every report as a JSON line to stdout
    #[arg(long)]
    pub json: bool,

    /// Turns all log categories up to Debug, for more information check RUST_LOG env variable
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory for hourly rotated log files, no file log when unset
    #[arg(long, value_name = "PATH", env = "PIPELINE_PERF_LOG_PATH")]
    pub log_path: Option<PathBuf>,
}

impl Args {
    /// The configuration file, if any, with command line flags applied on top.
    pub fn perf_config(&self) -> Result<PerfConfig> {
        let mut config = match &self.config {
            Some(path) => PerfConfig::load(path)?,
            None => PerfConfig::default(),
        };

        config.print_cpu_load |= self.print_cpu_load;
        config.gpu_stats_enabled |= self.gpu_stats;
        if let Some(window_size) = self.bitrate_window_size {
            config.bitrate_window_size = window_size;
        }
        if let Some(interval_ms) = self.bitrate_interval {
            config.bitrate_interval_ms = interval_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct Manager {
    clap_args: Args,
}

lazy_static! {
    static ref MANAGER: Arc<Manager> = Arc::new(Manager::new());
}

impl Manager {
    fn new() -> Self {
        Self {
            clap_args: Args::parse(),
        }
    }
}

// Construct our manager, should be done inside main
pub fn init() {
    MANAGER.as_ref();
}

pub fn args() -> &'static Args {
    &MANAGER.as_ref().clap_args
}

// Check if the verbosity parameter was used
pub fn is_verbose() -> bool {
    MANAGER.as_ref().clap_args.verbose
}

pub fn is_json() -> bool {
    MANAGER.as_ref().clap_args.json
}

pub fn log_path() -> Option<&'static PathBuf> {
    MANAGER.as_ref().clap_args.log_path.as_ref()
}

pub fn pipeline_description() -> &'static str {
    &MANAGER.as_ref().clap_args.pipeline
}

pub fn element_name() -> &'static str {
    &MANAGER.as_ref().clap_args.element
}

pub fn pad_name() -> &'static str {
    &MANAGER.as_ref().clap_args.pad
}

pub fn perf_config() -> Result<PerfConfig> {
    MANAGER.as_ref().clap_args.perf_config()
}

// Return the command line used to start this application
pub fn command_line_string() -> String {
    std::env::args().collect::<Vec<String>>().join(" ")
}

// Return a clone of current Args struct
pub fn command_line() -> String {
    format!("{:#?}", MANAGER.as_ref().clap_args)
}
