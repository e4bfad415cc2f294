#[macro_use]
extern crate lazy_static;
extern crate tracing;

pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
#[cfg(feature = "gst")]
pub mod pipeline;
pub mod stage;
pub mod stats;

pub use config::PerfConfig;
pub use error::{PerfError, Result};
pub use stage::{Payload, PerfStage};
pub use stats::report::{JsonLinesSink, PerfReport, ReportSink};
