//! Attaches a [`PerfStage`] to a running GStreamer pipeline.
//!
//! The stage observes the buffers flowing through one pad of an element by
//! means of a pad probe, and posts its reports on the pipeline bus through a
//! [`BusSink`].

pub mod bus_sink;
pub mod probe;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use gst::prelude::*;
use tracing::*;

pub use bus_sink::BusSink;
pub use probe::{install_probe, PerfProbe};

use crate::{config::PerfConfig, stage::PerfStage, stats::report::ReportSink};

/// Builds a stage named after `element_name` whose reports go to the bus
/// (and to `extra_sink`, when given), and probes its `pad_name` pad.
#[instrument(level = "debug", skip(pipeline, config, extra_sink))]
pub fn attach(
    pipeline: &gst::Pipeline,
    element_name: &str,
    pad_name: &str,
    config: PerfConfig,
    extra_sink: Option<Box<dyn ReportSink>>,
) -> Result<PerfProbe> {
    let element = pipeline
        .by_name(element_name)
        .ok_or_else(|| anyhow!("No element named {element_name:?} in the pipeline"))?;

    let pad = element
        .static_pad(pad_name)
        .ok_or_else(|| anyhow!("Element {element_name:?} has no static pad {pad_name:?}"))?;

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(BusSink::new(&element))];
    sinks.extend(extra_sink);

    let stage = Arc::new(
        PerfStage::try_new(element.name().as_str(), config, sinks)
            .context("Failed creating the perf stage")?,
    );

    let probe = install_probe(&pad, &stage)
        .ok_or_else(|| anyhow!("Failed adding a probe to pad {pad_name:?}"))?;

    debug!("Probing {element_name}:{pad_name}");
    Ok(probe)
}
