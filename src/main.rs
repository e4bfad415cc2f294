use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use gst::prelude::*;
use tracing::*;

use pipeline_perf::{cli, logger, pipeline, JsonLinesSink, ReportSink};

#[tokio::main]
async fn main() -> Result<()> {
    // CLI should be started before logger to allow control over verbosity
    cli::manager::init();
    // Logger should start before everything else to register any log information
    logger::manager::init()?;

    gst::init().context("Failed initializing GStreamer")?;

    let config = cli::manager::perf_config()?;

    let pipeline = gst::parse::launch(cli::manager::pipeline_description())
        .context("Failed parsing the pipeline description")?
        .downcast::<gst::Pipeline>()
        .map_err(|_| anyhow!("The description must produce a pipeline"))?;

    let json_sink = cli::manager::is_json()
        .then(|| Box::new(JsonLinesSink::new(std::io::stdout())) as Box<dyn ReportSink>);

    let probe = pipeline::attach(
        &pipeline,
        cli::manager::element_name(),
        cli::manager::pad_name(),
        config,
        json_sink,
    )?;
    probe.stage().start()?;

    pipeline
        .set_state(gst::State::Playing)
        .context("Failed setting the pipeline to Playing")?;
    info!("Measuring {:?}", probe.stage().name());

    let result = run(&pipeline).await;

    if let Err(error) = pipeline.set_state(gst::State::Null) {
        warn!("Failed setting the pipeline to Null: {error}");
    }
    probe.stage().stop();

    result
}

async fn run(pipeline: &gst::Pipeline) -> Result<()> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| anyhow!("The pipeline has no bus"))?;
    let mut messages = bus.stream();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                return Ok(());
            }
            message = messages.next() => {
                let Some(message) = message else {
                    return Ok(());
                };

                match message.view() {
                    gst::MessageView::Eos(_) => {
                        info!("End of stream");
                        return Ok(());
                    }
                    gst::MessageView::Error(error) => {
                        return Err(anyhow!(
                            "Error from {:?}: {} ({:?})",
                            error.src().map(|src| src.path_string()),
                            error.error(),
                            error.debug()
                        ));
                    }
                    gst::MessageView::Warning(warning) => {
                        warn!(
                            "Warning from {:?}: {} ({:?})",
                            warning.src().map(|src| src.path_string()),
                            warning.error(),
                            warning.debug()
                        );
                    }
                    _ => (),
                }
            }
        }
    }
}
