use gst::{glib, prelude::*};
use tracing::*;

use crate::stats::report::{PerfReport, ReportSink};

pub const PERF_STATS_STRUCTURE: &str = "perf-stats";
pub const PERF_INFO_MESSAGE: &str = "Performance Information";

/// Posts reports on the bus of the pipeline owning `element`.
#[derive(Debug)]
pub struct BusSink {
    element: glib::WeakRef<gst::Element>,
}

impl BusSink {
    pub fn new(element: &gst::Element) -> Self {
        Self {
            element: element.downgrade(),
        }
    }

    fn post(&self, message: impl FnOnce(&gst::Element) -> gst::Message) {
        let Some(element) = self.element.upgrade() else {
            return;
        };

        if let Err(error) = element.post_message(message(&element)) {
            warn!("Failed posting perf message from {:?}: {error}", element.name());
        }
    }
}

/// The element message structure, with `cpu-load` as -1 when unknown.
pub fn stats_structure(report: &PerfReport) -> gst::Structure {
    gst::Structure::builder(PERF_STATS_STRUCTURE)
        .field("timestamp", gst::ClockTime::from_nseconds(report.timestamp.as_nanos() as u64))
        .field("fps", report.fps)
        .field("mean-fps", report.fps_average)
        .field("bps", report.bitrate_instant)
        .field("mean-bps", report.bitrate_average)
        .field("cpu-load", report.cpu_load.map_or(-1, |load| load as i32))
        .field("encoder-utilization", report.gpu.encoder_utilization)
        .field("session-count", report.gpu.session_count)
        .field("average-fps", report.gpu.average_fps)
        .field("average-latency", report.gpu.average_latency)
        .field("gpu-utilization", report.gpu.gpu_utilization)
        .field("memory-used", report.gpu.memory_used)
        .field("memory-free", report.gpu.memory_free)
        .build()
}

impl ReportSink for BusSink {
    fn on_message(&self, _report: &PerfReport, text: &str) {
        self.post(|element| {
            gst::message::Info::builder(gst::CoreError::Tag, PERF_INFO_MESSAGE)
                .debug(text)
                .src(element)
                .build()
        });
    }

    fn on_stats(&self, report: &PerfReport) {
        self.post(|element| {
            gst::message::Element::builder(stats_structure(report))
                .src(element)
                .build()
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stats::gpu::GpuStats;

    fn report(cpu_load: Option<u32>) -> PerfReport {
        PerfReport {
            stage: "perf0".to_string(),
            timestamp: Duration::from_secs(2),
            fps: 30.0,
            fps_average: 29.5,
            bitrate_instant: 8000.0,
            bitrate_average: 7000.0,
            cpu_load,
            gpu: GpuStats {
                average_latency: 1450,
                memory_free: 7680,
                ..Default::default()
            },
        }
    }

    #[test]
    fn stats_structure_fields() {
        gst::init().unwrap();

        let structure = stats_structure(&report(Some(42)));
        assert!(structure.has_name(PERF_STATS_STRUCTURE));
        assert_eq!(structure.n_fields(), 13);
        assert_eq!(structure.get::<f64>("fps").unwrap(), 30.0);
        assert_eq!(structure.get::<f64>("mean-bps").unwrap(), 7000.0);
        assert_eq!(structure.get::<i32>("cpu-load").unwrap(), 42);
        assert_eq!(structure.get::<u64>("average-latency").unwrap(), 1450);
        assert_eq!(structure.get::<u32>("memory-free").unwrap(), 7680);

        let unknown = stats_structure(&report(None));
        assert_eq!(unknown.get::<i32>("cpu-load").unwrap(), -1);
    }

    #[test]
    fn messages_reach_the_bus() {
        gst::init().unwrap();

        let pipeline = gst::Pipeline::new();
        let element = gst::ElementFactory::make("identity")
            .name("perf0")
            .build()
            .unwrap();
        pipeline.add(&element).unwrap();
        let bus = pipeline.bus().unwrap();

        let sink = BusSink::new(&element);
        let report = report(None);
        sink.on_message(&report, "perf: perf0");
        sink.on_stats(&report);

        let info = bus
            .timed_pop_filtered(gst::ClockTime::from_seconds(1), &[gst::MessageType::Info])
            .unwrap();
        let gst::MessageView::Info(info) = info.view() else {
            panic!("Expected an info message");
        };
        assert_eq!(info.debug().unwrap().as_str(), "perf: perf0");

        let stats = bus
            .timed_pop_filtered(gst::ClockTime::from_seconds(1), &[gst::MessageType::Element])
            .unwrap();
        assert!(stats.structure().unwrap().has_name(PERF_STATS_STRUCTURE));
    }
}
