#![cfg(feature = "gst")]

use gst::prelude::*;
use serial_test::serial;

use pipeline_perf::{pipeline, PerfConfig};

#[test]
#[serial]
fn probe_posts_reports_and_forwards_every_buffer() {
    gst::init().unwrap();

    let pipeline = gst::parse::launch(
        "videotestsrc num-buffers=30 ! video/x-raw,width=64,height=48 ! identity name=perf ! fakesink name=sink signal-handoffs=true",
    )
    .unwrap()
    .downcast::<gst::Pipeline>()
    .unwrap();

    let sink = pipeline.by_name("sink").unwrap();
    let delivered = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    {
        let delivered = delivered.clone();
        sink.connect("handoff", false, move |_| {
            delivered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            None
        });
    }

    let probe = pipeline::attach(&pipeline, "perf", "src", PerfConfig::default(), None).unwrap();
    probe.stage().start().unwrap();
    pipeline.set_state(gst::State::Playing).unwrap();

    let bus = pipeline.bus().unwrap();
    let mut infos = 0;
    let mut stats = 0;
    for message in bus.iter_timed(gst::ClockTime::from_seconds(10)) {
        match message.view() {
            gst::MessageView::Eos(_) => break,
            gst::MessageView::Error(error) => panic!("{}", error.error()),
            gst::MessageView::Info(info) => {
                assert!(info.debug().unwrap().as_str().starts_with("perf: perf; timestamp: "));
                infos += 1;
            }
            gst::MessageView::Element(element) => {
                if element
                    .structure()
                    .is_some_and(|s| s.has_name(pipeline::bus_sink::PERF_STATS_STRUCTURE))
                {
                    stats += 1;
                }
            }
            _ => (),
        }
    }

    pipeline.set_state(gst::State::Null).unwrap();

    assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 30);
    assert!(infos >= 1);
    assert_eq!(infos, stats);
    drop(probe);
}
