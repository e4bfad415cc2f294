use std::sync::Arc;

use gst::prelude::*;
use tracing::*;

use crate::stage::{Payload, PerfStage};

impl Payload for gst::BufferRef {
    fn payload_size(&self) -> usize {
        self.size()
    }
}

impl Payload for gst::Buffer {
    fn payload_size(&self) -> usize {
        self.size()
    }
}

/// A stage fed by a pad probe. Dropping it removes the probe and stops the
/// stage.
#[derive(Debug)]
pub struct PerfProbe {
    pad: gst::Pad,
    probe_id: Option<gst::PadProbeId>,
    stage: Arc<PerfStage>,
}

impl PerfProbe {
    pub fn stage(&self) -> &Arc<PerfStage> {
        &self.stage
    }
}

impl Drop for PerfProbe {
    fn drop(&mut self) {
        if let Some(probe_id) = self.probe_id.take() {
            self.pad.remove_probe(probe_id);
        }
        self.stage.stop();
    }
}

/// Feeds every buffer and buffer list crossing `pad` to `stage`. A buffer
/// list counts as one frame of its total size. Buffers are never altered or
/// dropped.
pub fn install_probe(pad: &gst::Pad, stage: &Arc<PerfStage>) -> Option<PerfProbe> {
    let weak_stage = Arc::downgrade(stage);

    let probe_id = pad.add_probe(
        gst::PadProbeType::BUFFER | gst::PadProbeType::BUFFER_LIST,
        move |_pad, info| {
            let Some(stage) = weak_stage.upgrade() else {
                return gst::PadProbeReturn::Remove;
            };

            match &info.data {
                Some(gst::PadProbeData::Buffer(buffer)) => {
                    stage.on_buffer(buffer.payload_size());
                }
                Some(gst::PadProbeData::BufferList(list)) => {
                    stage.on_buffer(list.calculate_size());
                }
                _ => (),
            }

            gst::PadProbeReturn::Ok
        },
    )?;

    trace!("Probe installed on pad {:?}", pad.name());

    Some(PerfProbe {
        pad: pad.clone(),
        probe_id: Some(probe_id),
        stage: stage.clone(),
    })
}
