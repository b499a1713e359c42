//! GStreamer capture backend.
//!
//! Local devices and network streams are both decoded by a GStreamer pipeline
//! that ends in an `appsink`; frames are pulled synchronously with a bounded
//! timeout and copied out as packed RGB.

use super::{CameraSource, CaptureDevice, CaptureError, CaptureHints, DeviceOpener, Frame};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Opens GStreamer pipelines for camera sources.
#[derive(Debug)]
pub struct GstOpener {
    _private: (),
}

impl GstOpener {
    /// Initialize GStreamer and create an opener.
    pub fn new() -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Init(e.to_string()))?;
        Ok(Self { _private: () })
    }
}

impl DeviceOpener for GstOpener {
    fn open(
        &self,
        source: &CameraSource,
        hints: &CaptureHints,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let description = pipeline_description(source, hints);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::PipelineCreation("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::PipelineCreation("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::PipelineCreation("Could not cast to AppSink".to_string()))?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let reason = bus_error(&pipeline).unwrap_or_else(|| e.to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason,
            });
        }

        // Wait for state change to complete
        let (result, _state, _pending) = pipeline.state(clock_time(hints.open_timeout));
        if result.is_err() {
            let reason = bus_error(&pipeline)
                .unwrap_or_else(|| "Timeout waiting for pipeline to start".to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::OpenFailed {
                device: source.to_string(),
                reason,
            });
        }

        info!(source = %source, "Capture pipeline playing");

        Ok(Box::new(GstDevice {
            pipeline,
            appsink,
            read_timeout: clock_time(hints.read_timeout),
            label: source.to_string(),
            released: false,
        }))
    }
}

/// A playing pipeline and its appsink.
pub struct GstDevice {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: gst::ClockTime,
    label: String,
    released: bool,
}

impl GstDevice {
    fn pull(&self) -> Result<gst::Sample, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }

        self.appsink
            .try_pull_sample(self.read_timeout)
            .ok_or_else(|| {
                let reason = bus_error(&self.pipeline).unwrap_or_else(|| {
                    if self.appsink.is_eos() {
                        "End of stream".to_string()
                    } else {
                        "Timed out waiting for a frame".to_string()
                    }
                });
                CaptureError::ReadFailed(reason)
            })
    }
}

impl CaptureDevice for GstDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let sample = self.pull()?;
        sample_to_frame(&sample)
    }

    fn grab(&mut self) -> Result<(), CaptureError> {
        self.pull().map(|_| ())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(source = %self.label, error = %e, "Failed to stop capture pipeline");
        } else {
            info!(source = %self.label, "Capture pipeline released");
        }
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the GStreamer pipeline string for a source.
pub fn pipeline_description(source: &CameraSource, hints: &CaptureHints) -> String {
    match source {
        CameraSource::Local(index) => format!(
            "{device} ! videoconvert ! videoscale ! videorate \
             ! video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 \
             ! appsink name=sink sync=false max-buffers=2 drop=true",
            device = local_device_element(*index),
            width = hints.width,
            height = hints.height,
            fps = hints.fps,
        ),
        CameraSource::Network(url) => format!(
            "uridecodebin uri=\"{uri}\" ! videoconvert ! videoscale ! videorate \
             ! video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 \
             ! appsink name=sink sync=false max-buffers=1 drop=true",
            uri = escape_property(url),
            width = hints.width,
            height = hints.height,
            fps = hints.fps,
        ),
    }
}

#[cfg(target_os = "linux")]
fn local_device_element(index: u32) -> String {
    format!("v4l2src device=/dev/video{}", index)
}

#[cfg(target_os = "macos")]
fn local_device_element(index: u32) -> String {
    format!("avfvideosrc device-index={}", index)
}

#[cfg(target_os = "windows")]
fn local_device_element(index: u32) -> String {
    format!("mfvideosrc device-index={}", index)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn local_device_element(_index: u32) -> String {
    "autovideosrc".to_string()
}

fn escape_property(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_mseconds(duration.as_millis() as u64)
}

/// First pending error on the pipeline bus, if any.
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

/// Copy an RGB sample into a tightly packed frame, honouring row stride.
fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, CaptureError> {
    let caps = sample
        .caps()
        .ok_or_else(|| CaptureError::FrameExtraction("Sample has no caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| CaptureError::FrameExtraction("Sample has no buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| CaptureError::FrameExtraction(e.to_string()))?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let data = pack_rows(map.as_slice(), width, height, stride)?;

    Frame::from_raw(width, height, data)
        .ok_or_else(|| CaptureError::FrameExtraction("Frame buffer size mismatch".to_string()))
}

fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>, CaptureError> {
    let row = width as usize * 3;
    if stride == row {
        let len = row * height as usize;
        return data
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| CaptureError::FrameExtraction("Truncated frame buffer".to_string()));
    }

    let mut packed = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = data
            .get(start..start + row)
            .ok_or_else(|| CaptureError::FrameExtraction("Truncated frame row".to_string()))?;
        packed.extend_from_slice(line);
    }
    Ok(packed)
}
