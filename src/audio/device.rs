//! Device boundary between the session core and the sound server
//!
//! Input devices push fixed-size frames into a channel; output devices
//! expose their own clock and report finished buffers on a channel. Both
//! directions are drained by the session reactor.

use super::chunk::{AudioChunk, AudioFormat};
use crate::error::AudioError;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Identifies one scheduled output buffer
pub type HandleId = u64;

/// Microphone capture configuration
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Sample rate and channel count delivered to the pipeline
    pub format: AudioFormat,
    /// Samples per emitted frame
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::CAPTURE,
            frame_size: 256,
        }
    }
}

/// One block of mono microphone samples
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    /// Capture session that produced the frame
    pub generation: u64,
    pub samples: Vec<f32>,
}

/// Notifications from an output device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A buffer played to its natural end
    Ended(HandleId),
}

/// Resolves once the device delivers audio, or with the reason it never will
pub type InputReady = oneshot::Receiver<Result<(), AudioError>>;

/// An acquisition that may still be connecting
pub struct OpenedInput {
    pub stream: Box<dyn InputStream>,
    pub ready: InputReady,
}

/// Source of microphone audio
pub trait AudioInput {
    /// Start acquiring the microphone without waiting for it. Frames tagged
    /// with `generation` follow once `ready` resolves with `Ok`, until the
    /// stream is closed.
    fn open(
        &mut self,
        config: &CaptureConfig,
        generation: u64,
        frames: UnboundedSender<CapturedFrame>,
    ) -> Result<OpenedInput, AudioError>;
}

/// An open microphone acquisition
pub trait InputStream {
    /// Tear down routing and release the device without blocking the
    /// caller. Idempotent.
    fn close(&mut self);
}

/// Sink with its own clock onto which buffers are scheduled
pub trait AudioOutput {
    fn format(&self) -> AudioFormat;

    /// Current position of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Create a buffer node for `chunk`. The device reports
    /// `PlaybackEvent::Ended(id)` when it finishes playing on its own.
    fn create_buffer(&mut self, id: HandleId, chunk: Arc<AudioChunk>) -> Box<dyn OutputBuffer>;
}

/// A buffer node created by an [`AudioOutput`]
pub trait OutputBuffer {
    /// Begin playback at `at` seconds on the output clock
    fn start(&mut self, at: f64);

    /// Silence immediately. No ended notification follows.
    fn stop(&mut self);
}
