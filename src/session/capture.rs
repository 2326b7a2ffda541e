//! Microphone capture pipeline
//!
//! Owns at most one input stream. Every acquisition gets a fresh
//! generation number so frames and readiness reports that were already
//! queued when the stream closed are recognised and dropped.
//!
//! Opening is two-phase: [`CapturePipeline::start`] asks the device for the
//! microphone and returns at once, and the session becomes live when the
//! matching [`CaptureReady`] comes back through
//! [`CapturePipeline::on_ready`].

use crate::audio::{AudioInput, CaptureConfig, CapturedFrame, InputReady, InputStream};
use crate::error::AudioError;
use crate::transport::{RealtimeChunk, RealtimeSink};
use base64::Engine;
use log::{debug, info, trace};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// How long the microphone may take to start delivering audio
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

struct CaptureSession {
    generation: u64,
    stream: Box<dyn InputStream>,
    live: bool,
    frames_emitted: u64,
}

/// Readiness of an acquisition still being opened
pub struct PendingStart {
    generation: u64,
    ready: InputReady,
}

impl PendingStart {
    /// Wait for the device to report in. Runs off the reactor.
    pub async fn wait(self) -> CaptureReady {
        self.wait_for(OPEN_TIMEOUT).await
    }

    async fn wait_for(self, timeout: Duration) -> CaptureReady {
        let result = match tokio::time::timeout(timeout, self.ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AudioError::DeviceAccess(
                "Capture stopped before the microphone opened".to_string(),
            )),
            Err(_) => Err(AudioError::DeviceAccess(
                "Timed out waiting for the microphone".to_string(),
            )),
        };

        CaptureReady {
            generation: self.generation,
            result,
        }
    }
}

/// Outcome of opening the microphone for one generation
#[derive(Debug)]
pub struct CaptureReady {
    pub generation: u64,
    pub result: Result<(), AudioError>,
}

pub struct CapturePipeline {
    input: Box<dyn AudioInput>,
    config: CaptureConfig,
    frames: UnboundedSender<CapturedFrame>,
    generation: u64,
    active: Option<CaptureSession>,
}

impl CapturePipeline {
    pub fn new(
        input: Box<dyn AudioInput>,
        config: CaptureConfig,
        frames: UnboundedSender<CapturedFrame>,
    ) -> Self {
        Self {
            input,
            config,
            frames,
            generation: 0,
            active: None,
        }
    }

    /// A microphone is open or being opened
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The microphone is delivering frames
    pub fn is_listening(&self) -> bool {
        self.active.as_ref().is_some_and(|s| s.live)
    }

    /// Ask for the microphone
    ///
    /// Returns `Ok(None)` if capture is already running or opening. On error
    /// nothing is left open.
    pub fn start(&mut self) -> Result<Option<PendingStart>, AudioError> {
        if self.active.is_some() {
            debug!("Capture already running");
            return Ok(None);
        }

        self.generation += 1;
        let generation = self.generation;
        let opened = self
            .input
            .open(&self.config, generation, self.frames.clone())?;

        debug!("Waiting for microphone (generation {})", generation);

        self.active = Some(CaptureSession {
            generation,
            stream: opened.stream,
            live: false,
            frames_emitted: 0,
        });
        Ok(Some(PendingStart {
            generation,
            ready: opened.ready,
        }))
    }

    /// Second phase of [`start`](Self::start)
    ///
    /// Returns `None` for a report about a session that was already
    /// stopped or replaced. A failed open closes the session.
    pub fn on_ready(&mut self, ready: CaptureReady) -> Option<Result<(), AudioError>> {
        let session = match self.active.as_mut() {
            Some(session) if session.generation == ready.generation && !session.live => session,
            _ => {
                debug!("Ignoring stale readiness for generation {}", ready.generation);
                return None;
            }
        };

        match ready.result {
            Ok(()) => {
                session.live = true;
                info!(
                    "Capture started (generation {}, {} Hz, {} samples per frame)",
                    session.generation, self.config.format.sample_rate, self.config.frame_size
                );
                Some(Ok(()))
            }
            Err(e) => {
                if let Some(mut session) = self.active.take() {
                    session.stream.close();
                }
                Some(Err(e))
            }
        }
    }

    /// Close the microphone. Returns false if nothing was open.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(mut session) => {
                session.stream.close();
                info!(
                    "Capture stopped (generation {}, {} frames sent)",
                    session.generation, session.frames_emitted
                );
                true
            }
            None => false,
        }
    }

    /// Forward one frame to the transport
    ///
    /// Frames from a closed or superseded session are dropped.
    pub fn on_frame(&mut self, frame: CapturedFrame, sink: &dyn RealtimeSink) -> bool {
        let session = match self.active.as_mut() {
            Some(session) if session.live && session.generation == frame.generation => session,
            _ => {
                trace!("Dropping stale frame from generation {}", frame.generation);
                return false;
            }
        };

        sink.send_realtime(encode_frame(
            &frame.samples,
            self.config.format.sample_rate,
        ));
        session.frames_emitted += 1;
        true
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Float samples to base64 16-bit little-endian PCM
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> RealtimeChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // float-to-int casts saturate
        let value = (sample * 32768.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    RealtimeChunk {
        mime_type: format!("audio/pcm;rate={}", sample_rate),
        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        sample_rate_hz: sample_rate,
    }
}
