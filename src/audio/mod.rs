//! Audio devices and sample processing
//!
//! This module provides:
//! - Microphone capture via PipeWire, cut into fixed-size frames
//! - A PipeWire mixing output with its own playback clock
//! - Decoding of inbound fragments to the output format

mod capture;
mod chunk;
mod decode;
mod device;
mod playback;

pub use capture::PipeWireInput;
pub use chunk::{AudioChunk, AudioFormat};
pub use decode::{decode_fragment, EncodedFragment};
pub use device::{
    AudioInput, AudioOutput, CaptureConfig, CapturedFrame, HandleId, InputReady, InputStream,
    OpenedInput, OutputBuffer, PlaybackEvent,
};
pub use playback::PipeWireOutput;
