//! Linear PCM buffers shared between decode, scheduling and output

/// Sample layout of an audio endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// 16kHz mono, what the remote service expects from the microphone
    pub const CAPTURE: AudioFormat = AudioFormat {
        sample_rate: 16000,
        channels: 1,
    };

    /// 24kHz mono, what the remote service speaks
    pub const PLAYBACK: AudioFormat = AudioFormat {
        sample_rate: 24000,
        channels: 1,
    };
}

/// Immutable buffer of interleaved f32 samples
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
    format: AudioFormat,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.format.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
