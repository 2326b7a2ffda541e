//! Audio output using PipeWire
//!
//! The output stream runs continuously and mixes every scheduled buffer
//! into it. Its clock is the number of frames handed to PipeWire, so
//! buffers can be placed back to back on a timeline ahead of real time.

use super::chunk::{AudioChunk, AudioFormat};
use super::device::{AudioOutput, HandleId, OutputBuffer, PlaybackEvent};
use crate::error::AudioError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

struct Voice {
    id: HandleId,
    chunk: Arc<AudioChunk>,
    start_frame: u64,
    position: usize,
}

/// Sums scheduled buffers onto a frame-counted timeline
pub struct Mixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    /// Seconds of audio rendered so far
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Queue `chunk` to start at `at` seconds
    pub fn schedule(&mut self, id: HandleId, chunk: Arc<AudioChunk>, at: f64) {
        let start_frame = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.push(Voice {
            id,
            chunk,
            start_frame,
            position: 0,
        });
    }

    /// Drop a voice without reporting it as finished
    pub fn cancel(&mut self, id: HandleId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Fill `out` with the next mono frames and advance the clock
    ///
    /// Returns the ids of voices that played to their end.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<HandleId> {
        out.fill(0.0);
        let window_start = self.frames_rendered;
        let window_end = window_start + out.len() as u64;
        let mut finished = Vec::new();

        for voice in &mut self.voices {
            if voice.start_frame >= window_end {
                continue;
            }

            let offset = voice.start_frame.saturating_sub(window_start) as usize;
            let channels = voice.chunk.format().channels.max(1) as usize;
            let samples = voice.chunk.samples();
            let remaining = voice.chunk.frames() - voice.position;
            let count = remaining.min(out.len() - offset);

            for i in 0..count {
                out[offset + i] += samples[(voice.position + i) * channels];
            }
            voice.position += count;

            if voice.position >= voice.chunk.frames() {
                finished.push(voice.id);
            }
        }

        self.voices.retain(|v| v.position < v.chunk.frames());
        self.frames_rendered = window_end;
        finished
    }
}

/// Mixer shared between the reactor and the PipeWire thread
pub type SharedMixer = Arc<Mutex<Mixer>>;

enum PlaybackCommand {
    Stop,
}

/// PipeWire speaker output
pub struct PipeWireOutput {
    format: AudioFormat,
    mixer: SharedMixer,
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PipeWireOutput {
    /// Connect the playback stream; finished buffers are reported on `events`
    pub fn open(
        format: AudioFormat,
        events: UnboundedSender<PlaybackEvent>,
    ) -> Result<Self, AudioError> {
        let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(format.sample_rate)));
        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let loop_mixer = mixer.clone();
        let handle = thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                let ready = ready_tx.clone();
                if let Err(e) = run_playback_loop(format, loop_mixer, events, receiver, ready_tx) {
                    warn!("Playback loop failed: {}", e);
                    let _ = ready.send(Err(e));
                }
                debug!("Playback loop exited");
            })
            .map_err(|e| AudioError::DeviceAccess(format!("Failed to spawn playback thread: {}", e)))?;

        let mut output = Self {
            format,
            mixer,
            sender: Some(sender),
            thread_handle: Some(handle),
        };

        let result = match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err("Timed out waiting for the playback stream".to_string()),
        };

        match result {
            Ok(()) => {
                info!(
                    "Playback stream ready: {} Hz, {} channel(s)",
                    format.sample_rate, format.channels
                );
                Ok(output)
            }
            Err(e) => {
                output.stop();
                Err(AudioError::DeviceAccess(e))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioOutput for PipeWireOutput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn create_buffer(&mut self, id: HandleId, chunk: Arc<AudioChunk>) -> Box<dyn OutputBuffer> {
        Box::new(MixerBuffer::new(id, chunk, self.mixer.clone()))
    }
}

impl Drop for PipeWireOutput {
    fn drop(&mut self) {
        debug!(
            "Closing playback with {} voice(s) pending",
            self.mixer.lock().active_voices()
        );
        self.stop();
    }
}

/// Buffer node backed by a mixer voice
pub struct MixerBuffer {
    id: HandleId,
    chunk: Option<Arc<AudioChunk>>,
    mixer: SharedMixer,
}

impl MixerBuffer {
    pub fn new(id: HandleId, chunk: Arc<AudioChunk>, mixer: SharedMixer) -> Self {
        Self {
            id,
            chunk: Some(chunk),
            mixer,
        }
    }
}

impl OutputBuffer for MixerBuffer {
    fn start(&mut self, at: f64) {
        if let Some(chunk) = self.chunk.take() {
            self.mixer.lock().schedule(self.id, chunk, at);
        }
    }

    fn stop(&mut self) {
        self.chunk = None;
        self.mixer.lock().cancel(self.id);
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    format: AudioFormat,
    mixer: SharedMixer,
    events: UnboundedSender<PlaybackEvent>,
    receiver: pw::channel::Receiver<PlaybackCommand>,
    ready: mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        mixer: SharedMixer,
        events: UnboundedSender<PlaybackEvent>,
        scratch: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        mixer,
        events,
        scratch: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Parley",
    };

    let stream = pw::stream::StreamBox::new(&core, "parley-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse playback format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_size = std::mem::size_of::<f32>();
            let stride = sample_size * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;
            user_data.scratch.resize(n_frames, 0.0);
            let finished = user_data.mixer.lock().render(&mut user_data.scratch);

            // Duplicate the mono mix into every output channel
            for (i, &sample) in user_data.scratch.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for ch in 0..n_channels {
                    let offset = i * stride + ch * sample_size;
                    slice[offset..offset + sample_size].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            for id in finished {
                let _ = user_data.events.send(PlaybackEvent::Ended(id));
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(format.sample_rate);
    audio_info.set_channels(format.channels as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params = [pod];

    // Output direction for playback
    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until the output is dropped
    mainloop.run();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: Vec<f32>) -> Arc<AudioChunk> {
        Arc::new(AudioChunk::new(
            samples,
            AudioFormat {
                sample_rate: 10,
                channels: 1,
            },
        ))
    }

    #[test]
    fn test_render_places_voice_at_start_frame() {
        let mut mixer = Mixer::new(10);
        mixer.schedule(1, chunk(vec![1.0, 1.0]), 0.3);

        let mut out = vec![0.0; 4];
        assert!(mixer.render(&mut out).is_empty());
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0]);

        assert_eq!(mixer.render(&mut out), vec![1]);
        assert_eq!(out, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.active_voices(), 0);
        assert!((mixer.current_time() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_back_to_back_voices_are_contiguous() {
        let mut mixer = Mixer::new(10);
        mixer.schedule(1, chunk(vec![0.5; 3]), 0.0);
        mixer.schedule(2, chunk(vec![0.25; 2]), 0.3);

        let mut out = vec![0.0; 6];
        let finished = mixer.render(&mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.25, 0.25, 0.0]);
        assert_eq!(finished, vec![1, 2]);
    }

    #[test]
    fn test_cancel_suppresses_end() {
        let mut mixer = Mixer::new(10);
        mixer.schedule(7, chunk(vec![1.0; 8]), 0.0);

        let mut out = vec![0.0; 2];
        mixer.render(&mut out);
        assert!(mixer.cancel(7));
        assert!(!mixer.cancel(7));

        let finished = mixer.render(&mut out);
        assert!(finished.is_empty());
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_mixer_buffer_start_and_stop() {
        let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(10)));
        let mut buffer = MixerBuffer::new(3, chunk(vec![1.0; 4]), mixer.clone());

        buffer.start(0.0);
        buffer.start(0.0);
        assert_eq!(mixer.lock().active_voices(), 1);

        buffer.stop();
        assert_eq!(mixer.lock().active_voices(), 0);
    }
}
