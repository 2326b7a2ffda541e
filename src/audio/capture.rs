//! Microphone input using PipeWire
//!
//! Each acquisition runs its own PipeWire main loop on a background thread.
//! The realtime callback keeps the first channel, cuts it into fixed-size
//! frames and pushes them to the session reactor.

use super::device::{AudioInput, CaptureConfig, CapturedFrame, InputStream, OpenedInput};
use crate::error::AudioError;
use log::{debug, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Cuts a continuous sample stream into frames of exactly `frame_size`
pub struct FrameAccumulator {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append samples, calling `emit` once per completed frame
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            emit(std::mem::replace(&mut self.pending, rest));
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// PipeWire microphone
#[derive(Default)]
pub struct PipeWireInput;

impl PipeWireInput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioInput for PipeWireInput {
    fn open(
        &mut self,
        config: &CaptureConfig,
        generation: u64,
        frames: UnboundedSender<CapturedFrame>,
    ) -> Result<OpenedInput, AudioError> {
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready) = oneshot::channel();
        let ready_tx: ReadySender = Arc::new(Mutex::new(Some(ready_tx)));
        let config = config.clone();

        let handle = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                if let Err(e) =
                    run_capture_loop(config, generation, frames, receiver, ready_tx.clone())
                {
                    warn!("Capture loop failed: {}", e);
                    report_ready(&ready_tx, Err(e));
                }
                debug!("Capture loop for generation {} exited", generation);
            })
            .map_err(|e| AudioError::DeviceAccess(format!("Failed to spawn capture thread: {}", e)))?;

        debug!("Opening microphone (generation {})", generation);

        Ok(OpenedInput {
            stream: Box::new(PipeWireInputStream {
                sender: Some(sender),
                thread_handle: Some(handle),
            }),
            ready,
        })
    }
}

enum PipeWireCommand {
    Stop,
}

/// Fired once, by whichever of the stream state or a loop failure comes first
type ReadySender = Arc<Mutex<Option<oneshot::Sender<Result<(), AudioError>>>>>;

fn report_ready(ready: &ReadySender, result: Result<(), String>) {
    if let Some(tx) = ready.lock().take() {
        let _ = tx.send(result.map_err(AudioError::DeviceAccess));
    }
}

/// A running capture thread
pub struct PipeWireInputStream {
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl InputStream for PipeWireInputStream {
    fn close(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        // Inside the reactor the join moves to the blocking pool
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = handle.join();
                });
            }
            Err(_) => {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PipeWireInputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    config: CaptureConfig,
    generation: u64,
    frames: UnboundedSender<CapturedFrame>,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: ReadySender,
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
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        accumulator: FrameAccumulator,
        generation: u64,
        frames: UnboundedSender<CapturedFrame>,
        ready: ReadySender,
    }

    let user_data = UserData {
        format: Default::default(),
        accumulator: FrameAccumulator::new(config.frame_size),
        generation,
        frames,
        ready,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Parley",
        *pw::keys::NODE_LATENCY => format!("{}/{}", config.frame_size, config.format.sample_rate),
    };

    let stream = pw::stream::StreamBox::new(&core, "parley-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, old, new| {
            debug!("Capture stream state: {:?} -> {:?}", old, new);
            match new {
                // Only a linked source gets the stream streaming; with no
                // microphone it sits in Paused until the open times out.
                pw::stream::StreamState::Streaming => report_ready(&user_data.ready, Ok(())),
                pw::stream::StreamState::Error(msg) => {
                    warn!("Capture stream error: {}", msg);
                    report_ready(&user_data.ready, Err(msg));
                }
                _ => {}
            }
        })
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
                warn!("Failed to parse capture format: {:?}", e);
                return;
            }
            debug!(
                "Capture format negotiated: {} Hz, {} channels",
                user_data.format.rate(),
                user_data.format.channels()
            );
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
            let n_bytes = data.chunk().size() as usize;

            let Some(raw) = data.data() else {
                return;
            };
            let raw = &raw[..n_bytes.min(raw.len())];

            // Keep only the first channel of each interleaved frame
            let first_channel: Vec<f32> = raw
                .chunks_exact(sample_size * n_channels)
                .map(|frame| f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]))
                .collect();

            let generation = user_data.generation;
            let frames = &user_data.frames;
            user_data.accumulator.push(&first_channel, |samples| {
                let _ = frames.send(CapturedFrame {
                    generation,
                    samples,
                });
            });
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Request F32LE mono at the capture rate; PipeWire converts as needed
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.format.sample_rate);
    audio_info.set_channels(config.format.channels as u32);

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

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    // Run until stopped
    mainloop.run();

    Ok(())
}
