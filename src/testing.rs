//! In-memory devices and sinks for tests

use crate::audio::{
    AudioChunk, AudioFormat, AudioInput, AudioOutput, CaptureConfig, CapturedFrame, HandleId,
    InputStream, OpenedInput, OutputBuffer,
};
use crate::error::AudioError;
use crate::transport::{RealtimeChunk, RealtimeSink};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Output clock the test moves by hand
#[derive(Clone, Default)]
pub struct FakeClock(Rc<Cell<f64>>);

impl FakeClock {
    pub fn set(&self, t: f64) {
        self.0.set(t);
    }

    pub fn get(&self) -> f64 {
        self.0.get()
    }
}

/// What the scheduler did to the output device
#[derive(Clone, Debug, PartialEq)]
pub enum BufferCall {
    Start { id: HandleId, at: f64, duration: f64 },
    Stop { id: HandleId },
}

pub type CallLog = Rc<RefCell<Vec<BufferCall>>>;

pub struct FakeOutput {
    clock: FakeClock,
    calls: CallLog,
}

impl FakeOutput {
    pub fn new(clock: FakeClock) -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                clock,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl AudioOutput for FakeOutput {
    fn format(&self) -> AudioFormat {
        AudioFormat::PLAYBACK
    }

    fn current_time(&self) -> f64 {
        self.clock.get()
    }

    fn create_buffer(&mut self, id: HandleId, chunk: Arc<AudioChunk>) -> Box<dyn OutputBuffer> {
        Box::new(FakeBuffer {
            id,
            duration: chunk.duration(),
            calls: self.calls.clone(),
        })
    }
}

struct FakeBuffer {
    id: HandleId,
    duration: f64,
    calls: CallLog,
}

impl OutputBuffer for FakeBuffer {
    fn start(&mut self, at: f64) {
        self.calls.borrow_mut().push(BufferCall::Start {
            id: self.id,
            at,
            duration: self.duration,
        });
    }

    fn stop(&mut self) {
        self.calls.borrow_mut().push(BufferCall::Stop { id: self.id });
    }
}

type ReadySender = oneshot::Sender<Result<(), AudioError>>;

/// Microphone that connects at once, is denied, or waits to be released
#[derive(Default)]
pub struct FakeInput {
    /// Resolve readiness with this denial instead of `Ok`
    pub fail_with: Rc<RefCell<Option<String>>>,
    /// Keep readiness unresolved; the test fires the senders in `held`
    pub hold: Rc<Cell<bool>>,
    pub held: Rc<RefCell<Vec<ReadySender>>>,
    pub opened: Rc<Cell<u32>>,
    pub closed: Rc<Cell<u32>>,
}

impl AudioInput for FakeInput {
    fn open(
        &mut self,
        _config: &CaptureConfig,
        _generation: u64,
        _frames: UnboundedSender<CapturedFrame>,
    ) -> Result<OpenedInput, AudioError> {
        self.opened.set(self.opened.get() + 1);

        let (tx, ready) = oneshot::channel();
        if self.hold.get() {
            self.held.borrow_mut().push(tx);
        } else {
            let result = match self.fail_with.borrow().clone() {
                Some(reason) => Err(AudioError::DeviceAccess(reason)),
                None => Ok(()),
            };
            let _ = tx.send(result);
        }

        Ok(OpenedInput {
            stream: Box::new(FakeStream {
                closed: self.closed.clone(),
                is_closed: false,
            }),
            ready,
        })
    }
}

struct FakeStream {
    closed: Rc<Cell<u32>>,
    is_closed: bool,
}

impl InputStream for FakeStream {
    fn close(&mut self) {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.set(self.closed.get() + 1);
        }
    }
}

/// Records every chunk handed to the transport
#[derive(Clone, Default)]
pub struct FakeSink {
    pub sent: Rc<RefCell<Vec<RealtimeChunk>>>,
}

impl RealtimeSink for FakeSink {
    fn send_realtime(&self, chunk: RealtimeChunk) {
        self.sent.borrow_mut().push(chunk);
    }
}

/// Silent chunk of `seconds` at the playback rate
pub fn silence(seconds: f64) -> AudioChunk {
    let frames = (seconds * AudioFormat::PLAYBACK.sample_rate as f64).round() as usize;
    AudioChunk::new(vec![0.0; frames], AudioFormat::PLAYBACK)
}
