//! Voice session reactor
//!
//! Everything that touches the capture pipeline, the playback timeline or
//! the error channel happens inside [`VoiceSession::run`], one event at a
//! time. Device threads, the WebSocket task and blocking decodes only talk
//! to it through channels.

mod capture;
mod scheduler;
mod state;

use capture::{CapturePipeline, CaptureReady};
use scheduler::{DecodedFragment, PlaybackScheduler};
use state::SessionController;

pub use state::{SessionSnapshot, SessionState};

use crate::audio::{
    AudioInput, AudioOutput, CaptureConfig, CapturedFrame, EncodedFragment, PlaybackEvent,
};
use crate::error::{AudioError, ErrorSource};
use crate::transport::{RealtimeSink, ServerMessage, TransportEvent};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

/// Requests from the user interface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCommand {
    ToggleCapture,
    StartCapture,
    StopCapture,
    DismissError,
    Shutdown,
}

/// Queues the session feeds itself through
pub struct SessionQueues {
    frames: mpsc::UnboundedReceiver<CapturedFrame>,
    decoded: mpsc::UnboundedReceiver<DecodedFragment>,
    capture_ready: mpsc::UnboundedReceiver<CaptureReady>,
}

/// Queues fed from outside the session
pub struct SessionInputs {
    pub commands: mpsc::UnboundedReceiver<UserCommand>,
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub playback: mpsc::UnboundedReceiver<PlaybackEvent>,
}

pub struct VoiceSession {
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    controller: SessionController,
    sink: Box<dyn RealtimeSink>,
    decoded_tx: mpsc::UnboundedSender<DecodedFragment>,
    capture_ready_tx: mpsc::UnboundedSender<CaptureReady>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl VoiceSession {
    pub fn new(
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
        sink: Box<dyn RealtimeSink>,
    ) -> (Self, SessionQueues, watch::Receiver<SessionSnapshot>) {
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (decoded_tx, decoded) = mpsc::unbounded_channel();
        let (capture_ready_tx, capture_ready) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let mut scheduler = PlaybackScheduler::new(output);
        scheduler.reset();

        let session = Self {
            capture: CapturePipeline::new(input, CaptureConfig::default(), frames_tx),
            scheduler,
            controller: SessionController::new(),
            sink,
            decoded_tx,
            capture_ready_tx,
            snapshot,
        };

        let queues = SessionQueues {
            frames,
            decoded,
            capture_ready,
        };
        (session, queues, snapshot_rx)
    }

    pub fn state(&self) -> SessionState {
        SessionState::derive(self.capture.is_listening(), self.scheduler.is_speaking())
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// React to one user command. Returns false on shutdown.
    pub fn handle_command(&mut self, command: UserCommand) -> bool {
        debug!("User command: {:?}", command);
        match command {
            UserCommand::ToggleCapture => {
                if self.capture.is_active() {
                    self.stop_capture();
                } else {
                    self.start_capture();
                }
            }
            UserCommand::StartCapture => self.start_capture(),
            UserCommand::StopCapture => self.stop_capture(),
            UserCommand::DismissError => self.controller.dismiss(),
            UserCommand::Shutdown => {
                self.capture.stop();
                self.scheduler.interrupt();
                self.controller.set_status("Shutting down...");
                return false;
            }
        }
        true
    }

    fn start_capture(&mut self) {
        if self.capture.is_active() {
            return;
        }

        match self.capture.start() {
            Ok(Some(pending)) => {
                self.controller.set_status("Requesting microphone access...");
                let ready_tx = self.capture_ready_tx.clone();
                tokio::spawn(async move {
                    let _ = ready_tx.send(pending.wait().await);
                });
            }
            Ok(None) => {}
            Err(e) => self.capture_failed(e),
        }
    }

    /// The microphone answered a start request
    pub fn on_capture_ready(&mut self, ready: CaptureReady) {
        match self.capture.on_ready(ready) {
            Some(Ok(())) => {
                self.controller.supersede(ErrorSource::Device);
                self.controller.set_status("");
            }
            Some(Err(e)) => self.capture_failed(e),
            None => debug!("Microphone answered after capture was stopped"),
        }
    }

    fn capture_failed(&mut self, e: AudioError) {
        error!("Failed to start capture: {}", e);
        self.controller.set_status(format!("Error: {}", e));
        self.controller.report(&e);
    }

    fn stop_capture(&mut self) {
        if self.capture.stop() {
            self.controller.set_status("");
        }
    }

    pub fn on_frame(&mut self, frame: CapturedFrame) {
        self.capture.on_frame(frame, self.sink.as_ref());
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                info!("Remote session opened");
                self.controller.supersede(ErrorSource::Transport);
                self.controller.set_status("Opened");
            }
            TransportEvent::Message(message) => self.on_server_message(&message),
            TransportEvent::Error(message) => {
                warn!("Transport error: {}", message);
                self.controller.report(&AudioError::Transport(message));
            }
            TransportEvent::Close(reason) => {
                info!("Remote session closed: {}", reason);
                self.controller.set_status(format!("Close: {}", reason));
            }
        }
    }

    fn on_server_message(&mut self, message: &ServerMessage) {
        // Any audio riding along with an interruption would be cut off
        // immediately, so it is never scheduled.
        if message.interrupted() {
            let stopped = self.scheduler.interrupt();
            info!("Interrupted by remote peer, {} buffer(s) cut off", stopped);
            return;
        }

        for fragment in message.audio_fragments() {
            self.spawn_decode(fragment.clone());
        }

        if message.turn_complete() {
            debug!("Remote turn complete");
        }
    }

    fn spawn_decode(&mut self, fragment: EncodedFragment) {
        let pending = self.scheduler.enqueue_fragment(fragment);
        let decoded_tx = self.decoded_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = decoded_tx.send(pending.decode());
        });
    }

    /// A background decode finished; play whatever is now next in line
    pub fn on_decoded(&mut self, decoded: DecodedFragment) {
        let seq = decoded.seq;
        let released = self.scheduler.complete_decode(decoded);
        if released.is_empty() {
            debug!(
                "Fragment {} held back, {} fragment(s) waiting",
                seq,
                self.scheduler.pending_decodes()
            );
        }

        for released in released {
            match released.outcome {
                Ok(Some(scheduled)) => debug!(
                    "Fragment {} scheduled as buffer {} at {:.3}s..{:.3}s",
                    released.seq, scheduled.id, scheduled.start_time, scheduled.end_time
                ),
                Ok(None) => debug!("Fragment {} was empty", released.seq),
                Err(e) => {
                    warn!("Dropping fragment {}: {}", released.seq, e);
                    self.controller.report(&AudioError::Decode(e));
                }
            }
        }
    }

    pub fn on_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Ended(id) => {
                self.scheduler.on_playback_ended(id);
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.controller.snapshot(self.state());
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Drive the session until shutdown or until every input closes
    pub async fn run(mut self, mut queues: SessionQueues, mut inputs: SessionInputs) {
        self.publish();

        loop {
            tokio::select! {
                command = inputs.commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => self.handle_command(UserCommand::Shutdown),
                    };
                    self.publish();
                    if !keep_running {
                        break;
                    }
                }
                Some(frame) = queues.frames.recv() => {
                    self.on_frame(frame);
                }
                Some(event) = inputs.transport.recv() => {
                    self.on_transport_event(event);
                    self.publish();
                }
                Some(decoded) = queues.decoded.recv() => {
                    self.on_decoded(decoded);
                    self.publish();
                }
                Some(ready) = queues.capture_ready.recv() => {
                    self.on_capture_ready(ready);
                    self.publish();
                }
                Some(event) = inputs.playback.recv() => {
                    self.on_playback_event(event);
                    self.publish();
                }
                else => break,
            }
        }

        info!("Voice session finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BufferCall, CallLog, FakeClock, FakeInput, FakeOutput, FakeSink};
    use base64::Engine;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct Harness {
        session: VoiceSession,
        queues: SessionQueues,
        snapshots: watch::Receiver<SessionSnapshot>,
        clock: FakeClock,
        calls: CallLog,
        sink: FakeSink,
        fail_with: Rc<RefCell<Option<String>>>,
        hold: Rc<Cell<bool>>,
        held: Rc<RefCell<Vec<tokio::sync::oneshot::Sender<Result<(), AudioError>>>>>,
    }

    fn harness() -> Harness {
        let clock = FakeClock::default();
        let (output, calls) = FakeOutput::new(clock.clone());
        let input = FakeInput::default();
        let fail_with = input.fail_with.clone();
        let hold = input.hold.clone();
        let held = input.held.clone();
        let sink = FakeSink::default();
        let (session, queues, snapshots) =
            VoiceSession::new(Box::new(input), Box::new(output), Box::new(sink.clone()));
        Harness {
            session,
            queues,
            snapshots,
            clock,
            calls,
            sink,
            fail_with,
            hold,
            held,
        }
    }

    fn audio_message(seconds: f64) -> ServerMessage {
        audio_parts(&[seconds])
    }

    /// One message carrying a fragment per entry
    fn audio_parts(seconds: &[f64]) -> ServerMessage {
        let parts: Vec<String> = seconds
            .iter()
            .map(|s| {
                let frames = (s * 24000.0).round() as usize;
                let data =
                    base64::engine::general_purpose::STANDARD.encode(vec![0u8; frames * 2]);
                format!(
                    r#"{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}}"#,
                    data
                )
            })
            .collect();
        ServerMessage::parse(&format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{}]}}}}}}"#,
            parts.join(",")
        ))
        .unwrap()
    }

    fn interrupted_message() -> ServerMessage {
        ServerMessage::parse(r#"{"serverContent": {"interrupted": true}}"#).unwrap()
    }

    impl Harness {
        async fn deliver(&mut self, message: ServerMessage) {
            self.session
                .on_transport_event(TransportEvent::Message(message));
            let decoded = self.queues.decoded.recv().await.unwrap();
            self.session.on_decoded(decoded);
        }

        /// Hand the microphone's answer back to the session
        async fn settle_capture(&mut self) {
            let ready = self.queues.capture_ready.recv().await.unwrap();
            self.session.on_capture_ready(ready);
        }
    }

    #[tokio::test]
    async fn test_audio_message_makes_session_speak() {
        let mut h = harness();
        assert_eq!(h.session.state(), SessionState::Idle);

        h.deliver(audio_message(0.5)).await;
        assert_eq!(h.session.state(), SessionState::Speaking);
        assert!((h.session.scheduler().next_start_time() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_interrupt_mid_playback() {
        let mut h = harness();
        h.deliver(audio_message(1.0)).await;
        h.clock.set(0.1);
        h.deliver(audio_message(0.5)).await;

        h.clock.set(0.2);
        h.session
            .on_transport_event(TransportEvent::Message(interrupted_message()));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.scheduler().next_start_time(), 0.0);

        // late ended notifications for the cut-off buffers
        h.session.on_playback_event(PlaybackEvent::Ended(0));
        h.session.on_playback_event(PlaybackEvent::Ended(1));

        h.deliver(audio_message(0.3)).await;
        let last = h.calls.borrow().last().cloned().unwrap();
        assert_eq!(
            last,
            BufferCall::Start {
                id: 2,
                at: 0.2,
                duration: 0.3
            }
        );
        assert_eq!(h.session.state(), SessionState::Speaking);
    }

    #[tokio::test]
    async fn test_audio_with_interrupted_flag_is_not_scheduled() {
        let mut h = harness();
        let frames = 2400;
        let data = base64::engine::general_purpose::STANDARD.encode(vec![0u8; frames * 2]);
        let message = ServerMessage::parse(&format!(
            r#"{{"serverContent": {{"interrupted": true, "modelTurn": {{"parts": [
                {{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}}
            ]}}}}}}"#,
            data
        ))
        .unwrap();

        h.session.on_transport_event(TransportEvent::Message(message));
        assert!(h.queues.decoded.try_recv().is_err());
        assert!(!h.session.scheduler().is_speaking());
    }

    #[tokio::test]
    async fn test_undecodable_fragment_reports_error() {
        let mut h = harness();
        let message = ServerMessage::parse(
            r#"{"serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "!!!"}}
            ]}}}"#,
        )
        .unwrap();

        h.deliver(message).await;
        assert!(!h.session.scheduler().is_speaking());
        assert!(h
            .session
            .controller()
            .error()
            .unwrap()
            .starts_with("Invalid base64 payload"));
    }

    #[tokio::test]
    async fn test_capture_toggle_and_frames() {
        let mut h = harness();

        h.session.handle_command(UserCommand::ToggleCapture);
        assert_eq!(h.session.state(), SessionState::Idle);
        h.settle_capture().await;
        assert_eq!(h.session.state(), SessionState::Listening);

        h.session.on_frame(CapturedFrame {
            generation: 1,
            samples: vec![0.25; 256],
        });
        assert_eq!(h.sink.sent.borrow().len(), 1);

        h.session.handle_command(UserCommand::ToggleCapture);
        assert_eq!(h.session.state(), SessionState::Idle);

        h.session.on_frame(CapturedFrame {
            generation: 1,
            samples: vec![0.25; 256],
        });
        assert_eq!(h.sink.sent.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_speaking_overrides_listening() {
        let mut h = harness();
        h.session.handle_command(UserCommand::StartCapture);
        h.settle_capture().await;
        h.deliver(audio_message(0.2)).await;
        assert_eq!(h.session.state(), SessionState::Speaking);

        h.session.on_playback_event(PlaybackEvent::Ended(0));
        assert_eq!(h.session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_device_error_cleared_by_next_start() {
        let mut h = harness();
        *h.fail_with.borrow_mut() = Some("no device".to_string());

        h.session.handle_command(UserCommand::StartCapture);
        h.settle_capture().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.session.controller().error(),
            Some("Microphone unavailable: no device")
        );

        // unrelated success keeps the error
        h.session.on_transport_event(TransportEvent::Open);
        assert!(h.session.controller().error().is_some());

        *h.fail_with.borrow_mut() = None;
        h.session.handle_command(UserCommand::StartCapture);
        h.settle_capture().await;
        assert_eq!(h.session.state(), SessionState::Listening);
        assert_eq!(h.session.controller().error(), None);
    }

    #[tokio::test]
    async fn test_decodes_finishing_out_of_order_play_in_arrival_order() {
        let mut h = harness();
        h.session
            .on_transport_event(TransportEvent::Message(audio_parts(&[2.0, 0.25])));

        let mut decoded = vec![
            h.queues.decoded.recv().await.unwrap(),
            h.queues.decoded.recv().await.unwrap(),
        ];
        decoded.sort_by_key(|d| d.seq);
        let first = decoded.remove(0);
        let second = decoded.remove(0);

        h.session.on_decoded(second);
        assert!(h.calls.borrow().is_empty());
        assert_eq!(h.session.state(), SessionState::Idle);

        h.clock.set(0.5);
        h.session.on_decoded(first);
        assert_eq!(
            *h.calls.borrow(),
            vec![
                BufferCall::Start {
                    id: 0,
                    at: 0.5,
                    duration: 2.0
                },
                BufferCall::Start {
                    id: 1,
                    at: 2.5,
                    duration: 0.25
                },
            ]
        );
        assert_eq!(h.session.state(), SessionState::Speaking);
    }

    #[tokio::test]
    async fn test_session_keeps_working_while_microphone_opens() {
        let mut h = harness();
        h.hold.set(true);

        h.session.handle_command(UserCommand::StartCapture);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.session.controller().status(),
            "Requesting microphone access..."
        );

        // a second start while opening does not ask again
        h.session.handle_command(UserCommand::StartCapture);
        assert_eq!(h.held.borrow().len(), 1);

        h.deliver(audio_message(0.25)).await;
        assert_eq!(h.session.state(), SessionState::Speaking);

        let sender = h.held.borrow_mut().remove(0);
        sender.send(Ok(())).unwrap();
        h.settle_capture().await;
        assert_eq!(h.session.controller().status(), "");

        h.session.on_playback_event(PlaybackEvent::Ended(0));
        assert_eq!(h.session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_stop_while_opening_ignores_late_answer() {
        let mut h = harness();
        h.hold.set(true);

        h.session.handle_command(UserCommand::ToggleCapture);
        h.session.handle_command(UserCommand::ToggleCapture);
        assert_eq!(h.session.state(), SessionState::Idle);

        let sender = h.held.borrow_mut().remove(0);
        sender.send(Ok(())).unwrap();
        h.settle_capture().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.controller().error(), None);
    }

    #[tokio::test]
    async fn test_transport_status_and_dismiss() {
        let mut h = harness();
        h.session.on_transport_event(TransportEvent::Open);
        assert_eq!(h.session.controller().status(), "Opened");

        h.session
            .on_transport_event(TransportEvent::Error("quota exceeded".to_string()));
        h.session
            .on_transport_event(TransportEvent::Close("going away".to_string()));
        assert_eq!(h.session.controller().status(), "Close: going away");
        assert_eq!(
            h.session.controller().error(),
            Some("Transport error: quota exceeded")
        );

        h.session.handle_command(UserCommand::DismissError);
        assert_eq!(h.session.controller().error(), None);
    }

    #[tokio::test]
    async fn test_run_publishes_and_shuts_down() {
        let h = harness();
        let mut snapshots = h.snapshots.clone();

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (_playback_tx, playback) = mpsc::unbounded_channel();

        transport_tx.send(TransportEvent::Open).unwrap();
        commands_tx.send(UserCommand::StartCapture).unwrap();
        commands_tx.send(UserCommand::Shutdown).unwrap();

        h.session
            .run(
                h.queues,
                SessionInputs {
                    commands,
                    transport,
                    playback,
                },
            )
            .await;

        let last = snapshots.borrow_and_update().clone();
        assert_eq!(last.state, SessionState::Idle);
        assert_eq!(last.status, "Shutting down...");
    }
}
