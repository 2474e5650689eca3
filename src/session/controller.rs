use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{HotkeyEvent, HotkeyEventKind, Session, SessionState};
use crate::audio::{AudioBuffer, CaptureDevice, CaptureError};
use crate::config::Config;
use crate::delivery::{notify_failure, ResultDelivery};
use crate::service::{LifecycleError, ServiceControl};
use crate::transcription::{Language, SpeechTranscriber, TranscribeError, TranscriptionResult};

/// Session-level failure, reported and absorbed; never reaches the listener
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error(transparent)]
    Service(#[from] LifecycleError),

    #[error(transparent)]
    Transcribe(#[from] TranscribeError),
}

/// Progress reports from the in-flight pipeline task back to the controller
#[derive(Debug)]
enum PipelineUpdate {
    Transcribed(TranscriptionResult),
    Delivered,
    Failed(SessionError),
}

/// Policy knobs the controller applies per session
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Language the service translates into
    pub target_language: Language,
    /// Source language override; `None` lets the service detect it
    pub source_language: Option<Language>,
    /// Safety cutoff handed to the capture; `None` records until release
    pub capture_limit: Option<Duration>,
    /// Budget for the service to become ready before the request
    pub readiness_timeout: Duration,
    /// How long shutdown waits for an in-flight session to cancel
    pub shutdown_grace: Duration,
    /// Surface failures as desktop notifications
    pub notify: bool,
}

impl SessionPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_language: config.transcription.target_language,
            source_language: config.transcription.source_language,
            capture_limit: config.audio.max_duration(),
            readiness_timeout: config.service.readiness_timeout(),
            shutdown_grace: config.session.shutdown_grace(),
            notify: config.delivery.notify,
        }
    }
}

/// The session state machine
///
/// Owns the only non-idle session in the process. The hotkey listener only
/// enqueues events; this controller dequeues them in arrival order and drives
/// capture, the service lifecycle, the transcription request, and delivery.
/// Every failure is absorbed back to `Idle` so the listener stays alive across
/// arbitrarily many failed sessions.
pub struct SessionController<C: CaptureDevice> {
    state: SessionState,
    session: Option<Session>,
    capture: C,
    service: Arc<dyn ServiceControl>,
    transcriber: Arc<dyn SpeechTranscriber>,
    delivery: Arc<dyn ResultDelivery>,
    policy: SessionPolicy,
    updates_tx: mpsc::Sender<PipelineUpdate>,
    updates_rx: Option<mpsc::Receiver<PipelineUpdate>>,
    inflight: Option<JoinHandle<()>>,
}

impl<C: CaptureDevice> SessionController<C> {
    #[must_use]
    pub fn new(
        capture: C,
        service: Arc<dyn ServiceControl>,
        transcriber: Arc<dyn SpeechTranscriber>,
        delivery: Arc<dyn ResultDelivery>,
        policy: SessionPolicy,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(8);
        Self {
            state: SessionState::Idle,
            session: None,
            capture,
            service,
            transcriber,
            delivery,
            policy,
            updates_tx,
            updates_rx: Some(updates_rx),
            inflight: None,
        }
    }

    /// Current state, for observability
    #[must_use]
    pub const fn current_state(&self) -> SessionState {
        self.state
    }

    /// Apply one hotkey edge event
    ///
    /// Events not valid for the current state are logged and ignored; this
    /// never raises into the caller.
    pub fn handle_hotkey_event(&mut self, event: HotkeyEvent) {
        match (self.state, event.kind) {
            (SessionState::Idle, HotkeyEventKind::Press) => self.begin_session(),
            (SessionState::Recording, HotkeyEventKind::Release) => self.finish_recording(),
            (SessionState::Recording, HotkeyEventKind::Press) => {
                // The hotkey is a toggle, not a repeat trigger
                debug!("press ignored while recording");
            }
            (state, kind) => {
                debug!(%state, ?kind, "event not valid for state, ignored");
            }
        }
    }

    /// Consume hotkey events and pipeline updates until the event queue closes
    pub async fn run(&mut self, events: &mut mpsc::Receiver<HotkeyEvent>) {
        let Some(mut updates) = self.updates_rx.take() else {
            warn!("controller event loop already running");
            return;
        };

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_hotkey_event(event),
                    None => break,
                },
                Some(update) = updates.recv() => self.apply_update(update),
            }
        }

        self.updates_rx = Some(updates);
    }

    /// Cancel any in-flight session within the grace period and force `Idle`
    ///
    /// The microphone is released unconditionally.
    pub async fn shutdown(&mut self) {
        info!("shutting down session controller");

        if let Some(handle) = self.inflight.take() {
            handle.abort();
            if tokio::time::timeout(self.policy.shutdown_grace, handle)
                .await
                .is_err()
            {
                warn!(
                    grace_ms = self.policy.shutdown_grace.as_millis(),
                    "in-flight session did not cancel within grace period"
                );
            }
        }

        if self.capture.is_active() {
            self.capture.abort();
        }

        self.state = SessionState::Idle;
        self.session = None;
    }

    fn begin_session(&mut self) {
        match self.capture.start(self.policy.capture_limit) {
            Ok(()) => {
                self.session = Some(Session {
                    started_at: Instant::now(),
                    target_language: self.policy.target_language,
                });
                self.state = SessionState::Recording;
                info!(target = %self.policy.target_language, "recording started");
            }
            Err(CaptureError::AlreadyRecording) => {
                // Double-press race; not an error, no session is created
                debug!("capture already in progress, press ignored");
            }
            Err(e) => {
                error!("cannot start recording: {}", e);
                self.report_failure("Recording failed", &e.to_string());
            }
        }
    }

    fn finish_recording(&mut self) {
        let held_for = self
            .session
            .as_ref()
            .map_or(Duration::ZERO, |s| s.started_at.elapsed());

        match self.capture.stop() {
            Ok(buffer) => {
                info!(
                    held_ms = held_for.as_millis(),
                    audio_ms = buffer.duration().as_millis(),
                    truncated = buffer.truncated(),
                    "recording stopped"
                );
                self.state = SessionState::Transcribing;
                self.spawn_pipeline(buffer);
            }
            Err(e) => {
                warn!("discarding session: {}", e);
                self.report_failure("Nothing captured", &e.to_string());
                self.reset();
            }
        }
    }

    fn spawn_pipeline(&mut self, buffer: AudioBuffer) {
        let service = Arc::clone(&self.service);
        let transcriber = Arc::clone(&self.transcriber);
        let delivery = Arc::clone(&self.delivery);
        let tx = self.updates_tx.clone();
        let policy = self.policy.clone();

        self.inflight = Some(tokio::spawn(async move {
            match transcribe_session(service.as_ref(), transcriber.as_ref(), &buffer, &policy)
                .await
            {
                Ok(result) => {
                    if tx
                        .send(PipelineUpdate::Transcribed(result.clone()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    deliver_text(delivery, result).await;
                    let _ = tx.send(PipelineUpdate::Delivered).await;
                }
                Err(e) => {
                    let _ = tx.send(PipelineUpdate::Failed(e)).await;
                }
            }
        }));
    }

    fn apply_update(&mut self, update: PipelineUpdate) {
        match update {
            PipelineUpdate::Transcribed(result) => {
                if self.state == SessionState::Transcribing {
                    info!(detected = %result.detected_language, "delivering transcription");
                    self.state = SessionState::Delivering;
                }
            }
            PipelineUpdate::Delivered => {
                // Unconditional: delivery failure never re-enters the pipeline
                self.reset();
            }
            PipelineUpdate::Failed(e) => {
                error!("session failed: {}", e);
                self.report_failure("Transcription failed", &e.to_string());
                self.reset();
            }
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.session = None;
        self.inflight = None;
    }

    fn report_failure(&self, summary: &str, detail: &str) {
        if self.policy.notify {
            notify_failure(summary, detail);
        }
    }
}

/// Readiness check plus the transcription request with the retry policy:
/// exactly one retry on `Timeout`, none on `ServiceError` or `RequestFailed`
/// (a failed service may have partially processed the chunk).
pub(crate) async fn transcribe_session(
    service: &dyn ServiceControl,
    transcriber: &dyn SpeechTranscriber,
    buffer: &AudioBuffer,
    policy: &SessionPolicy,
) -> Result<TranscriptionResult, SessionError> {
    let handle = service.ensure_ready(policy.readiness_timeout).await?;

    let attempt = transcriber
        .transcribe(
            buffer,
            policy.target_language,
            policy.source_language,
            &handle,
        )
        .await;

    let result = match attempt {
        Err(TranscribeError::Timeout) => {
            warn!("transcription request timed out, retrying once");
            transcriber
                .transcribe(
                    buffer,
                    policy.target_language,
                    policy.source_language,
                    &handle,
                )
                .await
        }
        other => other,
    };

    match result {
        Ok(r) => Ok(r),
        Err(e) => {
            if matches!(e, TranscribeError::RequestFailed { .. }) {
                // Connection-level failure: force a fresh probe next session
                service.invalidate().await;
            }
            Err(e.into())
        }
    }
}

/// Hand the text to the sinks on the blocking pool; failures are logged only
async fn deliver_text(delivery: Arc<dyn ResultDelivery>, result: TranscriptionResult) {
    let text = if result.translated_text.is_empty() {
        result.source_text
    } else {
        result.translated_text
    };

    if text.is_empty() {
        info!("no speech detected, nothing to deliver");
        return;
    }

    let outcome = tokio::task::spawn_blocking(move || delivery.deliver(&text)).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("delivery failed: {:#}", e),
        Err(e) => warn!("delivery task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MockCaptureDevice;
    use crate::delivery::MockResultDelivery;
    use crate::service::{MockServiceControl, ServiceHandle};
    use crate::transcription::client::MockSpeechTranscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_policy() -> SessionPolicy {
        SessionPolicy {
            target_language: Language::En,
            source_language: None,
            capture_limit: None,
            readiness_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(200),
            notify: false,
        }
    }

    fn ready_handle() -> ServiceHandle {
        ServiceHandle {
            running: true,
            ready: true,
            base_url: "http://localhost:8001".to_owned(),
        }
    }

    fn hello_result() -> TranscriptionResult {
        TranscriptionResult {
            source_text: "hello".to_owned(),
            translated_text: "hello".to_owned(),
            detected_language: "en".to_owned(),
        }
    }

    fn one_second_buffer() -> AudioBuffer {
        AudioBuffer::new(vec![0.1; 16000], 16000, false)
    }

    fn controller(
        capture: MockCaptureDevice,
        service: MockServiceControl,
        transcriber: MockSpeechTranscriber,
        delivery: MockResultDelivery,
    ) -> SessionController<MockCaptureDevice> {
        SessionController::new(
            capture,
            Arc::new(service),
            Arc::new(transcriber),
            Arc::new(delivery),
            test_policy(),
        )
    }

    async fn drain_until_idle(controller: &mut SessionController<MockCaptureDevice>) {
        while controller.current_state() != SessionState::Idle {
            let update = tokio::time::timeout(Duration::from_secs(2), async {
                match controller.updates_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            })
            .await
            .ok()
            .flatten();
            match update {
                Some(u) => controller.apply_update(u),
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_press_from_idle_starts_recording() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().times(1).returning(|_| Ok(()));

        let mut controller = controller(
            capture,
            MockServiceControl::new(),
            MockSpeechTranscriber::new(),
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        assert_eq!(controller.current_state(), SessionState::Recording);
        assert!(controller.session.is_some());
    }

    #[tokio::test]
    async fn test_press_while_recording_is_noop() {
        let mut capture = MockCaptureDevice::new();
        // Exactly one start for two presses
        capture.expect_start().times(1).returning(|_| Ok(()));

        let mut controller = controller(
            capture,
            MockServiceControl::new(),
            MockSpeechTranscriber::new(),
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::press());
        assert_eq!(controller.current_state(), SessionState::Recording);
    }

    #[tokio::test]
    async fn test_capture_unavailable_leaves_no_session() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| {
            Err(CaptureError::Unavailable {
                source: anyhow::anyhow!("mic busy"),
            })
        });

        let mut controller = controller(
            capture,
            MockServiceControl::new(),
            MockSpeechTranscriber::new(),
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.session.is_none());
    }

    #[tokio::test]
    async fn test_release_while_idle_is_ignored() {
        let mut controller = controller(
            MockCaptureDevice::new(),
            MockServiceControl::new(),
            MockSpeechTranscriber::new(),
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::release());
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_capture_returns_to_idle_without_transcribing() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| Ok(()));
        capture
            .expect_stop()
            .returning(|| Err(CaptureError::EmptyCapture));

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber.expect_transcribe().times(0);

        let mut controller = controller(
            capture,
            MockServiceControl::new(),
            transcriber,
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.session.is_none());
    }

    #[tokio::test]
    async fn test_happy_path_delivers_once_and_returns_to_idle() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| Ok(()));
        capture.expect_stop().returning(|| Ok(one_second_buffer()));

        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .times(1)
            .returning(|_| Ok(ready_handle()));

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .times(1)
            .returning(|_, _, _, _| Ok(hello_result()));

        let mut delivery = MockResultDelivery::new();
        delivery
            .expect_deliver()
            .times(1)
            .withf(|text| text == "hello")
            .returning(|_| Ok(()));

        let mut controller = controller(capture, service, transcriber, delivery);

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());
        assert_eq!(controller.current_state(), SessionState::Transcribing);

        drain_until_idle(&mut controller).await;
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.session.is_none());
    }

    #[tokio::test]
    async fn test_service_never_ready_aborts_without_transcribing() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| Ok(()));
        capture.expect_stop().returning(|| Ok(one_second_buffer()));

        let mut service = MockServiceControl::new();
        service.expect_ensure_ready().times(1).returning(|budget| {
            Err(LifecycleError::Timeout { budget })
        });

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber.expect_transcribe().times(0);

        let mut controller = controller(
            capture,
            service,
            transcriber,
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());

        drain_until_idle(&mut controller).await;
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_delivery_failure_still_returns_to_idle() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| Ok(()));
        capture.expect_stop().returning(|| Ok(one_second_buffer()));

        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .returning(|_| Ok(ready_handle()));

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .returning(|_, _, _, _| Ok(hello_result()));

        let mut delivery = MockResultDelivery::new();
        delivery
            .expect_deliver()
            .returning(|_| Err(anyhow::anyhow!("clipboard gone")));

        let mut controller = controller(capture, service, transcriber, delivery);

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());
        drain_until_idle(&mut controller).await;
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_retry_once_on_timeout() {
        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .returning(|_| Ok(ready_handle()));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .times(2)
            .returning(move |_, _, _, _| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TranscribeError::Timeout)
                } else {
                    Ok(hello_result())
                }
            });

        let result = transcribe_session(
            &service,
            &transcriber,
            &one_second_buffer(),
            &test_policy(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_service_error() {
        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .returning(|_| Ok(ready_handle()));

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .times(1)
            .returning(|_, _, _, _| {
                Err(TranscribeError::ServiceError {
                    status: 500,
                    detail: "inference failed".to_owned(),
                })
            });

        let result = transcribe_session(
            &service,
            &transcriber,
            &one_second_buffer(),
            &test_policy(),
        )
        .await;

        assert!(matches!(
            result,
            Err(SessionError::Transcribe(TranscribeError::ServiceError { .. }))
        ));
    }

    #[tokio::test]
    async fn test_request_failure_invalidates_readiness() {
        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .returning(|_| Ok(ready_handle()));
        service.expect_invalidate().times(1).returning(|| ());

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .times(1)
            .returning(|_, _, _, _| {
                Err(TranscribeError::RequestFailed {
                    source: anyhow::anyhow!("connection refused"),
                })
            });

        let result = transcribe_session(
            &service,
            &transcriber,
            &one_second_buffer(),
            &test_policy(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_press_during_transcribing_is_ignored() {
        let mut capture = MockCaptureDevice::new();
        // One start only, despite the press arriving mid-transcription
        capture.expect_start().times(1).returning(|_| Ok(()));
        capture.expect_stop().returning(|| Ok(one_second_buffer()));

        let mut service = MockServiceControl::new();
        service.expect_ensure_ready().returning(|_| {
            // Keep the pipeline in flight long enough for the extra press
            std::thread::sleep(Duration::from_millis(50));
            Ok(ready_handle())
        });

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .returning(|_, _, _, _| Ok(hello_result()));

        let mut delivery = MockResultDelivery::new();
        delivery.expect_deliver().returning(|_| Ok(()));

        let mut controller = controller(capture, service, transcriber, delivery);

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());
        assert_eq!(controller.current_state(), SessionState::Transcribing);

        // Invalid for the current state: queued-and-ignored, never interleaved
        controller.handle_hotkey_event(HotkeyEvent::press());
        assert_eq!(controller.current_state(), SessionState::Transcribing);

        drain_until_idle(&mut controller).await;
        assert_eq!(controller.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_inflight_and_releases_microphone() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().returning(|_| Ok(()));
        capture.expect_stop().returning(|| Ok(one_second_buffer()));
        capture.expect_is_active().returning(|| true);
        capture.expect_abort().times(1).returning(|| ());

        let mut service = MockServiceControl::new();
        service.expect_ensure_ready().returning(|_| {
            // A readiness poll that outlives the grace period
            std::thread::sleep(Duration::from_secs(5));
            Ok(ready_handle())
        });

        let mut controller = controller(
            capture,
            service,
            MockSpeechTranscriber::new(),
            MockResultDelivery::new(),
        );

        controller.handle_hotkey_event(HotkeyEvent::press());
        controller.handle_hotkey_event(HotkeyEvent::release());
        assert_eq!(controller.current_state(), SessionState::Transcribing);

        controller.shutdown().await;
        assert_eq!(controller.current_state(), SessionState::Idle);
        assert!(controller.inflight.is_none());
    }

    #[tokio::test]
    async fn test_run_processes_events_in_order() {
        let mut capture = MockCaptureDevice::new();
        capture.expect_start().times(1).returning(|_| Ok(()));
        capture.expect_stop().times(1).returning(|| Ok(one_second_buffer()));

        let mut service = MockServiceControl::new();
        service
            .expect_ensure_ready()
            .returning(|_| Ok(ready_handle()));

        let mut transcriber = MockSpeechTranscriber::new();
        transcriber
            .expect_transcribe()
            .returning(|_, _, _, _| Ok(hello_result()));

        let mut delivery = MockResultDelivery::new();
        delivery.expect_deliver().returning(|_| Ok(()));

        let mut controller = controller(capture, service, transcriber, delivery);

        let (tx, mut rx) = mpsc::channel(32);
        tx.send(HotkeyEvent::press()).await.unwrap();
        tx.send(HotkeyEvent::release()).await.unwrap();

        // Let the pipeline finish before the queue closes
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(tx);
        });

        controller.run(&mut rx).await;
        sender.await.unwrap();

        assert_eq!(controller.current_state(), SessionState::Idle);
    }
}
