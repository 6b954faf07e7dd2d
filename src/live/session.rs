//! # Session Lifecycle Controller
//!
//! Owns one live voice session at a time and drives it through:
//!
//! ```text
//! Standby -> Connecting -> Listening -> (Error | Closed)
//!                 |             |
//!                 +--> Error    +--> Standby (stop)
//! ```
//!
//! ## Key Rust Concepts:
//! - **RAII teardown**: every device, task and socket acquired for a session
//!   lives in one [`SessionResources`] value whose `Drop` releases all of it.
//!   Failure paths just return and let the value drop.
//! - **Epochs**: `start()` awaits devices and the network. `stop()` bumps an
//!   epoch counter, and `start()` checks it after every `.await`, so a start
//!   that is overtaken by a stop gives back what it acquired instead of
//!   resurrecting the session.
//! - **watch channel**: status changes are broadcast to any number of
//!   observers (the WebSocket status feed, tests).
//!
//! The controller's mutex is a `std::sync::Mutex`: it is only held for short
//! synchronous sections and never across an `.await`.

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{DeviceProvider, InputDevice, OutputDevice};
use crate::audio::scheduler::{PlaybackScheduler, SchedulerSnapshot};
use crate::config::{AppConfig, DevicesConfig, LiveConfig};
use crate::error::LiveError;
use crate::live::protocol::InboundMessage;
use crate::live::transport::{LiveConnection, LiveTransport, TransportEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Status string shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Standby,
    Connecting,
    Listening,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Standby => "Standby",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Listening => "Listening",
            SessionStatus::Error => "Error",
            SessionStatus::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything `start()` needs to know about one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub live: LiveConfig,
    pub devices: DevicesConfig,
    pub capture_sample_rate: u32,
    pub capture_frame_size: usize,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub connect_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            live: config.live.clone(),
            devices: config.devices.clone(),
            capture_sample_rate: config.audio.capture_sample_rate,
            capture_frame_size: config.audio.capture_frame_size,
            output_sample_rate: config.audio.output_sample_rate,
            output_channels: config.audio.output_channels,
            connect_timeout: Duration::from_millis(config.live.connect_timeout_ms),
        }
    }
}

/// Point-in-time view of the controller for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    pub frames_sent: u64,
    pub playback: Option<SchedulerSnapshot>,
}

/// Resources held by one session. Dropping this value releases all of them.
///
/// ## Release order:
/// 1. close the network connection
/// 2. stop the microphone (capture pipeline, or the raw device if capture
///    never started)
/// 3. stop and clear every scheduled source, resetting the cursor
/// 4. close the output device
/// 5. stop the inbound dispatch task
#[derive(Default)]
pub struct SessionResources {
    output: Option<Arc<dyn OutputDevice>>,
    microphone: Option<Box<dyn InputDevice>>,
    scheduler: Option<Arc<PlaybackScheduler>>,
    capture: Option<CapturePipeline>,
    connection: Option<LiveConnection>,
    dispatch: Option<JoinHandle<()>>,
}

impl SessionResources {
    /// Release everything. Every step is a no-op the second time.
    pub fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop_all();
        }
        if let Some(output) = self.output.take() {
            output.close();
        }
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
    }

    fn frames_sent(&self) -> u64 {
        self.capture.as_ref().map(CapturePipeline::frames_sent).unwrap_or(0)
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release();
    }
}

struct ControllerState {
    status: SessionStatus,
    epoch: u64,
    resources: Option<SessionResources>,
    session_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
}

struct Shared {
    state: Mutex<ControllerState>,
    status_tx: watch::Sender<SessionStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Status changes only happen with the state lock held, so observers see
    /// them in the same order as the state machine.
    fn set_status(&self, state: &mut ControllerState, status: SessionStatus) {
        if state.status != status {
            info!(from = %state.status, to = %status, "Session status changed");
            state.status = status;
            self.status_tx.send_replace(status);
        }
    }
}

/// Marks a `start()` in flight. If it is dropped while its epoch is still
/// current and the status is still `Connecting` (the start failed, or its
/// future was dropped mid-await), the status becomes `Error`.
struct PendingStart<'a> {
    shared: &'a Shared,
    epoch: u64,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.epoch == self.epoch && state.status == SessionStatus::Connecting {
            self.shared.set_status(&mut state, SessionStatus::Error);
        }
    }
}

/// Starts, stops and supervises the live voice session.
pub struct LiveSessionController {
    devices: Arc<dyn DeviceProvider>,
    transport: Arc<dyn LiveTransport>,
    shared: Arc<Shared>,
}

impl LiveSessionController {
    pub fn new(devices: Arc<dyn DeviceProvider>, transport: Arc<dyn LiveTransport>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Standby);
        Self {
            devices,
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState {
                    status: SessionStatus::Standby,
                    epoch: 0,
                    resources: None,
                    session_id: None,
                    started_at: None,
                }),
                status_tx,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    /// Receiver that sees every status change from now on.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.lock();
        let resources = state.resources.as_ref();
        SessionSnapshot {
            status: state.status,
            session_id: state.session_id,
            started_at: state.started_at,
            uptime_seconds: state.started_at.map(|t| (Utc::now() - t).num_seconds()),
            frames_sent: resources.map(SessionResources::frames_sent).unwrap_or(0),
            playback: resources
                .and_then(|r| r.scheduler.as_ref())
                .map(|scheduler| scheduler.snapshot()),
        }
    }

    /// Fail with `InvalidState` if `stop()` ran since `epoch` was taken.
    fn ensure_current(&self, epoch: u64) -> Result<(), LiveError> {
        if self.shared.lock().epoch == epoch {
            Ok(())
        } else {
            Err(LiveError::InvalidState("session start was cancelled by stop".to_string()))
        }
    }

    /// Open a session.
    ///
    /// Valid only from `Standby`. Returns once the backend has confirmed the
    /// session is open and status is `Listening`. On any failure status
    /// becomes `Error` and everything acquired so far is released.
    pub async fn start(&self, settings: SessionSettings) -> Result<(), LiveError> {
        let epoch = {
            let mut state = self.shared.lock();
            if state.status != SessionStatus::Standby {
                return Err(LiveError::InvalidState(format!("cannot start while {}", state.status)));
            }
            state.epoch += 1;
            self.shared.set_status(&mut state, SessionStatus::Connecting);
            state.epoch
        };

        // Declared before `resources` so it drops after them: status only
        // becomes Error once everything acquired has been released
        let _pending = PendingStart {
            shared: &self.shared,
            epoch,
        };

        let mut resources = SessionResources::default();
        match self.acquire(epoch, &settings, &mut resources).await {
            Ok(events) => self.go_live(epoch, resources, events),
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Session start failed");
                Err(e)
            }
        }
    }

    /// Acquire devices and the connection, in order, into `resources`.
    async fn acquire(
        &self,
        epoch: u64,
        settings: &SessionSettings,
        resources: &mut SessionResources,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, LiveError> {
        let output = self
            .devices
            .open_output(&settings.devices, settings.output_sample_rate, settings.output_channels)
            .await?;
        resources.output = Some(output.clone());
        self.ensure_current(epoch)?;

        let microphone = self
            .devices
            .request_microphone(&settings.devices, settings.capture_sample_rate)
            .await?;
        resources.microphone = Some(microphone);
        self.ensure_current(epoch)?;

        resources.scheduler = Some(Arc::new(PlaybackScheduler::new(output)));

        // One deadline covers the handshake and the open confirmation
        let deadline = Instant::now() + settings.connect_timeout;
        let connection = tokio::time::timeout_at(deadline, self.transport.connect(&settings.live))
            .await
            .map_err(|_| {
                LiveError::Connection(format!("no connection within {:?}", settings.connect_timeout))
            })??;
        let connection = resources.connection.insert(connection);
        let mut events = connection
            .take_events()
            .ok_or_else(|| LiveError::Connection("connection has no event stream".to_string()))?;
        self.ensure_current(epoch)?;

        Self::wait_for_open(&mut events, deadline, settings.connect_timeout).await?;
        self.ensure_current(epoch)?;

        let outbound = connection.sender();
        let microphone = resources
            .microphone
            .take()
            .ok_or_else(|| LiveError::Device("microphone was released".to_string()))?;
        resources.capture = Some(CapturePipeline::start(microphone, settings.capture_frame_size, outbound)?);

        Ok(events)
    }

    async fn wait_for_open(
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), LiveError> {
        let opened = tokio::time::timeout_at(deadline, async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Open) => return Ok(()),
                    Some(TransportEvent::Message(_)) => {
                        debug!("Ignoring message received before open");
                    }
                    Some(TransportEvent::Error(reason)) => return Err(LiveError::Connection(reason)),
                    Some(TransportEvent::Closed(reason)) => {
                        return Err(LiveError::Connection(format!(
                            "closed before open: {}",
                            reason.unwrap_or_else(|| "no reason given".to_string())
                        )))
                    }
                    None => return Err(LiveError::Connection("connection dropped before open".to_string())),
                }
            }
        })
        .await;

        opened.map_err(|_| LiveError::Connection(format!("no open confirmation within {:?}", timeout)))?
    }

    /// Publish the acquired session and start dispatching inbound messages.
    fn go_live(
        &self,
        epoch: u64,
        mut resources: SessionResources,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(), LiveError> {
        let mut state = self.shared.lock();
        if state.epoch != epoch {
            drop(state);
            drop(resources);
            return Err(LiveError::InvalidState("session start was cancelled by stop".to_string()));
        }

        let Some(scheduler) = resources.scheduler.clone() else {
            self.shared.set_status(&mut state, SessionStatus::Error);
            return Err(LiveError::InvalidState("session has no scheduler".to_string()));
        };

        let session_id = Uuid::new_v4();
        resources.dispatch = Some(tokio::spawn(dispatch(
            Arc::downgrade(&self.shared),
            epoch,
            scheduler,
            events,
        )));

        state.resources = Some(resources);
        state.session_id = Some(session_id);
        state.started_at = Some(Utc::now());
        self.shared.set_status(&mut state, SessionStatus::Listening);
        info!(%session_id, "Live session listening");
        Ok(())
    }

    /// Tear the session down and return to `Standby`.
    ///
    /// Valid from any state and idempotent. A `start()` still in flight is
    /// cancelled and releases whatever it had acquired.
    pub fn stop(&self) {
        let resources = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.session_id = None;
            state.started_at = None;
            self.shared.set_status(&mut state, SessionStatus::Standby);
            state.resources.take()
        };

        if let Some(mut resources) = resources {
            resources.release();
            info!("Live session stopped");
        }
    }
}

impl Drop for LiveSessionController {
    fn drop(&mut self) {
        let resources = self.shared.lock().resources.take();
        drop(resources);
    }
}

/// Route one inbound message to the scheduler.
///
/// An interruption is applied before any audio carried by the same message.
fn handle_inbound(scheduler: &PlaybackScheduler, message: InboundMessage) {
    if message.interrupted {
        scheduler.interrupt();
    }

    if let Some(data) = message.audio_data {
        match scheduler.enqueue(&data, message.sample_rate, message.channel_count) {
            Ok(chunk) => debug!(source_id = chunk.id, start_at = chunk.start_at, "Queued model audio"),
            Err(e @ (LiveError::Decode(_) | LiveError::Format(_))) => {
                warn!(error = %e, "Dropping inbound audio chunk");
            }
            Err(e) => warn!(error = %e, kind = e.kind(), "Failed to schedule inbound audio"),
        }
    }
}

/// The single consumer of a session's transport events.
async fn dispatch(
    shared: Weak<Shared>,
    epoch: u64,
    scheduler: Arc<PlaybackScheduler>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Message(message)) => handle_inbound(&scheduler, message),
            Some(TransportEvent::Open) => debug!("Duplicate open confirmation ignored"),
            Some(TransportEvent::Error(reason)) => break format!("transport error: {}", reason),
            Some(TransportEvent::Closed(reason)) => {
                break reason.unwrap_or_else(|| "closed by remote".to_string())
            }
            None => break "event stream ended".to_string(),
        }
    };
    drop(scheduler);

    let Some(shared) = shared.upgrade() else {
        return;
    };

    let resources = {
        let mut state = shared.lock();
        if state.epoch != epoch || state.status != SessionStatus::Listening {
            return;
        }
        state.epoch += 1;
        shared.set_status(&mut state, SessionStatus::Closed);
        state.resources.take()
    };

    warn!(%reason, "Live session closed unexpectedly");
    drop(resources);
}
