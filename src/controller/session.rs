//! Controller Session - lifecycle of one emulated controller
//!
//! Owns the calibration store, sequence counter, input report emitter and
//! dispatcher, and wires them to a transport. A session starts `Idle`;
//! [`ControllerSession::connect`] spawns the tasks and moves it to
//! `Connected`.
//!
//! ```text
//! transport ──read──► read loop ──► Dispatcher ──┐
//!                                                ├──► ReportWriter ──write──► transport
//! counter ticker      input report ticker ───────┘
//! ```
//!
//! The read loop owns the session's lifetime: when the transport reports
//! end-of-file or an error, the loop ends and cancels every other task.

use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::calibration::CalibrationStore;
use super::counter::SequenceCounter;
use super::dispatcher::{Dispatcher, DEFAULT_MAC};
use super::input_report::InputReporter;
use super::packet::{BoxedWriter, ReportWriter};
use super::state::ButtonHandle;

/// Read half of the device transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Host output reports are never longer than this
const READ_BUFFER_LEN: usize = 128;

/// Runtime settings for a session
///
/// # Examples
///
/// ```rust
/// use procon::controller::SessionSettings;
///
/// let settings = SessionSettings {
///     input_report_interval_ms: 15,
///     ..SessionSettings::default()
/// };
/// assert_eq!(settings.counter_interval_ms, 5);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// Period of the sequence counter
    pub counter_interval_ms: u64,

    /// Period of the standard input report
    pub input_report_interval_ms: u64,

    /// Log `0x30` frames along with every other outbound report. Off by
    /// default; at the default period this is ~33 lines per second.
    pub log_input_reports: bool,

    /// MAC address announced in identity replies
    pub mac_address: [u8; 6],
}

impl SessionSettings {
    /// Both periods must be at least 1 ms
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.counter_interval_ms == 0 {
            return Err(SessionError::InvalidInterval("counter_interval_ms"));
        }
        if self.input_report_interval_ms == 0 {
            return Err(SessionError::InvalidInterval("input_report_interval_ms"));
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            counter_interval_ms: 5,
            input_report_interval_ms: 30,
            log_input_reports: false,
            mac_address: DEFAULT_MAC,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport read failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Interval must be at least 1 ms: {0}")]
    InvalidInterval(&'static str),

    #[error("Session task failed: {0}")]
    Task(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Connected,
}

#[machine]
pub struct ControllerSession<S: SessionState> {
    settings: SessionSettings,

    // Taken by the read loop on connect
    reader: Option<BoxedReader>,

    writer: ReportWriter,
    counter: SequenceCounter,
    calibration: CalibrationStore,
    buttons: ButtonHandle,
    reporter: Arc<InputReporter>,

    // Root token, every task runs on a child of it
    cancel: CancellationToken,

    // Dropping the session without shutdown still ends its tasks
    _stop_on_drop: DropGuard,

    counter_task: Option<JoinHandle<()>>,
    read_task: Option<JoinHandle<Result<(), SessionError>>>,
}

// Available in every state
impl<S: SessionState> ControllerSession<S> {
    /// Handle through which the embedding application presses buttons and
    /// moves sticks
    pub fn buttons(&self) -> ButtonHandle {
        self.buttons.clone()
    }

    pub fn counter(&self) -> SequenceCounter {
        self.counter.clone()
    }
}

impl ControllerSession<Idle> {
    pub fn create(
        reader: BoxedReader,
        writer: BoxedWriter,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        debug!("Creating controller session with settings: {:?}", settings);
        settings.validate()?;

        let writer = ReportWriter::new(writer, settings.log_input_reports);
        let counter = SequenceCounter::new();
        let buttons = ButtonHandle::new();
        let cancel = CancellationToken::new();
        let reporter = Arc::new(InputReporter::new(
            writer.clone(),
            counter.clone(),
            buttons.subscribe(),
            Duration::from_millis(settings.input_report_interval_ms),
            cancel.clone(),
        ));

        let stop_on_drop = cancel.clone().drop_guard();
        Ok(Self::new(
            settings,
            Some(reader),
            writer,
            counter,
            CalibrationStore::new(),
            buttons,
            reporter,
            cancel,
            stop_on_drop,
            None,
            None,
        ))
    }

    /// Starts the sequence counter and the read loop.
    ///
    /// Input reports stay off until the host asks for them.
    pub fn connect(mut self) -> ControllerSession<Connected> {
        info!("Connecting controller session");

        self.counter_task = Some(self.counter.spawn_ticker(
            Duration::from_millis(self.settings.counter_interval_ms),
            self.cancel.child_token(),
        ));

        let dispatcher = Dispatcher::new(
            self.writer.clone(),
            self.counter.clone(),
            self.calibration.clone(),
            self.reporter.clone(),
            self.settings.mac_address,
        );

        if let Some(reader) = self.reader.take() {
            self.read_task = Some(tokio::spawn(run_read_loop(
                reader,
                dispatcher,
                self.cancel.clone(),
            )));
        }

        info!("Controller session connected");
        self.transition()
    }
}

impl ControllerSession<Connected> {
    /// Requests every task to stop. Safe to call any number of times.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            debug!("Session already stopping");
            return;
        }
        info!("Stopping controller session");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn input_reports_running(&self) -> bool {
        self.reporter.is_running().await
    }

    /// Waits until the read loop ends, either because the transport closed or
    /// failed, or because [`stop`](Self::stop) was called. Returns the read
    /// loop's result the first time, `Ok(())` afterwards. Cancel safe.
    pub async fn wait(&mut self) -> Result<(), SessionError> {
        let Some(task) = self.read_task.as_mut() else {
            return Ok(());
        };

        let joined = task.await;
        self.read_task = None;
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Read loop panicked or was aborted: {}", e);
                Err(SessionError::Task(e.to_string()))
            }
        }
    }

    /// Stops all tasks, waits for them, and closes the transport.
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        self.stop();
        self.reporter.stop().await;

        if let Some(task) = self.counter_task.take() {
            if let Err(e) = task.await {
                warn!("Counter task ended abnormally: {}", e);
            }
        }

        let result = self.wait().await;

        if let Err(e) = self.writer.shutdown().await {
            debug!("Transport already closed: {}", e);
        }
        info!("Controller session shut down");
        result
    }
}

async fn run_read_loop(
    mut reader: BoxedReader,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    // the session ends with this loop, whatever the reason
    let _guard = cancel.clone().drop_guard();
    let mut buf = [0u8; READ_BUFFER_LEN];

    info!("Read loop started");
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Read loop stopped");
                return Ok(());
            }
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    error!("Transport read failed: {}", e);
                    return Err(e.into());
                }
            },
        };

        if n == 0 {
            info!("Transport closed by host");
            return Ok(());
        }

        debug!("read: {}", hex::encode(&buf[..n]));
        dispatcher.dispatch(&buf[..n]).await;
    }
}
