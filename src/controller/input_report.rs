//! Input Report Emitter - periodic `0x30` standard input reports
//!
//! The host switches reporting on and off with device-management requests,
//! so the emitter can be started and stopped any number of times. Each start
//! gets its own child cancellation token; a stop cancels it and waits for the
//! task to finish before returning.

use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::counter::SequenceCounter;
use super::packet::{ReportWriter, INPUT_REPORT_ID};
use super::state::{ButtonState, StickPosition};

/// Length of the meaningful prefix of a standard input report
pub const INPUT_REPORT_LEN: usize = 13;

/// Battery full, powered, Pro Controller connection info
pub const BATTERY_STATUS: u8 = 0x81;

const STICK_CENTER: f64 = 2048.0;
const STICK_RANGE: f64 = 2047.0;

/// Builds the meaningful part of a `0x30` report from a state snapshot.
///
/// With nothing pressed and both sticks centred this yields
/// `30 cc 81 00 80 00 00 08 80 00 08 80 00`.
pub fn build_input_report(counter: u8, state: &ButtonState) -> [u8; INPUT_REPORT_LEN] {
    let right = (state.y as u8)
        | (state.x as u8) << 1
        | (state.b as u8) << 2
        | (state.a as u8) << 3
        | (state.r as u8) << 6
        | (state.zr as u8) << 7;

    // bit 7 is always set by the grip the console expects
    let shared = (state.minus as u8)
        | (state.plus as u8) << 1
        | (state.home as u8) << 4
        | (state.capture as u8) << 5
        | 0x80;

    let dpad = (state.dpad.left as u8) << 3
        | (state.dpad.right as u8) << 2
        | (state.dpad.up as u8) << 1
        | (state.dpad.down as u8);
    let left = dpad | (state.l as u8) << 6 | (state.zl as u8) << 7;

    let [l0, l1, l2] = pack_stick(&state.left_stick);
    let [r0, r1, r2] = pack_stick(&state.right_stick);

    [
        INPUT_REPORT_ID,
        counter,
        BATTERY_STATUS,
        right,
        shared,
        left,
        l0,
        l1,
        l2,
        r0,
        r1,
        r2,
        0x00,
    ]
}

/// Packs a stick into two little-endian 12-bit values.
pub fn pack_stick(stick: &StickPosition) -> [u8; 3] {
    let x = axis_to_raw(stick.x);
    let y = axis_to_raw(stick.y);
    [
        (x & 0xff) as u8,
        ((x >> 8) as u8 & 0x0f) | ((y & 0x0f) as u8) << 4,
        (y >> 4) as u8,
    ]
}

fn axis_to_raw(value: f64) -> u16 {
    let value = if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    };
    (STICK_CENTER + value * STICK_RANGE).round() as u16
}

struct RunningEmitter {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Restartable producer of standard input reports
pub struct InputReporter {
    writer: ReportWriter,
    counter: SequenceCounter,
    buttons: watch::Receiver<ButtonState>,
    period: Duration,
    parent: CancellationToken,
    running: Mutex<Option<RunningEmitter>>,
}

impl InputReporter {
    pub fn new(
        writer: ReportWriter,
        counter: SequenceCounter,
        buttons: watch::Receiver<ButtonState>,
        period: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            writer,
            counter,
            buttons,
            period,
            parent,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|emitter| !emitter.cancel.is_cancelled() && !emitter.task.is_finished())
    }

    /// Starts emitting. A second start while running is ignored.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some(emitter) = running.as_ref() {
            if !emitter.cancel.is_cancelled() && !emitter.task.is_finished() {
                debug!("Input reports already running");
                return;
            }
        }

        if self.parent.is_cancelled() {
            warn!("Session is stopping, not starting input reports");
            return;
        }

        let cancel = self.parent.child_token();
        let task = tokio::spawn(run_emitter(
            self.writer.clone(),
            self.counter.clone(),
            self.buttons.clone(),
            self.period,
            cancel.clone(),
        ));
        info!("Input reports started ({:?} period)", self.period);
        *running = Some(RunningEmitter { cancel, task });
    }

    /// Stops emitting and waits for the task to exit. Stopping a stopped
    /// emitter is a no-op.
    pub async fn stop(&self) {
        let emitter = self.running.lock().await.take();
        match emitter {
            Some(emitter) => {
                emitter.cancel.cancel();
                if let Err(e) = emitter.task.await {
                    warn!("Input report task ended abnormally: {}", e);
                }
                info!("Input reports stopped");
            }
            None => debug!("Input reports not running"),
        }
    }
}

async fn run_emitter(
    writer: ReportWriter,
    counter: SequenceCounter,
    buttons: watch::Receiver<ButtonState>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let state = *buttons.borrow();
                let report = build_input_report(counter.get(), &state);
                if let Err(e) = writer.write(&report).await {
                    warn!("Failed to send input report: {}", e);
                }
            }
        }
    }
    debug!("Input report task finished");
}
