//! Controller subsystem: Pro Controller wire protocol emulation
//!
//! Components, leaves first:
//!
//! 1. [`calibration`] - SPI flash image served to the host
//! 2. [`packet`] - 64-byte report framing and the serialized write path
//! 3. [`counter`] - wrapping sequence counter
//! 4. [`state`] / [`input_report`] - button state and the periodic `0x30` report
//! 5. [`dispatcher`] - host request decoding and replies
//! 6. [`session`] - lifecycle and task ownership
//!
//! # Architecture
//!
//! ```text
//! Host ──► read loop ──► Dispatcher ──► ReportWriter ──► Host
//!                          │   ▲            ▲
//!                 start/stop   │ counter    │
//!                          ▼   │            │
//!                     InputReporter ────────┘
//! ```

pub mod calibration;
pub mod counter;
pub mod dispatcher;
pub mod input_report;
pub mod packet;
pub mod session;
pub mod state;

pub use calibration::{CalibrationError, CalibrationStore};
pub use counter::SequenceCounter;
pub use dispatcher::{DeviceRequest, Dispatcher, ProtocolError, Request, Subcommand};
pub use input_report::InputReporter;
pub use packet::{BoxedWriter, PacketError, ReportWriter, REPORT_LEN};
pub use session::{
    BoxedReader, Connected, ControllerSession, Idle, SessionError, SessionSettings,
};
pub use state::{Button, ButtonHandle, ButtonState, Stick};
