//! Packet Codec - fixed-size report framing and the shared write path
//!
//! Every report leaving the controller goes through [`ReportWriter`]. The
//! transport handle sits behind a mutex so the read loop and both tickers
//! never interleave partial frames on the device.

use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Size of every HID report exchanged with the host
pub const REPORT_LEN: usize = 64;

/// Report id of the periodic standard input report
pub const INPUT_REPORT_ID: u8 = 0x30;

/// Write half of the device transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Payload of {0} bytes does not fit in a {REPORT_LEN}-byte report")]
    PayloadTooLong(usize),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Transport write failed: {0}")]
    Transport(#[from] std::io::Error),
}

/// Zero-pads `payload` into a full report.
pub fn encode(payload: &[u8]) -> Result<[u8; REPORT_LEN], PacketError> {
    if payload.is_empty() {
        return Err(PacketError::EmptyPayload);
    }
    if payload.len() > REPORT_LEN {
        return Err(PacketError::PayloadTooLong(payload.len()));
    }

    let mut frame = [0u8; REPORT_LEN];
    frame[..payload.len()].copy_from_slice(payload);
    Ok(frame)
}

/// Serialized writer shared by all producers of outbound reports
#[derive(Clone)]
pub struct ReportWriter {
    transport: Arc<Mutex<BoxedWriter>>,
    log_input_reports: bool,
}

impl fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportWriter")
            .field("log_input_reports", &self.log_input_reports)
            .finish_non_exhaustive()
    }
}

impl ReportWriter {
    pub fn new(transport: BoxedWriter, log_input_reports: bool) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            log_input_reports,
        }
    }

    /// Encodes and writes one report. One write is in flight at a time.
    pub async fn write(&self, payload: &[u8]) -> Result<(), PacketError> {
        let frame = encode(payload)?;

        {
            let mut transport = self.transport.lock().await;
            if let Err(e) = write_frame(&mut **transport, &frame).await {
                error!("write failed: {}", e);
                return Err(e.into());
            }
        }

        if frame[0] != INPUT_REPORT_ID || self.log_input_reports {
            debug!("write: {}", hex::encode(frame));
        }
        Ok(())
    }

    /// Flushes and closes the transport. Further writes fail with the
    /// transport's own error.
    pub async fn shutdown(&self) -> Result<(), PacketError> {
        let mut transport = self.transport.lock().await;
        transport.shutdown().await?;
        Ok(())
    }
}

async fn write_frame(
    transport: &mut (dyn AsyncWrite + Send + Unpin),
    frame: &[u8; REPORT_LEN],
) -> std::io::Result<()> {
    transport.write_all(frame).await?;
    transport.flush().await
}
