//! Subcommand Dispatcher - decodes host output reports and answers them
//!
//! Each inbound frame is decoded once into a [`Request`]; [`Dispatcher::handle`]
//! then matches on it exhaustively. Requests the controller has no answer for
//! are logged and dropped, the host retries or times out on its own.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::calibration::{CalibrationError, CalibrationStore};
use super::counter::SequenceCounter;
use super::input_report::{InputReporter, BATTERY_STATUS};
use super::packet::{PacketError, ReportWriter, REPORT_LEN};

/// Report id of device-management requests and replies
pub const DEVICE_REPORT_ID: u8 = 0x80;
/// Report id of UART subcommand requests
pub const SUBCOMMAND_REPORT_ID: u8 = 0x01;
/// Report id of UART subcommand replies
pub const SUBCOMMAND_REPLY_ID: u8 = 0x21;
/// Report id of device-management replies
pub const DEVICE_REPLY_ID: u8 = 0x81;

const SUBCOMMAND_ID_OFFSET: usize = 10;
const SPI_ARGS: std::ops::Range<usize> = 11..16;

/// Controller type byte reported in identity replies
const PRO_CONTROLLER: u8 = 0x03;

pub const ACK_EMPTY: u8 = 0x80;
pub const ACK_PAIRING: u8 = 0x81;
pub const ACK_DEVICE_INFO: u8 = 0x82;
pub const ACK_SPI_READ: u8 = 0x90;
pub const ACK_MCU_CONFIG: u8 = 0xa0;

const MCU_CONFIG_REPLY: [u8; 8] = [0x01, 0x00, 0xff, 0x00, 0x03, 0x00, 0x05, 0x01];

/// Default MAC placeholder, `00:00:5e:00:53:5e`
pub const DEFAULT_MAC: [u8; 6] = [0x00, 0x00, 0x5e, 0x00, 0x53, 0x5e];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame too short: report {report_id:#04x} needs {needed} bytes, got {got}")]
    ShortFrame {
        report_id: u8,
        needed: usize,
        got: usize,
    },

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unknown report id {0:#04x}")]
    UnknownReport(u8),

    #[error("Unknown device request {0:#04x}")]
    UnknownDeviceRequest(u8),

    #[error("Unknown UART subcommand {0:#04x}")]
    UnknownSubcommand(u8),

    #[error("SPI read rejected: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Failed to send reply: {0}")]
    Reply(#[from] PacketError),
}

/// Device-management requests (`0x80` class)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    /// `0x01`: identify, answered with controller type and MAC
    Status,
    /// `0x02`: handshake, echoed
    Handshake,
    /// `0x03`: baud rate switch, echoed
    HighSpeed,
    /// `0x04`: start standard input reports
    EnableReports,
    /// `0x05`: stop standard input reports
    DisableReports,
    Unknown(u8),
}

impl DeviceRequest {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Status,
            0x02 => Self::Handshake,
            0x03 => Self::HighSpeed,
            0x04 => Self::EnableReports,
            0x05 => Self::DisableReports,
            other => Self::Unknown(other),
        }
    }

    fn byte(&self) -> u8 {
        match self {
            Self::Status => 0x01,
            Self::Handshake => 0x02,
            Self::HighSpeed => 0x03,
            Self::EnableReports => 0x04,
            Self::DisableReports => 0x05,
            Self::Unknown(other) => *other,
        }
    }
}

/// SPI flash read arguments as carried in a `0x10` subcommand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRead {
    /// Request bytes 11..16, echoed at the head of the reply
    pub args: [u8; 5],
}

impl SpiRead {
    pub fn offset(&self) -> u8 {
        self.args[0]
    }

    pub fn page(&self) -> u8 {
        self.args[1]
    }

    pub fn length(&self) -> u8 {
        self.args[4]
    }
}

/// UART subcommands (`0x01` class)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    /// `0x01`: Bluetooth manual pairing
    ManualPairing,
    /// `0x02`: request device info
    DeviceInfo,
    /// `0x03`, `0x08`, `0x30`, `0x38`, `0x40`, `0x41`, `0x48`: mode changes
    /// and lights, acknowledged without payload
    SetMode(u8),
    /// `0x04`: trigger buttons elapsed time
    TriggerElapsed,
    /// `0x10`: read SPI flash
    SpiRead(SpiRead),
    /// `0x21`: set NFC/IR MCU configuration
    McuConfig,
    Unknown(u8),
}

impl Subcommand {
    pub fn id(&self) -> u8 {
        match self {
            Self::ManualPairing => 0x01,
            Self::DeviceInfo => 0x02,
            Self::SetMode(id) => *id,
            Self::TriggerElapsed => 0x04,
            Self::SpiRead(_) => 0x10,
            Self::McuConfig => 0x21,
            Self::Unknown(id) => *id,
        }
    }
}

/// One decoded host output report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Device(DeviceRequest),
    Subcommand(Subcommand),
    /// `0x00` and `0x10` (rumble only), never answered
    Ignored(u8),
    Unknown(u8),
}

impl Request {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let report_id = *frame.first().ok_or(ProtocolError::EmptyFrame)?;

        match report_id {
            DEVICE_REPORT_ID => {
                require_len(frame, 2)?;
                Ok(Self::Device(DeviceRequest::from_byte(frame[1])))
            }
            SUBCOMMAND_REPORT_ID => {
                require_len(frame, SUBCOMMAND_ID_OFFSET + 1)?;
                let id = frame[SUBCOMMAND_ID_OFFSET];
                let subcommand = match id {
                    0x01 => Subcommand::ManualPairing,
                    0x02 => Subcommand::DeviceInfo,
                    0x03 | 0x08 | 0x30 | 0x38 | 0x40 | 0x41 | 0x48 => Subcommand::SetMode(id),
                    0x04 => Subcommand::TriggerElapsed,
                    0x10 => {
                        require_len(frame, SPI_ARGS.end)?;
                        let mut args = [0u8; 5];
                        args.copy_from_slice(&frame[SPI_ARGS]);
                        Subcommand::SpiRead(SpiRead { args })
                    }
                    0x21 => Subcommand::McuConfig,
                    other => Subcommand::Unknown(other),
                };
                Ok(Self::Subcommand(subcommand))
            }
            0x00 | 0x10 => Ok(Self::Ignored(report_id)),
            other => Ok(Self::Unknown(other)),
        }
    }
}

fn require_len(frame: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if frame.len() < needed {
        return Err(ProtocolError::ShortFrame {
            report_id: frame[0],
            needed,
            got: frame.len(),
        });
    }
    Ok(())
}

/// Builds a UART reply: fixed status header, ack code, subcommand id, payload.
pub fn build_uart_reply(
    counter: u8,
    ack: u8,
    subcommand: u8,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let mut reply = Vec::with_capacity(REPORT_LEN);
    reply.extend_from_slice(&[
        SUBCOMMAND_REPLY_ID,
        counter,
        BATTERY_STATUS,
        0x00,
        0x80,
        0x00,
        0x00,
        0x08,
        0x80,
        0x00,
        0x08,
        0x80,
        0x00,
        ack,
        subcommand,
    ]);
    reply.extend_from_slice(payload);
    if reply.len() > REPORT_LEN {
        return Err(PacketError::PayloadTooLong(reply.len()));
    }
    Ok(reply)
}

/// Routes decoded requests to their replies
pub struct Dispatcher {
    writer: ReportWriter,
    counter: SequenceCounter,
    calibration: CalibrationStore,
    reporter: Arc<InputReporter>,
    mac: [u8; 6],
}

impl Dispatcher {
    pub fn new(
        writer: ReportWriter,
        counter: SequenceCounter,
        calibration: CalibrationStore,
        reporter: Arc<InputReporter>,
        mac: [u8; 6],
    ) -> Self {
        Self {
            writer,
            counter,
            calibration,
            reporter,
            mac,
        }
    }

    /// Decodes and answers one inbound frame. Protocol errors are logged and
    /// swallowed; the session carries on.
    pub async fn dispatch(&self, frame: &[u8]) {
        let result = match Request::decode(frame) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("{} (frame: {})", e, hex::encode(frame));
        }
    }

    pub async fn handle(&self, request: Request) -> Result<(), ProtocolError> {
        match request {
            Request::Device(device) => self.handle_device(device).await,
            Request::Subcommand(subcommand) => self.handle_subcommand(subcommand).await,
            Request::Ignored(report_id) => {
                debug!("Ignoring report {:#04x}", report_id);
                Ok(())
            }
            Request::Unknown(report_id) => Err(ProtocolError::UnknownReport(report_id)),
        }
    }

    async fn handle_device(&self, request: DeviceRequest) -> Result<(), ProtocolError> {
        match request {
            DeviceRequest::Status => {
                let mut reply = vec![DEVICE_REPLY_ID, request.byte(), 0x00, PRO_CONTROLLER];
                reply.extend_from_slice(&self.mac);
                self.writer.write(&reply).await?;
            }
            DeviceRequest::Handshake | DeviceRequest::HighSpeed => {
                self.writer.write(&[DEVICE_REPLY_ID, request.byte()]).await?;
            }
            DeviceRequest::EnableReports => self.reporter.start().await,
            DeviceRequest::DisableReports => self.reporter.stop().await,
            DeviceRequest::Unknown(byte) => return Err(ProtocolError::UnknownDeviceRequest(byte)),
        }
        Ok(())
    }

    async fn handle_subcommand(&self, subcommand: Subcommand) -> Result<(), ProtocolError> {
        let id = subcommand.id();
        match subcommand {
            Subcommand::ManualPairing => self.uart(ACK_PAIRING, id, &[0x03, 0x01]).await,
            Subcommand::DeviceInfo => {
                let payload = self.device_info();
                self.uart(ACK_DEVICE_INFO, id, &payload).await
            }
            Subcommand::SetMode(_) | Subcommand::TriggerElapsed => {
                self.uart(ACK_EMPTY, id, &[]).await
            }
            Subcommand::SpiRead(read) => {
                let data = self
                    .calibration
                    .read(read.page(), read.offset(), read.length())?;
                info!(
                    "Read SPI address: {:02x}{:02x}[{}] {}",
                    read.page(),
                    read.offset(),
                    read.length(),
                    hex::encode(data)
                );

                let mut payload = Vec::with_capacity(read.args.len() + data.len());
                payload.extend_from_slice(&read.args);
                payload.extend_from_slice(data);
                self.uart(ACK_SPI_READ, id, &payload).await
            }
            Subcommand::McuConfig => self.uart(ACK_MCU_CONFIG, id, &MCU_CONFIG_REPLY).await,
            Subcommand::Unknown(id) => Err(ProtocolError::UnknownSubcommand(id)),
        }
    }

    /// Firmware 3.48, Pro Controller, MAC in reverse byte order, colours from SPI
    fn device_info(&self) -> [u8; 12] {
        let mut info = [0x03, 0x48, PRO_CONTROLLER, 0x02, 0, 0, 0, 0, 0, 0, 0x03, 0x01];
        for (slot, byte) in info[4..10].iter_mut().zip(self.mac.iter().rev()) {
            *slot = *byte;
        }
        info
    }

    async fn uart(&self, ack: u8, subcommand: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let reply = build_uart_reply(self.counter.get(), ack, subcommand, payload)?;
        self.writer.write(&reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    use crate::controller::state::ButtonHandle;

    fn subcommand_frame(id: u8) -> [u8; REPORT_LEN] {
        let mut frame = [0u8; REPORT_LEN];
        frame[0] = SUBCOMMAND_REPORT_ID;
        frame[10] = id;
        frame
    }

    fn spi_frame(page: u8, offset: u8, length: u8) -> [u8; REPORT_LEN] {
        let mut frame = subcommand_frame(0x10);
        frame[11] = offset;
        frame[12] = page;
        frame[15] = length;
        frame
    }

    fn dispatcher() -> (Dispatcher, DuplexStream) {
        let (device, host) = tokio::io::duplex(64 * 1024);
        let writer = ReportWriter::new(Box::new(device), false);
        let counter = SequenceCounter::new();
        let reporter = Arc::new(InputReporter::new(
            writer.clone(),
            counter.clone(),
            ButtonHandle::new().subscribe(),
            Duration::from_millis(30),
            CancellationToken::new(),
        ));
        let dispatcher = Dispatcher::new(
            writer,
            counter,
            CalibrationStore::new(),
            reporter,
            DEFAULT_MAC,
        );
        (dispatcher, host)
    }

    async fn next_frame(host: &mut DuplexStream) -> [u8; REPORT_LEN] {
        let mut frame = [0u8; REPORT_LEN];
        host.read_exact(&mut frame).await.unwrap();
        frame
    }

    async fn assert_silent(host: &mut DuplexStream) {
        let mut frame = [0u8; REPORT_LEN];
        let read = tokio::time::timeout(Duration::from_millis(50), host.read(&mut frame)).await;
        assert!(read.is_err(), "unexpected reply: {:02x?}", frame);
    }

    #[test]
    fn decode_device_requests() {
        assert_eq!(
            Request::decode(&[0x80, 0x01]).unwrap(),
            Request::Device(DeviceRequest::Status)
        );
        assert_eq!(
            Request::decode(&[0x80, 0x05]).unwrap(),
            Request::Device(DeviceRequest::DisableReports)
        );
        assert_eq!(
            Request::decode(&[0x80, 0x7f]).unwrap(),
            Request::Device(DeviceRequest::Unknown(0x7f))
        );
    }

    #[test]
    fn decode_subcommands() {
        for id in [0x03, 0x08, 0x30, 0x38, 0x40, 0x41, 0x48] {
            assert_eq!(
                Request::decode(&subcommand_frame(id)).unwrap(),
                Request::Subcommand(Subcommand::SetMode(id))
            );
        }
        assert_eq!(
            Request::decode(&subcommand_frame(0x04)).unwrap(),
            Request::Subcommand(Subcommand::TriggerElapsed)
        );
        assert_eq!(
            Request::decode(&spi_frame(0x60, 0x3d, 0x12)).unwrap(),
            Request::Subcommand(Subcommand::SpiRead(SpiRead {
                args: [0x3d, 0x60, 0x00, 0x00, 0x12]
            }))
        );
        assert_eq!(
            Request::decode(&subcommand_frame(0x22)).unwrap(),
            Request::Subcommand(Subcommand::Unknown(0x22))
        );
    }

    #[test]
    fn decode_other_reports() {
        assert_eq!(Request::decode(&[0x00]).unwrap(), Request::Ignored(0x00));
        assert_eq!(Request::decode(&[0x10, 0x01]).unwrap(), Request::Ignored(0x10));
        assert_eq!(Request::decode(&[0x42]).unwrap(), Request::Unknown(0x42));
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert!(matches!(Request::decode(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(
            Request::decode(&[0x80]),
            Err(ProtocolError::ShortFrame { needed: 2, got: 1, .. })
        ));
        assert!(matches!(
            Request::decode(&[0x01, 0, 0, 0]),
            Err(ProtocolError::ShortFrame { needed: 11, .. })
        ));
        assert!(matches!(
            Request::decode(&subcommand_frame(0x10)[..12]),
            Err(ProtocolError::ShortFrame { needed: 16, .. })
        ));
    }

    #[test]
    fn uart_reply_layout() {
        let reply = build_uart_reply(0x07, ACK_PAIRING, 0x01, &[0x03, 0x01]).unwrap();
        assert_eq!(
            reply,
            vec![
                0x21, 0x07, 0x81, 0x00, 0x80, 0x00, 0x00, 0x08, 0x80, 0x00, 0x08, 0x80, 0x00,
                0x81, 0x01, 0x03, 0x01
            ]
        );
    }

    #[test]
    fn uart_reply_rejects_oversized_payload() {
        assert!(build_uart_reply(0, ACK_SPI_READ, 0x10, &[0u8; 50]).is_err());
    }

    #[tokio::test]
    async fn status_reply() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&[0x80, 0x01]).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(
            &frame[..10],
            &[0x81, 0x01, 0x00, 0x03, 0x00, 0x00, 0x5e, 0x00, 0x53, 0x5e]
        );
        assert!(frame[10..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn handshake_is_echoed() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&[0x80, 0x02]).await;
        assert_eq!(&next_frame(&mut host).await[..3], &[0x81, 0x02, 0x00]);
        dispatcher.dispatch(&[0x80, 0x03]).await;
        assert_eq!(&next_frame(&mut host).await[..3], &[0x81, 0x03, 0x00]);
    }

    #[tokio::test]
    async fn device_info_reply() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&subcommand_frame(0x02)).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(frame[0], SUBCOMMAND_REPLY_ID);
        assert_eq!(frame[13], ACK_DEVICE_INFO);
        assert_eq!(frame[14], 0x02);
        assert_eq!(
            &frame[15..27],
            &[0x03, 0x48, 0x03, 0x02, 0x5e, 0x53, 0x00, 0x5e, 0x00, 0x00, 0x03, 0x01]
        );
    }

    #[tokio::test]
    async fn empty_acks() {
        let (dispatcher, mut host) = dispatcher();
        for id in [0x03, 0x04, 0x08, 0x30, 0x38, 0x40, 0x41, 0x48] {
            dispatcher.dispatch(&subcommand_frame(id)).await;
            let frame = next_frame(&mut host).await;
            assert_eq!(frame[13], ACK_EMPTY);
            assert_eq!(frame[14], id);
            assert!(frame[15..].iter().all(|b| *b == 0));
        }
    }

    #[tokio::test]
    async fn pairing_and_mcu_replies() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&subcommand_frame(0x01)).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(&frame[13..17], &[ACK_PAIRING, 0x01, 0x03, 0x01]);

        dispatcher.dispatch(&subcommand_frame(0x21)).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(&frame[13..15], &[ACK_MCU_CONFIG, 0x21]);
        assert_eq!(&frame[15..23], &MCU_CONFIG_REPLY);
    }

    #[tokio::test]
    async fn spi_read_reply() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&spi_frame(0x60, 0x00, 0x10)).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(&frame[13..15], &[ACK_SPI_READ, 0x10]);
        assert_eq!(&frame[15..20], &[0x00, 0x60, 0x00, 0x00, 0x10]);
        assert_eq!(&frame[20..36], &[0xff; 16]);
        assert!(frame[36..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn spi_read_colours() {
        let (dispatcher, mut host) = dispatcher();
        dispatcher.dispatch(&spi_frame(0x60, 0x50, 0x0d)).await;
        let frame = next_frame(&mut host).await;
        assert_eq!(&frame[15..20], &[0x50, 0x60, 0x00, 0x00, 0x0d]);
        assert_eq!(&frame[20..23], &[0x32, 0x32, 0x32]);
    }

    #[tokio::test]
    async fn unknown_page_gets_no_reply() {
        let (dispatcher, mut host) = dispatcher();
        let result = dispatcher
            .handle(Request::decode(&spi_frame(0x99, 0x00, 0x10)).unwrap())
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Calibration(CalibrationError::UnknownPage { page: 0x99 }))
        ));
        assert_silent(&mut host).await;
    }

    #[tokio::test]
    async fn out_of_bounds_read_gets_no_reply() {
        let (dispatcher, mut host) = dispatcher();
        let result = dispatcher
            .handle(Request::decode(&spi_frame(0x80, 0x30, 0x20)).unwrap())
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Calibration(CalibrationError::OutOfBounds { .. }))
        ));
        assert_silent(&mut host).await;
    }

    #[tokio::test]
    async fn spi_reply_too_long_for_report() {
        let (dispatcher, mut host) = dispatcher();
        let result = dispatcher
            .handle(Request::decode(&spi_frame(0x60, 0x00, 0x30)).unwrap())
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Reply(PacketError::PayloadTooLong(_)))
        ));
        assert_silent(&mut host).await;
    }

    #[tokio::test]
    async fn unknown_requests_get_no_reply() {
        let (dispatcher, mut host) = dispatcher();
        assert!(matches!(
            dispatcher.handle(Request::Unknown(0x42)).await,
            Err(ProtocolError::UnknownReport(0x42))
        ));
        assert!(matches!(
            dispatcher.handle(Request::Subcommand(Subcommand::Unknown(0x22))).await,
            Err(ProtocolError::UnknownSubcommand(0x22))
        ));
        assert!(dispatcher.handle(Request::Ignored(0x10)).await.is_ok());
        dispatcher.dispatch(&[0x80]).await;
        assert_silent(&mut host).await;
    }

    #[tokio::test]
    async fn custom_mac_in_identity_replies() {
        let (device, mut host) = tokio::io::duplex(64 * 1024);
        let writer = ReportWriter::new(Box::new(device), false);
        let counter = SequenceCounter::new();
        let reporter = Arc::new(InputReporter::new(
            writer.clone(),
            counter.clone(),
            ButtonHandle::new().subscribe(),
            Duration::from_millis(30),
            CancellationToken::new(),
        ));
        let mac = [0x98, 0xb6, 0xe9, 0x46, 0x50, 0x6a];
        let dispatcher = Dispatcher::new(writer, counter, CalibrationStore::new(), reporter, mac);

        dispatcher.dispatch(&[0x80, 0x01]).await;
        assert_eq!(&next_frame(&mut host).await[4..10], &mac);

        dispatcher.dispatch(&subcommand_frame(0x02)).await;
        assert_eq!(
            &next_frame(&mut host).await[19..25],
            &[0x6a, 0x50, 0x46, 0xe9, 0xb6, 0x98]
        );
    }
}
