//! Calibration Store - read-only SPI flash image
//!
//! The host reads factory data (body colours, stick calibration, IMU
//! constants, serial markers) through the `0x10` subcommand. Only the two
//! pages the console actually asks for are populated; the byte content has to
//! match a real controller or the console rejects the device.

use std::collections::HashMap;
use tracing::debug;

/// Factory page: serial, IMU calibration, stick parameters, body colours
pub const FACTORY_PAGE: u8 = 0x60;

/// User page: user calibration markers (all unset)
pub const USER_PAGE: u8 = 0x80;

#[rustfmt::skip]
const FACTORY_BLOCK: [u8; 0xb0] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0x03, 0xa0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02, 0xff, 0xff, 0xff, 0xff,
    0xf0, 0xff, 0x89, 0x00, 0xf0, 0x01, 0x00, 0x40, 0x00, 0x40, 0x00, 0x40, 0xf9, 0xff, 0x06, 0x00,
    0x09, 0x00, 0xe7, 0x3b, 0xe7, 0x3b, 0xe7, 0x3b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xba, 0x15, 0x62,
    0x11, 0xb8, 0x7f, 0x29, 0x06, 0x5b, 0xff, 0xe7, 0x7e, 0x0e, 0x36, 0x56, 0x9e, 0x85, 0x60, 0xff,
    0x32, 0x32, 0x32, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x50, 0xfd, 0x00, 0x00, 0xc6, 0x0f, 0x0f, 0x30, 0x61, 0x96, 0x30, 0xf3, 0xd4, 0x14, 0x54, 0x41,
    0x15, 0x54, 0xc7, 0x79, 0x9c, 0x33, 0x36, 0x63, 0x0f, 0x30, 0x61, 0x96, 0x30, 0xf3, 0xd4, 0x14,
    0x54, 0x41, 0x15, 0x54, 0xc7, 0x79, 0x9c, 0x33, 0x36, 0x63, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

#[rustfmt::skip]
const USER_BLOCK: [u8; 0x40] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xb2, 0xa1, 0xbe, 0xff, 0x3e, 0x00, 0xf0, 0x01, 0x00, 0x40,
    0x00, 0x40, 0x00, 0x40, 0xfe, 0xff, 0xfe, 0xff, 0x08, 0x00, 0xe7, 0x3b, 0xe7, 0x3b, 0xe7, 0x3b,
];

/// Errors returned by calibration memory reads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Unknown SPI page: {page:#04x}")]
    UnknownPage { page: u8 },

    #[error("SPI read out of bounds: page {page:#04x} offset {offset:#04x} length {length} exceeds block of {block_len} bytes")]
    OutOfBounds {
        page: u8,
        offset: u8,
        length: u8,
        block_len: usize,
    },
}

/// Immutable page table answering `(page, offset, length)` reads
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    pages: HashMap<u8, &'static [u8]>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationStore {
    pub fn new() -> Self {
        let mut pages: HashMap<u8, &'static [u8]> = HashMap::new();
        pages.insert(FACTORY_PAGE, &FACTORY_BLOCK);
        pages.insert(USER_PAGE, &USER_BLOCK);
        debug!("Calibration store loaded with {} pages", pages.len());
        Self { pages }
    }

    /// Returns `length` bytes of `page` starting at `offset`.
    ///
    /// A range reaching past the end of the block is an error rather than a
    /// short read, so a host asking for something we do not model shows up
    /// in the logs instead of getting a truncated answer.
    pub fn read(&self, page: u8, offset: u8, length: u8) -> Result<&[u8], CalibrationError> {
        let block = self
            .pages
            .get(&page)
            .ok_or(CalibrationError::UnknownPage { page })?;

        let start = offset as usize;
        let end = start + length as usize;
        if end > block.len() {
            return Err(CalibrationError::OutOfBounds {
                page,
                offset,
                length,
                block_len: block.len(),
            });
        }

        Ok(&block[start..end])
    }
}
