//! Switch Pro Controller emulation over a raw HID endpoint.
//!
//! The [`controller`] module is the protocol engine; [`config`] loads the
//! knobs the binary exposes.

pub mod config;
pub mod controller;
