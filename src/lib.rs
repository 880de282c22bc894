// Copyright (C) 2023, Alex Badics
// This file is part of joycon-ir-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Driver for the IR camera built into the right Joy-Con, talking to the
//! camera coprocessor ("MCU") over the controller's normal HID link.
//! See [`JoyCon`] for the main entry point.
//!
//! The driver takes the controller through the MCU bring-up handshake into
//! one of three camera modes ([`IrMode`]), programs the camera registers
//! ([`IrRegisters`]), and then runs a background reader thread that
//! reassembles IR image fragments and tracks bright-spot clusters
//! ([`IrCluster`]). Consumers poll [`JoyCon::latest_image`] /
//! [`JoyCon::latest_clusters`] or register an update hook that runs once per
//! received input report.

mod ir;
mod joycon;
mod util;

pub use crate::ir::{IrCluster, IrMode, IrRegisters, IrResolution};
pub use crate::joycon::{HidPipe, ImuCalibration, JoyCon, JoyConHandle};

/// Possible errors resulting from interacting with the controller
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// No device with the requested vendor/product/serial is connected
    NotFound,
    /// An id or parameter was rejected before touching the device
    InvalidArgument(&'static str),
    /// Error while talking to the device through hidapi
    HidError(hidapi::HidError),
    /// Other IO error (e.g. spawning the reader thread)
    IoError(std::io::Error),
    /// The MCU never produced IR data while arming the stream
    DeviceTimeout,
    /// A subcommand was never acknowledged with the expected reply contents
    CannotConfirm(u8),
    /// SPI flash read NACKed or echoed the wrong address
    SpiReadFailed(u32),
    /// The connection was torn down while an operation was in flight
    Disconnected(&'static str),
    /// A not-further-specified error, usually a protocol violation
    Other(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => f.write_str("no matching device found"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::HidError(e) => write!(f, "hid error: {e}"),
            Error::IoError(e) => write!(f, "io error: {e}"),
            Error::DeviceTimeout => f.write_str("no IR data received"),
            Error::CannotConfirm(sub) => write!(f, "cannot confirm subcommand {sub:02x}"),
            Error::SpiReadFailed(addr) => write!(f, "SPI read @ {addr:#06x} failed"),
            Error::Disconnected(what) => write!(f, "disconnected: {what}"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::HidError(e) => Some(e),
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<hidapi::HidError> for Error {
    fn from(e: hidapi::HidError) -> Self {
        Error::HidError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Convenience type for this crate's errors
pub type Result<T> = std::result::Result<T, Error>;
