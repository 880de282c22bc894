// Copyright (C) 2023, Alex Badics
// This file is part of joycon-ir-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Joy-Con driver core. See [`JoyCon`].
//!
//! Construction performs the full MCU bring-up handshake on the calling
//! thread, then hands the HID pipe to a background reader thread that keeps
//! [`JoyCon::latest_image`] / [`JoyCon::latest_clusters`] fresh and drives
//! the IR fragment acknowledge loop.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use hidapi::HidDevice;
use log::{debug, trace, warn};

use crate::{
    ir::{self, IrCluster, IrMode, IrRegisters, IrResolution, RegisterTriple},
    util, Error, Result,
};

const OUTPUT_REPORT_LEN: usize = 49;
const INPUT_REPORT_LEN: usize = 360;
const IR_FRAGMENT_LEN: usize = 300;

// Outbound report ids
const REPORT_SUBCOMMAND: u8 = 0x01;
const REPORT_MCU_REQUEST: u8 = 0x11;
// Inbound report ids
const REPORT_SUBCOMMAND_REPLY: u8 = 0x21;
const REPORT_STANDARD_INPUT: u8 = 0x30;
const REPORT_STANDARD_IR: u8 = 0x31;
// 0x3F (simple mode) also exists, but this driver never selects it.

const SUBCMD_SET_INPUT_REPORT_MODE: u8 = 0x03;
const SUBCMD_SET_HCI_STATE: u8 = 0x06;
const SUBCMD_SPI_FLASH_READ: u8 = 0x10;
const SUBCMD_SET_MCU_CONFIG: u8 = 0x21;
const SUBCMD_SET_MCU_STATE: u8 = 0x22;
const SUBCMD_SET_PLAYER_LIGHTS: u8 = 0x30;
const SUBCMD_ENABLE_IMU: u8 = 0x40;

const MCU_SUBCMD_STATUS: u8 = 0x01;
const MCU_SUBCMD_IR_DATA: u8 = 0x03;

// Values of report byte 49 in MCU-originated input reports
const MCU_STATE_STATUS: u8 = 0x01;
const MCU_STATE_IR_DATA: u8 = 0x03;
const MCU_STATE_REGISTERS: u8 = 0x1B;

// The device wants the 8-byte rumble field in every output report, even when
// it is not vibrating.
const RUMBLE_NEUTRAL: [u8; 8] = [0x00, 0x01, 0x40, 0x40, 0x00, 0x01, 0x40, 0x40];

const CONFIRM_RETRIES: usize = 16;
const ARM_RETRIES: usize = 500;
const SPI_READ_MAX: u8 = 0x1D;

const COMMAND_TIMEOUT_MS: i32 = 1000;
const READER_TIMEOUT_MS: i32 = 250;
const SETTINGS_DELAY: Duration = Duration::from_millis(20);

type OutputReport = [u8; OUTPUT_REPORT_LEN];
type InputReport = [u8; INPUT_REPORT_LEN];
type UpdateHook = Box<dyn Fn(&JoyConHandle<'_>) + Send + Sync>;

/// The blocking HID byte pipe the driver talks through.
///
/// Implemented for [`hidapi::HidDevice`]; tests and exotic transports can
/// substitute their own. Implementations must tolerate `write` and
/// `read_timeout` being called from different threads.
pub trait HidPipe: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Reads one report into `buf`, returning 0 on timeout.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

impl HidPipe for HidDevice {
    fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(HidDevice::write(self, data)?)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        Ok(HidDevice::read_timeout(self, buf, timeout_ms)?)
    }
}

/// CRC8 trailer description of an output report: the checksum over
/// `[start, start + length)` is stored at `location`.
#[derive(Debug, Clone, Copy)]
struct CrcField {
    location: usize,
    start: usize,
    length: usize,
}

/// `01 21` MCU configuration commands
const CRC_SUBCOMMAND: CrcField = CrcField {
    location: 48,
    start: 12,
    length: 36,
};
/// `11 03` MCU requests
const CRC_MCU_REQUEST: CrcField = CrcField {
    location: 47,
    start: 11,
    length: 36,
};

fn build_output_report(
    command: u8,
    packet_number: u8,
    subcommand: u8,
    argument: &[u8],
    crc: Option<CrcField>,
) -> OutputReport {
    let mut data = Vec::with_capacity(OUTPUT_REPORT_LEN);
    data.push(command);
    data.push(packet_number);
    data.extend_from_slice(&RUMBLE_NEUTRAL);
    data.push(subcommand);
    data.extend_from_slice(argument);
    if let Some(crc) = crc {
        if data.len() < crc.location {
            data.resize(crc.location, 0);
        }
        let sum = util::crc8(&data[crc.start..crc.start + crc.length]);
        if data.len() == crc.location {
            data.push(sum);
        } else {
            data[crc.location] = sum;
        }
    }
    let mut report = [0u8; OUTPUT_REPORT_LEN];
    let len = data.len().min(OUTPUT_REPORT_LEN);
    report[..len].copy_from_slice(&data[..len]);
    report
}

/// IR stream parameters fixed at bring-up time.
#[derive(Debug, Clone, Copy)]
struct IrStream {
    mode: IrMode,
    /// Index of the last fragment of a frame; 1 in the single-fragment modes.
    highest_fragment: u8,
}

/// State shared between the owning [`JoyCon`] and its reader thread.
struct Shared {
    pipe: Box<dyn HidPipe>,
    packet_number: AtomicU8,
    ir: Option<IrStream>,
    /// Set when the owning [`JoyCon`] is dropped; transport operations still
    /// in flight on the reader thread fail with [`Error::Disconnected`].
    closed: AtomicBool,
    latest_report: Mutex<InputReport>,
    latest_image: Mutex<Option<Vec<u8>>>,
    hooks: RwLock<Vec<UpdateHook>>,
}

impl Shared {
    fn new(pipe: Box<dyn HidPipe>, ir: Option<IrStream>) -> Self {
        Shared {
            pipe,
            packet_number: AtomicU8::new(0),
            ir,
            closed: AtomicBool::new(false),
            latest_report: Mutex::new([0; INPUT_REPORT_LEN]),
            latest_image: Mutex::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Disconnected("Joy-Con handle dropped"));
        }
        Ok(())
    }

    fn next_packet_number(&self) -> u8 {
        // The counter wraps at 256, which is a multiple of 16, so masking
        // keeps the modulo-16 cycle continuous.
        self.packet_number.fetch_add(1, Ordering::Relaxed) & 0x0F
    }

    fn read_input_report(&self, timeout_ms: i32) -> Result<Option<InputReport>> {
        self.ensure_open()?;
        let mut report = [0u8; INPUT_REPORT_LEN];
        let len = self.pipe.read_timeout(&mut report, timeout_ms)?;
        if len == 0 {
            return Ok(None);
        }
        trace!("< {:02x?}", &report[..len]);
        Ok(Some(report))
    }

    /// Writes one output report, and when `confirm` is given, polls input
    /// reports until one matches every `(position, value)` pair.
    ///
    /// Unrelated input reports (the controller keeps streaming `0x30`s while
    /// we talk to it) are polled through without penalty. A report of the
    /// expected family (the position-0 pair matches) with wrong contents
    /// aborts the poll and resends instead. Both loops are bounded; running
    /// out means [`Error::CannotConfirm`].
    fn write_output_report(
        &self,
        command: u8,
        subcommand: u8,
        argument: &[u8],
        crc: Option<CrcField>,
        confirm: Option<&[(usize, u8)]>,
    ) -> Result<Option<InputReport>> {
        self.ensure_open()?;
        for _ in 0..CONFIRM_RETRIES {
            let report = build_output_report(
                command,
                self.next_packet_number(),
                subcommand,
                argument,
                crc,
            );
            trace!("> {:02x?}", &report[..]);
            self.pipe.write(&report)?;

            let Some(confirm) = confirm else {
                return Ok(None);
            };
            let mut polls = CONFIRM_RETRIES;
            while polls > 0 {
                let Some(reply) = self.read_input_report(COMMAND_TIMEOUT_MS)? else {
                    polls -= 1;
                    continue;
                };
                let mut right_family = false;
                let mut matched = true;
                for &(position, value) in confirm {
                    if position == 0 && reply[0] == value {
                        right_family = true;
                    } else if reply[position] != value {
                        matched = false;
                        break;
                    }
                }
                if matched {
                    return Ok(Some(reply));
                }
                if right_family {
                    break;
                }
                polls -= 1;
            }
        }
        Err(Error::CannotConfirm(subcommand))
    }

    /// Asks the MCU for the next IR report. The acknowledge value is the
    /// fragment index we just consumed; 0 also doubles as "resync from the
    /// first fragment".
    fn request_ir_report(&self, fragment_ack: u8) -> Result<()> {
        let mut argument = [0u8; 38];
        argument[3] = fragment_ack;
        argument[37] = 0xFF;
        self.write_output_report(
            REPORT_MCU_REQUEST,
            MCU_SUBCMD_IR_DATA,
            &argument,
            Some(CRC_MCU_REQUEST),
            None,
        )?;
        Ok(())
    }

    fn set_mcu_registers(&self, group: &[RegisterTriple]) -> Result<()> {
        if group.len() > ir::REGISTER_GROUP_LEN {
            return Err(Error::InvalidArgument("too many register writes for one command"));
        }
        let mut argument = [0u8; 3 + 3 * ir::REGISTER_GROUP_LEN];
        argument[0] = 0x23;
        argument[1] = 0x04;
        argument[2] = group.len() as u8;
        for (i, &(page, register, value)) in group.iter().enumerate() {
            argument[3 + 3 * i] = page;
            argument[4 + 3 * i] = register;
            argument[5 + 3 * i] = value;
        }
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_MCU_CONFIG,
            &argument,
            Some(CRC_SUBCOMMAND),
            Some(&[(0, REPORT_SUBCOMMAND_REPLY), (14, SUBCMD_SET_MCU_CONFIG)]),
        )?;
        Ok(())
    }

    fn write_ir_registers(&self, registers: &IrRegisters) -> Result<()> {
        for group in ir::register_batches(&registers.triples()) {
            self.set_mcu_registers(&group)?;
        }
        Ok(())
    }

    /// Reads the raw contents of one MCU register page.
    fn get_mcu_registers(&self, page: u8) -> Result<Vec<u8>> {
        let argument = [0x03, 0x01, page, 0x00, 0x7F];
        let report = self
            .write_output_report(
                REPORT_MCU_REQUEST,
                MCU_SUBCMD_IR_DATA,
                &argument,
                Some(CRC_MCU_REQUEST),
                Some(&[(49, MCU_STATE_REGISTERS), (51, page), (52, 0x00)]),
            )?
            .ok_or(Error::Other("register read returned no report"))?;
        let count = report[52] as usize + report[53] as usize;
        Ok(report[54..54 + count].to_vec())
    }

    /// Sends an ordinary subcommand and waits for its `0x21` reply, returning
    /// the acknowledge flag and the raw reply.
    fn send_subcommand(&self, subcommand: u8, argument: &[u8]) -> Result<(bool, InputReport)> {
        self.write_output_report(REPORT_SUBCOMMAND, subcommand, argument, None, None)?;
        for _ in 0..CONFIRM_RETRIES {
            if let Some(report) = self.read_input_report(COMMAND_TIMEOUT_MS)? {
                if report[0] == REPORT_SUBCOMMAND_REPLY {
                    return Ok((report[13] & 0x80 != 0, report));
                }
            }
        }
        Err(Error::Other("no subcommand reply received"))
    }

    fn spi_flash_read(&self, address: u32, size: u8) -> Result<Vec<u8>> {
        if size > SPI_READ_MAX {
            return Err(Error::InvalidArgument("SPI read too large"));
        }
        let mut argument = [0u8; 5];
        LittleEndian::write_u32(&mut argument[..4], address);
        argument[4] = size;
        let (ack, report) = match self.send_subcommand(SUBCMD_SPI_FLASH_READ, &argument) {
            Ok(reply) => reply,
            // Running out of polls without any 0x21 reply is a failed read;
            // transport errors keep their own kind.
            Err(Error::Other(_)) => return Err(Error::SpiReadFailed(address)),
            Err(e) => return Err(e),
        };
        // The reply must echo `90 10 <addr> <size>` before the payload; byte
        // 13 carries the ack bit and the reply-type nibble together.
        if !ack
            || report[13] != 0x90
            || report[14] != SUBCMD_SPI_FLASH_READ
            || report[15..20] != argument
        {
            return Err(Error::SpiReadFailed(address));
        }
        Ok(report[20..20 + size as usize].to_vec())
    }

    /// Reads the factory/user calibration blobs from SPI flash.
    fn read_calibration(&self) -> Result<((u8, u8, u8), (u8, u8, u8), ImuCalibration)> {
        let colors = self.spi_flash_read(0x6050, 6)?;
        let imu = if self.spi_flash_read(0x8026, 2)? == [0xB2, 0xA1] {
            // Tag set: the user re-calibrated the IMU at some point
            self.spi_flash_read(0x8028, 24)?
        } else {
            self.spi_flash_read(0x6020, 24)?
        };
        Ok((
            (colors[0], colors[1], colors[2]),
            (colors[3], colors[4], colors[5]),
            ImuCalibration::parse(&imu),
        ))
    }

    fn set_report_type(&self, report_type: u8) -> Result<()> {
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_INPUT_REPORT_MODE,
            &[report_type],
            None,
            Some(&[(0x0D, 0x80), (0x0E, SUBCMD_SET_INPUT_REPORT_MODE)]),
        )?;
        Ok(())
    }

    fn disable_ir_mode(&self) -> Result<()> {
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_MCU_CONFIG,
            &[0x23, 0x01, 0x02],
            Some(CRC_SUBCOMMAND),
            None,
        )?;
        Ok(())
    }

    /// The MCU bring-up sequence: report type, MCU power, MCU mode, IR mode,
    /// IR registers, then arming the fragment stream.
    fn enable_ir_mode(&self, stream: IrStream, registers: &IrRegisters) -> Result<()> {
        debug!("enabling IR mode {:?}", stream.mode);
        self.set_report_type(REPORT_STANDARD_IR)?;
        // Wake up the MCU
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_MCU_STATE,
            &[0x01],
            None,
            Some(&[(0x0D, 0x80), (0x0E, SUBCMD_SET_MCU_STATE)]),
        )?;
        self.write_output_report(
            REPORT_MCU_REQUEST,
            MCU_SUBCMD_STATUS,
            &[],
            None,
            Some(&[(0, REPORT_STANDARD_IR), (49, MCU_STATE_STATUS), (56, 0x01)]),
        )?;
        // Switch it into IR mode and wait until it reports having got there
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_MCU_CONFIG,
            &[0x01, 0x00, 0x05],
            Some(CRC_SUBCOMMAND),
            Some(&[(0, REPORT_SUBCOMMAND_REPLY), (15, 0x01), (22, 0x01)]),
        )?;
        self.write_output_report(
            REPORT_MCU_REQUEST,
            MCU_SUBCMD_STATUS,
            &[],
            None,
            Some(&[(0, REPORT_STANDARD_IR), (49, MCU_STATE_STATUS), (56, 0x05)]),
        )?;
        // Select the camera mode and per-frame fragment count
        let argument = [
            0x23,
            0x01,
            stream.mode.code(),
            stream.highest_fragment,
            0x00,
            0x05,
            0x00,
            0x18,
        ];
        self.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_MCU_CONFIG,
            &argument,
            Some(CRC_SUBCOMMAND),
            Some(&[(0, REPORT_SUBCOMMAND_REPLY), (15, 0x0B)]),
        )?;
        self.write_ir_registers(registers)?;
        // Arm the stream: keep requesting until IR data actually shows up
        let mut armed = false;
        for _ in 0..ARM_RETRIES {
            self.request_ir_report(0)?;
            if let Some(report) = self.read_input_report(COMMAND_TIMEOUT_MS)? {
                if self.have_ir_data(&report) {
                    armed = true;
                    break;
                }
            }
        }
        if !armed {
            return Err(Error::DeviceTimeout);
        }
        // Some of the register writes issued before arming get lost; write
        // them again now that the stream is live.
        self.write_ir_registers(registers)?;
        self.request_ir_report(0)?;
        Ok(())
    }

    fn setup_sensors(&self, registers: Option<&IrRegisters>) -> Result<()> {
        self.write_output_report(REPORT_SUBCOMMAND, SUBCMD_ENABLE_IMU, &[0x01], None, None)?;
        // The firmware needs a moment to apply the sensor setting
        thread::sleep(SETTINGS_DELAY);
        match (self.ir, registers) {
            (Some(stream), Some(registers)) => self.enable_ir_mode(stream, registers)?,
            _ => {
                self.disable_ir_mode()?;
                self.set_report_type(REPORT_STANDARD_INPUT)?;
            }
        }
        thread::sleep(SETTINGS_DELAY);
        Ok(())
    }

    fn have_ir_data(&self, report: &InputReport) -> bool {
        match self.ir {
            Some(stream) => {
                report[0] == REPORT_STANDARD_IR
                    && report[49] == MCU_STATE_IR_DATA
                    && report[51] == stream.mode.code()
            }
            None => false,
        }
    }

    fn advance_ir_stream(&self, state: &mut IrState, report: &InputReport) -> Result<()> {
        match state {
            IrState::Inactive => Ok(()),
            IrState::SingleFragment => self.request_ir_report(0),
            IrState::Assembling(assembly) => self.advance_assembly(assembly, report),
        }
    }

    /// One step of the image reassembly loop. Fragment `f` of a frame covers
    /// bytes `[f * 300, f * 300 + 300)` of the assembled image.
    fn advance_assembly(&self, assembly: &mut IrAssembly, report: &InputReport) -> Result<()> {
        if report[49] != MCU_STATE_IR_DATA {
            // The frame header got lost somewhere; ask for our last fragment
            // again to get the stream moving.
            return self.request_ir_report(assembly.last_fragment);
        }
        let fragment = report[52];
        if fragment > assembly.highest_fragment || fragment == assembly.last_fragment {
            // Out of sequence, or the device did not advance at all: restart
            // the frame from fragment zero and drop the published image,
            // which may be stale by now.
            self.request_ir_report(0)?;
            self.latest_image.lock().unwrap().take();
            assembly.last_fragment = fragment;
            return Ok(());
        }
        let offset = fragment as usize * IR_FRAGMENT_LEN;
        assembly.scratch[offset..offset + IR_FRAGMENT_LEN]
            .copy_from_slice(&report[59..59 + IR_FRAGMENT_LEN]);
        if fragment == assembly.highest_fragment {
            self.request_ir_report(fragment)?;
            let image_len = assembly.image_len();
            let image = mem::replace(&mut assembly.scratch, vec![0; image_len]);
            *self.latest_image.lock().unwrap() = Some(image);
        } else {
            self.request_ir_report(fragment)?;
            // A frame is in flight; whatever was published belongs to an
            // older frame
            self.latest_image.lock().unwrap().take();
        }
        assembly.last_fragment = fragment;
        Ok(())
    }

    fn latest_image(&self) -> Option<Vec<u8>> {
        self.latest_image.lock().unwrap().clone()
    }

    fn latest_clusters(&self) -> Option<Vec<IrCluster>> {
        let stream = self.ir?;
        if !matches!(stream.mode, IrMode::Pointing | IrMode::Clustering) {
            return None;
        }
        let report = *self.latest_report.lock().unwrap();
        if !self.have_ir_data(&report) {
            return Some(Vec::new());
        }
        Some(ir::parse_clusters(&report, stream.mode))
    }

    fn battery_level(&self) -> u8 {
        (self.latest_report.lock().unwrap()[2] >> 5) & 0x07
    }

    fn battery_charging(&self) -> bool {
        self.latest_report.lock().unwrap()[2] & 0x10 != 0
    }
}

/// IR image reassembly buffer of the reader thread.
struct IrAssembly {
    highest_fragment: u8,
    scratch: Vec<u8>,
    last_fragment: u8,
}

impl IrAssembly {
    fn new(highest_fragment: u8) -> Self {
        IrAssembly {
            highest_fragment,
            scratch: vec![0; (highest_fragment as usize + 1) * IR_FRAGMENT_LEN],
            // Sentinel: a stream that opens with its final fragment is
            // indistinguishable from a stalled one and gets resynced.
            last_fragment: highest_fragment,
        }
    }

    fn image_len(&self) -> usize {
        (self.highest_fragment as usize + 1) * IR_FRAGMENT_LEN
    }
}

enum IrState {
    Inactive,
    SingleFragment,
    Assembling(IrAssembly),
}

impl IrState {
    fn for_stream(stream: Option<IrStream>) -> IrState {
        match stream {
            None => IrState::Inactive,
            Some(stream) if stream.highest_fragment > 1 => {
                IrState::Assembling(IrAssembly::new(stream.highest_fragment))
            }
            Some(_) => IrState::SingleFragment,
        }
    }
}

fn input_report_loop(shared: Arc<Shared>) {
    let mut state = IrState::for_stream(shared.ir);
    // The other strong reference is the owning JoyCon; once it is gone we
    // stop touching the device.
    while Arc::strong_count(&shared) >= 2 {
        let report = match shared.read_input_report(READER_TIMEOUT_MS) {
            Ok(Some(report)) => report,
            Ok(None) => continue,
            Err(e) => {
                debug!("input report reader exiting: {e}");
                return;
            }
        };
        if report[0] != REPORT_STANDARD_INPUT && report[0] != REPORT_STANDARD_IR {
            continue;
        }
        *shared.latest_report.lock().unwrap() = report;
        if report[0] == REPORT_STANDARD_IR {
            if let Err(e) = shared.advance_ir_stream(&mut state, &report) {
                match e {
                    Error::HidError(_) | Error::Disconnected(_) => {
                        debug!("input report reader exiting: {e}");
                        return;
                    }
                    e => {
                        warn!("IR stream error, resyncing: {e}");
                        let _ = shared.request_ir_report(0);
                    }
                }
            }
        }
        let hooks = shared.hooks.read().unwrap();
        if !hooks.is_empty() {
            let handle = JoyConHandle {
                shared: shared.as_ref(),
            };
            for hook in hooks.iter() {
                hook(&handle);
            }
        }
    }
    debug!("input report reader exiting: owner dropped");
}

/// Raw IMU calibration words from SPI flash, little-endian as stored.
///
/// Interpreting these into sensor units is up to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImuCalibration {
    pub accel_offset: [i16; 3],
    pub accel_coeff: [i16; 3],
    pub gyro_offset: [i16; 3],
    pub gyro_coeff: [i16; 3],
}

impl ImuCalibration {
    fn parse(data: &[u8]) -> Self {
        let word = |i: usize| LittleEndian::read_i16(&data[2 * i..2 * i + 2]);
        ImuCalibration {
            accel_offset: [word(0), word(1), word(2)],
            accel_coeff: [word(3), word(4), word(5)],
            gyro_offset: [word(6), word(7), word(8)],
            gyro_coeff: [word(9), word(10), word(11)],
        }
    }
}

/// Borrowed view of a connected Joy-Con, handed to update hooks.
///
/// Only valid for the duration of the hook invocation; hooks never own the
/// controller.
pub struct JoyConHandle<'a> {
    shared: &'a Shared,
}

impl JoyConHandle<'_> {
    pub fn latest_image(&self) -> Option<Vec<u8>> {
        self.shared.latest_image()
    }

    pub fn latest_clusters(&self) -> Option<Vec<IrCluster>> {
        self.shared.latest_clusters()
    }

    pub fn battery_level(&self) -> u8 {
        self.shared.battery_level()
    }

    pub fn battery_charging(&self) -> bool {
        self.shared.battery_charging()
    }
}

/// The main structure representing a connected Joy-Con.
///
/// Dropping it tears the connection down: transport operations still in
/// flight fail with [`Error::Disconnected`], and the reader thread exits
/// within one read timeout, releasing the HID handle.
pub struct JoyCon {
    shared: Arc<Shared>,
    product_id: u16,
    serial: Option<String>,
    color_body: (u8, u8, u8),
    color_buttons: (u8, u8, u8),
    imu_calibration: ImuCalibration,
}

impl JoyCon {
    pub const VENDOR_ID: u16 = 0x057E;
    pub const PRODUCT_ID_LEFT: u16 = 0x2006;
    pub const PRODUCT_ID_RIGHT: u16 = 0x2007;

    /// Connects to a Joy-Con and, when `ir_mode` is given, takes it through
    /// the full IR bring-up before returning.
    ///
    /// `ir_registers` falls back to [`IrRegisters::defaults`] for the mode.
    /// Only the right Joy-Con has an IR camera; the left one is accepted for
    /// identification purposes.
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        serial: Option<&str>,
        ir_mode: Option<IrMode>,
        ir_registers: Option<IrRegisters>,
    ) -> Result<JoyCon> {
        if vendor_id != Self::VENDOR_ID {
            return Err(Error::InvalidArgument("not a Joy-Con vendor id"));
        }
        if product_id != Self::PRODUCT_ID_LEFT && product_id != Self::PRODUCT_ID_RIGHT {
            return Err(Error::InvalidArgument("not a Joy-Con product id"));
        }
        let device = util::open_hid_device(vendor_id, product_id, serial)?;
        Self::from_pipe(Box::new(device), product_id, serial, ir_mode, ir_registers)
    }

    /// Like [`JoyCon::new`], but on a caller-supplied transport.
    pub fn from_pipe(
        pipe: Box<dyn HidPipe>,
        product_id: u16,
        serial: Option<&str>,
        ir_mode: Option<IrMode>,
        ir_registers: Option<IrRegisters>,
    ) -> Result<JoyCon> {
        let registers =
            ir_mode.map(|mode| ir_registers.unwrap_or_else(|| IrRegisters::defaults(mode)));
        let stream = ir_mode.map(|mode| {
            let resolution = registers
                .as_ref()
                .and_then(|r| r.resolution)
                .unwrap_or(IrResolution::R320);
            IrStream {
                mode,
                highest_fragment: if mode == IrMode::Image {
                    resolution.highest_fragment()
                } else {
                    1
                },
            }
        });
        let shared = Shared::new(pipe, stream);
        let (color_body, color_buttons, imu_calibration) = shared.read_calibration()?;
        shared.setup_sensors(registers.as_ref())?;

        let shared = Arc::new(shared);
        let reader = Arc::clone(&shared);
        thread::Builder::new()
            .name("joycon-input".into())
            .spawn(move || input_report_loop(reader))?;
        Ok(JoyCon {
            shared,
            product_id,
            serial: serial.map(str::to_owned),
            color_body,
            color_buttons,
            imu_calibration,
        })
    }

    pub fn is_left(&self) -> bool {
        self.product_id == Self::PRODUCT_ID_LEFT
    }

    pub fn is_right(&self) -> bool {
        self.product_id == Self::PRODUCT_ID_RIGHT
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Body color from factory calibration, as RGB
    pub fn color_body(&self) -> (u8, u8, u8) {
        self.color_body
    }

    /// Button color from factory calibration, as RGB
    pub fn color_buttons(&self) -> (u8, u8, u8) {
        self.color_buttons
    }

    pub fn imu_calibration(&self) -> ImuCalibration {
        self.imu_calibration
    }

    /// The most recently completed IR frame, `width * height` grayscale
    /// bytes. Only ever `Some` in [`IrMode::Image`], and only between the
    /// final fragment of one frame and the first fragment of the next.
    pub fn latest_image(&self) -> Option<Vec<u8>> {
        self.shared.latest_image()
    }

    /// Clusters from the most recent IR report. `None` outside the
    /// pointing/clustering modes, empty while no IR data has arrived yet.
    pub fn latest_clusters(&self) -> Option<Vec<IrCluster>> {
        self.shared.latest_clusters()
    }

    /// Battery level, 0 (empty) to 8 (full), from the latest input report
    pub fn battery_level(&self) -> u8 {
        self.shared.battery_level()
    }

    pub fn battery_charging(&self) -> bool {
        self.shared.battery_charging()
    }

    /// Registers a callback run on the reader thread once per received
    /// standard input report.
    pub fn register_update_hook<F>(&self, hook: F)
    where
        F: Fn(&JoyConHandle<'_>) + Send + Sync + 'static,
    {
        self.shared.hooks.write().unwrap().push(Box::new(hook));
    }

    /// Writes the set fields of `registers` to the MCU, committing at the end.
    pub fn write_ir_registers(&self, registers: &IrRegisters) -> Result<()> {
        self.shared.write_ir_registers(registers)
    }

    /// Reads back the current IR configuration from MCU pages 0 and 1.
    ///
    /// NOTE: the reply has to be picked out of the live input report stream,
    /// so on a busy IR stream this may need several retries internally.
    pub fn read_ir_registers(&self) -> Result<IrRegisters> {
        let page0 = self.shared.get_mcu_registers(0)?;
        let page1 = self.shared.get_mcu_registers(1)?;
        Ok(IrRegisters::from_pages(&page0, &page1))
    }

    /// Lights the player LEDs steadily according to the low 4 pattern bits.
    pub fn set_player_lights_on(&self, pattern: u8) -> Result<()> {
        self.set_player_lights(pattern & 0x0F)
    }

    /// Flashes the player LEDs according to the low 4 pattern bits.
    pub fn set_player_lights_flashing(&self, pattern: u8) -> Result<()> {
        self.set_player_lights((pattern & 0x0F) << 4)
    }

    /// Raw player LED pattern: low nibble steady, high nibble flashing.
    pub fn set_player_lights(&self, pattern: u8) -> Result<()> {
        self.shared.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_PLAYER_LIGHTS,
            &[pattern],
            None,
            None,
        )?;
        Ok(())
    }

    /// Asks the controller to drop the connection, then tears down.
    pub fn disconnect(self) -> Result<()> {
        self.shared.write_output_report(
            REPORT_SUBCOMMAND,
            SUBCMD_SET_HCI_STATE,
            &[0x00],
            None,
            None,
        )?;
        Ok(())
    }
}

impl Drop for JoyCon {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}
