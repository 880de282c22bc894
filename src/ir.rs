// Copyright (C) 2023, Alex Badics
// This file is part of joycon-ir-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! IR camera data model: operating modes, sensor resolutions, the MCU
//! register snapshot with its batched write protocol, and cluster records.

use crate::{Error, Result};

/// Operating mode of the IR camera coprocessor.
///
/// The mode determines the payload layout of `0x31` input reports:
/// `Image` streams full frames in 300-byte fragments, `Pointing` and
/// `Clustering` deliver up to 16 bright-spot cluster records per report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrMode {
    Pointing = 4,
    Clustering = 6,
    Image = 7,
}

impl IrMode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            4 => Ok(IrMode::Pointing),
            6 => Ok(IrMode::Clustering),
            7 => Ok(IrMode::Image),
            _ => Err(Error::InvalidArgument("unknown IR mode code")),
        }
    }
}

/// Sensor readout resolution, in full-frame lines.
///
/// The height is always 3/4 of the width. In [`IrMode::Image`] the
/// resolution also fixes how many 300-byte fragments make up one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrResolution {
    R320,
    R160,
    R80,
    R40,
}

impl IrResolution {
    pub fn width(self) -> usize {
        match self {
            IrResolution::R320 => 320,
            IrResolution::R160 => 160,
            IrResolution::R80 => 80,
            IrResolution::R40 => 40,
        }
    }

    pub fn height(self) -> usize {
        self.width() * 3 / 4
    }

    /// Size in bytes of one complete 8-bit frame.
    pub fn image_len(self) -> usize {
        self.width() * self.height()
    }

    pub(crate) fn register_value(self) -> u8 {
        match self {
            IrResolution::R320 => 0x00,
            IrResolution::R160 => 0x50,
            IrResolution::R80 => 0x64,
            IrResolution::R40 => 0x69,
        }
    }

    pub(crate) fn from_register_value(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(IrResolution::R320),
            0x50 => Some(IrResolution::R160),
            0x64 => Some(IrResolution::R80),
            0x69 => Some(IrResolution::R40),
            _ => None,
        }
    }

    /// Index of the last fragment of a frame (the fragment count minus one).
    pub(crate) fn highest_fragment(self) -> u8 {
        match self {
            IrResolution::R320 => 0xFF,
            IrResolution::R160 => 0x3F,
            IrResolution::R80 => 0x0F,
            IrResolution::R40 => 0x03,
        }
    }

    pub(crate) fn default_update_time(self) -> u8 {
        match self {
            IrResolution::R40 => 0x2D,
            _ => 0x32,
        }
    }
}

/// One `(page, register, value)` write for the MCU register file.
pub(crate) type RegisterTriple = (u8, u8, u8);

/// Every flush ends with this commit write, which makes the MCU latch the
/// staged register values.
pub(crate) const REGISTER_COMMIT: RegisterTriple = (0x00, 0x07, 0x01);

/// Largest number of register triples one `set MCU registers` command holds.
pub(crate) const REGISTER_GROUP_LEN: usize = 9;

/// Snapshot of the IR camera configuration registers.
///
/// Unset fields are left untouched on the device. `write`-direction encoding
/// is fixed-order; [`JoyCon::read_ir_registers`](crate::JoyCon::read_ir_registers)
/// returns a fully populated snapshot decoded from MCU pages 0 and 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrRegisters {
    pub resolution: Option<IrResolution>,
    /// Exposure time in microseconds, 0-600.
    pub exposure_us: Option<u16>,
    pub max_exposure: Option<bool>,
    /// IR LED control mask, see the `LED_*` constants.
    pub leds: Option<u8>,
    pub digital_gain: Option<u8>,
    pub external_light_filter: Option<bool>,
    pub brightness_threshold: Option<u8>,
    pub leds_12_intensity: Option<u8>,
    pub leds_34_intensity: Option<u8>,
    pub flip: Option<u8>,
    pub denoise: Option<bool>,
    pub smoothing_threshold: Option<u8>,
    pub interpolation_threshold: Option<u8>,
    pub update_time: Option<u8>,
    pub pointing_threshold: Option<u8>,
}

impl IrRegisters {
    pub const LED_FLASHLIGHT: u8 = 0b0000_0001;
    pub const LED_12_OFF: u8 = 0b0001_0000;
    pub const LED_34_OFF: u8 = 0b0010_0000;
    pub const LED_STROBE: u8 = 0b1000_0000;

    /// Reasonable starting configuration for the given mode.
    pub fn defaults(mode: IrMode) -> Self {
        match mode {
            IrMode::Pointing => IrRegisters {
                exposure_us: Some(200),
                external_light_filter: Some(true),
                ..IrRegisters::default()
            },
            IrMode::Clustering | IrMode::Image => IrRegisters {
                resolution: Some(IrResolution::R320),
                exposure_us: Some(300),
                leds: Some(Self::LED_FLASHLIGHT),
                digital_gain: Some(1),
                denoise: Some(true),
                ..IrRegisters::default()
            },
        }
    }

    /// Serializes the set fields into register writes, in fixed field order.
    pub(crate) fn triples(&self) -> Vec<RegisterTriple> {
        let mut out = Vec::new();
        if let Some(res) = self.resolution {
            out.push((0x00, 0x2e, res.register_value()));
        }
        if let Some(us) = self.exposure_us {
            let counts = encode_exposure_us(us);
            out.push((0x01, 0x30, (counts & 0xff) as u8));
            out.push((0x01, 0x31, (counts >> 8) as u8));
        }
        if let Some(on) = self.max_exposure {
            out.push((0x01, 0x32, on as u8));
        }
        if let Some(mask) = self.leds {
            out.push((0x00, 0x10, mask));
        }
        if let Some(gain) = self.digital_gain {
            // Low nibble goes to the upper nibble of 0x2e, high nibble to the
            // lower nibble of 0x2f.
            out.push((0x01, 0x2e, (gain & 0x0f) << 4));
            out.push((0x01, 0x2f, (gain & 0xf0) >> 4));
        }
        if let Some(on) = self.external_light_filter {
            out.push((0x00, 0x0e, if on { 3 } else { 0 }));
        }
        if let Some(v) = self.brightness_threshold {
            out.push((0x01, 0x43, v));
        }
        if let Some(v) = self.leds_12_intensity {
            out.push((0x00, 0x11, v));
        }
        if let Some(v) = self.leds_34_intensity {
            out.push((0x00, 0x12, v));
        }
        if let Some(v) = self.flip {
            out.push((0x00, 0x2d, v));
        }
        if let Some(on) = self.denoise {
            out.push((0x01, 0x67, on as u8));
        }
        if let Some(v) = self.smoothing_threshold {
            out.push((0x01, 0x68, v));
        }
        if let Some(v) = self.interpolation_threshold {
            out.push((0x01, 0x69, v));
        }
        match (self.update_time, self.resolution) {
            (Some(v), _) => out.push((0x00, 0x04, v)),
            (None, Some(res)) => out.push((0x00, 0x04, res.default_update_time())),
            (None, None) => {}
        }
        if let Some(v) = self.pointing_threshold {
            out.push((0x01, 0x21, v));
        }
        out
    }

    /// Decodes a full snapshot from raw register pages 0 and 1.
    pub(crate) fn from_pages(page0: &[u8], page1: &[u8]) -> Self {
        let reg = |page: &[u8], idx: usize| page.get(idx).copied().unwrap_or(0);
        let counts = reg(page1, 0x30) as u16 | (reg(page1, 0x31) as u16) << 8;
        IrRegisters {
            resolution: IrResolution::from_register_value(reg(page0, 0x2e)),
            exposure_us: Some(decode_exposure_us(counts)),
            max_exposure: Some(reg(page1, 0x32) != 0),
            leds: Some(reg(page0, 0x10)),
            digital_gain: Some(reg(page1, 0x2e) >> 4 | (reg(page1, 0x2f) & 0x0f) << 4),
            external_light_filter: Some(reg(page0, 0x0e) != 0),
            brightness_threshold: Some(reg(page1, 0x43)),
            leds_12_intensity: Some(reg(page0, 0x11)),
            leds_34_intensity: Some(reg(page0, 0x12)),
            flip: Some(reg(page0, 0x2d)),
            denoise: Some(reg(page1, 0x67) != 0),
            smoothing_threshold: Some(reg(page1, 0x68)),
            interpolation_threshold: Some(reg(page1, 0x69)),
            update_time: Some(reg(page0, 0x04)),
            pointing_threshold: Some(reg(page1, 0x21)),
        }
    }
}

/// Splits register writes into wire-sized groups. The last group always ends
/// with [`REGISTER_COMMIT`]; when the writes fill the last group exactly, the
/// commit goes out as a group of its own.
pub(crate) fn register_batches(triples: &[RegisterTriple]) -> Vec<Vec<RegisterTriple>> {
    let mut out = Vec::new();
    let mut rest = triples;
    loop {
        if rest.len() < REGISTER_GROUP_LEN {
            let mut group = rest.to_vec();
            group.push(REGISTER_COMMIT);
            out.push(group);
            return out;
        }
        out.push(rest[..REGISTER_GROUP_LEN].to_vec());
        if rest.len() == REGISTER_GROUP_LEN {
            out.push(vec![REGISTER_COMMIT]);
            return out;
        }
        rest = &rest[REGISTER_GROUP_LEN..];
    }
}

/// `(31200 * µs + 500) / 1000`, the sensor's exposure quantization.
fn encode_exposure_us(us: u16) -> u16 {
    ((31_200u32 * us as u32 + 500) / 1000) as u16
}

fn decode_exposure_us(counts: u16) -> u16 {
    ((counts as u32 * 1000 + 15_600) / 31_200) as u16
}

/// One bright region reported by the MCU in pointing/clustering mode.
///
/// All values are raw device units; centroids are in 1/64 pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrCluster {
    pub brightness: u16,
    pub pixels: u16,
    pub centroid_y: u16,
    pub centroid_x: u16,
    pub y_start: u16,
    pub y_end: u16,
    pub x_start: u16,
    pub x_end: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct IrClusterRaw {
    brightness: u16,
    pixels: u16,
    centroid_y: u16,
    centroid_x: u16,
    y_start: u16,
    y_end: u16,
    x_start: u16,
    x_end: u16,
}

unsafe impl bytemuck::Zeroable for IrClusterRaw {}
unsafe impl bytemuck::Pod for IrClusterRaw {}

impl IrCluster {
    const RECORD_LEN: usize = 16;

    fn from_record(record: &[u8]) -> Self {
        let raw: IrClusterRaw = bytemuck::pod_read_unaligned(record);
        IrCluster {
            brightness: u16::from_le(raw.brightness),
            pixels: u16::from_le(raw.pixels),
            centroid_y: u16::from_le(raw.centroid_y),
            centroid_x: u16::from_le(raw.centroid_x),
            y_start: u16::from_le(raw.y_start),
            y_end: u16::from_le(raw.y_end),
            x_start: u16::from_le(raw.x_start),
            x_end: u16::from_le(raw.x_end),
        }
    }
}

/// Extracts cluster records from the IR payload of a `0x31` input report.
///
/// Records start at byte 61 and run to the end of the 300-byte payload. In
/// pointing mode the payload additionally carries one delimiter byte per
/// cluster row, which is skipped. A record whose first two bytes are both
/// zero is an empty slot.
pub(crate) fn parse_clusters(report: &[u8], mode: IrMode) -> Vec<IrCluster> {
    const FIRST: usize = 61;
    const END: usize = 59 + 300;
    let mut clusters = Vec::new();
    let mut i = FIRST;
    while i + IrCluster::RECORD_LEN <= END {
        if mode == IrMode::Pointing
            && matches!(i - FIRST, 48 | 97 | 146 | 195 | 244)
        {
            i += 1;
        }
        let record = &report[i..i + IrCluster::RECORD_LEN];
        if record[0] != 0 || record[1] != 0 {
            clusters.push(IrCluster::from_record(record));
        }
        i += IrCluster::RECORD_LEN;
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes() {
        assert_eq!(IrMode::Pointing.code(), 4);
        assert_eq!(IrMode::Clustering.code(), 6);
        assert_eq!(IrMode::Image.code(), 7);
        assert!(matches!(IrMode::from_code(7), Ok(IrMode::Image)));
        assert!(matches!(
            IrMode::from_code(5),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn resolution_register_encoding() {
        let cases = [
            (IrResolution::R320, 0x00, 0xFF, 76800),
            (IrResolution::R160, 0x50, 0x3F, 19200),
            (IrResolution::R80, 0x64, 0x0F, 4800),
            (IrResolution::R40, 0x69, 0x03, 1200),
        ];
        for (res, value, fragment, len) in cases {
            assert_eq!(res.register_value(), value);
            assert_eq!(IrResolution::from_register_value(value), Some(res));
            assert_eq!(res.highest_fragment(), fragment);
            assert_eq!(res.image_len(), len);
        }
        assert_eq!(IrResolution::from_register_value(0x42), None);
    }

    #[test]
    fn exposure_encoding() {
        let cases = [(0, 0), (100, 3120), (200, 6240), (500, 15600), (600, 18720)];
        for (us, counts) in cases {
            assert_eq!(encode_exposure_us(us), counts);
            assert_eq!(decode_exposure_us(counts), us);
        }
    }

    #[test]
    fn update_time_synthesized_from_resolution() {
        let regs = IrRegisters {
            resolution: Some(IrResolution::R40),
            ..IrRegisters::default()
        };
        assert!(regs.triples().contains(&(0x00, 0x04, 0x2D)));

        let regs = IrRegisters {
            resolution: Some(IrResolution::R320),
            ..IrRegisters::default()
        };
        assert!(regs.triples().contains(&(0x00, 0x04, 0x32)));

        // An explicit update time wins over the synthesized one
        let regs = IrRegisters {
            resolution: Some(IrResolution::R40),
            update_time: Some(0x10),
            ..IrRegisters::default()
        };
        let triples = regs.triples();
        assert!(triples.contains(&(0x00, 0x04, 0x10)));
        assert_eq!(
            triples.iter().filter(|t| t.0 == 0x00 && t.1 == 0x04).count(),
            1
        );
    }

    #[test]
    fn led_intensity_registers_are_distinct() {
        let regs = IrRegisters {
            leds_12_intensity: Some(0x0f),
            leds_34_intensity: Some(0x10),
            ..IrRegisters::default()
        };
        let triples = regs.triples();
        assert!(triples.contains(&(0x00, 0x11, 0x0f)));
        assert!(triples.contains(&(0x00, 0x12, 0x10)));
    }

    #[test]
    fn pointing_threshold_triple() {
        let mut regs = IrRegisters::defaults(IrMode::Pointing);
        regs.pointing_threshold = Some(0);
        assert_eq!(*regs.triples().last().unwrap(), (0x01, 0x21, 0x00));
    }

    #[test]
    fn registers_roundtrip_through_pages() {
        let regs = IrRegisters {
            resolution: Some(IrResolution::R160),
            exposure_us: Some(313),
            max_exposure: Some(false),
            leds: Some(IrRegisters::LED_FLASHLIGHT | IrRegisters::LED_34_OFF),
            digital_gain: Some(0xA5),
            external_light_filter: Some(true),
            brightness_threshold: Some(0x44),
            leds_12_intensity: Some(0x0C),
            leds_34_intensity: Some(0x0D),
            flip: Some(2),
            denoise: Some(true),
            smoothing_threshold: Some(0x23),
            interpolation_threshold: Some(0x4B),
            update_time: Some(0x32),
            pointing_threshold: Some(0x07),
        };
        let mut page0 = [0u8; 0x7F];
        let mut page1 = [0u8; 0x7F];
        for (page, register, value) in regs.triples() {
            match page {
                0 => page0[register as usize] = value,
                1 => page1[register as usize] = value,
                _ => panic!("unexpected page {page}"),
            }
        }
        let decoded = IrRegisters::from_pages(&page0, &page1);
        // Exposure survives modulo quantization to 1/31.2 µs counts; 313 µs
        // happens to be exactly representable.
        assert_eq!(decoded, regs);
    }

    #[test]
    fn batch_counts() {
        let triple = (0x01u8, 0x30u8, 0x00u8);

        let batches = register_batches(&vec![triple; 12]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 9);
        assert_eq!(batches[1].len(), 4);

        let batches = register_batches(&vec![triple; 9]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 9);
        assert_eq!(batches[1], vec![REGISTER_COMMIT]);

        let batches = register_batches(&vec![triple; 8]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 9);

        let batches = register_batches(&[]);
        assert_eq!(batches, vec![vec![REGISTER_COMMIT]]);

        for n in 0..40 {
            let batches = register_batches(&vec![triple; n]);
            let expected = (n + 1).div_ceil(REGISTER_GROUP_LEN).max(1);
            assert_eq!(batches.len(), expected, "n = {n}");
            assert_eq!(*batches.last().unwrap().last().unwrap(), REGISTER_COMMIT);
            assert!(batches.iter().all(|b| b.len() <= REGISTER_GROUP_LEN));
        }
    }

    fn cluster_record(brightness: u16, pixels: u16) -> [u8; 16] {
        let mut record = [0u8; 16];
        record[..2].copy_from_slice(&brightness.to_le_bytes());
        record[2..4].copy_from_slice(&pixels.to_le_bytes());
        record[4..6].copy_from_slice(&0x0040u16.to_le_bytes()); // centroid y
        record[6..8].copy_from_slice(&0x0080u16.to_le_bytes()); // centroid x
        record[8..10].copy_from_slice(&1u16.to_le_bytes());
        record[10..12].copy_from_slice(&2u16.to_le_bytes());
        record[12..14].copy_from_slice(&3u16.to_le_bytes());
        record[14..16].copy_from_slice(&4u16.to_le_bytes());
        record
    }

    #[test]
    fn cluster_record_decoding() {
        let mut report = [0u8; 360];
        report[61..77].copy_from_slice(&cluster_record(0x1234, 0x0002));
        let clusters = parse_clusters(&report, IrMode::Clustering);
        assert_eq!(
            clusters,
            vec![IrCluster {
                brightness: 0x1234,
                pixels: 0x0002,
                centroid_y: 0x0040,
                centroid_x: 0x0080,
                y_start: 1,
                y_end: 2,
                x_start: 3,
                x_end: 4,
            }]
        );
    }

    #[test]
    fn empty_slots_are_skipped() {
        let report = [0u8; 360];
        assert!(parse_clusters(&report, IrMode::Clustering).is_empty());
        assert!(parse_clusters(&report, IrMode::Pointing).is_empty());
    }

    #[test]
    fn pointing_row_delimiters_are_skipped() {
        // A record placed right after the first row delimiter (byte 61 + 48
        // is the delimiter, the record starts at 61 + 49). A clustering-mode
        // parse must not find it at that offset.
        let mut report = [0u8; 360];
        report[61 + 48] = 0xEE; // delimiter byte, not part of any record
        report[61 + 49..61 + 65].copy_from_slice(&cluster_record(0x0101, 1));
        let pointing = parse_clusters(&report, IrMode::Pointing);
        assert_eq!(pointing.len(), 1);
        assert_eq!(pointing[0].brightness, 0x0101);

        let clustering = parse_clusters(&report, IrMode::Clustering);
        assert_ne!(clustering.first().map(|c| c.brightness), Some(0x0101));
    }
}
