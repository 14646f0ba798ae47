//! Decoder for the manufacturer-specific data that power stations broadcast.
//!
//! The payload is the body of a manufacturer-specific AD structure, so it
//! starts with the little-endian company identifier:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 1        | Company identifier (EcoFlow: 0xB5B5)
//! 2          | 2        | Frame type tag
//! 3          | 18       | Serial number, ASCII
//! 19         | 19       | Battery state of charge in %
//!
//! Nothing about the format is documented by the vendor. Every layout is a
//! row in a table so a new model is a data change, and every stage rejects
//! rather than guesses.

use crc16::{MODBUS, State};
use serde_derive::Deserialize;
use thiserror::Error;

pub const ECOFLOW_COMPANY_ID: u16 = 0xB5B5;

/// Company identifier and type tag always lead the payload.
pub const HEADER_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is {len} bytes, expected at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("payload does not match any known company id and frame tag")]
    UnrecognizedFormat,
    #[error("{format} frame failed integrity check: {reason}")]
    IntegrityFailure { format: String, reason: &'static str },
    #[error("{format} frame battery field decoded to {value}, outside 0..=100")]
    OutOfRange { format: String, value: u32 },
}

impl DecodeError {
    /// Short, stable name used for log throttling.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::TooShort { .. } => "too_short",
            DecodeError::UnrecognizedFormat => "unrecognized_format",
            DecodeError::IntegrityFailure { .. } => "integrity_failure",
            DecodeError::OutOfRange { .. } => "out_of_range",
        }
    }

    /// Whether the failure hints at corruption or a format revision, as
    /// opposed to an advertisement that simply isn't ours.
    pub fn is_suspicious(&self) -> bool {
        matches!(
            self,
            DecodeError::IntegrityFailure { .. } | DecodeError::OutOfRange { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout {0}: battery width must be 1 or 2 bytes")]
    BatteryWidth(String),
    #[error("layout {0}: battery divisor must be non-zero")]
    BatteryDivisor(String),
    #[error("layout {layout}: {field} ends at byte {end} but min_length is {min_length}")]
    FieldOutsideFrame {
        layout: String,
        field: &'static str,
        end: usize,
        min_length: usize,
    },
    #[error("layout {0}: checksum range is empty")]
    EmptyChecksumRange(String),
    #[error("no frame layouts configured")]
    NoLayouts,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BatteryField {
    pub offset: usize,
    #[serde(default = "BatteryField::default_width")]
    pub width: u8,
    #[serde(default = "BatteryField::default_divisor")]
    pub divisor: u32,
}

impl BatteryField {
    fn default_width() -> u8 {
        1
    }

    fn default_divisor() -> u32 {
        1
    }

    fn read(&self, payload: &[u8]) -> u32 {
        let raw = match self.width {
            2 => u16::from_le_bytes([payload[self.offset], payload[self.offset + 1]]) as u32,
            _ => payload[self.offset] as u32,
        };
        raw / self.divisor
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SerialField {
    pub offset: usize,
    pub length: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    Xor8,
    Sum8,
    Crc16Modbus,
}

/// Checksum over `payload[from..at]`, stored at `at` (little-endian for CRCs).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChecksumField {
    pub kind: ChecksumKind,
    #[serde(default)]
    pub from: usize,
    pub at: usize,
}

impl ChecksumField {
    fn width(&self) -> usize {
        match self.kind {
            ChecksumKind::Xor8 | ChecksumKind::Sum8 => 1,
            ChecksumKind::Crc16Modbus => 2,
        }
    }

    fn matches(&self, payload: &[u8]) -> bool {
        let covered = &payload[self.from..self.at];
        let stored = &payload[self.at..self.at + self.width()];
        match self.kind {
            ChecksumKind::Xor8 => covered.iter().fold(0u8, |acc, b| acc ^ b) == stored[0],
            ChecksumKind::Sum8 => covered.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == stored[0],
            ChecksumKind::Crc16Modbus => State::<MODBUS>::calculate(covered).to_le_bytes() == stored,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelPrefix {
    pub prefix: String,
    pub name: String,
}

/// One known `(company_id, type_tag)` frame shape.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub name: String,
    pub company_id: u16,
    /// `None` accepts any tag byte.
    pub type_tag: Option<u8>,
    pub min_length: usize,
    pub battery: BatteryField,
    pub serial: Option<SerialField>,
    pub checksum: Option<ChecksumField>,
    #[serde(default)]
    pub models: Vec<ModelPrefix>,
}

impl FrameLayout {
    /// River / Delta power stations.
    pub fn ecoflow() -> Self {
        let model = |prefix: &str, name: &str| ModelPrefix {
            prefix: prefix.to_string(),
            name: name.to_string(),
        };
        FrameLayout {
            name: "EcoFlow".to_string(),
            company_id: ECOFLOW_COMPANY_ID,
            type_tag: None,
            min_length: 20,
            battery: BatteryField {
                offset: 19,
                width: 1,
                divisor: 1,
            },
            serial: Some(SerialField {
                offset: 3,
                length: 16,
            }),
            checksum: None,
            models: vec![
                model("R60", "River 2"),
                model("R65", "River 3"),
                model("R33", "Delta 2"),
            ],
        }
    }

    pub fn matches_header(&self, company_id: u16, type_tag: Option<u8>) -> bool {
        if self.company_id != company_id {
            return false;
        }
        match (self.type_tag, type_tag) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            // Tag not present yet; let the length check reject it.
            (Some(_), None) => true,
        }
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        // Offsets come from config; an end past usize::MAX is just out of frame.
        let outside = |field: &'static str, end: usize| LayoutError::FieldOutsideFrame {
            layout: self.name.clone(),
            field,
            end,
            min_length: self.min_length,
        };

        if !(1..=2).contains(&self.battery.width) {
            return Err(LayoutError::BatteryWidth(self.name.clone()));
        }
        if self.battery.divisor == 0 {
            return Err(LayoutError::BatteryDivisor(self.name.clone()));
        }
        let battery_end = self.battery.offset.saturating_add(self.battery.width as usize);
        if battery_end > self.min_length || self.battery.offset < HEADER_LEN {
            return Err(outside("battery", battery_end));
        }
        if let Some(serial) = &self.serial {
            let end = serial.offset.saturating_add(serial.length);
            if end > self.min_length || serial.offset < HEADER_LEN {
                return Err(outside("serial", end));
            }
        }
        if let Some(checksum) = &self.checksum {
            if checksum.from >= checksum.at {
                return Err(LayoutError::EmptyChecksumRange(self.name.clone()));
            }
            let end = checksum.at.saturating_add(checksum.width());
            if end > self.min_length {
                return Err(outside("checksum", end));
            }
        }
        Ok(())
    }

    fn model_for(&self, serial: &str) -> Option<String> {
        self.models
            .iter()
            .find(|m| serial.starts_with(&m.prefix))
            .map(|m| m.name.clone())
    }

    fn read_serial(&self, payload: &[u8]) -> Result<Option<String>, DecodeError> {
        let Some(field) = &self.serial else {
            return Ok(None);
        };
        let raw = &payload[field.offset..field.offset + field.length];
        let trimmed = match raw.iter().position(|b| *b == 0) {
            Some(nul) => {
                // Padding must run to the end of the field.
                if raw[nul..].iter().any(|b| *b != 0) {
                    return Err(self.integrity("serial has data after NUL padding"));
                }
                &raw[..nul]
            }
            None => raw,
        };
        if !trimmed.iter().all(u8::is_ascii_alphanumeric) {
            return Err(self.integrity("serial is not ASCII alphanumeric"));
        }
        if trimmed.is_empty() {
            return Ok(None);
        }
        // All bytes are ASCII, so this cannot fail.
        Ok(String::from_utf8(trimmed.to_vec()).ok())
    }

    fn integrity(&self, reason: &'static str) -> DecodeError {
        DecodeError::IntegrityFailure {
            format: self.name.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameFormat {
    pub name: String,
    pub company_id: u16,
    pub type_tag: u8,
}

/// A decoded, validated advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    pub format: FrameFormat,
    /// Always within 0..=100.
    pub battery_percentage: u8,
    pub serial: Option<String>,
    pub model: Option<String>,
}

/// Peek the company identifier and type tag without validating anything.
pub fn header(payload: &[u8]) -> (Option<u16>, Option<u8>) {
    let company_id = match payload {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    };
    (company_id, payload.get(2).copied())
}

#[derive(Debug, Clone)]
pub struct PacketParser {
    layouts: Vec<FrameLayout>,
    min_length: usize,
}

impl PacketParser {
    pub fn new(layouts: Vec<FrameLayout>) -> Result<Self, LayoutError> {
        for layout in &layouts {
            layout.validate()?;
        }
        let min_length = layouts
            .iter()
            .map(|l| l.min_length)
            .min()
            .ok_or(LayoutError::NoLayouts)?;
        Ok(PacketParser {
            layouts,
            min_length,
        })
    }

    pub fn layouts(&self) -> &[FrameLayout] {
        &self.layouts
    }

    pub fn decode(&self, payload: &[u8]) -> Result<TelemetryFrame, DecodeError> {
        if payload.len() < self.min_length {
            return Err(DecodeError::TooShort {
                len: payload.len(),
                min: self.min_length,
            });
        }

        let (Some(company_id), Some(type_tag)) = header(payload) else {
            return Err(DecodeError::UnrecognizedFormat);
        };
        let layout = self
            .layouts
            .iter()
            .find(|l| l.matches_header(company_id, Some(type_tag)))
            .ok_or(DecodeError::UnrecognizedFormat)?;
        if payload.len() < layout.min_length {
            return Err(DecodeError::TooShort {
                len: payload.len(),
                min: layout.min_length,
            });
        }

        if let Some(checksum) = &layout.checksum {
            if !checksum.matches(payload) {
                return Err(layout.integrity("checksum mismatch"));
            }
        }
        let serial = layout.read_serial(payload)?;

        let value = layout.battery.read(payload);
        if value > 100 {
            return Err(DecodeError::OutOfRange {
                format: layout.name.clone(),
                value,
            });
        }

        let model = serial.as_deref().and_then(|s| layout.model_for(s));
        Ok(TelemetryFrame {
            format: FrameFormat {
                name: layout.name.clone(),
                company_id,
                type_tag,
            },
            battery_percentage: value as u8,
            serial,
            model,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an EcoFlow frame the way a River 2 broadcasts it.
    pub(crate) fn ecoflow_payload(serial: &str, battery: u8) -> Vec<u8> {
        let mut payload = ECOFLOW_COMPANY_ID.to_le_bytes().to_vec();
        payload.push(0x13);
        let mut serial_bytes = serial.as_bytes().to_vec();
        serial_bytes.resize(16, 0);
        payload.extend_from_slice(&serial_bytes);
        payload.push(battery);
        payload.extend_from_slice(&[0x00, 0x5a]);
        payload
    }

    fn checked_layout(kind: ChecksumKind) -> FrameLayout {
        FrameLayout {
            name: "Test".to_string(),
            company_id: 0x1234,
            type_tag: Some(0x01),
            min_length: 9,
            battery: BatteryField {
                offset: 3,
                width: 1,
                divisor: 1,
            },
            serial: None,
            checksum: Some(ChecksumField {
                kind,
                from: 0,
                at: 7,
            }),
            models: vec![],
        }
    }

    fn checked_payload(kind: ChecksumKind, battery: u8) -> Vec<u8> {
        let mut payload = vec![0x34, 0x12, 0x01, battery, 0xde, 0xad, 0x42];
        match kind {
            ChecksumKind::Xor8 => {
                let x = payload.iter().fold(0u8, |acc, b| acc ^ b);
                payload.extend_from_slice(&[x, 0xff]);
            }
            ChecksumKind::Sum8 => {
                let s = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
                payload.extend_from_slice(&[s, 0xff]);
            }
            ChecksumKind::Crc16Modbus => {
                let crc = State::<MODBUS>::calculate(&payload).to_le_bytes();
                payload.extend_from_slice(&crc);
            }
        }
        payload
    }

    fn ecoflow_parser() -> PacketParser {
        PacketParser::new(vec![FrameLayout::ecoflow()]).unwrap()
    }

    #[test]
    fn test_decode_ecoflow_battery() {
        let parser = ecoflow_parser();
        for battery in [0, 1, 57, 80, 100] {
            let frame = parser.decode(&ecoflow_payload("R601ZEB4XE1A1234", battery)).unwrap();
            assert_eq!(frame.battery_percentage, battery);
        }
    }

    #[test]
    fn test_decode_ecoflow_serial_and_model() {
        let parser = ecoflow_parser();
        let frame = parser.decode(&ecoflow_payload("R601ZEB4XE1A1234", 80)).unwrap();
        assert_eq!(frame.serial.as_deref(), Some("R601ZEB4XE1A1234"));
        assert_eq!(frame.model.as_deref(), Some("River 2"));
        assert_eq!(frame.format.company_id, ECOFLOW_COMPANY_ID);
        assert_eq!(frame.format.type_tag, 0x13);

        let frame = parser.decode(&ecoflow_payload("R331ZEB4XE1A1234", 80)).unwrap();
        assert_eq!(frame.model.as_deref(), Some("Delta 2"));

        let frame = parser.decode(&ecoflow_payload("P2", 80)).unwrap();
        assert_eq!(frame.serial.as_deref(), Some("P2"));
        assert_eq!(frame.model, None);
    }

    #[test]
    fn test_too_short_never_yields_frame() {
        let parser = ecoflow_parser();
        let full = ecoflow_payload("R601ZEB4XE1A1234", 80);
        for len in 0..20 {
            assert_eq!(
                parser.decode(&full[..len]),
                Err(DecodeError::TooShort { len, min: 20 })
            );
        }
    }

    #[test]
    fn test_foreign_company_is_unrecognized() {
        let parser = ecoflow_parser();
        let mut payload = ecoflow_payload("R601ZEB4XE1A1234", 80);
        // Apple
        payload[0] = 0x4c;
        payload[1] = 0x00;
        assert_eq!(parser.decode(&payload), Err(DecodeError::UnrecognizedFormat));
    }

    #[test]
    fn test_type_tag_mismatch_is_unrecognized() {
        let parser = PacketParser::new(vec![checked_layout(ChecksumKind::Xor8)]).unwrap();
        let mut payload = checked_payload(ChecksumKind::Xor8, 50);
        payload[2] = 0x02;
        assert_eq!(parser.decode(&payload), Err(DecodeError::UnrecognizedFormat));
    }

    #[test]
    fn test_matched_layout_min_length() {
        let parser =
            PacketParser::new(vec![checked_layout(ChecksumKind::Xor8), FrameLayout::ecoflow()])
                .unwrap();
        let payload = ecoflow_payload("R601ZEB4XE1A1234", 80);
        assert_eq!(
            parser.decode(&payload[..12]),
            Err(DecodeError::TooShort { len: 12, min: 20 })
        );
    }

    #[test]
    fn test_battery_out_of_range_is_rejected() {
        let parser = ecoflow_parser();
        for battery in [101, 200, 255] {
            assert_eq!(
                parser.decode(&ecoflow_payload("R601ZEB4XE1A1234", battery)),
                Err(DecodeError::OutOfRange {
                    format: "EcoFlow".to_string(),
                    value: battery as u32
                })
            );
        }
    }

    #[test]
    fn test_garbled_serial_is_integrity_failure() {
        let parser = ecoflow_parser();
        let mut payload = ecoflow_payload("R601ZEB4XE1A1234", 80);
        payload[5] = 0xff;
        assert!(matches!(
            parser.decode(&payload),
            Err(DecodeError::IntegrityFailure { .. })
        ));

        let mut payload = ecoflow_payload("R601", 80);
        payload[12] = b'A';
        assert!(matches!(
            parser.decode(&payload),
            Err(DecodeError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn test_checksum_single_byte_flip() {
        for kind in [ChecksumKind::Xor8, ChecksumKind::Sum8, ChecksumKind::Crc16Modbus] {
            let parser = PacketParser::new(vec![checked_layout(kind)]).unwrap();
            let payload = checked_payload(kind, 42);
            assert_eq!(parser.decode(&payload).unwrap().battery_percentage, 42);

            // Bytes 0..3 are the header; flipping those changes the format instead.
            for i in HEADER_LEN..(7 + checked_layout(kind).checksum.unwrap().width()) {
                let mut corrupted = payload.clone();
                corrupted[i] ^= 0x10;
                assert!(
                    matches!(parser.decode(&corrupted), Err(DecodeError::IntegrityFailure { .. })),
                    "{kind:?} flip at {i}"
                );
            }
        }
    }

    #[test]
    fn test_two_byte_battery_with_divisor() {
        let mut layout = checked_layout(ChecksumKind::Xor8);
        layout.checksum = None;
        layout.battery = BatteryField {
            offset: 3,
            width: 2,
            divisor: 10,
        };
        let parser = PacketParser::new(vec![layout]).unwrap();

        let mut payload = vec![0x34, 0x12, 0x01];
        payload.extend_from_slice(&995u16.to_le_bytes());
        payload.extend_from_slice(&[0; 4]);
        assert_eq!(parser.decode(&payload).unwrap().battery_percentage, 99);

        payload[3..5].copy_from_slice(&1010u16.to_le_bytes());
        assert!(matches!(
            parser.decode(&payload),
            Err(DecodeError::OutOfRange { value: 101, .. })
        ));
    }

    #[test]
    fn test_layout_validation() {
        assert!(FrameLayout::ecoflow().validate().is_ok());

        let mut layout = FrameLayout::ecoflow();
        layout.min_length = 19;
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::FieldOutsideFrame { field: "battery", .. })
        ));

        let mut layout = FrameLayout::ecoflow();
        layout.battery.width = 3;
        assert_eq!(layout.validate(), Err(LayoutError::BatteryWidth("EcoFlow".into())));

        let mut layout = checked_layout(ChecksumKind::Crc16Modbus);
        layout.min_length = 8;
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::FieldOutsideFrame { field: "checksum", .. })
        ));

        assert_eq!(PacketParser::new(vec![]).err(), Some(LayoutError::NoLayouts));
    }

    #[test]
    fn test_layout_validation_huge_offsets() {
        let mut layout = FrameLayout::ecoflow();
        layout.battery.offset = usize::MAX;
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::FieldOutsideFrame { field: "battery", end: usize::MAX, .. })
        ));

        let mut layout = FrameLayout::ecoflow();
        layout.serial = Some(SerialField {
            offset: 3,
            length: usize::MAX,
        });
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::FieldOutsideFrame { field: "serial", .. })
        ));

        let mut layout = checked_layout(ChecksumKind::Crc16Modbus);
        layout.checksum = Some(ChecksumField {
            kind: ChecksumKind::Crc16Modbus,
            from: 0,
            at: usize::MAX,
        });
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::FieldOutsideFrame { field: "checksum", .. })
        ));
    }

    #[test]
    fn test_layout_from_toml() {
        let layout: FrameLayout = toml::de::from_str(
            r#"
            name = "Test"
            company_id = 0x1234
            type_tag = 1
            min_length = 9
            battery = { offset = 3 }
            checksum = { kind = "crc16_modbus", at = 7 }
            models = [{ prefix = "X", name = "Model X" }]
            "#,
        )
        .unwrap();
        assert_eq!(layout.battery.width, 1);
        assert_eq!(layout.battery.divisor, 1);
        assert_eq!(layout.checksum, checked_layout(ChecksumKind::Crc16Modbus).checksum);
        assert!(layout.validate().is_ok());
    }
}
