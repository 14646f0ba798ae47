use std::collections::HashSet;
use std::fmt;

use mac_address::MacAddress;

use crate::protocol::{self, FrameLayout};

/// Stable key for a physical device.
///
/// Keyed by BLE address, which is only as stable as the device makes it:
/// a randomized or reused address shows up as a different device, or as the
/// same one, and nothing here can tell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub address: MacAddress,
    /// Name of the frame layout the device was recognised by.
    pub family: String,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.address)
    }
}

/// What can be told about a payload before decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadShape {
    pub company_id: Option<u16>,
    pub type_tag: Option<u8>,
}

impl PayloadShape {
    pub fn of(payload: &[u8]) -> Self {
        let (company_id, type_tag) = protocol::header(payload);
        PayloadShape {
            company_id,
            type_tag,
        }
    }
}

pub struct IdentityResolver {
    families: Vec<(u16, Option<u8>, String)>,
    allowed: HashSet<MacAddress>,
}

impl IdentityResolver {
    /// An empty `allowed` set accepts every address.
    pub fn new(layouts: &[FrameLayout], allowed: impl IntoIterator<Item = MacAddress>) -> Self {
        IdentityResolver {
            families: layouts
                .iter()
                .map(|l| (l.company_id, l.type_tag, l.name.clone()))
                .collect(),
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn resolve(&self, address: MacAddress, shape: PayloadShape) -> Option<DeviceIdentity> {
        let company_id = shape.company_id?;
        if !self.allowed.is_empty() && !self.allowed.contains(&address) {
            return None;
        }
        self.families
            .iter()
            .find(|(company, tag, _)| {
                *company == company_id
                    && match (tag, shape.type_tag) {
                        (Some(expected), Some(actual)) => *expected == actual,
                        _ => true,
                    }
            })
            .map(|(_, _, family)| DeviceIdentity {
                address,
                family: family.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::ecoflow_payload;

    fn river() -> MacAddress {
        MacAddress::new([0xd4, 0x36, 0x39, 0x11, 0x22, 0x33])
    }

    fn neighbour() -> MacAddress {
        MacAddress::new([0xd4, 0x36, 0x39, 0x44, 0x55, 0x66])
    }

    #[test]
    fn test_resolve_ecoflow() {
        let resolver = IdentityResolver::new(&[FrameLayout::ecoflow()], []);
        let payload = ecoflow_payload("R601ZEB4XE1A1234", 80);
        let identity = resolver.resolve(river(), PayloadShape::of(&payload)).unwrap();
        assert_eq!(identity.address, river());
        assert_eq!(identity.family, "EcoFlow");
        assert_eq!(identity.to_string(), "EcoFlow D4:36:39:11:22:33");
    }

    #[test]
    fn test_foreign_company_is_unresolved() {
        let resolver = IdentityResolver::new(&[FrameLayout::ecoflow()], []);
        let apple = [0x4c, 0x00, 0x10, 0x05, 0x01];
        assert_eq!(resolver.resolve(river(), PayloadShape::of(&apple)), None);
        assert_eq!(resolver.resolve(river(), PayloadShape::of(&[0xb5])), None);
    }

    #[test]
    fn test_allow_list() {
        let resolver = IdentityResolver::new(&[FrameLayout::ecoflow()], [river()]);
        let shape = PayloadShape::of(&ecoflow_payload("R601ZEB4XE1A1234", 80));
        assert!(resolver.resolve(river(), shape).is_some());
        assert!(resolver.resolve(neighbour(), shape).is_none());
    }

    #[test]
    fn test_pinned_type_tag() {
        let mut layout = FrameLayout::ecoflow();
        layout.type_tag = Some(0x13);
        let resolver = IdentityResolver::new(&[layout], []);

        let mut payload = ecoflow_payload("R601ZEB4XE1A1234", 80);
        assert!(resolver.resolve(river(), PayloadShape::of(&payload)).is_some());
        payload[2] = 0x14;
        assert!(resolver.resolve(river(), PayloadShape::of(&payload)).is_none());
        // Header only: passed on so the decoder can report the short frame.
        assert!(resolver.resolve(river(), PayloadShape::of(&payload[..2])).is_some());
    }
}
