//! Violation data model shared by the correlator, finalizer, store and bus.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::detect::BoundingBox;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationType {
    /// More riders on one vehicle than the occupancy limit allows.
    Overload,
    /// A rider without a helmet.
    NoHelmet,
}

impl ViolationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::Overload => "overload",
            ViolationType::NoHelmet => "no-helmet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overload" => Some(ViolationType::Overload),
            "no-helmet" => Some(ViolationType::NoHelmet),
            _ => None,
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine amount per violation type.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FineSchedule {
    pub no_helmet: u32,
    pub overload: u32,
}

impl Default for FineSchedule {
    fn default() -> Self {
        Self {
            no_helmet: 800,
            overload: 600,
        }
    }
}

impl FineSchedule {
    pub fn fine_for(&self, violation_type: ViolationType) -> u32 {
        match violation_type {
            ViolationType::Overload => self.overload,
            ViolationType::NoHelmet => self.no_helmet,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationCandidate {
    pub violation_type: ViolationType,
    pub fine: u32,
    pub confidence: f32,
}

/// How the correlator arrived at an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    /// Riders associated to a plate or vehicle anchor.
    Anchor,
    /// Unassociated no-helmet rider, no anchor involved.
    Fallback,
}

/// One unit of finalization work. Consumed exactly once by the finalizer.
#[derive(Clone, Debug)]
pub struct ViolationEvent {
    pub crop: RgbImage,
    /// Crop rectangle in frame pixel space.
    pub region: BoundingBox,
    pub candidates: Vec<ViolationCandidate>,
    pub origin: EventOrigin,
    pub frame_seq: u64,
    pub created_at: SystemTime,
}

/// Registered owner of a vehicle, as returned by plate recognition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub license_plate_number: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub id_number: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Everything the store needs to insert one violation row.
#[derive(Clone, Debug)]
pub struct NewViolation<'a> {
    pub owner: &'a OwnerRecord,
    pub violation_type: ViolationType,
    pub violation_address: &'a str,
    pub fine: u32,
    pub confidence: f32,
    /// JPEG-encoded evidence crop.
    pub crop_jpeg: &'a [u8],
    pub detected_at: SystemTime,
}

/// A violation row after persistence. This is what the notification bus publishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: i64,
    pub license_plate: String,
    pub owner_name: Option<String>,
    pub owner_phone: Option<String>,
    pub owner_email: Option<String>,
    pub owner_address: Option<String>,
    pub violation_type: ViolationType,
    pub violation_address: String,
    pub fine: u32,
    pub confidence: f32,
    /// Hex SHA-256 of the stored crop JPEG.
    pub crop_sha256: String,
    /// Seconds since the Unix epoch.
    pub detected_at: u64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_type_wire_names() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&ViolationType::NoHelmet)?, "\"no-helmet\"");
        assert_eq!(ViolationType::parse("overload"), Some(ViolationType::Overload));
        assert_eq!(ViolationType::parse("speeding"), None);
        Ok(())
    }

    #[test]
    fn owner_record_tolerates_missing_optional_fields() -> anyhow::Result<()> {
        let owner: OwnerRecord =
            serde_json::from_str(r#"{"license_plate_number":"ABC1234","full_name":"Lin"}"#)?;
        assert_eq!(owner.license_plate_number, "ABC1234");
        assert_eq!(owner.full_name.as_deref(), Some("Lin"));
        assert!(owner.email.is_none());
        Ok(())
    }

    #[test]
    fn default_fines() {
        let fines = FineSchedule::default();
        assert_eq!(fines.fine_for(ViolationType::NoHelmet), 800);
        assert_eq!(fines.fine_for(ViolationType::Overload), 600);
    }
}
