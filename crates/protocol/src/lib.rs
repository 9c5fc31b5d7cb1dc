use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid coordinate. The world is unbounded in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i64,
    pub y: i64,
}

impl CellPos {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance; callers compare against squared radii.
    pub fn dist_sq(&self, other: &CellPos) -> i64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// RGB color. Serialized as `#rrggbb` since clients treat colors as opaque
/// inventory keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn from_hex(s: &str) -> Option<Color> {
        let hex = s.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Color { r, g, b })
    }

    pub fn is_white(&self) -> bool {
        *self == Color::WHITE
    }
}

impl Serialize for Color {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Color::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid color literal: {s}")))
    }
}

/// Economic parameters of a cell, fixed at generation time and zeroed when
/// the cell goes terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CellParams {
    pub food: u32,
    pub building: u32,
    pub experience: u32,
    pub power: u32,
}

/// What a client sees for one cell in its viewport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellView {
    pub pos: CellPos,
    pub color: Color,
    pub params: CellParams,
    pub name: String,
    pub construction_points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub construction_type: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_name: Option<String>,
}

/// Domain rejection codes. These are data, not errors: every illegal action
/// comes back as a rejection the transport layer can relay to the one player
/// who attempted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum RejectReason {
    InsufficientCollectionPower,
    InsufficientInventorySpace,
    InsufficientSatiety,
    InsufficientItems,
    CellAlreadyCollected,
    PlayerNotFound,
    NoUpgradesAvailable,
    InvalidName,
    BuildingTemplateNotFound,
    #[serde(rename_all = "camelCase")]
    ConstructionRequirementNotMet {
        offset: (i64, i64),
        reason: String,
    },
    ConstructionTypeMismatch,
    AlreadyPartOfBuilding,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ConstructionRequirementNotMet { offset, reason } => {
                write!(
                    f,
                    "construction requirement not met at ({},{}): {reason}",
                    offset.0, offset.1
                )
            }
            other => {
                let json = serde_json::to_value(other).unwrap_or_default();
                let code = json
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                f.write_str(code)
            }
        }
    }
}

/// Outcome of one contested tap. `reason` is set iff the tap was rejected,
/// in which case nothing was mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapOutcome {
    pub collected: bool,
    /// The tapping player's cumulative progress on this cell.
    pub progress: u32,
    /// Remaining health, `None` once the cell is terminal.
    pub health: Option<i64>,
    pub color: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<String>,
    pub collected_amount: u32,
    /// Damage actually applied by this tap (0 on rejection).
    pub tap_amount: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// Outcome of tapping a terminal (white) cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetonationOutcome {
    pub exploded: bool,
    pub affected_cells: Vec<CellPos>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Food,
    Experience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpgradeKind {
    Weight,
    MaxHealth,
    Stamina,
    CollectionPower,
    Power,
    Defense,
    Luck,
    Regeneration,
}

/// One leaderboard row; the list is ranked by `total_collected` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub player_id: String,
    pub name: String,
    pub level: u32,
    pub total_collected: u64,
}
