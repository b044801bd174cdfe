//! Shared types for the geofence gateway
//!
//! Documents arrive as JSON (presence) or TOML (seed data), so every record
//! keeps the fields it does not interpret in a flattened map. A whole-sequence
//! partition replace must write those fields back untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for site IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Newtype wrapper for panel IDs, also used as the panel store reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelId(pub String);

impl std::fmt::Display for PanelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PanelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single member's presence as reported by the presence source
///
/// Any member value that is not an object (`true`, `null`, a string...) reads
/// as outside with no metadata instead of failing the whole document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemberPresence {
    /// Only a literal boolean `true` counts as inside
    pub inside: bool,
    /// Implementation-defined metadata (last seen, device, accuracy...)
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl MemberPresence {
    pub fn inside() -> Self {
        Self { inside: true, metadata: Map::new() }
    }

    pub fn outside() -> Self {
        Self { inside: false, metadata: Map::new() }
    }
}

impl<'de> Deserialize<'de> for MemberPresence {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Value::Object(mut metadata) = Value::deserialize(deserializer)? else {
            return Ok(Self::outside());
        };
        let inside = matches!(metadata.remove("inside"), Some(Value::Bool(true)));
        Ok(Self { inside, metadata })
    }
}

/// Presence snapshot for one site, overwritten wholesale on every update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// memberId -> presence. `None` means the document carries no member set.
    #[serde(default)]
    pub members: Option<HashMap<String, MemberPresence>>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl PresenceState {
    /// Build a snapshot from (member_id, inside) pairs
    pub fn from_members<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: Into<String>,
    {
        let members = members
            .into_iter()
            .map(|(id, inside)| {
                let presence =
                    if inside { MemberPresence::inside() } else { MemberPresence::outside() };
                (id.into(), presence)
            })
            .collect();
        Self { members: Some(members), metadata: Map::new() }
    }

    /// Aggregate occupancy: true iff at least one member is inside.
    ///
    /// Returns `None` when the snapshot has no member set at all. An empty
    /// but present member set yields `Some(false)`.
    pub fn occupancy(&self) -> Option<bool> {
        self.members.as_ref().map(|members| members.values().any(|m| m.inside))
    }

    pub fn member_count(&self) -> usize {
        self.members.as_ref().map_or(0, HashMap::len)
    }
}

/// Presence update delivered by a presence source for evaluation
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub site_id: SiteId,
    /// `None` when the presence document was cleared
    pub presence: Option<PresenceState>,
    pub received_at: Instant,
}

impl PresenceUpdate {
    pub fn new(site_id: SiteId, presence: Option<PresenceState>) -> Self {
        Self { site_id, presence, received_at: Instant::now() }
    }
}

/// Geofence behaviour when a site becomes unoccupied
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeofenceMode {
    Auto,
    #[default]
    Prompt,
    /// Any mode this service does not know; handled like `Prompt`
    Other(String),
}

impl std::str::FromStr for GeofenceMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => GeofenceMode::Auto,
            "prompt" => GeofenceMode::Prompt,
            other => GeofenceMode::Other(other.to_string()),
        })
    }
}

impl GeofenceMode {
    pub fn as_str(&self) -> &str {
        match self {
            GeofenceMode::Auto => "auto",
            GeofenceMode::Prompt => "prompt",
            GeofenceMode::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_auto(&self) -> bool {
        matches!(self, GeofenceMode::Auto)
    }
}

impl From<String> for GeofenceMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => GeofenceMode::Auto,
            "prompt" => GeofenceMode::Prompt,
            _ => GeofenceMode::Other(value),
        }
    }
}

impl From<GeofenceMode> for String {
    fn from(value: GeofenceMode) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: GeofenceMode,
}

/// Site configuration, read-only to the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence: Option<GeofenceConfig>,
}

impl Site {
    pub fn new(id: &str, geofence: Option<GeofenceConfig>) -> Self {
        Self { id: SiteId::from(id), name: None, geofence }
    }

    /// Geofence settings when geofencing is switched on for this site
    pub fn active_geofence(&self) -> Option<&GeofenceConfig> {
        self.geofence.as_ref().filter(|g| g.enabled)
    }
}

/// Partition arm state. Anything other than `Disarmed` counts as armed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PartitionState {
    Disarmed,
    Armed,
    /// Armed sub-states reported by the panel (armed_away, armed_stay, ...)
    Other(String),
}

impl PartitionState {
    pub fn as_str(&self) -> &str {
        match self {
            PartitionState::Disarmed => "disarmed",
            PartitionState::Armed => "armed",
            PartitionState::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_disarmed(&self) -> bool {
        matches!(self, PartitionState::Disarmed)
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        !self.is_disarmed()
    }
}

impl From<String> for PartitionState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "disarmed" => PartitionState::Disarmed,
            "armed" => PartitionState::Armed,
            _ => PartitionState::Other(value),
        }
    }
}

impl From<&str> for PartitionState {
    fn from(value: &str) -> Self {
        PartitionState::from(value.to_string())
    }
}

impl From<PartitionState> for String {
    fn from(value: PartitionState) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independently armable zone of a panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Explicit id; when absent the partition is identified by position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub state: PartitionState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Partition {
    pub fn new(id: &str, state: impl Into<PartitionState>) -> Self {
        Self { id: Some(id.to_string()), state: state.into(), extra: Map::new() }
    }
}

/// Security panel record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub id: PanelId,
    #[serde(alias = "site_id")]
    pub site_id: SiteId,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl Panel {
    pub fn new(id: &str, site_id: &str, partitions: Vec<Partition>) -> Self {
        Self { id: PanelId::from(id), site_id: SiteId::from(site_id), partitions }
    }

    /// True if any partition is in a state other than disarmed
    pub fn is_armed(&self) -> bool {
        self.partitions.iter().any(|p| p.state.is_armed())
    }
}
