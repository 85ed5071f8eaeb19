//! Core domain model and wire events for the incident map client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imc-core";

/// Report identifier in the single form every store and lookup uses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(String);

impl CanonicalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Report identifier as it arrives on the wire or in a document attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for RawId {
    fn from(value: i64) -> Self {
        RawId::Int(value)
    }
}

impl From<u64> for RawId {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(RawId::Int)
            .unwrap_or_else(|_| RawId::Text(value.to_string()))
    }
}

impl From<&str> for RawId {
    fn from(value: &str) -> Self {
        RawId::Text(value.to_string())
    }
}

impl From<String> for RawId {
    fn from(value: String) -> Self {
        RawId::Text(value)
    }
}

/// Convert any raw identifier into its canonical string form. Total; never fails.
pub fn normalize(id: impl Into<RawId>) -> CanonicalId {
    match id.into() {
        RawId::Int(n) => CanonicalId(n.to_string()),
        RawId::Float(f) => CanonicalId(float_id(f)),
        RawId::Text(text) => {
            let trimmed = text.trim();
            match trimmed.parse::<i64>() {
                Ok(n) => CanonicalId(n.to_string()),
                Err(_) => CanonicalId(trimmed.to_string()),
            }
        }
    }
}

fn float_id(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Both axes strictly closer than `tolerance` degrees.
    pub fn within_tolerance(&self, other: &Coordinates, tolerance: f64) -> bool {
        (self.latitude - other.latitude).abs() < tolerance
            && (self.longitude - other.longitude).abs() < tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Checkpoint,
    Raid,
    Patrol,
    Detention,
    #[serde(other)]
    Other,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Checkpoint => "checkpoint",
            ReportType::Raid => "raid",
            ReportType::Patrol => "patrol",
            ReportType::Detention => "detention",
            ReportType::Other => "other",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ReportType::Checkpoint => "Checkpoint",
            ReportType::Raid => "Operation",
            ReportType::Patrol => "Patrol",
            ReportType::Detention => "Facility",
            ReportType::Other => "Report",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            ReportType::Checkpoint => "🛑",
            ReportType::Raid => "🏠",
            ReportType::Patrol => "👮",
            ReportType::Detention => "🧊",
            ReportType::Other => "📍",
        }
    }

    /// Marker colour once the report is confirmed.
    pub fn permanent_color(&self) -> &'static str {
        match self {
            ReportType::Checkpoint => "#ef4444",
            ReportType::Raid => "#f97316",
            ReportType::Patrol => "#3b82f6",
            ReportType::Detention => "#8b5cf6",
            ReportType::Other => "#6b7280",
        }
    }
}

impl FromStr for ReportType {
    type Err = std::convert::Infallible;

    /// Unknown names map to [`ReportType::Other`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "checkpoint" => ReportType::Checkpoint,
            "raid" => ReportType::Raid,
            "patrol" => ReportType::Patrol,
            "detention" => ReportType::Detention,
            _ => ReportType::Other,
        })
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only projection of a server report, as fed to the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFact {
    pub id: CanonicalId,
    pub coordinates: Coordinates,
    pub report_type: ReportType,
    pub inserted_at: Option<DateTime<Utc>>,
}

impl ReportFact {
    pub fn new(
        id: impl Into<RawId>,
        latitude: f64,
        longitude: f64,
        report_type: ReportType,
    ) -> Self {
        Self {
            id: normalize(id),
            coordinates: Coordinates::new(latitude, longitude),
            report_type,
            inserted_at: None,
        }
    }

    pub fn inserted_at(mut self, at: DateTime<Utc>) -> Self {
        self.inserted_at = Some(at);
        self
    }
}

/// Report payload shape used by `load_existing_reports` and `add_report_marker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReport {
    pub id: RawId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "type")]
    pub report_type: ReportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<DateTime<Utc>>,
}

impl From<WireReport> for ReportFact {
    fn from(wire: WireReport) -> Self {
        ReportFact {
            id: normalize(wire.id),
            coordinates: Coordinates::new(wire.latitude, wire.longitude),
            report_type: wire.report_type,
            inserted_at: wire.inserted_at,
        }
    }
}

/// Opaque per-session grouping key. Never used for authorization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_signals(signals: &FingerprintSignals) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(signals.canonical_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Environment signals collected once at page load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FingerprintSignals {
    pub screen: String,
    pub timezone: String,
    pub language: String,
    pub languages: Vec<String>,
    pub platform: String,
    pub user_agent: String,
    pub cookie_enabled: bool,
    pub do_not_track: Option<String>,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub canvas: String,
    pub touch_support: bool,
    pub webgl: Option<String>,
}

impl FingerprintSignals {
    pub fn canonical_string(&self) -> String {
        [
            self.screen.clone(),
            self.timezone.clone(),
            self.language.clone(),
            self.languages.join(","),
            self.platform.clone(),
            self.user_agent.clone(),
            self.cookie_enabled.to_string(),
            self.do_not_track
                .clone()
                .unwrap_or_else(|| "unspecified".to_string()),
            self.hardware_concurrency.to_string(),
            self.device_memory.to_string(),
            self.canvas.clone(),
            self.touch_support.to_string(),
            self.webgl.clone().unwrap_or_else(|| "no-webgl".to_string()),
        ]
        .join("|")
    }
}

/// One polygon feature of the eligible-territory dataset. Rings are `[lng, lat]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryGeometry {
    pub name: String,
    #[serde(default)]
    pub rings: Vec<Vec<[f64; 2]>>,
}

/// Facts pushed from the server over the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum InboundEvent {
    LoadExistingReports {
        reports: Vec<WireReport>,
    },
    AddReportMarker(WireReport),
    RemoveReportMarker {
        id: RawId,
    },
    UsBoundariesData {
        boundaries: Vec<BoundaryGeometry>,
    },
    CoordinateValidationResult {
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
    },
    CleanupCompleted {},
    CleanupTemporaryMarkers {
        fingerprint: Fingerprint,
    },
    CleanupAllMarkersForFingerprint {
        fingerprint: Fingerprint,
        #[serde(default)]
        report_ids: Vec<RawId>,
    },
    /// Result of an address search: recentre and flag the spot briefly.
    FlyToAddress {
        lat: f64,
        lng: f64,
        #[serde(default)]
        address: String,
    },
    /// Server asks for a clean reload after an abandoned submission.
    RefreshBrowser {},
}

/// Every event name [`InboundEvent`] decodes.
pub const INBOUND_EVENT_NAMES: &[&str] = &[
    "load_existing_reports",
    "add_report_marker",
    "remove_report_marker",
    "us_boundaries_data",
    "coordinate_validation_result",
    "cleanup_completed",
    "cleanup_temporary_markers",
    "cleanup_all_markers_for_fingerprint",
    "fly_to_address",
    "refresh_browser",
];

/// A decoded bus frame. Events this client has no handler for are kept by name only.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(InboundEvent),
    Unrecognized(String),
}

#[derive(Deserialize)]
struct EventName {
    event: String,
}

/// Decode one `{"event", "payload"}` frame. Malformed frames of a known event still fail.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    match serde_json::from_str::<InboundEvent>(text) {
        Ok(event) => Ok(InboundFrame::Event(event)),
        Err(err) => match serde_json::from_str::<EventName>(text) {
            Ok(EventName { event }) if !INBOUND_EVENT_NAMES.contains(&event.as_str()) => {
                Ok(InboundFrame::Unrecognized(event))
            }
            _ => Err(err),
        },
    }
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::LoadExistingReports { .. } => "load_existing_reports",
            InboundEvent::AddReportMarker(_) => "add_report_marker",
            InboundEvent::RemoveReportMarker { .. } => "remove_report_marker",
            InboundEvent::UsBoundariesData { .. } => "us_boundaries_data",
            InboundEvent::CoordinateValidationResult { .. } => "coordinate_validation_result",
            InboundEvent::CleanupCompleted {} => "cleanup_completed",
            InboundEvent::CleanupTemporaryMarkers { .. } => "cleanup_temporary_markers",
            InboundEvent::CleanupAllMarkersForFingerprint { .. } => {
                "cleanup_all_markers_for_fingerprint"
            }
            InboundEvent::FlyToAddress { .. } => "fly_to_address",
            InboundEvent::RefreshBrowser {} => "refresh_browser",
        }
    }
}

/// Requests the client issues to the server over the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    GetUsBoundaries {},
    ValidateCoordinates {
        latitude: f64,
        longitude: f64,
        request_id: Uuid,
    },
    MapReport {
        latitude: f64,
        longitude: f64,
        #[serde(rename = "type")]
        report_type: ReportType,
        fingerprint: Fingerprint,
    },
    SelectAddress {
        lat: f64,
        lng: f64,
        address: String,
    },
}
