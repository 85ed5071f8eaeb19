//! Marker reconciliation engine: tombstones, pending and durable stores, and the merge over them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use imc_core::{normalize, CanonicalId, Coordinates, Fingerprint, ReportFact, ReportType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "imc-reconcile";

/// Colour of a marker still waiting on server confirmation.
pub const PENDING_COLOR: &str = "#fbbf24";

pub const SEARCH_COLOR: &str = "#3b82f6";

/// Element-id prefix of report nodes in the rendered list.
pub const REPORT_NODE_PREFIX: &str = "reports-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerState {
    PendingOptimistic,
    Permanent,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerAppearance {
    pub emoji: String,
    pub color: String,
    pub title: String,
    pub caption: String,
}

impl MarkerAppearance {
    pub fn pending(report_type: ReportType) -> Self {
        Self {
            emoji: report_type.emoji().to_string(),
            color: PENDING_COLOR.to_string(),
            title: report_type.display_name().to_string(),
            caption: "Submitting...".to_string(),
        }
    }

    pub fn permanent(report_type: ReportType) -> Self {
        Self {
            emoji: report_type.emoji().to_string(),
            color: report_type.permanent_color().to_string(),
            title: report_type.display_name().to_string(),
            caption: "Reported".to_string(),
        }
    }

    /// Short-lived marker for a searched address.
    pub fn search_result(address: &str) -> Self {
        Self {
            emoji: "🎯".to_string(),
            color: SEARCH_COLOR.to_string(),
            title: "Found Location".to_string(),
            caption: address.to_string(),
        }
    }
}

/// Visual layer the markers are drawn on. Handles are never reused within a layer.
pub trait MarkerLayer {
    fn add_marker(&mut self, at: Coordinates, appearance: MarkerAppearance) -> MarkerHandle;
    /// Returns false when the handle is not rendered.
    fn update_marker(&mut self, handle: MarkerHandle, appearance: MarkerAppearance) -> bool;
    /// Returns false when the handle is not rendered.
    fn remove_marker(&mut self, handle: MarkerHandle) -> bool;
    fn contains(&self, handle: MarkerHandle) -> bool;
    fn handles(&self) -> Vec<MarkerHandle>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMarker {
    pub coordinates: Coordinates,
    pub appearance: MarkerAppearance,
}

/// In-memory layer used by the CLI replay and by tests.
#[derive(Debug, Default)]
pub struct RecordingLayer {
    next_handle: u64,
    markers: BTreeMap<MarkerHandle, RenderedMarker>,
}

impl RecordingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: MarkerHandle) -> Option<&RenderedMarker> {
        self.markers.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl MarkerLayer for RecordingLayer {
    fn add_marker(&mut self, at: Coordinates, appearance: MarkerAppearance) -> MarkerHandle {
        self.next_handle += 1;
        let handle = MarkerHandle(self.next_handle);
        self.markers.insert(
            handle,
            RenderedMarker {
                coordinates: at,
                appearance,
            },
        );
        handle
    }

    fn update_marker(&mut self, handle: MarkerHandle, appearance: MarkerAppearance) -> bool {
        match self.markers.get_mut(&handle) {
            Some(marker) => {
                marker.appearance = appearance;
                true
            }
            None => false,
        }
    }

    fn remove_marker(&mut self, handle: MarkerHandle) -> bool {
        self.markers.remove(&handle).is_some()
    }

    fn contains(&self, handle: MarkerHandle) -> bool {
        self.markers.contains_key(&handle)
    }

    fn handles(&self) -> Vec<MarkerHandle> {
        self.markers.keys().copied().collect()
    }
}

/// A report node as observed in the rendered report list. Attribute values are raw strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportNode {
    pub element_id: String,
    pub latitude: String,
    pub longitude: String,
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<String>,
}

impl ReportNode {
    pub fn from_fact(fact: &ReportFact) -> Self {
        Self {
            element_id: format!("{REPORT_NODE_PREFIX}{}", fact.id),
            latitude: fact.coordinates.latitude.to_string(),
            longitude: fact.coordinates.longitude.to_string(),
            report_type: fact.report_type.to_string(),
            inserted_at: fact.inserted_at.map(|at| at.to_rfc3339()),
        }
    }

    pub fn report_id(&self) -> CanonicalId {
        let raw = self
            .element_id
            .strip_prefix(REPORT_NODE_PREFIX)
            .unwrap_or(&self.element_id);
        normalize(raw)
    }

    pub fn inserted_at(&self) -> Option<DateTime<Utc>> {
        self.inserted_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    /// `None` when the node lacks usable coordinates or a type.
    pub fn to_fact(&self) -> Option<ReportFact> {
        let latitude = self.latitude.trim().parse::<f64>().ok()?;
        let longitude = self.longitude.trim().parse::<f64>().ok()?;
        if !latitude.is_finite() || !longitude.is_finite() || self.report_type.trim().is_empty() {
            return None;
        }
        let report_type = self.report_type.parse::<ReportType>().unwrap_or(ReportType::Other);
        Some(ReportFact {
            id: self.report_id(),
            coordinates: Coordinates::new(latitude, longitude),
            report_type,
            inserted_at: self.inserted_at(),
        })
    }
}

/// The rendered report list, treated as a second source of truth.
pub trait ReportDocument {
    fn report_nodes(&self) -> Vec<ReportNode>;
    /// A node rendered by the server; replaces any node with the same id.
    fn insert_report(&mut self, node: ReportNode);
    /// Returns false when no node carries that id.
    fn remove_report(&mut self, id: &CanonicalId) -> bool;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportListDocument {
    nodes: Vec<ReportNode>,
}

impl ReportListDocument {
    pub fn new(nodes: Vec<ReportNode>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl ReportDocument for ReportListDocument {
    fn report_nodes(&self) -> Vec<ReportNode> {
        self.nodes.clone()
    }

    fn insert_report(&mut self, node: ReportNode) {
        let id = node.report_id();
        self.nodes.retain(|existing| existing.report_id() != id);
        self.nodes.push(node);
    }

    fn remove_report(&mut self, id: &CanonicalId) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| &node.report_id() != id);
        self.nodes.len() != before
    }
}

#[derive(Debug, Clone, Default)]
pub struct TombstoneSet {
    ids: HashSet<CanonicalId>,
}

impl TombstoneSet {
    /// Returns true when the id was not already tombstoned.
    pub fn tombstone(&mut self, id: CanonicalId) -> bool {
        self.ids.insert(id)
    }

    pub fn is_tombstoned(&self, id: &CanonicalId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn sorted(&self) -> Vec<CanonicalId> {
        let mut ids = self.ids.iter().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn clear(&mut self) {
        self.ids.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingMarker {
    pub handle: MarkerHandle,
    pub coordinates: Coordinates,
    pub report_type: ReportType,
    pub fingerprint: Option<Fingerprint>,
    pub created_at: DateTime<Utc>,
}

type Cell = (i64, i64);

/// Optimistic markers keyed by insertion order, indexed by fingerprint and by a coordinate grid.
///
/// The grid cell edge equals the match tolerance, so any entry within tolerance of a
/// point sits in the point's cell or one of its eight neighbours.
#[derive(Debug, Clone)]
pub struct EphemeralStore {
    tolerance: f64,
    next_seq: u64,
    entries: BTreeMap<u64, PendingMarker>,
    by_fingerprint: HashMap<Fingerprint, Vec<u64>>,
    by_cell: HashMap<Cell, BTreeSet<u64>>,
}

impl EphemeralStore {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            next_seq: 0,
            entries: BTreeMap::new(),
            by_fingerprint: HashMap::new(),
            by_cell: HashMap::new(),
        }
    }

    fn cell(&self, at: &Coordinates) -> Cell {
        (
            (at.latitude / self.tolerance).floor() as i64,
            (at.longitude / self.tolerance).floor() as i64,
        )
    }

    pub fn insert(&mut self, marker: PendingMarker) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let cell = self.cell(&marker.coordinates);
        self.by_cell.entry(cell).or_default().insert(seq);
        if let Some(fingerprint) = &marker.fingerprint {
            self.by_fingerprint
                .entry(fingerprint.clone())
                .or_default()
                .push(seq);
        }
        self.entries.insert(seq, marker);
        seq
    }

    /// Remove and return the earliest entry of `report_type` within tolerance of `at`.
    pub fn take_match(
        &mut self,
        at: &Coordinates,
        report_type: ReportType,
    ) -> Option<PendingMarker> {
        let (row, col) = self.cell(at);
        let mut best: Option<u64> = None;
        for d_row in -1..=1 {
            for d_col in -1..=1 {
                let Some(bucket) = self.by_cell.get(&(row + d_row, col + d_col)) else {
                    continue;
                };
                for seq in bucket {
                    if best.is_some_and(|b| b <= *seq) {
                        break;
                    }
                    let Some(entry) = self.entries.get(seq) else {
                        continue;
                    };
                    if entry.report_type == report_type
                        && entry.coordinates.within_tolerance(at, self.tolerance)
                    {
                        best = Some(*seq);
                        break;
                    }
                }
            }
        }
        best.and_then(|seq| self.remove(seq))
    }

    /// Remove and return every entry recorded under `fingerprint`, in insertion order.
    pub fn drain_fingerprint(&mut self, fingerprint: &Fingerprint) -> Vec<PendingMarker> {
        let seqs = self.by_fingerprint.remove(fingerprint).unwrap_or_default();
        seqs.into_iter().filter_map(|seq| self.remove(seq)).collect()
    }

    fn remove(&mut self, seq: u64) -> Option<PendingMarker> {
        let marker = self.entries.remove(&seq)?;
        let cell = self.cell(&marker.coordinates);
        if let Some(bucket) = self.by_cell.get_mut(&cell) {
            bucket.remove(&seq);
            if bucket.is_empty() {
                self.by_cell.remove(&cell);
            }
        }
        if let Some(fingerprint) = &marker.fingerprint {
            if let Some(seqs) = self.by_fingerprint.get_mut(fingerprint) {
                seqs.retain(|s| *s != seq);
                if seqs.is_empty() {
                    self.by_fingerprint.remove(fingerprint);
                }
            }
        }
        Some(marker)
    }

    pub fn contains_handle(&self, handle: MarkerHandle) -> bool {
        self.entries.values().any(|entry| entry.handle == handle)
    }

    pub fn fingerprint_len(&self, fingerprint: &Fingerprint) -> usize {
        self.by_fingerprint.get(fingerprint).map_or(0, Vec::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMarker> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_fingerprint.clear();
        self.by_cell.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurableMarker {
    pub handle: MarkerHandle,
    pub coordinates: Coordinates,
    pub report_type: ReportType,
    pub inserted_at: Option<DateTime<Utc>>,
}

/// Confirmed markers by report id, plus the handle -> id bindings seen this session.
#[derive(Debug, Clone, Default)]
pub struct DurableIndex {
    markers: BTreeMap<CanonicalId, DurableMarker>,
    bindings: HashMap<MarkerHandle, CanonicalId>,
}

impl DurableIndex {
    pub fn insert(&mut self, id: CanonicalId, marker: DurableMarker) -> Option<DurableMarker> {
        self.bindings.insert(marker.handle, id.clone());
        self.markers.insert(id, marker)
    }

    pub fn get(&self, id: &CanonicalId) -> Option<&DurableMarker> {
        self.markers.get(id)
    }

    pub fn contains(&self, id: &CanonicalId) -> bool {
        self.markers.contains_key(id)
    }

    pub fn remove(&mut self, id: &CanonicalId) -> Option<DurableMarker> {
        self.markers.remove(id)
    }

    /// Drop the binding of a handle that has left the layer.
    fn unbind(&mut self, handle: MarkerHandle) {
        self.bindings.remove(&handle);
    }

    pub fn bindings_len(&self) -> usize {
        self.bindings.len()
    }

    /// Reverse lookup. Bindings outlive index entries so drifted layer markers stay traceable.
    pub fn owner_of(&self, handle: MarkerHandle) -> Option<&CanonicalId> {
        self.bindings.get(&handle)
    }

    pub fn contains_handle(&self, handle: MarkerHandle) -> bool {
        self.bindings
            .get(&handle)
            .and_then(|id| self.markers.get(id))
            .is_some_and(|marker| marker.handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalId, &DurableMarker)> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn drain(&mut self) -> Vec<(CanonicalId, DurableMarker)> {
        std::mem::take(&mut self.markers).into_iter().collect()
    }

    fn clear(&mut self) {
        self.markers.clear();
        self.bindings.clear();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Degrees on each axis for a fact to claim a pending marker.
    pub match_tolerance: f64,
    pub report_lifetime: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            match_tolerance: 0.001,
            report_lifetime: Duration::hours(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    IgnoredTombstoned,
    IgnoredDuplicate,
    Promoted(MarkerHandle),
    Materialized(MarkerHandle),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub promoted: usize,
    pub materialized: usize,
    pub ignored_tombstoned: usize,
    pub ignored_duplicate: usize,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::IgnoredTombstoned => self.ignored_tombstoned += 1,
            ReconcileOutcome::IgnoredDuplicate => self.ignored_duplicate += 1,
            ReconcileOutcome::Promoted(_) => self.promoted += 1,
            ReconcileOutcome::Materialized(_) => self.materialized += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub ephemeral_removed: usize,
    pub durable_removed: usize,
    pub documents_removed: usize,
    /// Layer markers only the repair pass caught.
    pub repaired: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurableEntry {
    pub id: CanonicalId,
    #[serde(flatten)]
    pub marker: DurableMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub durable: Vec<DurableEntry>,
    pub pending: Vec<PendingMarker>,
    pub tombstones: Vec<CanonicalId>,
}

/// All page-lifetime marker state of one map session. The single owner of the stores.
#[derive(Debug, Clone)]
pub struct ReconciliationState {
    config: ReconcileConfig,
    tombstones: TombstoneSet,
    ephemeral: EphemeralStore,
    durable: DurableIndex,
}

impl ReconciliationState {
    pub fn init(config: ReconcileConfig) -> Self {
        Self {
            config,
            tombstones: TombstoneSet::default(),
            ephemeral: EphemeralStore::new(config.match_tolerance),
            durable: DurableIndex::default(),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn tombstones(&self) -> &TombstoneSet {
        &self.tombstones
    }

    pub fn ephemeral(&self) -> &EphemeralStore {
        &self.ephemeral
    }

    pub fn durable(&self) -> &DurableIndex {
        &self.durable
    }

    /// Draw a marker for a local submission and track it until a fact claims it.
    pub fn create_pending(
        &mut self,
        layer: &mut dyn MarkerLayer,
        at: Coordinates,
        report_type: ReportType,
        fingerprint: Option<Fingerprint>,
        now: DateTime<Utc>,
    ) -> MarkerHandle {
        let handle = layer.add_marker(at, MarkerAppearance::pending(report_type));
        self.ephemeral.insert(PendingMarker {
            handle,
            coordinates: at,
            report_type,
            fingerprint,
            created_at: now,
        });
        debug!(?handle, %report_type, "pending marker created");
        handle
    }

    pub fn reconcile(&mut self, layer: &mut dyn MarkerLayer, fact: ReportFact) -> ReconcileOutcome {
        let ReportFact {
            id,
            coordinates,
            report_type,
            inserted_at,
        } = fact;

        if self.tombstones.is_tombstoned(&id) {
            // The submission this fact confirms was removed before it arrived.
            if let Some(pending) = self.ephemeral.take_match(&coordinates, report_type) {
                layer.remove_marker(pending.handle);
                debug!(%id, handle = ?pending.handle, "pending marker of removed report dropped");
            }
            debug!(%id, "fact ignored: tombstoned");
            return ReconcileOutcome::IgnoredTombstoned;
        }
        if self.durable.contains(&id) {
            debug!(%id, "fact ignored: already durable");
            return ReconcileOutcome::IgnoredDuplicate;
        }

        let permanent = MarkerAppearance::permanent(report_type);
        let outcome = match self.ephemeral.take_match(&coordinates, report_type) {
            Some(pending) if layer.update_marker(pending.handle, permanent.clone()) => {
                ReconcileOutcome::Promoted(pending.handle)
            }
            Some(pending) => {
                warn!(
                    %id,
                    handle = ?pending.handle,
                    "pending marker missing from layer; materializing"
                );
                ReconcileOutcome::Materialized(layer.add_marker(coordinates, permanent))
            }
            None => ReconcileOutcome::Materialized(layer.add_marker(coordinates, permanent)),
        };
        let (ReconcileOutcome::Promoted(handle) | ReconcileOutcome::Materialized(handle)) = outcome
        else {
            return outcome;
        };

        self.durable.insert(
            id.clone(),
            DurableMarker {
                handle,
                coordinates,
                report_type,
                inserted_at,
            },
        );
        debug!(%id, ?outcome, "fact reconciled");
        outcome
    }

    /// Bulk variant. The resulting durable index does not depend on the order of `facts`.
    pub fn reconcile_all(
        &mut self,
        layer: &mut dyn MarkerLayer,
        mut facts: Vec<ReportFact>,
    ) -> ReconcileSummary {
        facts.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then(a.coordinates.latitude.total_cmp(&b.coordinates.latitude))
                .then(a.coordinates.longitude.total_cmp(&b.coordinates.longitude))
                .then(a.report_type.cmp(&b.report_type))
        });
        facts.dedup_by(|later, earlier| later.id == earlier.id);

        let mut summary = ReconcileSummary::default();
        for fact in facts {
            summary.record(self.reconcile(layer, fact));
        }
        info!(
            promoted = summary.promoted,
            materialized = summary.materialized,
            ignored = summary.ignored_tombstoned + summary.ignored_duplicate,
            "bulk reconcile complete"
        );
        summary
    }

    /// Tombstone `id` and drop its durable marker. Returns whether a marker was tracked.
    pub fn remove(&mut self, layer: &mut dyn MarkerLayer, id: &CanonicalId) -> bool {
        self.tombstones.tombstone(id.clone());
        match self.durable.remove(id) {
            Some(marker) => {
                if layer.remove_marker(marker.handle) {
                    self.durable.unbind(marker.handle);
                }
                debug!(%id, handle = ?marker.handle, "durable marker removed");
                true
            }
            None => {
                debug!(%id, "removal of untracked id recorded as tombstone");
                false
            }
        }
    }

    /// Reconcile every document node not yet durable or tombstoned.
    pub fn observe_document(
        &mut self,
        layer: &mut dyn MarkerLayer,
        document: &dyn ReportDocument,
    ) -> ReconcileSummary {
        let facts = document
            .report_nodes()
            .iter()
            .filter_map(ReportNode::to_fact)
            .collect::<Vec<_>>();
        self.reconcile_all(layer, facts)
    }

    /// Rebuild the durable index from the document. Pending markers and tombstones survive.
    pub fn refresh_from_document(
        &mut self,
        layer: &mut dyn MarkerLayer,
        document: &dyn ReportDocument,
    ) -> ReconcileSummary {
        for (id, marker) in self.durable.drain() {
            if layer.remove_marker(marker.handle) {
                self.durable.unbind(marker.handle);
            } else {
                debug!(%id, handle = ?marker.handle, "durable marker already gone from layer");
            }
        }
        self.observe_document(layer, document)
    }

    /// Evict every known report older than the configured lifetime. Strictly older only.
    pub fn sweep_expired(
        &mut self,
        layer: &mut dyn MarkerLayer,
        document: &mut dyn ReportDocument,
        now: DateTime<Utc>,
    ) -> Vec<CanonicalId> {
        let mut candidates = BTreeMap::<CanonicalId, DateTime<Utc>>::new();
        for node in document.report_nodes() {
            if let Some(at) = node.inserted_at() {
                candidates.insert(node.report_id(), at);
            }
        }
        for (id, marker) in self.durable.iter() {
            if let Some(at) = marker.inserted_at {
                candidates.entry(id.clone()).or_insert(at);
            }
        }

        let lifetime = self.config.report_lifetime;
        let expired = candidates
            .into_iter()
            .filter(|(_, inserted_at)| {
                // Timestamps too far out to carry a lifetime never expire.
                inserted_at
                    .checked_add_signed(lifetime)
                    .is_some_and(|expires_at| now > expires_at)
            })
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        for id in &expired {
            document.remove_report(id);
            self.remove(layer, id);
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "expired reports swept");
        }
        expired
    }

    /// Drop every pending marker recorded under `fingerprint`. Other fingerprints are untouched.
    pub fn cleanup_ephemeral(
        &mut self,
        layer: &mut dyn MarkerLayer,
        fingerprint: &Fingerprint,
    ) -> usize {
        let drained = self.ephemeral.drain_fingerprint(fingerprint);
        for pending in &drained {
            layer.remove_marker(pending.handle);
        }
        if !drained.is_empty() {
            info!(%fingerprint, removed = drained.len(), "pending markers cleaned up");
        }
        drained.len()
    }

    /// Pending cleanup plus removal of `report_ids` from the index, layer and document,
    /// followed by the consistency-repair pass over every rendered marker.
    pub fn cleanup_all(
        &mut self,
        layer: &mut dyn MarkerLayer,
        document: &mut dyn ReportDocument,
        fingerprint: &Fingerprint,
        report_ids: &[CanonicalId],
    ) -> CleanupSummary {
        let mut summary = CleanupSummary {
            ephemeral_removed: self.cleanup_ephemeral(layer, fingerprint),
            ..CleanupSummary::default()
        };

        let targets = report_ids.iter().cloned().collect::<BTreeSet<_>>();
        for id in &targets {
            if self.remove(layer, id) {
                summary.durable_removed += 1;
            }
            if document.remove_report(id) {
                summary.documents_removed += 1;
            }
        }

        // Consistency repair: catch layer markers the index lost track of.
        for handle in layer.handles() {
            let Some(owner) = self.durable.owner_of(handle) else {
                continue;
            };
            if targets.contains(owner) && layer.remove_marker(handle) {
                summary.repaired += 1;
                warn!(
                    id = %owner,
                    ?handle,
                    "repair pass removed a marker missed by the durable index"
                );
                self.durable.unbind(handle);
            }
        }

        info!(
            %fingerprint,
            ephemeral = summary.ephemeral_removed,
            durable = summary.durable_removed,
            documents = summary.documents_removed,
            repaired = summary.repaired,
            "fingerprint cleanup complete"
        );
        summary
    }

    pub fn marker_state(&self, handle: MarkerHandle) -> MarkerState {
        if self.ephemeral.contains_handle(handle) {
            MarkerState::PendingOptimistic
        } else if self.durable.contains_handle(handle) {
            MarkerState::Permanent
        } else {
            MarkerState::Removed
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            durable: self
                .durable
                .iter()
                .map(|(id, marker)| DurableEntry {
                    id: id.clone(),
                    marker: marker.clone(),
                })
                .collect(),
            pending: self.ephemeral.iter().cloned().collect(),
            tombstones: self.tombstones.sorted(),
        }
    }

    /// Teardown: clears tombstones, pending entries, fingerprint buckets and the index together.
    pub fn dispose(&mut self) {
        self.tombstones.clear();
        self.ephemeral.clear();
        self.durable.clear();
    }
}
