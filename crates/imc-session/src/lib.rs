//! Map session lifecycle: mount, inbound event dispatch, local submissions and the run loop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use imc_cache::{
    BoundaryCache, BoundingBox, BusBoundarySource, CacheConfig, CoordinateValidator,
    OutboundSender, ValidatorConfig,
};
use imc_core::{
    normalize, BoundaryGeometry, CanonicalId, Coordinates, Fingerprint, InboundEvent,
    OutboundEvent, ReportFact, ReportType,
};
use imc_reconcile::{
    MarkerAppearance, MarkerHandle, MarkerLayer, ReconcileConfig, ReconcileOutcome,
    ReconcileSummary, ReconciliationState, ReportDocument, ReportNode, StateSnapshot,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "imc-session";

/// How long a searched-address marker stays on the map.
pub const SEARCH_MARKER_LIFETIME: Duration = Duration::from_secs(5);

/// Delay between a `refresh_browser` request and the reload.
pub const RELOAD_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sweep_interval: Duration,
    pub reconcile: ReconcileConfig,
    pub cache: CacheConfig,
    pub validator: ValidatorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5 * 60),
            reconcile: ReconcileConfig::default(),
            cache: CacheConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

/// Optional overrides shared by the env and YAML loaders.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SessionOverrides {
    sweep_interval_secs: Option<u64>,
    report_lifetime_secs: Option<i64>,
    match_tolerance_deg: Option<f64>,
    cache_ttl_secs: Option<u64>,
    cache_dir: Option<PathBuf>,
    boundary_fetch_timeout_ms: Option<u64>,
    validation_timeout_ms: Option<u64>,
    fallback: Option<BoundingBox>,
}

impl SessionOverrides {
    fn apply(self, mut config: SessionConfig) -> SessionConfig {
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.report_lifetime_secs {
            match TimeDelta::try_seconds(secs) {
                Some(lifetime) => config.reconcile.report_lifetime = lifetime,
                None => warn!(secs, "report lifetime out of range; keeping default"),
            }
        }
        if let Some(tolerance) = self.match_tolerance_deg.filter(|t| *t > 0.0) {
            config.reconcile.match_tolerance = tolerance;
        }
        if let Some(secs) = self.cache_ttl_secs {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = self.cache_dir {
            config.cache.cache_dir = dir;
        }
        if let Some(ms) = self.boundary_fetch_timeout_ms {
            config.cache.fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.validation_timeout_ms {
            config.validator.timeout = Duration::from_millis(ms);
        }
        if let Some(fallback) = self.fallback {
            config.validator.fallback = fallback;
        }
        config
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SessionConfig {
    pub fn from_env() -> Self {
        SessionOverrides {
            sweep_interval_secs: env_parsed("IMC_SWEEP_INTERVAL_SECS"),
            report_lifetime_secs: env_parsed("IMC_REPORT_LIFETIME_SECS"),
            match_tolerance_deg: env_parsed("IMC_MATCH_TOLERANCE_DEG"),
            cache_ttl_secs: env_parsed("IMC_CACHE_TTL_SECS"),
            cache_dir: std::env::var("IMC_CACHE_DIR").ok().map(PathBuf::from),
            boundary_fetch_timeout_ms: env_parsed("IMC_BOUNDARY_FETCH_TIMEOUT_MS"),
            validation_timeout_ms: env_parsed("IMC_VALIDATION_TIMEOUT_MS"),
            fallback: None,
        }
        .apply(Self::default())
    }

    /// Fields missing from the file keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let overrides: SessionOverrides = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(overrides.apply(Self::default()))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("map container is missing; session not mounted")]
    MissingMapContainer,
}

/// The rendering surface a session draws on.
pub struct MapSurface {
    pub layer: Box<dyn MarkerLayer + Send>,
    pub document: Box<dyn ReportDocument + Send>,
}

/// Everything the session loop accepts besides timer ticks.
#[derive(Debug, Clone)]
pub enum SessionInput {
    Inbound(InboundEvent),
    /// A click on the map. Submitted only if the point validates.
    MapClick {
        coordinates: Coordinates,
        report_type: ReportType,
    },
    /// Submit without validation.
    SubmitReport {
        coordinates: Coordinates,
        report_type: ReportType,
    },
    SelectAddress {
        coordinates: Coordinates,
        address: String,
    },
    /// The host rendered a new node into the report list.
    NodeAdded(ReportNode),
}

/// Results of work the run loop handed off to spawned tasks.
#[derive(Debug)]
enum Feedback {
    Boundaries(Vec<BoundaryGeometry>),
    ClickValidated {
        coordinates: Coordinates,
        report_type: ReportType,
        valid: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub fingerprint: Fingerprint,
    pub state: StateSnapshot,
    pub rendered_markers: usize,
    pub document_nodes: usize,
    pub boundary_features: usize,
    pub view_center: Option<Coordinates>,
}

pub type BoundaryHandle = Arc<BoundaryCache<BusBoundarySource>>;

pub struct MapSession {
    config: SessionConfig,
    fingerprint: Fingerprint,
    state: ReconciliationState,
    surface: MapSurface,
    outbound: OutboundSender,
    boundary_source: Arc<BusBoundarySource>,
    boundaries: BoundaryHandle,
    validator: CoordinateValidator,
    boundary_geometry: Vec<BoundaryGeometry>,
    view_center: Option<Coordinates>,
    /// Deadlines are pushed in order, so the front expires first.
    search_markers: VecDeque<(Instant, MarkerHandle)>,
    reload_at: Option<Instant>,
}

impl MapSession {
    /// Mount onto `surface` and load the reports already in its document.
    /// Without a surface nothing is created.
    pub fn mount(
        config: SessionConfig,
        fingerprint: Fingerprint,
        surface: Option<MapSurface>,
        outbound: OutboundSender,
    ) -> Result<Self, SessionError> {
        let Some(surface) = surface else {
            warn!("map container missing; skipping initialization");
            return Err(SessionError::MissingMapContainer);
        };

        let boundary_source = Arc::new(BusBoundarySource::new(outbound.clone()));
        let boundaries = Arc::new(BoundaryCache::new(
            config.cache.clone(),
            boundary_source.clone(),
        ));
        let validator = CoordinateValidator::new(config.validator, outbound.clone());

        let mut session = Self {
            state: ReconciliationState::init(config.reconcile),
            config,
            fingerprint,
            surface,
            outbound,
            boundary_source,
            boundaries,
            validator,
            boundary_geometry: Vec::new(),
            view_center: None,
            search_markers: VecDeque::new(),
            reload_at: None,
        };
        let summary = session.observe_document();
        info!(
            fingerprint = %session.fingerprint,
            reports = summary.materialized + summary.promoted,
            "map session mounted"
        );
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn boundaries(&self) -> BoundaryHandle {
        self.boundaries.clone()
    }

    pub fn validator(&self) -> CoordinateValidator {
        self.validator.clone()
    }

    pub fn boundary_geometry(&self) -> &[BoundaryGeometry] {
        &self.boundary_geometry
    }

    /// Boundary geometry for map setup. Any cache failure degrades to an empty set.
    pub async fn load_boundaries(boundaries: &BoundaryHandle) -> Vec<BoundaryGeometry> {
        match boundaries.get().await {
            Ok(geometry) => geometry,
            Err(err) => {
                warn!(error = %err, "boundary geometry unavailable; continuing without it");
                Vec::new()
            }
        }
    }

    /// Send the report to the server and show it immediately as pending.
    pub fn submit_report(
        &mut self,
        coordinates: Coordinates,
        report_type: ReportType,
        now: DateTime<Utc>,
    ) -> MarkerHandle {
        let sent = self.outbound.send(OutboundEvent::MapReport {
            latitude: coordinates.latitude,
            longitude: coordinates.longitude,
            report_type,
            fingerprint: self.fingerprint.clone(),
        });
        if sent.is_err() {
            warn!("event bus closed; report kept as pending only");
        }
        self.state.create_pending(
            &mut *self.surface.layer,
            coordinates,
            report_type,
            Some(self.fingerprint.clone()),
            now,
        )
    }

    /// Submit a clicked point once validation has answered.
    fn click_validated(
        &mut self,
        coordinates: Coordinates,
        report_type: ReportType,
        valid: bool,
    ) -> Option<MarkerHandle> {
        if !valid {
            info!(
                latitude = coordinates.latitude,
                longitude = coordinates.longitude,
                "click outside the eligible area; not submitted"
            );
            return None;
        }
        Some(self.submit_report(coordinates, report_type, Utc::now()))
    }

    pub fn select_address(&self, coordinates: Coordinates, address: String) -> bool {
        self.outbound
            .send(OutboundEvent::SelectAddress {
                lat: coordinates.latitude,
                lng: coordinates.longitude,
                address,
            })
            .is_ok()
    }

    /// Polling feed over the rendered list.
    pub fn observe_document(&mut self) -> ReconcileSummary {
        self.state
            .observe_document(&mut *self.surface.layer, &*self.surface.document)
    }

    /// Mutation feed: one node was rendered into the list.
    pub fn node_added(&mut self, node: ReportNode) -> Option<ReconcileOutcome> {
        let fact = node.to_fact();
        self.surface.document.insert_report(node);
        let Some(fact) = fact else {
            debug!("rendered node without usable coordinates ignored");
            return None;
        };
        Some(self.state.reconcile(&mut *self.surface.layer, fact))
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<CanonicalId> {
        self.state.sweep_expired(
            &mut *self.surface.layer,
            &mut *self.surface.document,
            now,
        )
    }

    /// Recentre on a searched address and flag it until [`SEARCH_MARKER_LIFETIME`] passes.
    fn fly_to(&mut self, at: Coordinates, address: &str, now: Instant) -> MarkerHandle {
        self.view_center = Some(at);
        let handle = self
            .surface
            .layer
            .add_marker(at, MarkerAppearance::search_result(address));
        self.search_markers
            .push_back((now + SEARCH_MARKER_LIFETIME, handle));
        debug!(?handle, address, "search marker shown");
        handle
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let search = self.search_markers.front().map(|(at, _)| *at);
        match (search, self.reload_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run every timer due at `now`: expire search markers, then any scheduled reload.
    pub fn fire_timers(&mut self, now: Instant) {
        while let Some((deadline, handle)) = self.search_markers.front().copied() {
            if deadline > now {
                break;
            }
            self.search_markers.pop_front();
            if self.surface.layer.remove_marker(handle) {
                debug!(?handle, "search marker expired");
            }
        }
        if self.reload_at.is_some_and(|at| at <= now) {
            self.reload_at = None;
            self.reload();
        }
    }

    /// Drop all page state and rebuild it from the document, as a fresh page load would.
    pub fn reload(&mut self) -> ReconcileSummary {
        for handle in self.surface.layer.handles() {
            self.surface.layer.remove_marker(handle);
        }
        self.search_markers.clear();
        self.view_center = None;
        self.state = ReconciliationState::init(self.config.reconcile);
        let summary = self.observe_document();
        info!(
            reports = summary.materialized,
            "session reloaded from the report list"
        );
        summary
    }

    pub async fn handle_inbound(&mut self, event: InboundEvent) {
        let span = info_span!("dispatch", event = event.name());
        self.dispatch(event).instrument(span).await
    }

    async fn dispatch(&mut self, event: InboundEvent) {
        let layer = &mut *self.surface.layer;
        match event {
            InboundEvent::LoadExistingReports { reports } => {
                let facts = reports.into_iter().map(ReportFact::from).collect();
                self.state.reconcile_all(layer, facts);
            }
            InboundEvent::AddReportMarker(report) => {
                self.state.reconcile(layer, ReportFact::from(report));
            }
            InboundEvent::RemoveReportMarker { id } => {
                self.state.remove(layer, &normalize(id));
            }
            InboundEvent::UsBoundariesData { boundaries } => {
                if let Err(unsolicited) = self.boundary_source.deliver(boundaries).await {
                    self.boundaries.accept_push(unsolicited).await;
                }
            }
            InboundEvent::CoordinateValidationResult { valid, request_id } => {
                self.validator.resolve(valid, request_id).await;
            }
            InboundEvent::CleanupCompleted {} => {
                self.state
                    .refresh_from_document(layer, &*self.surface.document);
            }
            InboundEvent::CleanupTemporaryMarkers { fingerprint } => {
                self.state.cleanup_ephemeral(layer, &fingerprint);
            }
            InboundEvent::CleanupAllMarkersForFingerprint {
                fingerprint,
                report_ids,
            } => {
                let ids = report_ids.into_iter().map(normalize).collect::<Vec<_>>();
                self.state.cleanup_all(
                    layer,
                    &mut *self.surface.document,
                    &fingerprint,
                    &ids,
                );
            }
            InboundEvent::FlyToAddress { lat, lng, address } => {
                self.fly_to(Coordinates::new(lat, lng), &address, Instant::now());
            }
            InboundEvent::RefreshBrowser {} => {
                info!("reload requested by server");
                self.reload_at = Some(Instant::now() + RELOAD_DELAY);
            }
        }
    }

    /// Apply one input. Outside [`MapSession::run`] a map click waits for its
    /// validation inline, so its answer must come from another task.
    pub async fn apply(&mut self, input: SessionInput) {
        match input {
            SessionInput::Inbound(event) => self.handle_inbound(event).await,
            SessionInput::MapClick {
                coordinates,
                report_type,
            } => {
                let valid = self.validator.validate(coordinates).await;
                self.click_validated(coordinates, report_type, valid);
            }
            SessionInput::SubmitReport {
                coordinates,
                report_type,
            } => {
                self.submit_report(coordinates, report_type, Utc::now());
            }
            SessionInput::SelectAddress {
                coordinates,
                address,
            } => {
                self.select_address(coordinates, address);
            }
            SessionInput::NodeAdded(node) => {
                self.node_added(node);
            }
        }
    }

    fn spawn_boundary_load(&self, feedback: mpsc::UnboundedSender<Feedback>) {
        let boundaries = self.boundaries.clone();
        tokio::spawn(
            async move {
                let geometry = Self::load_boundaries(&boundaries).await;
                let _ = feedback.send(Feedback::Boundaries(geometry));
            }
            .instrument(info_span!("boundary_load")),
        );
    }

    fn spawn_click_validation(
        &self,
        coordinates: Coordinates,
        report_type: ReportType,
        feedback: mpsc::UnboundedSender<Feedback>,
    ) {
        let validator = self.validator.clone();
        tokio::spawn(async move {
            let valid = validator.validate(coordinates).await;
            let _ = feedback.send(Feedback::ClickValidated {
                coordinates,
                report_type,
                valid,
            });
        });
    }

    fn on_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::Boundaries(geometry) => {
                info!(features = geometry.len(), "boundary geometry loaded");
                self.boundary_geometry = geometry;
            }
            Feedback::ClickValidated {
                coordinates,
                report_type,
                valid,
            } => {
                self.click_validated(coordinates, report_type, valid);
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            fingerprint: self.fingerprint.clone(),
            state: self.state.snapshot(),
            rendered_markers: self.surface.layer.handles().len(),
            document_nodes: self.surface.document.report_nodes().len(),
            boundary_features: self.boundary_geometry.len(),
            view_center: self.view_center,
        }
    }

    /// Load boundary geometry, then drive the session until `inputs` closes.
    /// Sweeps on the configured interval and fires search-marker and reload timers.
    /// Returns the state as it was just before teardown.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) -> SessionSnapshot {
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        self.spawn_boundary_load(feedback_tx.clone());

        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::MapClick { coordinates, report_type }) => {
                        self.spawn_click_validation(coordinates, report_type, feedback_tx.clone());
                    }
                    Some(input) => self.apply(input).await,
                    None => break,
                },
                Some(feedback) = feedback_rx.recv() => self.on_feedback(feedback),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers(Instant::now());
                }
                _ = sweep.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }

        let snapshot = self.snapshot();
        self.dispose();
        snapshot
    }

    pub fn dispose(mut self) {
        for handle in self.surface.layer.handles() {
            self.surface.layer.remove_marker(handle);
        }
        self.search_markers.clear();
        self.state.dispose();
        debug!(fingerprint = %self.fingerprint, "map session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imc_core::{RawId, WireReport};
    use imc_reconcile::{RecordingLayer, ReportListDocument};
    use tempfile::tempdir;

    fn surface(nodes: Vec<ReportNode>) -> Option<MapSurface> {
        Some(MapSurface {
            layer: Box::new(RecordingLayer::new()),
            document: Box::new(ReportListDocument::new(nodes)),
        })
    }

    fn config(cache_dir: &Path) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.cache.cache_dir = cache_dir.to_path_buf();
        config
    }

    fn wire(id: i64, latitude: f64, longitude: f64, report_type: ReportType) -> WireReport {
        WireReport {
            id: RawId::Int(id),
            latitude,
            longitude,
            report_type,
            inserted_at: None,
        }
    }

    fn durable_ids(session: &MapSession) -> Vec<String> {
        session
            .snapshot()
            .state
            .durable
            .iter()
            .map(|entry| entry.id.to_string())
            .collect()
    }

    #[test]
    fn mount_without_surface_creates_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = MapSession::mount(SessionConfig::default(), Fingerprint::new("fp"), None, tx);
        assert!(matches!(result, Err(SessionError::MissingMapContainer)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn mount_loads_reports_from_document() {
        let dir = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let node = ReportNode::from_fact(&ReportFact::new("5", 40.0, -75.0, ReportType::Raid));
        let session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![node]), tx)
                .expect("mount");
        assert_eq!(durable_ids(&session), vec!["5"]);
        assert_eq!(session.snapshot().rendered_markers, 1);
    }

    #[tokio::test]
    async fn submission_is_promoted_by_push_then_removed() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp1"), surface(vec![]), tx)
                .expect("mount");

        let handle = session.submit_report(
            Coordinates::new(40.0, -75.0),
            ReportType::Checkpoint,
            Utc::now(),
        );
        assert_eq!(
            rx.try_recv().expect("map_report"),
            OutboundEvent::MapReport {
                latitude: 40.0,
                longitude: -75.0,
                report_type: ReportType::Checkpoint,
                fingerprint: Fingerprint::new("fp1"),
            }
        );

        session
            .handle_inbound(InboundEvent::AddReportMarker(wire(
                101,
                40.0001,
                -75.0001,
                ReportType::Checkpoint,
            )))
            .await;
        let snapshot = session.snapshot();
        assert!(snapshot.state.pending.is_empty());
        assert_eq!(snapshot.state.durable[0].marker.handle, handle);
        assert_eq!(snapshot.rendered_markers, 1);

        session
            .handle_inbound(InboundEvent::RemoveReportMarker {
                id: RawId::Text("101".into()),
            })
            .await;
        session
            .handle_inbound(InboundEvent::LoadExistingReports {
                reports: vec![
                    wire(101, 40.0, -75.0, ReportType::Checkpoint),
                    wire(102, 41.0, -75.0, ReportType::Raid),
                ],
            })
            .await;
        assert_eq!(durable_ids(&session), vec!["102"]);
        assert_eq!(session.snapshot().state.tombstones, vec![normalize("101")]);
    }

    #[tokio::test]
    async fn cleanup_events_are_scoped_to_their_fingerprint() {
        let dir = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let node = ReportNode::from_fact(&ReportFact::new("7", 30.0, -90.0, ReportType::Patrol));
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("mine"), surface(vec![node]), tx)
                .expect("mount");
        session.submit_report(Coordinates::new(35.0, -95.0), ReportType::Raid, Utc::now());

        session
            .handle_inbound(InboundEvent::CleanupTemporaryMarkers {
                fingerprint: Fingerprint::new("theirs"),
            })
            .await;
        assert_eq!(session.snapshot().state.pending.len(), 1);

        session
            .handle_inbound(InboundEvent::CleanupAllMarkersForFingerprint {
                fingerprint: Fingerprint::new("mine"),
                report_ids: vec![RawId::Text("7".into())],
            })
            .await;
        let snapshot = session.snapshot();
        assert!(snapshot.state.pending.is_empty());
        assert!(snapshot.state.durable.is_empty());
        assert_eq!(snapshot.document_nodes, 0);
        assert_eq!(snapshot.rendered_markers, 0);

        // A later full refresh cannot bring the node back: it left the document.
        session.handle_inbound(InboundEvent::CleanupCompleted {}).await;
        assert!(session.snapshot().state.durable.is_empty());
    }

    #[tokio::test]
    async fn validation_results_reach_the_waiting_request() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![]), tx)
                .expect("mount");
        let validator = session.validator();
        let waiting =
            tokio::spawn(async move { validator.validate(Coordinates::new(10.0, 10.0)).await });

        let Some(OutboundEvent::ValidateCoordinates { .. }) = rx.recv().await else {
            panic!("expected validate_coordinates");
        };
        session
            .handle_inbound(InboundEvent::CoordinateValidationResult {
                valid: true,
                request_id: None,
            })
            .await;
        assert!(waiting.await.expect("join"));
    }

    #[tokio::test]
    async fn rejected_click_is_not_submitted() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![]), tx)
                .expect("mount");
        let validator = session.validator();
        let click = SessionInput::MapClick {
            coordinates: Coordinates::new(40.0, -75.0),
            report_type: ReportType::Raid,
        };

        let answer = async {
            let Some(OutboundEvent::ValidateCoordinates { request_id, .. }) = rx.recv().await
            else {
                panic!("expected validate_coordinates");
            };
            assert!(validator.resolve(false, Some(request_id)).await);
        };
        tokio::join!(session.apply(click), answer);

        assert!(session.snapshot().state.pending.is_empty());
        assert_eq!(session.snapshot().rendered_markers, 0);
        assert!(rx.try_recv().is_err(), "rejected click must not reach the server");
    }

    #[tokio::test]
    async fn boundary_push_is_written_through() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![]), tx)
                .expect("mount");
        let geometry = BoundaryGeometry {
            name: "territory".into(),
            rings: vec![],
        };

        session
            .handle_inbound(InboundEvent::UsBoundariesData {
                boundaries: vec![geometry.clone()],
            })
            .await;
        let boundaries = session.boundaries();
        assert_eq!(MapSession::load_boundaries(&boundaries).await, vec![geometry.clone()]);
        assert!(rx.try_recv().is_err(), "warm cache must not fetch");
        let persisted = boundaries.store().load().await.expect("persisted");
        assert_eq!(persisted.boundaries, vec![geometry]);
    }

    #[tokio::test]
    async fn search_marker_is_removed_after_its_lifetime() {
        let dir = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![]), tx)
                .expect("mount");
        let start = Instant::now();

        session
            .handle_inbound(InboundEvent::FlyToAddress {
                lat: 39.95,
                lng: -75.16,
                address: "1400 JFK Blvd".into(),
            })
            .await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.view_center, Some(Coordinates::new(39.95, -75.16)));
        assert_eq!(snapshot.rendered_markers, 1);
        assert!(snapshot.state.pending.is_empty() && snapshot.state.durable.is_empty());

        let deadline = session.next_deadline().expect("search marker deadline");
        assert!(deadline >= start + SEARCH_MARKER_LIFETIME);

        session.fire_timers(deadline - Duration::from_millis(1));
        assert_eq!(session.snapshot().rendered_markers, 1);
        session.fire_timers(deadline);
        assert_eq!(session.snapshot().rendered_markers, 0);
        assert!(session.next_deadline().is_none());
    }

    #[tokio::test]
    async fn refresh_browser_rebuilds_state_from_the_document() {
        let dir = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let node = ReportNode::from_fact(&ReportFact::new("9", 30.0, -90.0, ReportType::Patrol));
        let mut session =
            MapSession::mount(config(dir.path()), Fingerprint::new("fp"), surface(vec![node]), tx)
                .expect("mount");
        session.submit_report(Coordinates::new(35.0, -95.0), ReportType::Raid, Utc::now());
        session
            .handle_inbound(InboundEvent::RemoveReportMarker { id: RawId::Int(3) })
            .await;

        session.handle_inbound(InboundEvent::RefreshBrowser {}).await;
        let deadline = session.next_deadline().expect("reload scheduled");
        session.fire_timers(deadline - Duration::from_millis(1));
        assert_eq!(session.snapshot().state.pending.len(), 1, "reload waits for its delay");

        session.fire_timers(deadline);
        let snapshot = session.snapshot();
        assert!(snapshot.state.pending.is_empty());
        assert!(snapshot.state.tombstones.is_empty());
        assert_eq!(durable_ids(&session), vec!["9"]);
        assert_eq!(snapshot.rendered_markers, 1);
        assert!(session.next_deadline().is_none());
    }

    #[test]
    fn yaml_config_overrides_only_named_fields() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("imc.yaml");
        std::fs::write(
            &path,
            concat!(
                "sweep_interval_secs: 60\n",
                "match_tolerance_deg: 0.002\n",
                "fallback:\n",
                "  min_latitude: 24.0\n",
                "  max_latitude: 49.0\n",
                "  min_longitude: -125.0\n",
                "  max_longitude: -66.0\n",
            ),
        )
        .expect("write config");

        let config = SessionConfig::from_yaml_file(&path).expect("config");
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.reconcile.match_tolerance, 0.002);
        assert_eq!(config.reconcile.report_lifetime, chrono::Duration::hours(4));
        assert_eq!(config.cache.ttl, Duration::from_secs(1800));
        assert_eq!(config.validator.timeout, Duration::from_millis(2000));
        assert!(!config.validator.fallback.contains(&Coordinates::new(21.0, -100.0)));

        std::fs::write(&path, "sweep_every: 1\n").expect("write bad config");
        assert!(SessionConfig::from_yaml_file(&path).is_err());
    }

    #[test]
    fn out_of_range_lifetime_keeps_the_default() {
        let config = SessionOverrides {
            report_lifetime_secs: Some(i64::MAX),
            ..SessionOverrides::default()
        }
        .apply(SessionConfig::default());
        assert_eq!(config.reconcile.report_lifetime, chrono::Duration::hours(4));

        let config = SessionOverrides {
            report_lifetime_secs: Some(i64::MIN),
            ..SessionOverrides::default()
        }
        .apply(SessionConfig::default());
        assert_eq!(config.reconcile.report_lifetime, chrono::Duration::hours(4));

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("imc.yaml");
        std::fs::write(&path, "report_lifetime_secs: 9223372036854775807\n")
            .expect("write config");
        let config = SessionConfig::from_yaml_file(&path).expect("config");
        assert_eq!(config.reconcile.report_lifetime, chrono::Duration::hours(4));

        let config = SessionOverrides {
            report_lifetime_secs: Some(600),
            ..SessionOverrides::default()
        }
        .apply(SessionConfig::default());
        assert_eq!(config.reconcile.report_lifetime, chrono::Duration::minutes(10));
    }
}
