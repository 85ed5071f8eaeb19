use std::time::Duration;

use chrono::Utc;
use imc_cache::OutboundSender;
use imc_core::{
    BoundaryGeometry, Coordinates, Fingerprint, InboundEvent, OutboundEvent, RawId, ReportFact,
    ReportType, WireReport,
};
use imc_reconcile::{RecordingLayer, ReportListDocument, ReportNode};
use imc_session::{MapSession, MapSurface, SessionConfig, SessionInput};
use tempfile::tempdir;
use tokio::sync::mpsc;

fn session_config(dir: &std::path::Path) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.cache.cache_dir = dir.to_path_buf();
    config.sweep_interval = Duration::from_secs(300);
    config
}

fn empty_surface() -> Option<MapSurface> {
    Some(MapSurface {
        layer: Box::new(RecordingLayer::new()),
        document: Box::new(ReportListDocument::default()),
    })
}

fn mount(dir: &std::path::Path, fingerprint: &str, outbound: OutboundSender) -> MapSession {
    MapSession::mount(
        session_config(dir),
        Fingerprint::new(fingerprint),
        empty_surface(),
        outbound,
    )
    .expect("mount")
}

/// Bus traffic with the startup boundary request filtered out.
fn drain_reports(bus: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut sent = Vec::new();
    while let Ok(event) = bus.try_recv() {
        if event != (OutboundEvent::GetUsBoundaries {}) {
            sent.push(event);
        }
    }
    sent
}

#[tokio::test(start_paused = true)]
async fn sweep_tick_evicts_reports_past_their_lifetime() {
    let dir = tempdir().expect("tempdir");
    let (outbound, _bus) = mpsc::unbounded_channel();
    let session = mount(dir.path(), "fp", outbound);
    let (inputs, rx) = mpsc::unbounded_channel();

    let old = ReportFact::new("1", 40.0, -75.0, ReportType::Raid)
        .inserted_at(Utc::now() - chrono::Duration::hours(5));
    let fresh = ReportFact::new("2", 41.0, -75.0, ReportType::Patrol)
        .inserted_at(Utc::now() - chrono::Duration::minutes(10));

    let driver = async move {
        inputs
            .send(SessionInput::NodeAdded(ReportNode::from_fact(&old)))
            .expect("send old");
        inputs
            .send(SessionInput::NodeAdded(ReportNode::from_fact(&fresh)))
            .expect("send fresh");
        tokio::time::sleep(Duration::from_secs(301)).await;
        drop(inputs);
    };

    let (snapshot, ()) = tokio::join!(session.run(rx), driver);
    let ids = snapshot
        .state
        .durable
        .iter()
        .map(|entry| entry.id.to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["2"]);
    assert_eq!(snapshot.document_nodes, 1);
    assert_eq!(snapshot.rendered_markers, 1);
}

#[tokio::test]
async fn optimistic_submission_flows_through_the_loop() {
    let dir = tempdir().expect("tempdir");
    let (outbound, mut bus) = mpsc::unbounded_channel();
    let session = mount(dir.path(), "fp1", outbound);
    let (inputs, rx) = mpsc::unbounded_channel();

    inputs
        .send(SessionInput::SubmitReport {
            coordinates: Coordinates::new(40.0, -75.0),
            report_type: ReportType::Checkpoint,
        })
        .expect("submit");
    inputs
        .send(SessionInput::Inbound(InboundEvent::AddReportMarker(WireReport {
            id: RawId::Int(101),
            latitude: 40.0001,
            longitude: -75.0001,
            report_type: ReportType::Checkpoint,
            inserted_at: None,
        })))
        .expect("confirm");
    inputs
        .send(SessionInput::SelectAddress {
            coordinates: Coordinates::new(40.0, -75.0),
            address: "Market St".into(),
        })
        .expect("select");
    // Redelivery after the confirmation must not add a second marker.
    inputs
        .send(SessionInput::Inbound(InboundEvent::LoadExistingReports {
            reports: vec![WireReport {
                id: RawId::Text(" 101 ".into()),
                latitude: 40.0,
                longitude: -75.0,
                report_type: ReportType::Checkpoint,
                inserted_at: None,
            }],
        }))
        .expect("redeliver");
    drop(inputs);

    let snapshot = session.run(rx).await;
    assert!(snapshot.state.pending.is_empty());
    assert_eq!(snapshot.state.durable.len(), 1);
    assert_eq!(snapshot.state.durable[0].id.as_str(), "101");
    assert_eq!(snapshot.rendered_markers, 1);

    let sent = drain_reports(&mut bus);
    assert_eq!(sent.len(), 2);
    assert!(matches!(
        sent[0],
        OutboundEvent::MapReport {
            report_type: ReportType::Checkpoint,
            ..
        }
    ));
    assert_eq!(
        sent[1],
        OutboundEvent::SelectAddress {
            lat: 40.0,
            lng: -75.0,
            address: "Market St".into(),
        }
    );
}

#[tokio::test]
async fn run_loads_boundaries_and_submits_only_validated_clicks() {
    let dir = tempdir().expect("tempdir");
    let (outbound, mut bus) = mpsc::unbounded_channel();
    let session = mount(dir.path(), "fp2", outbound);
    let boundaries = session.boundaries();
    let (inputs, rx) = mpsc::unbounded_channel();
    let geometry = BoundaryGeometry {
        name: "contiguous".into(),
        rings: vec![],
    };

    let driver = async {
        // Cold start: the loop asks the server for boundaries on its own.
        assert_eq!(bus.recv().await, Some(OutboundEvent::GetUsBoundaries {}));
        inputs
            .send(SessionInput::Inbound(InboundEvent::UsBoundariesData {
                boundaries: vec![geometry.clone()],
            }))
            .expect("boundaries");
        // The answer warmed the shared cache: this read costs no round trip.
        assert_eq!(MapSession::load_boundaries(&boundaries).await, vec![geometry.clone()]);

        inputs
            .send(SessionInput::MapClick {
                coordinates: Coordinates::new(19.0, -155.0),
                report_type: ReportType::Raid,
            })
            .expect("outside click");
        let Some(OutboundEvent::ValidateCoordinates { request_id, .. }) = bus.recv().await else {
            panic!("expected validate_coordinates for the first click");
        };
        inputs
            .send(SessionInput::Inbound(InboundEvent::CoordinateValidationResult {
                valid: false,
                request_id: Some(request_id),
            }))
            .expect("reject");

        inputs
            .send(SessionInput::MapClick {
                coordinates: Coordinates::new(40.0, -75.0),
                report_type: ReportType::Patrol,
            })
            .expect("inside click");
        let Some(OutboundEvent::ValidateCoordinates { request_id, .. }) = bus.recv().await else {
            panic!("expected validate_coordinates for the second click");
        };
        inputs
            .send(SessionInput::Inbound(InboundEvent::CoordinateValidationResult {
                valid: true,
                request_id: Some(request_id),
            }))
            .expect("accept");

        let submitted = bus.recv().await.expect("map_report");
        drop(inputs);
        submitted
    };

    let (snapshot, submitted) = tokio::join!(session.run(rx), driver);
    assert_eq!(
        submitted,
        OutboundEvent::MapReport {
            latitude: 40.0,
            longitude: -75.0,
            report_type: ReportType::Patrol,
            fingerprint: Fingerprint::new("fp2"),
        }
    );
    assert!(bus.try_recv().is_err(), "the rejected click must not be submitted");
    assert_eq!(snapshot.state.pending.len(), 1);
    assert_eq!(snapshot.rendered_markers, 1);
}
