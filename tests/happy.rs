use std::{net::IpAddr, time::Duration};

use common::{SCENARIO_BITRATE, SCENARIO_SIZES, scenario_catalog, scenario_table};
use mpcstream::{
    controller::RateController,
    estimator::ThroughputEstimator,
    playback::{PlaybackConfig, PlaybackError, Player},
    request::RequestKind,
    session::{SessionError, SessionRegistry},
    simulator::{DeliveryConfig, DeliveryError, RateLimit, StreamSimulator},
};
use tokio_util::sync::CancellationToken;

mod common;

#[test]
fn lookup_after_one_second_download() {
    let table = scenario_table();
    let controller = RateController::new(table.clone());
    let mut estimator = ThroughputEstimator::new(5);

    estimator.record(SCENARIO_SIZES[0], Duration::from_secs(1));
    let estimate = estimator.estimate().unwrap().unwrap();
    assert!((estimate - 781.0).abs() < 1e-9, "{estimate}");

    let decision = controller
        .next_bitrate(&[SCENARIO_BITRATE], &estimator, 5.0, SCENARIO_BITRATE)
        .unwrap();
    // bw_index 0, buffer_index 0, prerate_index 0
    assert_eq!(decision.bitrate, SCENARIO_BITRATE);
    assert_eq!(table.lookup(781.0, 5.0, SCENARIO_BITRATE).unwrap(), SCENARIO_BITRATE);
}

#[tokio::test(start_paused = true)]
async fn serve_measure_decide() {
    // 800 kbps moves segment 1 (100 KB) in one second
    let simulator = StreamSimulator::new(DeliveryConfig {
        block_size: 1000,
        rate_limit: RateLimit::new(800.0, Duration::from_secs(1)),
        timeout: None,
    });
    let mut registry = SessionRegistry::new(simulator);
    let client: IpAddr = [192, 168, 1, 7].into();
    let cancel = CancellationToken::new();
    registry.open(client, scenario_catalog());

    let request = RequestKind::resolve(
        "/media/BigBuckBunny/4sec/bunny_500000bps/BigBuckBunny_4s1.m4s",
        &["manifest.config"],
    )
    .unwrap();
    let RequestKind::Segment {
        bitrate,
        segment_index,
    } = request
    else {
        panic!("expected a segment request, got {request:?}");
    };

    let mut sink: Vec<u8> = Vec::new();
    let result = registry
        .serve_segment(&client, &mut sink, bitrate, segment_index, &cancel)
        .await
        .unwrap();
    assert_eq!(result.bytes_sent, SCENARIO_SIZES[0]);
    assert_eq!(sink.len() as u64, SCENARIO_SIZES[0]);
    assert!(result.duration >= Duration::from_millis(1000), "{:?}", result.duration);
    assert!(result.duration < Duration::from_millis(1100), "{:?}", result.duration);

    let mut estimator = ThroughputEstimator::new(5);
    estimator.record(result.bytes_sent, result.duration);
    let expected =
        (result.bytes_sent as f64 * 8.0 / result.duration_secs() / 1024.0).floor();
    let estimate = estimator.estimate().unwrap().unwrap();
    assert!((estimate - expected).abs() < 1e-9);

    let controller = RateController::new(scenario_table());
    let decision = controller
        .next_bitrate(&[SCENARIO_BITRATE], &estimator, 5.0, bitrate)
        .unwrap();
    assert_eq!(decision.bitrate, SCENARIO_BITRATE);
    assert_eq!(registry.get(&client).unwrap().served_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn segment_beyond_catalog_is_typed_error() {
    let mut registry = SessionRegistry::new(StreamSimulator::default());
    let client: IpAddr = [10, 0, 0, 1].into();
    registry.open(client, scenario_catalog());

    let err = registry
        .serve_segment(
            &client,
            &mut tokio::io::sink(),
            SCENARIO_BITRATE,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Catalog(_)), "{err}");
}

#[tokio::test(start_paused = true)]
async fn cancelled_playback_surfaces_error() {
    let simulator = StreamSimulator::new(DeliveryConfig {
        block_size: 1000,
        rate_limit: RateLimit::new(8.0, Duration::from_secs(1)),
        timeout: None,
    });
    let mut registry = SessionRegistry::new(simulator);
    let client: IpAddr = [10, 0, 0, 2].into();
    let session = registry.open(client, scenario_catalog());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        canceller.cancel();
    });

    let mut player = Player::new(
        RateController::new(scenario_table()),
        ThroughputEstimator::new(5),
        PlaybackConfig::default(),
    );
    let err = player
        .run(session, &mut tokio::io::sink(), &cancel)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("segment 1"), "{message}");

    assert!(matches!(
        err,
        PlaybackError::Session {
            segment_index: 1,
            source: SessionError::Delivery(DeliveryError::Cancelled { .. }),
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn full_playback_report() {
    let simulator = StreamSimulator::new(DeliveryConfig {
        block_size: 1000,
        rate_limit: RateLimit::new(800.0, Duration::from_secs(1)),
        timeout: None,
    });
    let mut registry = SessionRegistry::new(simulator);
    let client: IpAddr = [10, 0, 0, 3].into();
    let session = registry.open(client, scenario_catalog());

    let mut player = Player::new(
        RateController::new(scenario_table()),
        ThroughputEstimator::new(5),
        PlaybackConfig::default(),
    );
    let report = player
        .run(session, &mut tokio::io::sink(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.segments.len(), SCENARIO_SIZES.len());
    let bytes: Vec<u64> = report.segments.iter().map(|s| s.bytes).collect();
    assert_eq!(bytes, SCENARIO_SIZES.to_vec());
    assert!(report.segments[1].estimate_kbps.is_some());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["segments"].as_array().map(Vec::len), Some(3));
}
