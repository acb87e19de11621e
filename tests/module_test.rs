//! Module runs: streaming, busy semantics, cancellation and faults.

mod common;

use anyhow::anyhow;
use arc1::adapters::Fault;
use arc1::error::FaultFlags;
use arc1::instrument::{Geometry, Session};
use arc1::modules::{boxed, options, ReadMasked, Retention, SequenceEvent, HANDOFF_CAPACITY};
use arc1::{
    ArcError, ArcResult, ControllerState, Coordinate, Module, ModuleConfig, ModuleDescriptor,
    RecordSink, Sequence,
};
use async_trait::async_trait;
use common::connect;
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use std::time::Duration;

/// Reads the first three devices of word-line 0.
#[derive(Default)]
struct ThreeReads;

#[async_trait]
impl Module for ThreeReads {
    fn default_config(&self) -> ModuleConfig {
        ModuleConfig::new()
    }

    async fn run(
        &self,
        session: &mut Session,
        _devices: &[Coordinate],
        _config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        for bit in 0..3 {
            if sink.should_stop() {
                break;
            }
            let record = session.read_one(Coordinate::new(0, bit)).await?;
            sink.emit(record).await?;
        }
        Ok(())
    }
}

const THREE_READS: ModuleDescriptor =
    ModuleDescriptor::new("ThreeReads", "T3", "Read three devices", boxed::<ThreeReads>);

/// Emits two records, then fails.
#[derive(Default)]
struct FailsAfterTwo;

#[async_trait]
impl Module for FailsAfterTwo {
    fn default_config(&self) -> ModuleConfig {
        ModuleConfig::new()
    }

    async fn run(
        &self,
        session: &mut Session,
        devices: &[Coordinate],
        _config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        for &device in devices.iter().take(2) {
            let record = session.read_one(device).await?;
            sink.emit(record).await?;
        }
        Err(ArcError::Module(anyhow!("sweep aborted")))
    }
}

const FAILS_AFTER_TWO: ModuleDescriptor =
    ModuleDescriptor::new("FailsAfterTwo", "F2", "Fail mid-run", boxed::<FailsAfterTwo>);

/// Emits one record, then panics.
#[derive(Default)]
struct PanicsAfterOne;

#[async_trait]
impl Module for PanicsAfterOne {
    fn default_config(&self) -> ModuleConfig {
        ModuleConfig::new()
    }

    async fn run(
        &self,
        session: &mut Session,
        _devices: &[Coordinate],
        _config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        let record = session.read_one(Coordinate::new(0, 0)).await?;
        sink.emit(record).await?;
        let table: Vec<f64> = Vec::new();
        let _gain = table[3];
        Ok(())
    }
}

const PANICS_AFTER_ONE: ModuleDescriptor =
    ModuleDescriptor::new("PanicsAfterOne", "P1", "Panic mid-run", boxed::<PanicsAfterOne>);

#[tokio::test]
async fn test_trivial_module_yields_records_then_ends() {
    let (arc, _board) = connect(8, 8).await;

    let mut run = arc
        .run_module(&THREE_READS, Vec::new(), ModuleConfig::new())
        .await
        .unwrap();
    assert_eq!(run.name(), "ThreeReads");

    let mut devices = Vec::new();
    while let Some(record) = run.next().await {
        devices.push(record.unwrap().device);
    }
    assert_eq!(
        devices,
        vec![Coordinate::new(0, 0), Coordinate::new(0, 1), Coordinate::new(0, 2)]
    );

    assert!(run.next().await.is_none(), "a drained run stays drained");
    assert!(run.is_done());
    assert_eq!(arc.state().await, ControllerState::Selected(Coordinate::new(0, 2)));
    assert!(!arc.is_busy());
}

#[tokio::test]
async fn test_read_all_is_row_major() {
    let (arc, _board) = connect(3, 4).await;

    let records: Vec<_> = arc.read_all().await.unwrap().try_collect().await.unwrap();

    let devices: Vec<_> = records.iter().map(|r| r.device).collect();
    let expected: Vec<_> = (0..3)
        .flat_map(|w| (0..4).map(move |b| Coordinate::new(w, b)))
        .collect();
    assert_eq!(devices, expected);
}

#[tokio::test]
async fn test_read_all_partial_sweep() {
    let (arc, _board) = connect(8, 8).await;

    let run = arc
        .run_tagged("RA", Vec::new(), options(json!({ "words": 2, "bits": 3 })))
        .await
        .unwrap();
    let records: Vec<_> = run.try_collect().await.unwrap();

    assert_eq!(records.len(), 6);
    assert_eq!(records.last().unwrap().device, Coordinate::new(1, 2));
}

#[tokio::test]
async fn test_slow_consumer_receives_every_record() {
    let (arc, _board) = connect(16, 16).await;
    let total = 16 * 16;
    assert!(total > HANDOFF_CAPACITY);

    let mut run = arc.read_all().await.unwrap();
    let mut devices = Vec::new();
    while let Some(record) = run.next().await {
        if devices.len() < 4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        devices.push(record.unwrap().device);
    }

    assert_eq!(devices.len(), total);
    assert_eq!(devices, Geometry::new(16, 16).iter_row_major().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_single_shot_operations_fail_fast_while_busy() {
    let (arc, board) = connect(8, 8).await;
    board.set_latency(Duration::from_millis(5));

    let run = arc.read_all().await.unwrap();

    assert_eq!(arc.state().await, ControllerState::Busy { run: run.id() });
    assert!(matches!(arc.read_one(0, 0).await, Err(ArcError::ControllerBusy)));
    assert!(matches!(
        arc.pulse_active(1.0, Duration::from_micros(10)).await,
        Err(ArcError::ControllerBusy)
    ));
    assert!(matches!(arc.read_all().await, Err(ArcError::ControllerBusy)));

    drop(run);
    board.set_latency(Duration::ZERO);
    assert!(arc.read_one(0, 0).await.is_ok());
}

#[tokio::test]
async fn test_abandoned_run_releases_controller() {
    let (arc, _board) = connect(8, 8).await;

    let mut run = arc.read_all().await.unwrap();
    for _ in 0..3 {
        run.next().await.unwrap().unwrap();
    }
    drop(run);

    let record = arc.read_one(7, 7).await.unwrap();
    assert_eq!(record.device, Coordinate::new(7, 7));
}

#[tokio::test]
async fn test_cancel_stops_worker() {
    let (arc, _board) = connect(8, 8).await;

    let mut run = arc
        .retention(
            vec![Coordinate::new(1, 1)],
            Duration::from_secs(10),
            Duration::from_secs(1000),
        )
        .await
        .unwrap();
    let first = run.next().await.unwrap().unwrap();
    assert_eq!(first.sequence, Some(0));

    run.cancel();
    assert!(!arc.is_busy());
    assert!(run.next().await.is_none());

    tokio::time::timeout(Duration::from_secs(2), run.join())
        .await
        .expect("worker did not stop while idling");
    assert_eq!(arc.state().await, ControllerState::Selected(Coordinate::new(1, 1)));
}

#[tokio::test]
async fn test_module_fault_delivered_once_after_records() {
    let (arc, _board) = connect(8, 8).await;

    let mut run = arc
        .run_module(
            &FAILS_AFTER_TWO,
            vec![Coordinate::new(0, 0), Coordinate::new(0, 1), Coordinate::new(0, 2)],
            ModuleConfig::new(),
        )
        .await
        .unwrap();

    assert!(run.next().await.unwrap().is_ok());
    assert!(run.next().await.unwrap().is_ok());
    assert!(matches!(run.next().await, Some(Err(ArcError::Module(_)))));
    assert!(run.next().await.is_none());
    assert!(!arc.is_busy());
}

#[tokio::test]
async fn test_module_panic_surfaces_as_fault() {
    let (arc, _board) = connect(8, 8).await;

    let mut run = arc
        .run_module(&PANICS_AFTER_ONE, Vec::new(), ModuleConfig::new())
        .await
        .unwrap();

    assert!(run.next().await.unwrap().is_ok());
    match run.next().await {
        Some(Err(ArcError::Module(e))) => assert!(e.to_string().contains("PanicsAfterOne")),
        other => panic!("expected module fault, got {:?}", other),
    }
    assert!(run.next().await.is_none());
    assert!(!arc.is_busy());
    assert!(arc.read_one(1, 1).await.is_ok(), "session usable after the panic");
}

#[tokio::test]
async fn test_device_fault_ends_run() {
    let (arc, board) = connect(8, 8).await;
    board.inject(Fault::Status(FaultFlags::OVERCURRENT));

    let mut run = arc
        .read_masked(vec![Coordinate::new(0, 0), Coordinate::new(0, 1)])
        .await
        .unwrap();

    assert!(matches!(run.next().await, Some(Err(ArcError::DeviceFault { .. }))));
    assert!(run.next().await.is_none());
    assert!(arc.read_one(0, 1).await.is_ok());
}

#[tokio::test]
async fn test_read_masked_preserves_order() {
    let (arc, _board) = connect(8, 8).await;
    let devices = vec![Coordinate::new(5, 1), Coordinate::new(0, 7), Coordinate::new(5, 1)];

    let records: Vec<_> = arc
        .read_masked(devices.clone())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records.iter().map(|r| r.device).collect::<Vec<_>>(), devices);
}

#[tokio::test]
async fn test_rejected_runs_leave_controller_idle() {
    let (arc, board) = connect(8, 8).await;
    let before = board.bytes_received();

    assert!(matches!(
        arc.run_tagged("CT", Vec::new(), ModuleConfig::new()).await,
        Err(ArcError::UnknownModule(_))
    ));
    assert!(matches!(
        arc.read_masked(vec![Coordinate::new(9, 0)]).await,
        Err(ArcError::Address { .. })
    ));
    assert!(matches!(
        arc.run_tagged("RET", vec![Coordinate::new(0, 0)], options(json!({ "stepp": 1.0 })))
            .await,
        Err(ArcError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        arc.retention(Vec::new(), Duration::from_secs(1), Duration::from_secs(2))
            .await,
        Err(ArcError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        arc.run_tagged(
            "RET",
            vec![Coordinate::new(0, 0)],
            options(json!({ "step": 1e20, "duration": 60.0 }))
        )
        .await,
        Err(ArcError::InvalidConfiguration(_))
    ));

    assert!(!arc.is_busy());
    assert_eq!(board.bytes_received(), before);
    assert!(arc.read_one(0, 0).await.is_ok());
}

#[tokio::test]
async fn test_registered_module_runs_by_tag() {
    let (mut arc, _board) = connect(8, 8).await;
    arc.register_module(THREE_READS);

    let records: Vec<_> = arc
        .run_tagged("T3", Vec::new(), ModuleConfig::new())
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn test_retention_marks_rounds() {
    let (arc, _board) = connect(8, 8).await;
    let devices = vec![Coordinate::new(0, 0), Coordinate::new(1, 1)];

    let records: Vec<_> = arc
        .retention(devices, Duration::from_millis(10), Duration::from_millis(35))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let rounds: Vec<_> = records.iter().map(|r| r.sequence.unwrap()).collect();
    assert_eq!(rounds, vec![0, 0, 1, 1, 2, 2]);
    let elapsed: Vec<_> = records.iter().map(|r| r.elapsed.unwrap()).collect();
    assert!(elapsed.windows(2).all(|w| w[0] <= w[1]));
    assert!(elapsed[4] >= Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn test_retention_elapsed_follows_runtime_clock() {
    let (arc, _board) = connect(8, 8).await;

    let records: Vec<_> = arc
        .retention(
            vec![Coordinate::new(2, 2)],
            Duration::from_secs(600),
            Duration::from_secs(1500),
        )
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let elapsed: Vec<_> = records.iter().map(|r| r.elapsed.unwrap()).collect();
    assert_eq!(elapsed.len(), 2);
    assert!(elapsed[0] < Duration::from_secs(1));
    assert!(elapsed[1] >= Duration::from_secs(600), "got {:?}", elapsed[1]);
}

#[tokio::test]
async fn test_sequence_events_in_order() {
    let (arc, _board) = connect(8, 8).await;
    let sequence = Sequence::new("form-and-check")
        .add_module(ReadMasked::DESCRIPTOR, ModuleConfig::new())
        .add_module(
            Retention::DESCRIPTOR,
            options(json!({ "step": 0.01, "duration": 0.025 })),
        )
        .add_device(Coordinate::new(0, 0))
        .add_device(Coordinate::new(1, 1));

    let events: Vec<_> = arc
        .run_sequence(sequence)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let labels: Vec<String> = events
        .iter()
        .map(|event| match event {
            SequenceEvent::SequenceStarted { .. } => "start".to_string(),
            SequenceEvent::ModuleStarted { tag, device, .. } => format!("{}@{}", tag, device),
            SequenceEvent::Record(r) => format!("r{}", r.device),
            SequenceEvent::ModuleFinished { tag, .. } => format!("/{}", tag),
            SequenceEvent::SequenceFinished { .. } => "end".to_string(),
        })
        .collect();

    assert_eq!(
        labels,
        vec![
            "start",
            "RM@(0, 0)",
            "r(0, 0)",
            "/RM",
            "RET@(0, 0)",
            "r(0, 0)",
            "r(0, 0)",
            "/RET",
            "RM@(1, 1)",
            "r(1, 1)",
            "/RM",
            "RET@(1, 1)",
            "r(1, 1)",
            "r(1, 1)",
            "/RET",
            "end",
        ]
    );
    assert!(!arc.is_busy());
}

#[tokio::test]
async fn test_sequence_rejects_bad_device_before_running() {
    let (arc, board) = connect(8, 8).await;
    let before = board.bytes_received();
    let sequence = Sequence::new("bad")
        .add_module(ReadMasked::DESCRIPTOR, ModuleConfig::new())
        .add_device(Coordinate::new(0, 8));

    assert!(matches!(
        arc.run_sequence(sequence).await,
        Err(ArcError::Address { .. })
    ));
    assert!(!arc.is_busy());
    assert_eq!(board.bytes_received(), before);
}
