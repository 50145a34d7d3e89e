//! End-to-end pipeline scenarios: assembly through reconstruction, stream
//! manager lifecycle, recording round trips, and show rate capping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use beamly::detmap::DetectorMap;
use beamly::event::{EntryValue, Event};
use beamly::live::bus::Bus;
use beamly::live::message::{Cmd, Msg};
use beamly::live::shows::{self, Show, ShowKind, ShowSample, SourceSample};
use beamly::live::sources::generate_current_mode_sources;
use beamly::live::stream::StreamManager;
use beamly::model::{AxisSample, Frame, HpsSample, Sample, SAMPLE_TICK};
use beamly::ops::{EventOp, Op, OpArray, StreamOp};
use beamly::process::{
    assemble_frame, BeamReconstruction, Correlator, Mapper, Pedestals,
};
use beamly::storage;

const DEV_UID: u64 = 0x0000_0001_0000_0001;

fn uid_bytes(uid: u64) -> Vec<u8> {
    uid.to_be_bytes().to_vec()
}

fn raw_event(sample_numbers: &[u32], values: &[i32]) -> Event {
    let mut event = Event::new();
    event.metadata.insert("UID".into(), uid_bytes(DEV_UID));
    for &sample_number in sample_numbers {
        event.add_entry(
            "Sample",
            EntryValue::Hps(HpsSample {
                sample_number,
                channels: values.to_vec(),
                ..HpsSample::default()
            }),
        );
    }
    event
}

fn full_chain(detmap: &Arc<DetectorMap>) -> OpArray {
    let mapper = Mapper::new(detmap.clone());
    let correlator = Correlator::default();
    let pedestals = Pedestals::default();
    let recon = BeamReconstruction::new(DEV_UID, detmap);
    OpArray(vec![
        Box::new(EventOp::new("assemble frames", 16, 1, assemble_frame)),
        Box::new(EventOp::new("apply detector map", 16, 1, move |event| {
            mapper.process(event)
        })),
        Box::new(StreamOp::new("correlate frames", 1, move |input, output| {
            correlator.run(input, output)
        })),
        Box::new(StreamOp::new(
            "subtract pedestals",
            1,
            move |input, output| pedestals.subtract(input, output),
        )),
        Box::new(EventOp::new("reconstruct beam", 16, 1, move |event| {
            recon.process(event)
        })),
    ])
}

// S1: two tagged samples assemble into one frame keyed by the event UID.
#[test]
fn s1_frame_assembly() {
    let mut event = raw_event(&[0, 5], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assemble_frame(&mut event);

    let frame_ids = event.tagged_entries("Frame");
    assert_eq!(frame_ids.len(), 1);
    let frame = event.entry(frame_ids[0]).unwrap().as_frame().unwrap();
    assert_eq!(frame.timestamp, 0);
    assert_eq!(frame.samples.len(), 2);
    assert_eq!(frame.samples[0].timestamp, 0);
    assert_eq!(frame.samples[1].timestamp, 5 * SAMPLE_TICK);
    assert!(frame.samples.iter().all(|s| s.hps.contains_key(&DEV_UID)));
}

// S2: mapping applies the conversion factor and subtracts frame offsets.
#[test]
fn s2_map_with_offsets() {
    let map: DetectorMap = serde_json::from_str(
        r#"{
            "hps_configs": {
                "1": {
                    "channels": { "0": { "axis": 0, "axis_channel": 0 } },
                    "current_conv": 2.0,
                    "det_config": 1
                }
            }
        }"#,
    )
    .unwrap();
    let mapper = Mapper::new(Arc::new(map));

    let mut sample = Sample::default();
    sample.hps.insert(
        DEV_UID,
        HpsSample {
            channels: vec![10],
            ..HpsSample::default()
        },
    );
    let mut event = Event::new();
    event.add_entry(
        "Frame",
        EntryValue::Frame(Frame {
            samples: vec![sample],
            axis_offsets: Some(vec![AxisSample {
                float_channels: vec![3.5],
                sum: 0.0,
            }]),
            ..Frame::default()
        }),
    );

    mapper.process(&mut event);

    let mapped_ids = event.tagged_entries("Mapped");
    let mapped = event.entry(mapped_ids[0]).unwrap().as_frame().unwrap();
    let axis = &mapped.samples[0].axes[0];
    assert_eq!(axis.float_channels[0], 16.5);
    assert_eq!(axis.sum, 16.5);
}

// S3: perfectly correlated axis sums give a correlation of 1.
#[test]
fn s3_trivial_correlation() {
    let mut event = Event::new();
    let samples: Vec<Sample> = [(1.0f32, 2.0f32), (2.0, 4.0), (3.0, 6.0), (4.0, 8.0)]
        .iter()
        .map(|&(a, b)| Sample {
            axes: vec![
                AxisSample {
                    sum: a,
                    ..AxisSample::default()
                },
                AxisSample {
                    sum: b,
                    ..AxisSample::default()
                },
            ],
            ..Sample::default()
        })
        .collect();
    event.add_entry(
        "Mapped",
        EntryValue::Frame(Frame {
            samples,
            ..Frame::default()
        }),
    );

    beamly::process::correlate_event(&mut event);

    let ids = event.tagged_entries("Mapped");
    let frame = event.entry(ids[0]).unwrap().as_frame().unwrap();
    assert!((frame.correlation as f64 - 1.0).abs() < 1e-9);
}

// The assembled chain tags every event with Frame, Mapped and Reduced
// entries and preserves input order across the parallel stages.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chain_produces_all_stages_in_order() {
    let detmap = DetectorMap::load_embedded().unwrap();
    let ops = full_chain(&detmap);

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for i in 0..10u32 {
            let values: Vec<i32> = (0..8).map(|c| (i as i32 + 1) * (c + 1)).collect();
            let event = raw_event(&[2 * i, 2 * i + 1], &values);
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    let mut output = ops.run(rx);
    let mut seen = 0u32;
    while let Some(event) = output.recv().await {
        let frame_ids = event.tagged_entries("Frame");
        assert_eq!(frame_ids.len(), 1);
        assert_eq!(event.tagged_entries("Mapped").len(), 1);
        assert_eq!(event.tagged_entries("Reduced").len(), 1);

        // Input order is preserved: sample numbers increase monotonically.
        let frame = event.entry(frame_ids[0]).unwrap().as_frame().unwrap();
        let first_hps = frame.samples[0].hps.get(&DEV_UID).unwrap();
        assert_eq!(first_hps.sample_number, 2 * seen);

        // Mapped into two axes of four channels each.
        let mapped_ids = event.tagged_entries("Mapped");
        let mapped = event.entry(mapped_ids[0]).unwrap().as_frame().unwrap();
        assert_eq!(mapped.samples[0].axes.len(), 2);
        assert_eq!(mapped.samples[0].axes[0].float_channels.len(), 4);

        // Reduced samples carry beam info.
        let reduced_ids = event.tagged_entries("Reduced");
        let reduced = event.entry(reduced_ids[0]).unwrap().as_frame().unwrap();
        assert_eq!(reduced.samples.len(), 2);
        assert!(reduced.samples[0].beam_info.is_some());

        seen += 1;
    }
    assert_eq!(seen, 10);
}

fn mapped_event(axis_sums: &[(f32, f32)]) -> Event {
    let samples: Vec<Sample> = axis_sums
        .iter()
        .map(|&(a, b)| Sample {
            axes: vec![
                AxisSample {
                    float_channels: vec![a],
                    sum: a,
                },
                AxisSample {
                    float_channels: vec![b],
                    sum: b,
                },
            ],
            ..Sample::default()
        })
        .collect();
    let mut event = Event::new();
    event.add_entry(
        "Mapped",
        EntryValue::Frame(Frame {
            samples,
            ..Frame::default()
        }),
    );
    event
}

// Stream manager lifecycle: announce, new show, frame publication, kill,
// stream close.
#[tokio::test(start_paused = true)]
async fn stream_manager_show_lifecycle() {
    let bus = Bus::new();
    let mut broadcast_rx = bus.subscribe("everyone broadcast");
    let mut stream_rx = bus.subscribe("everyone stream dev");

    let manager = StreamManager::new("everyone", "dev", &bus, generate_current_mode_sources);
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let manager_task = tokio::spawn(manager.manage(in_rx, out_tx));

    let announce: Msg =
        serde_json::from_slice(&broadcast_rx.recv().await.unwrap()).unwrap();
    assert_eq!(announce.kind, "stream announce");
    assert_eq!(announce.metadata.get("name").unwrap(), "dev");

    let cmd = Cmd::new("new show")
        .with("type", "Roll XY")
        .with("source", "Total Current");
    bus.publish(
        "everyone stream cmd dev",
        serde_json::to_vec(&cmd).unwrap().into(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Feed one mapped event; it must come out the other side unchanged in
    // count, and the show starts publishing frames.
    in_tx.send(mapped_event(&[(1.0, 2.0), (3.0, 4.0)])).await.unwrap();
    let forwarded = out_rx.recv().await.unwrap();
    assert_eq!(forwarded.tagged_entries("Mapped").len(), 1);

    let mut saw_show_frame = false;
    let mut saw_source_announce = false;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_millis(200), stream_rx.recv()).await {
            Ok(Ok(bytes)) => {
                let msg: Msg = serde_json::from_slice(&bytes).unwrap();
                match msg.kind.as_str() {
                    "show frame" => {
                        saw_show_frame = true;
                        assert_eq!(msg.metadata.get("stream name").unwrap(), "dev");
                        assert!(msg.metadata.contains_key("show id"));
                    }
                    "source announce" => saw_source_announce = true,
                    _ => {}
                }
            }
            _ => break,
        }
        if saw_show_frame && saw_source_announce {
            break;
        }
    }
    assert!(saw_show_frame);
    assert!(saw_source_announce);

    bus.publish(
        "everyone stream cmd dev",
        serde_json::to_vec(&Cmd::new("kill")).unwrap().into(),
    );
    drop(in_tx);
    manager_task.await.unwrap();

    let mut saw_close = false;
    while let Ok(Ok(bytes)) =
        tokio::time::timeout(Duration::from_millis(100), broadcast_rx.recv()).await
    {
        let msg: Msg = serde_json::from_slice(&bytes).unwrap();
        if msg.kind == "stream close" {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

// Recording round trip: start run, feed events, stop run, read the file
// back; recorded events keep only raw frames.
#[tokio::test]
async fn recording_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base_url = format!("file://{}", dir.path().display());

    let bus = Bus::new();
    let mut manager = StreamManager::new("everyone", "rec", &bus, generate_current_mode_sources);
    let cleanup: beamly::ops::EventProcessor = Arc::new(beamly::process::keep_only_raw_frames);
    manager.cleanup_run_data = vec![cleanup];
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let manager_task = tokio::spawn(manager.manage(in_rx, out_tx));
    tokio::spawn(async move { while out_rx.recv().await.is_some() {} });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Cmd::new("start run")
        .with("url", base_url.clone())
        .with("Operator", "tester");
    bus.publish(
        "everyone stream cmd rec",
        serde_json::to_vec(&start).unwrap().into(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..3 {
        let mut event = Event::new();
        event.add_entry("Frame", EntryValue::Frame(Frame::default()));
        event.add_entry("Mapped", EntryValue::Frame(Frame::default()));
        in_tx.send(event).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    bus.publish(
        "everyone stream cmd rec",
        serde_json::to_vec(&Cmd::new("stop run")).unwrap().into(),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let runs = storage::list_runs(&base_url, "").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].name.ends_with(".proio"));

    let url = format!("{base_url}/{}", runs[0].name);
    let mut reader = storage::get_reader(&url, "").await.unwrap();
    reader.skip(0).await.unwrap();
    assert_eq!(
        reader.metadata.get("Operator").map(Vec::as_slice),
        Some(b"tester".as_slice())
    );

    let mut count = 0;
    while let Some(event) = reader.next_event().await.unwrap() {
        assert_eq!(event.tagged_entries("Frame").len(), 1);
        assert!(event.tagged_entries("Mapped").is_empty());
        count += 1;
    }
    assert_eq!(count, 3);

    bus.publish(
        "everyone stream cmd rec",
        serde_json::to_vec(&Cmd::new("kill")).unwrap().into(),
    );
    drop(in_tx);
    manager_task.await.unwrap();
}

// S6: a burst of samples triggers at most one re-render per frame period.
#[tokio::test(start_paused = true)]
async fn s6_show_render_rate_is_capped() {
    let show = shows::new_show(ShowKind::RollXy, Duration::from_millis(100));
    show.update_frame();
    let (_, count_after_init) = show.frame();
    assert_eq!(count_after_init, 1);

    // Let the frame expire.
    tokio::time::sleep(Duration::from_millis(150)).await;

    for i in 0..10000 {
        show.add_sample(&ShowSample {
            source: "s".to_string(),
            value: SourceSample::RollXy(i as f64, 1.0),
        });
    }
    // Allow the single scheduled re-render to run.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (frame, count) = show.frame();
    assert!(frame.is_some());
    assert_eq!(count, 2);
}

// Processor panics neither kill the pipeline nor drop the event.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_survives_poison_events() {
    let poison = EventOp::new("poison", 4, 2, |event| {
        if event.metadata.contains_key("poison") {
            panic!("poisoned event");
        }
    });
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for i in 0..5u8 {
            let mut event = Event::new();
            if i == 2 {
                event.metadata.insert("poison".into(), vec![1]);
            }
            event.metadata.insert("idx".into(), vec![i]);
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    let mut output = Box::new(poison).run(rx);
    let mut indexes = Vec::new();
    while let Some(event) = output.recv().await {
        indexes.push(event.metadata.get("idx").unwrap()[0]);
    }
    assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
}
