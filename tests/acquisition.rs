use daq_stream::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn device(backend: &SimulatedBackend, sim: SimSettings) -> Device<SimulatedDriver> {
    Device::new(backend.driver(sim), DeviceType::Any, ConnectionType::Any, "ANY")
}

fn plan(channels: &[&str], frequency: f64) -> SamplingPlan {
    SamplingPlan::new(
        channels.iter().map(|&c| Channel::from(c)).collect(),
        vec![10.0; channels.iter().filter(|c| c.starts_with("AIN")).count()],
        frequency,
        PacketSize::Auto,
        0,
    )
}

#[test]
fn zero_loss_device_fills_exactly_the_requested_rows() {
    let backend = SimulatedBackend::default();
    let mut dev = device(&backend, SimSettings::default());
    let mut engine = IngestionEngine::new(&mut dev, EngineSettings::default());
    let (buffer, report) = engine.collect(&plan(&["A"], 10.0), 1.0, None).unwrap();

    assert_eq!(buffer.row_count(), 10);
    assert_eq!(report.as_pair().1, 0.0);
    let all = buffer.select(Selection::All).unwrap();
    assert_eq!(all.dim(), (10, 3));
    assert_eq!(buffer.window(0, 10), all);
}

#[test]
fn readers_follow_a_live_collection() {
    let backend = SimulatedBackend::default();
    let sim = SimSettings {
        realtime: true,
        ..Default::default()
    };
    let mut dev = device(&backend, sim);
    let mut engine = IngestionEngine::new(&mut dev, EngineSettings::default());
    let p = plan(&["AIN0", "AIN1"], 200.0).with_rate(200.0, 10);
    let run = engine.prepare(&p, 0.5).unwrap();
    let buffer = run.buffer();
    let capacity = buffer.capacity_rows();

    let report = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut last = 0;
            let mut observations = 0;
            while last < capacity {
                let rows = buffer.row_count();
                assert!(rows >= last && rows <= capacity);
                let window = buffer.window(0, rows);
                assert_eq!(window.nrows(), rows);
                let times = window.column(2);
                assert!(times.iter().zip(times.iter().skip(1)).all(|(a, b)| a < b));
                last = rows;
                observations += 1;
                thread::yield_now();
            }
            observations
        });
        let report = run.execute(None).unwrap();
        assert!(reader.join().unwrap() > 1);
        report
    });

    assert_eq!(report.rows, 100);
    assert!(report.elapsed.as_secs_f64() >= 0.5 - 0.02);
}

#[test]
fn calibrated_rate_streams_without_loss() {
    let backend = SimulatedBackend::default();
    let sim = SimSettings {
        sustain_limit: 4000.0,
        max_reads_per_second: 500.0,
        ..Default::default()
    };
    let mut dev = device(&backend, sim);
    let p = plan(&["AIN0", "AIN1", "AIN2"], 1000.0);
    let settings = CalibrationSettings {
        num_seconds: 0.2,
        ..Default::default()
    };
    let report = RateCalibrator::new(&mut dev, &p, settings).calibrate().unwrap();
    let Calibration::Found {
        frequency,
        packet_size,
    } = report.outcome
    else {
        panic!("calibration failed: {:?}", report);
    };
    assert!(frequency <= 4000.0);

    let mut engine = IngestionEngine::new(&mut dev, EngineSettings::default());
    let (_, collected) = engine
        .collect(&p.with_rate(frequency, packet_size), 0.5, None)
        .unwrap();
    assert_eq!(collected.skips, 0);
    assert_eq!(collected.rows, (0.5 * frequency).ceil() as usize);
    assert_eq!(backend.streams_running(), 0);
}

#[test]
fn callbacks_see_rows_with_skips_counted() {
    let backend = SimulatedBackend::default();
    let sim = SimSettings {
        skips: vec![(1, 4)],
        ..Default::default()
    };
    let mut dev = device(&backend, sim);
    let mut engine = IngestionEngine::new(&mut dev, EngineSettings::default());
    let sentinels = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&sentinels);
    let callback: RowCallback = Arc::new(move |row: &SampleRow| {
        let n = row.readings.iter().filter(|&&v| v == SKIP_SENTINEL).count();
        seen.fetch_add(n, Ordering::SeqCst);
    });
    let (_, report) = engine
        .collect(&plan(&["AIN0", "AIN1"], 100.0), 1.0, Some(callback))
        .unwrap();

    assert_eq!(report.skips, 4);
    assert_eq!(report.skip_rate, 2.0);
    assert_eq!(sentinels.load(Ordering::SeqCst), 4);
    assert_eq!(report.dispatch.submitted, 100);
    assert_eq!(report.dispatch.outstanding(), 0);
}

#[test]
fn range_selection_validates_bounds() {
    let backend = SimulatedBackend::default();
    let mut dev = device(&backend, SimSettings::default());
    let mut engine = IngestionEngine::new(&mut dev, EngineSettings::default());
    let (buffer, _) = engine.collect(&plan(&["AIN0"], 20.0), 1.0, None).unwrap();

    let err = buffer
        .select(Selection::Range { start: 8, end: 8 })
        .unwrap_err();
    assert!(err.is_validation());
    let tail = buffer
        .select(Selection::Range { start: 15, end: 1000 })
        .unwrap();
    assert_eq!(tail.nrows(), 5);
    assert_eq!(
        buffer.select(Selection::Relative { num_rows: 5 }).unwrap(),
        tail
    );
}
