//! End-to-end tests over recordings written to disk.

use ndarray::Array2;
use std::fs::File;
use std::path::Path;

use neuroraw::tags::{block, kind, SampleEncoding};
use neuroraw::{
    ChannelInfo, ChannelKind, ChannelSelection, ContainerWriter, NamedMatrix, RawReader,
    ReaderOptions,
};

const NCHAN: usize = 4;
const NBUF: usize = 3;
const NSAMP: usize = 100;

fn channel_infos() -> Vec<ChannelInfo> {
    let mut infos: Vec<ChannelInfo> = (0..3)
        .map(|c| ChannelInfo {
            name: format!("EEG {:03}", c + 1),
            cal: 1.0,
            range: 1.0,
            kind: ChannelKind::Sensor,
            scan_no: c as i32 + 1,
        })
        .collect();
    infos.push(ChannelInfo {
        name: "STI 014".to_string(),
        cal: 1.0,
        range: 1.0,
        kind: ChannelKind::Stimulus,
        scan_no: 4,
    });
    infos
}

/// Writes a full recording: info block, compensation set at grade 1
/// (EEG 001 minus EEG 002), a common-mode projection item over the EEG
/// channels, EEG 003 marked bad, and three float buffers where channel
/// `c` carries `value(c, s)`.
fn write_recording<F>(path: &Path, value: F)
where
    F: Fn(usize, i64) -> f32,
{
    let file = File::create(path).unwrap();
    let mut w = ContainerWriter::new(file);
    w.start_block(block::MEAS).unwrap();

    w.start_block(block::MEAS_INFO).unwrap();
    w.write_i32(kind::NCHAN, NCHAN as i32).unwrap();
    w.write_f32(kind::SAMPLE_RATE, 250.0).unwrap();
    for ch in channel_infos() {
        w.write_ch_info(&ch).unwrap();
    }
    w.end_block(block::MEAS_INFO).unwrap();

    w.start_block(block::COMPENSATION).unwrap();
    w.start_block(block::COMP_DATA).unwrap();
    w.write_i32(kind::COMP_GRADE, 1).unwrap();
    w.write_named_matrix(&NamedMatrix {
        row_names: vec!["EEG 001".into()],
        col_names: vec!["EEG 002".into()],
        data: Array2::from_elem((1, 1), 1.0),
    })
    .unwrap();
    w.end_block(block::COMP_DATA).unwrap();
    w.end_block(block::COMPENSATION).unwrap();

    w.start_block(block::PROJECTION).unwrap();
    w.start_block(block::PROJ_ITEM).unwrap();
    w.write_string(kind::PROJ_ITEM_NAME, "common mode").unwrap();
    w.write_i32(kind::PROJ_ITEM_ACTIVE, 1).unwrap();
    w.write_named_matrix(&NamedMatrix {
        row_names: vec!["common mode".into()],
        col_names: vec!["EEG 001".into(), "EEG 002".into(), "EEG 003".into()],
        data: Array2::from_elem((1, 3), 1.0),
    })
    .unwrap();
    w.end_block(block::PROJ_ITEM).unwrap();
    w.end_block(block::PROJECTION).unwrap();

    w.start_block(block::BAD_CHANNELS).unwrap();
    w.write_string(kind::BAD_CH_NAME, "EEG 003").unwrap();
    w.end_block(block::BAD_CHANNELS).unwrap();

    w.start_block(block::RAW_DATA).unwrap();
    w.write_i32(kind::FIRST_SAMPLE, 0).unwrap();
    for b in 0..NBUF {
        let samples = Array2::from_shape_fn((NCHAN, NSAMP), |(c, s)| {
            value(c, (b * NSAMP + s) as i64)
        });
        w.write_data_buffer(SampleEncoding::Float32, &samples).unwrap();
    }
    w.end_block(block::RAW_DATA).unwrap();

    w.end_block(block::MEAS).unwrap();
    w.finish().unwrap();
}

fn ramp(c: usize, s: i64) -> f32 {
    (c as f32 + 1.0) * 100.0 + s as f32
}

fn open(path: &Path, options: ReaderOptions) -> RawReader<File> {
    let _ = env_logger::builder().is_test(true).try_init();
    RawReader::open(File::open(path).unwrap(), options).unwrap()
}

#[test]
fn test_open_reports_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);

    let reader = open(&path, ReaderOptions::default());
    assert_eq!(reader.catalog().len(), NCHAN);
    assert_eq!(reader.sample_rate(), 250.0);
    assert_eq!(reader.first_sample(), 0);
    assert_eq!(reader.last_sample(), 299);
    assert_eq!(reader.n_samples(), 300);
    assert_eq!(reader.compensation_grades(), vec![1]);
    assert!(reader.catalog().is_bad(2));
}

#[test]
fn test_compensation_grade_switch_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());

    let plain = reader.pick(None, 10, 5).unwrap();
    assert_eq!(plain[[0, 0]], ramp(0, 10));

    reader.set_compensation_grade(1).unwrap();
    let comp = reader.pick(None, 10, 5).unwrap();
    for s in 0..5 {
        let sample = 10 + s as i64;
        // grade 1 subtracts EEG 002 from EEG 001
        assert!((comp[[0, s]] - (ramp(0, sample) - ramp(1, sample))).abs() < 1e-3);
        assert_eq!(comp[[1, s]], plain[[1, s]]);
        assert_eq!(comp[[3, s]], plain[[3, s]]);
    }

    reader.set_compensation_grade(0).unwrap();
    let restored = reader.pick(None, 10, 5).unwrap();
    for (a, b) in restored.iter().zip(plain.iter()) {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn test_unknown_grade_without_references_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());
    reader.set_compensation_grade(7).unwrap();
    assert_eq!(reader.active_grade(), 0);
}

#[test]
fn test_projection_removes_common_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());

    let out = reader.pick_projected(None, 0, 50).unwrap();
    // EEG 003 is bad, so the basis direction is (1,1,0,0)/sqrt(2) and the
    // projected sum of the first two channels vanishes
    for s in 0..50 {
        assert!((out[[0, s]] + out[[1, s]]).abs() < 1e-2);
    }
    // stimulus channel is outside the subspace
    let plain = reader.pick(None, 0, 50).unwrap();
    for s in 0..50 {
        assert_eq!(out[[3, s]], plain[[3, s]]);
    }
}

#[test]
fn test_projection_is_idempotent_over_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());

    let once = reader.pick_projected(None, 120, 40).unwrap();
    let again = reader.pick_projected(None, 120, 40).unwrap();
    assert_eq!(once, again);
}

#[test]
fn test_filtered_stimulus_passes_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    // EEG rows zero-based sinusoids, stimulus a 0/1 trigger train
    write_recording(&path, |c, s| {
        if c == 3 {
            (s % 2) as f32
        } else {
            (s as f32 * 0.37).sin() * (c as f32 + 1.0)
        }
    });

    let mut options = ReaderOptions::default();
    options.filter.enabled = true;
    options.filter.block_size = 100;
    options.filter.taper_size = 25;
    let mut reader = open(&path, options);

    let filtered = reader.pick_filtered(None, 50, 150).unwrap();
    let reference = reader.pick_projected(None, 50, 150).unwrap();
    for s in 0..150 {
        assert_eq!(filtered[[3, s]], reference[[3, s]]);
    }
}

#[test]
fn test_allpass_filter_reproduces_projected_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, |c, s| {
        if c == 3 {
            0.0
        } else {
            (s as f32 * 0.37).sin() * (c as f32 + 1.0)
        }
    });

    let mut options = ReaderOptions::default();
    options.filter.enabled = true;
    options.filter.block_size = 100;
    options.filter.taper_size = 25;
    options.filter.band.highpass = 0.0;
    options.filter.band.lowpass = 0.0;
    options.filter.eog_band = options.filter.band;
    let mut reader = open(&path, options);

    let filtered = reader.pick_filtered(None, 30, 200).unwrap();
    let reference = reader.pick_projected(None, 30, 200).unwrap();
    for (a, b) in filtered.iter().zip(reference.iter()) {
        assert!((a - b).abs() < 1e-2, "{} vs {}", a, b);
    }
}

#[test]
fn test_filtered_baseline_follows_compensation_and_projection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    // constant per-channel offsets; each channel equals its own baseline
    write_recording(&path, |c, _| match c {
        3 => 0.0,
        _ => (c as f32 + 1.0) * 100.0,
    });

    let mut options = ReaderOptions::default();
    options.filter.enabled = true;
    options.filter.block_size = 100;
    options.filter.taper_size = 25;
    options.filter.band.highpass = 0.0;
    options.filter.band.lowpass = 0.0;
    options.filter.eog_band = options.filter.band;
    let mut reader = open(&path, options);

    // the dc offset must live in the projected space, so constant data
    // minus its own projected baseline filters to zero on every channel
    let filtered = reader.pick_filtered(None, 50, 150).unwrap();
    for v in filtered.iter() {
        assert!(v.abs() < 1e-2, "{}", v);
    }

    // same at grade 1: the baseline is compensated along with the data
    reader.set_compensation_grade(1).unwrap();
    let filtered = reader.pick_filtered(None, 50, 150).unwrap();
    for v in filtered.iter() {
        assert!(v.abs() < 1e-2, "{}", v);
    }
}

#[test]
fn test_out_of_range_pick_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());

    let sel = ChannelSelection::new(vec![99]);
    assert!(reader.pick(Some(&sel), 0, 5).is_err());
    assert!(reader.pick_projected(Some(&sel), 0, 5).is_err());
}

#[test]
fn test_lowpass_suppresses_fast_component() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    // 100 Hz component at 250 Hz sampling rides on a slow 1 Hz wave
    write_recording(&path, |c, s| {
        if c == 3 {
            0.0
        } else {
            let t = s as f32 / 250.0;
            (2.0 * std::f32::consts::PI * t).sin()
                + (2.0 * std::f32::consts::PI * 100.0 * t).sin()
        }
    });

    let mut options = ReaderOptions::default();
    options.filter.enabled = true;
    options.filter.block_size = 100;
    options.filter.taper_size = 25;
    options.filter.band.highpass = 0.0;
    options.filter.band.lowpass = 20.0;
    options.filter.band.lowpass_width = 5.0;
    let mut reader = open(&path, options);

    let filtered = reader.pick_filtered(None, 50, 200).unwrap();
    let reference = reader.pick_projected(None, 50, 200).unwrap();
    let power = |m: &Array2<f32>| -> f32 { m.row(0).iter().map(|v| v * v).sum() };
    assert!(power(&filtered) < power(&reference) * 0.7);
}

#[test]
fn test_int16_calibration_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");

    let file = File::create(&path).unwrap();
    let mut w = ContainerWriter::new(file);
    w.start_block(block::MEAS).unwrap();
    w.start_block(block::MEAS_INFO).unwrap();
    w.write_i32(kind::NCHAN, 2).unwrap();
    w.write_f32(kind::SAMPLE_RATE, 100.0).unwrap();
    for c in 0..2 {
        w.write_ch_info(&ChannelInfo {
            name: format!("EEG {:03}", c + 1),
            cal: 0.01,
            range: 0.5,
            kind: ChannelKind::Sensor,
            scan_no: c + 1,
        })
        .unwrap();
    }
    w.end_block(block::MEAS_INFO).unwrap();
    w.start_block(block::RAW_DATA).unwrap();
    w.write_i32(kind::FIRST_SAMPLE, 0).unwrap();
    let samples = Array2::from_shape_fn((2, 20), |(c, s)| (c * 100 + s) as f32);
    w.write_data_buffer(SampleEncoding::Int16, &samples).unwrap();
    w.end_block(block::RAW_DATA).unwrap();
    w.end_block(block::MEAS).unwrap();
    w.finish().unwrap();

    let mut reader = open(&path, ReaderOptions::default());
    let out = reader.pick(None, 0, 20).unwrap();
    for c in 0..2 {
        for s in 0..20 {
            let expected = (c * 100 + s) as f32 * 0.01 * 0.5;
            assert!((out[[c, s]] - expected).abs() < 1e-6);
        }
    }
}

#[test]
fn test_pick_by_selection_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec.dat");
    write_recording(&path, ramp);
    let mut reader = open(&path, ReaderOptions::default());

    let sel = ChannelSelection::by_names(reader.catalog(), &["EEG 002", "STI 014"]).unwrap();
    let out = reader.pick(Some(&sel), 5, 3).unwrap();
    assert_eq!(out.dim(), (2, 3));
    assert_eq!(out[[0, 0]], ramp(1, 5));
    assert_eq!(out[[1, 2]], ramp(3, 7));
}
