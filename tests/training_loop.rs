//! Integration tests for the training loop on host-side mock networks.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{call_log, history, small_options, trainer, trainer_with_noise, LoggedNoise};
use rust_pggan::training::TrainingMetrics;
use rust_pggan::utils::CheckpointTag;
use rust_pggan::{Phase, PgganError};
use tempfile::TempDir;

#[test]
fn test_step_order() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut t = trainer(small_options(tmp.path()), &log).unwrap();
    t.train().unwrap();

    let calls = log.borrow();
    let first: Vec<&str> = calls.iter().take(12).map(|c| c.split(' ').next().unwrap()).collect();
    assert_eq!(
        first,
        vec![
            "noise.sample",
            "data.sample",
            "G.set_lr",
            "D.set_lr",
            "D.zero_grad",
            "G.forward",
            "D.forward",
            "D.forward",
            "D.backward_step",
            "G.zero_grad",
            "D.forward",
            "G.backward_step",
        ]
    );
    // the real batch is scored first and is the only one that may carry input noise
    assert!(calls[7].ends_with("noise=0"));
    assert!(calls[10].ends_with("noise=0"));
}

#[test]
fn test_end_to_end_counts() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut t = trainer(small_options(tmp.path()), &log).unwrap();

    assert_eq!(t.sequencer().total_iterations(), 128);
    let summary = t.train().unwrap();

    assert_eq!(summary.iterations, 128);
    assert!(!summary.stopped);
    assert_eq!(summary.state.cur_nimg, 128 * 32);
    assert_eq!(summary.state.level, 2);
    assert_eq!(summary.state.phase, Phase::FadeIn);
    assert_eq!(summary.state.iteration, 63);

    let calls = log.borrow();
    assert_eq!(calls.iter().filter(|c| *c == "G.backward_step").count(), 128);
    assert_eq!(calls.iter().filter(|c| *c == "D.backward_step").count(), 128);

    // data resolutions: 4x4 stabilize, then 8x8 for fade-in and the next stabilize, then 16x16
    let resolutions: Vec<&str> = calls
        .iter()
        .filter_map(|c| c.strip_prefix("data.sample "))
        .collect();
    assert!(resolutions[..32].iter().all(|r| *r == "4"));
    assert!(resolutions[32..96].iter().all(|r| *r == "8"));
    assert!(resolutions[96..].iter().all(|r| *r == "16"));

    let layout = t.layout();
    let tags: Vec<String> = layout.checkpoints().list().iter().map(|t| t.to_string()).collect();
    assert_eq!(
        tags,
        vec![
            "4x4-stabilize-000031",
            "4x4-fade_in-000063",
            "8x8-stabilize-000031",
            "8x8-fade_in-000063",
        ]
    );
    assert_eq!(summary.last_checkpoint, Some("8x8-fade_in-000063".parse().unwrap()));

    let mut samples: Vec<String> = std::fs::read_dir(&layout.samples)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    samples.sort();
    assert_eq!(
        samples,
        vec![
            "16x16-fade_in-000063.png",
            "4x4-stabilize-000000.png",
            "4x4-stabilize-000031.png",
            "8x8-fade_in-000063.png",
            "8x8-stabilize-000000.png",
            "8x8-stabilize-000031.png",
        ]
    );

    let metrics = TrainingMetrics::load_csv(layout.metrics_path()).unwrap();
    assert_eq!(metrics.len(), 128);
    let last = metrics.last().unwrap();
    // memory holds a bounded window only
    assert_eq!(t.metrics().len(), 128);
    assert_eq!(t.metrics().recent().count(), 100);
    assert_eq!(t.metrics().latest(), Some(last));
    assert_eq!(last.cur_level, 3.0);
    assert_eq!(last.resolution, 16);

    let events = std::fs::read_to_string(layout.events_path()).unwrap();
    assert!(events.contains("\"4/stabilize/G_loss\""));
    assert!(events.contains("\"G/8/fade_in/project/weight/grad\""));
    assert!(layout.root.read_dir().unwrap().any(|e| {
        e.unwrap().file_name().to_string_lossy().starts_with("options_")
    }));
}

#[test]
fn test_periodic_checkpoints() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut options = small_options(tmp.path());
    options.target_resol = 4;
    options.first_resol = 4;
    options.save_freq = 20;
    let mut t = trainer(options, &log).unwrap();
    t.train().unwrap();

    let tags: Vec<String> = t.layout().checkpoints().list().iter().map(|t| t.to_string()).collect();
    // iteration 0 is never saved on the frequency
    assert_eq!(
        tags,
        vec![
            "4x4-stabilize-000020",
            "4x4-stabilize-000031",
            "4x4-fade_in-000040",
            "4x4-fade_in-000060",
            "4x4-fade_in-000063",
        ]
    );
}

#[test]
fn test_noise_disabled() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut options = small_options(tmp.path());
    options.no_noise = true;
    let mut t = trainer(options, &log).unwrap();
    t.train().unwrap();

    assert!(history(&t).iter().all(|r| r.noise_strength == 0.0));
    assert_eq!(t.noise_injector().d_ema(), None);
    assert!(log
        .borrow()
        .iter()
        .filter(|c| c.starts_with("D.forward"))
        .all(|c| c.ends_with("noise=0")));
}

#[test]
fn test_noise_follows_real_scores() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut t = trainer(small_options(tmp.path()), &log).unwrap();
    t.train().unwrap();

    let records = history(&t);
    assert_eq!(records[0].noise_strength, 0.0);

    // replay the EMA from the recorded real-score means
    let mut ema = 0.0;
    for pair in records.windows(2) {
        ema = ema * 0.9 + pair[0].d_real_mean.clamp(0.0, 1.0) * 0.1;
        let expected = 0.2 * (ema - 0.5f64).max(0.0).powi(2);
        assert!((pair[1].noise_strength - expected).abs() < 1e-12);
    }
    assert!((t.noise_injector().d_ema().unwrap() - ema).abs() < 1e-12);
}

#[test]
fn test_learning_rates_follow_images() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut options = small_options(tmp.path());
    options.rampup_kimg = 2.0;
    options.total_kimg = 4.096;
    options.rampdown_kimg = 1.0;
    let mut t = trainer(options, &log).unwrap();
    t.train().unwrap();

    let records = history(&t);
    // lr is computed from the images shown before the step
    assert!((records[0].g_lr - 1e-3 * (-5.0f64).exp()).abs() < 1e-15);
    let peak = records.iter().map(|r| r.g_lr).fold(0.0, f64::max);
    assert!((peak - 1e-3).abs() < 1e-12);
    let last = records.last().unwrap();
    assert!((last.g_lr - 1e-3 * 0.032).abs() < 1e-9);
}

#[test]
fn test_stop_before_training() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut t = trainer(small_options(tmp.path()), &log).unwrap();
    t.stop_handle().store(true, Ordering::SeqCst);

    let summary = t.train().unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.last_checkpoint, None);
    assert!(t.layout().checkpoints().list().is_empty());
}

#[test]
fn test_stop_mid_run_checkpoints() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let options = small_options(tmp.path());

    // raised while drawing the fifth batch, honoured before the sixth iteration
    let flag = Arc::new(AtomicBool::new(false));
    let noise = LoggedNoise::new(options.latent_size, &log).stop_after(Arc::clone(&flag), 5);
    let mut t = trainer_with_noise(options, &log, noise).unwrap().with_stop_handle(flag);

    let summary = t.train().unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.iterations, 5);
    assert_eq!(summary.state.cur_nimg, 5 * 32);
    assert_eq!(summary.last_checkpoint, Some("4x4-stabilize-000004".parse().unwrap()));
    assert!(t
        .layout()
        .checkpoints()
        .generator_path(&"4x4-stabilize-000004".parse().unwrap())
        .is_file());
}

#[test]
fn test_numeric_error_aborts() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let options = small_options(tmp.path());
    let noise = LoggedNoise::new(options.latent_size, &log);
    let mut d = common::MockDiscriminator::new(&log);
    d.poison = true;
    let mut t = rust_pggan::Trainer::new(options, common::MockGenerator::new(&log), d, noise, common::LoggedData::new(&log))
        .unwrap()
        .with_progress(false);

    let err = t.train().unwrap_err();
    assert!(matches!(err, PgganError::Numeric(_)));
    assert!(!err.is_startup_error());
    assert!(!log.borrow().iter().any(|c| c == "D.backward_step"));
}

#[test]
fn test_flat_sample_batch_aborts() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let options = small_options(tmp.path());
    let noise = LoggedNoise::new(options.latent_size, &log);
    let mut g = common::MockGenerator::new(&log);
    g.flat = true;
    let mut t = rust_pggan::Trainer::new(options, g, common::MockDiscriminator::new(&log), noise, common::LoggedData::new(&log))
        .unwrap()
        .with_progress(false);

    // the first sample is written at iteration 0
    let err = t.train().unwrap_err();
    assert!(matches!(err, PgganError::Numeric(_)));
    assert!(!err.is_startup_error());
    assert_eq!(log.borrow().iter().filter(|c| *c == "G.backward_step").count(), 1);
    assert!(t.layout().checkpoints().list().is_empty());
    assert_eq!(std::fs::read_dir(&t.layout().samples).unwrap().count(), 0);
}

#[test]
fn test_two_trainers_same_exp_dir() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut first = trainer(small_options(tmp.path()), &log).unwrap();
    let mut second = trainer(small_options(tmp.path()), &log).unwrap();
    assert_ne!(first.layout().root, second.layout().root);

    first.train().unwrap();
    second.train().unwrap();
    for t in [&first, &second] {
        assert_eq!(t.layout().checkpoints().list().len(), 4);
        assert_eq!(history(t).len(), 128);
    }
}

#[test]
fn test_checkpoint_tag_of_state() {
    let tmp = TempDir::new().unwrap();
    let log = call_log();
    let mut t = trainer(small_options(tmp.path()), &log).unwrap();
    t.train().unwrap();
    assert_eq!(
        CheckpointTag::for_state(t.state()).to_string(),
        "8x8-fade_in-000063"
    );
}
