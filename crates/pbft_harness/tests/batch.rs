//! Batch driver sweeps against a recording trial runner.
//!
//! Time is paused so the stabilization wait can be measured on the tokio
//! clock without slowing the suite down.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, RecordingRunner};
use pbft_harness::{
    BatchDriver, ClusterTag, CommandOutput, DriverState, ElapsedSampler, HarnessConfig,
    HarnessError,
};

fn tag(s: &str) -> ClusterTag {
    s.parse().unwrap()
}

fn two_point_config(dir: &std::path::Path) -> HarnessConfig {
    let mut config = fast_config(dir);
    config.batch.sweep = vec![10, 16];
    config.batch.cluster_count = 5;
    config.batch.stabilization_wait = Duration::from_secs(12);
    config
}

fn read_log(config: &HarnessConfig) -> String {
    std::fs::read_to_string(&config.batch.result_log).unwrap()
}

#[tokio::test(start_paused = true)]
async fn primary_sweep_writes_headers_and_waits_between_trials() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_point_config(dir.path());
    let runner = Arc::new(RecordingRunner::new());
    let driver = BatchDriver::new(config.clone(), runner.clone(), Arc::new(ElapsedSampler));

    let summary = driver.run(&[tag("N")]).await.unwrap();
    assert_eq!(driver.state(), DriverState::Done);
    assert_eq!(summary.succeeded_trials(), 2);
    assert_eq!(summary.failed_trials(), 0);

    let calls = runner.calls();
    assert_eq!(
        calls.iter().map(|c| c.line.as_str()).collect::<Vec<_>>(),
        [
            "./test.sh 10 5 0.0.0.0 43.131.248.12 43.128.253.129 150.109.6.41 43.133.117.50 N",
            "./test.sh 16 5 0.0.0.0 43.131.248.12 43.128.253.129 150.109.6.41 43.133.117.50 N",
        ]
    );
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(12));

    let log = read_log(&config);
    let lines = log.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Duration time(N=10 Z=5)");
    assert_eq!(lines[2], "Duration time(N=16 Z=5)");
    assert!(lines[1].parse::<f64>().is_ok());
    assert!(lines[3].parse::<f64>().is_ok());
}

#[tokio::test(start_paused = true)]
async fn secondary_sweep_skips_the_stabilization_wait() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_point_config(dir.path());
    let runner = Arc::new(RecordingRunner::new());
    let driver = BatchDriver::new(config, runner.clone(), Arc::new(ElapsedSampler));

    driver.run(&[tag("M")]).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at < Duration::from_secs(1));
    assert!(calls[0]
        .line
        .starts_with("./test.sh 10 5 43.132.126.36 0.0.0.0 "));
    assert!(calls[0].line.ends_with(" M"));
}

#[tokio::test(start_paused = true)]
async fn prior_sections_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_point_config(dir.path());
    let previous = "Duration time(N=4 Z=3)\n9.000\n";
    std::fs::write(&config.batch.result_log, previous).unwrap();

    let driver = BatchDriver::new(
        config.clone(),
        Arc::new(RecordingRunner::new()),
        Arc::new(ElapsedSampler),
    );
    driver.run(&[tag("K")]).await.unwrap();

    let log = read_log(&config);
    assert!(log.starts_with(previous));
    let headers = log.lines().filter(|l| l.starts_with("Duration time(")).count();
    assert_eq!(headers, 3);
}

#[tokio::test(start_paused = true)]
async fn repeats_append_samples_under_one_header() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = two_point_config(dir.path());
    config.batch.sweep = vec![22];
    config.batch.trials_per_point = 3;
    let runner = Arc::new(RecordingRunner::new());
    let driver = BatchDriver::new(config.clone(), runner.clone(), Arc::new(ElapsedSampler));

    let summary = driver.run(&[tag("P")]).await.unwrap();
    assert_eq!(summary.points.len(), 1);
    assert_eq!(summary.points[0].succeeded, 3);
    assert_eq!(runner.calls().len(), 3);

    let log = read_log(&config);
    let lines = log.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "Duration time(N=22 Z=5)");
    assert_eq!(lines.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn failed_trials_are_recorded_and_the_sweep_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = two_point_config(dir.path());
    config.batch.sweep = vec![10, 16, 22];
    let runner = Arc::new(
        RecordingRunner::new()
            .respond("./test.sh 16 ", CommandOutput::failed(3, "ssh: connect refused"))
            .fail_to_spawn("./test.sh 22 ", std::io::ErrorKind::NotFound),
    );
    let driver = BatchDriver::new(config.clone(), runner.clone(), Arc::new(ElapsedSampler));

    let summary = driver.run(&[tag("J")]).await.unwrap();
    assert_eq!(runner.calls().len(), 3);
    assert_eq!(summary.succeeded_trials(), 1);
    assert_eq!(summary.failed_trials(), 2);
    assert!(summary.points[1].failures[0].contains("exit status 3"));

    let log = read_log(&config);
    let lines = log.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 6);
    assert!(lines[3].starts_with("failed: exit status 3"));
    assert!(lines[5].starts_with("failed: "));
    assert!(summary.to_string().contains("N=16"));
}

#[tokio::test]
async fn more_than_one_local_override_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_point_config(dir.path());
    let runner = Arc::new(RecordingRunner::new());
    let driver = BatchDriver::new(config.clone(), runner.clone(), Arc::new(ElapsedSampler));

    let err = driver.run(&[tag("N"), tag("M")]).await.unwrap_err();
    assert!(matches!(err, HarnessError::InvalidArgument(_)));
    assert!(matches!(
        driver.run(&[]).await,
        Err(HarnessError::InvalidArgument(_))
    ));
    assert!(matches!(
        driver.run(&[tag("Q")]).await,
        Err(HarnessError::InvalidArgument(_))
    ));
    assert!(runner.calls().is_empty());
    assert!(!config.batch.result_log.exists());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let config = two_point_config(dir.path());
    let runner = Arc::new(RecordingRunner::new());
    let driver = BatchDriver::new(config, runner.clone(), Arc::new(ElapsedSampler));

    let cancel = driver.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    // The first trial is followed by a 12s wait; cancelling inside it ends
    // the sweep before the second point starts.
    let summary = driver.run(&[tag("N")]).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.points.len(), 1);
    assert_eq!(runner.calls().len(), 1);
}
