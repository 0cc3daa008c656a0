use predicates::str::contains;

#[test]
fn summary_run_reports_metadata() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args([
        "run",
        "--profile",
        "ramp",
        "--workers",
        "2",
        "--duration",
        "2",
        "--rate",
        "100",
        "--seed",
        "7",
        "--format",
        "summary",
    ]);
    cmd.assert()
        .success()
        .stdout(contains("Metadata:\nprofile: ramp\nworkers: 2\nduration_s: 2\nrate: 100\nseed: 7\ntick_ms: 100\nticks: 20/20\n"))
        .stdout(contains("Summary:\nrequests: "))
        .stdout(contains("faults injected: 0\n"));
}

#[test]
fn single_worker_runs_print_identical_reports() {
    let run = || {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
        cmd.args([
            "run",
            "--profile",
            "burst",
            "--workers",
            "1",
            "--duration",
            "3",
            "--rate",
            "300",
            "--format",
            "human",
        ]);
        let output = cmd.output().expect("binary should run");
        assert!(output.status.success());
        output.stdout
    };
    assert_eq!(run(), run());
}

#[test]
fn json_run_is_machine_readable() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args([
        "run",
        "--profile",
        "wave",
        "--workers",
        "3",
        "--duration",
        "1",
        "--tick-ms",
        "250",
        "--format",
        "json",
    ]);
    let output = cmd.output().expect("binary should run");
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(report["profile"], "wave");
    assert_eq!(report["total_ticks"], 4);
    assert_eq!(report["series"].as_array().map(Vec::len), Some(4));
    assert!(report["series"][0].get("elapsedMs").is_some());
}

#[test]
fn chaos_profile_injects_faults() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args([
        "run",
        "--profile",
        "chaos",
        "--chaos-rate",
        "1.0",
        "--workers",
        "2",
        "--duration",
        "1",
        "--format",
        "summary",
    ]);
    cmd.assert()
        .success()
        .stdout(contains("faults injected: 10\n"));
}

#[test]
fn logs_stay_off_stdout() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.env("RUST_LOG", "info").args([
        "run",
        "--workers",
        "1",
        "--duration",
        "1",
        "--format",
        "json",
    ]);
    let output = cmd.output().expect("binary should run");
    assert!(output.status.success());
    serde_json::from_slice::<serde_json::Value>(&output.stdout).expect("stdout should be JSON");
    assert!(String::from_utf8_lossy(&output.stderr).contains("simulation finished"));
}

#[test]
fn plugin_runs_report_a_resilience_score() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args([
        "run",
        "--workers",
        "1",
        "--duration",
        "1",
        "--rate",
        "20",
        "--plugins",
        "resilience-score",
        "--filters",
        "queue-floor",
        "--format",
        "summary",
    ]);
    cmd.assert()
        .success()
        .stdout(contains("resilience score: "));
}
