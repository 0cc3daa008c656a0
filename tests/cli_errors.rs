use predicates::str::contains;

#[test]
fn worker_count_above_cap_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--workers", "2000"]);
    cmd.assert().failure().stderr(contains(
        "Error: safety limit exceeded for 'workers': requested 2000, limit 1000",
    ));
}

#[test]
fn zero_rate_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--rate", "0"]);
    cmd.assert()
        .failure()
        .stderr(contains("Error: invalid config field 'rate': must be greater than 0"));
}

#[test]
fn unknown_profile_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--profile", "flood"]);
    cmd.assert()
        .failure()
        .stderr(contains("unknown attack profile 'flood'"));
}

#[test]
fn missing_config_file_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--config", "/nonexistent/cluster.toml"]);
    cmd.assert()
        .failure()
        .stderr(contains("Error: failed to read config '/nonexistent/cluster.toml'"));
}

#[test]
fn tick_too_short_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--tick-ms", "5"]);
    cmd.assert()
        .failure()
        .stderr(contains("Error: invalid config field 'tick_ms': must be at least 10"));
}

#[test]
fn unknown_filter_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("overload-sim");
    cmd.args(["run", "--filters", "latency-cap,denoise"]);
    cmd.assert()
        .failure()
        .stderr(contains("Error: unknown filter 'denoise'"));
}
