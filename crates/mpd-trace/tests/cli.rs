use std::process::Command;

const LOG: &str = "\
12:00:00.001 [MPDClient::OnRtt()] [custom] latest_rtt: 100us, smoothed_rtt: 50us, recv_tic: 2000, session_id: 1,
12:00:00.002 [MPDClient::OnRtt()] [custom] latest_rtt: 120us, smoothed_rtt: 55us, recv_tic: 2500, session_id: 1,
12:00:00.003 [Cc::OnLoss()] losses: valid: 0 ... losttic: 3000 ... session_id: 1 seq seq
12:00:00.004 [Cc::OnLoss()] losses: valid: 1 seq: 7, losttic: 2400, session_id: 1,
12:00:00.005 [Cc::OnSend()] [custom] session_id: 1, send_tic: 2100, cwnd: 16
12:00:00.006 [Cc::OnDataRecv()] deliveryRate: 1.5, btlBw: 2.5, recv_tic: 2200
12:00:00.007 [MPDClient::OnRtt()] [custom] latest_rtt: broken
";

#[test]
fn summary_only() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("client_stdout");
    std::fs::write(&log, LOG).unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_mpd-trace"))
        .arg(&log)
        .arg("--no-plots")
        .output()
        .unwrap();
    assert!(out.status.success());

    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("window end: 2500"), "{stdout}");
    assert!(stdout.contains("session 1: rtt min 100 max 120 mean 110.0 over 500 tics"), "{stdout}");
    assert!(stdout.contains("loss total: 3"), "{stdout}");
    assert!(stdout.contains("btlBw max 2.500"), "{stdout}");
    assert!(stdout.contains("skipped 1 malformed lines, discarded 1 records"), "{stdout}");
    assert!(!stdout.contains(".svg"), "{stdout}");
}

#[test]
fn charts_are_written_to_out_dir() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("client_stdout");
    std::fs::write(&log, LOG).unwrap();
    let plots = dir.path().join("plots");

    let out = Command::new(env!("CARGO_BIN_EXE_mpd-trace"))
        .arg(&log)
        .arg("--out")
        .arg(&plots)
        .output()
        .unwrap();
    assert!(out.status.success());

    for name in ["rtt.svg", "loss.svg", "cwnd.svg", "rtt_loss_cwnd.svg", "delivery.svg"] {
        assert!(plots.join(name).exists(), "{name} missing");
    }
    assert!(!plots.join("rtprop.svg").exists());
}

#[test]
fn missing_log_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_mpd-trace"))
        .arg(dir.path().join("nope"))
        .output()
        .unwrap();
    assert!(!out.status.success());
}
