use std::process::Command;

use mpd_harness::nodes::PEER_ID_PREFIX;
use serde_json::Value;

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn three_servers_yield_one_downnode_and_three_upnodes() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_mpd-gen-config"))
        .arg("3")
        .arg("--config-dir")
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        [
            "downnode_mn.json",
            "upnode_mn0.json",
            "upnode_mn1.json",
            "upnode_mn2.json"
        ]
    );

    let down = read_json(&dir.path().join("downnode_mn.json"));
    assert_eq!(down["IP"], "10.100.0.1");
    assert_eq!(down["port"], 48888);
    let upnodes = down["upnodes"].as_array().unwrap();
    assert_eq!(upnodes.len(), 3);

    for (idx, entry) in upnodes.iter().enumerate() {
        let ip = entry["IP"].as_str().unwrap();
        let id = entry["selfpeerID"].as_str().unwrap();
        assert!(ip.ends_with(&format!(".{idx}")), "{ip}");
        assert!(id.ends_with(&format!("{idx:02}")), "{id}");
        assert!(id.starts_with(PEER_ID_PREFIX));
        assert_eq!(entry["port"], 41111);

        let up = read_json(&dir.path().join(format!("upnode_mn{idx}.json")));
        assert_eq!(&up, entry);
    }
}

#[test]
fn two_clients_get_numbered_downnodes() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_mpd-gen-config"))
        .args(["2", "--clients", "2", "--config-dir"])
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());

    let first = read_json(&dir.path().join("downnode_mn1.json"));
    let second = read_json(&dir.path().join("downnode_mn2.json"));
    assert_eq!(first["selfpeerID"], format!("{PEER_ID_PREFIX}FF"));
    assert_eq!(second["selfpeerID"], format!("{PEER_ID_PREFIX}FE"));
    assert_eq!(second["IP"], "10.100.0.2");
    assert_eq!(second["upnodes"].as_array().unwrap().len(), 2);
}

#[test]
fn too_many_clients_fail_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_mpd-gen-config"))
        .args(["2", "--clients", "255", "--config-dir"])
        .arg(dir.path().join("config"))
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("clients requested"));
    assert!(!dir.path().join("config").exists());
}
