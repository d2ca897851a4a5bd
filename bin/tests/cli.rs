//! End-to-end tests driving the `membersys` binary against a SQLite store

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    config: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("membersys.yaml");
        let db = dir.path().join("members.db");
        std::fs::write(
            &config,
            format!(
                "database:\n  backend: relational\n  path: {}\nlogging:\n  level: warn\n",
                db.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_membersys"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "membersys {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let mut full = vec!["--output", "json"];
        full.extend_from_slice(args);
        serde_json::from_str(&self.ok(&full)).unwrap()
    }
}

fn write_application(path: &Path, name: &str) {
    let record = serde_json::json!({
        "member": { "name": name, "city": "Zürich", "email": "ada@example.com" },
        "metadata": { "request_source_ip": "192.0.2.1" }
    });
    std::fs::write(path, record.to_string()).unwrap();
}

#[test]
fn test_lifecycle_through_cli() {
    let h = Harness::new();
    h.ok(&["init-schema"]);

    let app = h.path("ada.json");
    write_application(&app, "Ada Lovelace");
    let key = h.json(&["create", app.to_str().unwrap()])["key"]
        .as_str()
        .unwrap()
        .to_string();

    let listed = h.json(&["list", "application"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["key"], key.as_str());

    // No document yet
    let refused = h.run(&["move", &key, "application", "queue", "--by", "jdoe"]);
    assert!(!refused.status.success());

    let scan = h.path("scan.pdf");
    std::fs::write(&scan, b"%PDF-1.4 signed").unwrap();
    h.ok(&["attach", &key, scan.to_str().unwrap()]);
    h.ok(&["move", &key, "application", "queue", "--by", "jdoe"]);

    let queued = h.json(&["show", "queue", &key]);
    assert_eq!(queued["agreement"]["member"]["name"], "Ada Lovelace");
    assert_eq!(queued["agreement"]["metadata"]["approver_uid"], "jdoe");

    let applications = h.json(&["list", "application"]);
    assert!(applications.as_array().unwrap().is_empty());
}

#[test]
fn test_set_dispatches_by_field() {
    let h = Harness::new();
    let app = h.path("app.json");
    write_application(&app, "Grace Hopper");
    let key = h.ok(&["create", app.to_str().unwrap()]).trim().to_string();
    let scan = h.path("scan.pdf");
    std::fs::write(&scan, b"%PDF-1.4 signed").unwrap();
    h.ok(&["attach", &key, scan.to_str().unwrap()]);
    h.ok(&["move", &key, "application", "queue", "--by", "jdoe"]);
    h.ok(&["move", &key, "queue", "member", "--by", "jdoe"]);

    h.ok(&["set", &key, "city", "Bern"]);
    h.ok(&["set", &key, "has_key", "true"]);
    h.ok(&["fee", &key, "2500", "--yearly"]);

    let shown = h.json(&["show", "member", &key]);
    let member = &shown["agreement"]["member"];
    assert_eq!(member["city"], "Bern");
    assert_eq!(member["has_key"], true);
    assert_eq!(member["fee"], 2500);
    assert_eq!(member["fee_yearly"], true);

    h.ok(&["set", &key, "username", "grace"]);
    let found = h.json(&["user", "grace"]);
    assert!(found.get("key").is_none());
    assert_eq!(found["member"]["name"], "Grace Hopper");
    let pretty = h.ok(&["user", "grace"]);
    assert!(pretty.lines().all(|l| l.trim() != "grace"));
    assert!(pretty.lines().any(|l| l.contains("username:  grace")));

    let unknown = h.run(&["set", &key, "shoe_size", "42"]);
    assert!(!unknown.status.success());
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("unknown field"));
}

#[test]
fn test_list_filters_by_name_prefix() {
    let h = Harness::new();
    for (i, name) in ["Ada Lovelace", "Alan Turing", "Barbara Liskov"].iter().enumerate() {
        let file = h.path(&format!("app{i}.json"));
        write_application(&file, name);
        h.ok(&["create", file.to_str().unwrap()]);
    }

    let pretty = h.ok(&["list", "application", "--name", "a"]);
    let lines: Vec<&str> = pretty.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|l| !l.contains("Barbara")));

    let limited = h.json(&["list", "application", "--limit", "1"]);
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[test]
fn test_missing_config_is_an_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_membersys"))
        .args(["reclaim"])
        .env_remove("MEMBERSYS_CONFIG")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no configuration"));
}
