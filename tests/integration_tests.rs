//! Integration tests for the devdock CLI.
//!
//! Every test points the config, data and hosts paths into a temp dir so
//! nothing touches the real user environment.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A devdock command isolated inside `dir`.
fn devdock(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("devdock");
    cmd.env("DEVDOCK_CONFIG", dir.path().join("devdock.toml"))
        .env("DEVDOCK_DATA_DIR", dir.path().join("data"))
        .env("DEVDOCK_PROJECTS_DIR", dir.path().join("projects"))
        .env("DEVDOCK_HOSTS_FILE", dir.path().join("hosts"))
        .env_remove("DEVDOCK_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn write_projects(dir: &TempDir, json: &str) {
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("projects.json"), json).unwrap();
}

const ONE_PROJECT: &str = r#"[
  {
    "id": "4f9c2b1e-0000-4000-8000-000000000001",
    "name": "shop",
    "template": "laravel",
    "path": "/nonexistent/devdock/shop",
    "ports": { "app": 8000, "db": 3306 },
    "status": "stopped",
    "config": {
      "services": [],
      "php_version": "8.3",
      "node_version": "20",
      "database": { "name": "shop", "user": "shop", "password": "secret" }
    },
    "created_at": "2026-01-01T00:00:00Z",
    "last_activity": "2026-01-01T00:00:00Z"
  }
]"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        devdock(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        devdock(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        devdock(&dir).arg("launch").assert().failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_init_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("devdock.toml");

        devdock(&dir)
            .arg("--config")
            .arg(&path)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created devdock.toml"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("[paths]"));
    }

    #[test]
    fn test_init_keeps_existing_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devdock.toml");
        fs::write(&path, "[server]\nport = 4100\n").unwrap();

        devdock(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        assert!(fs::read_to_string(&path).unwrap().contains("4100"));

        devdock(&dir).arg("init").arg("--force").assert().success();
        assert!(!fs::read_to_string(&path).unwrap().contains("4100"));
    }

    #[test]
    fn test_config_shows_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        devdock(&dir)
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("[server]"));
    }

    #[test]
    fn test_config_reflects_file_and_env() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("devdock.toml"), "[server]\nport = 4100\n").unwrap();

        devdock(&dir)
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4100"));

        devdock(&dir)
            .env("DEVDOCK_PORT", "4200")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4200"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("devdock.toml"), "[server\nport = ").unwrap();

        devdock(&dir)
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse"));
    }
}

// =============================================================================
// Project Listing Tests
// =============================================================================

mod listing {
    use super::*;

    #[test]
    fn test_list_empty() {
        let dir = TempDir::new().unwrap();
        devdock(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No projects found"));
    }

    #[test]
    fn test_list_shows_stored_project() {
        let dir = TempDir::new().unwrap();
        write_projects(&dir, ONE_PROJECT);

        devdock(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("shop"))
            .stdout(predicate::str::contains("app:8000"))
            .stdout(predicate::str::contains("1 project(s)"));
    }

    #[test]
    fn test_list_json() {
        let dir = TempDir::new().unwrap();
        write_projects(&dir, ONE_PROJECT);

        let output = devdock(&dir).arg("list").arg("--json").output().unwrap();
        assert!(output.status.success());
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(value[0]["name"], "shop");
        assert_eq!(value[0]["ports"]["db"], 3306);
    }

    #[test]
    fn test_list_survives_corrupt_store() {
        let dir = TempDir::new().unwrap();
        write_projects(&dir, "{ not json");

        devdock(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No projects found"));
    }

    #[test]
    fn test_status_unknown_project_fails() {
        let dir = TempDir::new().unwrap();
        write_projects(&dir, ONE_PROJECT);

        devdock(&dir)
            .arg("status")
            .arg("missing")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Project 'missing' not found"));
    }
}
