use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

const INVENTORY: &str = r#"
node:
  - { name: monitor1.example.com, hostname: monitor1, os: linux, chef_environment: production, roles: [monitoring] }
  - { name: web1.example.com, hostname: web1, os: linux, chef_environment: production, roles: [webserver] }
users:
  - { id: alice, groups: [sysadmin], htpasswd: "$apr1$alice" }
role:
  - { name: monitoring }
  - { name: webserver }
"#;

fn command(inventory: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("nagios-provision").expect("binary builds");
    cmd.env_clear()
        .env("NAGIOS_INVENTORY_FILE", inventory)
        .env("NAGIOS_NODE_NAME", "monitor1.example.com")
        .env("NAGIOS_NODE_HOSTNAME", "monitor1")
        .env("NAGIOS_ENVIRONMENT", "production")
        .env("NAGIOS_AUTH_METHOD", "htpasswd")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn render_writes_configuration_to_output_dir() {
    let temp = tempdir().expect("temp dir");
    let inventory = temp.path().join("inventory.yaml");
    fs::write(&inventory, INVENTORY).expect("write inventory");
    let output = temp.path().join("out");

    command(&inventory)
        .arg("render")
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts.cfg"));

    let hosts = fs::read_to_string(output.join("hosts.cfg")).expect("hosts.cfg rendered");
    assert!(hosts.contains("web1"));
    let credentials = fs::read_to_string(output.join("htpasswd.users")).expect("htpasswd rendered");
    assert_eq!(credentials, "alice:$apr1$alice\n");
}

#[test]
fn inventory_prints_aggregation_json() {
    let temp = tempdir().expect("temp dir");
    let inventory = temp.path().join("inventory.yaml");
    fs::write(&inventory, INVENTORY).expect("write inventory");

    command(&inventory)
        .arg("inventory")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"service_hosts\""))
        .stdout(predicate::str::contains("\"webserver\""));
}

#[test]
fn missing_inventory_source_fails() {
    Command::cargo_bin("nagios-provision")
        .expect("binary builds")
        .env_clear()
        .env("NAGIOS_NODE_NAME", "monitor1")
        .arg("inventory")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MissingInventorySource"));
}
