use assert_cmd::Command;
use predicates::prelude::*;

fn warden() -> Command {
    Command::cargo_bin("warden").unwrap()
}

#[test]
fn version_prints_package_version() {
    warden()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn help_lists_subcommands() {
    warden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create-user"))
        .stdout(predicate::str::contains("forgot-password"))
        .stdout(predicate::str::contains("purge-tokens"));
}

#[test]
fn set_enabled_requires_flag_value() {
    warden()
        .args(["set-enabled", "--email", "a@example.com"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--enabled"));
}

#[test]
fn create_user_requires_email() {
    warden()
        .arg("create-user")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--email"));
}
