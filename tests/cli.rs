//! CLI integration tests for sprintgate admin commands.
//!
//! Each test uses an isolated temp directory for the database, so tests
//! can run in parallel.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;
use sprintgate::auth::ApiKeyGenerator;
use sprintgate::store::{SqliteStore, Store};

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("sprintgate").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd
    }

    fn admin(&self, subcommand: &str, args: &[&str]) -> assert_cmd::assert::Assert {
        let data_dir = self.data_dir_str();
        self.cmd()
            .args(["admin", subcommand, "--data-dir", &data_dir])
            .args(args)
            .assert()
    }

    fn init(&self) -> assert_cmd::assert::Assert {
        self.admin("init", &[])
    }

    fn create_user(&self, email: &str) -> assert_cmd::assert::Assert {
        self.admin("create-user", &["--email", email, "--password", "hunter22"])
    }

    fn open_store(&self) -> SqliteStore {
        SqliteStore::new(self.data_dir().join("sprintgate.db")).expect("failed to open store")
    }
}

#[test]
fn test_init_creates_database() {
    let ctx = TestContext::new();

    ctx.init()
        .success()
        .stdout(predicate::str::contains("Initialized database at"));

    ctx.temp_dir
        .child("sprintgate.db")
        .assert(predicate::path::exists());
}

#[test]
fn test_init_twice_fails() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.init()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn test_commands_require_init() {
    let ctx = TestContext::new();

    ctx.create_user("alice@example.com")
        .failure()
        .stderr(predicate::str::contains("Server not initialized"));

    ctx.admin("create-team", &["--name", "core", "--owner", "alice@example.com"])
        .failure()
        .stderr(predicate::str::contains("Server not initialized"));
}

#[test]
fn test_create_user() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.create_user("Alice@Example.com")
        .success()
        .stdout(predicate::str::contains("Created user"))
        .stdout(predicate::str::contains("alice@example.com"));

    let user = ctx
        .open_store()
        .get_user_by_email("alice@example.com")
        .unwrap()
        .expect("user should exist");
    assert_eq!(user.email, "alice@example.com");
}

#[test]
fn test_create_user_rejects_duplicates_and_weak_passwords() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.create_user("alice@example.com").success();

    ctx.create_user("alice@example.com")
        .failure()
        .stderr(predicate::str::contains("failed to create user"));

    ctx.admin(
        "create-user",
        &["--email", "bob@example.com", "--password", "short"],
    )
    .failure();
}

#[test]
fn test_team_and_project_setup() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.create_user("owner@example.com").success();
    ctx.create_user("dev@example.com").success();

    ctx.admin(
        "create-team",
        &["--name", "core", "--owner", "owner@example.com"],
    )
    .success()
    .stdout(predicate::str::contains("Created team 1 (core)"));

    ctx.admin(
        "add-team-member",
        &["--team-id", "1", "--email", "dev@example.com"],
    )
    .success()
    .stdout(predicate::str::contains("Added dev@example.com to team 1"));

    ctx.admin(
        "create-project",
        &[
            "--name",
            "alpha",
            "--team-id",
            "1",
            "--owner",
            "owner@example.com",
        ],
    )
    .success()
    .stdout(predicate::str::contains("Created project 1 (alpha)"));

    let store = ctx.open_store();
    let dev = store.get_user_by_email("dev@example.com").unwrap().unwrap();
    assert!(store.is_active_team_member(1, dev.id).unwrap());

    let project = store.get_project(1).unwrap().expect("project should exist");
    assert_eq!(project.name, "alpha");
    assert_eq!(store.list_project_members(project.id).unwrap().len(), 0);
}

#[test]
fn test_unknown_owner_fails() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.admin(
        "create-team",
        &["--name", "core", "--owner", "ghost@example.com"],
    )
    .failure()
    .stderr(predicate::str::contains("no user with email"));
}

#[test]
fn test_issue_key_prints_key_once() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.create_user("alice@example.com").success();

    let output = ctx
        .admin(
            "issue-key",
            &[
                "--email",
                "alice@example.com",
                "--name",
                "ci",
                "--expires-in",
                "30",
            ],
        )
        .success()
        .stdout(predicate::str::contains("it won't be shown again"))
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    let raw = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.len() == 44)
        .expect("key line should be printed");

    let store = ctx.open_store();
    let owner = store
        .find_user_by_credential_digest(&ApiKeyGenerator::new().digest(raw))
        .unwrap()
        .expect("key should resolve to its owner");
    assert_eq!(owner.user.email, "alice@example.com");
    assert!(owner.credential.expires_at.is_some());
}

#[test]
fn test_issue_key_rejects_bad_expiry() {
    let ctx = TestContext::new();
    ctx.init().success();
    ctx.create_user("alice@example.com").success();

    ctx.admin(
        "issue-key",
        &[
            "--email",
            "alice@example.com",
            "--name",
            "ci",
            "--expires-in",
            "400",
        ],
    )
    .failure();

    let store = ctx.open_store();
    let user = store.get_user_by_email("alice@example.com").unwrap().unwrap();
    assert!(store.list_user_credentials(user.id).unwrap().is_empty());
}
