use std::path::{Path, PathBuf};

use predicates::prelude::*;

const ENV_OVERRIDES: &[&str] = &[
    "BOOKREEL_DATA_DIR",
    "BOOKREEL_MAX_ATTEMPTS",
    "BOOKREEL_ITEM_DELAY_SECS",
    "BOOKREEL_YOUTUBE_API_KEY",
    "BOOKREEL_YOUTUBE_PLAYLIST_ID",
    "BOOKREEL_LOG_JSON",
];

fn bookreel(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bookreel");
    cmd.current_dir(dir);
    for name in ENV_OVERRIDES {
        cmd.env_remove(name);
    }
    cmd
}

/// Two shell stages: `search` runs `search_script`, `upload` prints the id.
fn write_config(dir: &Path, search_script: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("bookreel.yaml");
    let config = format!(
        r#"data_dir: {data:?}
item_delay_secs: 0
retry:
  max_attempts: 2
  base_delay_secs: 0
stages:
  - name: search
    command: sh
    args: ["-c", {search:?}]
    fatal_exit_code: 2
  - name: upload
    command: sh
    args: ["-c", "echo uploading >&2; echo vid-long"]
    produces: primary
"#,
        data = dir.join("data").display().to_string(),
        search = search_script,
    );
    std::fs::write(&path, config)?;
    Ok(path)
}

#[test]
fn plan_on_empty_ledger_processes_everything() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "true")?;
    let input = temp.path().join("items.yaml");
    std::fs::write(
        &input,
        "- title: Atomic Habits\n  author: James Clear\n- title: atomic habits\n- title: Deep Work\n",
    )?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("plan")
        .arg("--input")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("Atomic Habits (James Clear)"))
        .stdout(predicate::str::contains("duplicate of item #1"))
        .stdout(predicate::str::contains(
            "plan: 3 item(s): process 2, resume 0, skip 1",
        ));

    assert!(!temp.path().join("data").join("runs").exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn run_processes_then_skips_on_rerun() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "test -n \"$BOOKREEL_TITLE\"")?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "--item", "Deep Work", "--author", "Cal Newport"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "summary: 1 processed, 0 resumed, 0 failed, 0 skipped",
        ))
        .stdout(predicate::str::contains("primary vid-long"));

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deep Work"))
        .stdout(predicate::str::contains("done"))
        .stdout(predicate::str::contains("vid-long"));

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "--item", "deep work"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already done (vid-long)"))
        .stdout(predicate::str::contains("0 processed, 0 resumed, 0 failed, 1 skipped"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn fatal_exit_code_fails_the_batch() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "echo 'no sources' >&2; exit 2")?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "--item", "Obscure Pamphlet"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 failed"))
        .stdout(predicate::str::contains("stage search after 1 attempt(s)"))
        .stdout(predicate::str::contains("no sources"));
    Ok(())
}

#[test]
fn dry_run_prints_plan_without_running() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "exit 1")?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["run", "--item", "Range", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan: 1 item(s): process 1"))
        .stdout(predicate::str::contains("summary:").not());

    assert!(!temp.path().join("data").join("runs").exists());
    Ok(())
}

#[test]
fn reconcile_without_listing_config_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "true")?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("reconcile")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no listing source configured"));
    Ok(())
}

#[test]
fn status_for_unknown_run_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "true")?;

    bookreel(temp.path())
        .arg("--config")
        .arg(&config)
        .args(["status", "--run", "20200101_000000_deadbeef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load run 20200101_000000_deadbeef"));
    Ok(())
}

#[test]
fn invalid_config_is_reported() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    std::fs::write(temp.path().join("bookreel.yaml"), "stages: []\n")?;

    bookreel(temp.path())
        .args(["plan", "--item", "Range"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pipeline has no stages"));
    Ok(())
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let config = write_config(temp.path(), "true")?;

    bookreel(temp.path())
        .env("RUST_LOG", "debug")
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
