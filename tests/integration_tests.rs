//! Integration tests for the stagewarden CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a stagewarden Command rooted in `dir`
fn stagewarden(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("stagewarden");
    cmd.current_dir(dir).env_remove("STAGEWARDEN_ROOT").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, content: &str) {
    let config_dir = dir.join(".stagewarden");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("stagewarden.toml"), content).unwrap();
}

/// Config whose agent command prints a ready report envelope for every stage.
#[cfg(unix)]
fn write_agent_config(dir: &Path, extra: &str) {
    let script = dir.join("agent.sh");
    fs::write(
        &script,
        "#!/bin/sh\ncat > /dev/null\n\
         echo '{\"artifact\":\"done by '\"$STAGEWARDEN_AGENT\"'\",\"usage\":{\"model\":\"test-model\",\"input_tokens\":3,\"output_tokens\":4},\"report\":{\"verdict\":\"ready\"}}'\n",
    )
    .unwrap();
    write_config(
        dir,
        &format!(
            "[invoker]\ncommand = \"sh\"\nargs = [\"{}\"]\n{}",
            script.display(),
            extra
        ),
    );
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run-all"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Project lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_init_creates_project_under_default_root() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path())
            .args(["init", "project-42"])
            .assert()
            .success()
            .stdout(predicate::str::contains("project-42"))
            .stdout(predicate::str::contains("intake"));

        let project_dir = dir.path().join(".stagewarden/projects/project-42");
        assert!(project_dir.join("state.json").exists());
        assert!(project_dir.join("transitions.jsonl").exists());
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-1"]).assert().success();
        stagewarden(dir.path())
            .args(["init", "project-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_init_rejects_traversal_id_without_writes() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path())
            .args(["init", "../../etc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid project id"));

        let root = dir.path().join(".stagewarden/projects");
        let entries = fs::read_dir(&root).map(|d| d.count()).unwrap_or(0);
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_root_flag_overrides_default() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("elsewhere");
        stagewarden(dir.path())
            .arg("--root")
            .arg(&root)
            .args(["init", "project-3"])
            .assert()
            .success();
        assert!(root.join("project-3/state.json").exists());
    }

    #[test]
    fn test_root_env_is_used() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("from-env");
        stagewarden(dir.path())
            .env("STAGEWARDEN_ROOT", &root)
            .args(["init", "project-4"])
            .assert()
            .success();
        assert!(root.join("project-4/state.json").exists());
    }

    #[test]
    fn test_status_json_reports_current_stage() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-5"]).assert().success();
        let output = stagewarden(dir.path())
            .args(["--json", "status", "project-5"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(state["id"], "project-5");
        assert_eq!(state["current_stage"], "intake");
        assert_eq!(state["status"], "pending");
    }

    #[test]
    fn test_status_of_unknown_project_fails() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path())
            .args(["status", "project-99"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_update_merges_metadata_and_logs_transition() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-6"]).assert().success();
        stagewarden(dir.path())
            .args(["update", "project-6", r#"{"owner": "ops", "labels": {"tier": 1}}"#])
            .assert()
            .success();
        stagewarden(dir.path())
            .args(["--json", "status", "project-6"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"owner\": \"ops\""));
        stagewarden(dir.path())
            .args(["transitions", "project-6", "--event", "state_updated"])
            .assert()
            .success()
            .stdout(predicate::str::contains("state_updated"));
    }

    #[test]
    fn test_update_rejects_non_object_patch() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-7"]).assert().success();
        stagewarden(dir.path())
            .args(["update", "project-7", "[1, 2]"])
            .assert()
            .failure();
    }

    #[test]
    fn test_recover_without_checkpoints_keeps_first_stage() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-8"]).assert().success();
        stagewarden(dir.path())
            .args(["recover", "project-8"])
            .assert()
            .success()
            .stdout(predicate::str::contains("resume from intake"));
    }

    #[test]
    fn test_transitions_rejects_unknown_event() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-9"]).assert().success();
        stagewarden(dir.path())
            .args(["transitions", "project-9", "--event", "teleported"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Circuit breaker and feedback commands
// =============================================================================

mod safety {
    use super::*;

    #[test]
    fn test_breaker_check_denies_past_ceiling_and_reset_clears() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "[limits]\nmax_comments_per_hour = 2\n");
        stagewarden(dir.path()).args(["init", "project-1"]).assert().success();

        for _ in 0..2 {
            stagewarden(dir.path())
                .args(["breaker", "check", "project-1", "comment"])
                .assert()
                .success()
                .stdout(predicate::str::contains("allowed"));
        }
        stagewarden(dir.path())
            .args(["breaker", "check", "project-1", "comment"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Max comments per hour (2) reached"));

        stagewarden(dir.path())
            .args(["breaker", "status", "project-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("TRIPPED"));

        stagewarden(dir.path())
            .args(["breaker", "reset", "project-1", "comment_rate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("status is now pending"));
        stagewarden(dir.path())
            .args(["breaker", "check", "project-1", "comment"])
            .assert()
            .success();
    }

    #[test]
    fn test_breaker_reset_rejects_unknown_ceiling() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-2"]).assert().success();
        stagewarden(dir.path())
            .args(["breaker", "reset", "project-2", "everything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown ceiling"));
    }

    #[test]
    fn test_feedback_status_of_fresh_project() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-3"]).assert().success();
        stagewarden(dir.path())
            .args(["feedback", "status", "project-3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("specify -> plan"))
            .stdout(predicate::str::contains("3 remaining"));
    }

    #[test]
    fn test_feedback_resolve_without_escalation_fails() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-4"]).assert().success();
        stagewarden(dir.path())
            .args(["feedback", "resolve", "project-4"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Task graph validation
// =============================================================================

mod graph {
    use super::*;

    #[test]
    fn test_clean_graph_passes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("graph.json");
        fs::write(
            &file,
            r#"{"tasks": [{"id": "a"}, {"id": "b", "depends_on": ["a"]}]}"#,
        )
        .unwrap();
        stagewarden(dir.path())
            .arg("validate-graph")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("No structural problems"));
    }

    #[test]
    fn test_cycle_and_missing_dependency_fail() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("graph.json");
        fs::write(
            &file,
            r#"{"tasks": [
                {"id": "root"},
                {"id": "a", "depends_on": ["root", "b"]},
                {"id": "b", "depends_on": ["a"]},
                {"id": "c", "depends_on": ["ghost"]}
            ]}"#,
        )
        .unwrap();
        stagewarden(dir.path())
            .arg("validate-graph")
            .arg(&file)
            .assert()
            .failure()
            .stdout(predicate::str::contains("circular dependency: a -> b -> a"))
            .stdout(predicate::str::contains("undeclared task 'ghost'"));
    }

    #[test]
    fn test_estimate_outliers_are_warnings_only() {
        let dir = TempDir::new().unwrap();
        write_config(
            dir.path(),
            "[feedback.estimates.benchmarks]\nbackend = 8.0\n",
        );
        let file = dir.path().join("report.json");
        fs::write(
            &file,
            r#"{"verdict": "ready", "task_graph": {"tasks": [
                {"id": "api", "estimate_hours": 40.0, "category": "backend"}
            ]}}"#,
        )
        .unwrap();
        stagewarden(dir.path())
            .arg("validate-graph")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("warning:"))
            .stdout(predicate::str::contains("'api'"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        assert!(dir.path().join(".stagewarden/stagewarden.toml").exists());

        stagewarden(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"))
            .stdout(predicate::str::contains("20 invocations"));

        stagewarden(dir.path())
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_unknown_stage_in_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "[stages.deploy]\nagent = \"x\"\n");
        stagewarden(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("stages.deploy"));
        stagewarden(dir.path())
            .args(["init", "project-1"])
            .assert()
            .failure();
    }

    #[test]
    fn test_config_show_prints_effective_values() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "[limits]\nmax_agent_invocations = 7\n");
        stagewarden(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_agent_invocations = 7"));
    }
}

// =============================================================================
// Dispatch through the process invoker
// =============================================================================

#[cfg(unix)]
mod dispatch {
    use super::*;

    #[test]
    fn test_run_without_invoker_command_fails() {
        let dir = TempDir::new().unwrap();
        stagewarden(dir.path()).args(["init", "project-1"]).assert().success();
        stagewarden(dir.path())
            .args(["run", "project-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No agent command configured"));
    }

    #[test]
    fn test_run_completes_current_stage_and_stores_artifact() {
        let dir = TempDir::new().unwrap();
        write_agent_config(dir.path(), "");
        stagewarden(dir.path()).args(["init", "project-2"]).assert().success();
        stagewarden(dir.path())
            .args(["run", "project-2"])
            .assert()
            .success()
            .stdout(predicate::str::contains("intake completed, next: specify"));

        let artifact = dir
            .path()
            .join(".stagewarden/projects/project-2/artifacts/intake.md");
        assert_eq!(fs::read_to_string(artifact).unwrap(), "done by triage");

        stagewarden(dir.path())
            .args(["checkpoints", "project-2"])
            .assert()
            .success()
            .stdout(predicate::str::contains("chk-"));
    }

    #[test]
    fn test_run_all_completes_pipeline_and_reports_usage() {
        let dir = TempDir::new().unwrap();
        write_agent_config(dir.path(), "[limits]\nmax_agent_invocations = 30\n");
        stagewarden(dir.path())
            .args(["run-all", "project-3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pipeline finished"))
            .stdout(predicate::str::contains("project-3: completed"));

        stagewarden(dir.path())
            .args(["usage", "project-3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("test-model"));
    }

    #[test]
    fn test_run_all_stops_at_invocation_ceiling() {
        let dir = TempDir::new().unwrap();
        write_agent_config(dir.path(), "[limits]\nmax_agent_invocations = 2\n");
        stagewarden(dir.path())
            .args(["run-all", "project-4"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Max agent invocations (2) reached"));

        let output = stagewarden(dir.path())
            .args(["--json", "status", "project-4"])
            .output()
            .unwrap();
        let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(state["status"], "escalated");
        assert_eq!(state["agent_invocations"], 2);
    }

    #[test]
    fn test_failing_agent_leaves_dead_letters() {
        let dir = TempDir::new().unwrap();
        write_config(
            dir.path(),
            "[invoker]\ncommand = \"sh\"\nargs = [\"-c\", \"cat > /dev/null; echo 'model overloaded' >&2; exit 1\"]\n",
        );
        stagewarden(dir.path()).args(["init", "project-5"]).assert().success();
        stagewarden(dir.path())
            .args(["run", "project-5"])
            .assert()
            .success()
            .stdout(predicate::str::contains("2 retries remaining"));

        stagewarden(dir.path())
            .args(["dead-letters", "project-5", "--stage", "intake"])
            .assert()
            .success()
            .stdout(predicate::str::contains("model overloaded"));
        stagewarden(dir.path())
            .args(["dead-letters", "project-5", "--stats"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Dead letters: 1"));
    }

    #[test]
    fn test_run_rejects_context_file_outside_root() {
        let dir = TempDir::new().unwrap();
        write_agent_config(dir.path(), "");
        stagewarden(dir.path()).args(["init", "project-6"]).assert().success();
        stagewarden(dir.path())
            .args(["run", "project-6", "--context", "/etc/hosts"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("escapes project data root"));
    }
}
