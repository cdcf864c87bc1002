//! Unit tests for the working copy.

use std::sync::Arc;

use super::*;
use crate::test_support::{CommandInvocation, ScriptedRunner};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Scratch {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("repo"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    Scratch { _tmp: tmp, root }
}

fn ssh_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 29418)
}

fn prepared(config: &mut Config, runner: &ScriptedRunner) -> WorkingCopy {
    prepare(config, &ssh_endpoint(), Arc::new(runner.clone()), Span::none())
        .unwrap_or_else(|err| panic!("prepare: {err}"))
}

#[test]
fn remote_url_uses_ssh_scheme() {
    assert_eq!(
        remote_url("admin", &ssh_endpoint(), "demo"),
        "ssh://admin@127.0.0.1:29418/demo"
    );
}

#[rstest]
fn explicit_root_is_not_owned(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        project: Some(String::from("demo")),
        ..Config::default()
    };
    config
        .git_config
        .insert(String::from("core.sshCommand"), String::from("ssh -i key"));
    let runner = ScriptedRunner::new();

    let copy = prepared(&mut config, &runner);

    assert!(!config.cleanup.owns(Resource::WorkingCopy));
    assert_eq!(copy.root(), scratch.root.as_path());
    let repo = Repository::open(&scratch.root).unwrap_or_else(|err| panic!("open: {err}"));
    let git_config = repo.config().unwrap_or_else(|err| panic!("config: {err}"));
    assert_eq!(git_config.get_string("user.name").ok().as_deref(), Some("admin"));
    assert_eq!(
        git_config.get_string("core.sshCommand").ok().as_deref(),
        Some("ssh -i key")
    );
    let remote = repo
        .find_remote("origin")
        .unwrap_or_else(|err| panic!("remote: {err}"));
    assert_eq!(remote.url(), Some("ssh://admin@127.0.0.1:29418/demo"));
    assert!(scratch.root.join(".git/hooks/commit-msg").exists());
}

#[rstest]
fn prepare_is_idempotent(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        project: Some(String::from("demo")),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();

    prepared(&mut config, &runner);
    config.project = Some(String::from("other"));
    prepared(&mut config, &runner);

    let repo = Repository::open(&scratch.root).unwrap_or_else(|err| panic!("open: {err}"));
    let remote = repo
        .find_remote("origin")
        .unwrap_or_else(|err| panic!("remote: {err}"));
    assert_eq!(remote.url(), Some("ssh://admin@127.0.0.1:29418/other"));
}

#[test]
fn missing_root_is_allocated_and_owned() {
    let mut config = Config::default();
    let runner = ScriptedRunner::new();

    let mut copy = prepared(&mut config, &runner);

    assert!(config.cleanup.owns(Resource::WorkingCopy));
    let root = config
        .repo_root
        .clone()
        .unwrap_or_else(|| panic!("root should be recorded"));
    assert!(root.as_str().contains("gerrit-fixture-"));
    copy.remove().unwrap_or_else(|err| panic!("remove: {err}"));
    assert!(!root.exists());
}

#[rstest]
fn commit_appends_change_id(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();
    let copy = prepared(&mut config, &runner);
    std::fs::write(scratch.root.join("README"), "hello\n")
        .unwrap_or_else(|err| panic!("write: {err}"));

    copy.add(&["README"]).unwrap_or_else(|err| panic!("add: {err}"));
    let oid = copy
        .commit("Add readme")
        .unwrap_or_else(|err| panic!("commit: {err}"));

    let repo = Repository::open(&scratch.root).unwrap_or_else(|err| panic!("open: {err}"));
    let commit = repo
        .find_commit(oid)
        .unwrap_or_else(|err| panic!("find commit: {err}"));
    let message = commit.message().unwrap_or_default();
    assert!(message.starts_with("Add readme\n\nChange-Id: I"), "message: {message}");
    assert!(has_change_id(message));
}

#[test]
fn existing_change_id_is_kept() {
    let message = "Fix\n\nChange-Id: I0123456789abcdef0123456789abcdef01234567";

    let rendered = with_change_id(message, Oid::zero(), None)
        .unwrap_or_else(|err| panic!("render: {err}"));

    assert_eq!(rendered, format!("{message}\n"));
}

#[rstest]
#[tokio::test]
async fn push_defaults_to_origin_and_review_ref(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();
    let copy = prepared(&mut config, &runner);

    copy.push(None, None)
        .await
        .unwrap_or_else(|err| panic!("push: {err}"));

    let last = runner.invocations().last().map(CommandInvocation::command_string);
    assert_eq!(
        last,
        Some(format!("git -C {} push origin HEAD:refs/for/master", scratch.root))
    );
}

const PATCH: &str = "diff --git a/README b/README\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/README\n\
@@ -0,0 +1 @@\n\
+hello\n";

#[rstest]
#[tokio::test]
async fn apply_diff_hands_the_patch_to_git_apply(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();
    let seen = Arc::new(std::sync::Mutex::new(None::<String>));
    let recorder = Arc::clone(&seen);
    runner.on_run(move |program, argv| {
        if program != "git" {
            return;
        }
        if let Some(path) = argv.last().and_then(|arg| arg.to_str()) {
            if let Ok(contents) = std::fs::read_to_string(path) {
                *recorder
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(contents);
            }
        }
    });
    let copy = prepared(&mut config, &runner);

    copy.apply_diff(PATCH.as_bytes())
        .await
        .unwrap_or_else(|err| panic!("apply: {err}"));

    let invocation = runner
        .invocations_of("git")
        .last()
        .cloned()
        .unwrap_or_else(|| panic!("git apply should run"));
    let patch_arg = invocation
        .args
        .last()
        .cloned()
        .unwrap_or_else(|| panic!("patch path argument"));
    assert!(
        invocation
            .command_string()
            .starts_with(&format!("git -C {} apply -v ", scratch.root)),
        "command: {}",
        invocation.command_string()
    );
    assert!(patch_arg.ends_with(".patch"), "patch path: {patch_arg}");
    let recorded = seen
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    assert_eq!(recorded.as_deref(), Some(PATCH));
    assert!(!std::path::Path::new(&patch_arg).exists(), "patch file should be removed");
}

#[rstest]
#[tokio::test]
async fn rejected_patch_reports_combined_output(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();
    let copy = prepared(&mut config, &runner);
    runner.push_output(
        Some(1),
        "Checking patch README...\n",
        "error: README: already exists in working directory\n",
    );

    let err = copy
        .apply_diff(PATCH.as_bytes())
        .await
        .expect_err("rejected patch should fail");

    assert_eq!(
        err,
        WorkingCopyError::Apply {
            root: scratch.root.clone(),
            output: String::from(
                "Checking patch README...\nerror: README: already exists in working directory"
            ),
        }
    );
}

#[rstest]
#[tokio::test]
async fn operations_after_remove_report_not_initialized(scratch: Scratch) {
    let mut config = Config {
        repo_root: Some(scratch.root.clone()),
        ..Config::default()
    };
    let runner = ScriptedRunner::new();
    let mut copy = prepared(&mut config, &runner);

    copy.remove().unwrap_or_else(|err| panic!("remove: {err}"));

    assert_eq!(copy.add(&["."]), Err(WorkingCopyError::NotInitialized));
    assert_eq!(
        copy.commit("nothing").map(|_| ()),
        Err(WorkingCopyError::NotInitialized)
    );
    assert_eq!(copy.push(None, None).await, Err(WorkingCopyError::NotInitialized));
    assert_eq!(
        copy.apply_diff(b"diff").await,
        Err(WorkingCopyError::NotInitialized)
    );
    assert_eq!(copy.remove(), Err(WorkingCopyError::NotInitialized));
    assert_eq!(copy.add_remote("origin", "ssh://x"), Err(WorkingCopyError::NotInitialized));
}
