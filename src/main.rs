//! Binary entry point for the gerrit-fixture CLI.

use std::future::pending;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use gerrit_fixture::{
    Config, ConfigError, Descriptor, DescriptorError, FixtureConfig, Instance, Orchestrator,
    SshError, TeardownError,
};

mod cli;

use cli::{Cli, Command, StartCommand, StopCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("start failed: {0}")]
    Start(String),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("failed to close ssh session: {0}")]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Start(args) => start(&args).await,
        Command::Stop(args) => stop(&args).await,
    }
}

async fn start(args: &StartCommand) -> Result<(), CliError> {
    let mut config = FixtureConfig::load_without_cli_args()?.as_config()?;
    apply_overrides(&mut config, args)?;
    let orchestrator = Orchestrator::docker(&config.tools);

    let interrupted = async {
        if signal::ctrl_c().await.is_err() {
            pending::<()>().await;
        }
    };
    match orchestrator.create_with_cancel(config, interrupted).await {
        Ok(mut instance) => deliver(&mut instance, args.json.as_deref(), args.no_cleanup).await,
        Err(failure) => {
            let (error, mut instance) = failure.into_parts();
            Err(abandon(&mut instance, error.to_string(), args.no_cleanup).await)
        }
    }
}

/// Hands a ready instance over through its descriptor. An instance whose
/// descriptor cannot be written is torn down like a failed start.
async fn deliver(
    instance: &mut Instance,
    json: Option<&Path>,
    no_cleanup: bool,
) -> Result<(), CliError> {
    if let Err(err) = emit_descriptor(instance, json) {
        return Err(abandon(instance, err.to_string(), no_cleanup).await);
    }
    instance.close_session().await?;
    Ok(())
}

fn emit_descriptor(instance: &Instance, json: Option<&Path>) -> Result<(), CliError> {
    let descriptor = Descriptor::from_instance(instance);
    match json {
        Some(path) => descriptor.save(&utf8_path(path)?)?,
        None => {
            writeln!(io::stdout(), "{}", descriptor.to_json()?).ok();
        }
    }
    Ok(())
}

async fn abandon(instance: &mut Instance, message: String, no_cleanup: bool) -> CliError {
    if no_cleanup {
        warn!(stage = %instance.stage(), "leaving partial instance in place");
        return CliError::Start(message);
    }
    match instance.destroy().await {
        Ok(()) => CliError::Start(message),
        Err(teardown) => CliError::Start(append_teardown_note(message, &teardown)),
    }
}

async fn stop(args: &StopCommand) -> Result<(), CliError> {
    let path = utf8_path(&args.json)?;
    let descriptor = Descriptor::load(&path)?;
    let orchestrator = Orchestrator::docker(&descriptor.config.tools);
    let mut instance = orchestrator.rehydrate(descriptor).await?;
    instance.destroy().await?;
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &StartCommand) -> Result<(), CliError> {
    if let Some(image) = &args.image {
        config.image.clone_from(image);
    }
    if let Some(port) = args.port_http {
        config.port_http = port;
    }
    if let Some(port) = args.port_ssh {
        config.port_ssh = port;
    }
    if let Some(seconds) = args.timeout {
        config.timeout_secs = seconds;
    }
    config.password.clone_from(&args.password);
    config.project.clone_from(&args.project);
    config.private_key_path = args.private_key.as_deref().map(utf8_path).transpose()?;
    config.repo_root = args.repo_root.as_deref().map(utf8_path).transpose()?;
    config.container_only = args.start_only;
    Ok(())
}

fn utf8_path(path: &Path) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(PathBuf::from(path))
        .map_err(|original| CliError::NonUtf8Path(original.display().to_string()))
}

fn append_teardown_note(message: String, teardown: &TeardownError) -> String {
    format!("{message} (teardown also failed: {teardown})")
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use gerrit_fixture::test_support::{ScriptedDriver, ScriptedRunner, fake_keygen};
    use gerrit_fixture::{Endpoint, Resource, TeardownFailure};
    use tempfile::TempDir;

    async fn ready_instance(driver: &ScriptedDriver) -> Instance {
        let runner = ScriptedRunner::new();
        fake_keygen(&runner);
        let orchestrator = Orchestrator::new(Arc::new(driver.clone()), Arc::new(runner));
        let config = Config {
            container_only: true,
            ..Config::default()
        };
        orchestrator
            .create(config)
            .await
            .unwrap_or_else(|failure| panic!("create: {}", failure.error))
    }

    /// A descriptor path whose parent is a regular file cannot be written,
    /// whoever runs the test.
    fn unwritable_descriptor(tmp: &TempDir) -> PathBuf {
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap_or_else(|err| panic!("seed blocker: {err}"));
        blocker.join("instance.json")
    }

    fn start_args() -> StartCommand {
        StartCommand {
            image: None,
            port_http: None,
            port_ssh: None,
            timeout: None,
            password: None,
            private_key: None,
            project: None,
            repo_root: None,
            start_only: false,
            no_cleanup: false,
            json: None,
        }
    }

    #[test]
    fn overrides_replace_layered_defaults() {
        let mut config = Config::default();
        let args = StartCommand {
            image: Some(String::from("gerrit:3.9")),
            port_http: Some(8080),
            timeout: Some(30),
            password: Some(String::from("secret")),
            private_key: Some(PathBuf::from("/keys/id_rsa")),
            project: Some(String::from("demo")),
            start_only: true,
            ..start_args()
        };

        apply_overrides(&mut config, &args).unwrap_or_else(|err| panic!("overrides: {err}"));

        assert_eq!(config.image, "gerrit:3.9");
        assert_eq!(config.port_http, 8080);
        assert_eq!(config.port_ssh, 0);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(
            config.private_key_path.as_deref().map(camino::Utf8Path::as_str),
            Some("/keys/id_rsa")
        );
        assert_eq!(config.project.as_deref(), Some("demo"));
        assert!(config.container_only);
    }

    #[test]
    fn absent_flags_keep_defaults() {
        let mut config = Config::default();
        let before = config.clone();

        apply_overrides(&mut config, &start_args())
            .unwrap_or_else(|err| panic!("overrides: {err}"));

        assert_eq!(config, before);
    }

    #[test]
    fn teardown_note_is_appended() {
        let teardown = TeardownError {
            failures: vec![TeardownFailure {
                resource: Resource::Container,
                message: String::from("docker exited with 1"),
            }],
        };

        let rendered = append_teardown_note(String::from("ssh setup failed"), &teardown);

        assert_eq!(
            rendered,
            "ssh setup failed (teardown also failed: teardown failed: container: docker exited with 1)"
        );
    }

    #[tokio::test]
    async fn descriptor_write_failure_tears_the_instance_down() {
        let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
        let mut instance = ready_instance(&driver).await;
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let json = unwritable_descriptor(&tmp);

        let result = deliver(&mut instance, Some(&json), false).await;

        let message = match result {
            Err(CliError::Start(message)) => message,
            other => panic!("expected start failure, got {other:?}"),
        };
        assert!(message.contains("descriptor error"), "message: {message}");
        assert_eq!(driver.terminations(), 1);
        assert_eq!(instance.config().cleanup.owned().count(), 0);
    }

    #[tokio::test]
    async fn descriptor_write_failure_honours_no_cleanup() {
        let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
        let mut instance = ready_instance(&driver).await;
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let json = unwritable_descriptor(&tmp);

        let result = deliver(&mut instance, Some(&json), true).await;

        assert!(matches!(result, Err(CliError::Start(_))), "unexpected: {result:?}");
        assert_eq!(driver.terminations(), 0);
        assert!(instance.config().cleanup.owns(Resource::Container));
        instance
            .destroy()
            .await
            .unwrap_or_else(|err| panic!("destroy: {err}"));
    }

    #[tokio::test]
    async fn delivered_descriptor_is_written() {
        let driver = ScriptedDriver::new(Endpoint::new("127.0.0.1", 41000));
        let mut instance = ready_instance(&driver).await;
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let json = tmp.path().join("state/instance.json");

        deliver(&mut instance, Some(&json), false)
            .await
            .unwrap_or_else(|err| panic!("deliver: {err}"));

        assert!(json.exists());
        assert_eq!(driver.terminations(), 0);
        instance
            .destroy()
            .await
            .unwrap_or_else(|err| panic!("destroy: {err}"));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Start(String::from("Response code 400 != 201")));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "start failed: Response code 400 != 201\n");
    }
}
