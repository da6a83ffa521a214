use clap::Parser;
use respawn::config::RespawnConfig;
use respawn::{
    CancelReason, CrashDetection, ExecScope, LaunchError, ProcessOutput, ResultError, Supervisor,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Run a command under supervision: capture its output, relaunch it when it
/// crashes, and give up at a deadline.
#[derive(Parser, Debug)]
#[command(name = "respawn", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "respawn.toml")]
    config: PathBuf,

    /// Max crash relaunches (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Backoff base unit in milliseconds (overrides config)
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Overall deadline in seconds across all launches, 0 = none (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Which terminations count as crashes (overrides config)
    #[arg(long, value_enum)]
    crash_detection: Option<CrashDetection>,

    /// Extra environment variable for the child, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Print a JSON report instead of the raw output
    #[arg(long)]
    json: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (launches, backoff, signal relay)
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Program to run followed by its arguments (overrides config)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

#[derive(Serialize)]
struct Report<'a> {
    command: &'a str,
    args: &'a [String],
    success: bool,
    retries: u32,
    exit_code: i32,
    error: Option<String>,
    #[serde(flatten)]
    output: &'a ProcessOutput,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    if cfg.process.command.is_empty() {
        tracing::error!("no command given on the command line or in the config file");
        return ExitCode::from(2);
    }

    if cli.dry_run {
        println!("{cfg:#?}");
        return ExitCode::SUCCESS;
    }

    let scope = match cfg.deadline.timeout_secs {
        0 => ExecScope::new(),
        secs => ExecScope::with_timeout(Duration::from_secs(secs)),
    };

    let mut sup = build_supervisor(&cfg, scope.clone());
    let trap = tokio::spawn(respawn::signals::trap_and_relay(scope.clone(), sup.handle()));

    let result = sup.run().await;
    scope.cancel();
    match trap.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "signal handling was unavailable"),
        Err(e) => tracing::warn!(error = %e, "signal task failed"),
        Ok(Ok(())) => {}
    }

    let code = exit_code(&result);
    let (output, error) = match &result {
        Ok(output) => (output, None),
        Err(e) => (e.output(), Some(e)),
    };

    if let Some(e) = error {
        tracing::error!(error = %e, retries = sup.retry_count(), "supervised process failed");
    }

    if cli.json {
        let report = Report {
            command: &cfg.process.command,
            args: &cfg.process.args,
            success: result.is_ok(),
            retries: sup.retry_count(),
            exit_code: code,
            error: error.map(ToString::to_string),
            output,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "failed to serialize report"),
        }
    } else {
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
    }

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "respawn=debug"
    } else if cli.quiet {
        "respawn=warn"
    } else {
        "respawn=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Config file first, then CLI overrides on top.
fn load_config(cli: &Cli) -> Result<RespawnConfig, respawn::config::ConfigError> {
    let mut cfg = RespawnConfig::load(&cli.config)?;

    if let Some((command, args)) = cli.command.split_first() {
        cfg.process.command = command.clone();
        cfg.process.args = args.to_vec();
    }
    if let Some(retries) = cli.retries {
        cfg.retry.limit = retries;
    }
    if let Some(delay) = cli.retry_delay_ms {
        cfg.retry.base_delay_ms = delay;
    }
    if let Some(timeout) = cli.timeout {
        cfg.deadline.timeout_secs = timeout;
    }
    if let Some(detection) = cli.crash_detection {
        cfg.retry.crash_detection = detection;
    }
    cfg.apply_env_assignments(cli.env.iter().map(String::as_str))?;

    Ok(cfg)
}

/// Shell-style exit code for the supervised run.
fn exit_code(result: &Result<ProcessOutput, ResultError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(ResultError::Exited { termination, .. } | ResultError::Crashed { termination, .. }) => {
            termination.shell_code()
        }
        Err(ResultError::Cancelled { reason, .. }) => match reason {
            CancelReason::DeadlineExceeded => 124,
            CancelReason::Cancelled => 130,
        },
        Err(ResultError::Launch { source, .. }) => match source {
            LaunchError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                127
            }
            LaunchError::Spawn { .. } => 126,
            LaunchError::Cancelled { .. } => 130,
            LaunchError::Pipe { .. } => 1,
        },
        Err(ResultError::Wait { .. }) => 1,
    }
}

fn build_supervisor(cfg: &RespawnConfig, scope: ExecScope) -> Supervisor {
    let mut sup = Supervisor::new(
        scope,
        cfg.retry.limit,
        cfg.process.command.clone(),
        cfg.process.args.clone(),
    );
    sup.set_retry_base_delay_ms(cfg.retry.base_delay_ms);
    sup.set_crash_detection(cfg.retry.crash_detection);
    if let Some(env) = &cfg.process.env {
        sup.set_env(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    sup
}
