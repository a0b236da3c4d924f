use crate::server::service::EngineConfig;
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;
use vaultops_core::{Backoff, RecoveryPolicy, RetryPolicy};

/// Runtime configuration for the `vaultops-server` binary.
///
/// Every setting can be given as a flag or through the environment (a `.env`
/// file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vaultops-server",
    version,
    about = "Runs queued privileged-access vault operations under per-target session limits"
)]
pub struct CliArgs {
    /// Size of the global executor pool: the most attempts running at once
    /// across all targets. Per-target session limits apply on top of this.
    ///
    /// Defaults to the number of logical CPUs.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Attempts an operation gets before it fails with "retries exhausted".
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on every further retry.
    ///
    /// Environment variable: `BACKOFF_BASE_MS`
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 1_000)]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay.
    ///
    /// Environment variable: `BACKOFF_MAX_MS`
    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    /// Disable jitter on retry delays.
    ///
    /// Environment variable: `BACKOFF_NO_JITTER`
    #[arg(long, env = "BACKOFF_NO_JITTER", default_value_t = false)]
    pub backoff_no_jitter: bool,

    /// An attempt running longer than this is abandoned as a transient
    /// failure.
    ///
    /// Environment variable: `ATTEMPT_TIMEOUT_SECS`
    #[arg(long, env = "ATTEMPT_TIMEOUT_SECS", default_value_t = 30)]
    pub attempt_timeout_secs: u64,

    /// How often the dispatcher runs a pass when nothing wakes it sooner.
    ///
    /// Environment variable: `DISPATCH_INTERVAL_MS`
    #[arg(long, env = "DISPATCH_INTERVAL_MS", default_value_t = 250)]
    pub dispatch_interval_ms: u64,

    /// Candidates fetched from the store per dispatch round.
    ///
    /// Environment variable: `DISPATCH_BATCH_SIZE`
    #[arg(long, env = "DISPATCH_BATCH_SIZE", default_value_t = 64)]
    pub dispatch_batch_size: usize,

    /// Seconds to let running attempts finish on shutdown before abandoning
    /// them. Abandoned attempts are recovered on the next start.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// SQLite database file. Without it the engine keeps its state in memory
    /// and nothing survives a restart.
    ///
    /// Environment variable: `DATABASE_PATH`
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// JSON file of targets to register on start (skipped when a target of
    /// the same name already exists).
    ///
    /// Environment variable: `TARGETS_FILE`
    #[arg(long, env = "TARGETS_FILE")]
    pub targets_file: Option<PathBuf>,

    /// JSON file of operations to submit on start.
    ///
    /// Environment variable: `SUBMIT_FILE`
    #[arg(long, env = "SUBMIT_FILE")]
    pub submit_file: Option<PathBuf>,

    /// What to do with operations left `running` by a previous process:
    /// `requeue` or `retain`.
    ///
    /// Environment variable: `RECOVERY_POLICY`
    #[arg(long, env = "RECOVERY_POLICY", default_value = "requeue")]
    pub recovery_policy: String,

    /// Service token sent to every vault alongside the per-attempt session
    /// token.
    ///
    /// Environment variable: `VAULT_API_TOKEN`
    #[arg(long, env = "VAULT_API_TOKEN", hide_env_values = true)]
    pub vault_api_token: Option<String>,

    /// Exit once no operation is pending, running or retrying.
    ///
    /// Environment variable: `EXIT_WHEN_IDLE`
    #[arg(long, env = "EXIT_WHEN_IDLE", default_value_t = false)]
    pub exit_when_idle: bool,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    pub database_path: Option<PathBuf>,
    pub targets_file: Option<PathBuf>,
    pub submit_file: Option<PathBuf>,
    pub vault_api_token: Option<String>,
    pub exit_when_idle: bool,
}

impl core::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("engine", &self.engine)
            .field("database_path", &self.database_path)
            .field("targets_file", &self.targets_file)
            .field("submit_file", &self.submit_file)
            .field(
                "vault_api_token",
                &self.vault_api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("exit_when_idle", &self.exit_when_idle)
            .finish()
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let num_workers = args.num_workers.unwrap_or_else(num_cpus::get);
        if num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be greater than 0");
        }

        if args.backoff_base_ms > args.backoff_max_ms {
            bail!(
                "BACKOFF_BASE_MS ({}) exceeds BACKOFF_MAX_MS ({})",
                args.backoff_base_ms,
                args.backoff_max_ms
            );
        }

        if args.attempt_timeout_secs == 0 {
            bail!("ATTEMPT_TIMEOUT_SECS must be greater than 0");
        }

        if args.dispatch_interval_ms == 0 {
            bail!("DISPATCH_INTERVAL_MS must be greater than 0");
        }

        if args.dispatch_batch_size == 0 {
            bail!("DISPATCH_BATCH_SIZE must be greater than 0");
        }

        let recovery: RecoveryPolicy = args
            .recovery_policy
            .parse()
            .context("invalid RECOVERY_POLICY")?;

        let mut backoff = Backoff::new(args.backoff_base_ms, args.backoff_max_ms);
        if args.backoff_no_jitter {
            backoff = backoff.without_jitter();
        }

        Ok(Self {
            engine: EngineConfig {
                num_workers,
                retry: RetryPolicy::new(args.max_attempts, backoff),
                attempt_timeout: Duration::from_secs(args.attempt_timeout_secs),
                dispatch_interval: Duration::from_millis(args.dispatch_interval_ms),
                dispatch_batch_size: args.dispatch_batch_size,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
                recovery,
            },
            database_path: args.database_path,
            targets_file: args.targets_file,
            submit_file: args.submit_file,
            vault_api_token: args.vault_api_token.filter(|t| !t.is_empty()),
            exit_when_idle: args.exit_when_idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["vaultops-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&["--num-workers", "4"]).unwrap();
        assert_eq!(config.engine.num_workers, 4);
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.backoff, Backoff::default());
        assert_eq!(config.engine.attempt_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.recovery, RecoveryPolicy::Requeue);
        assert!(config.database_path.is_none());
        assert!(!config.exit_when_idle);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = parse(&["--num-workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("NUM_WORKERS"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = parse(&["--num-workers", "1", "--max-attempts", "0"]).unwrap_err();
        assert!(err.to_string().contains("MAX_ATTEMPTS"));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let err = parse(&[
            "--num-workers",
            "1",
            "--backoff-base-ms",
            "5000",
            "--backoff-max-ms",
            "100",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BACKOFF_BASE_MS"));
    }

    #[test]
    fn parses_recovery_policy_and_jitter() {
        let config = parse(&[
            "--num-workers",
            "1",
            "--recovery-policy",
            "retain",
            "--backoff-no-jitter",
        ])
        .unwrap();
        assert_eq!(config.engine.recovery, RecoveryPolicy::Retain);
        assert!(!config.engine.retry.backoff.jitter);

        assert!(parse(&["--num-workers", "1", "--recovery-policy", "drop"]).is_err());
    }

    #[test]
    fn debug_output_hides_the_api_token() {
        let config = parse(&["--num-workers", "1", "--vault-api-token", "s3cr3t"]).unwrap();
        assert_eq!(config.vault_api_token.as_deref(), Some("s3cr3t"));
        assert!(!format!("{config:?}").contains("s3cr3t"));
    }
}
