//! Startup configuration resolved from arguments and the environment.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{ArgAction, Args};
use miette::Result;

use hourglass_objstore::{DEFAULT_REGION, ObjectStoreConfig};
use hourglass_scheduler::{RetryPolicy, WorkflowDefinition};

/// Parse boolean from environment variable, accepting common truthy values.
pub fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Parse an RFC 3339 instant into UTC.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 instant '{}': {}", s, e))
}

/// Object store endpoint and credentials.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Object store endpoint (host:port or URL)
    #[arg(long, env = "HOURGLASS_ENDPOINT", default_value = "minio:9000")]
    pub endpoint: String,

    /// Access key
    #[arg(long, env = "HOURGLASS_ACCESS_KEY", hide_env_values = true)]
    pub access_key: String,

    /// Secret key
    #[arg(long, env = "HOURGLASS_SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// Signing region
    #[arg(long, env = "HOURGLASS_REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    /// Use HTTPS when the endpoint has no scheme
    #[arg(long, env = "HOURGLASS_SECURE", value_parser = parse_bool_env, default_value = "false")]
    pub secure: bool,
}

impl StoreArgs {
    pub fn to_config(&self) -> ObjectStoreConfig {
        ObjectStoreConfig::new(&self.endpoint, &self.access_key, &self.secret_key)
            .with_region(&self.region)
            .with_secure(self.secure)
    }
}

/// Workflow definition and run state location.
#[derive(Debug, Clone, Args)]
pub struct WorkflowArgs {
    /// Workflow identifier runs are recorded under
    #[arg(long, env = "HOURGLASS_WORKFLOW", default_value = "okx_extract")]
    pub workflow: String,

    /// First slot of the schedule (RFC 3339)
    #[arg(long, env = "HOURGLASS_START", value_parser = parse_instant, default_value = "2025-11-10T00:00:00Z")]
    pub start: DateTime<Utc>,

    /// Slot interval in seconds
    #[arg(long, env = "HOURGLASS_INTERVAL_SECS", default_value = "3600")]
    pub interval_secs: u64,

    /// Backfill every missed slot instead of only the newest
    #[arg(long, env = "HOURGLASS_CATCHUP", value_parser = parse_bool_env, default_value = "false")]
    pub catchup: bool,

    /// Hold a slot until its predecessor has succeeded
    #[arg(long, env = "HOURGLASS_DEPENDS_ON_PAST", value_parser = parse_bool_env, default_value = "true", action = ArgAction::Set)]
    pub depends_on_past: bool,

    /// Maximum number of simultaneously running slots
    #[arg(long, env = "HOURGLASS_MAX_ACTIVE_RUNS", default_value = "3")]
    pub max_active_runs: usize,

    /// Retries of the extract task after the first attempt
    #[arg(long, env = "HOURGLASS_RETRIES", default_value = "1")]
    pub retries: u32,

    /// Delay between extract attempts in seconds
    #[arg(long, env = "HOURGLASS_RETRY_DELAY_SECS", default_value = "300")]
    pub retry_delay_secs: u64,

    /// Destination bucket
    #[arg(long, env = "HOURGLASS_CONTAINER", default_value = "okx")]
    pub container: String,

    /// JSON document stored for every slot
    #[arg(long, env = "HOURGLASS_DATA", default_value = "data.json")]
    pub data: PathBuf,

    /// Run state file (defaults to the platform data directory)
    #[arg(long, env = "HOURGLASS_STATE")]
    pub state: Option<PathBuf>,
}

impl WorkflowArgs {
    /// Build and validate the workflow definition.
    pub fn definition(&self) -> Result<WorkflowDefinition> {
        let interval = i64::try_from(self.interval_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| miette::miette!("interval of {}s is out of range", self.interval_secs))?;

        let definition =
            WorkflowDefinition::new(&self.workflow, &self.container, self.start, interval)
                .with_catchup(self.catchup)
                .with_depends_on_past(self.depends_on_past)
                .with_max_active_runs(self.max_active_runs)
                .with_retry(RetryPolicy::new(
                    self.retries.saturating_add(1),
                    Duration::from_secs(self.retry_delay_secs),
                ));

        definition
            .validate()
            .map_err(|e| miette::miette!("{}", e))?;
        Ok(definition)
    }

    /// Where run state is persisted.
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state {
            return Ok(path.clone());
        }
        let dir = dirs::data_dir()
            .ok_or_else(|| miette::miette!("no data directory on this platform; pass --state"))?;
        Ok(dir.join("hourglass").join(format!("{}.runs.json", self.workflow)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        workflow: WorkflowArgs,
    }

    fn parse(args: &[&str]) -> WorkflowArgs {
        let mut argv = vec!["hourglass"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().workflow
    }

    #[test]
    fn parse_bool_env_values() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env("off"), Ok(false));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn parse_instant_normalises_to_utc() {
        assert_eq!(
            parse_instant("2025-11-14T08:00:00+03:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 11, 14, 5, 0, 0).unwrap()
        );
        assert!(parse_instant("2025-11-14").is_err());
    }

    #[test]
    fn defaults_match_hourly_extract() {
        let args = parse(&["--state", "/tmp/runs.json"]);
        let definition = args.definition().unwrap();
        let reference = WorkflowDefinition::hourly_extract("okx_extract", args.start);

        assert_eq!(definition.interval, reference.interval);
        assert_eq!(definition.catchup, reference.catchup);
        assert_eq!(definition.depends_on_past, reference.depends_on_past);
        assert_eq!(definition.max_active_runs, reference.max_active_runs);
        assert_eq!(definition.retry, reference.retry);
        assert_eq!(definition.container, reference.container);
        assert_eq!(definition.layout, reference.layout);
    }

    #[test]
    fn depends_on_past_can_be_disabled() {
        let args = parse(&["--depends-on-past", "false", "--catchup"]);
        let definition = args.definition().unwrap();
        assert!(!definition.depends_on_past);
        assert!(definition.catchup);
    }

    #[test]
    fn invalid_definition_is_reported() {
        let args = parse(&["--max-active-runs", "0"]);
        let err = args.definition().unwrap_err();
        assert!(err.to_string().contains("max_active_runs"));
    }

    #[test]
    fn explicit_state_path_wins() {
        let args = parse(&["--state", "/var/lib/hourglass/runs.json"]);
        assert_eq!(
            args.state_path().unwrap(),
            PathBuf::from("/var/lib/hourglass/runs.json")
        );
    }
}
