use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::gradebook::GradePolicy;
use crate::progress::{ContentKind, UnlockPolicy};

/// Runtime settings, read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub directory_file: Option<PathBuf>,
    pub grade_policy: GradePolicy,
    pub completion_threshold: u32,
    pub max_write_retries: u32,
    /// 0 disables the background sweep.
    pub sweep_interval_secs: u64,
    pub timeout_grace_secs: i64,
    pub abandon_after_hours: Option<i64>,
    pub unlock_policy: UnlockPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            database_url: None,
            db_max_connections: 10,
            directory_file: None,
            grade_policy: GradePolicy::default(),
            completion_threshold: 90,
            max_write_retries: 5,
            sweep_interval_secs: 60,
            timeout_grace_secs: 30,
            abandon_after_hours: None,
            unlock_policy: UnlockPolicy::default(),
        }
    }
}

fn parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}: {e}")),
        _ => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Config::default();

        let mut grade_policy = d.grade_policy.clone();
        if let Some(v) = parsed("GRADE_PASSING_THRESHOLD")? {
            grade_policy.passing_threshold = v;
        }
        if let Some(v) = parsed("GRADE_AT_RISK_THRESHOLD")? {
            grade_policy.at_risk_threshold = v;
        }
        if grade_policy.at_risk_threshold > grade_policy.passing_threshold {
            bail!("GRADE_AT_RISK_THRESHOLD must not exceed GRADE_PASSING_THRESHOLD");
        }

        let completion_threshold = parsed("COMPLETION_THRESHOLD")?.unwrap_or(d.completion_threshold);
        if completion_threshold > 100 {
            bail!("COMPLETION_THRESHOLD must be between 0 and 100");
        }

        let unlock_policy = match env::var("REQUIRE_COMPLETION_FOR") {
            Ok(list) if !list.trim().is_empty() => {
                let kinds = list
                    .split(',')
                    .map(ContentKind::from_str)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(anyhow::Error::msg)
                    .context("REQUIRE_COMPLETION_FOR")?;
                UnlockPolicy::requiring(kinds)
            }
            _ => d.unlock_policy.clone(),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or(d.host),
            port: parsed("PORT")?.unwrap_or(d.port),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: parsed("DB_MAX_CONNECTIONS")?.unwrap_or(d.db_max_connections),
            directory_file: env::var("DIRECTORY_FILE").ok().map(PathBuf::from),
            grade_policy,
            completion_threshold,
            max_write_retries: parsed("MAX_WRITE_RETRIES")?.unwrap_or(d.max_write_retries).max(1),
            sweep_interval_secs: parsed("SWEEP_INTERVAL_SECS")?.unwrap_or(d.sweep_interval_secs),
            timeout_grace_secs: parsed("TIMEOUT_GRACE_SECS")?.unwrap_or(d.timeout_grace_secs),
            abandon_after_hours: parsed("ABANDON_AFTER_HOURS")?,
            unlock_policy,
        })
    }
}
