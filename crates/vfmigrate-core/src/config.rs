use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use vfmigrate_parser::DEFAULT_TEST_KEYWORDS;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub chunk_size: usize,
    pub skip_limit: usize,
    pub workers: usize,
    pub commit_timeout_secs: u64,
    pub chunk_retry_attempts: u32,
    pub progress_every: usize,
    pub go_live_date: NaiveDate,
    pub min_duration_secs: i64,
    pub test_keywords: Vec<String>,
    pub accepted_extensions: Vec<String>,
    pub case_reference_max_len: usize,
    pub case_reference_min_len: usize,
    pub strict_case_reference: bool,
    pub allow_unknown_court: bool,
    pub cache_namespace: String,
    pub dry_run: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            skip_limit: 10,
            workers: 4,
            commit_timeout_secs: 30,
            chunk_retry_attempts: 3,
            progress_every: 100,
            go_live_date: NaiveDate::from_ymd_opt(2019, 5, 23).unwrap_or_default(),
            min_duration_secs: 10,
            test_keywords: DEFAULT_TEST_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            accepted_extensions: vec!["mp4".to_string()],
            case_reference_max_len: 24,
            case_reference_min_len: 9,
            strict_case_reference: false,
            allow_unknown_court: false,
            cache_namespace: "vf:".to_string(),
            dry_run: false,
        }
    }
}

impl MigrationConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: MigrationConfig =
            toml::from_str(content).map_err(|err| PipelineError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        if self.chunk_retry_attempts == 0 {
            return Err(PipelineError::Config(
                "chunk_retry_attempts must be at least 1".into(),
            ));
        }
        if self.case_reference_min_len > self.case_reference_max_len {
            return Err(PipelineError::Config(format!(
                "case_reference_min_len ({}) exceeds case_reference_max_len ({})",
                self.case_reference_min_len, self.case_reference_max_len
            )));
        }
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }
}
