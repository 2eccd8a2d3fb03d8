// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, StepflowError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = StepflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine(cfg)?;
    validate_loop(cfg)?;
    validate_store(cfg)?;
    Ok(())
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    let engine = &cfg.engine;
    if engine.max_steps == 0 {
        return Err(StepflowError::Configuration(
            "[engine].max_steps must be >= 1 (got 0)".to_string(),
        ));
    }
    if engine.branch_timeout_ms == 0 {
        return Err(StepflowError::Configuration(
            "[engine].branch_timeout_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if engine.fanout_timeout_ms < engine.branch_timeout_ms {
        return Err(StepflowError::Configuration(format!(
            "[engine].fanout_timeout_ms ({}) must not be shorter than branch_timeout_ms ({})",
            engine.fanout_timeout_ms, engine.branch_timeout_ms
        )));
    }
    Ok(())
}

fn validate_loop(cfg: &RawConfigFile) -> Result<()> {
    if cfg.loops.max_attempts == 0 {
        return Err(StepflowError::Configuration(
            "[loop].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_store(cfg: &RawConfigFile) -> Result<()> {
    if cfg.store.path.as_os_str().is_empty() {
        return Err(StepflowError::Configuration(
            "[store].path must not be empty".to_string(),
        ));
    }
    Ok(())
}
