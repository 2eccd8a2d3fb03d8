use std::str::FromStr;
use serde::Deserialize;

/// Where checkpoints are kept.
///
/// - `Sqlite`: durable, survives restarts (default).
/// - `Memory`: lives as long as the process; runs cannot be resumed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    #[default]
    Sqlite,
    Memory,
}

impl FromStr for StoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StoreMode::Sqlite),
            "memory" => Ok(StoreMode::Memory),
            other => Err(format!(
                "invalid store mode: {other} (expected \"sqlite\" or \"memory\")"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_mode_case_insensitively() {
        assert_eq!("SQLite".parse::<StoreMode>(), Ok(StoreMode::Sqlite));
        assert_eq!(" memory ".parse::<StoreMode>(), Ok(StoreMode::Memory));
        assert!("redis".parse::<StoreMode>().is_err());
    }
}
