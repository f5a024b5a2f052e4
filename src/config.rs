use anyhow::Context;
use chrono::Duration;

pub const DEFAULT_SESSION: &str = "default";
pub const REPORT_FILE_NAME: &str = "Reporte_Notas.xlsx";

/// Knobs of a single pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Rows of the input table skipped before student data starts.
    pub header_rows: usize,
    pub risk_threshold: f64,
    pub replication_factor: usize,
    pub noise_std_dev: f64,
    pub test_fraction: f64,
    pub max_depth: usize,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            header_rows: 2,
            risk_threshold: 12.0,
            replication_factor: 5,
            noise_std_dev: 2.0,
            test_fraction: 0.2,
            max_depth: 3,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub report_ttl: Duration,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to reach the report store")?;
        let ttl_hours = match std::env::var("REPORT_TTL_HOURS") {
            Ok(raw) => parse_ttl_hours(&raw)?,
            Err(_) => 24,
        };

        Ok(Self {
            database_url,
            max_connections: 5,
            report_ttl: Duration::hours(ttl_hours),
        })
    }
}

fn parse_ttl_hours(raw: &str) -> anyhow::Result<i64> {
    let hours: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("REPORT_TTL_HOURS is not a whole number: {raw:?}"))?;
    anyhow::ensure!(hours > 0, "REPORT_TTL_HOURS must be positive, got {hours}");
    Ok(hours)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_report_contract() {
        let config = PipelineConfig::default();
        assert_eq!(config.header_rows, 2);
        assert_eq!(config.replication_factor, 5);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.seed, 42);
        assert!((config.test_fraction - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn ttl_hours_must_be_positive_integers() {
        assert_eq!(parse_ttl_hours(" 48 ").unwrap(), 48);
        assert!(parse_ttl_hours("0").is_err());
        assert!(parse_ttl_hours("a day").is_err());
    }
}
