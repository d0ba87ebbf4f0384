use tracing::trace;

/// Top-level configuration, constructed once at process start and passed
/// into the supervision loop and sinks. No hidden global state.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Logical "from" label; falls back to the local hostname
    pub hostname: Option<String>,

    pub influxdb_v1: Option<InfluxV1Config>,

    /// Preferred over `influxdb_v1` when both are present
    pub influxdb_v2: Option<InfluxV2Config>,

    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InfluxV1Config {
    pub addr: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InfluxV2Config {
    pub addr: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TargetConfig {
    pub host: String,

    /// Logical "to" label, defaults to the host address
    pub name: Option<String>,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on one probe session; 0 disables the deadline
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    1
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
