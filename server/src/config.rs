//! Embedder-facing server configuration.
//!
//! Loaded from TOML; every field except the listen address has a default.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

/// Server configuration loaded from a TOML file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    pub address: SocketAddr,

    /// Server name; also prefixes worker thread names and connection names.
    #[serde(default = "default_name")]
    pub name: String,

    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Enable `SO_REUSEPORT` on the listener.
    #[serde(default)]
    pub reuse_port: bool,

    /// Output-buffer threshold for the high-water callback
    /// (e.g. "64MB", "512KB", or a byte count).
    #[serde(
        default = "default_high_water_mark",
        deserialize_with = "deserialize_size"
    )]
    pub high_water_mark: usize,
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker loops (default: number of CPUs). Zero serves every
    /// connection on the base loop.
    pub threads: Option<usize>,
}

fn default_name() -> String {
    "server".to_string()
}

fn default_high_water_mark() -> usize {
    64 * 1024 * 1024
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.name.is_empty() {
            return Err("name must not be empty".into());
        }
        if self.high_water_mark == 0 {
            return Err("high_water_mark must be positive".into());
        }
        Ok(())
    }

    /// Number of worker loops to spawn.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }
}

/// Deserialize a size string like "64MB" or a plain byte count.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "4GB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}
