//! Runtime configuration for the core, loaded from `crushdb.conf`'s
//! `key=value` text format (spec.md §6). Unknown keys are ignored; keys the
//! core recognizes but does not itself interpret (TLS, log rotation) are
//! parsed and carried through for the external collaborator that owns them.

use std::io::BufRead;

use crate::error::{CoreError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,
    pub cache_memory_limit_mb: Option<u64>,
    pub cache_max_pages: Option<usize>,
    pub eager_load_pages: bool,
    pub tombstone_gc_ms: Option<u64>,
    pub wal_enabled: bool,
    pub auto_compress_on_insert: bool,

    pub tls_enabled: bool,
    pub ca_cert_path: Option<String>,
    pub custom_ca_cert_path: Option<String>,

    pub log_level: String,
    pub log_max_files: Option<u32>,
    pub log_retention_days: Option<u32>,
    pub log_max_size_mb: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_memory_limit_mb: Some(64),
            cache_max_pages: None,
            eager_load_pages: false,
            tombstone_gc_ms: None,
            wal_enabled: true,
            auto_compress_on_insert: false,
            tls_enabled: false,
            ca_cert_path: None,
            custom_ca_cert_path: None,
            log_level: "info".to_string(),
            log_max_files: None,
            log_retention_days: None,
            log_max_size_mb: None,
        }
    }
}

impl Config {
    /// Parses the `key=value` text format of `crushdb.conf`.
    ///
    /// Blank lines and lines starting with `#` are skipped. Unknown keys are
    /// ignored per spec.md §6.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut config = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| CoreError::Config(format!("line {}: {e}", lineno + 1)))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CoreError::Config(format!(
                    "line {}: expected key=value, got {line:?}",
                    lineno + 1
                )));
            };
            config.apply(key.trim(), value.trim())?;
        }
        config.validate()
    }

    pub fn from_str(text: &str) -> Result<Self> {
        Self::from_reader(text.as_bytes())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "page_size" => self.page_size = parse_usize(key, value)?,
            "cache_memory_limit_mb" => self.cache_memory_limit_mb = Some(parse_u64(key, value)?),
            "cache_max_pages" => self.cache_max_pages = Some(parse_usize(key, value)?),
            "eager_load_pages" => self.eager_load_pages = parse_bool(key, value)?,
            "tombstone_gc" => self.tombstone_gc_ms = Some(parse_u64(key, value)?),
            "wal_enabled" => self.wal_enabled = parse_bool(key, value)?,
            "auto_compress_on_insert" => self.auto_compress_on_insert = parse_bool(key, value)?,
            "tls_enabled" => self.tls_enabled = parse_bool(key, value)?,
            "ca_cert_path" => self.ca_cert_path = Some(value.to_string()),
            "custom_ca_cert_path" => self.custom_ca_cert_path = Some(value.to_string()),
            "log_level" => self.log_level = value.to_string(),
            "log_max_files" => self.log_max_files = Some(parse_u32(key, value)?),
            "log_retention_days" => self.log_retention_days = Some(parse_u32(key, value)?),
            "log_max_size_mb" => self.log_max_size_mb = Some(parse_u64(key, value)?),
            _ => { /* unknown keys are ignored */ }
        }
        Ok(())
    }

    fn validate(self) -> Result<Self> {
        if self.page_size != DEFAULT_PAGE_SIZE {
            return Err(CoreError::Config(format!(
                "page_size {} is not supported; only {DEFAULT_PAGE_SIZE} is validated",
                self.page_size
            )));
        }
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CoreError::Config(format!("{key}: invalid bool {value:?}"))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| CoreError::Config(format!("{key}: invalid integer {value:?}")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| CoreError::Config(format!("{key}: invalid integer {value:?}")))
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| CoreError::Config(format!("{key}: invalid integer {value:?}")))
}
