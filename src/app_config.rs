//! File-backed defaults for the `harvester` binary.
//!
//! The config file is a flat list of `key = value` lines. Strings are
//! double-quoted, integers are bare, and `#` starts a comment outside quotes.
//! Every key is optional; command-line values take precedence.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

/// Defaults read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory acquired files are written to and relayed from.
    pub output_dir: Option<PathBuf>,
    /// Ledger database file.
    pub db_path: Option<PathBuf>,
    /// Acquisition concurrency (1..=100).
    pub concurrency: Option<u8>,
    /// Relay concurrency (1..=10).
    pub relay_concurrency: Option<u8>,
    /// Retries after the first attempt (0..=10).
    pub max_retries: Option<u8>,
    /// Listing API root.
    pub listing_base_url: Option<String>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP request timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Destination chat id for relay.
    pub chat_id: Option<String>,
}

impl FileConfig {
    /// Checks values against the ranges the command line enforces.
    pub fn validate(&self) -> Result<()> {
        validate_range("concurrency", self.concurrency, 1..=100)?;
        validate_range("relay_concurrency", self.relay_concurrency, 1..=10)?;
        validate_range("max_retries", self.max_retries, 0..=10)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1..=3600)?;

        if let Some(url) = self.listing_base_url.as_deref()
            && url::Url::parse(url).is_err()
        {
            bail!("Invalid config value for `listing_base_url`: '{url}' is not a URL");
        }
        if let Some(chat_id) = self.chat_id.as_deref()
            && chat_id.trim().is_empty()
        {
            bail!("Invalid config value for `chat_id`: must not be empty");
        }
        Ok(())
    }
}

fn validate_range<T>(field: &str, value: Option<T>, range: std::ops::RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("harvester")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist. Without one, the default location is used
/// when present and an empty config is returned otherwise.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        return load_file_config(path);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "db_path" => {
                cfg.db_path = Some(parse_string_literal(value).with_context(context)?.into());
            }
            "concurrency" => cfg.concurrency = Some(parse_integer_u8(value).with_context(context)?),
            "relay_concurrency" => {
                cfg.relay_concurrency = Some(parse_integer_u8(value).with_context(context)?);
            }
            "max_retries" => cfg.max_retries = Some(parse_integer_u8(value).with_context(context)?),
            "listing_base_url" => {
                cfg.listing_base_url = Some(parse_string_literal(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            // Chat ids are often negative numbers; accept them bare or quoted.
            "chat_id" => {
                let parsed = if value.starts_with('"') {
                    parse_string_literal(value).with_context(context)?
                } else {
                    value.parse::<i64>().with_context(context)?.to_string()
                };
                cfg.chat_id = Some(parsed);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    raw_value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Expected double-quoted string"))
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let value = parse_integer_u64(raw_value)?;
    u8::try_from(value).map_err(|_| anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    if token.starts_with('-') {
        bail!("Expected non-negative integer");
    }
    token
        .parse::<u64>()
        .map_err(|e| anyhow!("Expected integer value: {e}"))
}
