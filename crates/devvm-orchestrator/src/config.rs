//! Runtime settings, resolved from the environment (and `.env` via the binary).

use std::path::PathBuf;

use devvm_common::{DevVmError, Result};

use crate::constants::{DEFAULT_BASE_PORT, DEFAULT_CPUS, DEFAULT_MEMORY, DEFAULT_NAME_PREFIX};
use crate::image::parse_size_string;

const APP_DIR: &str = "devvm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevVmConfig {
    /// Where working copies live.
    pub cache_dir: PathBuf,
    pub name_prefix: String,
    pub base_port: u16,
    /// Guest memory, as the emulator understands it (`2G`).
    pub memory: String,
    pub cpus: u32,
    /// Grow working copies to this size, if set.
    pub image_size: Option<String>,
}

impl DevVmConfig {
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            base_port: DEFAULT_BASE_PORT,
            memory: DEFAULT_MEMORY.to_string(),
            cpus: DEFAULT_CPUS,
            image_size: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = match lookup("DEVVM_CACHE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_cache_dir(&lookup).ok_or_else(|| {
                DevVmError::Config(
                    "cannot determine a cache directory; set DEVVM_CACHE_DIR".to_string(),
                )
            })?,
        };

        let mut config = Self::with_cache_dir(cache_dir);

        if let Some(prefix) = lookup("DEVVM_NAME_PREFIX") {
            if prefix.is_empty() || prefix.chars().any(|c| c.is_ascii_digit()) {
                return Err(DevVmError::Config(format!(
                    "DEVVM_NAME_PREFIX must be non-empty and contain no digits: {prefix:?}"
                )));
            }
            config.name_prefix = prefix;
        }
        if let Some(port) = lookup("DEVVM_BASE_PORT") {
            config.base_port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| invalid_setting("DEVVM_BASE_PORT", &port))?;
        }
        if let Some(memory) = lookup("DEVVM_MEMORY") {
            parse_size_string(&memory).map_err(|_| invalid_setting("DEVVM_MEMORY", &memory))?;
            config.memory = memory;
        }
        if let Some(cpus) = lookup("DEVVM_CPUS") {
            config.cpus = cpus
                .parse::<u32>()
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| invalid_setting("DEVVM_CPUS", &cpus))?;
        }
        if let Some(size) = lookup("DEVVM_IMAGE_SIZE").filter(|s| !s.is_empty()) {
            parse_size_string(&size).map_err(|_| invalid_setting("DEVVM_IMAGE_SIZE", &size))?;
            config.image_size = Some(size);
        }
        Ok(config)
    }
}

fn invalid_setting(key: &str, value: &str) -> DevVmError {
    DevVmError::Config(format!("invalid {key}: {value:?}"))
}

fn default_cache_dir<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if cfg!(target_os = "windows") {
        return lookup("LOCALAPPDATA").map(|p| PathBuf::from(p).join(APP_DIR).join("cache"));
    }
    if cfg!(target_os = "macos") {
        return lookup("HOME").map(|h| PathBuf::from(h).join("Library/Caches").join(APP_DIR));
    }
    if let Some(xdg) = lookup("XDG_CACHE_HOME").filter(|x| !x.is_empty()) {
        return Some(PathBuf::from(xdg).join(APP_DIR));
    }
    lookup("HOME").map(|h| PathBuf::from(h).join(".cache").join(APP_DIR))
}
