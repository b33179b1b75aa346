//! Runtime configuration for the scheduler and the block cache.
//!
//! Both configs start from compiled-in defaults and can be overridden from
//! a kernel command line made of whitespace separated `key=value` tokens.
//! Unknown keys belong to other subsystems and are skipped; malformed values
//! are reported and leave the default in place.
//!
//! ## Scheduler keys
//!
//! | key | meaning |
//! |-----|---------|
//! | `cores=<n>` | number of cores driven by the scheduler |
//! | `preempt_ticks=<n>` | timer ticks between round-robin rotations, 0 disables |
//! | `preempt_prio=<core>:<prio>` | priority level rotated on `core` |
//! | `worker_batch=<n>` | finalizations per worker pass, 0 means unbounded |
//! | `log=<level>` | maximum log level |
//!
//! ## Block cache keys
//!
//! `bcache.block=`, `bcache.entries=`, `bcache.level=`, `bcache.burst=`,
//! `bcache.type=savedata|generic`, `bcache.retries=`.

use alloc::vec::Vec;
use core::fmt;

use crate::fs::StorageType;
use crate::logger::{self, LogLevel};
use crate::scheduler::types::{LOWEST_THREAD_PRIORITY, HIGHEST_THREAD_PRIORITY, MAX_CORES};

pub const DEFAULT_NUM_CORES: usize = 4;
pub const DEFAULT_PREEMPTION_TICKS: u64 = 10;
/// Priority rotated by the timer on ordinary cores.
pub const DEFAULT_PREEMPTION_PRIORITY: i32 = 59;
/// The last core is reserved for background work and rotates the lowest level.
pub const DEFAULT_LAST_CORE_PREEMPTION_PRIORITY: i32 = LOWEST_THREAD_PRIORITY;

pub const DEFAULT_CACHE_BLOCK_SIZE: usize = 0x4000;
pub const DEFAULT_CACHE_ENTRIES: usize = 24;
pub const DEFAULT_ALLOCATION_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidCoreCount,
    InvalidPriority,
    InvalidBlockSize,
    InvalidEntryCount,
    InvalidRetryCount,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfigError::InvalidCoreCount => "core count must be between 1 and 64",
            ConfigError::InvalidPriority => "preemption priority out of range",
            ConfigError::InvalidBlockSize => "cache block size must be a non-zero power of two",
            ConfigError::InvalidEntryCount => "cache needs at least one entry",
            ConfigError::InvalidRetryCount => "allocation retries must be non-zero",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub num_cores: usize,
    pub preemption_ticks: u64,
    /// One entry per core.
    pub preemption_priorities: Vec<i32>,
    pub worker_batch: usize,
    pub log_level: Option<LogLevel>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::with_cores(DEFAULT_NUM_CORES)
    }
}

impl KernelConfig {
    pub fn with_cores(num_cores: usize) -> Self {
        let num_cores = clamp_cores(num_cores);
        Self {
            num_cores,
            preemption_ticks: DEFAULT_PREEMPTION_TICKS,
            preemption_priorities: default_preemption_priorities(num_cores),
            worker_batch: 0,
            log_level: None,
        }
    }

    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        config.apply_cmdline(cmdline);
        config
    }

    pub fn apply_cmdline(&mut self, cmdline: &str) {
        // Core count first so per-core overrides land in the right table.
        for arg in cmdline.split_whitespace() {
            if let Some(value) = arg.strip_prefix("cores=") {
                match value.parse::<usize>() {
                    Ok(n) => {
                        self.num_cores = clamp_cores(n);
                        self.preemption_priorities = default_preemption_priorities(self.num_cores);
                    }
                    Err(_) => crate::kwarn!("config: bad core count '{}'", value),
                }
            }
        }

        for arg in cmdline.split_whitespace() {
            if let Some(value) = arg.strip_prefix("preempt_ticks=") {
                match value.parse::<u64>() {
                    Ok(n) => self.preemption_ticks = n,
                    Err(_) => crate::kwarn!("config: bad preempt_ticks '{}'", value),
                }
            } else if let Some(value) = arg.strip_prefix("preempt_prio=") {
                let parsed = value
                    .split_once(':')
                    .and_then(|(core, prio)| Some((core.parse::<usize>().ok()?, prio.parse::<i32>().ok()?)));
                match parsed {
                    Some((core, prio)) if core < self.preemption_priorities.len() => {
                        self.preemption_priorities[core] = prio;
                    }
                    _ => crate::kwarn!("config: bad preempt_prio '{}'", value),
                }
            } else if let Some(value) = arg.strip_prefix("worker_batch=") {
                match value.parse::<usize>() {
                    Ok(n) => self.worker_batch = n,
                    Err(_) => crate::kwarn!("config: bad worker_batch '{}'", value),
                }
            }
        }

        if let Some(level) = logger::parse_level_directive(cmdline) {
            self.log_level = Some(level);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cores == 0 || self.num_cores > MAX_CORES {
            return Err(ConfigError::InvalidCoreCount);
        }
        if self.preemption_priorities.len() != self.num_cores {
            return Err(ConfigError::InvalidCoreCount);
        }
        if self
            .preemption_priorities
            .iter()
            .any(|&p| !(HIGHEST_THREAD_PRIORITY..=LOWEST_THREAD_PRIORITY).contains(&p))
        {
            return Err(ConfigError::InvalidPriority);
        }
        Ok(())
    }
}

fn clamp_cores(n: usize) -> usize {
    if cfg!(feature = "smp") {
        n.clamp(1, MAX_CORES)
    } else {
        1
    }
}

fn default_preemption_priorities(num_cores: usize) -> Vec<i32> {
    let mut priorities = alloc::vec![DEFAULT_PREEMPTION_PRIORITY; num_cores];
    if num_cores > 1 {
        priorities[num_cores - 1] = DEFAULT_LAST_CORE_PREEMPTION_PRIORITY;
    }
    priorities
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Verification block size; every cache entry is a multiple of it.
    pub block_size: usize,
    pub max_cache_entries: usize,
    /// Tier hint passed to the buffer manager with every allocation.
    pub buffer_level: i32,
    pub burst_mode: bool,
    pub storage_type: StorageType,
    pub allocation_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_CACHE_BLOCK_SIZE,
            max_cache_entries: DEFAULT_CACHE_ENTRIES,
            buffer_level: 0,
            burst_mode: false,
            storage_type: StorageType::SaveData,
            allocation_retries: DEFAULT_ALLOCATION_RETRIES,
        }
    }
}

impl CacheConfig {
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        config.apply_cmdline(cmdline);
        config
    }

    pub fn apply_cmdline(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            let Some(rest) = arg.strip_prefix("bcache.") else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                crate::kwarn!("config: bcache option without value '{}'", arg);
                continue;
            };
            let ok = match key {
                "block" => parse_size(value).map(|v| self.block_size = v).is_some(),
                "entries" => value.parse().map(|v| self.max_cache_entries = v).is_ok(),
                "level" => value.parse().map(|v| self.buffer_level = v).is_ok(),
                "burst" => parse_bool(value).map(|v| self.burst_mode = v).is_some(),
                "type" => StorageType::from_str(value).map(|v| self.storage_type = v).is_some(),
                "retries" => value.parse().map(|v| self.allocation_retries = v).is_ok(),
                _ => true,
            };
            if !ok {
                crate::kwarn!("config: bad value for bcache.{} '{}'", key, value);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.max_cache_entries == 0 {
            return Err(ConfigError::InvalidEntryCount);
        }
        if self.allocation_retries == 0 {
            return Err(ConfigError::InvalidRetryCount);
        }
        Ok(())
    }
}

/// Accepts plain bytes or a `k`/`m` suffix.
fn parse_size(value: &str) -> Option<usize> {
    let (digits, shift) = if let Some(v) = value.strip_suffix(['k', 'K']) {
        (v, 10)
    } else if let Some(v) = value.strip_suffix(['m', 'M']) {
        (v, 20)
    } else {
        (value, 0)
    };
    let n = if let Some(hex) = digits.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<usize>().ok()?
    };
    n.checked_mul(1usize << shift)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}
