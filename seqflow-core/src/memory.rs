//! Memory budget available to a pipeline

use tracing::debug;

use crate::error::{Error, Result};

/// Default safety reserve kept free of pipeline data
pub const DEFAULT_RESERVE_BYTES: u64 = 512 * 1024 * 1024;

/// Free memory minus a safety reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Free memory in bytes
    pub total: u64,

    /// Bytes kept back for everything that is not pipeline data
    pub reserve: u64,
}

impl MemoryBudget {
    /// Budget from explicit figures
    pub fn new(total: u64, reserve: u64) -> Self {
        Self { total, reserve }
    }

    /// Budget without a reserve
    pub fn exact(bytes: u64) -> Self {
        Self::new(bytes, 0)
    }

    /// Budget from the memory currently available on this machine
    pub fn from_system(reserve: u64) -> Result<Self> {
        let total = available_system_memory()?;
        debug!(total, reserve, "detected available memory");
        Ok(Self::new(total, reserve))
    }

    /// Bytes the pipeline may use
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.reserve)
    }
}

#[cfg(target_os = "linux")]
fn available_system_memory() -> Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    parse_meminfo(&meminfo)
        .ok_or_else(|| Error::Configuration("Could not read available memory from /proc/meminfo".into()))
}

#[cfg(not(target_os = "linux"))]
fn available_system_memory() -> Result<u64> {
    Err(Error::Configuration(
        "Detecting available memory is only supported on Linux; use MemoryBudget::new".into(),
    ))
}

/// `MemAvailable` in bytes, falling back to `MemFree`
fn parse_meminfo(meminfo: &str) -> Option<u64> {
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            kib.checked_mul(1024)
        })
    };
    field("MemAvailable").or_else(|| field("MemFree"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_subtracts_reserve() {
        assert_eq!(MemoryBudget::new(1000, 300).available(), 700);
        assert_eq!(MemoryBudget::new(100, 300).available(), 0);
        assert_eq!(MemoryBudget::exact(2400).available(), 2400);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16318000 kB\nMemFree:          400000 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(8_000_000 * 1024));
        assert_eq!(parse_meminfo("MemFree: 2 kB\n"), Some(2048));
        assert_eq!(parse_meminfo("nothing here"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_from_system() {
        let budget = MemoryBudget::from_system(0).unwrap();
        assert!(budget.total > 0);
    }
}
