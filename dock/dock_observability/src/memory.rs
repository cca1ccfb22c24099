//! Process memory figures.

use std::io;

/// Reads resident memory against a budget.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    budget_bytes: Option<u64>,
}

impl MemoryProbe {
    /// Measure against `budget_bytes`, or the machine's total memory when `None`.
    pub fn new(budget_bytes: Option<u64>) -> Self {
        Self { budget_bytes }
    }

    /// Resident set size of this process.
    pub fn resident_bytes(&self) -> io::Result<u64> {
        resident_bytes()
    }

    /// Resident memory as a fraction of the budget, `0.0` when unknown.
    pub fn utilization(&self) -> f64 {
        let budget = match self.budget_bytes {
            Some(budget) => Ok(budget),
            None => total_memory_bytes(),
        };
        match (resident_bytes(), budget) {
            (Ok(used), Ok(budget)) if budget > 0 => used as f64 / budget as f64,
            _ => 0.0,
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kib_field(text: &str, field: &str) -> io::Result<u64> {
    let (_, tail) = text
        .split_once(field)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("missing {}", field)))?;
    let value = tail
        .split_whitespace()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed {}", field)))?;
    value
        .parse::<u64>()
        .map(|kib| kib * 1024)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

/// Resident set size of the current process.
pub fn resident_bytes() -> io::Result<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status")?;
        parse_kib_field(&status, "VmRSS:")
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "resident size unavailable"))
    }
}

/// Total physical memory of the machine.
pub fn total_memory_bytes() -> io::Result<u64> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        parse_kib_field(&meminfo, "MemTotal:")
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "total memory unavailable"))
    }
}
