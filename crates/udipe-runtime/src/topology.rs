//! Cache-size lookup capability
//!
//! The buffer pool sizes its datagram buffers from the CPU cache
//! hierarchy: each buffer should fit in L1, the whole pool in an even
//! share of L2. This module defines the capability the pool consumes and
//! a sysfs-backed implementation for Linux.
//!
//! A "share" is the cache capacity divided by the number of physical
//! cores attached to that cache, hyperthreads collapsed, so that a worker
//! pinned to one core never budgets for more than its fair slice.

use std::collections::BTreeSet;
use std::path::PathBuf;

use udipe_core::utrace;

/// Cache capacity lookups consumed by the buffer pool
pub trait CacheSizes: Send + Sync {
    /// Per-core share of the L1 data cache reachable from `cpu`
    fn l1_data_share(&self, cpu: usize) -> Option<usize>;

    /// Per-core share of the L2 cache reachable from `cpu`
    fn l2_share(&self, cpu: usize) -> Option<usize>;
}

/// Number of online CPUs
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Cache topology read from `/sys/devices/system/cpu`
pub struct SysfsTopology;

impl SysfsTopology {
    fn cache_dir(cpu: usize, index: usize) -> PathBuf {
        PathBuf::from(format!(
            "/sys/devices/system/cpu/cpu{}/cache/index{}",
            cpu, index
        ))
    }

    fn read_trimmed(path: PathBuf) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Share of the first data or unified cache at `level` seen by `cpu`
    fn cache_share(&self, cpu: usize, level: u32) -> Option<usize> {
        for index in 0..16 {
            let dir = Self::cache_dir(cpu, index);
            let Some(found_level) = Self::read_trimmed(dir.join("level")) else {
                break;
            };
            if found_level.parse::<u32>().ok() != Some(level) {
                continue;
            }
            let cache_type = Self::read_trimmed(dir.join("type"))?;
            if cache_type != "Data" && cache_type != "Unified" {
                continue;
            }
            let size = parse_size(&Self::read_trimmed(dir.join("size"))?)?;
            let sharers = Self::read_trimmed(dir.join("shared_cpu_list"))
                .map(|list| self.physical_cores(&parse_cpu_list(&list)))
                .unwrap_or(1)
                .max(1);
            utrace!(
                "cpu{} L{} cache: {} bytes across {} core(s)",
                cpu,
                level,
                size,
                sharers
            );
            return Some(size / sharers);
        }
        None
    }

    /// Count distinct physical cores in a CPU set (hyperthreads excluded)
    fn physical_cores(&self, cpus: &[usize]) -> usize {
        let mut cores = BTreeSet::new();
        for &cpu in cpus {
            let path = PathBuf::from(format!(
                "/sys/devices/system/cpu/cpu{}/topology/core_id",
                cpu
            ));
            match Self::read_trimmed(path).and_then(|s| s.parse::<i64>().ok()) {
                Some(core_id) => {
                    cores.insert(core_id);
                }
                // No topology info: count the CPU as its own core.
                None => {
                    cores.insert(-(cpu as i64) - 1);
                }
            }
        }
        cores.len().max(1)
    }
}

impl CacheSizes for SysfsTopology {
    fn l1_data_share(&self, cpu: usize) -> Option<usize> {
        self.cache_share(cpu, 1)
    }

    fn l2_share(&self, cpu: usize) -> Option<usize> {
        self.cache_share(cpu, 2)
    }
}

/// Parse a sysfs cache size like "32K", "1024K" or "8M"
fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.as_bytes().last()? {
        b'K' | b'k' => (&text[..text.len() - 1], 1024),
        b'M' | b'm' => (&text[..text.len() - 1], 1024 * 1024),
        b'G' | b'g' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok().map(|n| n * multiplier)
}

/// Parse a sysfs CPU list like "0-3,8,10-11"
fn parse_cpu_list(text: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("32K"), Some(32 * 1024));
        assert_eq!(parse_size("1024K"), Some(1024 * 1024));
        assert_eq!(parse_size("8M"), Some(8 * 1024 * 1024));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("junk"), None);
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-1,8,10-11"), vec![0, 1, 8, 10, 11]);
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
    }

    #[test]
    fn test_online_cpus_nonzero() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_sysfs_lookup_when_present() {
        // Only meaningful on hosts that expose cache info
        if !std::path::Path::new("/sys/devices/system/cpu/cpu0/cache/index0").exists() {
            return;
        }
        let topo = SysfsTopology;
        if let Some(l1) = topo.l1_data_share(0) {
            assert!(l1 >= 4 * 1024);
            assert!(l1 <= 1024 * 1024);
        }
        if let (Some(l1), Some(l2)) = (topo.l1_data_share(0), topo.l2_share(0)) {
            assert!(l2 >= l1);
        }
    }
}
