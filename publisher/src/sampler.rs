use crate::telemetry::{round2, ReadingValue};
use clap::ValueEnum;
use std::collections::BTreeMap;
use sysinfo::System;

/// Which host sub-metrics system devices report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SystemSelection {
    Cpu,
    Ram,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub ram_percent: f64,
}

impl HostSample {
    pub fn value(&self, selection: SystemSelection) -> ReadingValue {
        match selection {
            SystemSelection::Cpu => ReadingValue::Scalar(self.cpu_percent),
            SystemSelection::Ram => ReadingValue::Scalar(self.ram_percent),
            SystemSelection::Both => {
                let mut parts = BTreeMap::new();
                parts.insert("cpu_percent".to_string(), self.cpu_percent);
                parts.insert("ram_percent".to_string(), self.ram_percent);
                ReadingValue::Composite(parts)
            }
        }
    }
}

pub trait HostSampler: Send {
    fn sample(&mut self) -> HostSample;
}

/// Samples the local host. CPU usage is measured since the previous sample,
/// so the first reading after construction needs a short warm-up.
pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu_percent = self.sys.global_cpu_info().cpu_usage() as f64;
        let total = self.sys.total_memory();
        let ram_percent = if total > 0 {
            self.sys.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        HostSample {
            cpu_percent: round2(cpu_percent),
            ram_percent: round2(ram_percent),
        }
    }
}
