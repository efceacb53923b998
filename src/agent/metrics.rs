use std::process::Command;

use log::debug;
use sysinfo::{Disks, System};

use crate::error::DocSweepError;
use crate::relay::protocol::{CpuMetrics, MetricsSnapshot, SystemMetrics, UsageMetrics, UNKNOWN};

/// Something that can produce a metrics report for this host
pub trait MetricsSource: Send {
    fn collect(&mut self) -> MetricsSnapshot;
}

/// OS-specific heuristics that are allowed to fail
pub trait PlatformProbe: Send {
    fn device_class(&self) -> Result<String, DocSweepError>;
    fn logged_in_user(&self) -> Result<String, DocSweepError>;
}

/// Probe backed by the host's own tools (`query user`, `who`, DMI, CIM)
#[derive(Debug, Default)]
pub struct HostProbe;

impl PlatformProbe for HostProbe {
    fn device_class(&self) -> Result<String, DocSweepError> {
        let code = if cfg!(windows) {
            let output = run_tool(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "(Get-CimInstance Win32_SystemEnclosure).ChassisTypes",
                ],
            )?;
            first_number(&output)
        } else if cfg!(target_os = "macos") {
            let model = run_tool("sysctl", &["-n", "hw.model"])?;
            return Ok(if model.contains("Book") { "Laptop" } else { "Desktop" }.to_string());
        } else {
            let raw = std::fs::read_to_string("/sys/class/dmi/id/chassis_type")?;
            first_number(&raw)
        };

        code.map(|c| chassis_class(c).to_string())
            .ok_or_else(|| DocSweepError::Error("no chassis type reported".to_string()))
    }

    fn logged_in_user(&self) -> Result<String, DocSweepError> {
        let user = if cfg!(windows) {
            parse_query_user(&run_tool("query", &["user"])?)
        } else {
            parse_who(&run_tool("who", &[])?)
        };
        user.ok_or_else(|| DocSweepError::Error("no interactive session".to_string()))
    }
}

fn run_tool(program: &str, args: &[&str]) -> Result<String, DocSweepError> {
    let output = Command::new(program).args(args).output()?;
    // `query user` exits non-zero when nobody is logged on but still prints
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if stdout.trim().is_empty() {
        return Err(DocSweepError::Error(format!("{} produced no output", program)));
    }
    Ok(stdout)
}

fn first_number(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse().ok())
}

/// SMBIOS chassis type code to a coarse device class
pub fn chassis_class(code: u32) -> &'static str {
    match code {
        8 | 9 | 10 | 14 | 31 | 32 => "Laptop",
        30 => "Tablet",
        3 | 4 | 5 | 6 | 7 | 15 | 16 | 35 | 36 => "Desktop",
        13 => "All-in-One",
        17 | 23 | 28 => "Server",
        _ => UNKNOWN,
    }
}

/// First user of Windows `query user` output (header line skipped, `>` marks the current session)
pub fn parse_query_user(output: &str) -> Option<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|user| user.trim_start_matches('>').to_string())
        .find(|user| !user.is_empty())
}

/// First user of `who` output
pub fn parse_who(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .next()
}

/// sysinfo-backed collector. Keeps one `System` so CPU usage is measured
/// between consecutive collections.
pub struct SystemMetricsCollector<P: PlatformProbe> {
    system: System,
    probe: P,
}

impl SystemMetricsCollector<HostProbe> {
    pub fn for_host() -> Self {
        Self::new(HostProbe)
    }
}

impl<P: PlatformProbe> SystemMetricsCollector<P> {
    pub fn new(probe: P) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        SystemMetricsCollector { system, probe }
    }

    fn degrade(label: &str, result: Result<String, DocSweepError>) -> String {
        match result {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            Ok(_) => UNKNOWN.to_string(),
            Err(e) => {
                debug!("{} detection failed: {}", label, e);
                UNKNOWN.to_string()
            }
        }
    }

    fn disk_usage() -> UsageMetrics {
        let disks = Disks::new_with_refreshed_list();
        let system_root = if cfg!(windows) { "C:\\" } else { "/" };

        let (total, available) = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point().to_string_lossy().eq_ignore_ascii_case(system_root))
            .map(|disk| (disk.total_space(), disk.available_space()))
            .unwrap_or_else(|| {
                disks.list().iter().fold((0, 0), |(t, a), disk| {
                    (t + disk.total_space(), a + disk.available_space())
                })
            });

        UsageMetrics::new(total, total.saturating_sub(available))
    }
}

impl<P: PlatformProbe> MetricsSource for SystemMetricsCollector<P> {
    fn collect(&mut self) -> MetricsSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu = CpuMetrics {
            model: cpus
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .filter(|brand| !brand.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            cores: System::physical_core_count().unwrap_or(cpus.len()),
            threads: cpus.len(),
            percent: self.system.global_cpu_usage(),
        };

        let memory = UsageMetrics::new(self.system.total_memory(), self.system.used_memory());

        let system = SystemMetrics {
            device_class: Self::degrade("Device class", self.probe.device_class()),
            boot_time: System::boot_time(),
            uptime: System::uptime(),
            os_version: System::long_os_version().unwrap_or_else(|| UNKNOWN.to_string()),
            logged_in_user: Self::degrade("Logged-in user", self.probe.logged_in_user()),
        };

        MetricsSnapshot {
            cpu,
            memory,
            disk: Self::disk_usage(),
            system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenProbe;

    impl PlatformProbe for BrokenProbe {
        fn device_class(&self) -> Result<String, DocSweepError> {
            Err(DocSweepError::Error("no WMI here".to_string()))
        }
        fn logged_in_user(&self) -> Result<String, DocSweepError> {
            Ok("   ".to_string())
        }
    }

    struct FixedProbe;

    impl PlatformProbe for FixedProbe {
        fn device_class(&self) -> Result<String, DocSweepError> {
            Ok("Laptop".to_string())
        }
        fn logged_in_user(&self) -> Result<String, DocSweepError> {
            Ok("jdupont".to_string())
        }
    }

    #[test]
    fn test_probe_failures_degrade_to_unknown() {
        let mut collector = SystemMetricsCollector::new(BrokenProbe);
        let snapshot = collector.collect();
        assert_eq!(snapshot.system.device_class, UNKNOWN);
        assert_eq!(snapshot.system.logged_in_user, UNKNOWN);
        assert!(snapshot.cpu.threads >= 1);
    }

    #[test]
    fn test_probe_values_are_reported() {
        let mut collector = SystemMetricsCollector::new(FixedProbe);
        let snapshot = collector.collect();
        assert_eq!(snapshot.system.device_class, "Laptop");
        assert_eq!(snapshot.system.logged_in_user, "jdupont");
        assert!(snapshot.memory.total >= snapshot.memory.used);
    }

    #[test]
    fn test_chassis_classes() {
        assert_eq!(chassis_class(10), "Laptop");
        assert_eq!(chassis_class(3), "Desktop");
        assert_eq!(chassis_class(99), UNKNOWN);
        assert_eq!(first_number("{3}\r\n"), Some(3));
        assert_eq!(first_number("none"), None);
    }

    #[test]
    fn test_session_parsers() {
        let query = " USERNAME              SESSIONNAME        ID  STATE   IDLE TIME  LOGON TIME\n\
                     >jdupont               console             1  Active      none   3/4/2025 8:01 AM\n";
        assert_eq!(parse_query_user(query), Some("jdupont".to_string()));
        assert_eq!(parse_query_user("USERNAME SESSIONNAME\n"), None);

        let who = "alice    tty7         2025-01-15 09:12 (:0)\n";
        assert_eq!(parse_who(who), Some("alice".to_string()));
        assert_eq!(parse_who(""), None);
    }
}
