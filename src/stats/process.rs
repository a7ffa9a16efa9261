use serde::Serialize;
use std::time::Instant;

/// Process resource probe for the /performance endpoint.
///
/// Reads procfs directly (Linux); on other platforms both figures report
/// zero. CPU is the utilization since the previous probe, so the first call
/// after startup reports zero.
pub struct ProcessProbe {
    last_cpu_ticks: u64,
    last_probe: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessUsage {
    pub rss_bytes: u64,
    /// CPU utilization since the previous probe, 0.0–100.0 per core.
    pub cpu_percent: f64,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            last_cpu_ticks: read_cpu_ticks().unwrap_or(0),
            last_probe: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> ProcessUsage {
        let rss_bytes = read_rss_bytes().unwrap_or(0);

        let now_ticks = match read_cpu_ticks() {
            Some(t) => t,
            None => {
                return ProcessUsage {
                    rss_bytes,
                    cpu_percent: 0.0,
                }
            }
        };

        let elapsed = self.last_probe.elapsed().as_secs_f64();
        let delta_ticks = now_ticks.saturating_sub(self.last_cpu_ticks);
        self.last_cpu_ticks = now_ticks;
        self.last_probe = Instant::now();

        // Kernel reports CPU time in clock ticks, conventionally 100/s.
        let cpu_secs = delta_ticks as f64 / 100.0;
        let cpu_percent = if elapsed > 0.0 {
            (cpu_secs / elapsed * 100.0).min(10_000.0)
        } else {
            0.0
        };

        ProcessUsage {
            rss_bytes,
            cpu_percent,
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm_rss(&statm).map(|pages| pages * 4096)
}

fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_stat_cpu_ticks(&stat)
}

/// `/proc/self/statm`: second field is resident pages.
fn parse_statm_rss(content: &str) -> Option<u64> {
    content.split_whitespace().nth(1)?.parse().ok()
}

/// `/proc/self/stat`: utime and stime are fields 14 and 15 (1-based), after
/// the parenthesized command name, which may itself contain spaces.
fn parse_stat_cpu_ticks(content: &str) -> Option<u64> {
    let after_comm = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after_comm starts at field 3 ("state"), so utime/stime are at 11/12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
