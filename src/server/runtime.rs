/// Number of tokio worker threads for this process.
///
/// Containers are routinely capped well below the host's core count, and a
/// pool sized from `available_parallelism` alone oversubscribes on big
/// hosts. Resolution order: the `LIMITD_WORKER_THREADS` override, then the
/// cgroup CPU quota (v2, then v1), then the host CPU count.
pub fn worker_threads() -> usize {
    env_override()
        .or_else(cgroup_quota)
        .unwrap_or_else(host_cpus)
        .max(1)
}

fn env_override() -> Option<usize> {
    std::env::var("LIMITD_WORKER_THREADS")
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|n: &usize| *n > 0)
}

fn cgroup_quota() -> Option<usize> {
    // cgroup v2 unified hierarchy: `cpu.max` holds "<quota> <period>",
    // with a literal "max" quota meaning unlimited.
    if let Ok(raw) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let mut parts = raw.split_whitespace();
        return threads_for_quota(parts.next()?, parts.next()?);
    }

    // cgroup v1 keeps the same two numbers in separate files.
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
    threads_for_quota(quota.trim(), period.trim())
}

/// A quota of 2.5 cores gets 3 workers; partial cores still deserve a
/// thread of their own.
fn threads_for_quota(quota: &str, period: &str) -> Option<usize> {
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some((quota as u64).div_ceil(period as u64) as usize)
}

fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_core_quotas() {
        assert_eq!(threads_for_quota("400000", "100000"), Some(4));
        assert_eq!(threads_for_quota("100000", "100000"), Some(1));
    }

    #[test]
    fn test_partial_cores_round_up() {
        assert_eq!(threads_for_quota("250000", "100000"), Some(3));
        assert_eq!(threads_for_quota("50000", "100000"), Some(1));
    }

    #[test]
    fn test_unlimited_and_invalid_quotas() {
        assert_eq!(threads_for_quota("max", "100000"), None);
        assert_eq!(threads_for_quota("-1", "100000"), None);
        assert_eq!(threads_for_quota("0", "100000"), None);
        assert_eq!(threads_for_quota("abc", "100000"), None);
        assert_eq!(threads_for_quota("100000", "0"), None);
    }

    #[test]
    fn test_worker_threads_is_positive() {
        assert!(worker_threads() >= 1);
    }

    #[test]
    fn test_host_cpus_is_positive() {
        assert!(host_cpus() >= 1);
    }
}
