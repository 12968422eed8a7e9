/// Resident memory of a whole process group in bytes.
///
/// Every `/proc/<pid>` whose `stat` names `pgid` as its process group counts,
/// so children of a shell are charged to the run. The result is the larger of
/// the summed `VmRSS` and the leader's own `VmHWM`, which covers spikes the
/// leader had between samples. Returns `None` once no member is left or when
/// procfs is unavailable.
#[cfg(target_os = "linux")]
pub async fn sample_group(pgid: u32) -> Option<u64> {
    match tokio::task::spawn_blocking(move || scan_group(pgid)).await {
        Ok(usage) => usage,
        Err(e) => {
            tracing::warn!(error = %e, "memory scan failed");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn sample_group(_pgid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn scan_group(pgid: u32) -> Option<u64> {
    use std::fs;

    let entries = fs::read_dir("/proc").ok()?;
    let mut total: Option<u64> = None;
    let mut leader_peak = None;

    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_group(&stat) != Some(pgid) {
            continue;
        }
        // Zombies have no resident set left.
        let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };
        if let Some(rss) = resident(&status) {
            total = Some(total.unwrap_or(0) + rss);
        }
        if pid == pgid {
            leader_peak = parse_status(&status);
        }
    }

    total.max(leader_peak)
}

/// Process group id from the contents of `/proc/<pid>/stat`. The command name
/// may itself contain spaces and parentheses, so fields are counted from the
/// last `)`.
pub fn parse_group(stat: &str) -> Option<u32> {
    let (_, fields) = stat.rsplit_once(')')?;
    // state, ppid, pgrp
    fields.split_whitespace().nth(2)?.parse().ok()
}

/// `VmHWM` from `/proc/<pid>/status`, falling back to `VmRSS`.
pub fn parse_status(status: &str) -> Option<u64> {
    field_kib(status, "VmHWM:")
        .or_else(|| field_kib(status, "VmRSS:"))
        .map(|kib| kib * 1024)
}

fn resident(status: &str) -> Option<u64> {
    field_kib(status, "VmRSS:").map(|kib| kib * 1024)
}

fn field_kib(status: &str, field: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(field))?;
    line[field.len()..].split_whitespace().next()?.parse().ok()
}
