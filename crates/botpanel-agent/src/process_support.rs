use std::{sync::OnceLock, time::Duration};

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn log_max_lines() -> usize {
    env_usize("BOTPANEL_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("BOTPANEL_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("BOTPANEL_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

/// Time between the logout request and each signal escalation when closing a client process.
pub fn graceful_term_grace() -> Duration {
    Duration::from_secs(
        env_u64("BOTPANEL_GRACEFUL_TERM_GRACE_SEC")
            .map(|v| v.clamp(1, 60))
            .unwrap_or(3),
    )
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| 4096)
}

#[cfg(target_os = "linux")]
pub async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let statm_path = format!("/proc/{pid}/statm");
    let s = tokio::fs::read_to_string(statm_path).await.ok()?;
    parse_statm_rss(&s)
}

#[cfg(not(target_os = "linux"))]
pub async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn parse_statm_rss(statm: &str) -> Option<u64> {
    let mut it = statm.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the panel dies (crash/kill), take the client down with it.
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    Term,
    Kill,
}

impl StopSignal {
    pub(crate) fn name(self) -> &'static str {
        match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Signals the whole process group. Returns false when the group is already gone.
#[cfg(unix)]
pub(crate) fn signal_group(pgid: i32, sig: StopSignal) -> bool {
    let raw = match sig {
        StopSignal::Term => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(-pgid, raw) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: i32, _sig: StopSignal) -> bool {
    false
}
