use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identifies one live bot instance. A fresh id is minted per successful login,
/// so a late exit notification from an old instance never clobbers a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl BotState {
    pub fn is_running(self) -> bool {
        matches!(self, BotState::Running)
    }

    /// Any state other than `Stopped` owns (or is about to own) the single handle.
    pub fn is_busy(self) -> bool {
        !matches!(self, BotState::Stopped)
    }
}

/// Persisted configuration record. The empty form (`Default`) is what `clear` writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running: bool,
}

impl ConfigRecord {
    pub fn is_empty(&self) -> bool {
        self.owner_id.is_none() && self.last_started_at.is_none() && !self.running
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    pub uptime: Duration,
}

/// `config` block of the status response, keyed the way the dashboard reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigView {
    #[serde(rename = "ownerUID")]
    pub owner_uid: Option<String>,
    #[serde(rename = "lastStarted")]
    pub last_started: Option<DateTime<Utc>>,
}

impl From<&ConfigRecord> for ConfigView {
    fn from(c: &ConfigRecord) -> Self {
        Self {
            owner_uid: c.owner_id.clone(),
            last_started: c.last_started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemoryView {
    pub usage: String,
    pub uptime: String,
}

impl From<ResourceSample> for MemoryView {
    fn from(s: ResourceSample) -> Self {
        Self {
            usage: format_mebibytes(s.rss_bytes),
            uptime: format_uptime(s.uptime),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub state: BotState,
    pub config: ConfigView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryView>,
}

pub fn format_mebibytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, InstanceId::new());
    }

    #[test]
    fn empty_config_round_trips_without_fields() {
        let c = ConfigRecord::default();
        assert!(c.is_empty());
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"running":false}"#);
        let back: ConfigRecord = serde_json::from_str("{}").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn status_uses_dashboard_keys() {
        let snap = StatusSnapshot {
            running: true,
            state: BotState::Running,
            config: ConfigView {
                owner_uid: Some("1001".to_string()),
                last_started: None,
            },
            memory: Some(
                ResourceSample {
                    rss_bytes: 3 * 1024 * 1024,
                    uptime: Duration::from_secs(3725),
                }
                .into(),
            ),
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["config"]["ownerUID"], "1001");
        assert!(v["config"]["lastStarted"].is_null());
        assert_eq!(v["memory"]["usage"], "3.00 MB");
        assert_eq!(v["memory"]["uptime"], "1h 2m 5s");
        assert_eq!(v["state"], "running");
    }

    #[test]
    fn uptime_formats_short_durations() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
    }

    #[test]
    fn busy_states() {
        assert!(!BotState::Stopped.is_busy());
        assert!(BotState::Starting.is_busy());
        assert!(BotState::Running.is_running());
        assert!(!BotState::Stopping.is_running());
    }
}
