use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use botpanel_agent::{
    ClientCommand, SupervisorConfig,
    process_support::env_flag,
};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_DATA_ROOT: &str = "./data";

/// Process-wide settings, read once from the environment at boot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub data_root: PathBuf,
    pub supervisor: SupervisorConfig,
    pub client: ClientCommand,
    /// Restart the bot on boot when the previous run was still marked running.
    pub resume_on_boot: bool,
    /// Optional directory for a daily-rotated copy of the tracing output.
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_raw = non_empty_var("BOTPANEL_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid BOTPANEL_BIND {bind_raw:?}"))?;

        Ok(Self {
            bind,
            data_root: non_empty_var("BOTPANEL_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT)),
            supervisor: SupervisorConfig::from_env(),
            client: ClientCommand::from_env(),
            resume_on_boot: env_flag("BOTPANEL_RESUME_ON_BOOT"),
            log_dir: non_empty_var("BOTPANEL_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.data_root.join("logs").join("console.log")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_log_lives_under_data_root() {
        let s = Settings {
            bind: DEFAULT_BIND.parse().unwrap(),
            data_root: PathBuf::from("/srv/bot"),
            supervisor: SupervisorConfig::default(),
            client: ClientCommand {
                command: "node".to_string(),
                args: vec![],
                cwd: None,
            },
            resume_on_boot: false,
            log_dir: None,
        };
        assert_eq!(
            s.console_log_path(),
            PathBuf::from("/srv/bot/logs/console.log")
        );
    }
}
