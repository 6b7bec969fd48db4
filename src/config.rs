use serde::Deserialize;
use std::path::PathBuf;

/// Well-known directories and the host executable name, resolved by the
/// embedding agent and handed to the bridge as plain paths.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentLayout {
    /// Source of the agent's host-runtime binaries (staging source).
    pub host_runtime_dir: PathBuf,
    /// Sandbox the legacy host runs from (staging target).
    pub sandbox_dir: PathBuf,
    /// Externals directory holding host support modules.
    pub externals_dir: PathBuf,
    /// Executable name of the legacy host, resolved inside `sandbox_dir`.
    #[serde(default = "default_host_executable")]
    pub host_executable: String,
}

fn default_host_executable() -> String {
    "legacy-script-host".to_string()
}

impl AgentLayout {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${AGENT_WORK_DIR}
        let expanded = shellexpand::env(&content)?;
        let layout: AgentLayout = toml::from_str(&expanded)?;
        Ok(layout)
    }

    /// Absolute path of the legacy host executable inside the sandbox.
    pub fn host_executable_path(&self) -> PathBuf {
        self.sandbox_dir.join(&self.host_executable)
    }
}
