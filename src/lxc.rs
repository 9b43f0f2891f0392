//! Thin async wrappers around the `lxc-*` command line tools.

use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum LxcError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Lifecycle actions that map one-to-one onto an `lxc-*` tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Freeze,
    Unfreeze,
}

impl ContainerAction {
    pub fn tool(self) -> &'static str {
        match self {
            Self::Start => "lxc-start",
            Self::Stop => "lxc-stop",
            Self::Freeze => "lxc-freeze",
            Self::Unfreeze => "lxc-unfreeze",
        }
    }

    pub fn success_message(self) -> &'static str {
        match self {
            Self::Start => "Container started successfully",
            Self::Stop => "Container stopped successfully",
            Self::Freeze => "Container frozen successfully",
            Self::Unfreeze => "Container unfrozen successfully",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
    pub pid: String,
    pub ip: String,
    pub cpu_usage: String,
    pub blkio_usage: String,
    pub memory_use: String,
    pub kmem_use: String,
    pub link: String,
    pub link_state: LinkStatistics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatistics {
    pub tx_bytes: String,
    pub rx_bytes: String,
    pub total_bytes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateRequest {
    pub template: String,
    pub container_name: String,
    pub image_source: String,
    pub distribution: String,
    pub release: String,
    pub architecture: String,
}

impl CreateRequest {
    fn args(&self) -> Vec<&str> {
        vec![
            "-t",
            self.template.as_str(),
            "-n",
            self.container_name.as_str(),
            "--",
            "--server",
            self.image_source.as_str(),
            "--dist",
            self.distribution.as_str(),
            "--release",
            self.release.as_str(),
            "--arch",
            self.architecture.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DestroyRequest {
    #[serde(rename = "del_container")]
    pub container_name: String,
}

/// Parse the `Key: value` report printed by `lxc-info`.
///
/// Unknown keys and lines without a colon are ignored. When a key repeats
/// (e.g. several `IP:` lines) the last one wins.
pub fn parse_container_info(output: &str) -> ContainerInfo {
    let mut info = ContainerInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Name" => info.name = value,
            "State" => info.state = value,
            "PID" => info.pid = value,
            "IP" => info.ip = value,
            "CPU use" => info.cpu_usage = value,
            "BlkIO use" => info.blkio_usage = value,
            "Memory use" => info.memory_use = value,
            "KMem use" => info.kmem_use = value,
            "Link" => info.link = value,
            "TX bytes" => info.link_state.tx_bytes = value,
            "RX bytes" => info.link_state.rx_bytes = value,
            "Total bytes" => info.link_state.total_bytes = value,
            _ => {}
        }
    }
    info
}

/// Runs `lxc-*` tools, optionally from a fixed directory instead of `PATH`.
#[derive(Debug, Clone, Default)]
pub struct Lxc {
    bin_dir: Option<PathBuf>,
}

impl Lxc {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    fn program(&self, tool: &str) -> OsString {
        match &self.bin_dir {
            Some(dir) => dir.join(tool).into_os_string(),
            None => OsString::from(tool),
        }
    }

    /// Run `tool` and return its trimmed stdout. A non-zero exit is an error
    /// carrying the tool's stderr.
    pub async fn run(&self, tool: &str, args: &[&str]) -> Result<String, LxcError> {
        tracing::debug!(tool, ?args, "running lxc tool");
        let output = Command::new(self.program(tool))
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LxcError::Spawn {
                program: tool.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(LxcError::Failed {
                program: tool.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn version(&self) -> Result<String, LxcError> {
        self.run("lxc-info", &["--version"]).await
    }

    pub async fn list(&self) -> Result<Vec<String>, LxcError> {
        let output = self.run("lxc-ls", &[]).await?;
        Ok(output.split_whitespace().map(str::to_string).collect())
    }

    pub async fn info(&self, name: &str) -> Result<ContainerInfo, LxcError> {
        let output = self.run("lxc-info", &["--name", name]).await?;
        Ok(parse_container_info(&output))
    }

    pub async fn act(&self, action: ContainerAction, name: &str) -> Result<(), LxcError> {
        self.run(action.tool(), &["-n", name]).await.map(|_| ())
    }

    pub async fn create(&self, req: &CreateRequest) -> Result<(), LxcError> {
        self.run("lxc-create", &req.args()).await.map(|_| ())
    }

    pub async fn destroy(&self, name: &str) -> Result<(), LxcError> {
        self.run("lxc-destroy", &["-n", name]).await.map(|_| ())
    }
}
