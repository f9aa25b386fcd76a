// Worker runtime: opaque container lifecycle capability for module workers

//! # Worker Runtime
//!
//! The engine treats "start a container for module X" as an opaque
//! capability behind the [`WorkerRuntime`] trait. [`DockerRuntime`] is the
//! production implementation: it builds the module's image from its
//! directory and runs exactly one long-lived worker container per module,
//! attached to the network that carries the message bus and with the shared
//! upload storage mounted in.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::ModuleConfig;
use crate::{ApkScopeError, Result};

/// Observed state of a module's worker container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Stopped,
    Absent,
}

/// Container lifecycle capability consumed by the module registry
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Build the module's worker image and run its container
    async fn build_and_run(&self, config: &ModuleConfig) -> Result<()>;

    /// Stop and remove the module's worker container if present
    async fn stop(&self, module_name: &str) -> Result<()>;

    /// Check whether the module's worker container exists and runs
    async fn status(&self, module_name: &str) -> Result<WorkerStatus>;

    /// Well-known container name for a module's worker
    fn container_name_for(&self, module_name: &str) -> String;
}

/// Captured output of one docker invocation
#[derive(Debug)]
struct CommandResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Docker-backed worker runtime
pub struct DockerRuntime {
    /// Directory containing one subdirectory (with Dockerfile) per module
    modules_dir: PathBuf,
    /// Docker network shared with the message bus
    network: String,
    /// Optional shared storage mount, `host_path:container_path`
    shared_volume: Option<String>,
}

impl DockerRuntime {
    pub fn new(modules_dir: impl Into<PathBuf>, network: impl Into<String>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            network: network.into(),
            shared_volume: None,
        }
    }

    /// Mount shared upload storage into every worker container
    pub fn with_shared_volume(mut self, mount: impl Into<String>) -> Self {
        self.shared_volume = Some(mount.into());
        self
    }

    fn image_name_for(&self, module_name: &str) -> String {
        format!("apkscope/{}", module_name)
    }

    /// Execute a docker command and capture output line by line
    async fn execute_docker_command(&self, args: Vec<String>) -> Result<CommandResult> {
        debug!("running docker {}", args.join(" "));

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ApkScopeError::Runtime(format!("failed to start docker: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApkScopeError::Runtime("failed to capture docker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ApkScopeError::Runtime("failed to capture docker stderr".into()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stdout_output = String::new();
        let mut stderr_output = String::new();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            stdout_output.push_str(&line);
                            stdout_output.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return Err(ApkScopeError::Runtime(format!(
                                "failed to read docker stdout: {}", e
                            )))
                        }
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            stderr_output.push_str(&line);
                            stderr_output.push('\n');
                        }
                        Ok(None) => {}
                        Err(e) => {
                            return Err(ApkScopeError::Runtime(format!(
                                "failed to read docker stderr: {}", e
                            )))
                        }
                    }
                }
            }
        }

        let exit_status = child
            .wait()
            .await
            .map_err(|e| ApkScopeError::Runtime(format!("failed to wait for docker: {}", e)))?;

        Ok(CommandResult {
            exit_code: exit_status.code().unwrap_or(-1),
            stdout: stdout_output,
            stderr: stderr_output,
        })
    }

    async fn run_checked(&self, args: Vec<String>, context: &str) -> Result<CommandResult> {
        let result = self.execute_docker_command(args).await?;
        if result.exit_code != 0 {
            return Err(ApkScopeError::Runtime(format!(
                "{} (exit code {}): {}",
                context,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    async fn build_and_run(&self, config: &ModuleConfig) -> Result<()> {
        let image = self.image_name_for(&config.name);
        let container = self.container_name_for(&config.name);
        let build_context = self.modules_dir.join(&config.name);

        info!(module = %config.name, image = %image, "building worker image");
        self.run_checked(
            vec![
                "build".to_string(),
                "-t".to_string(),
                image.clone(),
                build_context.to_string_lossy().into_owned(),
            ],
            "image build failed",
        )
        .await?;

        let mut run_args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "--network".to_string(),
            self.network.clone(),
            "-e".to_string(),
            format!("MODULE_NAME={}", config.name),
        ];
        if let Some(mount) = &self.shared_volume {
            run_args.push("-v".to_string());
            run_args.push(mount.clone());
        }
        run_args.push(image);

        info!(module = %config.name, container = %container, "starting worker container");
        self.run_checked(run_args, "container start failed").await?;
        Ok(())
    }

    async fn stop(&self, module_name: &str) -> Result<()> {
        let container = self.container_name_for(module_name);
        // rm -f stops and removes in one call; missing container is fine
        let result = self
            .execute_docker_command(vec![
                "rm".to_string(),
                "-f".to_string(),
                container.clone(),
            ])
            .await?;
        if result.exit_code != 0 && !result.stderr.contains("No such container") {
            return Err(ApkScopeError::Runtime(format!(
                "failed to remove container {}: {}",
                container,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn status(&self, module_name: &str) -> Result<WorkerStatus> {
        let container = self.container_name_for(module_name);
        let result = self
            .execute_docker_command(vec![
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                container,
            ])
            .await?;

        if result.exit_code != 0 {
            return Ok(WorkerStatus::Absent);
        }
        match result.stdout.trim() {
            "true" => Ok(WorkerStatus::Running),
            _ => Ok(WorkerStatus::Stopped),
        }
    }

    fn container_name_for(&self, module_name: &str) -> String {
        format!("apkscope-worker-{}", module_name)
    }
}

/// In-memory runtime double used by engine tests
#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRuntime {
        containers: Mutex<HashMap<String, WorkerStatus>>,
        failing: Mutex<HashSet<String>>,
        pub build_calls: AtomicUsize,
        pub stop_calls: AtomicUsize,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `build_and_run` fail for one module
        pub fn fail_module(&self, module_name: &str) {
            self.failing.lock().unwrap().insert(module_name.to_string());
        }

        pub fn running_count(&self) -> usize {
            self.containers
                .lock()
                .unwrap()
                .values()
                .filter(|s| **s == WorkerStatus::Running)
                .count()
        }
    }

    #[async_trait]
    impl WorkerRuntime for MockRuntime {
        async fn build_and_run(&self, config: &ModuleConfig) -> Result<()> {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&config.name) {
                return Err(ApkScopeError::Runtime(format!(
                    "simulated build failure for {}",
                    config.name
                )));
            }
            self.containers
                .lock()
                .unwrap()
                .insert(self.container_name_for(&config.name), WorkerStatus::Running);
            Ok(())
        }

        async fn stop(&self, module_name: &str) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.containers
                .lock()
                .unwrap()
                .remove(&self.container_name_for(module_name));
            Ok(())
        }

        async fn status(&self, module_name: &str) -> Result<WorkerStatus> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .get(&self.container_name_for(module_name))
                .copied()
                .unwrap_or(WorkerStatus::Absent))
        }

        fn container_name_for(&self, module_name: &str) -> String {
            format!("mock-worker-{}", module_name)
        }
    }
}
