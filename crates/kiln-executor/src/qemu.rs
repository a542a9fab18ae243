//! QEMU user-mode emulation through the Docker engine.
//!
//! Registers binfmt handlers by running the `tonistiigi/binfmt` image in a
//! privileged container, once per architecture per process.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use kiln_core::executor::Emulator;
use kiln_core::{Error, Platform, Result};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BINFMT_IMAGE: &str = "tonistiigi/binfmt:latest";

/// Installs QEMU binfmt handlers on the Docker host.
pub struct BinfmtEmulator {
    docker: Docker,
    image: String,
    installed: Mutex<HashSet<String>>,
}

impl BinfmtEmulator {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            image: BINFMT_IMAGE.to_string(),
            installed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Whether the Docker daemon answers.
    pub async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn container_name(arch: &str) -> String {
        format!("kiln-binfmt-{}-{}", arch, std::process::id())
    }

    async fn pull(&self) {
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "Pull warning"),
            }
        }
    }

    async fn install(&self, arch: &str) -> Result<()> {
        self.pull().await;

        let container_name = Self::container_name(arch);
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["--install".to_string(), arch.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create binfmt container: {}", e)))?;

        let outcome = self.run_to_completion(&container_name).await;

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&container_name, Some(remove))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove binfmt container");
        }

        outcome
    }

    async fn run_to_completion(&self, container_name: &str) -> Result<()> {
        self.docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Internal(format!("Failed to start binfmt container: {}", e)))?;

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_name, Some(options));
        let status_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                return Err(Error::Internal(format!("Failed to wait for binfmt container: {}", e)));
            }
            None => {
                return Err(Error::Internal("binfmt container vanished".to_string()));
            }
        };

        if status_code != 0 {
            let output = self.tail_logs(container_name).await;
            return Err(Error::Internal(format!(
                "binfmt install exited with {}: {}",
                status_code, output
            )));
        }
        Ok(())
    }

    async fn tail_logs(&self, container_name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "20".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_name, Some(options));
        let mut lines = Vec::new();
        while let Some(Ok(output)) = stream.next().await {
            let message = match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message,
            };
            lines.push(String::from_utf8_lossy(&message).trim_end().to_string());
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Emulator for BinfmtEmulator {
    async fn ensure(&self, platform: &Platform) -> Result<()> {
        let arch = platform.arch().to_string();

        // Held across the install so concurrent jobs for one arch install once.
        let mut installed = self.installed.lock().await;
        if installed.contains(&arch) {
            return Ok(());
        }

        info!(arch = %arch, image = %self.image, "Installing QEMU binfmt handler");
        self.install(&arch).await?;
        installed.insert(arch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        let name = BinfmtEmulator::container_name("arm64");
        assert!(name.starts_with("kiln-binfmt-arm64-"));
        assert_eq!(name, BinfmtEmulator::container_name("arm64"));
    }

    #[tokio::test]
    #[ignore = "requires a privileged Docker daemon"]
    async fn test_install_arm64() {
        let emulator = BinfmtEmulator::new().unwrap();
        assert!(emulator.available().await);

        let arm64 = Platform::parse("linux/arm64").unwrap();
        emulator.ensure(&arm64).await.unwrap();
        // Second call is a no-op.
        emulator.ensure(&arm64).await.unwrap();
        assert!(emulator.installed.lock().await.contains("arm64"));
    }
}
