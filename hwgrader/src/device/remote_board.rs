/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Embedded Linux board driven over SSH.
//!
//! Prepare runs an optional setup command and copies input files to the
//! board; execute runs the student's program remotely; terminate kills it and
//! copies the declared results back.  `ssh` and `scp` are invoked as
//! external programs so key management stays with the host's SSH config.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{check_status, run_command as run, Device, DeviceContext, DeviceError, StopSignal};

/// How often execute checks whether the remote program has exited.
const CHILD_POLL: Duration = Duration::from_millis(50);

fn default_remote() -> String {
    "root@192.168.7.2".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_scp() -> String {
    "scp".to_string()
}

fn default_reboot_wait_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBoardConfig {
    /// `user@host` passed to ssh and scp.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Remote command run before uploads, e.g. a cleanup script.
    #[serde(default)]
    pub prepare_command: Option<Vec<String>>,
    #[serde(default)]
    pub uploads: Vec<Upload>,
    pub run_command: Vec<String>,
    #[serde(default)]
    pub downloads: Vec<Download>,
    #[serde(default)]
    pub reboot_on_reset: bool,
    #[serde(default = "default_reboot_wait_secs")]
    pub reboot_wait_secs: u64,
    #[serde(default = "default_ssh")]
    pub ssh_program: String,
    #[serde(default = "default_scp")]
    pub scp_program: String,
}

/// Workspace file copied to the board.
#[derive(Debug, Clone, Deserialize)]
pub struct Upload {
    pub file: String,
    pub remote_path: String,
}

/// Board file copied back into the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct Download {
    pub remote_path: String,
    pub file: String,
}

pub struct RemoteBoard {
    name: String,
    config: RemoteBoardConfig,
    workspace: PathBuf,
    stop: StopSignal,
    child: Mutex<Option<Child>>,
}

impl RemoteBoard {
    pub fn new(name: &str, config: &RemoteBoardConfig, ctx: &DeviceContext) -> Self {
        Self {
            name: name.to_string(),
            config: config.clone(),
            workspace: ctx.workspace.clone(),
            stop: StopSignal::new(),
            child: Mutex::new(None),
        }
    }

    fn ssh(&self, remote_cmd: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.arg(&self.config.remote).args(remote_cmd);
        cmd
    }

    fn scp(&self, from: &str, to: &str) -> Command {
        let mut cmd = Command::new(&self.config.scp_program);
        cmd.arg(from).arg(to);
        cmd
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.config.remote, path)
    }

    /// Poll the running child until it exits or the stop flag is raised.
    fn wait_child(&self) -> Result<(), DeviceError> {
        loop {
            {
                let mut guard = self.child.lock();
                let Some(child) = guard.as_mut() else {
                    return Ok(());
                };
                if let Some(status) = child.try_wait()? {
                    guard.take();
                    debug!(device = %self.name, %status, "remote program exited");
                    return check_status(&self.config.run_command.join(" "), status);
                }
            }
            if self.stop.wait_timeout(CHILD_POLL) {
                return Ok(());
            }
        }
    }
}

impl Device for RemoteBoard {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();

        if let Some(prepare) = &self.config.prepare_command {
            run(self.ssh(prepare))?;
        }
        for upload in &self.config.uploads {
            let local = self.workspace.join(&upload.file);
            run(self.scp(
                &local.display().to_string(),
                &self.remote_path(&upload.remote_path),
            ))?;
            debug!(device = %self.name, file = %upload.file, "uploaded");
        }
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        {
            let mut guard = self.child.lock();
            if self.stop.is_stopped() {
                return Ok(());
            }
            let child = self
                .ssh(&self.config.run_command)
                .stdin(Stdio::null())
                .spawn()?;
            info!(device = %self.name, pid = child.id(), "remote program started");
            *guard = Some(child);
        }
        self.wait_child()
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();

        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.kill() {
                debug!(device = %self.name, error = %e, "remote program already gone");
            }
            match child.wait() {
                Ok(status) => debug!(device = %self.name, %status, "remote program reaped"),
                Err(e) => debug!(device = %self.name, error = %e, "remote program not reaped"),
            }
            info!(device = %self.name, "remote program killed");
        }

        let mut first_err = None;
        for download in &self.config.downloads {
            let local = self.workspace.join(&download.file);
            let res = run(self.scp(
                &self.remote_path(&download.remote_path),
                &local.display().to_string(),
            ));
            if let Err(e) = res {
                warn!(device = %self.name, file = %download.file, error = %e, "download failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        if !self.config.reboot_on_reset {
            return Ok(());
        }
        // ssh exits non-zero when the board drops the connection.
        if let Err(e) = run(self.ssh(&["reboot".to_string()])) {
            debug!(device = %self.name, error = %e, "reboot command ended abnormally");
        }
        let wait = Duration::from_secs(self.config.reboot_wait_secs);
        info!(device = %self.name, secs = wait.as_secs(), "waiting for board reboot");
        std::thread::sleep(wait);
        Ok(())
    }
}
