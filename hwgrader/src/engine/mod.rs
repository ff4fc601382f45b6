/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Hardware orchestration engine.
//!
//! One engine drives one physical testbed through a two-state machine:
//!
//! ```text
//!          request_grade_task                terminate procedure completes
//!   IDLE ─────────────────────► TESTING ───────────────────────────────────► IDLE
//! ```
//!
//! # Task flow
//! ```text
//! request_grade_task ─► workspace prepared ─► spawn grade_task ─► return
//!
//! grade_task:
//!   on_before_execution   (sequential, configured order)
//!   running = true
//!   on_execute            (one blocking task per device, concurrent)
//!   deadline timer armed
//!   wait for first trigger (device, deadline, external) ─► terminate procedure
//!
//! terminate procedure (exactly once per task):
//!   cancel timer ─► on_terminate (sequential) ─► join executions
//!   ─► on_reset_after_execution (sequential) ─► backup workspace
//!   ─► send outputs ─► IDLE ─► send status ─► completions += 1
//! ```
//!
//! # Concurrency
//! The `running` flag is the single-acquisition gate of the terminate
//! procedure: whoever flips it from `true` to `false` runs the procedure,
//! every other caller returns immediately.  Devices and the deadline timer
//! never call into the engine; they send a [`TerminateTrigger`] through
//! their [`TerminationNotifier`] and the task's own grade loop acts on it.
//! A device asking for termination from its own execution thread therefore
//! never ends up joining itself.

pub mod error;
pub mod notifier;
pub mod workspace;

pub use error::EngineError;
pub use notifier::{termination_channel, TerminateTrigger, TerminationNotifier, TriggerReceiver};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, TestbedConfig};
use crate::device::{Device, DeviceContext};
use crate::task::{effective_deadline, EngineStatus, OutputBundle};
use crate::transport::ResultTransport;

// ── Public construction types ─────────────────────────────────────────────────

/// A device together with the name it was configured under.
#[derive(Clone)]
pub struct NamedDevice {
    pub name: String,
    pub device: Arc<dyn Device>,
}

impl fmt::Debug for NamedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedDevice").field("name", &self.name).finish()
    }
}

/// Where task files live on disk.
#[derive(Debug, Clone)]
pub struct EngineLayout {
    /// Shared per-task workspace; recreated for every task.
    pub workspace: PathBuf,
    /// Parent of the timestamped backup directories.
    pub backup_root: PathBuf,
}

/// File names a task exchanges with the grading service.
#[derive(Debug, Clone, Default)]
pub struct TaskFiles {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl From<&TestbedConfig> for TaskFiles {
    fn from(config: &TestbedConfig) -> Self {
        Self {
            inputs: config.required_input_files.clone(),
            outputs: config.required_output_files.clone(),
        }
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

/// Per-task state.  Reset to default when the terminate procedure ends.
#[derive(Debug, Default)]
struct ActiveTask {
    secret_code: String,
    deadline: Duration,
    started_at: Option<Instant>,
    timer: Option<AbortHandle>,
    executions: Vec<(String, JoinHandle<()>)>,
    /// Cancelled by the terminate procedure; wakes the grade loop when the
    /// procedure was won by an outside caller.
    stop: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    BeforeExecution,
    Terminate,
    ResetAfterExecution,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::BeforeExecution => "on_before_execution",
            Phase::Terminate => "on_terminate",
            Phase::ResetAfterExecution => "on_reset_after_execution",
        }
    }
}

struct EngineInner {
    id: u32,
    devices: Vec<NamedDevice>,
    files: TaskFiles,
    layout: EngineLayout,
    transport: Arc<dyn ResultTransport>,
    notifier: TerminationNotifier,
    triggers: tokio::sync::Mutex<TriggerReceiver>,
    status: AtomicU8,
    running: AtomicBool,
    task: Mutex<ActiveTask>,
    completed: watch::Sender<u64>,
}

// ── HardwareEngine ────────────────────────────────────────────────────────────

/// Cheap to clone; all clones drive the same testbed.
#[derive(Clone)]
pub struct HardwareEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for HardwareEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareEngine")
            .field("id", &self.inner.id)
            .field("devices", &self.inner.devices)
            .field("status", &self.get_status())
            .finish()
    }
}

impl HardwareEngine {
    /// Build every configured device, in lifecycle order.
    ///
    /// # Errors
    /// [`EngineError::Config`] if the configuration is invalid or a device
    /// cannot be constructed.
    pub fn new(
        config: &TestbedConfig,
        layout: EngineLayout,
        transport: Arc<dyn ResultTransport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (notifier, receiver) = termination_channel();
        let ctx = DeviceContext {
            workspace: layout.workspace.clone(),
            notifier: notifier.clone(),
        };

        let mut devices = Vec::with_capacity(config.devices.len());
        for name in config.ordered_device_names() {
            let spec = config
                .devices
                .get(name)
                .ok_or_else(|| ConfigError::UnknownDevice(name.to_string()))?;
            let device = spec.build(name, &ctx)?;
            info!(testbed = config.id, device = %name, kind = spec.kind(), "device created");
            devices.push(NamedDevice {
                name: name.to_string(),
                device,
            });
        }

        Ok(Self::assemble(
            config.id,
            TaskFiles::from(config),
            layout,
            transport,
            devices,
            (notifier, receiver),
        ))
    }

    /// Assemble an engine from ready-made devices.
    ///
    /// `channel` must be the pair whose notifier the devices were given.
    pub fn with_devices(
        files: TaskFiles,
        layout: EngineLayout,
        transport: Arc<dyn ResultTransport>,
        devices: Vec<NamedDevice>,
        channel: (TerminationNotifier, TriggerReceiver),
    ) -> Self {
        Self::assemble(0, files, layout, transport, devices, channel)
    }

    fn assemble(
        id: u32,
        files: TaskFiles,
        layout: EngineLayout,
        transport: Arc<dyn ResultTransport>,
        devices: Vec<NamedDevice>,
        channel: (TerminationNotifier, TriggerReceiver),
    ) -> Self {
        let (notifier, receiver) = channel;
        Self {
            inner: Arc::new(EngineInner {
                id,
                devices,
                files,
                layout,
                transport,
                notifier,
                triggers: tokio::sync::Mutex::new(receiver),
                status: AtomicU8::new(EngineStatus::Idle as u8),
                running: AtomicBool::new(false),
                task: Mutex::new(ActiveTask::default()),
                completed: watch::channel(0).0,
            }),
        }
    }

    /// Lock-free status read.
    pub fn get_status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.inner.devices.iter().map(|d| d.name.as_str())
    }

    /// A notifier for components outside the device set.
    pub fn notifier(&self) -> TerminationNotifier {
        self.inner.notifier.clone()
    }

    /// Accept a grading task and start it in the background.
    ///
    /// `deadline` of `None` or zero means [`DEFAULT_DEADLINE`](crate::task::DEFAULT_DEADLINE).
    /// Returns as soon as the workspace holds the inputs; must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    /// - [`EngineError::MissingInput`] / [`EngineError::UnexpectedInput`] if
    ///   `input_files` does not match the required input set.  Checked
    ///   before any state change.
    /// - [`EngineError::Busy`] while another task is running.
    /// - [`EngineError::Workspace`] if the inputs cannot be written; the
    ///   engine returns to `IDLE`.
    pub async fn request_grade_task(
        &self,
        input_files: HashMap<String, Vec<u8>>,
        secret_code: impl Into<String>,
        deadline: Option<Duration>,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.check_inputs(&input_files)?;

        if inner
            .status
            .compare_exchange(
                EngineStatus::Idle as u8,
                EngineStatus::Testing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(testbed = inner.id, "grade request refused, engine busy");
            return Err(EngineError::Busy);
        }

        let ws = inner.layout.workspace.clone();
        let prepared = tokio::task::spawn_blocking(move || workspace::prepare(&ws, &input_files))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        if let Err(e) = prepared {
            error!(testbed = inner.id, error = %e, "cannot prepare workspace");
            inner
                .status
                .store(EngineStatus::Idle as u8, Ordering::Release);
            return Err(EngineError::Workspace(e));
        }

        let deadline = effective_deadline(deadline);
        *inner.task.lock() = ActiveTask {
            secret_code: secret_code.into(),
            deadline,
            ..ActiveTask::default()
        };
        info!(
            testbed = inner.id,
            deadline_secs = deadline.as_secs_f64(),
            "grade task accepted"
        );

        let task_inner = Arc::clone(inner);
        tokio::spawn(async move { task_inner.grade_task().await });
        Ok(())
    }

    /// Ask the running task to terminate.  Safe to call any number of times
    /// from anywhere; a no-op when idle.
    pub fn notify_terminate(&self) {
        self.inner.notifier.notify(TerminateTrigger::External);
    }

    /// Run the terminate procedure directly.
    ///
    /// Returns `true` for the one caller that performed it, `false` for
    /// every concurrent or later caller and when no task is executing.
    ///
    /// The procedure runs on its own task: dropping this future does not
    /// interrupt a shutdown that has already been claimed.
    pub async fn terminate_procedure(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.terminate_procedure().await }).await {
            Ok(won) => won,
            Err(e) => {
                error!(testbed = self.inner.id, error = %e, "terminate procedure panicked");
                false
            }
        }
    }

    /// Watch the number of completed tasks.
    ///
    /// The value changes only after a task's final status has been posted,
    /// so a caller that subscribes before `request_grade_task` and awaits
    /// `changed()` sees the task fully reported.
    pub fn completions(&self) -> watch::Receiver<u64> {
        self.inner.completed.subscribe()
    }
}

impl EngineInner {
    fn check_inputs(&self, input_files: &HashMap<String, Vec<u8>>) -> Result<(), EngineError> {
        if let Some(name) = self
            .files
            .inputs
            .iter()
            .find(|n| !input_files.contains_key(n.as_str()))
        {
            return Err(EngineError::MissingInput { name: name.clone() });
        }
        if let Some(name) = input_files
            .keys()
            .filter(|n| !self.files.inputs.contains(n))
            .min()
        {
            return Err(EngineError::UnexpectedInput { name: name.clone() });
        }
        Ok(())
    }

    async fn grade_task(self: Arc<Self>) {
        let mut triggers = self.triggers.lock().await;
        let stale = triggers.drain();
        if stale > 0 {
            debug!(testbed = self.id, stale, "discarded triggers from a previous task");
        }

        self.reset_devices().await;

        let stop = {
            let mut task = self.task.lock();
            self.running.store(true, Ordering::Release);
            task.started_at = Some(Instant::now());
            self.start_execution(&mut task);
            self.arm_deadline(&mut task);
            task.stop.clone()
        };

        tokio::select! {
            trigger = triggers.recv() => {
                match trigger {
                    Some(t) => info!(testbed = self.id, trigger = %t, "termination requested"),
                    None => warn!(testbed = self.id, "trigger channel closed"),
                }
                self.terminate_procedure().await;
            }
            _ = stop.cancelled() => {
                debug!(testbed = self.id, "task terminated by direct call");
            }
        }
    }

    /// Sequential `on_before_execution`, in configured order.
    async fn reset_devices(&self) {
        for dev in &self.devices {
            self.run_phase(dev, Phase::BeforeExecution).await;
        }
    }

    /// One blocking execution unit per device.  Called with the task lock
    /// held so the terminate procedure sees every handle.
    fn start_execution(&self, task: &mut ActiveTask) {
        for dev in &self.devices {
            let name = dev.name.clone();
            let device = Arc::clone(&dev.device);
            let handle = tokio::task::spawn_blocking(move || {
                debug!(device = %name, "execution started");
                match device.on_execute() {
                    Ok(()) => debug!(device = %name, "execution finished"),
                    Err(e) => warn!(device = %name, phase = "on_execute", error = %e, "device phase failed"),
                }
            });
            task.executions.push((dev.name.clone(), handle));
        }
    }

    fn arm_deadline(&self, task: &mut ActiveTask) {
        let deadline = task.deadline;
        let notifier = self.notifier.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            notifier.notify(TerminateTrigger::Deadline);
        });
        task.timer = Some(timer.abort_handle());
    }

    async fn run_phase(&self, dev: &NamedDevice, phase: Phase) {
        let device = Arc::clone(&dev.device);
        let res = tokio::task::spawn_blocking(move || match phase {
            Phase::BeforeExecution => device.on_before_execution(),
            Phase::Terminate => device.on_terminate(),
            Phase::ResetAfterExecution => device.on_reset_after_execution(),
        })
        .await;

        match res {
            Ok(Ok(())) => debug!(device = %dev.name, phase = phase.as_str(), "device phase done"),
            Ok(Err(e)) => {
                warn!(device = %dev.name, phase = phase.as_str(), error = %e, "device phase failed")
            }
            Err(e) => {
                error!(device = %dev.name, phase = phase.as_str(), error = %e, "device phase panicked")
            }
        }
    }

    async fn terminate_procedure(&self) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(testbed = self.id, "terminate procedure already claimed");
            return false;
        }

        let (secret_code, executions, timer, stop, started_at) = {
            let mut task = self.task.lock();
            (
                task.secret_code.clone(),
                std::mem::take(&mut task.executions),
                task.timer.take(),
                task.stop.clone(),
                task.started_at,
            )
        };
        stop.cancel();
        if let Some(timer) = timer {
            timer.abort();
        }
        info!(
            testbed = self.id,
            elapsed_secs = started_at.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0),
            "terminating devices"
        );

        for dev in &self.devices {
            self.run_phase(dev, Phase::Terminate).await;
        }
        for (name, handle) in executions {
            if let Err(e) = handle.await {
                error!(device = %name, error = %e, "execution unit panicked");
            }
        }
        for dev in &self.devices {
            self.run_phase(dev, Phase::ResetAfterExecution).await;
        }

        let bundle = self.backup_and_collect().await;
        if !bundle.is_complete() {
            warn!(testbed = self.id, missing = ?bundle.missing, "required outputs missing");
        }
        match self.transport.send_output(&bundle, &secret_code).await {
            Ok(()) => info!(testbed = self.id, files = bundle.files.len(), "output files uploaded"),
            Err(e) => error!(testbed = self.id, error = %e, "unable to upload output"),
        }

        *self.task.lock() = ActiveTask::default();
        self.status
            .store(EngineStatus::Idle as u8, Ordering::Release);
        info!(testbed = self.id, "test complete");

        match self.transport.send_status(EngineStatus::Idle).await {
            Ok(()) => debug!(testbed = self.id, "IDLE status sent"),
            Err(e) => warn!(testbed = self.id, error = %e, "unable to post status"),
        }
        self.completed.send_modify(|n| *n += 1);
        true
    }

    /// Move the workspace into a timestamped backup and locate the
    /// required outputs there.  Falls back to the live workspace when the
    /// backup fails.
    async fn backup_and_collect(&self) -> OutputBundle {
        let layout = self.layout.clone();
        let outputs = self.files.outputs.clone();
        let res = tokio::task::spawn_blocking(move || {
            let dir = workspace::backup(&layout.workspace, &layout.backup_root, Local::now())?;
            Ok::<_, io::Error>((workspace::collect_outputs(&dir, &outputs), dir))
        })
        .await
        .map_err(io::Error::other)
        .and_then(|r| r);

        match res {
            Ok((bundle, dir)) => {
                info!(testbed = self.id, path = %dir.display(), "workspace backed up");
                bundle
            }
            Err(e) => {
                error!(testbed = self.id, error = %e, "workspace backup failed");
                workspace::collect_outputs(&self.layout.workspace, &self.files.outputs)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
