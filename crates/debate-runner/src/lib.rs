//! Run matrix for debate batches: plan which `(helper type, claim)` pairs to
//! execute, spawn one debate process per pair and tally the outcomes.

use debate_core::{KnownVariants, PlanEntry, Variant, DEFAULT_MODELS_PATH, DEFAULT_SETTINGS_PATH};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, info_span, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("unknown helper types: {unknown:?} (available: {available:?})")]
    UnknownVariant {
        unknown: Vec<String>,
        available: Vec<String>,
    },
    #[error("no helper types found or specified")]
    NoVariants,
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("debate command is empty")]
    EmptyCommand,
    #[error("cancelled before start")]
    Cancelled,
}

/// Expands requested helper types and claim indexes into an ordered plan.
///
/// No requested helper types means every known one, in settings order.
/// Sequential mode with claim indexes yields one entry per claim per helper;
/// otherwise each helper gets one entry, pinned to a claim only when exactly
/// one claim was requested.
pub fn build_plan(
    requested_variants: Option<&[String]>,
    requested_sub_indices: Option<&[u32]>,
    known: &KnownVariants,
    sequential: bool,
) -> Result<Vec<PlanEntry>, PlanError> {
    let variants: Vec<Variant> = match requested_variants {
        Some(requested) if !requested.is_empty() => {
            let mut unknown: Vec<String> = Vec::new();
            for name in requested {
                if !known.contains(name) && !unknown.contains(name) {
                    unknown.push(name.clone());
                }
            }
            if !unknown.is_empty() {
                return Err(PlanError::UnknownVariant {
                    unknown,
                    available: known.names(),
                });
            }
            let mut selected: Vec<Variant> = Vec::with_capacity(requested.len());
            for name in requested {
                let variant = Variant::new(name.as_str());
                if !selected.contains(&variant) {
                    selected.push(variant);
                }
            }
            selected
        }
        _ => known.iter().cloned().collect(),
    };
    if variants.is_empty() {
        return Err(PlanError::NoVariants);
    }

    let sub_indices = requested_sub_indices.unwrap_or(&[]);
    let mut plan = Vec::new();
    for variant in variants {
        if sequential && !sub_indices.is_empty() {
            for idx in sub_indices {
                plan.push(PlanEntry::new(variant.clone(), Some(*idx)));
            }
        } else {
            let single = match sub_indices {
                [only] => Some(*only),
                _ => None,
            };
            plan.push(PlanEntry::new(variant, single));
        }
    }
    Ok(plan)
}

/// Result of one debate process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub entry: PlanEntry,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
}

impl RunOutcome {
    pub fn from_exit(entry: PlanEntry, exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            succeeded: exit_code == Some(0),
            entry,
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// Executes one plan entry. Implementations must be callable from several
/// threads at once.
pub trait Invoker: Send + Sync {
    fn invoke(&self, entry: &PlanEntry) -> Result<RunOutcome, InvocationError>;
}

impl<F> Invoker for F
where
    F: Fn(&PlanEntry) -> Result<RunOutcome, InvocationError> + Send + Sync,
{
    fn invoke(&self, entry: &PlanEntry) -> Result<RunOutcome, InvocationError> {
        self(entry)
    }
}

/// Spawns the debate program:
/// `<command..> --helper_type <v> [--claim_index <n>] [--settings_path <p>] [--models_path <p>]`.
///
/// Path flags are forwarded only when they differ from the defaults the
/// debate program assumes.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    command: Vec<String>,
    settings_path: PathBuf,
    models_path: PathBuf,
    workdir: Option<PathBuf>,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(vec!["python3".to_string(), "main.py".to_string()])
    }
}

impl ProcessInvoker {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            models_path: PathBuf::from(DEFAULT_MODELS_PATH),
            workdir: None,
        }
    }

    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = path.into();
        self
    }

    pub fn models_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.models_path = path.into();
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Full argv for `entry`, program first. Paths are passed through as
    /// raw OS strings.
    pub fn argv(&self, entry: &PlanEntry) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self.command.iter().map(OsString::from).collect();
        argv.push("--helper_type".into());
        argv.push(entry.variant.as_str().into());
        if let Some(idx) = entry.sub_index {
            argv.push("--claim_index".into());
            argv.push(idx.to_string().into());
        }
        if self.settings_path != Path::new(DEFAULT_SETTINGS_PATH) {
            argv.push("--settings_path".into());
            argv.push(self.settings_path.clone().into_os_string());
        }
        if self.models_path != Path::new(DEFAULT_MODELS_PATH) {
            argv.push("--models_path".into());
            argv.push(self.models_path.clone().into_os_string());
        }
        argv
    }
}

impl Invoker for ProcessInvoker {
    fn invoke(&self, entry: &PlanEntry) -> Result<RunOutcome, InvocationError> {
        if self.command.is_empty() {
            return Err(InvocationError::EmptyCommand);
        }
        let argv = self.argv(entry);
        let (program, args) = argv.split_first().ok_or(InvocationError::EmptyCommand)?;
        info!(msg_type = "system", command = %display_command(&argv), "Running");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().map_err(|source| InvocationError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;
        Ok(RunOutcome::from_exit(
            entry.clone(),
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

/// Shell-style rendering for log lines only; never executed.
fn display_command(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| shell_quote(&arg.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Shared flag to stop issuing plan entries that have not started yet.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Upper bound on concurrently running debate processes; 1 runs the plan
    /// strictly one entry after another.
    pub concurrency: usize,
    pub cancel: Option<CancelFlag>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub entry: PlanEntry,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Process exit status for the batch: 0 when every run succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            0
        } else {
            1
        }
    }
}

enum EntryResult {
    Succeeded,
    Failed(String),
}

/// Runs every plan entry exactly once, in plan order, and tallies the
/// results. A failing entry never stops the remaining ones.
pub fn execute_plan(plan: &[PlanEntry], invoker: &dyn Invoker, options: &ExecuteOptions) -> RunSummary {
    let started = Instant::now();
    let total = plan.len();
    let workers = options.concurrency.max(1).min(total.max(1));

    let results: Vec<EntryResult> = if workers == 1 {
        plan.iter()
            .enumerate()
            .map(|(i, entry)| run_entry(i, total, entry, invoker, options.cancel.as_ref()))
            .collect()
    } else {
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<EntryResult>>> =
            Mutex::new((0..total).map(|_| None).collect());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    // Entries are claimed in plan order; completion order is free.
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(entry) = plan.get(i) else { break };
                    let result = run_entry(i, total, entry, invoker, options.cancel.as_ref());
                    if let Ok(mut slots) = slots.lock() {
                        slots[i] = Some(result);
                    }
                });
            }
        });
        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| EntryResult::Failed("worker aborted".to_string())))
            .collect()
    };

    let mut summary = RunSummary {
        total,
        succeeded: 0,
        failed: 0,
        elapsed: Duration::ZERO,
        failures: Vec::new(),
    };
    for (entry, result) in plan.iter().zip(results) {
        match result {
            EntryResult::Succeeded => summary.succeeded += 1,
            EntryResult::Failed(reason) => {
                summary.failed += 1;
                summary.failures.push(RunFailure {
                    entry: entry.clone(),
                    reason,
                });
            }
        }
    }
    summary.elapsed = started.elapsed();
    info!(
        msg_type = "system",
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "batch finished"
    );
    summary
}

fn run_entry(
    index: usize,
    total: usize,
    entry: &PlanEntry,
    invoker: &dyn Invoker,
    cancel: Option<&CancelFlag>,
) -> EntryResult {
    let span = info_span!("debate_run", helper_type = %entry.variant, claim = ?entry.sub_index);
    let _guard = span.enter();

    if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
        warn!(msg_type = "system", "[{}/{}] Skipped {}: cancelled", index + 1, total, entry);
        return EntryResult::Failed(InvocationError::Cancelled.to_string());
    }

    info!(msg_type = "system", "[{}/{}] Running {}", index + 1, total, entry);
    match invoker.invoke(entry) {
        Ok(outcome) if outcome.succeeded => {
            info!(msg_type = "system", "\u{2713} Success: {}", entry);
            EntryResult::Succeeded
        }
        Ok(outcome) => {
            let exit = outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            warn!(
                msg_type = "system",
                exit_code = %exit,
                stderr = %outcome.stderr.trim_end(),
                "\u{2717} Failed: {}",
                entry
            );
            EntryResult::Failed(format!("exit status {}: {}", exit, last_line(&outcome.stderr)))
        }
        Err(e) => {
            warn!(msg_type = "system", error = %e, "\u{2717} Exception running {}", entry);
            EntryResult::Failed(e.to_string())
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("")
}
