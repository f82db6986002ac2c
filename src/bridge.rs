//! Request processing and the executor daemon.
//!
//! ```text
//! NEW -> classify -> SAFE -> executed -> response written, request deleted
//!                 -> DANGEROUS -> pending written (request kept)
//!                      -> approve -> executed  -> response, all three files deleted
//!                      -> reject  -> cancelled -> response, all three files deleted
//!                      -> no decision -> removed by the cleanup sweep
//! ```

use crate::approval::{
    correlation_id, find_pending, find_pending_for_request, ApprovalMatch, PENDING_PREFIX,
    REQUEST_PREFIX, RESPONSE_PREFIX, SIGNAL_PREFIX,
};
use crate::config::Config;
use crate::executor::{classify, hash_command, preview, CommandExecutor, ExecutionOutcome, ExecutionResult, Verdict};
use crate::i18n::I18n;
use crate::storage::{ApprovalSignal, CommandRequest, CommandResponse, PendingApproval, PendingStatus, ResponseStatus};
use crate::store_manager::{file_name, is_mailbox_file, Mailbox, MailboxResult, MailboxStore};
use crate::watcher::{Watcher, STOP_TIMEOUT};
use anyhow::{Context, Result};
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PreviewLimits {
    pub stdout: usize,
    pub stderr: usize,
}

impl Default for PreviewLimits {
    fn default() -> Self {
        Self {
            stdout: 1000,
            stderr: 500,
        }
    }
}

/// What happened to a command request.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandDisposition {
    Executed { response: String },
    AwaitingApproval { pending: String },
    Discarded,
}

/// What happened to an approval signal.
#[derive(Debug, PartialEq, Eq)]
pub enum SignalDisposition {
    Executed { response: String },
    Cancelled { response: String },
    Refused { response: String },
    Unmatched,
    Ambiguous,
    Discarded,
}

pub struct Bridge {
    store: MailboxStore,
    executor: CommandExecutor,
    i18n: I18n,
    limits: PreviewLimits,
    // Commands run one at a time across both watchers
    exec_gate: Mutex<()>,
}

impl Bridge {
    pub fn new(store: MailboxStore, executor: CommandExecutor, i18n: I18n, limits: PreviewLimits) -> Self {
        Self {
            store,
            executor,
            i18n,
            limits,
            exec_gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config, i18n: I18n) -> Result<Self> {
        let store = MailboxStore::new(&config.mailbox.base_dir)
            .with_context(|| format!("cannot open mailbox at {}", config.mailbox.base_dir.display()))?;
        let limits = PreviewLimits {
            stdout: config.executor.stdout_preview,
            stderr: config.executor.stderr_preview,
        };
        Ok(Self::new(store, CommandExecutor::from_config(&config.executor), i18n, limits))
    }

    pub fn store(&self) -> &MailboxStore {
        &self.store
    }

    pub fn process_command_request(&self, path: &Path) -> MailboxResult<CommandDisposition> {
        let request_file = file_name(path);
        info!(file = %request_file, "processing command file");

        let request: CommandRequest = match self.store.read(path) {
            Ok(request) => request,
            Err(e) => {
                error!(file = %request_file, error = %e, "failed to read command file");
                self.store.delete(path);
                return Ok(CommandDisposition::Discarded);
            }
        };
        let command = request.command.as_str();

        if let Verdict::Dangerous(reason) = classify(command) {
            warn!(file = %request_file, command = %command, reason, "dangerous command detected");

            // A restart sees the kept request again; do not ask twice.
            if let Some(existing) = find_pending_for_request(&self.store, &request_file) {
                info!(file = %request_file, pending = %file_name(&existing), "approval already requested");
                return Ok(CommandDisposition::AwaitingApproval {
                    pending: file_name(&existing),
                });
            }

            let mut pending = PendingApproval {
                command: command.to_string(),
                message: self.i18n.t_format("pending_prompt", &[command]),
                timestamp: String::new(),
                status: PendingStatus::Waiting,
                original_file: request_file.clone(),
                user_name: request.user_name.clone(),
                correlation_id: Some(correlation_id(&request_file)),
                command_hash: Some(hash_command(command)),
                extra: Map::new(),
            };
            let name = self.store.write(Mailbox::Pending, PENDING_PREFIX, &mut pending, |p, id| {
                p.timestamp = id.to_string()
            })?;
            info!(file = %request_file, pending = %name, "created pending approval");
            return Ok(CommandDisposition::AwaitingApproval { pending: name });
        }

        info!(file = %request_file, command = %command, "executing command");
        let result = self.execute(command);
        let written = self.write_response(self.result_response(&result, "response_completed"));

        // The command has run; keeping the request would run it again.
        self.store.delete(path);
        let response = written.map_err(|e| {
            error!(file = %request_file, command = %command, "command ran but its response was lost");
            e
        })?;
        info!(file = %request_file, response = %response, "command processed and file deleted");
        Ok(CommandDisposition::Executed { response })
    }

    pub fn process_approval_signal(&self, path: &Path) -> MailboxResult<SignalDisposition> {
        let signal_file = file_name(path);
        info!(file = %signal_file, "processing approval response");

        let signal: ApprovalSignal = match self.store.read(path) {
            Ok(signal) => signal,
            Err(e) => {
                error!(file = %signal_file, error = %e, "failed to read approval file");
                self.store.delete(path);
                return Ok(SignalDisposition::Discarded);
            }
        };

        let (pending_path, pending) = match find_pending(&self.store, path, &signal) {
            ApprovalMatch::Found { path, pending } => (path, pending),
            ApprovalMatch::Unmatched => {
                warn!(file = %signal_file, "no pending file found for approval");
                self.store.delete(path);
                return Ok(SignalDisposition::Unmatched);
            }
            ApprovalMatch::Ambiguous(candidates) => {
                let names: Vec<String> = candidates.iter().map(|p| file_name(p)).collect();
                warn!(file = %signal_file, candidates = ?names, "approval matches several pending files, discarding");
                self.store.delete(path);
                return Ok(SignalDisposition::Ambiguous);
            }
        };

        let outcome = self.resolve(&signal, &pending);

        // Cleanup runs whatever the decision path produced.
        if pending.original_file.starts_with(REQUEST_PREFIX) && is_mailbox_file(&pending.original_file) {
            self.store.delete(&self.store.dir(Mailbox::Commands).join(&pending.original_file));
        } else {
            warn!(original = %pending.original_file, "pending approval names no valid request file");
        }
        self.store.delete(&pending_path);
        self.store.delete(path);
        info!(
            signal = %signal_file,
            pending = %file_name(&pending_path),
            request = %pending.original_file,
            "approval cycle finished"
        );

        outcome
    }

    fn resolve(&self, signal: &ApprovalSignal, pending: &PendingApproval) -> MailboxResult<SignalDisposition> {
        let command = pending.command.as_str();

        if !signal.approval {
            info!(command = %command, user = %signal.user_name, "command rejected by user");
            let message = if signal.user_name.is_empty() || signal.user_name == "unknown" {
                self.i18n.t("response_cancelled")
            } else {
                self.i18n.t_format("response_cancelled_by", &[&signal.user_name])
            };
            let response = CommandResponse::new(message, ResponseStatus::Cancelled).with("command", command);
            return Ok(SignalDisposition::Cancelled {
                response: self.write_response(response)?,
            });
        }

        if let Some(expected) = pending.command_hash.as_deref() {
            if hash_command(command) != expected {
                error!(command = %command, "pending command does not match its recorded hash");
                let reason = self.i18n.t("error_command_changed");
                let response = CommandResponse::new(
                    self.i18n.t_format("response_failed", &[command, &reason]),
                    ResponseStatus::Error,
                )
                .with("command", command)
                .with("error", reason);
                return Ok(SignalDisposition::Refused {
                    response: self.write_response(response)?,
                });
            }
        }

        info!(command = %command, user = %signal.user_name, "command approved, executing");
        let result = self.execute(command);
        let response = self.write_response(self.result_response(&result, "response_approved_completed"))?;
        Ok(SignalDisposition::Executed { response })
    }

    fn execute(&self, command: &str) -> ExecutionResult {
        let _gate = self.exec_gate.lock().unwrap_or_else(|e| e.into_inner());
        debug!(command = %command, timeout = ?self.executor.timeout(), "running command");
        let result = self.executor.execute(command);
        info!(
            command = %command,
            success = result.success(),
            exit_code = ?result.exit_code(),
            duration_ms = result.duration_ms,
            "command finished"
        );
        result
    }

    fn result_response(&self, result: &ExecutionResult, title_key: &str) -> CommandResponse {
        let command = result.command.as_str();
        match &result.outcome {
            ExecutionOutcome::Completed {
                stdout,
                stderr,
                exit_code,
            } => {
                let mut message = self.i18n.t_format(title_key, &[command]);
                let mut truncated = false;

                if !stdout.is_empty() {
                    let (head, cut) = preview(stdout, self.limits.stdout);
                    message.push_str(&self.i18n.t_format("response_output", &[&head]));
                    if cut {
                        message.push_str(&self.i18n.t_format(
                            "response_output_truncated",
                            &[&self.limits.stdout.to_string()],
                        ));
                    }
                    truncated |= cut;
                }

                if !stderr.is_empty() {
                    let (head, cut) = preview(stderr, self.limits.stderr);
                    message.push_str(&self.i18n.t_format("response_stderr", &[&head]));
                    if cut {
                        message.push_str(&self.i18n.t_format(
                            "response_stderr_truncated",
                            &[&self.limits.stderr.to_string()],
                        ));
                    }
                    truncated |= cut;
                }

                CommandResponse::new(message, ResponseStatus::Success)
                    .with("command", command)
                    .with("returncode", *exit_code)
                    .with("duration_ms", result.duration_ms)
                    .with("stdout_truncated", truncated)
            }
            ExecutionOutcome::TimedOut { limit } => {
                let error = self.i18n.t_format("error_timeout", &[&limit.as_secs().to_string()]);
                self.failure_response(command, error).with("timed_out", true)
            }
            ExecutionOutcome::LaunchFailed { error } => {
                let error = self.i18n.t_format("error_launch", &[error]);
                self.failure_response(command, error)
            }
        }
    }

    fn failure_response(&self, command: &str, error: String) -> CommandResponse {
        CommandResponse::new(
            self.i18n.t_format("response_failed", &[command, &error]),
            ResponseStatus::Error,
        )
        .with("command", command)
        .with("error", error)
    }

    fn write_response(&self, mut response: CommandResponse) -> MailboxResult<String> {
        let name = self
            .store
            .write(Mailbox::Responses, RESPONSE_PREFIX, &mut response, |r, id| r.timestamp = id.to_string())
            .map_err(|e| {
                error!(error = %e, "failed to write response");
                e
            })?;
        info!(response = %name, "response written");
        Ok(name)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_age: Duration,
    pub tick: Duration,
}

impl DaemonSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.mailbox.poll_interval(),
            cleanup_interval: config.mailbox.cleanup_interval(),
            max_age: config.mailbox.max_age(),
            tick: Duration::from_secs(1),
        }
    }
}

/// Runs the executor until `running` is cleared: one watcher for new command
/// files, one for approval signals, and a periodic cleanup sweep.
pub fn run_daemon(bridge: Arc<Bridge>, settings: &DaemonSettings, running: Arc<AtomicBool>) -> Result<()> {
    let commands_dir = bridge.store().dir(Mailbox::Commands);
    let responses_dir = bridge.store().dir(Mailbox::Responses);

    let for_commands = bridge.clone();
    let command_watcher = Watcher::start(&commands_dir, REQUEST_PREFIX, settings.poll_interval, move |path| {
        for_commands.process_command_request(path)?;
        Ok(())
    })
    .context("failed to start command watcher")?;

    let for_signals = bridge.clone();
    let signal_watcher = match Watcher::start(&responses_dir, SIGNAL_PREFIX, settings.poll_interval, move |path| {
        for_signals.process_approval_signal(path)?;
        Ok(())
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            command_watcher.stop(STOP_TIMEOUT);
            return Err(e).context("failed to start approval watcher");
        }
    };

    info!(
        dir = %bridge.store().base_dir().display(),
        lang = %bridge.i18n.lang(),
        "command executor started, waiting for commands"
    );

    let mut last_cleanup = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(settings.tick);
        if last_cleanup.elapsed() >= settings.cleanup_interval {
            let removed = bridge.store().cleanup(settings.max_age);
            info!(removed, "periodic cleanup finished");
            last_cleanup = Instant::now();
        }
    }

    info!("stopping command executor");
    command_watcher.stop(STOP_TIMEOUT);
    signal_watcher.stop(STOP_TIMEOUT);
    info!("command executor stopped");
    Ok(())
}

/// Adapter side: queue a command for the executor.
pub fn submit(
    store: &MailboxStore,
    command: &str,
    user_id: &str,
    user_name: &str,
    channel_id: Option<&str>,
) -> MailboxResult<String> {
    let mut request = CommandRequest {
        command: command.to_string(),
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        timestamp: String::new(),
        channel_id: channel_id.map(str::to_string),
        extra: Map::new(),
    };
    let name = store.write(Mailbox::Commands, REQUEST_PREFIX, &mut request, |r, id| {
        r.timestamp = id.to_string()
    })?;
    info!(file = %name, command = %command, user = %user_name, "command submitted");
    Ok(name)
}

/// Adapter side: record a human decision on a pending approval.
pub fn decide(
    store: &MailboxStore,
    pending_file: &str,
    approval: bool,
    user_id: &str,
    user_name: &str,
) -> MailboxResult<PathBuf> {
    let pending_path = store.dir(Mailbox::Pending).join(pending_file);
    let pending: PendingApproval = store.read(&pending_path)?;
    let signal = ApprovalSignal {
        approval,
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        timestamp: chrono::Local::now().to_rfc3339(),
        correlation_id: pending.correlation_id.clone(),
        extra: Map::new(),
    };
    let path = store.write_named(Mailbox::Responses, &crate::approval::signal_file_name(pending_file), &signal)?;
    info!(file = %file_name(&path), approval, user = %user_name, "approval decision written");
    Ok(path)
}
