use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Substrings that mark a command as dangerous (matched case-insensitively).
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "dd if=/dev/zero",
    "mkfs",
    ":(){ :|:& };:", // fork bomb
    "sudo rm",
    "chmod -r 000",
    "> /dev/sda",
];

/// Characters that only mean something to a shell.
const SHELL_METACHARS: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '{', '}',
    '~', '#', '=', '%', '!', '\n',
];

const SHELL_BUILTINS: &[&str] = &[
    "cd", ".", "source", "export", "unset", "set", "alias", "unalias", "eval", "exec", "exit",
    "type", "ulimit", "umask", "read", "wait", "jobs", "fg", "bg", "history", "shopt", "trap",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Dangerous(&'static str),
}

impl Verdict {
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Verdict::Dangerous(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    TimedOut {
        limit: Duration,
    },
    LaunchFailed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub command: String,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// True when the process ran to completion, whatever its exit code.
    pub fn success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Completed { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.outcome {
            ExecutionOutcome::Completed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// How a command line will be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Direct(Vec<String>),
    Shell(String),
}

impl Invocation {
    /// Plain `program arg arg` lines run without a shell; anything that needs
    /// shell syntax or a builtin goes through `sh -c`.
    pub fn for_command(command: &str) -> Self {
        let trimmed = command.trim();
        if trimmed.contains(SHELL_METACHARS) {
            return Invocation::Shell(trimmed.to_string());
        }
        let argv: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        match argv.first() {
            Some(program) if !SHELL_BUILTINS.contains(&program.as_str()) => Invocation::Direct(argv),
            _ => Invocation::Shell(trimmed.to_string()),
        }
    }

    fn to_command(&self, shell: &str) -> Command {
        match self {
            Invocation::Direct(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Invocation::Shell(line) => {
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

pub fn classify(command: &str) -> Verdict {
    let lower = command.trim().to_lowercase();

    for pattern in DANGEROUS_PATTERNS {
        if lower.contains(pattern) {
            return Verdict::Dangerous(*pattern);
        }
    }

    if lower.contains("sudo") {
        return Verdict::Dangerous("sudo");
    }

    // Redirects into device or kernel paths
    if command.contains('>') && (command.contains("/dev/") || command.contains("/sys/")) {
        return Verdict::Dangerous("redirect to device");
    }

    Verdict::Safe
}

fn format_command(command: &str) -> String {
    // Collapse whitespace runs and drop spaces around pipes
    let mut result = String::new();
    let mut chars = command.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            while chars.peek().map_or(false, |n| n.is_whitespace()) {
                chars.next();
            }
            if chars.peek() != Some(&'|') {
                result.push(' ');
            }
        } else if c == '|' {
            result.push('|');
            while chars.peek().map_or(false, |n| n.is_whitespace()) {
                chars.next();
            }
        } else {
            result.push(c);
        }
    }

    result.trim().to_string()
}

/// SHA256 of the normalized command, so cosmetic whitespace changes hash alike.
pub fn hash_command(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format_command(command).as_bytes());
    hex::encode(hasher.finalize())
}

/// First `limit` characters of `text`, and whether anything was cut.
pub fn preview(text: &str, limit: usize) -> (String, bool) {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}

pub struct CommandExecutor {
    timeout: Duration,
    working_dir: PathBuf,
    shell: String,
}

impl CommandExecutor {
    pub fn new(timeout: Duration, working_dir: PathBuf) -> Self {
        Self {
            timeout,
            working_dir,
            shell: "sh".to_string(),
        }
    }

    pub fn from_config(config: &crate::config::ExecutorConfig) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(Duration::from_secs(config.timeout_secs), working_dir)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn execute(&self, command: &str) -> ExecutionResult {
        let start_time = Instant::now();
        let outcome = match self.run(command) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(command = %command, error = %e, "failed to launch command");
                ExecutionOutcome::LaunchFailed {
                    error: e.to_string(),
                }
            }
        };

        ExecutionResult {
            command: command.to_string(),
            outcome,
            duration_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    fn run(&self, command: &str) -> io::Result<ExecutionOutcome> {
        let invocation = Invocation::for_command(command);
        debug!(?invocation, "launching");

        let mut child = match self.spawn(&invocation) {
            // Builtins and functions only exist inside a shell
            Err(e) if e.kind() == io::ErrorKind::NotFound && matches!(invocation, Invocation::Direct(_)) => {
                debug!(command = %command, "program not found, retrying through the shell");
                self.spawn(&Invocation::Shell(command.trim().to_string()))?
            }
            other => other?,
        };

        let stdout_handle = spawn_reader(child.stdout.take());
        let stderr_handle = spawn_reader(child.stderr.take());

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let stdout = join_reader(stdout_handle);
                let stderr = join_reader(stderr_handle);
                Ok(ExecutionOutcome::Completed {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            None => {
                kill(&mut child);
                // Anything that escaped the process group may still hold the pipes.
                drop(stdout_handle);
                drop(stderr_handle);
                Ok(ExecutionOutcome::TimedOut {
                    limit: self.timeout,
                })
            }
        }
    }

    fn spawn(&self, invocation: &Invocation) -> io::Result<Child> {
        let mut cmd = invocation.to_command(&self.shell);
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd.spawn()
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>> {
    let mut reader = pipe?;
    Some(thread::spawn(move || {
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected)?;
        Ok(collected)
    }))
}

fn join_reader(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> String {
    let bytes = handle
        .and_then(|h| h.join().ok())
        .and_then(Result::ok)
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Kills the child's whole process group, then reaps the child.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            warn!(pid = child.id(), error = %e, "failed to kill process group, killing the child only");
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "failed to kill timed out command");
        }
    }
    let _ = child.wait();
}
