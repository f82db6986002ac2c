//! Polling directory watcher.
//!
//! A [`Watcher`] owns one background thread that asks a [`ChangeSource`] for
//! newly appeared mailbox files and hands each one to a handler exactly once.

use crate::store_manager::{file_name, list_dir, MailboxResult};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Produces files that have appeared since the previous call.
pub trait ChangeSource: Send {
    fn poll(&mut self) -> MailboxResult<Vec<PathBuf>>;
    fn describe(&self) -> String;
}

/// Lists a directory on every poll and diffs it against the names already seen.
/// Names are forgotten once they disappear from the directory.
pub struct PollingSource {
    dir: PathBuf,
    prefix: String,
    seen: HashSet<String>,
}

impl PollingSource {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            seen: HashSet::new(),
        }
    }
}

impl ChangeSource for PollingSource {
    fn poll(&mut self) -> MailboxResult<Vec<PathBuf>> {
        let present = list_dir(&self.dir, &self.prefix)?;
        let names: HashSet<String> = present.iter().map(|p| file_name(p)).collect();
        self.seen.retain(|name| names.contains(name));

        let mut fresh = Vec::new();
        for path in present {
            if self.seen.insert(file_name(&path)) {
                fresh.push(path);
            }
        }
        Ok(fresh)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

pub struct Watcher {
    label: String,
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watcher {
    /// Polls `dir` for files named `<prefix>*.json` every `interval`.
    pub fn start<H>(dir: &Path, prefix: &str, interval: Duration, handler: H) -> std::io::Result<Self>
    where
        H: FnMut(&Path) -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_source(PollingSource::new(dir, prefix), interval, handler)
    }

    pub fn with_source<S, H>(mut source: S, interval: Duration, mut handler: H) -> std::io::Result<Self>
    where
        S: ChangeSource + 'static,
        H: FnMut(&Path) -> anyhow::Result<()> + Send + 'static,
    {
        let label = source.describe();
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = mpsc::channel();

        let flag = running.clone();
        let thread_label = label.clone();
        let handle = thread::Builder::new()
            .name(format!("watch:{}", label))
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    match source.poll() {
                        Ok(paths) => {
                            for path in paths {
                                if !flag.load(Ordering::SeqCst) {
                                    break;
                                }
                                dispatch(&mut handler, &path);
                            }
                        }
                        Err(e) => warn!(dir = %thread_label, error = %e, "watch loop error"),
                    }
                    nap(interval, &flag);
                }
                let _ = done_tx.send(());
            })?;

        info!(dir = %label, "started watching");
        Ok(Self {
            label,
            running,
            done,
            handle: Some(handle),
        })
    }

    /// Asks the loop to exit and waits up to `timeout` for it. Returns false if
    /// the thread had to be abandoned.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let stopped = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        };
        if stopped {
            info!(dir = %self.label, "stopped watching");
        } else {
            warn!(dir = %self.label, "watcher did not stop in time, abandoning it");
        }
        stopped
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn dispatch<H>(handler: &mut H, path: &Path)
where
    H: FnMut(&Path) -> anyhow::Result<()>,
{
    debug!(file = %path.display(), "new file");
    match panic::catch_unwind(AssertUnwindSafe(|| handler(path))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(file = %path.display(), error = %format!("{e:#}"), "handler failed"),
        Err(_) => error!(file = %path.display(), "handler panicked"),
    }
}

fn nap(interval: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_STEP.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TICK: Duration = Duration::from_millis(50);

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn polling_source_reports_each_file_once() {
        let tmp = TempDir::new().unwrap();
        let mut source = PollingSource::new(tmp.path(), "cmd_");
        fs::write(tmp.path().join("cmd_1.json"), "{}").unwrap();
        fs::write(tmp.path().join("res_1.json"), "{}").unwrap();

        assert_eq!(source.poll().unwrap(), vec![tmp.path().join("cmd_1.json")]);
        assert!(source.poll().unwrap().is_empty());

        fs::write(tmp.path().join("cmd_2.json"), "{}").unwrap();
        assert_eq!(source.poll().unwrap(), vec![tmp.path().join("cmd_2.json")]);
    }

    #[test]
    fn polling_source_forgets_deleted_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cmd_1.json");
        let mut source = PollingSource::new(tmp.path(), "");
        fs::write(&path, "{}").unwrap();
        assert_eq!(source.poll().unwrap().len(), 1);

        fs::remove_file(&path).unwrap();
        assert!(source.poll().unwrap().is_empty());

        fs::write(&path, "{}").unwrap();
        assert_eq!(source.poll().unwrap(), vec![path]);
    }

    #[test]
    fn polling_source_reports_in_name_order() {
        let tmp = TempDir::new().unwrap();
        for name in ["cmd_3.json", "cmd_1.json", "cmd_2.json"] {
            fs::write(tmp.path().join(name), "{}").unwrap();
        }
        let mut source = PollingSource::new(tmp.path(), "cmd_");
        let names: Vec<String> = source.poll().unwrap().iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["cmd_1.json", "cmd_2.json", "cmd_3.json"]);
    }

    #[test]
    fn handler_fires_once_even_when_it_deletes_the_file() {
        let tmp = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let watcher = Watcher::start(tmp.path(), "cmd_", TICK, move |path| {
            seen.lock().unwrap().push(file_name(path));
            fs::remove_file(path)?;
            Ok(())
        })
        .unwrap();

        let path = tmp.path().join("cmd_1.json");
        fs::write(&path, "{}").unwrap();
        assert!(wait_for(|| !path.exists()));
        thread::sleep(TICK * 4);

        assert!(watcher.stop(STOP_TIMEOUT));
        assert_eq!(*calls.lock().unwrap(), vec!["cmd_1.json".to_string()]);
    }

    #[test]
    fn file_written_mid_interval_is_seen_within_one_interval() {
        let tmp = TempDir::new().unwrap();
        let interval = Duration::from_millis(200);
        let (seen_tx, seen) = mpsc::channel();
        let watcher = Watcher::start(tmp.path(), "cmd_", interval, move |_| {
            let _ = seen_tx.send(Instant::now());
            Ok(())
        })
        .unwrap();

        thread::sleep(interval + interval / 2);
        let written = Instant::now();
        fs::write(tmp.path().join("cmd_1.json"), "{}").unwrap();

        let handled = seen.recv_timeout(Duration::from_secs(5)).unwrap();
        let delay = handled.duration_since(written);
        assert!(delay <= interval + TICK * 2, "took {delay:?}");
        assert!(watcher.stop(STOP_TIMEOUT));
    }

    #[test]
    fn failing_handler_does_not_stop_the_loop_or_retry() {
        let tmp = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let watcher = Watcher::start(tmp.path(), "", TICK, move |path| {
            let name = file_name(path);
            seen.lock().unwrap().push(name.clone());
            match name.as_str() {
                "a_1.json" => anyhow::bail!("boom"),
                "b_1.json" => panic!("handler panic"),
                _ => Ok(()),
            }
        })
        .unwrap();

        fs::write(tmp.path().join("a_1.json"), "{}").unwrap();
        fs::write(tmp.path().join("b_1.json"), "{}").unwrap();
        assert!(wait_for(|| calls.lock().unwrap().len() >= 2));
        fs::write(tmp.path().join("c_1.json"), "{}").unwrap();
        assert!(wait_for(|| calls.lock().unwrap().len() >= 3));
        thread::sleep(TICK * 4);

        assert!(watcher.stop(STOP_TIMEOUT));
        assert_eq!(*calls.lock().unwrap(), vec!["a_1.json", "b_1.json", "c_1.json"]);
    }

    #[test]
    fn stop_abandons_a_stuck_handler() {
        let tmp = TempDir::new().unwrap();
        let (entered_tx, entered) = mpsc::channel();
        let watcher = Watcher::start(tmp.path(), "", TICK, move |_| {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_secs(2));
            Ok(())
        })
        .unwrap();

        fs::write(tmp.path().join("slow_1.json"), "{}").unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!watcher.stop(Duration::from_millis(100)));
    }

    #[test]
    fn missing_directory_keeps_polling() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("later");
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let watcher = Watcher::start(&dir, "", TICK, move |_| {
            *seen.lock().unwrap() += 1;
            Ok(())
        })
        .unwrap();

        thread::sleep(TICK * 2);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("cmd_1.json"), "{}").unwrap();
        assert!(wait_for(|| *calls.lock().unwrap() == 1));
        assert!(watcher.stop(STOP_TIMEOUT));
    }
}
