use chrono::{Local, NaiveDateTime, TimeZone, Timelike};
use fs2::FileExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

const ID_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const WRITE_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize record for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("mailbox io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type MailboxResult<T> = std::result::Result<T, MailboxError>;

/// The three directories that make up the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mailbox {
    Commands,
    Responses,
    Pending,
}

impl Mailbox {
    pub const ALL: [Mailbox; 3] = [Mailbox::Commands, Mailbox::Responses, Mailbox::Pending];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Mailbox::Commands => "commands",
            Mailbox::Responses => "responses",
            Mailbox::Pending => "pending",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MailboxCounts {
    pub commands: usize,
    pub responses: usize,
    pub pending: usize,
}

/// Mailbox file names: a lowercase kind prefix, an underscore, then the rest.
/// Dotfiles (in-flight temp files) never match.
pub fn is_mailbox_file(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z]+_[A-Za-z0-9_.-]+\.json$").expect("valid pattern"))
        .is_match(name)
}

/// Parses the local time encoded in a mailbox id (`20250101_120000_000001`).
pub fn parse_id(id: &str) -> Option<chrono::DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(id, ID_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct MailboxStore {
    base_dir: PathBuf,
    last_id: Mutex<Option<NaiveDateTime>>,
}

impl MailboxStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> MailboxResult<Self> {
        let base_dir = base_dir.into();
        for mailbox in Mailbox::ALL {
            let dir = base_dir.join(mailbox.dir_name());
            fs::create_dir_all(&dir).map_err(|source| MailboxError::Io { path: dir, source })?;
        }
        Ok(Self {
            base_dir,
            last_id: Mutex::new(None),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn dir(&self, mailbox: Mailbox) -> PathBuf {
        self.base_dir.join(mailbox.dir_name())
    }

    /// Next id for this store: local time to the microsecond, strictly increasing.
    pub fn next_id(&self) -> String {
        let now = Local::now().naive_local();
        let mut now = now.with_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now);
        let mut last = self.last_id.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now.format(ID_FORMAT).to_string()
    }

    /// Writes `payload` as `<prefix><id>.json` and returns the file name.
    ///
    /// The record is written to a temp file in the same directory, synced, and
    /// renamed into place without clobbering, so readers never see a partial file.
    /// `set_timestamp` receives the generated id before serialization.
    pub fn write<T, F>(
        &self,
        mailbox: Mailbox,
        prefix: &str,
        payload: &mut T,
        mut set_timestamp: F,
    ) -> MailboxResult<String>
    where
        T: Serialize,
        F: FnMut(&mut T, &str),
    {
        let dir = self.dir(mailbox);
        let mut last_err = None;
        for _ in 0..WRITE_ATTEMPTS {
            let id = self.next_id();
            set_timestamp(payload, &id);
            let name = format!("{}{}.json", prefix, id);
            match self.write_file(&dir.join(&name), payload) {
                Ok(()) => return Ok(name),
                Err(MailboxError::Write { path, source }) if source.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(file = %path.display(), "mailbox id already taken, retrying");
                    last_err = Some(MailboxError::Write { path, source });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| MailboxError::Write {
            path: dir,
            source: io::Error::new(io::ErrorKind::Other, "no free mailbox id"),
        }))
    }

    /// Writes `payload` under an exact file name; fails if the name is taken.
    pub fn write_named<T: Serialize>(
        &self,
        mailbox: Mailbox,
        name: &str,
        payload: &T,
    ) -> MailboxResult<PathBuf> {
        let path = self.dir(mailbox).join(name);
        self.write_file(&path, payload)?;
        Ok(path)
    }

    fn write_file<T: Serialize>(&self, path: &Path, payload: &T) -> MailboxResult<()> {
        let bytes = serde_json::to_vec_pretty(payload).map_err(|source| MailboxError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let write_err = |source: io::Error| MailboxError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(write_err)?;
        temp.as_file().lock_exclusive().map_err(write_err)?;
        temp.write_all(&bytes).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        let file = temp
            .persist_noclobber(path)
            .map_err(|e| write_err(e.error))?;
        let _ = file.unlock();
        Ok(())
    }

    /// Reads and parses a record under a shared lock.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> MailboxResult<T> {
        let read_err = |source: io::Error| MailboxError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::File::open(path).map_err(read_err)?;
        file.lock_shared().map_err(read_err)?;
        let mut content = String::new();
        let read = file.read_to_string(&mut content);
        let _ = file.unlock();
        read.map_err(read_err)?;

        serde_json::from_str(&content).map_err(|source| MailboxError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Removes a record. Returns whether a file was actually removed; a missing
    /// file is not an error.
    pub fn delete(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to delete mailbox file");
                false
            }
        }
    }

    /// Mailbox files in `mailbox` whose name starts with `prefix`, sorted by name.
    pub fn list(&self, mailbox: Mailbox, prefix: &str) -> MailboxResult<Vec<PathBuf>> {
        list_dir(&self.dir(mailbox), prefix)
    }

    /// The lexicographically first (oldest) readable record.
    pub fn oldest<T: DeserializeOwned>(
        &self,
        mailbox: Mailbox,
        prefix: &str,
    ) -> MailboxResult<Option<(PathBuf, T)>> {
        match self.list(mailbox, prefix)?.into_iter().next() {
            Some(path) => {
                let payload = self.read(&path)?;
                Ok(Some((path, payload)))
            }
            None => Ok(None),
        }
    }

    /// Deletes every mailbox file last modified more than `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for mailbox in Mailbox::ALL {
            let entries = match self.list(mailbox, "") {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "cleanup skipped {}", mailbox.dir_name());
                    continue;
                }
            };
            for path in entries {
                let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if modified < cutoff && self.delete(&path) {
                    info!(file = %path.display(), "cleaned up old file");
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn counts(&self) -> MailboxResult<MailboxCounts> {
        Ok(MailboxCounts {
            commands: self.list(Mailbox::Commands, "")?.len(),
            responses: self.list(Mailbox::Responses, "")?.len(),
            pending: self.list(Mailbox::Pending, "")?.len(),
        })
    }
}

pub fn list_dir(dir: &Path, prefix: &str) -> MailboxResult<Vec<PathBuf>> {
    let io_err = |source: io::Error| MailboxError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix) && is_mailbox_file(name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CommandRequest, CommandResponse, ResponseStatus};
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;

    fn store() -> (TempDir, MailboxStore) {
        let tmp = TempDir::new().unwrap();
        let store = MailboxStore::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn age(path: &Path, by: Duration) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn creates_all_directories() {
        let (tmp, _store) = store();
        for mailbox in Mailbox::ALL {
            assert!(tmp.path().join(mailbox.dir_name()).is_dir());
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let (_tmp, store) = store();
        let ids: Vec<String> = (0..200).map(|_| store.next_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(parse_id(&ids[0]).is_some());
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_tmp, store) = store();
        let mut payload: Map<String, Value> = serde_json::from_value(json!({
            "command": "ls -la",
            "nested": {"a": [1, 2, 3], "b": null},
            "text": "日本語"
        }))
        .unwrap();
        let name = store
            .write(Mailbox::Commands, "cmd_", &mut payload, |_, _| {})
            .unwrap();
        assert!(name.starts_with("cmd_") && name.ends_with(".json"));

        let back: Map<String, Value> = store.read(&store.dir(Mailbox::Commands).join(&name)).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn write_stamps_timestamp_with_id() {
        let (_tmp, store) = store();
        let mut res = CommandResponse::new("hi".into(), ResponseStatus::Success);
        let name = store
            .write(Mailbox::Responses, "res_", &mut res, |r, id| r.timestamp = id.to_string())
            .unwrap();
        assert_eq!(name, format!("res_{}.json", res.timestamp));
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let (_tmp, store) = store();
        for _ in 0..5 {
            let mut v = json!({"k": 1});
            store.write(Mailbox::Pending, "pending_", &mut v, |_, _| {}).unwrap();
        }
        let all: Vec<_> = fs::read_dir(store.dir(Mailbox::Pending)).unwrap().collect();
        assert_eq!(all.len(), 5);
        assert_eq!(store.list(Mailbox::Pending, "pending_").unwrap().len(), 5);
    }

    #[test]
    fn write_named_refuses_to_clobber() {
        let (_tmp, store) = store();
        store.write_named(Mailbox::Responses, "approval_pending_x.json", &json!({"approval": true})).unwrap();
        let err = store
            .write_named(Mailbox::Responses, "approval_pending_x.json", &json!({"approval": false}))
            .unwrap_err();
        assert!(matches!(err, MailboxError::Write { .. }));
    }

    #[test]
    fn write_to_missing_directory_fails() {
        let (tmp, store) = store();
        fs::remove_dir_all(tmp.path().join("commands")).unwrap();
        let mut v = json!({"command": "ls"});
        let err = store.write(Mailbox::Commands, "cmd_", &mut v, |_, _| {}).unwrap_err();
        assert!(matches!(err, MailboxError::Write { .. }));
    }

    #[test]
    fn read_reports_corrupt_json() {
        let (_tmp, store) = store();
        let path = store.dir(Mailbox::Commands).join("cmd_bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = store.read::<CommandRequest>(&path).unwrap_err();
        assert!(matches!(err, MailboxError::Corrupt { .. }));
    }

    #[test]
    fn read_missing_file_is_a_read_error() {
        let (_tmp, store) = store();
        let path = store.dir(Mailbox::Commands).join("cmd_gone.json");
        assert!(matches!(store.read::<Value>(&path), Err(MailboxError::Read { .. })));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, store) = store();
        let path = store.dir(Mailbox::Responses).join("res_1.json");
        fs::write(&path, "{}").unwrap();
        assert!(store.delete(&path));
        assert!(!store.delete(&path));
        assert!(!store.delete(&path));
    }

    #[test]
    fn oldest_is_lexicographically_first() {
        let (_tmp, store) = store();
        let dir = store.dir(Mailbox::Commands);
        fs::write(dir.join("cmd_20250101_120000_000002.json"), r#"{"command":"b"}"#).unwrap();
        fs::write(dir.join("cmd_20250101_120000_000001.json"), r#"{"command":"a"}"#).unwrap();
        fs::write(dir.join("other_20240101_000000_000000.json"), r#"{"command":"z"}"#).unwrap();

        let (path, req): (PathBuf, CommandRequest) = store.oldest(Mailbox::Commands, "cmd_").unwrap().unwrap();
        assert_eq!(file_name(&path), "cmd_20250101_120000_000001.json");
        assert_eq!(req.command, "a");
    }

    #[test]
    fn oldest_of_empty_mailbox_is_none() {
        let (_tmp, store) = store();
        assert!(store.oldest::<Value>(Mailbox::Pending, "pending_").unwrap().is_none());
    }

    #[test]
    fn cleanup_removes_only_old_files() {
        let (_tmp, store) = store();
        let old_cmd = store.dir(Mailbox::Commands).join("cmd_old.json");
        let old_pending = store.dir(Mailbox::Pending).join("pending_old.json");
        let old_res = store.dir(Mailbox::Responses).join("res_old.json");
        let fresh = store.dir(Mailbox::Pending).join("pending_new.json");
        for p in [&old_cmd, &old_pending, &old_res, &fresh] {
            fs::write(p, "{}").unwrap();
        }
        for p in [&old_cmd, &old_pending, &old_res] {
            age(p, Duration::from_secs(25 * 3600));
        }
        age(&fresh, Duration::from_secs(3600));

        let removed = store.cleanup(Duration::from_secs(24 * 3600));
        assert_eq!(removed, 3);
        assert!(!old_cmd.exists() && !old_pending.exists() && !old_res.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn counts_each_directory() {
        let (_tmp, store) = store();
        fs::write(store.dir(Mailbox::Commands).join("cmd_1.json"), "{}").unwrap();
        fs::write(store.dir(Mailbox::Commands).join("cmd_2.json"), "{}").unwrap();
        fs::write(store.dir(Mailbox::Pending).join("pending_1.json"), "{}").unwrap();
        fs::write(store.dir(Mailbox::Commands).join(".tmp123.tmp"), "{}").unwrap();
        assert_eq!(
            store.counts().unwrap(),
            MailboxCounts { commands: 2, responses: 0, pending: 1 }
        );
    }

    #[test]
    fn mailbox_file_pattern() {
        assert!(is_mailbox_file("cmd_20250101_120000_000001.json"));
        assert!(is_mailbox_file("approval_pending_20250101_120000_000001.json"));
        assert!(!is_mailbox_file(".cmd_x.json"));
        assert!(!is_mailbox_file(".tmpAbc.tmp"));
        assert!(!is_mailbox_file("notes.txt"));
    }
}
