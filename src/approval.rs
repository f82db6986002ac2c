//! Correlating approval signals with pending approvals.
//!
//! Every pending record and every signal carries the id of the command request
//! it belongs to. File names are only storage keys: `approval_<pending file>`
//! is tried first because it is cheap, then the correlation id, then a prefix
//! match for signals written before ids existed. More than one candidate is
//! never guessed at.

use crate::storage::{ApprovalSignal, PendingApproval};
use crate::store_manager::{file_name, Mailbox, MailboxError, MailboxStore};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SIGNAL_PREFIX: &str = "approval_";
pub const PENDING_PREFIX: &str = "pending_";
pub const REQUEST_PREFIX: &str = "cmd_";
pub const RESPONSE_PREFIX: &str = "res_";

#[derive(Debug)]
pub enum ApprovalMatch {
    Found {
        path: PathBuf,
        pending: PendingApproval,
    },
    Unmatched,
    Ambiguous(Vec<PathBuf>),
}

/// File name of the signal that resolves `pending_file`.
pub fn signal_file_name(pending_file: &str) -> String {
    format!("{}{}", SIGNAL_PREFIX, pending_file)
}

/// Correlation id for a mailbox file: its name without the `.json` extension.
pub fn correlation_id(file: &str) -> String {
    file.strip_suffix(".json").unwrap_or(file).to_string()
}

/// Resolves the pending approval a signal refers to.
pub fn find_pending(store: &MailboxStore, signal_path: &Path, signal: &ApprovalSignal) -> ApprovalMatch {
    let signal_name = file_name(signal_path);
    let target = signal_name
        .strip_prefix(SIGNAL_PREFIX)
        .unwrap_or(&signal_name)
        .to_string();

    let exact = store.dir(Mailbox::Pending).join(&target);
    if exact.exists() {
        if let Some(pending) = read_pending(store, &exact) {
            return ApprovalMatch::Found { path: exact, pending };
        }
    }

    let records = load_pending(store);

    if let Some(id) = signal.correlation_id.as_deref() {
        let by_id: Vec<_> = records
            .iter()
            .filter(|(_, p)| p.correlation_id.as_deref() == Some(id))
            .cloned()
            .collect();
        if !by_id.is_empty() {
            return settle(by_id);
        }
    }

    let stem = correlation_id(&target);
    if stem.is_empty() {
        return ApprovalMatch::Unmatched;
    }
    let by_prefix: Vec<_> = records
        .into_iter()
        .filter(|(path, _)| file_name(path).starts_with(&stem))
        .collect();
    settle(by_prefix)
}

/// The pending approval already created for a request, if any.
pub fn find_pending_for_request(store: &MailboxStore, request_file: &str) -> Option<PathBuf> {
    let id = correlation_id(request_file);
    load_pending(store)
        .into_iter()
        .find(|(_, p)| p.original_file == request_file || p.correlation_id.as_deref() == Some(id.as_str()))
        .map(|(path, _)| path)
}

fn settle(mut candidates: Vec<(PathBuf, PendingApproval)>) -> ApprovalMatch {
    match candidates.len() {
        0 => ApprovalMatch::Unmatched,
        1 => {
            let (path, pending) = candidates.remove(0);
            ApprovalMatch::Found { path, pending }
        }
        _ => ApprovalMatch::Ambiguous(candidates.into_iter().map(|(path, _)| path).collect()),
    }
}

fn load_pending(store: &MailboxStore) -> Vec<(PathBuf, PendingApproval)> {
    let paths = match store.list(Mailbox::Pending, PENDING_PREFIX) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(error = %e, "cannot list pending approvals");
            return Vec::new();
        }
    };
    paths
        .into_iter()
        .filter_map(|path| read_pending(store, &path).map(|pending| (path, pending)))
        .collect()
}

fn read_pending(store: &MailboxStore, path: &Path) -> Option<PendingApproval> {
    match store.read(path) {
        Ok(pending) => Some(pending),
        Err(e @ MailboxError::Corrupt { .. }) => {
            warn!(file = %path.display(), error = %e, "deleting corrupt pending approval");
            store.delete(path);
            None
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot read pending approval");
            None
        }
    }
}
