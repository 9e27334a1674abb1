//! Per-ref push intents and their outcomes.

use std::fmt;

use crate::{Oid, Result};

/// Outcome of one ref update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefStatus {
    /// Not attempted yet.
    Pending,
    Ok,
    /// Lost against the stored value (stale expectation or racing writer).
    RejectedStale,
    /// Backend failure, missing objects, cancellation.
    RejectedError,
}

impl RefStatus {
    pub fn is_ok(&self) -> bool {
        *self == RefStatus::Ok
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RefStatus::RejectedStale | RefStatus::RejectedError)
    }
}

impl fmt::Display for RefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefStatus::Pending => "pending",
            RefStatus::Ok => "ok",
            RefStatus::RejectedStale => "rejected-stale",
            RefStatus::RejectedError => "rejected-error",
        };
        f.write_str(name)
    }
}

/// One push intent: move `name` from `old` to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Fully qualified ref name.
    pub name: String,
    /// Value the client believes the remote holds; `None` for a new ref.
    pub old: Option<Oid>,
    /// Value to publish; `None` deletes the ref.
    pub new: Option<Oid>,
    /// Skip the expected-old check.
    pub force: bool,
    pub status: RefStatus,
    /// Reason for a rejection.
    pub message: Option<String>,
}

impl RefUpdate {
    /// Create or move a ref.
    pub fn new(name: &str, old: Option<Oid>, new: Oid) -> Self {
        RefUpdate {
            name: name.to_string(),
            old,
            new: Some(new),
            force: false,
            status: RefStatus::Pending,
            message: None,
        }
    }

    /// Delete a ref currently believed to point at `old`.
    pub fn delete(name: &str, old: Option<Oid>) -> Self {
        RefUpdate {
            name: name.to_string(),
            old,
            new: None,
            force: false,
            status: RefStatus::Pending,
            message: None,
        }
    }

    /// Build an update from raw hex ids; an all-zero or empty new id is a
    /// delete, as on git's wire.
    pub fn from_hex(name: &str, old: &str, new: &str) -> Result<Self> {
        let old = parse_optional(old)?;
        let new = parse_optional(new)?;
        Ok(RefUpdate {
            name: name.to_string(),
            old,
            new,
            force: false,
            status: RefStatus::Pending,
            message: None,
        })
    }

    /// Mark the update as forced.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }

    pub(crate) fn accept(&mut self) {
        self.status = RefStatus::Ok;
        self.message = None;
    }

    pub(crate) fn reject(&mut self, status: RefStatus, message: impl Into<String>) {
        self.status = status;
        self.message = Some(message.into());
    }

    /// Status line in git remote-helper push format.
    pub fn report_line(&self) -> String {
        match self.status {
            RefStatus::Ok => format!("ok {}", self.name),
            RefStatus::Pending => format!("error {} not attempted", self.name),
            RefStatus::RejectedStale | RefStatus::RejectedError => format!(
                "error {} {}",
                self.name,
                self.message.as_deref().unwrap_or(match self.status {
                    RefStatus::RejectedStale => "stale info",
                    _ => "failed",
                })
            ),
        }
    }
}

fn parse_optional(hex: &str) -> Result<Option<Oid>> {
    let hex = hex.trim();
    if hex.is_empty() {
        return Ok(None);
    }
    let oid = Oid::from_hex(hex)?;
    Ok(if oid.is_zero() { None } else { Some(oid) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO: &str = "0000000000000000000000000000000000000000";
    const A1: &str = "a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";

    #[test]
    fn test_zero_new_is_delete() {
        let update = RefUpdate::from_hex("refs/heads/main", A1, ZERO).unwrap();
        assert!(update.is_delete());
        assert_eq!(update.old.unwrap().as_str(), A1);

        let update = RefUpdate::from_hex("refs/heads/main", "", A1).unwrap();
        assert!(update.old.is_none());
        assert!(!update.is_delete());
    }

    #[test]
    fn test_invalid_hex() {
        assert!(RefUpdate::from_hex("refs/heads/main", "", "xyz").is_err());
    }

    #[test]
    fn test_report_lines() {
        let mut update = RefUpdate::from_hex("refs/heads/main", "", A1).unwrap();
        update.accept();
        assert_eq!(update.report_line(), "ok refs/heads/main");

        update.reject(RefStatus::RejectedStale, "fetch first");
        assert_eq!(update.report_line(), "error refs/heads/main fetch first");
        assert!(update.status.is_rejected());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RefStatus::RejectedStale.to_string(), "rejected-stale");
        assert_eq!(RefStatus::Ok.to_string(), "ok");
    }
}
