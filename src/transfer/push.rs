//! Push: store incoming objects, then publish refs by compare-and-swap.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{
    CancellationToken, ObjectGraph, PackTransfer, PackedObject, Phase, PushReport, PushRequest,
    RefStatus, RefUpdate, TransferState,
};
use crate::backend::VersionToken;
use crate::config::PackStorage;
use crate::refs::{validate_ref_name, RefRecord};
use crate::{Error, Oid, Result};

const CANCELLED: &str = "cancelled";

/// A ref change that was applied and may need undoing.
#[derive(Debug)]
struct Applied {
    name: String,
    /// Value before the push, `None` if the ref was created.
    prior: Option<RefRecord>,
    /// Version written by the push, `None` if the ref was deleted.
    version: Option<VersionToken>,
}

impl<G: ObjectGraph> PackTransfer<G> {
    /// Apply a push.
    ///
    /// Each ref gets its own status; one ref failing never aborts the
    /// others. In atomic mode every swap is attempted and, if any fails, the
    /// applied ones are swapped back to their prior values; a failed swap
    /// back is the only per-ref failure that makes this return an error.
    ///
    /// Once `cancel` is observed no further backend calls are issued, the
    /// remaining refs are rejected and already applied refs are kept.
    pub fn push(&self, request: PushRequest, cancel: &CancellationToken) -> Result<PushReport> {
        let mut phase = Phase::new("push");
        let atomic = request.atomic || self.config.atomic;
        let mut updates = request.updates;

        for update in updates.iter_mut() {
            if let Err(e) = validate_ref_name(&update.name) {
                update.reject(RefStatus::RejectedError, e.to_string());
            }
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled(updates, phase, None));
        }

        phase.enter(TransferState::Transferring);
        let pack = match self.store_pack(&request.pack, cancel) {
            Ok(pack) => pack,
            Err(Error::Cancelled) => return Ok(self.cancelled(updates, phase, None)),
            Err(e @ (Error::Graph(_) | Error::InvalidIdentifier(_))) => {
                phase.enter(TransferState::Failed);
                return Err(e);
            }
            Err(e) => {
                // Objects may be incomplete; publishing any ref could dangle.
                warn!(error = %e, "object upload failed, rejecting all ref updates");
                let reason = format!("object upload failed: {}", e);
                for update in updates.iter_mut().filter(|u| u.status == RefStatus::Pending) {
                    update.reject(RefStatus::RejectedError, reason.clone());
                }
                None
            }
        };

        for update in updates.iter_mut().filter(|u| u.status == RefStatus::Pending) {
            if let Some(new) = update.new.clone() {
                match self.objects.contains(&new) {
                    Ok(true) => {}
                    Ok(false) => update.reject(RefStatus::RejectedError, format!("missing object {}", new)),
                    Err(e) => update.reject(RefStatus::RejectedError, e.to_string()),
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled(updates, phase, pack));
        }

        phase.enter(TransferState::Finalizing);
        let cancelled = if atomic {
            match self.apply_atomic(&mut updates, cancel) {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    phase.enter(TransferState::Failed);
                    return Err(e);
                }
            }
        } else {
            self.apply_each(&mut updates, cancel)
        };

        self.init_head(&updates);

        phase.enter(if cancelled {
            TransferState::Failed
        } else {
            TransferState::Done
        });
        let applied = updates.iter().filter(|u| u.status.is_ok()).count();
        info!(
            refs = updates.len(),
            applied,
            rejected = updates.len() - applied,
            atomic,
            cancelled,
            "push complete"
        );

        Ok(PushReport {
            updates,
            state: phase.state(),
            cancelled,
            pack,
        })
    }

    /// Unpack and store every object of the pack that the store lacks, plus
    /// the pack itself when packs are retained.
    fn store_pack(&self, pack: &[u8], cancel: &CancellationToken) -> Result<Option<Oid>> {
        if pack.is_empty() {
            return Ok(None);
        }

        let objects = self.graph.unpack_objects(pack)?;
        debug!(objects = objects.len(), bytes = pack.len(), "pack unpacked");

        let stored = self.pool.install(|| {
            objects
                .par_iter()
                .map(|object| self.store_object(object, cancel))
                .collect::<Result<Vec<bool>>>()
        })?;
        debug!(
            uploaded = stored.iter().filter(|s| **s).count(),
            skipped = stored.iter().filter(|s| !**s).count(),
            "objects stored"
        );

        if self.config.pack_storage != PackStorage::Retain {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let pack_oid = Oid::from_content(pack);
        if !self.objects.exists(&pack_oid, pack.len() as u64)? {
            self.objects.put_bytes(&pack_oid, pack)?;
        }
        debug!(pack = %pack_oid, "pack retained");
        Ok(Some(pack_oid))
    }

    /// Returns whether the object had to be uploaded.
    fn store_object(&self, object: &PackedObject, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.objects.exists(&object.oid, object.size())? {
            return Ok(false);
        }
        self.objects.put_bytes(&object.oid, &object.data)?;
        Ok(true)
    }

    /// Default mode: refs are independent and swapped concurrently.
    ///
    /// Returns whether cancellation was observed.
    fn apply_each(&self, updates: &mut [RefUpdate], cancel: &CancellationToken) -> bool {
        let observed = AtomicBool::new(false);
        self.pool.install(|| {
            updates
                .par_iter_mut()
                .filter(|u| u.status == RefStatus::Pending)
                .for_each(|update| {
                    if cancel.is_cancelled() {
                        observed.store(true, Ordering::SeqCst);
                        update.reject(RefStatus::RejectedError, CANCELLED);
                        return;
                    }
                    self.apply(update);
                });
        });
        observed.load(Ordering::SeqCst)
    }

    /// All-or-nothing mode: refs are swapped one at a time, and undone in
    /// reverse order if any of them fails.
    fn apply_atomic(&self, updates: &mut [RefUpdate], cancel: &CancellationToken) -> Result<bool> {
        if updates.iter().any(|u| u.status.is_rejected()) {
            for update in updates.iter_mut().filter(|u| u.status == RefStatus::Pending) {
                update.reject(RefStatus::RejectedError, "atomic push failed");
            }
            return Ok(false);
        }

        let mut applied = Vec::new();
        for i in 0..updates.len() {
            if cancel.is_cancelled() {
                for update in updates[i..].iter_mut() {
                    update.reject(RefStatus::RejectedError, CANCELLED);
                }
                return Ok(true);
            }
            if let Some(change) = self.apply(&mut updates[i]) {
                applied.push(change);
            }
        }

        if updates.iter().all(|u| u.status.is_ok()) {
            return Ok(false);
        }

        warn!(applied = applied.len(), "atomic push failed, rolling back");
        let mut failure = None;
        for change in applied.iter().rev() {
            if let Err(e) = self.roll_back(change) {
                warn!(name = %change.name, error = %e, "rollback failed");
                if failure.is_none() {
                    failure = Some(Error::RollbackFailed {
                        refname: change.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for update in updates.iter_mut().filter(|u| u.status.is_ok()) {
            update.reject(RefStatus::RejectedError, "atomic push failed");
        }
        Ok(false)
    }

    /// Check and swap one ref, recording the outcome on `update`.
    fn apply(&self, update: &mut RefUpdate) -> Option<Applied> {
        let name = update.name.clone();
        // A delete without an expected id removes whatever the ref points at.
        let blind_delete = update.new.is_none() && update.old.is_none();

        let force = if update.force || blind_delete {
            match self.refs.is_protected(&name) {
                Ok(true) => {
                    debug!(name = %name, "ref is protected, ignoring force");
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    update.reject(RefStatus::RejectedError, e.to_string());
                    return None;
                }
            }
        } else {
            false
        };

        let current = match self.refs.try_read(&name) {
            Ok(current) => current,
            Err(e) => {
                update.reject(RefStatus::RejectedError, e.to_string());
                return None;
            }
        };

        if !force {
            let stale = match (&update.old, &current) {
                (None, None) => None,
                (Some(old), Some(current)) if *old == current.oid => None,
                (None, Some(_)) if blind_delete => Some("ref is protected"),
                (None, Some(_)) => Some("already exists"),
                _ => Some("stale info"),
            };
            if let Some(reason) = stale {
                warn!(name = %name, reason, "ref update rejected");
                update.reject(RefStatus::RejectedStale, reason);
                return None;
            }
        }

        let result = match (&update.new, &current) {
            (Some(new), Some(current)) if *new == current.oid => {
                update.accept();
                return None;
            }
            (Some(new), Some(current)) => self
                .refs
                .compare_and_swap(&name, Some(&current.version), new)
                .map(Some),
            (Some(new), None) => self.refs.compare_and_swap(&name, None, new).map(Some),
            (None, Some(current)) => self.refs.delete(&name, &current.version).map(|()| None),
            (None, None) => {
                update.reject(RefStatus::RejectedStale, "no such ref");
                return None;
            }
        };

        match result {
            Ok(version) => {
                debug!(name = %name, "ref updated");
                update.accept();
                Some(Applied {
                    name,
                    prior: current,
                    version,
                })
            }
            Err(e @ (Error::Conflict(_) | Error::NotFound(_))) => {
                warn!(name = %name, error = %e, "ref update lost a race");
                update.reject(RefStatus::RejectedStale, "stale info");
                None
            }
            Err(e) => {
                warn!(name = %name, error = %e, "ref update failed");
                update.reject(RefStatus::RejectedError, e.to_string());
                None
            }
        }
    }

    /// Swap an applied change back to the prior value.
    fn roll_back(&self, change: &Applied) -> Result<()> {
        warn!(name = %change.name, "rolling back ref");
        match (&change.prior, &change.version) {
            (Some(prior), Some(version)) => {
                self.refs
                    .compare_and_swap(&change.name, Some(version), &prior.oid)?;
            }
            (Some(prior), None) => {
                self.refs.compare_and_swap(&change.name, None, &prior.oid)?;
            }
            (None, Some(version)) => self.refs.delete(&change.name, version)?,
            (None, None) => {}
        }
        Ok(())
    }

    /// Point a missing remote HEAD at the first branch pushed.
    fn init_head(&self, updates: &[RefUpdate]) {
        let branch = updates
            .iter()
            .find(|u| u.status.is_ok() && u.new.is_some() && u.name.starts_with("refs/heads/"));
        if let Some(branch) = branch {
            if let Err(e) = self.refs.init_head(&branch.name) {
                warn!(error = %e, "could not initialise remote HEAD");
            }
        }
    }

    fn cancelled(&self, mut updates: Vec<RefUpdate>, mut phase: Phase, pack: Option<Oid>) -> PushReport {
        for update in updates.iter_mut().filter(|u| u.status == RefStatus::Pending) {
            update.reject(RefStatus::RejectedError, CANCELLED);
        }
        phase.enter(TransferState::Failed);
        info!(refs = updates.len(), "push cancelled");
        PushReport {
            updates,
            state: phase.state(),
            cancelled: true,
            pack,
        }
    }
}
