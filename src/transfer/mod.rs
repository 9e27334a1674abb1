//! Fetch and push against a bucket-backed repository.
//!
//! A transfer moves through `Negotiating -> Transferring -> Finalizing` and
//! ends in `Done` or `Failed`. Fetch computes the object closure and reads
//! every object from the store; push stores the incoming objects first and
//! only then publishes refs, so a ref never points at an object the store
//! cannot produce.
//!
//! Per-object reads and writes, and per-ref swaps in the default mode, run
//! on a bounded worker pool. No in-process lock is held across a backend
//! call; writers coordinate only through the backend's conditional writes.

mod graph;
mod push;
mod update;

pub use graph::{ObjectGraph, PackedObject};
pub use update::{RefStatus, RefUpdate};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::backend::ObjectBackend;
use crate::config::TransferConfig;
use crate::refs::{RefRecord, RefStore};
use crate::{ContentStore, Error, KeyLayout, Oid, Result};

/// Where a transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Negotiating,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

/// Cooperative cancellation flag shared with a running transfer.
///
/// Checked before every per-object and per-ref step. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transfer to stop issuing new calls.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Refs offered to a client, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub refs: Vec<RefRecord>,
    /// Ref the remote HEAD points at.
    pub head: Option<String>,
}

impl Advertisement {
    /// Lines of a remote-helper `list` answer: `@<target> HEAD` first when
    /// HEAD is set, then `<oid> <ref>`.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.refs.len() + 1);
        if let Some(head) = &self.head {
            if self.refs.iter().any(|r| &r.name == head) {
                lines.push(format!("@{} HEAD", head));
            }
        }
        lines.extend(self.refs.iter().map(|r| format!("{} {}", r.oid, r.name)));
        lines
    }
}

/// The want/have sets of a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub want: Vec<Oid>,
    pub have: Vec<Oid>,
}

impl FetchRequest {
    pub fn new(want: Vec<Oid>, have: Vec<Oid>) -> Self {
        FetchRequest { want, have }
    }
}

/// Result of a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The single pack delivered to the client.
    pub pack: Vec<u8>,
    /// Objects in the pack, in send order.
    pub objects: Vec<Oid>,
    pub state: TransferState,
}

/// Ref updates of a push plus the pack carrying their objects.
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    pub updates: Vec<RefUpdate>,
    pub pack: Vec<u8>,
    /// All-or-nothing: if any ref fails, applied ones are swapped back.
    pub atomic: bool,
}

impl PushRequest {
    pub fn new(updates: Vec<RefUpdate>, pack: Vec<u8>) -> Self {
        PushRequest {
            updates,
            pack,
            atomic: false,
        }
    }

    /// Request all-or-nothing semantics.
    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }
}

/// Per-ref results of a push.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub updates: Vec<RefUpdate>,
    pub state: TransferState,
    /// Cancellation was observed; updates not yet applied were skipped.
    pub cancelled: bool,
    /// Id the raw pack was retained under, if packs are retained.
    pub pack: Option<Oid>,
}

impl PushReport {
    /// `Err(Cancelled)` if the push was cancelled, `Ok` otherwise, even
    /// when individual refs were rejected.
    pub fn outcome(&self) -> Result<()> {
        if self.cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether every ref update was applied.
    pub fn all_ok(&self) -> bool {
        self.updates.iter().all(|u| u.status.is_ok())
    }

    /// Status of one ref.
    pub fn status(&self, name: &str) -> Option<RefStatus> {
        self.updates.iter().find(|u| u.name == name).map(|u| u.status)
    }

    /// Remote-helper status lines, one per ref.
    pub fn lines(&self) -> Vec<String> {
        self.updates.iter().map(RefUpdate::report_line).collect()
    }
}

/// Tracks and logs the state of one transfer.
#[derive(Debug)]
pub(crate) struct Phase {
    operation: &'static str,
    state: TransferState,
}

impl Phase {
    pub(crate) fn new(operation: &'static str) -> Self {
        debug!(operation, state = ?TransferState::Negotiating, "transfer started");
        Phase {
            operation,
            state: TransferState::Negotiating,
        }
    }

    pub(crate) fn enter(&mut self, next: TransferState) {
        debug!(operation = self.operation, from = ?self.state, to = ?next, "transfer state");
        self.state = next;
    }

    pub(crate) fn state(&self) -> TransferState {
        self.state
    }
}

/// Fetch and push over a content store and a ref store sharing one backend.
pub struct PackTransfer<G> {
    objects: ContentStore,
    refs: RefStore,
    graph: G,
    pool: rayon::ThreadPool,
    config: TransferConfig,
}

impl<G: ObjectGraph> PackTransfer<G> {
    /// Create a transfer for the repository at `config.root`.
    pub fn new(backend: Arc<dyn ObjectBackend>, graph: G, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("bucket-transfer-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {}", e)))?;

        Ok(PackTransfer {
            objects: ContentStore::new(backend.clone(), KeyLayout::git_objects(&config.root)),
            refs: RefStore::new(backend, &config.root),
            graph,
            pool,
            config,
        })
    }

    /// Store holding git objects and retained packs.
    pub fn objects(&self) -> &ContentStore {
        &self.objects
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// All refs, sorted by name, plus the remote HEAD.
    pub fn advertise(&self) -> Result<Advertisement> {
        let refs = self.refs.list(None)?.collect::<Result<Vec<_>>>()?;
        let head = self.refs.head()?;
        debug!(refs = refs.len(), head = ?head, "advertise");
        Ok(Advertisement { refs, head })
    }

    /// Deliver everything reachable from `want` but not from `have` as one
    /// pack.
    ///
    /// An object in the closure that the store does not have is
    /// [`Error::CorruptRemote`]. No ref is touched.
    pub fn fetch(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<FetchOutcome> {
        let mut phase = Phase::new("fetch");
        let result = self.run_fetch(request, cancel, &mut phase);
        if result.is_err() {
            phase.enter(TransferState::Failed);
        }
        result
    }

    fn run_fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        phase: &mut Phase,
    ) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let closure = self.graph.compute_closure(&request.want, &request.have)?;
        debug!(
            want = request.want.len(),
            have = request.have.len(),
            objects = closure.len(),
            "closure computed"
        );

        phase.enter(TransferState::Transferring);
        let objects = self.pool.install(|| {
            closure
                .par_iter()
                .map(|oid| {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    match self.objects.get_bytes(oid, None) {
                        Ok(data) => Ok(PackedObject::new(oid.clone(), data)),
                        Err(Error::NotFound(_)) => Err(Error::CorruptRemote(format!(
                            "object {} is reachable but missing from the store",
                            oid
                        ))),
                        Err(e) => Err(e),
                    }
                })
                .collect::<Result<Vec<_>>>()
        })?;

        phase.enter(TransferState::Finalizing);
        let pack = self.graph.build_pack(&objects)?;

        phase.enter(TransferState::Done);
        info!(objects = objects.len(), bytes = pack.len(), "fetch complete");
        Ok(FetchOutcome {
            pack,
            objects: closure,
            state: phase.state(),
        })
    }
}
