//! Push and pull between the local store and the depot.
//!
//! Both directions group the selected paths by hash, settle whatever can be
//! decided locally (ledger hits, cached objects, dirty files) on the calling
//! thread, and hand the remaining transfers to a bounded pool of workers fed
//! through a channel. Each depot call runs under a deadline that bounds how
//! long it may go without moving any bytes, so a slow but steady transfer of
//! a large object is never cut off. Retryable failures are retried with
//! exponential backoff. A failure affects only its
//! own object, and the report carries one outcome per transfer.

use crate::anchor::Anchors;
use crate::depot::Depot;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::index::Index;
use crate::ledger::Ledger;
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Tuning for a push or pull batch.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Number of concurrent transfers.
    pub jobs: usize,
    /// Deadline for each depot call, and for each stretch of a transfer
    /// without progress.
    pub timeout: Duration,
    /// Extra attempts for retryable failures.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
    /// Pull only from the local store; never contact the depot.
    pub offline: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            timeout: Duration::from_secs(60),
            retries: 2,
            backoff: Duration::from_millis(200),
            offline: false,
        }
    }
}

/// Stops dispatch of new transfers when cancelled.
///
/// Transfers already running finish; the rest are reported as skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}

/// What happened to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Uploaded and confirmed by a follow-up probe.
    Uploaded,
    /// The depot already held the object.
    AlreadyInDepot,
    /// The ledger records the object as confirmed; the depot was not contacted.
    Confirmed,
    /// Fetched, verified and linked.
    Downloaded,
    /// Linked from the local store without a transfer.
    Linked,
    /// The working tree already holds the content.
    UpToDate,
    /// The working tree holds the content and the lost cached object was
    /// rebuilt from it.
    Restored,
    /// Not attempted (unlocked path or cancelled batch).
    Skipped,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Uploaded => "uploaded",
            TransferStatus::AlreadyInDepot => "already in depot",
            TransferStatus::Confirmed => "confirmed",
            TransferStatus::Downloaded => "downloaded",
            TransferStatus::Linked => "linked",
            TransferStatus::UpToDate => "up to date",
            TransferStatus::Restored => "restored to cache",
            TransferStatus::Skipped => "skipped",
            TransferStatus::Failed => "failed",
        }
    }
}

/// Result of one transfer attempt for one object.
#[derive(Debug)]
pub struct TransferOutcome {
    pub direction: Direction,
    pub hash: ContentHash,
    /// Tracked paths that share the object.
    pub paths: Vec<String>,
    pub status: TransferStatus,
    /// Depot attempts made (0 when the depot was not contacted).
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<Error>,
}

impl TransferOutcome {
    fn new(direction: Direction, hash: ContentHash, paths: Vec<String>, status: TransferStatus) -> Self {
        Self {
            direction,
            hash,
            paths,
            status,
            attempts: 0,
            bytes: 0,
            error: None,
        }
    }

    fn failed(direction: Direction, hash: ContentHash, paths: Vec<String>, error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::new(direction, hash, paths, TransferStatus::Failed)
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcomes of a push or pull batch.
#[derive(Debug)]
pub struct SyncReport {
    pub direction: Direction,
    pub outcomes: Vec<TransferOutcome>,
}

impl SyncReport {
    /// Outcomes that carry an error, including cancelled transfers.
    pub fn failures(&self) -> impl Iterator<Item = &TransferOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn count(&self, status: TransferStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Run `call` on its own thread and wait at most `timeout` for it.
///
/// A call that misses the deadline keeps running detached; its result is
/// dropped.
pub(crate) fn call_with_deadline<T, F>(timeout: Duration, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("worm-depot".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(Error::DepotTimeout {
            seconds: timeout.as_secs_f64().ceil() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => {
            Err(Error::depot_unavailable("depot call aborted"))
        }
    }
}

/// Byte flow of one transfer, shared between the worker and the thread
/// running the depot call.
#[derive(Debug, Clone, Default)]
struct Activity(Arc<Mutex<ActivityState>>);

#[derive(Debug, Default)]
struct ActivityState {
    reads: u64,
    abandoned: bool,
}

impl Activity {
    /// Record a completed read; fails once the transfer was given up.
    fn tick(&self) -> io::Result<()> {
        let mut state = self.0.lock().map_err(|_| io::Error::other("activity lock poisoned"))?;
        if state.abandoned {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "transfer abandoned after deadline"));
        }
        state.reads += 1;
        Ok(())
    }

    /// Reads so far, or `None` (and the transfer is abandoned) when nothing
    /// moved since `seen`.
    fn checkpoint(&self, seen: u64) -> Option<u64> {
        let mut state = match self.0.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.reads == seen {
            state.abandoned = true;
            None
        } else {
            Some(state.reads)
        }
    }
}

/// Reader that reports each read to an [`Activity`] and stops once the
/// transfer is abandoned, so a late transfer never completes.
struct WatchedReader<R> {
    inner: R,
    activity: Activity,
}

impl<R: Read> Read for WatchedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.activity.tick()?;
        let n = self.inner.read(buf)?;
        self.activity.tick()?;
        Ok(n)
    }
}

/// Run a streaming transfer on its own thread, giving up only when no read
/// completes for `timeout`.
///
/// `call` receives the [`Activity`] to attach to every reader it uses. Once
/// the deadline passes without progress those readers fail, so an
/// abandoned transfer cannot commit anything afterwards.
fn call_while_active<T, F>(timeout: Duration, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Activity) -> Result<T> + Send + 'static,
{
    let activity = Activity::default();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let worker_activity = activity.clone();
    thread::Builder::new()
        .name("worm-transfer".to_string())
        .spawn(move || {
            let _ = tx.send(call(worker_activity));
        })?;

    let mut seen = 0;
    loop {
        match rx.recv_timeout(timeout) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => match activity.checkpoint(seen) {
                Some(reads) => seen = reads,
                None => {
                    return Err(Error::DepotTimeout {
                        seconds: timeout.as_secs_f64().ceil() as u64,
                    });
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::depot_unavailable("depot transfer aborted"));
            }
        }
    }
}

/// Work handed to the pool: one object and the paths that share it.
struct Job {
    hash: ContentHash,
    paths: Vec<String>,
    size: u64,
}

/// Drives transfers for one repository.
pub struct SyncEngine<'a> {
    anchors: &'a Anchors,
    depot: Option<Arc<dyn Depot>>,
    ledger: Option<&'a Ledger>,
    options: SyncOptions,
    cancel: CancelToken,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        anchors: &'a Anchors,
        depot: Option<Arc<dyn Depot>>,
        ledger: Option<&'a Ledger>,
        options: SyncOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            anchors,
            depot,
            ledger,
            options,
            cancel,
        }
    }

    /// Upload the objects behind `paths` to the depot.
    ///
    /// Fails outright only when no depot is configured; everything else is
    /// reported per object.
    pub fn push(&self, index: &Index, paths: &[String]) -> Result<SyncReport> {
        let depot = self.depot.clone().ok_or_else(|| Error::no_depot("pushing"))?;
        let (groups, mut outcomes) = group_by_hash(index, paths, Direction::Push);

        let mut jobs = Vec::new();
        for (hash, paths) in groups {
            if self.ledger.is_some_and(|ledger| ledger.contains(&hash)) {
                outcomes.push(TransferOutcome::new(
                    Direction::Push,
                    hash,
                    paths,
                    TransferStatus::Confirmed,
                ));
                continue;
            }

            match self.ensure_stored(&hash, &paths) {
                Ok(size) => jobs.push(Job { hash, paths, size }),
                Err(e) => outcomes.push(TransferOutcome::failed(Direction::Push, hash, paths, e)),
            }
        }

        outcomes.extend(self.run_pool(Direction::Push, jobs, |job| self.push_one(&depot, job)));
        Ok(finish(Direction::Push, outcomes))
    }

    /// Bring the content behind `paths` into the working tree.
    pub fn pull(&self, index: &Index, paths: &[String]) -> Result<SyncReport> {
        let (groups, mut outcomes) = group_by_hash(index, paths, Direction::Pull);
        let store = self.anchors.store();

        let mut jobs = Vec::new();
        for (hash, paths) in groups {
            let mut pending = Vec::new();
            let mut current = Vec::new();
            for path in paths {
                if self.anchors.is_anchored(&path, &hash) {
                    current.push(path);
                } else if let Err(e) = self.anchors.ensure_not_dirty(&path, &hash) {
                    tracing::warn!(path = %path, "working file differs from index, not overwriting");
                    outcomes.push(TransferOutcome::failed(Direction::Pull, hash, vec![path], e));
                } else {
                    pending.push(path);
                }
            }

            if !current.is_empty() {
                outcomes.push(self.settle_current(hash, current));
            }
            if pending.is_empty() {
                continue;
            }

            if store.exists(&hash) {
                let outcome = match self.link_all(&hash, &pending) {
                    Ok(()) => TransferOutcome::new(Direction::Pull, hash, pending, TransferStatus::Linked),
                    Err(e) => TransferOutcome::failed(Direction::Pull, hash, pending, e),
                };
                outcomes.push(outcome);
            } else if self.options.offline {
                outcomes.push(TransferOutcome::failed(
                    Direction::Pull,
                    hash,
                    pending,
                    Error::missing_object(hash.to_hex()),
                ));
            } else if self.depot.is_none() {
                outcomes.push(TransferOutcome::failed(
                    Direction::Pull,
                    hash,
                    pending,
                    Error::no_depot("pulling"),
                ));
            } else {
                jobs.push(Job {
                    hash,
                    paths: pending,
                    size: 0,
                });
            }
        }

        if let Some(depot) = self.depot.clone() {
            outcomes.extend(self.run_pool(Direction::Pull, jobs, |job| self.pull_one(&depot, job)));
        }
        Ok(finish(Direction::Pull, outcomes))
    }

    /// Outcome for paths whose working entries already hold `hash`. A cache
    /// that lost the object gets it back from the working tree.
    fn settle_current(&self, hash: ContentHash, paths: Vec<String>) -> TransferOutcome {
        if self.anchors.store().exists(&hash) {
            return TransferOutcome::new(Direction::Pull, hash, paths, TransferStatus::UpToDate);
        }

        match self.anchors.restore_object(&paths[0], &hash) {
            Ok(()) => TransferOutcome::new(Direction::Pull, hash, paths, TransferStatus::Restored),
            Err(e) => {
                tracing::warn!(%hash, error = %e, "could not restore cached object");
                TransferOutcome::failed(Direction::Pull, hash, paths, e)
            }
        }
    }

    /// Make sure the object is in the store, re-ingesting a working anchor if
    /// the cache lost it. Returns the object size.
    fn ensure_stored(&self, hash: &ContentHash, paths: &[String]) -> Result<u64> {
        let store = self.anchors.store();
        if store.exists(hash) {
            return store.object_size(hash);
        }

        for path in paths {
            let entry = self.anchors.entry_path(path);
            if !entry.is_file() {
                continue;
            }
            if ContentHash::hash_file(&entry)? == *hash {
                store.ingest(&entry)?;
                tracing::debug!(%hash, path = %path, "restored object from working tree");
                return store.object_size(hash);
            }
        }

        Err(Error::missing_object(hash.to_hex()))
    }

    fn link_all(&self, hash: &ContentHash, paths: &[String]) -> Result<()> {
        for path in paths {
            self.anchors.link(path, hash)?;
        }
        Ok(())
    }

    fn push_one(&self, depot: &Arc<dyn Depot>, job: Job) -> TransferOutcome {
        let Job { hash, paths, size } = job;
        let store = self.anchors.store().clone();

        let (result, attempts) = self.with_retries(&hash, || {
            let probe_depot = depot.clone();
            if call_with_deadline(self.options.timeout, move || Ok(probe_depot.probe(&hash)?))? {
                return Ok(TransferStatus::AlreadyInDepot);
            }

            let file = store.open_object(&hash)?;
            let store_depot = depot.clone();
            call_while_active(self.options.timeout, move |activity| {
                let reader = WatchedReader { inner: file, activity };
                Ok(store_depot.store(&hash, Box::new(reader), size)?)
            })?;

            let confirm_depot = depot.clone();
            if !call_with_deadline(self.options.timeout, move || Ok(confirm_depot.probe(&hash)?))? {
                return Err(Error::depot_unavailable("object not visible after upload"));
            }
            Ok(TransferStatus::Uploaded)
        });

        let result = result.and_then(|status| {
            if let Some(ledger) = self.ledger {
                ledger.record(&hash, size)?;
            }
            Ok(status)
        });

        match result {
            Ok(status) => {
                tracing::info!(%hash, status = status.as_str(), attempts, "push");
                TransferOutcome {
                    attempts,
                    bytes: if status == TransferStatus::Uploaded { size } else { 0 },
                    ..TransferOutcome::new(Direction::Push, hash, paths, status)
                }
            }
            Err(e) => {
                tracing::warn!(%hash, attempts, error = %e, "push failed");
                TransferOutcome {
                    attempts,
                    ..TransferOutcome::failed(Direction::Push, hash, paths, e)
                }
            }
        }
    }

    fn pull_one(&self, depot: &Arc<dyn Depot>, job: Job) -> TransferOutcome {
        let Job { hash, paths, .. } = job;

        let (result, attempts) = self.with_retries(&hash, || {
            let depot = depot.clone();
            let store = self.anchors.store().clone();
            call_while_active(self.options.timeout, move |activity| {
                // The fetch call itself counts as progress once it returns
                let inner = depot.fetch(&hash)?;
                activity.tick()?;
                store.ingest_reader(WatchedReader { inner, activity }, &hash)
            })
        });

        let result = result.and_then(|bytes| {
            if let Some(ledger) = self.ledger {
                ledger.record(&hash, bytes)?;
            }
            self.link_all(&hash, &paths)?;
            Ok(bytes)
        });

        match result {
            Ok(bytes) => {
                tracing::info!(%hash, bytes, attempts, "pull");
                TransferOutcome {
                    attempts,
                    bytes,
                    ..TransferOutcome::new(Direction::Pull, hash, paths, TransferStatus::Downloaded)
                }
            }
            Err(e) => {
                if e.is_integrity() {
                    tracing::error!(%hash, error = %e, "depot returned corrupt data");
                } else {
                    tracing::warn!(%hash, attempts, error = %e, "pull failed");
                }
                TransferOutcome {
                    attempts,
                    ..TransferOutcome::failed(Direction::Pull, hash, paths, e)
                }
            }
        }
    }

    /// Run `op`, retrying retryable failures with exponential backoff.
    ///
    /// Returns the final result and the number of attempts made.
    fn with_retries<T>(&self, hash: &ContentHash, mut op: impl FnMut() -> Result<T>) -> (Result<T>, u32) {
        let mut attempts = 0;
        let mut delay = self.options.backoff;

        loop {
            attempts += 1;
            match op() {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if e.is_retryable() && attempts <= self.options.retries && !self.cancel.is_cancelled() => {
                    tracing::warn!(%hash, attempt = attempts, error = %e, "retrying after {:?}", delay);
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }

    /// Feed `jobs` to a bounded pool of workers and collect their outcomes.
    fn run_pool<F>(&self, direction: Direction, jobs: Vec<Job>, work: F) -> Vec<TransferOutcome>
    where
        F: Fn(Job) -> TransferOutcome + Sync,
    {
        if jobs.is_empty() {
            return Vec::new();
        }

        let workers = self.options.jobs.max(1).min(jobs.len());
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(workers);
        let (out_tx, out_rx) = crossbeam_channel::unbounded::<TransferOutcome>();
        let mut skipped = Vec::new();

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                let work = &work;
                let cancel = &self.cancel;
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        let outcome = if cancel.is_cancelled() {
                            cancelled(direction, job)
                        } else {
                            work(job)
                        };
                        if out_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(out_tx);

            for job in jobs {
                if self.cancel.is_cancelled() {
                    skipped.push(cancelled(direction, job));
                    continue;
                }
                if let Err(err) = job_tx.send(job) {
                    skipped.push(cancelled(direction, err.into_inner()));
                }
            }
            drop(job_tx);
        });

        let mut outcomes: Vec<TransferOutcome> = out_rx.iter().collect();
        outcomes.extend(skipped);
        outcomes
    }
}

fn cancelled(direction: Direction, job: Job) -> TransferOutcome {
    TransferOutcome {
        status: TransferStatus::Skipped,
        ..TransferOutcome::failed(direction, job.hash, job.paths, Error::Cancelled)
    }
}

/// Group tracked paths by hash; unlocked and untracked paths become outcomes.
fn group_by_hash(
    index: &Index,
    paths: &[String],
    direction: Direction,
) -> (BTreeMap<ContentHash, Vec<String>>, Vec<TransferOutcome>) {
    let mut groups: BTreeMap<ContentHash, Vec<String>> = BTreeMap::new();
    let mut outcomes = Vec::new();

    for path in paths {
        let Some(hash) = index.get(path) else {
            continue;
        };
        if index.is_unlocked(path) {
            tracing::debug!(path = %path, "skipping unlocked path");
            outcomes.push(TransferOutcome::new(
                direction,
                hash,
                vec![path.clone()],
                TransferStatus::Skipped,
            ));
            continue;
        }
        groups.entry(hash).or_default().push(path.clone());
    }

    (groups, outcomes)
}

fn finish(direction: Direction, mut outcomes: Vec<TransferOutcome>) -> SyncReport {
    outcomes.sort_by(|a, b| a.paths.first().cmp(&b.paths.first()));
    SyncReport {
        direction,
        outcomes,
    }
}
