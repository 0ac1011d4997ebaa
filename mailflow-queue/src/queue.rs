//! The durable mail queue
//!
//! Persistence goes through a [`BackingStore`]; visibility, scheduling and
//! leases are tracked in memory and rebuilt from the store by
//! [`MailQueue::open`].

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use mailflow_common::{Mail, MailId, queue};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{QueueError, Result, store::BackingStore, types::RecordKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Delayed(SystemTime),
    /// Held by a consumer. `requeued` is set when the mail was enqueued again
    /// while leased, and takes effect once the lease is settled.
    Leased { requeued: Option<SystemTime> },
}

#[derive(Debug)]
struct Entry {
    key: RecordKey,
    /// Bumped whenever the entry is rescheduled, so stale positions left in
    /// `ready` or `delayed` can be recognised and skipped
    generation: u64,
    status: Status,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<MailId, Entry>,
    ready: VecDeque<(MailId, u64)>,
    delayed: BTreeMap<(SystemTime, u64), (MailId, u64)>,
    next_generation: u64,
    closed: bool,
}

impl QueueState {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Make `id` visible at `at`, or immediately if `at` has passed
    fn schedule(&mut self, id: MailId, at: SystemTime, now: SystemTime) {
        let generation = self.bump();
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        entry.generation = generation;
        if at <= now {
            entry.status = Status::Ready;
            self.ready.push_back((id, generation));
        } else {
            entry.status = Status::Delayed(at);
            self.delayed.insert((at, generation), (id, generation));
        }
    }

    /// Put `id` back at the head of the visible items
    fn restore(&mut self, id: MailId) {
        let generation = self.bump();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.generation = generation;
            entry.status = Status::Ready;
            self.ready.push_front((id, generation));
        }
    }

    fn is_current(&self, id: &MailId, generation: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.generation == generation && !matches!(e.status, Status::Leased { .. }))
    }

    /// Move every delayed item whose time has come to the back of `ready`
    fn promote_due(&mut self, now: SystemTime) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let (id, generation) = entry.remove();
            if self.is_current(&id, generation)
                && let Some(e) = self.entries.get_mut(&id)
            {
                e.status = Status::Ready;
                self.ready.push_back((id, generation));
            }
        }
    }

    /// Lease the next visible item
    fn claim(&mut self) -> Option<RecordKey> {
        while let Some((id, generation)) = self.ready.pop_front() {
            if !self.is_current(&id, generation) {
                continue;
            }

            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = Status::Leased { requeued: None };
                return Some(entry.key);
            }
        }

        None
    }

    /// Earliest time a delayed item becomes visible
    fn next_due(&self) -> Option<SystemTime> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }

    fn flush(&mut self) -> usize {
        let mut flushed = 0;

        for (_, (id, generation)) in std::mem::take(&mut self.delayed) {
            if self.is_current(&id, generation)
                && let Some(entry) = self.entries.get_mut(&id)
            {
                entry.status = Status::Ready;
                self.ready.push_back((id, generation));
                flushed += 1;
            }
        }

        flushed
    }
}

struct Inner {
    store: Arc<dyn BackingStore>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailQueue")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Durable FIFO/delay queue of mail with exclusive leases
///
/// Cloning is cheap; every clone refers to the same queue.
#[derive(Debug, Clone)]
pub struct MailQueue {
    inner: Arc<Inner>,
}

enum Next {
    Claimed(RecordKey),
    Wait(Option<SystemTime>),
}

impl MailQueue {
    /// Open a queue over `store`, recovering every complete record pair
    ///
    /// Items whose schedule time has passed are visible immediately, in key
    /// order; the rest become visible when their time comes.
    ///
    /// # Errors
    /// Returns an error if the store cannot be listed
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn open(store: Arc<dyn BackingStore>) -> Result<Self> {
        let mut by_id: BTreeMap<MailId, Vec<RecordKey>> = BTreeMap::new();
        for key in store.list().await? {
            by_id.entry(key.id()).or_default().push(key);
        }

        let mut keys = Vec::with_capacity(by_id.len());
        for (id, candidates) in by_id {
            if let Some(key) = Self::latest_record(store.as_ref(), id, candidates).await {
                keys.push(key);
            }
        }
        keys.sort();

        let now = SystemTime::now();
        let mut state = QueueState::default();
        for key in &keys {
            state.entries.insert(
                key.id(),
                Entry {
                    key: *key,
                    generation: 0,
                    status: Status::Ready,
                },
            );
            state.schedule(key.id(), key.not_before(), now);
        }

        queue!(
            level = INFO,
            "Recovered {} queued mails ({} delayed)",
            state.entries.len(),
            state.delayed.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        })
    }

    /// Pick the record to keep when a crash left several pairs for one mail
    ///
    /// The pair whose object was updated most recently wins and the others
    /// are deleted.
    async fn latest_record(
        store: &dyn BackingStore,
        id: MailId,
        mut candidates: Vec<RecordKey>,
    ) -> Option<RecordKey> {
        if candidates.len() <= 1 {
            return candidates.pop();
        }

        let mut newest: Option<(SystemTime, RecordKey)> = None;
        for key in &candidates {
            match store.read(key).await {
                Ok(mail) if newest.is_none_or(|(at, _)| mail.last_updated() > at) => {
                    newest = Some((mail.last_updated(), *key));
                }
                Ok(_) => {}
                Err(e) => queue!(level = WARN, "Unreadable duplicate record {key}: {e}"),
            }
        }

        let keep = newest.map_or_else(|| candidates.iter().max().copied(), |(_, key)| Some(key));
        for key in candidates.iter().filter(|k| Some(**k) != keep) {
            queue!(level = WARN, "Removing superseded record {key} for {id}");
            if let Err(e) = store.delete(key).await {
                queue!(level = ERROR, "Failed to remove superseded record {key}: {e}");
            }
        }

        keep
    }

    /// Durably store `mail` and make it visible after `delay`
    ///
    /// A zero delay makes it visible immediately. Delays beyond the latest
    /// representable schedule are capped to [`RecordKey::latest`]. If the mail is currently
    /// leased, the new schedule takes effect once the lease is settled and
    /// the lease no longer owns the previous records. Enqueueing still works
    /// after [`close`](Self::close), so in-flight leases can hand off their
    /// branches.
    ///
    /// # Errors
    /// Any store failure. The mail may or may not have been partly written.
    #[tracing::instrument(level = "debug", skip_all, fields(id = %mail.id(), delay = ?delay))]
    pub async fn enqueue(&self, mail: &Mail, delay: Duration) -> Result<()> {
        let now = SystemTime::now();
        let at = now
            .checked_add(delay)
            .map_or_else(RecordKey::latest, |at| at.min(RecordKey::latest()));
        let key = RecordKey::scheduled(mail.id(), at);

        self.inner.store.write(&key, mail).await.inspect_err(|e| {
            queue!(level = ERROR, "Failed to enqueue {}: {e}", mail.id());
        })?;

        let superseded = {
            let mut state = self.inner.state.lock();

            if let Some(entry) = state.entries.get_mut(&mail.id()) {
                let previous = std::mem::replace(&mut entry.key, key);
                let leased = if let Status::Leased { requeued } = &mut entry.status {
                    *requeued = Some(at);
                    true
                } else {
                    false
                };

                if !leased {
                    state.schedule(mail.id(), at, now);
                }
                Some(previous).filter(|p| *p != key)
            } else {
                state.entries.insert(
                    mail.id(),
                    Entry {
                        key,
                        generation: 0,
                        status: Status::Ready,
                    },
                );
                state.schedule(mail.id(), at, now);
                None
            }
        };

        self.inner.notify.notify_waiters();
        queue!(level = DEBUG, "Enqueued {} as {key}", mail.id());

        if let Some(previous) = superseded
            && let Err(e) = self.inner.store.delete(&previous).await
        {
            queue!(
                level = WARN,
                "Failed to remove superseded record {previous} for {}: {e}",
                mail.id()
            );
        }

        Ok(())
    }

    /// Wait for the next visible item and lease it
    ///
    /// At most one lease exists per mail at any time.
    ///
    /// # Errors
    /// - [`QueueError::Closed`] once the queue has been closed
    /// - A transient store error while reading the item; the item is rolled
    ///   back first so it can be retried
    pub async fn dequeue(&self) -> Result<Lease> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }

                state.promote_due(SystemTime::now());
                state
                    .claim()
                    .map_or_else(|| Next::Wait(state.next_due()), Next::Claimed)
            };

            match next {
                Next::Claimed(key) => {
                    // Rolls the claim back if this future is dropped mid-read
                    let mut handle = LeaseHandle {
                        queue: self.clone(),
                        id: key.id(),
                        settled: false,
                    };

                    match self.inner.store.read(&key).await {
                        Ok(mail) => {
                            queue!(level = DEBUG, "Leased {}", key.id());
                            return Ok(Lease { mail, handle });
                        }
                        Err(e) if e.is_transient() => {
                            queue!(level = WARN, "Failed to read {key}, rolling back: {e}");
                            handle.settled = true;
                            self.release(key.id());
                            return Err(e);
                        }
                        Err(e) => {
                            queue!(level = ERROR, "Dropping unreadable record {key}: {e}");
                            handle.settled = true;
                            self.forget(key.id());

                            if let Err(e) = self.inner.store.quarantine(&key).await {
                                queue!(
                                    level = ERROR,
                                    "Failed to set unreadable record {key} aside: {e}"
                                );
                            }
                        }
                    }
                }
                Next::Wait(Some(at)) => {
                    let wait = at.duration_since(SystemTime::now()).unwrap_or_default();
                    tokio::select! {
                        () = notified.as_mut() => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                Next::Wait(None) => notified.await,
            }
        }
    }

    /// Make every delayed item visible now, returning how many were moved
    ///
    /// Only visibility changes; persisted schedule times stay as they are.
    pub fn flush(&self) -> usize {
        let flushed = self.inner.state.lock().flush();
        if flushed > 0 {
            self.inner.notify.notify_waiters();
        }

        queue!(level = INFO, "Flushed {flushed} delayed mails");
        flushed
    }

    /// Number of items tracked: visible, delayed and leased
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Stop handing out leases
    ///
    /// Pending and future `dequeue` calls return [`QueueError::Closed`].
    /// Outstanding leases can still be settled.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
        queue!(level = INFO, "Queue closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Settle a lease unsuccessfully: requeued schedule if any, else head of
    /// the visible items
    fn release(&self, id: MailId) {
        {
            let mut state = self.inner.state.lock();
            let requeued = match state.entries.get(&id).map(|e| e.status) {
                Some(Status::Leased { requeued }) => requeued,
                _ => return,
            };

            match requeued {
                Some(at) => state.schedule(id, at, SystemTime::now()),
                None => state.restore(id),
            }
        }

        self.inner.notify.notify_waiters();
    }

    fn forget(&self, id: MailId) {
        self.inner.state.lock().entries.remove(&id);
    }

    /// Settle a lease successfully
    async fn acknowledge(&self, id: MailId) -> Result<()> {
        let finished = {
            let mut state = self.inner.state.lock();
            let requeued = match state.entries.get(&id).map(|e| e.status) {
                Some(Status::Leased { requeued }) => requeued,
                _ => return Err(QueueError::NotFound(id)),
            };

            if let Some(at) = requeued {
                state.schedule(id, at, SystemTime::now());
                None
            } else {
                state.entries.remove(&id).map(|e| e.key)
            }
        };

        let Some(key) = finished else {
            self.inner.notify.notify_waiters();
            return Ok(());
        };

        self.inner.store.delete(&key).await.inspect_err(|e| {
            queue!(level = ERROR, "Failed to remove records for {key}: {e}");
        })?;

        queue!(level = DEBUG, "Completed {id}");
        Ok(())
    }
}

/// An exclusive hold on a dequeued mail
#[derive(Debug)]
pub struct Lease {
    mail: Mail,
    handle: LeaseHandle,
}

impl Lease {
    #[must_use]
    pub const fn mail(&self) -> &Mail {
        &self.mail
    }

    pub const fn mail_mut(&mut self) -> &mut Mail {
        &mut self.mail
    }

    /// Take the mail out, keeping the handle to settle the lease later
    #[must_use]
    pub fn into_parts(self) -> (Mail, LeaseHandle) {
        (self.mail, self.handle)
    }

    /// See [`LeaseHandle::done`]
    ///
    /// # Errors
    /// See [`LeaseHandle::done`]
    pub async fn done(self, success: bool) -> Result<()> {
        self.handle.done(success).await
    }
}

/// Settles a lease
///
/// Dropping an unsettled handle rolls the lease back, as `done(false)` would.
#[derive(Debug)]
pub struct LeaseHandle {
    queue: MailQueue,
    id: MailId,
    settled: bool,
}

impl LeaseHandle {
    #[must_use]
    pub const fn id(&self) -> MailId {
        self.id
    }

    /// Settle the lease
    ///
    /// `true` removes the records for good, unless the mail was enqueued
    /// again while leased, in which case that schedule takes over. `false`
    /// makes the mail visible again at once, ahead of everything else.
    ///
    /// # Errors
    /// A store failure while removing the records. The mail is not made
    /// visible again; the records stay behind until the next restart.
    pub async fn done(mut self, success: bool) -> Result<()> {
        self.settled = true;
        if success {
            self.queue.acknowledge(self.id).await
        } else {
            queue!(level = DEBUG, "Rolling back {}", self.id);
            self.queue.release(self.id);
            Ok(())
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if !self.settled {
            queue!(level = WARN, "Lease for {} dropped unsettled, rolling back", self.id);
            self.queue.release(self.id);
        }
    }
}
