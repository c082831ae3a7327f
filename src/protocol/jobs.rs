//! # Job Correlation
//!
//! Requests expecting a reply are stamped with a fresh [`JobId`] as their source
//! job. The server echoes it as the target job of the reply, which the
//! [`JobManager`] routes back to the awaiting [`JobHandle`].
//!
//! ## Job ID layout
//! ```text
//! bits  0..20  sequential count (wraps at 2^20)
//! bits 20..50  start time, seconds since 2005-01-01 UTC
//! bits 50..54  process id
//! bits 54..64  box id
//! ```
//!
//! The manager is owned by the client task and is not shared; all methods take
//! `&mut self`. Each job resolves at most once: by reply, remote failure,
//! timeout, cancellation or disconnect.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::envelope::Envelope;
use crate::error::{ProtocolError, Result};

/// 2005-01-01T00:00:00Z as a unix timestamp.
const JOB_EPOCH_UNIX_SECS: u64 = 1_104_537_600;

const SEQUENCE_BITS: u32 = 20;
const START_TIME_BITS: u32 = 30;
const PROCESS_BITS: u32 = 4;
const BOX_BITS: u32 = 10;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const START_TIME_SHIFT: u32 = SEQUENCE_BITS;
const PROCESS_SHIFT: u32 = START_TIME_SHIFT + START_TIME_BITS;
const BOX_SHIFT: u32 = PROCESS_SHIFT + PROCESS_BITS;

/// 64-bit request/response correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    /// "No job". Carried by messages that are not part of a request/response pair.
    pub const INVALID: JobId = JobId(u64::MAX);

    pub fn from_parts(sequence: u64, start_time: u64, process_id: u64, box_id: u64) -> Self {
        JobId(
            (sequence & SEQUENCE_MASK)
                | ((start_time & ((1 << START_TIME_BITS) - 1)) << START_TIME_SHIFT)
                | ((process_id & ((1 << PROCESS_BITS) - 1)) << PROCESS_SHIFT)
                | ((box_id & ((1 << BOX_BITS) - 1)) << BOX_SHIFT),
        )
    }

    pub fn is_valid(self) -> bool {
        self != JobId::INVALID
    }

    pub fn sequence(self) -> u64 {
        self.0 & SEQUENCE_MASK
    }

    pub fn start_time(self) -> u64 {
        (self.0 >> START_TIME_SHIFT) & ((1 << START_TIME_BITS) - 1)
    }

    pub fn process_id(self) -> u64 {
        (self.0 >> PROCESS_SHIFT) & ((1 << PROCESS_BITS) - 1)
    }

    pub fn box_id(self) -> u64 {
        self.0 >> BOX_SHIFT
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:#018x}", self.0)
        } else {
            f.write_str("<none>")
        }
    }
}

impl Default for JobId {
    fn default() -> Self {
        JobId::INVALID
    }
}

/// Allocates job ids for one client process.
///
/// Process and box id default to 0, which is what a single client needs.
/// Hosts running several clients against the same account can tell their
/// jobs apart with [`with_process_id`](Self::with_process_id) and
/// [`with_box_id`](Self::with_box_id).
#[derive(Debug)]
pub struct JobIdGenerator {
    sequence: AtomicU64,
    start_time: u64,
    process_id: u64,
    box_id: u64,
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdGenerator {
    pub fn new() -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().saturating_sub(JOB_EPOCH_UNIX_SECS))
            .unwrap_or(0);
        Self::with_start_time(start_time)
    }

    pub fn with_start_time(start_time: u64) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            start_time,
            process_id: 0,
            box_id: 0,
        }
    }

    /// Only the low 4 bits are kept.
    pub fn with_process_id(mut self, process_id: u64) -> Self {
        self.process_id = process_id;
        self
    }

    /// Only the low 10 bits are kept.
    pub fn with_box_id(mut self, box_id: u64) -> Self {
        self.box_id = box_id;
        self
    }

    pub fn next_id(&self) -> JobId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        JobId::from_parts(sequence, self.start_time, self.process_id, self.box_id)
    }
}

struct PendingJob {
    sender: oneshot::Sender<Result<Envelope>>,
    deadline: Instant,
}

/// Awaitable result of a job. Resolves to the reply envelope or to the reason
/// the job ended without one.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    receiver: oneshot::Receiver<Result<Envelope>>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for JobHandle {
    type Output = Result<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProtocolError::JobCancelled(job_id))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Table of in-flight jobs.
pub struct JobManager {
    ids: JobIdGenerator,
    pending: HashMap<JobId, PendingJob>,
    timeout: Duration,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl JobManager {
    pub fn new(timeout: Duration) -> Self {
        Self::with_generator(JobIdGenerator::new(), timeout)
    }

    pub fn with_generator(ids: JobIdGenerator, timeout: Duration) -> Self {
        Self {
            ids,
            pending: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.pending.contains_key(&job_id)
    }

    /// Allocate a job id, stamp it as the envelope's source job and register
    /// the pending completion.
    pub fn start(&mut self, envelope: &mut Envelope) -> JobHandle {
        let job_id = self.ids.next_id();
        envelope.header_mut().set_source_job(job_id);

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            job_id,
            PendingJob {
                sender,
                deadline: Instant::now() + self.timeout,
            },
        );
        debug!(%job_id, msg_type = %envelope.msg_type(), "job started");
        JobHandle { job_id, receiver }
    }

    fn resolve(&mut self, job_id: JobId, result: Result<Envelope>) -> bool {
        match self.pending.remove(&job_id) {
            Some(job) => job.sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Route a reply to its job by target job id. Unknown, already resolved or
    /// expired jobs are ignored. Returns whether a waiter received the reply.
    pub fn complete(&mut self, envelope: Envelope) -> bool {
        let job_id = envelope.target_job();
        if !job_id.is_valid() {
            return false;
        }
        let delivered = self.resolve(job_id, Ok(envelope));
        if delivered {
            debug!(%job_id, "job completed");
        }
        delivered
    }

    /// The server is still working on the job; push its deadline out.
    pub fn heartbeat(&mut self, job_id: JobId) {
        if let Some(job) = self.pending.get_mut(&job_id) {
            job.deadline = Instant::now() + self.timeout;
            debug!(%job_id, "job heartbeat");
        }
    }

    /// The server could not deliver the request to its destination.
    pub fn fail(&mut self, job_id: JobId) -> bool {
        let failed = self.resolve(job_id, Err(ProtocolError::JobFailed(job_id)));
        if failed {
            warn!(%job_id, "job failed remotely");
        }
        failed
    }

    /// Drop a job. A reply arriving later is ignored.
    pub fn cancel(&mut self, job_id: JobId) -> bool {
        self.pending.remove(&job_id).is_some()
    }

    /// Resolve expired jobs with a timeout and forget abandoned ones.
    /// Returns the number of jobs that timed out.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<JobId> = self
            .pending
            .iter()
            .filter(|(_, job)| job.deadline <= now || job.sender.is_closed())
            .map(|(id, _)| *id)
            .collect();

        let mut timed_out = 0;
        for job_id in expired {
            if let Some(job) = self.pending.remove(&job_id) {
                if job.deadline <= now && job.sender.send(Err(ProtocolError::JobTimeout(job_id))).is_ok() {
                    warn!(%job_id, "job timed out");
                    timed_out += 1;
                }
            }
        }
        timed_out
    }

    /// Fail every pending job. Used when the connection goes away.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, job) in self.pending.drain() {
            let _ = job.sender.send(Err(ProtocolError::Disconnected));
        }
        if count > 0 {
            debug!(count, "failed pending jobs on disconnect");
        }
        count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::emsg::MsgType;
    use crate::core::proto::HeartBeat;

    fn request() -> Envelope {
        Envelope::proto(MsgType(5400), &HeartBeat::default())
    }

    fn reply_to(job_id: JobId) -> Envelope {
        let mut reply = Envelope::proto(MsgType(5401), &HeartBeat::default());
        reply.header_mut().set_target_job(job_id);
        reply
    }

    #[test]
    fn test_job_id_layout() {
        let id = JobId::from_parts(5, 123_456, 3, 700);
        assert_eq!(id.sequence(), 5);
        assert_eq!(id.start_time(), 123_456);
        assert_eq!(id.process_id(), 3);
        assert_eq!(id.box_id(), 700);
    }

    #[test]
    fn test_sequence_wraps_at_20_bits() {
        let ids = JobIdGenerator::with_start_time(42);
        ids.sequence.store(SEQUENCE_MASK - 1, Ordering::Relaxed);
        assert_eq!(ids.next_id().sequence(), SEQUENCE_MASK);
        let wrapped = ids.next_id();
        assert_eq!(wrapped.sequence(), 0);
        assert_eq!(wrapped.start_time(), 42);
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let mut jobs = JobManager::new(Duration::from_secs(60));
        let mut env = request();
        let handle = jobs.start(&mut env);
        assert_eq!(env.source_job(), handle.job_id());

        assert!(jobs.complete(reply_to(handle.job_id())));
        assert!(!jobs.complete(reply_to(handle.job_id())));
        let reply = handle.await.unwrap();
        assert_eq!(reply.msg_type(), MsgType(5401));
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_noop() {
        let mut jobs = JobManager::new(Duration::from_secs(60));
        let _handle = jobs.start(&mut request());
        assert!(!jobs.complete(reply_to(JobId(12345))));
        assert!(!jobs.complete(reply_to(JobId::INVALID)));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_and_heartbeat_extends() {
        let mut jobs = JobManager::new(Duration::from_secs(10));
        let slow = jobs.start(&mut request());
        let kept = jobs.start(&mut request());

        tokio::time::advance(Duration::from_secs(6)).await;
        jobs.heartbeat(kept.job_id());
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(jobs.sweep(Instant::now()), 1);
        assert!(matches!(slow.await, Err(ProtocolError::JobTimeout(_))));
        assert!(jobs.is_pending(kept.job_id()));

        // a late reply after expiry is dropped
        tokio::time::advance(Duration::from_secs(20)).await;
        jobs.sweep(Instant::now());
        assert!(!jobs.complete(reply_to(kept.job_id())));
    }

    #[tokio::test]
    async fn test_cancel_fail_and_disconnect() {
        let mut jobs = JobManager::new(Duration::from_secs(60));
        let cancelled = jobs.start(&mut request());
        let failed = jobs.start(&mut request());
        let dropped = jobs.start(&mut request());

        assert!(jobs.cancel(cancelled.job_id()));
        assert!(matches!(cancelled.await, Err(ProtocolError::JobCancelled(_))));

        assert!(jobs.fail(failed.job_id()));
        assert!(matches!(failed.await, Err(ProtocolError::JobFailed(_))));

        assert_eq!(jobs.fail_all(), 1);
        assert!(matches!(dropped.await, Err(ProtocolError::Disconnected)));
    }
}
