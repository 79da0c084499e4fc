//! Instrumentation decorator.
//!
//! `Instrumented<D>` implements `Dispatch` itself and is composed around the
//! application. Per attempt it records:
//! - queue time (dispatch start minus the caller's enqueue instant)
//! - processing time (wall-clock time inside the wrapped call)
//! - reclamation pauses observed by the `GcProbe` during the call
//! - the status code, or the error kind of a failed or panicking call
//!
//! The record is handed to the sink before the result is returned. The
//! result itself, including a panic, reaches the caller untouched. An
//! attempt whose future is dropped mid-flight is recorded as `aborted`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use uuid::Uuid;

use super::gc::{GcProbe, NoGcProbe};
use super::record::{AnalyticsRecord, micros_ceil};
use super::request_id::RequestIdPolicy;
use super::sink::AnalyticsSink;
use crate::app::{Dispatch, Request, Response};
use crate::error::DispatchError;

/// Error kind recorded when the wrapped call panics.
pub const PANIC_ERROR_KIND: &str = "panic";
/// Error kind recorded when the attempt is dropped before it completes.
pub const ABORTED_ERROR_KIND: &str = "aborted";

/// Transport-supplied facts about one dispatch attempt.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext {
    /// When the request entered the worker's queue.
    pub enqueued_at: Instant,
    pub request_id: Option<Uuid>,
    pub attempt: u32,
}

impl DispatchContext {
    pub fn new(enqueued_at: Instant) -> Self {
        Self {
            enqueued_at,
            request_id: None,
            attempt: 1,
        }
    }

    /// A request that was never queued.
    pub fn now() -> Self {
        Self::new(Instant::now())
    }

    pub fn with_request_id(mut self, request_id: Option<Uuid>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }
}

/// Analytics decorator around an application.
pub struct Instrumented<D> {
    inner: D,
    sink: Arc<dyn AnalyticsSink>,
    gc: Arc<dyn GcProbe>,
    policy: RequestIdPolicy,
    sequence: AtomicU64,
    pid: u32,
}

impl<D: Dispatch> Instrumented<D> {
    pub fn new(inner: D, sink: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            inner,
            sink,
            gc: Arc::new(NoGcProbe),
            policy: RequestIdPolicy::default(),
            sequence: AtomicU64::new(0),
            pid: std::process::id(),
        }
    }

    pub fn with_gc_probe(mut self, gc: Arc<dyn GcProbe>) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_request_id_policy(mut self, policy: RequestIdPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AnalyticsSink> {
        &self.sink
    }

    /// Dispatch one attempt and emit exactly one record for it.
    pub async fn dispatch_with(
        &self,
        request: Request,
        ctx: DispatchContext,
    ) -> Result<Response, DispatchError> {
        let request_id = self.policy.resolve(ctx.request_id);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp = Utc::now();
        let started = Instant::now();
        let queued = started.saturating_duration_since(ctx.enqueued_at);
        let gc_before = self.gc.total_pause();

        let mut pending = PendingRecord {
            sink: &*self.sink,
            started,
            record: Some(AnalyticsRecord {
                request_id,
                sequence,
                attempt: ctx.attempt,
                worker_pid: self.pid,
                queue_duration_micros: micros_ceil(queued),
                processing_duration_micros: 0,
                gc_duration_micros: 0,
                status_code: None,
                error_kind: Some(ABORTED_ERROR_KIND.to_string()),
                timestamp,
            }),
        };

        let outcome = AssertUnwindSafe(self.inner.dispatch(request))
            .catch_unwind()
            .await;

        let processing = started.elapsed();
        let gc = match (gc_before, self.gc.total_pause()) {
            (Some(before), Some(after)) => after.saturating_sub(before).min(processing),
            _ => Duration::ZERO,
        };

        let (status_code, error_kind) = match &outcome {
            Ok(Ok(response)) => (Some(response.status), None),
            Ok(Err(e)) => (None, Some(e.kind.clone())),
            Err(_) => (None, Some(PANIC_ERROR_KIND.to_string())),
        };

        if let Some(mut record) = pending.record.take() {
            record.processing_duration_micros = micros_ceil(processing);
            record.gc_duration_micros = micros_ceil(gc);
            record.status_code = status_code;
            record.error_kind = error_kind;
            self.sink.emit(record);
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Holds the record of an attempt in flight. Emits it as aborted when
/// dropped while still armed.
struct PendingRecord<'a> {
    sink: &'a dyn AnalyticsSink,
    started: Instant,
    record: Option<AnalyticsRecord>,
}

impl Drop for PendingRecord<'_> {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.processing_duration_micros = micros_ceil(self.started.elapsed());
            self.sink.emit(record);
        }
    }
}

#[async_trait]
impl<D: Dispatch> Dispatch for Instrumented<D> {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        self.dispatch_with(request, DispatchContext::now()).await
    }
}
