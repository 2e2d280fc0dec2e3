//! Capture pipeline
//!
//! Orchestrates one request end to end: rate limit, partition lock,
//! idempotency probe, sequence gate, claim, enrichment, rules, validation,
//! approval, position transition, blotter persistence, idempotency
//! finalization, async publish, lock release, job update.
//!
//! Write steps (claim, position transition, blotter persist, finalization)
//! each run in their own fresh transaction under the retry supervisor, so a
//! deadlock in one cannot poison the others.

mod approval;
mod blotter;
mod validate;

#[cfg(test)]
mod integration_tests;

pub use approval::{ApprovalDecision, ApprovalService, AutoApprovalService, StaticApprovalService};
pub use blotter::build_working_blotter;
pub use validate::{is_plausible_isin, validate};

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backpressure::{Bulkhead, RateLimiter};
use crate::blotters::BlotterRepository;
use crate::dlq::{DlqEmitter, DlqStage};
use crate::enrichment::EnrichmentService;
use crate::error::CaptureError;
use crate::idempotency::{ClaimOutcome, IdempotencyService, ProbeResult};
use crate::locks::{LockGuard, PartitionLockService};
use crate::models::{
    EnrichmentStatus, SwapBlotter, TradeCaptureRequest, WorkflowStatus,
};
use crate::position::{PositionState, PositionStore};
use crate::publisher::Publisher;
use crate::retry::RetrySupervisor;
use crate::rules::{self, RuleStore};
use crate::seqgate::{GateDecision, GateReject, SequenceGate};
use crate::jobs::JobStore;

/// Result of one pipeline execution
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Completed(SwapBlotter),
    /// Idempotent hit: an equivalent request already completed
    Duplicate {
        result_ref: String,
        blotter: Option<SwapBlotter>,
    },
    /// Another worker holds the claim; the caller polls
    Pending,
    /// Parked by a workflow rule awaiting approval
    PendingApproval,
    /// Parked in the sequence gate awaiting the gap to fill
    Buffered,
    /// A prior attempt failed within the idempotency window; resubmission
    /// requires the retry flag
    PreviouslyFailed { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Allow reprocessing a key whose record is FAILED
    pub retry_failed: bool,
    /// Approval-callback re-entry: the PROCESSING claim is ours and the
    /// sequence gate was already satisfied on first delivery
    pub resume_pending: bool,
    /// Async job tracking this execution, if any
    pub job_id: Option<Uuid>,
}

pub struct TradePipeline {
    limiter: Arc<RateLimiter>,
    locks: Arc<PartitionLockService>,
    idempotency: Arc<IdempotencyService>,
    gate: Arc<SequenceGate>,
    enricher: Arc<EnrichmentService>,
    rules: Arc<RuleStore>,
    positions: Arc<PositionStore>,
    blotters: Arc<dyn BlotterRepository>,
    retry: Arc<RetrySupervisor>,
    dlq: Arc<DlqEmitter>,
    jobs: Arc<JobStore>,
    bulkhead: Arc<Bulkhead>,
    approval: Arc<dyn ApprovalService>,
    conflict_attempts: u32,
    /// Ordered hand-off to the publisher dispatcher: sends happen under the
    /// partition lock, so the output bus stays ordered per partition key.
    publish_tx: tokio::sync::mpsc::UnboundedSender<SwapBlotter>,
}

impl TradePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<RateLimiter>,
        locks: Arc<PartitionLockService>,
        idempotency: Arc<IdempotencyService>,
        gate: Arc<SequenceGate>,
        enricher: Arc<EnrichmentService>,
        rules: Arc<RuleStore>,
        positions: Arc<PositionStore>,
        blotters: Arc<dyn BlotterRepository>,
        retry: Arc<RetrySupervisor>,
        publisher: Arc<Publisher>,
        dlq: Arc<DlqEmitter>,
        jobs: Arc<JobStore>,
        bulkhead: Arc<Bulkhead>,
        approval: Arc<dyn ApprovalService>,
    ) -> Self {
        let (publish_tx, mut publish_rx) =
            tokio::sync::mpsc::unbounded_channel::<SwapBlotter>();
        let dispatcher_publisher = Arc::clone(&publisher);
        tokio::spawn(async move {
            while let Some(blotter) = publish_rx.recv().await {
                dispatcher_publisher.publish(&blotter).await;
            }
        });

        Self {
            limiter,
            locks,
            idempotency,
            gate,
            enricher,
            rules,
            positions,
            blotters,
            retry,
            dlq,
            jobs,
            bulkhead,
            approval,
            conflict_attempts: 5,
            publish_tx,
        }
    }

    /// Execute one capture request end to end.
    pub async fn execute(
        &self,
        request: TradeCaptureRequest,
        opts: ExecuteOptions,
    ) -> Result<CaptureOutcome, CaptureError> {
        let partition_key = request.partition_key();

        // Step 1: two-level token bucket
        if !self.limiter.try_admit(&partition_key).is_admitted() {
            return Err(CaptureError::RateLimitExceeded(partition_key));
        }

        // Step 2: partition lock; released on every exit path
        let handle = self.locks.acquire(&partition_key).await?;
        let guard = LockGuard::new(&self.locks, handle);

        let outcome = self
            .bulkhead
            .run_partition(&partition_key, self.execute_locked(&request, &opts))
            .await;

        // Step 15: explicit release ahead of the job update
        guard.release();

        // Step 16: async-job bookkeeping
        if let Some(job_id) = opts.job_id {
            self.update_job(job_id, &outcome).await;
        }
        outcome
    }

    async fn execute_locked(
        &self,
        request: &TradeCaptureRequest,
        opts: &ExecuteOptions,
    ) -> Result<CaptureOutcome, CaptureError> {
        let key = request.dedup_key().to_string();

        // Step 3: idempotency probe
        let mut skip_claim = false;
        match self.idempotency.probe(&key).await? {
            ProbeResult::Completed { result_ref } => {
                self.check_digest(&key, request).await?;
                let blotter = self.blotters.get_by_trade_id(&result_ref).await?;
                return Ok(CaptureOutcome::Duplicate { result_ref, blotter });
            }
            ProbeResult::Processing => {
                if opts.resume_pending {
                    // Re-entry after approval: the gate already delivered
                    // this sequence, go straight to processing.
                    return self.process_admitted(request, true).await;
                }
                self.check_digest(&key, request).await?;
                return Ok(CaptureOutcome::Pending);
            }
            ProbeResult::Failed { reason } => {
                if !opts.retry_failed {
                    return Ok(CaptureOutcome::PreviouslyFailed { reason });
                }
                self.idempotency.reopen_failed(&key).await?;
                skip_claim = true;
            }
            ProbeResult::New => {}
        }

        // Step 4: sequence gate
        match self.gate.offer(request.clone()) {
            GateDecision::Bypass => self.process_admitted(request, skip_claim).await,
            GateDecision::Deliver(batch) => {
                let mut first = None;
                for (index, admitted) in batch.iter().enumerate() {
                    let result = self
                        .process_admitted(admitted, skip_claim && index == 0)
                        .await;
                    if index == 0 {
                        first = Some(result);
                    } else if let Err(e) = result {
                        warn!(
                            trade_id = %admitted.trade_id,
                            error = %e,
                            "Drained buffered message failed"
                        );
                    }
                }
                first.expect("gate Deliver always contains the offered message")
            }
            GateDecision::Buffered => Ok(CaptureOutcome::Buffered),
            GateDecision::Reject(reason) => {
                let err = match reason {
                    GateReject::OutOfOrderTooOld => CaptureError::OutOfOrderTooOld,
                    GateReject::GapTooLarge => CaptureError::GapTooLarge,
                };
                self.dlq
                    .emit(
                        DlqStage::SequenceGate,
                        &err,
                        Some(&request.partition_key()),
                        Some(&request.trade_id),
                        serde_json::to_value(request).ok(),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Steps 5-14 for one admitted (in-order or bypassed) request.
    async fn process_admitted(
        &self,
        request: &TradeCaptureRequest,
        skip_claim: bool,
    ) -> Result<CaptureOutcome, CaptureError> {
        let started = Instant::now();
        let key = request.dedup_key().to_string();
        let partition_key = request.partition_key();

        // Step 5: claim the idempotency record
        if !skip_claim {
            let digest = request.payload_digest();
            let claim = self
                .retry
                .run_write("idempotency-claim", || {
                    self.idempotency.claim(&key, &partition_key, &digest)
                })
                .await?;
            if claim == ClaimOutcome::AlreadyExists {
                // Lost the race; re-probe for the winner's verdict
                return match self.idempotency.probe(&key).await? {
                    ProbeResult::Completed { result_ref } => {
                        self.check_digest(&key, request).await?;
                        let blotter = self.blotters.get_by_trade_id(&result_ref).await?;
                        Ok(CaptureOutcome::Duplicate { result_ref, blotter })
                    }
                    ProbeResult::Failed { reason } => {
                        Ok(CaptureOutcome::PreviouslyFailed { reason })
                    }
                    _ => Ok(CaptureOutcome::Pending),
                };
            }
        }

        // Step 6: reference-data fan-out, outside any transaction
        let enrichment = self
            .bulkhead
            .run_external(self.enricher.enrich(
                &request.security_id,
                &request.account_id,
                &request.book_id,
            ))
            .await;

        // Step 7: working blotter
        let mut working = build_working_blotter(request, &enrichment);

        // Step 8: rules
        match rules::evaluate(&self.rules.snapshot(), request, &mut working) {
            Ok(applied) => working.processing_metadata.rules_applied = applied,
            Err(e) => return self.fail(&key, e).await,
        }

        // Step 9: validation; both-sides-down enrichment is terminal
        if enrichment.status == EnrichmentStatus::Failed {
            let reason = enrichment.failure.clone().unwrap_or_default();
            return self.fail(&key, CaptureError::EnrichmentFailed(reason)).await;
        }
        if let Err(e) = validate(request, &enrichment) {
            return self.fail(&key, e).await;
        }

        // Step 10: approval for parked blotters
        if working.workflow_status == WorkflowStatus::PendingApproval {
            match self.approval.decide(request, &working).await {
                ApprovalDecision::Approved => {
                    working.workflow_status = WorkflowStatus::Approved;
                }
                ApprovalDecision::Rejected(reason) => {
                    working.workflow_status = WorkflowStatus::Rejected;
                    return self
                        .fail(
                            &key,
                            CaptureError::Validation(format!("workflow rejected: {}", reason)),
                        )
                        .await;
                }
                ApprovalDecision::Pending => {
                    info!(trade_id = %request.trade_id, "Awaiting approval");
                    return Ok(CaptureOutcome::PendingApproval);
                }
            }
        }

        // Step 11: position transition under optimistic versioning
        let state = match self.transition_position(request).await {
            Ok(state) => state,
            Err(e) => return self.fail(&key, e).await,
        };
        working.state = state.as_str().to_string();

        // Step 12: persist the blotter
        working.processing_metadata.processed_at = chrono::Utc::now();
        working.processing_metadata.elapsed_millis = started.elapsed().as_millis() as u64;
        if let Err(e) = self
            .retry
            .run_write("persist-blotter", || self.blotters.insert(&working))
            .await
        {
            return self.fail(&key, e).await;
        }

        // Step 13: finalize idempotency, invalidate the state cache
        self.retry
            .run_write("finalize-idempotency", || {
                self.idempotency.mark_completed(&key, &working.trade_id)
            })
            .await?;
        self.positions.invalidate(&partition_key);

        // Step 14: fan out asynchronously, outside every transaction; the
        // dispatcher preserves send order, hence per-partition order
        if self.publish_tx.send(working.clone()).is_err() {
            warn!(trade_id = %working.trade_id, "Publish dispatcher gone");
        }

        info!(
            trade_id = %request.trade_id,
            partition = %partition_key,
            state = %state,
            elapsed_ms = working.processing_metadata.elapsed_millis,
            "Capture completed"
        );
        Ok(CaptureOutcome::Completed(working))
    }

    /// Step 11: fresh read, DAG check, CAS write; version conflicts retry
    /// the whole step.
    async fn transition_position(
        &self,
        request: &TradeCaptureRequest,
    ) -> Result<PositionState, CaptureError> {
        let partition_key = request.partition_key();
        let blob = position_blob(request);

        for attempt in 1..=self.conflict_attempts {
            let current = self.positions.read(&partition_key).await?;
            let result = match current {
                None => {
                    let inserted = self
                        .retry
                        .run_write("position-execute", || {
                            self.positions.transition(
                                &partition_key,
                                None,
                                PositionState::Executed,
                                &blob,
                                None,
                                request.sequence_number,
                            )
                        })
                        .await;
                    match inserted {
                        Ok(version) => self
                            .retry
                            .run_write("position-form", || {
                                self.positions.transition(
                                    &partition_key,
                                    Some(PositionState::Executed),
                                    PositionState::Formed,
                                    &blob,
                                    Some(version),
                                    request.sequence_number,
                                )
                            })
                            .await
                            .map(|_| PositionState::Formed),
                        Err(e) => Err(e),
                    }
                }
                Some(record) => {
                    let target = match record.state {
                        PositionState::Executed => PositionState::Formed,
                        other => other,
                    };
                    self.retry
                        .run_write("position-advance", || {
                            self.positions.transition(
                                &partition_key,
                                Some(record.state),
                                target,
                                &blob,
                                Some(record.version),
                                request.sequence_number,
                            )
                        })
                        .await
                        .map(|_| target)
                }
            };

            match result {
                Ok(state) => return Ok(state),
                Err(CaptureError::VersionConflict) if attempt < self.conflict_attempts => {
                    warn!(
                        partition = %partition_key,
                        attempt,
                        "Position version conflict, retrying step"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(CaptureError::VersionConflict)
    }

    /// Terminal failure: mark the idempotency record FAILED so a flagged
    /// client retry is permitted, then surface the original error.
    async fn fail(
        &self,
        key: &str,
        error: CaptureError,
    ) -> Result<CaptureOutcome, CaptureError> {
        warn!(key = %key, code = error.code(), error = %error, "Capture failed");
        if let Err(mark_err) = self
            .retry
            .run_write("mark-failed", || {
                self.idempotency.mark_failed(key, error.code())
            })
            .await
        {
            warn!(key = %key, error = %mark_err, "Failed to record FAILED status");
        }
        Err(error)
    }

    async fn check_digest(
        &self,
        key: &str,
        request: &TradeCaptureRequest,
    ) -> Result<(), CaptureError> {
        if let Some(recorded) = self.idempotency.recorded_digest(key).await? {
            if recorded != request.payload_digest() {
                return Err(CaptureError::DuplicateDifferentPayload(
                    request.trade_id.clone(),
                ));
            }
        }
        Ok(())
    }

    async fn update_job(&self, job_id: Uuid, outcome: &Result<CaptureOutcome, CaptureError>) {
        let result = match outcome {
            Ok(CaptureOutcome::Completed(blotter)) => {
                self.jobs.complete(job_id, &blotter.trade_id).await
            }
            Ok(CaptureOutcome::Duplicate { result_ref, .. }) => {
                self.jobs.complete(job_id, result_ref).await
            }
            Ok(CaptureOutcome::PreviouslyFailed { reason }) => {
                self.jobs
                    .fail(job_id, "DUPLICATE_TRADE_ID", reason.as_deref().unwrap_or(""))
                    .await
            }
            // Deferred outcomes leave the job in PROCESSING
            Ok(_) => Ok(()),
            Err(e) => self.jobs.fail(job_id, e.code(), &e.to_string()).await,
        };
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "Job status update failed");
        }
    }
}

/// Opaque per-partition position payload carried on the durable row.
fn position_blob(request: &TradeCaptureRequest) -> Vec<u8> {
    let net_qty: rust_decimal::Decimal = request.trade_lots.iter().map(|l| l.qty).sum();
    serde_json::to_vec(&serde_json::json!({
        "lastTradeId": request.trade_id,
        "lotCount": request.trade_lots.len(),
        "netQuantity": net_qty,
    }))
    .unwrap_or_default()
}
