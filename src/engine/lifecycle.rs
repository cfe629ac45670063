use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::engine::confirmation::{AttemptState, ConfirmationAttempt, ConfirmationView};
use crate::engine::poll::{PollConfirmer, PollOutcome};
use crate::engine::push::{Connectivity, PushSyncChannel};
use crate::engine::status_map::{
    STATUS_COMPLETED, STATUS_WAITING_FOR_CONFIRMATION, command_status, map_to_step,
};
use crate::engine::store::{ApplyOutcome, OrderSnapshot, OrderStore};
use crate::engine::timer::AutoResolveTimer;
use crate::error::{BackendError, BindError, TransitionError};
use crate::models::confirmation::{ConfirmationReport, ResolutionSource};
use crate::models::courier::CourierStatus;
use crate::models::order::{DeliveryOrder, Evidence};
use crate::models::step::WorkflowStep;
use crate::observability::metrics::Metrics;

const FINALIZE_IDLE: u8 = 0;
const FINALIZE_RUNNING: u8 = 1;
const FINALIZE_DONE: u8 = 2;
const FINALIZE_CLOSED: u8 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the background activities of a binding share.
pub struct SyncContext {
    pub backend: Arc<dyn Backend>,
    pub store: Arc<OrderStore>,
    pub push: PushSyncChannel,
    pub metrics: Metrics,
    pub config: SyncConfig,
    pub courier_id: Uuid,
}

impl SyncContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        courier_id: Uuid,
        config: SyncConfig,
        metrics: Metrics,
    ) -> Self {
        let store = Arc::new(OrderStore::new());
        let push = PushSyncChannel::new(
            backend.clone(),
            store.clone(),
            metrics.clone(),
            config.reconnect_delay,
        );

        Self {
            backend,
            store,
            push,
            metrics,
            config,
            courier_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    Completed(ResolutionSource),
    Cancelled,
    NoShow,
}

impl FinalizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeReason::Completed(_) => "completed",
            FinalizeReason::Cancelled => "cancelled",
            FinalizeReason::NoShow => "no_show",
        }
    }
}

/// One order bound to the controller, with the tasks working on it.
struct Binding {
    order_id: Uuid,
    epoch: u64,
    finalize: AtomicU8,
    finalized: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    attempt: Mutex<Option<Arc<ConfirmationAttempt>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Binding {
    fn new(order_id: Uuid, epoch: u64) -> Arc<Self> {
        let (finalized, _unused_rx) = watch::channel(false);
        let (cancel, _unused_rx) = watch::channel(false);

        Arc::new(Self {
            order_id,
            epoch,
            finalize: AtomicU8::new(FINALIZE_IDLE),
            finalized,
            cancel,
            attempt: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn begin_finalize(&self) -> bool {
        self.finalize
            .compare_exchange(
                FINALIZE_IDLE,
                FINALIZE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn end_finalize(&self) {
        self.finalize.store(FINALIZE_DONE, Ordering::Release);
        self.finalized.send_replace(true);
        self.cancel.send_replace(true);
    }

    /// Forbids any later finalize. Returns the state it found.
    fn try_close(&self) -> u8 {
        match self.finalize.compare_exchange(
            FINALIZE_IDLE,
            FINALIZE_CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Like `try_close`, but also waits out a finalize that already started.
    async fn close(&self) {
        if self.try_close() == FINALIZE_RUNNING {
            let mut finalized = self.finalized.subscribe();
            let _ = finalized.wait_for(|done| *done).await;
        }
    }

    fn accepts_work(&self) -> bool {
        self.finalize.load(Ordering::Acquire) == FINALIZE_IDLE
    }

    async fn cancelled(&self) {
        let mut cancel = self.cancel.subscribe();
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    fn attempt(&self) -> Option<Arc<ConfirmationAttempt>> {
        lock(&self.attempt).clone()
    }

    /// A binding runs one live attempt at a time. Only an attempt withdrawn
    /// during a dispute can be replaced.
    fn open_attempt(&self) -> Option<Arc<ConfirmationAttempt>> {
        if !self.accepts_work() {
            return None;
        }

        let mut slot = lock(&self.attempt);
        if slot
            .as_ref()
            .is_some_and(|attempt| attempt.state() != AttemptState::Cancelled)
        {
            return None;
        }

        let attempt = Arc::new(ConfirmationAttempt::new(self.order_id));
        *slot = Some(attempt.clone());
        Some(attempt)
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    fn shutdown(&self) {
        self.cancel.send_replace(true);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, TransitionError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(flag))
            .map_err(|_| TransitionError::TransitionInProgress)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry point for every operator-driven change to the active order.
///
/// The controller never writes a step locally: commands go to the backend
/// and the store only moves when the server's status comes back through
/// the push channel, the poll confirmer or a refresh.
pub struct LifecycleController {
    ctx: Arc<SyncContext>,
    binding: tokio::sync::Mutex<Option<Arc<Binding>>>,
    in_flight: AtomicBool,
}

impl LifecycleController {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            binding: tokio::sync::Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn courier_id(&self) -> Uuid {
        self.ctx.courier_id
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        self.ctx.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrderSnapshot> {
        self.ctx.store.subscribe()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.ctx.push.connectivity()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.ctx.push.subscribe_connectivity()
    }

    pub fn history(&self) -> Vec<DeliveryOrder> {
        self.ctx.store.history()
    }

    pub fn confirmations(&self) -> Vec<ConfirmationReport> {
        self.ctx.store.confirmations()
    }

    pub async fn confirmation(&self) -> Option<ConfirmationView> {
        let binding = self.binding.lock().await.clone()?;
        if !self.ctx.store.is_current(binding.epoch) {
            return None;
        }
        binding.attempt().map(|attempt| attempt.view())
    }

    /// Binds `order_id` as the active order, replacing any previous one.
    pub async fn bind(&self, order_id: Uuid) -> Result<OrderSnapshot, BindError> {
        let order = self.ctx.backend.get_order(order_id).await?;
        if order.assignee_id != Some(self.ctx.courier_id) {
            return Err(BindError::NotAssigned { order_id });
        }
        self.bind_order(order).await
    }

    /// Rebinds the order the backend still considers active for this courier.
    pub async fn recover(&self) -> Result<Option<OrderSnapshot>, BindError> {
        match self.ctx.backend.active_order(self.ctx.courier_id).await? {
            Some(order) => {
                info!(order_id = %order.id, raw_status = %order.raw_status, "recovered active order");
                self.bind_order(order).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn bind_order(&self, order: DeliveryOrder) -> Result<OrderSnapshot, BindError> {
        let step = order.step();
        if step.is_settled() {
            return Err(BindError::AlreadyTerminal {
                order_id: order.id,
                step,
            });
        }

        let mut slot = self.binding.lock().await;
        if let Some(previous) = slot.take() {
            self.release(&previous).await;
        }

        let order_id = order.id;
        let epoch = self.ctx.store.bind(order);
        let binding = Binding::new(order_id, epoch);

        self.ctx.push.bind(order_id, epoch);
        binding.track(tokio::spawn(supervise(self.ctx.clone(), binding.clone())));
        *slot = Some(binding);

        info!(order_id = %order_id, epoch, step = %step, "order bound");
        Ok(self.ctx.store.snapshot())
    }

    /// Drops the active order. Once this returns, nothing started for it can
    /// touch the store or reach the backend any more.
    pub async fn unbind(&self) -> Option<DeliveryOrder> {
        let mut slot = self.binding.lock().await;
        let binding = slot.take()?;
        let previous = self.release(&binding).await;
        info!(order_id = %binding.order_id, "order unbound");
        previous
    }

    /// Stops everything without telling the server. The order stays active
    /// there and `recover` picks it up on the next start.
    pub async fn shutdown(&self) -> Option<DeliveryOrder> {
        let released = self.unbind().await;
        self.ctx.push.teardown();
        released
    }

    async fn release(&self, binding: &Binding) -> Option<DeliveryOrder> {
        // Close first so a withdrawn attempt cannot be replaced.
        binding.close().await;
        if let Some(attempt) = binding.attempt() {
            if attempt.cancel() {
                info!(
                    order_id = %binding.order_id,
                    attempt_id = %attempt.id(),
                    "confirmation attempt withdrawn"
                );
            }
        }

        let previous = self.ctx.store.unbind(binding.epoch);
        self.ctx.push.teardown_epoch(binding.epoch);
        binding.shutdown();
        previous
    }

    /// Fetches the active order once and applies it.
    pub async fn refresh(&self) -> Result<OrderSnapshot, TransitionError> {
        let binding = self
            .binding
            .lock()
            .await
            .clone()
            .ok_or(TransitionError::NoActiveOrder)?;

        let order = self.ctx.backend.get_order(binding.order_id).await?;
        if let ApplyOutcome::Updated(step) = self.ctx.store.apply_order(binding.epoch, order) {
            info!(order_id = %binding.order_id, step = %step, "refreshed active order");
        }
        Ok(self.ctx.store.snapshot())
    }

    pub async fn request_transition(&self, target: WorkflowStep) -> Result<(), TransitionError> {
        let result = self.transition(target).await;
        self.record(&result);
        result
    }

    /// Uploads the proof (once) and enters the confirmation phase.
    pub async fn start_confirmation_phase(&self, evidence: Evidence) -> Result<(), TransitionError> {
        let result = self.confirm_delivery(evidence).await;
        self.record(&result);
        result
    }

    async fn transition(&self, target: WorkflowStep) -> Result<(), TransitionError> {
        let _in_flight = InFlight::acquire(&self.in_flight)?;
        let (binding, order, from) = self.active().await?;

        if from.successor() != Some(target) {
            return Err(TransitionError::InvalidTransition { from, to: target });
        }

        match target {
            WorkflowStep::Completed => {
                if open_confirmation(&self.ctx, &binding) {
                    info!(order_id = %order.id, "completion routed through confirmation phase");
                }
                Ok(())
            }
            WorkflowStep::Delivered => {
                if order.proof_of_delivery.is_none() {
                    return Err(TransitionError::ProofRequired);
                }
                self.enter_confirmation(&binding, order.id).await
            }
            _ => {
                let raw_status = command_status(target)
                    .ok_or(TransitionError::InvalidTransition { from, to: target })?;
                self.send_status(order.id, raw_status).await
            }
        }
    }

    async fn confirm_delivery(&self, evidence: Evidence) -> Result<(), TransitionError> {
        let _in_flight = InFlight::acquire(&self.in_flight)?;
        let (binding, order, from) = self.active().await?;

        if from != WorkflowStep::OnTheWay {
            return Err(TransitionError::InvalidTransition {
                from,
                to: WorkflowStep::Delivered,
            });
        }

        if order.proof_of_delivery.is_none() {
            let reference = self
                .ctx
                .backend
                .upload_proof(order.id, &evidence)
                .await
                .map_err(|err| {
                    warn!(order_id = %order.id, error = %err, "proof upload failed");
                    TransitionError::from(err)
                })?;
            self.ctx.store.attach_proof(binding.epoch, &reference);
            info!(order_id = %order.id, reference = %reference, "proof of delivery attached");
        }

        self.enter_confirmation(&binding, order.id).await
    }

    async fn enter_confirmation(
        &self,
        binding: &Arc<Binding>,
        order_id: Uuid,
    ) -> Result<(), TransitionError> {
        self.send_status(order_id, STATUS_WAITING_FOR_CONFIRMATION)
            .await?;
        open_confirmation(&self.ctx, binding);
        Ok(())
    }

    async fn send_status(&self, order_id: Uuid, raw_status: &str) -> Result<(), TransitionError> {
        self.ctx
            .backend
            .set_order_status(order_id, raw_status)
            .await
            .map_err(|err| {
                warn!(order_id = %order_id, raw_status, error = %err, "status command rejected");
                TransitionError::from(err)
            })?;

        info!(order_id = %order_id, raw_status, "status command accepted");
        Ok(())
    }

    async fn active(&self) -> Result<(Arc<Binding>, DeliveryOrder, WorkflowStep), TransitionError> {
        let binding = self
            .binding
            .lock()
            .await
            .clone()
            .ok_or(TransitionError::NoActiveOrder)?;

        let snapshot = self.ctx.store.snapshot();
        match snapshot.order {
            Some(order) if snapshot.epoch == binding.epoch => Ok((binding, order, snapshot.step)),
            _ => Err(TransitionError::NoActiveOrder),
        }
    }

    fn record(&self, result: &Result<(), TransitionError>) {
        let outcome = match result {
            Ok(()) => "accepted",
            Err(TransitionError::InvalidTransition { .. }) => "invalid",
            Err(TransitionError::TransitionInProgress) => "in_progress",
            Err(TransitionError::CommandRejected(_)) => "rejected",
            Err(TransitionError::NoActiveOrder) => "no_active_order",
            Err(TransitionError::ProofRequired) => "proof_required",
        };
        self.ctx
            .metrics
            .transitions_total
            .with_label_values(&[outcome])
            .inc();
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.try_close();
            if let Some(attempt) = binding.attempt() {
                attempt.cancel();
            }
            self.ctx.store.unbind(binding.epoch);
            binding.shutdown();
        }
        self.ctx.push.teardown();
    }
}

/// Starts poll and timer for a new attempt. No-op when the binding already
/// has one or is going away.
fn open_confirmation(ctx: &Arc<SyncContext>, binding: &Arc<Binding>) -> bool {
    if !ctx.store.is_current(binding.epoch) {
        return false;
    }
    let Some(attempt) = binding.open_attempt() else {
        return false;
    };

    let poller = PollConfirmer::new(
        ctx.backend.clone(),
        ctx.metrics.clone(),
        ctx.config.poll_interval,
        ctx.config.poll_deadline,
    );
    let timer = AutoResolveTimer::start(ctx.config.auto_resolve_after);

    info!(
        order_id = %binding.order_id,
        attempt_id = %attempt.id(),
        auto_resolve_secs = ctx.config.auto_resolve_after.as_secs(),
        "confirmation phase opened"
    );

    binding.track(tokio::spawn(run_poll(
        ctx.clone(),
        binding.clone(),
        attempt.clone(),
        poller,
    )));
    binding.track(tokio::spawn(run_timer(
        ctx.clone(),
        binding.clone(),
        attempt,
        timer,
    )));
    true
}

/// Reacts to server-confirmed steps of the bound order.
async fn supervise(ctx: Arc<SyncContext>, binding: Arc<Binding>) {
    let mut snapshots = ctx.store.subscribe();
    let mut last_step = None;

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.epoch != binding.epoch {
            break;
        }

        let step = snapshot.step;
        if last_step != Some(step) {
            debug!(order_id = %binding.order_id, step = %step, "bound order moved");
            last_step = Some(step);
        }

        match step {
            WorkflowStep::Completed => match binding.attempt() {
                Some(attempt) => {
                    if attempt.try_resolve(ResolutionSource::Push) {
                        info!(order_id = %binding.order_id, "delivery confirmed by push");
                        finalize(&ctx, &binding, FinalizeReason::Completed(ResolutionSource::Push))
                            .await;
                    } else if attempt.state() == AttemptState::Cancelled {
                        info!(order_id = %binding.order_id, "dispute settled as completed");
                        finalize(&ctx, &binding, FinalizeReason::Completed(ResolutionSource::Push))
                            .await;
                    }
                }
                None => {
                    finalize(&ctx, &binding, FinalizeReason::Completed(ResolutionSource::Push)).await;
                }
            },
            WorkflowStep::Cancelled | WorkflowStep::NoShow => {
                if let Some(attempt) = binding.attempt() {
                    attempt.cancel();
                }
                let reason = if step == WorkflowStep::Cancelled {
                    FinalizeReason::Cancelled
                } else {
                    FinalizeReason::NoShow
                };
                finalize(&ctx, &binding, reason).await;
            }
            WorkflowStep::Delivered => {
                open_confirmation(&ctx, &binding);
            }
            WorkflowStep::DisputedNoShow => {
                if let Some(attempt) = binding.attempt() {
                    if attempt.cancel() {
                        info!(
                            order_id = %binding.order_id,
                            attempt_id = %attempt.id(),
                            "no-show disputed; confirmation withdrawn until the server settles it"
                        );
                    }
                }
            }
            _ => {}
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = binding.cancelled() => break,
        }
    }

    debug!(order_id = %binding.order_id, "binding supervisor stopped");
}

async fn run_poll(
    ctx: Arc<SyncContext>,
    binding: Arc<Binding>,
    attempt: Arc<ConfirmationAttempt>,
    poller: PollConfirmer,
) {
    let order_id = attempt.order_id();
    let confirming = poller.confirm_until(
        order_id,
        |raw| map_to_step(raw) == WorkflowStep::Completed,
        |order| {
            attempt.record_poll();
            if let ApplyOutcome::Updated(step) = ctx.store.apply_order(binding.epoch, order.clone()) {
                info!(order_id = %order_id, step = %step, "poll observed status change");
            }
        },
    );

    let outcome = tokio::select! {
        outcome = confirming => outcome,
        _ = attempt.settled() => return,
        _ = binding.cancelled() => return,
    };

    match outcome {
        PollOutcome::Confirmed { polls } => {
            attempt.record_poll();
            if attempt.try_resolve(ResolutionSource::Poll) {
                info!(order_id = %order_id, polls, "delivery confirmed by poll");
                finalize(&ctx, &binding, FinalizeReason::Completed(ResolutionSource::Poll)).await;
            }
        }
        PollOutcome::TimedOut { polls } => {
            info!(
                order_id = %order_id,
                polls,
                "confirmation poll timed out; auto-resolve still pending"
            );
        }
    }
}

async fn run_timer(
    ctx: Arc<SyncContext>,
    binding: Arc<Binding>,
    attempt: Arc<ConfirmationAttempt>,
    timer: AutoResolveTimer,
) {
    tokio::select! {
        _ = timer.expired() => {}
        _ = attempt.settled() => return,
        _ = binding.cancelled() => return,
    }

    if attempt.try_resolve(ResolutionSource::Timer) {
        warn!(
            order_id = %attempt.order_id(),
            polls = attempt.polls(),
            "no confirmation before deadline; treating delivery as completed"
        );
        finalize(&ctx, &binding, FinalizeReason::Completed(ResolutionSource::Timer)).await;
    }
}

/// Releases the courier and retires the order. Runs at most once per binding.
async fn finalize(ctx: &SyncContext, binding: &Binding, reason: FinalizeReason) {
    if !binding.begin_finalize() {
        debug!(order_id = %binding.order_id, reason = reason.as_str(), "finalize already claimed");
        return;
    }

    let order_id = binding.order_id;
    if reason == FinalizeReason::Completed(ResolutionSource::Timer) {
        mark_completed(ctx, order_id).await;
    }

    if let Err(err) = ctx
        .backend
        .set_courier_availability(ctx.courier_id, CourierStatus::Available)
        .await
    {
        error!(courier_id = %ctx.courier_id, error = %err, "failed to release courier");
    }

    let final_status = matches!(reason, FinalizeReason::Completed(_)).then_some(STATUS_COMPLETED);
    ctx.store.retire(binding.epoch, final_status);

    if let Some(report) = binding.attempt().and_then(|attempt| attempt.report()) {
        ctx.metrics
            .confirmations_total
            .with_label_values(&[report.resolved_by.as_str()])
            .inc();
        ctx.store.record_confirmation(report);
    }

    ctx.push.teardown_epoch(binding.epoch);
    ctx.metrics
        .finalizations_total
        .with_label_values(&[reason.as_str()])
        .inc();
    info!(order_id = %order_id, reason = reason.as_str(), "order finalized");

    binding.end_finalize();
}

async fn mark_completed(ctx: &SyncContext, order_id: Uuid) {
    let attempts = ctx.config.finalize_retries + 1;
    for attempt in 1..=attempts {
        match ctx
            .backend
            .set_order_status(order_id, STATUS_COMPLETED)
            .await
        {
            Ok(()) => {
                info!(order_id = %order_id, "order marked completed by auto-resolve");
                return;
            }
            Err(BackendError::ConnectionLost(reason)) if attempt < attempts => {
                warn!(order_id = %order_id, attempt, error = %reason, "completion write failed; retrying");
                tokio::time::sleep(ctx.config.reconnect_delay).await;
            }
            Err(err) => {
                error!(order_id = %order_id, error = %err, "completion write failed; finalizing locally");
                return;
            }
        }
    }
}
