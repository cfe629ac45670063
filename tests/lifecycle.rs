use std::sync::Arc;
use std::time::Duration;

use dasher_sync::backend::memory::MemoryBackend;
use dasher_sync::config::SyncConfig;
use dasher_sync::engine::confirmation::AttemptState;
use dasher_sync::engine::lifecycle::{LifecycleController, SyncContext};
use dasher_sync::engine::push::Connectivity;
use dasher_sync::error::{BindError, TransitionError};
use dasher_sync::models::confirmation::ResolutionSource;
use dasher_sync::models::courier::CourierStatus;
use dasher_sync::models::order::{DeliveryOrder, Evidence};
use dasher_sync::models::step::WorkflowStep;
use dasher_sync::observability::metrics::Metrics;
use tokio::time::Instant;
use uuid::Uuid;

struct Harness {
    backend: Arc<MemoryBackend>,
    controller: Arc<LifecycleController>,
    metrics: Metrics,
    courier_id: Uuid,
}

fn harness() -> Harness {
    let backend = Arc::new(MemoryBackend::new(64));
    let metrics = Metrics::new();
    let courier_id = Uuid::new_v4();
    let config = SyncConfig {
        reconnect_delay: Duration::from_secs(3),
        poll_interval: Duration::from_secs(5),
        poll_deadline: Duration::from_secs(60),
        auto_resolve_after: Duration::from_secs(120),
        finalize_retries: 3,
    };

    let ctx = SyncContext::new(backend.clone(), courier_id, config, metrics.clone());

    Harness {
        backend,
        controller: Arc::new(LifecycleController::new(ctx)),
        metrics,
        courier_id,
    }
}

impl Harness {
    fn order(&self, raw_status: &str) -> Uuid {
        let order = DeliveryOrder::new(Uuid::new_v4(), raw_status, Some(self.courier_id));
        let id = order.id;
        self.backend.insert_order(order);
        id
    }

    async fn bound(&self, raw_status: &str) -> Uuid {
        let id = self.order(raw_status);
        self.controller.bind(id).await.unwrap();
        wait_connected(&self.controller).await;
        id
    }

    async fn wait_step(&self, step: WorkflowStep) {
        let controller = self.controller.clone();
        eventually(Duration::from_secs(30), move || controller.snapshot().step == step).await;
    }
}

fn evidence() -> Evidence {
    Evidence {
        uri: "file:///photos/doorstep.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
    }
}

async fn eventually(within: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + within;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached within {within:?}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_connected(controller: &LifecycleController) {
    let mut rx = controller.subscribe_connectivity();
    tokio::time::timeout(
        Duration::from_secs(30),
        rx.wait_for(|state| *state == Connectivity::Connected),
    )
    .await
    .expect("push channel never connected")
    .expect("connectivity channel closed");
}

#[tokio::test(start_paused = true)]
async fn step_follows_server_statuses() {
    let h = harness();
    let id = h.bound("toShop").await;
    assert_eq!(h.controller.snapshot().step, WorkflowStep::ToShop);

    for (raw, step) in [
        ("dasher_arrived", WorkflowStep::Preparing),
        ("pickedUp", WorkflowStep::PickedUp),
        ("onTheWay", WorkflowStep::OnTheWay),
    ] {
        h.backend.server_set_status(id, raw);
        h.wait_step(step).await;
    }
}

#[tokio::test(start_paused = true)]
async fn only_the_immediate_successor_is_accepted() {
    let h = harness();
    let id = h.bound("toShop").await;

    assert_eq!(
        h.controller.request_transition(WorkflowStep::PickedUp).await,
        Err(TransitionError::InvalidTransition {
            from: WorkflowStep::ToShop,
            to: WorkflowStep::PickedUp,
        })
    );
    assert!(matches!(
        h.controller.request_transition(WorkflowStep::None).await,
        Err(TransitionError::InvalidTransition { .. })
    ));
    assert!(h.backend.status_writes(id).is_empty());

    h.controller
        .request_transition(WorkflowStep::Preparing)
        .await
        .unwrap();
    assert_eq!(h.backend.status_writes(id), vec!["dasher_arrived"]);
    h.wait_step(WorkflowStep::Preparing).await;
}

#[tokio::test(start_paused = true)]
async fn accepted_command_does_not_move_the_step_locally() {
    let h = harness();
    let id = h.bound("pickedUp").await;
    h.backend.set_push_online(false);

    h.controller
        .request_transition(WorkflowStep::OnTheWay)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.backend.status_writes(id), vec!["onTheWay"]);
    assert_eq!(h.controller.snapshot().step, WorkflowStep::PickedUp);

    let snapshot = h.controller.refresh().await.unwrap();
    assert_eq!(snapshot.step, WorkflowStep::OnTheWay);
}

#[tokio::test(start_paused = true)]
async fn second_request_while_one_is_in_flight_is_refused() {
    let h = harness();
    h.bound("toShop").await;
    h.backend.set_command_latency(Duration::from_secs(2));

    let controller = h.controller.clone();
    let first =
        tokio::spawn(async move { controller.request_transition(WorkflowStep::Preparing).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        h.controller.request_transition(WorkflowStep::Preparing).await,
        Err(TransitionError::TransitionInProgress)
    );
    assert_eq!(first.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn rejected_command_leaves_state_unchanged() {
    let h = harness();
    let id = h.bound("pickedUp").await;
    h.backend.reject_commands(true);

    let result = h.controller.request_transition(WorkflowStep::OnTheWay).await;

    assert!(matches!(result, Err(TransitionError::CommandRejected(_))));
    assert_eq!(h.controller.snapshot().step, WorkflowStep::PickedUp);
    assert!(h.backend.status_writes(id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn delivered_needs_proof_first() {
    let h = harness();
    h.bound("onTheWay").await;

    assert_eq!(
        h.controller.request_transition(WorkflowStep::Delivered).await,
        Err(TransitionError::ProofRequired)
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_events_are_idempotent() {
    let h = harness();
    let id = h.bound("toShop").await;

    h.backend.server_set_status(id, "pickedUp");
    h.wait_step(WorkflowStep::PickedUp).await;

    let mut rx = h.controller.subscribe();
    rx.borrow_and_update();
    h.backend.emit(id, "pickedUp");
    h.backend.emit(id, "pickedUp");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!rx.has_changed().unwrap());
    assert_eq!(h.controller.snapshot().step, WorkflowStep::PickedUp);
    assert_eq!(
        h.metrics
            .push_events_total
            .with_label_values(&["duplicate"])
            .get(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn poll_confirms_while_push_is_down() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    h.wait_step(WorkflowStep::Delivered).await;
    h.backend.set_push_online(false);

    tokio::time::sleep(Duration::from_secs(12)).await;
    h.backend.server_set_status(id, "completed");

    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;

    let reports = h.controller.confirmations();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].resolved_by, ResolutionSource::Poll);
    assert_eq!(h.backend.status_writes(id), vec!["waiting_for_confirmation"]);
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
    assert_eq!(h.controller.snapshot().order, None);
}

#[tokio::test(start_paused = true)]
async fn timer_resolves_when_nothing_else_answers() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    h.backend.set_reads_online(false);

    let controller = h.controller.clone();
    eventually(Duration::from_secs(200), move || controller.history().len() == 1).await;

    let reports = h.controller.confirmations();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].resolved_by, ResolutionSource::Timer);
    assert_eq!(
        h.backend.status_writes(id),
        vec!["waiting_for_confirmation", "completed"]
    );
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
    assert_eq!(h.controller.history()[0].raw_status, "completed");
}

#[tokio::test(start_paused = true)]
async fn racing_triggers_finalize_exactly_once() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.backend.server_set_status(id, "completed");

    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    let reports = h.controller.confirmations();
    assert_eq!(reports.len(), 1);
    assert_ne!(reports[0].resolved_by, ResolutionSource::Timer);
    assert_eq!(h.backend.availability_writes(h.courier_id).len(), 1);
    assert!(!h.backend.status_writes(id).contains(&"completed".to_string()));
    assert_eq!(
        h.metrics
            .finalizations_total
            .with_label_values(&["completed"])
            .get(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn completion_at_the_auto_resolve_deadline_finalizes_once() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    h.backend.server_set_status(id, "completed");

    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    let completions = h
        .backend
        .status_writes(id)
        .iter()
        .filter(|raw| raw.as_str() == "completed")
        .count();
    assert!(completions <= 1);
    assert_eq!(h.controller.confirmations().len(), 1);
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
    assert_eq!(
        h.metrics
            .finalizations_total
            .with_label_values(&["completed"])
            .get(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn disputed_no_show_is_never_auto_completed() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    h.wait_step(WorkflowStep::Delivered).await;
    h.backend
        .server_set_status(id, "waiting_for_no_show_confirmation");
    h.wait_step(WorkflowStep::DisputedNoShow).await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(
        h.backend.status_writes(id),
        vec!["waiting_for_confirmation"]
    );
    assert_eq!(
        h.backend.order(id).unwrap().raw_status,
        "waiting_for_no_show_confirmation"
    );
    assert!(h.controller.history().is_empty());
    assert!(h.backend.availability_writes(h.courier_id).is_empty());
    assert_eq!(h.controller.snapshot().step, WorkflowStep::DisputedNoShow);
    let attempt = h.controller.confirmation().await.unwrap();
    assert_eq!(attempt.state, AttemptState::Cancelled);

    h.backend.server_set_status(id, "completed");
    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;

    assert_eq!(h.controller.history()[0].raw_status, "completed");
    assert_eq!(
        h.backend.status_writes(id),
        vec!["waiting_for_confirmation"]
    );
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
    assert!(h.controller.confirmations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dispute_rolled_back_reopens_confirmation() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    let first = h.controller.confirmation().await.unwrap();
    h.backend
        .server_set_status(id, "waiting_for_no_show_confirmation");
    h.wait_step(WorkflowStep::DisputedNoShow).await;

    h.backend.server_set_status(id, "waiting_for_confirmation");
    h.wait_step(WorkflowStep::Delivered).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = h.controller.confirmation().await.unwrap();
    assert_ne!(second.attempt_id, first.attempt_id);
    assert_eq!(second.state, AttemptState::Open);

    h.backend.set_reads_online(false);
    let controller = h.controller.clone();
    eventually(Duration::from_secs(200), move || controller.history().len() == 1).await;

    let reports = h.controller.confirmations();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attempt_id, second.attempt_id);
    assert_eq!(reports[0].resolved_by, ResolutionSource::Timer);
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
}

#[tokio::test(start_paused = true)]
async fn server_cancellation_withdraws_the_attempt() {
    let h = harness();
    let id = h.bound("onTheWay").await;

    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    h.wait_step(WorkflowStep::Delivered).await;
    h.backend.server_set_status(id, "cancelled_by_customer");

    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert!(h.controller.confirmations().is_empty());
    assert_eq!(
        h.backend.status_writes(id),
        vec!["waiting_for_confirmation"]
    );
    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
}

#[tokio::test(start_paused = true)]
async fn rebinding_cancels_the_old_attempt() {
    let h = harness();
    let first = h.bound("onTheWay").await;
    h.controller.start_confirmation_phase(evidence()).await.unwrap();
    let attempt = h.controller.confirmation().await.unwrap();
    assert_eq!(attempt.state, AttemptState::Open);

    let second = h.order("toShop");
    h.controller.bind(second).await.unwrap();
    assert!(h.controller.confirmation().await.is_none());

    h.backend.server_set_status(first, "completed");
    tokio::time::sleep(Duration::from_secs(300)).await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.order.map(|order| order.id), Some(second));
    assert_eq!(snapshot.step, WorkflowStep::ToShop);
    assert_eq!(
        h.backend.status_writes(first),
        vec!["waiting_for_confirmation"]
    );
    assert!(h.backend.availability_writes(h.courier_id).is_empty());
    assert!(h.controller.history().is_empty());
    assert!(h.controller.confirmations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_picks_up_changes_missed_while_down() {
    let h = harness();
    let id = h.bound("toShop").await;

    h.backend.drop_connections(id);
    h.backend.server_set_status(id, "dasher_arrived");
    h.wait_step(WorkflowStep::Preparing).await;

    wait_connected(&h.controller).await;
    h.backend.server_set_status(id, "pickedUp");
    h.wait_step(WorkflowStep::PickedUp).await;
    assert!(h.metrics.push_reconnects_total.get() >= 1);
}

#[tokio::test(start_paused = true)]
async fn bind_checks_assignment_and_terminal_status() {
    let h = harness();

    let foreign = DeliveryOrder::new(Uuid::new_v4(), "toShop", Some(Uuid::new_v4()));
    let foreign_id = foreign.id;
    h.backend.insert_order(foreign);
    assert_eq!(
        h.controller.bind(foreign_id).await.unwrap_err(),
        BindError::NotAssigned {
            order_id: foreign_id
        }
    );

    let done = h.order("completed");
    assert!(matches!(
        h.controller.bind(done).await,
        Err(BindError::AlreadyTerminal {
            step: WorkflowStep::Completed,
            ..
        })
    ));
    assert_eq!(h.controller.snapshot().order, None);
}

#[tokio::test(start_paused = true)]
async fn recover_rebinds_the_active_order() {
    let h = harness();
    h.order("completed");
    let id = h.order("pickedUp");

    let snapshot = h.controller.recover().await.unwrap().unwrap();

    assert_eq!(snapshot.order.map(|order| order.id), Some(id));
    assert_eq!(snapshot.step, WorkflowStep::PickedUp);
}

#[tokio::test(start_paused = true)]
async fn recover_rebinds_a_disputed_order_until_it_settles() {
    let h = harness();
    let id = h.order("waiting_for_no_show_confirmation");

    let snapshot = h.controller.recover().await.unwrap().unwrap();
    assert_eq!(snapshot.order.map(|order| order.id), Some(id));
    assert_eq!(snapshot.step, WorkflowStep::DisputedNoShow);
    wait_connected(&h.controller).await;

    h.backend.server_set_status(id, "no_show");
    let controller = h.controller.clone();
    eventually(Duration::from_secs(30), move || controller.history().len() == 1).await;

    assert_eq!(
        h.backend.availability_writes(h.courier_id),
        vec![CourierStatus::Available]
    );
    assert!(h.backend.status_writes(id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn completion_request_routes_through_confirmation() {
    let h = harness();
    let id = h.bound("waiting_for_confirmation").await;

    h.controller
        .request_transition(WorkflowStep::Completed)
        .await
        .unwrap();

    assert!(h.backend.status_writes(id).is_empty());
    let attempt = h.controller.confirmation().await.unwrap();
    assert_eq!(attempt.state, AttemptState::Open);
}

#[tokio::test(start_paused = true)]
async fn unbind_stops_all_background_work() {
    let h = harness();
    let id = h.bound("onTheWay").await;
    h.controller.start_confirmation_phase(evidence()).await.unwrap();

    let released = h.controller.unbind().await.unwrap();
    assert_eq!(released.id, id);
    assert_eq!(h.controller.connectivity(), Connectivity::Disconnected);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(
        h.backend.status_writes(id),
        vec!["waiting_for_confirmation"]
    );
    assert!(h.backend.availability_writes(h.courier_id).is_empty());
    assert_eq!(
        h.controller.request_transition(WorkflowStep::Delivered).await,
        Err(TransitionError::NoActiveOrder)
    );
}
