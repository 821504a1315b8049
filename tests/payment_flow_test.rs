//! End-to-end payment flows over the in-memory stores: purchase, debit,
//! replay, polling, expiry, and the concurrency properties the engine
//! guarantees.

use std::sync::Arc;

use tollgate::catalog::Catalog;
use tollgate::ledger::{InMemoryLedgerStore, LedgerStore};
use tollgate::metering::{ActionCosts, BillableAction, UsageMeter};
use tollgate::payments::mobile_money::test::MockMobileMoneyClient;
use tollgate::payments::{
    ChargeState, MobileMoneyAdapter, PaymentIntent, PollOutcome, TerminalStatus,
};
use tollgate::reconcile::{ReconcileOutcome, ReconciliationEngine};
use tollgate::sessions::{
    InMemorySessionStore, PaymentProvider, PaymentSession, SessionStatus, SessionStore,
    SessionSweeper, SweeperConfig,
};

fn catalog() -> Catalog {
    Catalog::builder()
        .package("starter")
            .name("Starter")
            .credits(5)
            .price_minor(499, "usd")
            .done()
        .build()
}

struct World {
    ledger: Arc<InMemoryLedgerStore>,
    sessions: Arc<InMemorySessionStore>,
    engine: ReconciliationEngine<InMemoryLedgerStore, InMemorySessionStore>,
    meter: UsageMeter<InMemoryLedgerStore>,
}

impl World {
    fn new() -> Self {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let engine = ReconciliationEngine::new(ledger.clone(), sessions.clone());
        let meter = UsageMeter::new(ledger.clone(), ActionCosts::new());
        Self {
            ledger,
            sessions,
            engine,
            meter,
        }
    }

    async fn pending_card_session(&self, user: &str, provider_ref: &str) -> PaymentSession {
        let package = catalog().get("starter").cloned().unwrap();
        let session = PaymentSession::new(user, PaymentProvider::Card, &package);
        self.sessions.create(&session).await.unwrap();
        self.sessions
            .set_provider_ref(&session.id, provider_ref)
            .await
            .unwrap();
        session
    }
}

fn success_intent(provider: PaymentProvider, provider_ref: &str) -> PaymentIntent {
    PaymentIntent {
        provider,
        provider_ref: provider_ref.to_string(),
        session_id: None,
        user_id: None,
        amount_minor: Some(499),
        currency: Some("usd".to_string()),
        terminal: TerminalStatus::Succeeded,
    }
}

#[tokio::test]
async fn fresh_user_purchase_and_spend_cycle() {
    let world = World::new();

    // Fresh user, balance 0: the action is refused.
    let refused = world.meter.charge("u1", BillableAction::Improvement).await.unwrap();
    assert!(!refused.authorized);

    // A success event for their checkout grants 5 credits.
    let session = world.pending_card_session("u1", "cs_1").await;
    let outcome = world
        .engine
        .reconcile(&session.id, &success_intent(PaymentProvider::Card, "cs_1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Granted { balance: 5 });

    // Now the action is authorized and costs 2.
    let charged = world.meter.charge("u1", BillableAction::Improvement).await.unwrap();
    assert!(charged.authorized);
    assert_eq!(charged.balance, 3);

    // Replaying the identical success event changes nothing.
    let replay = world
        .engine
        .reconcile(&session.id, &success_intent(PaymentProvider::Card, "cs_1"))
        .await
        .unwrap();
    assert_eq!(
        replay,
        ReconcileOutcome::AlreadyTerminal(SessionStatus::Completed)
    );
    assert_eq!(world.ledger.balance("u1").await.unwrap(), 3);

    // Ledger and balance agree at quiescence.
    assert_eq!(world.ledger.entries_total("u1"), 3);
}

#[tokio::test]
async fn mobile_money_polls_until_settled_then_grants_once() {
    let world = World::new();
    let client = MockMobileMoneyClient::new("conv_P1");
    client.push_status(Ok(ChargeState::Pending));
    client.push_status(Ok(ChargeState::Pending));
    client.push_status(Ok(ChargeState::Pending));
    client.push_status(Ok(ChargeState::Succeeded));
    let adapter = MobileMoneyAdapter::new(world.sessions.clone(), client, catalog());

    let payment = adapter.initiate("u1", "starter", "254712345678").await.unwrap();

    // Three consecutive polls observe "not yet settled".
    for _ in 0..3 {
        assert_eq!(
            adapter.poll(&payment.payment_id).await.unwrap(),
            PollOutcome::StillPending
        );
        assert_eq!(world.ledger.balance("u1").await.unwrap(), 0);
    }

    // The fourth observes success; reconciliation grants exactly once,
    // keyed by the gateway conversation id.
    let PollOutcome::Resolved(intent) = adapter.poll(&payment.payment_id).await.unwrap() else {
        panic!("expected resolved poll");
    };
    let outcome = world.engine.reconcile(&payment.payment_id, &intent).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Granted { balance: 5 });

    let entries = world.ledger.entries("u1", 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].external_ref.as_deref(), Some("conv_P1"));

    // Any further poll (user-triggered or scheduled) is a terminal no-op.
    assert_eq!(
        adapter.poll(&payment.payment_id).await.unwrap(),
        PollOutcome::AlreadySettled(SessionStatus::Completed)
    );
    assert_eq!(world.ledger.balance("u1").await.unwrap(), 5);
}

#[tokio::test]
async fn concurrent_success_events_grant_exactly_once() {
    let world = World::new();
    let session = world.pending_card_session("u1", "cs_racy").await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = ReconciliationEngine::new(world.ledger.clone(), world.sessions.clone());
        let id = session.id.clone();
        handles.push(tokio::spawn(async move {
            engine
                .reconcile(&id, &success_intent(PaymentProvider::Card, "cs_racy"))
                .await
                .unwrap()
        }));
    }

    let mut grants = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ReconcileOutcome::Granted { .. }) {
            grants += 1;
        }
    }

    assert_eq!(grants, 1);
    assert_eq!(world.ledger.balance("u1").await.unwrap(), 5);
    assert_eq!(world.ledger.entries("u1", 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_debits_cannot_overdraw() {
    let world = World::new();
    world.ledger.grant("u1", 7, "pay_seed", "starter").await.unwrap();
    let meter = Arc::new(UsageMeter::new(world.ledger.clone(), ActionCosts::new()));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let meter = meter.clone();
        handles.push(tokio::spawn(async move {
            meter.charge("u1", BillableAction::JobTailoring).await.unwrap()
        }));
    }

    let mut spent = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.authorized {
            spent += outcome.cost;
        }
    }

    // 10 attempts at cost 2 against 7 credits: at most 3 succeed.
    assert!(spent <= 7);
    let balance = world.ledger.balance("u1").await.unwrap();
    assert!(balance >= 0);
    assert_eq!(balance, 7 - spent);
    assert_eq!(world.ledger.entries_total("u1"), balance);
}

#[tokio::test]
async fn expired_session_rejects_late_success() {
    let world = World::new();
    let package = catalog().get("starter").cloned().unwrap();

    let mut session = PaymentSession::new("u1", PaymentProvider::Card, &package);
    session.created_at = 1_000; // long past the TTL
    world.sessions.create(&session).await.unwrap();
    world.sessions.set_provider_ref(&session.id, "cs_old").await.unwrap();

    let sweeper = SessionSweeper::new(world.sessions.clone(), SweeperConfig::default());
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    // The money shows up anyway: terminal short-circuit, no grant. The
    // unique external ref still protects a manual operator re-grant.
    let outcome = world
        .engine
        .reconcile(&session.id, &success_intent(PaymentProvider::Card, "cs_old"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyTerminal(SessionStatus::Expired));
    assert_eq!(world.ledger.balance("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn failed_then_completed_sessions_keep_ledger_consistent() {
    let world = World::new();

    let failed = world.pending_card_session("u1", "cs_fail").await;
    let mut failure = success_intent(PaymentProvider::Card, "cs_fail");
    failure.terminal = TerminalStatus::Failed;
    world.engine.reconcile(&failed.id, &failure).await.unwrap();

    let paid = world.pending_card_session("u1", "cs_ok").await;
    world
        .engine
        .reconcile(&paid.id, &success_intent(PaymentProvider::Card, "cs_ok"))
        .await
        .unwrap();

    world.meter.charge("u1", BillableAction::Analysis).await.unwrap();

    assert_eq!(world.ledger.balance("u1").await.unwrap(), 4);
    assert_eq!(world.ledger.entries_total("u1"), 4);
    assert_eq!(
        world.sessions.get(&failed.id).await.unwrap().unwrap().status,
        SessionStatus::Failed
    );
    assert_eq!(
        world.sessions.get(&paid.id).await.unwrap().unwrap().status,
        SessionStatus::Completed
    );
}
