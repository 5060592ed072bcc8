//! End-to-end cycle tests against a real SQLite file and the mock gateway.

use paycycle::db::{init_db, Ledger, NewParticipant};
use paycycle::domain::{AccountOwner, Money, ParticipantId, TimeMs};
use paycycle::gateway::{HoldGateway, MockHoldGateway};
use paycycle::notify::{NotificationEmitter, RecordingEmitter};
use paycycle::{EngineError, Payday};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn money(s: &str) -> Money {
    Money::from_str_canonical(s).unwrap()
}

async fn setup() -> (Arc<Ledger>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    (Arc::new(Ledger::new(pool)), temp_dir)
}

/// Let the millisecond clock tick past the last commitment mtime, so the
/// cycle start strictly postdates it.
async fn settle_clock() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn run_payday(
    ledger: Arc<Ledger>,
    gateway: Arc<dyn HoldGateway>,
    emitter: Arc<dyn NotificationEmitter>,
    dump_dir: PathBuf,
) -> Result<paycycle::CycleRecord, EngineError> {
    settle_clock().await;
    let mut payday = Payday::start(ledger, gateway, emitter, 5, dump_dir).await?;
    payday.run().await?;
    Ok(payday.cycle().clone())
}

async fn balance(ledger: &Ledger, p: ParticipantId) -> Money {
    ledger.participant(p).await.unwrap().balance
}

#[tokio::test]
async fn test_payday_moves_money_via_card_charge() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6.00")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new());
    let emitter = Arc::new(RecordingEmitter::new());
    let cycle = run_payday(
        ledger.clone(),
        gateway.clone(),
        emitter.clone(),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    // The $6.00 commitment is funded by the minimum card charge: $10.00
    // gross, $0.59 fee, $9.41 net. $6.00 flows on to the team owner.
    assert_eq!(balance(&ledger, obama).await, money("3.41"));
    assert_eq!(balance(&ledger, owner).await, money("6.00"));
    assert_eq!(
        ledger.balance_of(AccountOwner::Team(team)).await.unwrap(),
        Money::zero()
    );
    ledger.self_check().await.unwrap();

    let stats = ledger.cycle_stats(cycle.id).await.unwrap();
    assert_eq!(stats.ncharges, 1);
    assert_eq!(stats.charge_volume, money("10.00"));
    assert_eq!(stats.charge_fees_volume, money("0.59"));
    assert_eq!(stats.ntransfers, 2); // commitment plus draw
    assert_eq!(stats.transfer_volume, money("12.00"));
    assert_eq!(stats.nactive, 2);

    // The capture consumed the hold; nothing stays authorized.
    assert!(gateway.outstanding_holds().is_empty());

    // Default notify mask includes successes.
    let notices = emitter.notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].succeeded);
    assert_eq!(notices[0].amount, money("9.41"));
}

#[tokio::test]
async fn test_funded_giver_pays_from_balance_without_charge() {
    let (ledger, temp) = setup().await;
    let alice = ledger
        .create_participant(NewParticipant::new("alice").with_card())
        .await
        .unwrap();
    ledger
        .seed_exchange(alice, money("10"), TimeMs::new(10))
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("a-team", owner, true).await.unwrap();
    ledger.set_commitment(alice, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new());
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(balance(&ledger, alice).await, money("4"));
    assert_eq!(balance(&ledger, owner).await, money("6"));
    assert!(gateway.created_holds().is_empty());
    assert!(gateway.captured_holds().is_empty());
}

#[tokio::test]
async fn test_suspicious_giver_is_not_charged() {
    let (ledger, temp) = setup().await;
    let shady = ledger
        .create_participant(NewParticipant::new("shady").with_card().suspicious())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("a-team", owner, true).await.unwrap();
    ledger.set_commitment(shady, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new());
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(balance(&ledger, shady).await, Money::zero());
    assert_eq!(balance(&ledger, owner).await, Money::zero());
    assert!(gateway.created_holds().is_empty());
}

#[tokio::test]
async fn test_commitment_to_suspicious_owner_is_skipped() {
    let (ledger, temp) = setup().await;
    let alice = ledger
        .create_participant(NewParticipant::new("alice").with_card())
        .await
        .unwrap();
    let shady = ledger
        .create_participant(NewParticipant::new("shady").suspicious())
        .await
        .unwrap();
    let team = ledger.create_team("bad-team", shady, true).await.unwrap();
    ledger.set_commitment(alice, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new());
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(balance(&ledger, alice).await, Money::zero());
    assert_eq!(balance(&ledger, shady).await, Money::zero());
    assert!(gateway.created_holds().is_empty());
}

#[tokio::test]
async fn test_sufficient_existing_hold_is_reused() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6")).await.unwrap();

    // A crashed previous run left a hold that already covers the gross.
    let gateway = Arc::new(MockHoldGateway::new().with_authorized_hold(obama, money("10.00")));
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert!(gateway.created_holds().is_empty());
    assert!(gateway.cancelled_holds().is_empty());
    assert_eq!(gateway.captured_holds().len(), 1);
    assert_eq!(balance(&ledger, obama).await, money("3.41"));
}

#[tokio::test]
async fn test_insufficient_hold_is_cancelled_and_replaced() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new().with_authorized_hold(obama, money("5.00")));
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(gateway.cancelled_holds().len(), 1);
    assert_eq!(gateway.cancelled_holds()[0].amount, money("5.00"));
    assert_eq!(gateway.created_holds().len(), 1);
    assert_eq!(gateway.created_holds()[0].amount, money("10.00"));
    assert_eq!(balance(&ledger, obama).await, money("3.41"));
}

#[tokio::test]
async fn test_stale_hold_for_noncandidate_is_cancelled() {
    let (ledger, temp) = setup().await;
    let idle = ledger
        .create_participant(NewParticipant::new("idle").with_card())
        .await
        .unwrap();

    let gateway = Arc::new(MockHoldGateway::new().with_authorized_hold(idle, money("10.00")));
    run_payday(
        ledger.clone(),
        gateway.clone(),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(gateway.cancelled_holds().len(), 1);
    assert!(gateway.outstanding_holds().is_empty());
}

#[tokio::test]
async fn test_declined_card_counts_and_skips_commitment() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new().declining(obama));
    let emitter = Arc::new(RecordingEmitter::new());
    let cycle = run_payday(
        ledger.clone(),
        gateway,
        emitter.clone(),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    // The decline is an expected per-card outcome, not a cycle failure.
    assert_eq!(balance(&ledger, obama).await, Money::zero());
    assert_eq!(balance(&ledger, owner).await, Money::zero());
    let record = ledger.cycle(cycle.id).await.unwrap().unwrap();
    assert_eq!(record.ncc_failing, 1);

    let notices = emitter.notices();
    assert_eq!(notices.len(), 1);
    assert!(!notices[0].succeeded);
}

#[tokio::test]
async fn test_gateway_failure_on_create_aborts_cycle() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6")).await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new().failing_create(obama));
    let err = run_payday(
        ledger.clone(),
        gateway,
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Gateway(_)));

    // Nothing posted to the durable ledger.
    assert_eq!(balance(&ledger, obama).await, Money::zero());
    assert_eq!(balance(&ledger, owner).await, Money::zero());
    ledger.self_check().await.unwrap();
}

#[tokio::test]
async fn test_capture_failure_dumps_staged_journal() {
    let (ledger, temp) = setup().await;
    let obama = ledger
        .create_participant(NewParticipant::new("obama").with_card())
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("whitehouse", owner, true).await.unwrap();
    ledger.set_commitment(obama, team, money("6")).await.unwrap();

    let dump_dir = temp.path().join("dumps");
    let gateway = Arc::new(MockHoldGateway::new().failing_capture_for(obama));
    let err = run_payday(
        ledger.clone(),
        gateway,
        Arc::new(RecordingEmitter::new()),
        dump_dir.clone(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Gateway(_)));

    let dumps: Vec<_> = std::fs::read_dir(&dump_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with("_journal.csv"))
        .collect();
    assert_eq!(dumps.len(), 1);

    // Durable balances untouched; the staged journal was never posted.
    assert_eq!(balance(&ledger, obama).await, Money::zero());
    assert_eq!(balance(&ledger, owner).await, Money::zero());
    ledger.self_check().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_cycle_resumes_without_repeating_payin() {
    let (ledger, temp) = setup().await;
    let alice = ledger
        .create_participant(NewParticipant::new("alice"))
        .await
        .unwrap();
    ledger
        .seed_exchange(alice, money("10"), TimeMs::new(10))
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("a-team", owner, true).await.unwrap();
    ledger.set_commitment(alice, team, money("6")).await.unwrap();
    settle_clock().await;

    // Open the cycle and mark both phases done, as a run that crashed just
    // before closing would have.
    let (cycle, _) = ledger.start_cycle(TimeMs::now()).await.unwrap();
    ledger.mark_stage_done().await.unwrap();
    ledger.mark_stage_done().await.unwrap();

    let gateway = Arc::new(MockHoldGateway::new());
    let mut payday = Payday::start(
        ledger.clone(),
        gateway,
        Arc::new(RecordingEmitter::new()),
        5,
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();
    assert_eq!(payday.cycle().id, cycle.id);
    payday.run().await.unwrap();

    // Payin was not rerun: no money moved.
    assert_eq!(balance(&ledger, alice).await, money("10"));
    assert_eq!(balance(&ledger, owner).await, Money::zero());
    assert!(!ledger
        .cycle(cycle.id)
        .await
        .unwrap()
        .unwrap()
        .is_open());
}

#[tokio::test]
async fn test_take_over_chain_converges() {
    let (ledger, temp) = setup().await;
    let a = ledger
        .create_participant(NewParticipant::new("a").unclaimed())
        .await
        .unwrap();
    let b = ledger
        .create_participant(NewParticipant::new("b").unclaimed())
        .await
        .unwrap();
    let c = ledger
        .create_participant(NewParticipant::new("c"))
        .await
        .unwrap();
    ledger
        .seed_exchange(a, money("10"), TimeMs::new(10))
        .await
        .unwrap();
    // Declared out of order on purpose; the pass loop resolves the chain.
    ledger.add_absorption(b, c).await.unwrap();
    ledger.add_absorption(a, b).await.unwrap();

    run_payday(
        ledger.clone(),
        Arc::new(MockHoldGateway::new()),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(balance(&ledger, a).await, Money::zero());
    assert_eq!(balance(&ledger, b).await, Money::zero());
    assert_eq!(balance(&ledger, c).await, money("10"));
    ledger.self_check().await.unwrap();
}

#[tokio::test]
async fn test_take_over_declaration_cycle_errors() {
    let (ledger, temp) = setup().await;
    let a = ledger
        .create_participant(NewParticipant::new("a").unclaimed())
        .await
        .unwrap();
    let b = ledger
        .create_participant(NewParticipant::new("b").unclaimed())
        .await
        .unwrap();
    ledger
        .seed_exchange(a, money("10"), TimeMs::new(10))
        .await
        .unwrap();
    ledger.add_absorption(a, b).await.unwrap();
    ledger.add_absorption(b, a).await.unwrap();

    let err = run_payday(
        ledger.clone(),
        Arc::new(MockHoldGateway::new()),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::AbsorptionLoop(_)));
}

#[tokio::test]
async fn test_notify_mask_suppresses_unwanted_notices() {
    let (ledger, temp) = setup().await;
    let quiet = ledger
        .create_participant(NewParticipant::new("quiet").with_card().notify_charge(0))
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("a-team", owner, true).await.unwrap();
    ledger.set_commitment(quiet, team, money("6")).await.unwrap();

    let emitter = Arc::new(RecordingEmitter::new());
    run_payday(
        ledger.clone(),
        Arc::new(MockHoldGateway::new()),
        emitter.clone(),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(balance(&ledger, quiet).await, money("3.41"));
    assert!(emitter.notices().is_empty());
}

#[tokio::test]
async fn test_cached_amounts_refresh_after_payday() {
    let (ledger, temp) = setup().await;
    let alice = ledger
        .create_participant(NewParticipant::new("alice"))
        .await
        .unwrap();
    ledger
        .seed_exchange(alice, money("20"), TimeMs::new(10))
        .await
        .unwrap();
    let owner = ledger
        .create_participant(NewParticipant::new("owner"))
        .await
        .unwrap();
    let team = ledger.create_team("a-team", owner, true).await.unwrap();
    ledger.set_commitment(alice, team, money("6")).await.unwrap();

    run_payday(
        ledger.clone(),
        Arc::new(MockHoldGateway::new()),
        Arc::new(RecordingEmitter::new()),
        temp.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(ledger.participant(alice).await.unwrap().giving, money("6"));
    assert_eq!(
        ledger.participant(owner).await.unwrap().receiving,
        money("6")
    );
    assert_eq!(ledger.team(team).await.unwrap().receiving, money("6"));
}
