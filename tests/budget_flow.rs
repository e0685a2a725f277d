use std::sync::Arc;

use budgetguard::app::{AppConfig, AppState};
use budgetguard::budget::{
    AlertLevel, AuditOutcome, BudgetNotification, CompressionMode, BUDGET_EXCEEDED_REASON,
};
use budgetguard::notify::{BudgetNotice, ChannelNotifier};
use budgetguard::storage::{ControlStateStore, PolicyWrite};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

async fn create_state() -> (Arc<AppState>, UnboundedReceiver<BudgetNotice>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let paths = budgetguard::platform::AppPaths::with_data_dir(temp_dir.path()).unwrap();
    let (notifier, receiver) = ChannelNotifier::new();
    let state = AppState::with_notifier(AppConfig::default(), paths, Arc::new(notifier))
        .await
        .unwrap();
    (Arc::new(state), receiver, temp_dir)
}

fn notification(cost: &str, at: DateTime<Utc>) -> BudgetNotification {
    BudgetNotification {
        cost_amount: cost.parse().unwrap(),
        budget_amount: Decimal::new(10, 0),
        project_id: Some("checkdarn".to_string()),
        timestamp: at,
        budget_display_name: Some("storage-budget".to_string()),
        currency_code: Some("USD".to_string()),
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn escalation_over_a_billing_month() {
    let (state, mut receiver, _temp_dir) = create_state().await;
    let start = base_time();

    let steps = [
        ("4.5", AlertLevel::Info, true, CompressionMode::Normal),
        ("6", AlertLevel::Warning, true, CompressionMode::Aggressive),
        ("8.5", AlertLevel::Critical, true, CompressionMode::Emergency),
        ("9.5", AlertLevel::Emergency, false, CompressionMode::Emergency),
    ];

    for (hour, (cost, level, upload, mode)) in steps.iter().enumerate() {
        let at = start + Duration::hours(hour as i64);
        let outcome = state
            .handle_notification(&notification(cost, at))
            .await
            .unwrap();
        assert_eq!(outcome.level, *level);

        let committed = state.current_policy().await.unwrap().unwrap();
        assert_eq!(committed.policy.upload_enabled, *upload);
        assert_eq!(committed.policy.compression_mode, *mode);
        assert_eq!(committed.event_time, at);

        let notice = receiver.recv().await.unwrap();
        assert_eq!(notice.level, *level);
    }

    let committed = state.current_policy().await.unwrap().unwrap();
    assert_eq!(committed.policy.reason.as_deref(), Some(BUDGET_EXCEEDED_REASON));
    assert_eq!(committed.version, 4);

    let records = state.store().recent_audit_records(10).await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].alert_level, AlertLevel::Emergency);
}

#[tokio::test]
async fn redelivered_notification_is_a_no_op() {
    let (state, mut receiver, _temp_dir) = create_state().await;
    let event = notification("8.5", base_time());

    let first = state.handle_notification(&event).await.unwrap();
    let committed = state.current_policy().await.unwrap().unwrap();

    // Same amounts written with a different scale
    let mut redelivered = event.clone();
    redelivered.cost_amount = Decimal::new(850, 2);
    let second = state.handle_notification(&redelivered).await.unwrap();

    assert_eq!(first.audit, AuditOutcome::Recorded);
    assert_eq!(second.audit, AuditOutcome::Duplicate);
    assert_eq!(second.policy_write, PolicyWrite::Superseded);
    assert_eq!(state.current_policy().await.unwrap().unwrap(), committed);
    assert_eq!(state.store().recent_audit_records(10).await.unwrap().len(), 1);

    assert!(receiver.try_recv().is_ok());
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn stale_notification_does_not_roll_back_policy() {
    let (state, _receiver, _temp_dir) = create_state().await;
    let newer = base_time();
    let older = newer - Duration::hours(2);

    state
        .handle_notification(&notification("9.5", newer))
        .await
        .unwrap();
    let stale = state
        .handle_notification(&notification("4.5", older))
        .await
        .unwrap();

    assert_eq!(stale.policy_write, PolicyWrite::Superseded);
    assert!(!stale.notified);

    let committed = state.current_policy().await.unwrap().unwrap();
    assert!(!committed.policy.upload_enabled);
    assert_eq!(committed.event_time, newer);
}

#[tokio::test]
async fn concurrent_notifications_settle_on_newest() {
    let (state, _receiver, _temp_dir) = create_state().await;
    let start = base_time();

    let mut tasks = Vec::new();
    for minute in 0..8i64 {
        let state = state.clone();
        let cost = if minute == 7 { "9.5" } else { "4.5" };
        let event = notification(cost, start + Duration::minutes(minute));
        tasks.push(tokio::spawn(async move {
            state.handle_notification(&event).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let committed = state.current_policy().await.unwrap().unwrap();
    assert_eq!(committed.event_time, start + Duration::minutes(7));
    assert_eq!(committed.policy.warning_level, AlertLevel::Emergency);
    assert_eq!(state.store().recent_audit_records(20).await.unwrap().len(), 8);
}

#[tokio::test]
async fn invalid_budget_leaves_state_untouched() {
    let (state, mut receiver, _temp_dir) = create_state().await;
    let mut event = notification("1", base_time());
    event.budget_amount = Decimal::ZERO;

    let result = state.handle_notification(&event).await;
    assert!(matches!(result, Err(budgetguard::Error::InvalidBudget(_))));

    assert!(state.current_policy().await.unwrap().is_none());
    assert!(state.store().recent_audit_records(10).await.unwrap().is_empty());
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn estimator_reports_catalog_size() {
    let (state, _receiver, _temp_dir) = create_state().await;
    for i in 0..1000 {
        state
            .store()
            .register_object(&format!("obj-{}", i), Some("images/photo.jpg"))
            .await
            .unwrap();
    }
    state.store().register_object("draft", None).await.unwrap();

    let sample = state.estimator().sample().await.unwrap();
    assert_eq!(sample.total_objects, 1000);
    assert_eq!(sample.estimated_size_gb.round_dp(4), Decimal::new(1907, 4));
    assert_eq!(sample.cost_estimate_usd.round_dp(5), Decimal::new(496, 5));

    let stats = state.get_database().get_statistics().await.unwrap();
    assert_eq!(stats.stats_samples_count, 1);
    assert_eq!(stats.stored_objects_count, 1001);
}
