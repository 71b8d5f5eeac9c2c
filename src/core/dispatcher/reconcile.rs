use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::config::DispatcherConfig;
use crate::core::store::Store;
use crate::core::store::executions::ExecutionOutcome;
use crate::core::store::types::ExecutionStatus;

/// One reconciliation pass over reservations stuck in `held` past the grace
/// period. These only exist after a crash between reserving and settling.
///
/// Two cases:
/// - the execution reached `completed` but the commit never landed: the
///   service was delivered, so the reservation is committed now;
/// - everything else (execution missing, pending, running or failed): the
///   outcome is unknown or bad, so the user is refunded in full and the
///   execution is finalized as failed.
///
/// Returns how many reservations were settled.
pub async fn reconcile_stale(store: &Store, config: &DispatcherConfig) -> Result<usize> {
    let cutoff = (chrono::Utc::now()
        - chrono::Duration::milliseconds(config.reconcile_grace.as_millis() as i64))
    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    let stale = store.held_reservations_older_than(&cutoff).await?;
    let mut settled = 0;

    for reservation in stale {
        let execution = match &reservation.execution_id {
            Some(id) => store.get_execution(id).await?,
            None => None,
        };

        match execution {
            Some(execution) if execution.status == ExecutionStatus::Completed => {
                // Safe to charge: the agent delivered and the process died
                // before the commit. Recover the publisher from the
                // execution row.
                let publisher_id = match store.get_agent(&execution.agent_id).await? {
                    Some(agent) => agent.publisher_id,
                    None => {
                        warn!(
                            "Reconcile: agent {} for execution {} is gone, refunding reservation {}",
                            execution.agent_id, execution.id, reservation.token
                        );
                        store.release_reservation(&reservation.token).await?;
                        settled += 1;
                        continue;
                    }
                };
                if store
                    .commit_reservation(
                        &reservation.token,
                        &publisher_id,
                        config.platform_fee_percent,
                    )
                    .await?
                    .is_some()
                {
                    info!(
                        "Reconcile: committed reservation {} for completed execution {}",
                        reservation.token, execution.id
                    );
                    settled += 1;
                }
            }
            execution => {
                if let Some(execution) = &execution {
                    if !execution.status.is_terminal() {
                        let outcome = ExecutionOutcome::Failed {
                            error:
                                "Internal: execution abandoned, credits refunded by reconciliation"
                                    .to_string(),
                        };
                        store.finalize_execution(&execution.id, &outcome, 0).await?;
                    }
                }
                if store.release_reservation(&reservation.token).await? {
                    info!(
                        "Reconcile: released stale reservation {} ({} credits back to {})",
                        reservation.token, reservation.amount, reservation.user_id
                    );
                    settled += 1;
                }
            }
        }
    }

    Ok(settled)
}

/// Background sweep, spawned once at startup.
pub fn spawn_sweeper(store: Arc<Store>, config: DispatcherConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match reconcile_stale(&store, &config).await {
                Ok(0) => {}
                Ok(n) => info!("Reconciliation settled {n} stale reservation(s)"),
                Err(e) => error!("Reconciliation pass failed: {e:#}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::catalog::NewAgent;
    use crate::core::store::executions::NewExecution;
    use crate::core::store::test_store;
    use crate::core::store::types::ReservationState;
    use std::time::Duration;

    fn sweep_now() -> DispatcherConfig {
        DispatcherConfig {
            reconcile_grace: Duration::ZERO,
            platform_fee_percent: 20,
            ..Default::default()
        }
    }

    async fn seed_agent(store: &Store) -> String {
        store
            .register_agent(NewAgent {
                publisher_id: "pub-1".to_string(),
                name: "Echo".to_string(),
                webhook_url: "https://agents.example.com/hook".to_string(),
                webhook_secret: "whsec_test".to_string(),
                price: 10,
                platform: None,
                input_schema: serde_json::json!({}),
            })
            .await
            .unwrap()
            .id
    }

    async fn seed_execution(store: &Store, id: &str, agent_id: &str) {
        store
            .create_execution(NewExecution {
                id: id.to_string(),
                agent_id: agent_id.to_string(),
                user_id: "u1".to_string(),
                account_id: None,
                input: serde_json::json!({}),
                request_id: uuid::Uuid::new_v4().to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completed_execution_with_held_reservation_is_committed() {
        // Crash between finalize(completed) and commit.
        let store = test_store();
        let agent_id = seed_agent(&store).await;
        store.grant_credits("u1", 10).await.unwrap();
        let token = store.reserve_credits("u1", 10, "e1").await.unwrap();
        seed_execution(&store, "e1", &agent_id).await;
        store.mark_execution_running("e1").await.unwrap();
        store
            .finalize_execution(
                "e1",
                &ExecutionOutcome::Completed {
                    output: serde_json::json!({"ok": true}),
                },
                10,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let settled = reconcile_stale(&store, &sweep_now()).await.unwrap();
        assert_eq!(settled, 1);

        let res = store.get_reservation(&token).await.unwrap().unwrap();
        assert_eq!(res.state, ReservationState::Committed);
        assert_eq!(store.balance("u1").await.unwrap(), 0, "user stays charged");
        assert_eq!(store.balance("pub-1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn abandoned_running_execution_is_failed_and_refunded() {
        // Crash mid-invocation: running execution, held reservation.
        let store = test_store();
        let agent_id = seed_agent(&store).await;
        store.grant_credits("u1", 10).await.unwrap();
        let token = store.reserve_credits("u1", 10, "e1").await.unwrap();
        seed_execution(&store, "e1", &agent_id).await;
        store.mark_execution_running("e1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let settled = reconcile_stale(&store, &sweep_now()).await.unwrap();
        assert_eq!(settled, 1);

        let res = store.get_reservation(&token).await.unwrap().unwrap();
        assert_eq!(res.state, ReservationState::Released);
        assert_eq!(store.balance("u1").await.unwrap(), 10);
        let exec = store.get_execution("e1").await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().contains("reconciliation"));
    }

    #[tokio::test]
    async fn reservation_without_execution_row_is_refunded() {
        // Crash between reserve and create_execution.
        let store = test_store();
        store.grant_credits("u1", 10).await.unwrap();
        store.reserve_credits("u1", 10, "ghost").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let settled = reconcile_stale(&store, &sweep_now()).await.unwrap();
        assert_eq!(settled, 1);
        assert_eq!(store.balance("u1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn reservations_within_grace_are_left_alone() {
        let store = test_store();
        store.grant_credits("u1", 10).await.unwrap();
        let token = store.reserve_credits("u1", 10, "e1").await.unwrap();

        let config = DispatcherConfig {
            reconcile_grace: Duration::from_secs(600),
            ..Default::default()
        };
        let settled = reconcile_stale(&store, &config).await.unwrap();
        assert_eq!(settled, 0);
        let res = store.get_reservation(&token).await.unwrap().unwrap();
        assert_eq!(res.state, ReservationState::Held);
    }

    #[tokio::test]
    async fn failed_execution_with_held_reservation_is_refunded() {
        // Crash between finalize(failed) and release.
        let store = test_store();
        let agent_id = seed_agent(&store).await;
        store.grant_credits("u1", 10).await.unwrap();
        store.reserve_credits("u1", 10, "e1").await.unwrap();
        seed_execution(&store, "e1", &agent_id).await;
        store
            .finalize_execution(
                "e1",
                &ExecutionOutcome::Failed {
                    error: "WebhookRejected: boom".to_string(),
                },
                0,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(reconcile_stale(&store, &sweep_now()).await.unwrap(), 1);
        assert_eq!(store.balance("u1").await.unwrap(), 10);
        // Original failure detail is preserved.
        let exec = store.get_execution("e1").await.unwrap().unwrap();
        assert!(exec.error.unwrap().contains("WebhookRejected"));
    }
}
