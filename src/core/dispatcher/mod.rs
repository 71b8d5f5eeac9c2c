pub mod invoker;
pub mod reconcile;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::config::DispatcherConfig;
use crate::core::errors::DispatchError;
use crate::core::store::Store;
use crate::core::store::executions::{ExecutionOutcome, NewExecution};
use crate::core::store::types::{AgentRecord, ExecutionStatus, Platform};
use invoker::{Clock, InvokeOutcome, InvokeReport, WebhookInvoker};

pub struct ExecuteRequest {
    pub user_id: String,
    pub agent_id: String,
    pub input: serde_json::Value,
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub credits_used: i64,
    pub remaining_credits: i64,
}

/// Per-user in-flight execution counter backing the concurrency cap. The
/// guard returns its slot on drop, so every early-return path releases it.
struct InflightSlots {
    inner: std::sync::Mutex<HashMap<String, usize>>,
}

impl InflightSlots {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn acquire(self: &Arc<Self>, user_id: &str, cap: usize) -> Option<InflightGuard> {
        let mut slots = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = slots.entry(user_id.to_string()).or_insert(0);
        if *count >= cap {
            return None;
        }
        *count += 1;
        Some(InflightGuard {
            slots: self.clone(),
            user_id: user_id.to_string(),
        })
    }
}

struct InflightGuard {
    slots: Arc<InflightSlots>,
    user_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut slots = match self.slots.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = slots.get_mut(&self.user_id) {
            *count -= 1;
            if *count == 0 {
                slots.remove(&self.user_id);
            }
        }
    }
}

/// The orchestrator. Sequences catalog lookup, account check, credit
/// reservation, webhook invocation and settlement for one execution request,
/// and guarantees exactly-once settlement via the ledger's reservation
/// tokens. Holds no global lock; each request runs on its own task.
pub struct Dispatcher {
    store: Arc<Store>,
    invoker: WebhookInvoker,
    config: DispatcherConfig,
    slots: Arc<InflightSlots>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            invoker: WebhookInvoker::new(config.clone(), clock),
            config,
            slots: InflightSlots::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Registers a new agent after a one-time connectivity test against its
    /// webhook (10s budget, separate from steady-state execution calls).
    pub async fn register_agent(
        &self,
        new_agent: crate::core::store::catalog::NewAgent,
    ) -> Result<AgentRecord, DispatchError> {
        self.invoker
            .ping(&new_agent.webhook_url, &new_agent.webhook_secret)
            .await
            .map_err(|e| DispatchError::InvalidInput(vec![e.to_string()]))?;
        self.store
            .register_agent(new_agent)
            .await
            .map_err(DispatchError::Internal)
    }

    /// Runs one execution request end to end. Pre-flight errors return
    /// before any side effect; once credits are reserved, every path either
    /// commits the reservation (completed) or releases it in full (failed).
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, DispatchError> {
        // 1. Catalog lookup; status re-validated on every call.
        let agent = self.store.active_agent(&request.agent_id).await?;

        // 2. Connected account, when the agent declares a platform.
        let account_id = match agent.platform {
            Some(platform) => Some(self.resolve_account(&request, platform).await?),
            None => None,
        };

        // 3. Input contract.
        schema::validate_input(&request.input, &agent.input_schema)
            .map_err(DispatchError::InvalidInput)?;

        let _slot = self
            .slots
            .acquire(&request.user_id, self.config.per_user_concurrent_cap)
            .ok_or(DispatchError::TooManyExecutions {
                cap: self.config.per_user_concurrent_cap,
            })?;

        // 4. Reserve credits at the current listed price. The reserved
        // amount is what gets charged even if the price changes mid-flight.
        let execution_id = uuid::Uuid::new_v4().to_string();
        let request_id = uuid::Uuid::new_v4().to_string();
        let token = self
            .store
            .reserve_credits(&request.user_id, agent.price, &execution_id)
            .await?;

        info!(
            "Execution {} accepted: agent={} user={} price={} request_id={}",
            execution_id, agent.id, request.user_id, agent.price, request_id
        );

        match self
            .run_reserved(&agent, &request, account_id, &execution_id, &request_id, &token)
            .await
        {
            Ok(result) => Ok(result),
            Err(internal) => {
                // Best-effort cleanup before propagating: finalize the record
                // and release the reservation so the caller is never left
                // charged for an unknown outcome.
                error!("Execution {execution_id} internal failure: {internal:#}");
                let outcome = ExecutionOutcome::Failed {
                    error: format!("Internal: {internal}"),
                };
                let _ = self
                    .store
                    .finalize_execution(&execution_id, &outcome, 0)
                    .await;
                if let Err(release_err) = self.store.release_reservation(&token).await {
                    error!(
                        "Execution {execution_id}: release of reservation {token} failed, manual reconciliation required: {release_err:#}"
                    );
                }
                Err(DispatchError::Internal(internal))
            }
        }
    }

    async fn run_reserved(
        &self,
        agent: &AgentRecord,
        request: &ExecuteRequest,
        account_id: Option<String>,
        execution_id: &str,
        request_id: &str,
        token: &str,
    ) -> Result<ExecutionResult> {
        // 5. Execution record: pending, then running once dispatched.
        self.store
            .create_execution(NewExecution {
                id: execution_id.to_string(),
                agent_id: agent.id.clone(),
                user_id: request.user_id.clone(),
                account_id: account_id.clone(),
                input: request.input.clone(),
                request_id: request_id.to_string(),
            })
            .await?;
        self.store.mark_execution_running(execution_id).await?;

        // 6. Webhook call under the caller-facing deadline. On expiry the
        // in-flight attempt is dropped, never left running unbounded.
        let report = match tokio::time::timeout(
            self.config.overall_deadline,
            self.invoker.invoke(agent, request_id, &request.input),
        )
        .await
        {
            Ok(invoked) => invoked?,
            Err(_) => InvokeReport {
                outcome: InvokeOutcome::Failure {
                    code: "WebhookTimeout",
                    reason: format!(
                        "caller deadline of {}ms exceeded, in-flight attempt cancelled",
                        self.config.overall_deadline.as_millis()
                    ),
                },
                attempts: 0,
            },
        };

        match report.outcome {
            InvokeOutcome::Success { output } => {
                // 7. Finalize, then settle, then touch the account.
                let finalized = self
                    .store
                    .finalize_execution(
                        execution_id,
                        &ExecutionOutcome::Completed {
                            output: output.clone(),
                        },
                        agent.price,
                    )
                    .await?;
                if !finalized {
                    info!("Execution {execution_id} was already finalized, keeping first outcome");
                }
                let committed = self
                    .store
                    .commit_reservation(token, &agent.publisher_id, self.config.platform_fee_percent)
                    .await?;
                let credits_used = match committed {
                    Some(amount) => amount,
                    None => {
                        warn!(
                            "Execution {execution_id}: reservation {token} was already settled elsewhere"
                        );
                        agent.price
                    }
                };
                if let Some(account_id) = &account_id {
                    self.store.touch_account_last_used(account_id).await?;
                }
                let remaining_credits = self.store.balance(&request.user_id).await?;
                info!(
                    "Execution {} completed after {} attempt(s), charged {}",
                    execution_id, report.attempts, credits_used
                );
                Ok(ExecutionResult {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Completed,
                    output: Some(output),
                    error: None,
                    credits_used,
                    remaining_credits,
                })
            }
            InvokeOutcome::Failure { code, reason } => {
                // 8. Failed executions are never charged: full refund.
                let detail = if report.attempts > 0 {
                    format!("{code}: {reason} (attempts: {})", report.attempts)
                } else {
                    format!("{code}: {reason}")
                };
                let finalized = self
                    .store
                    .finalize_execution(
                        execution_id,
                        &ExecutionOutcome::Failed {
                            error: detail.clone(),
                        },
                        0,
                    )
                    .await?;
                if !finalized {
                    info!("Execution {execution_id} was already finalized, keeping first outcome");
                }
                self.store.release_reservation(token).await?;
                let remaining_credits = self.store.balance(&request.user_id).await?;
                warn!(
                    "Execution {} failed after {} attempt(s): {}",
                    execution_id, report.attempts, detail
                );
                Ok(ExecutionResult {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Failed,
                    output: None,
                    error: Some(detail),
                    credits_used: 0,
                    remaining_credits,
                })
            }
        }
    }

    async fn resolve_account(
        &self,
        request: &ExecuteRequest,
        platform: Platform,
    ) -> Result<String, DispatchError> {
        let account = match &request.account_id {
            Some(id) => self
                .store
                .get_account(id)
                .await
                .map_err(DispatchError::Internal)?
                .filter(|a| {
                    a.user_id == request.user_id
                        && a.agent_id == request.agent_id
                        && a.platform == platform
                }),
            None => self
                .store
                .connected_account(&request.user_id, &request.agent_id, platform)
                .await
                .map_err(DispatchError::Internal)?,
        };
        let account = account.ok_or_else(|| DispatchError::AccountNotConnected {
            platform: platform.as_str().to_string(),
        })?;
        if !account.is_usable() {
            return Err(DispatchError::AccountExpired {
                platform: platform.as_str().to_string(),
                status: account.status.as_str().to_string(),
            });
        }
        Ok(account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::invoker::tests::{TestClock, spawn_webhook};
    use crate::core::store::catalog::NewAgent;
    use crate::core::store::test_store;
    use crate::core::store::types::{AccountStatus, AgentStatus};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            webhook_timeout: Duration::from_millis(300),
            max_retry_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            jitter: Duration::ZERO,
            overall_deadline: Duration::from_secs(5),
            platform_fee_percent: 20,
            ..Default::default()
        }
    }

    fn test_dispatcher(config: DispatcherConfig) -> (Arc<Store>, Dispatcher) {
        let store = Arc::new(test_store());
        let dispatcher = Dispatcher::new(store.clone(), config, TestClock::new());
        (store, dispatcher)
    }

    async fn active_agent(
        store: &Store,
        webhook_url: &str,
        price: i64,
        platform: Option<Platform>,
    ) -> String {
        let agent = store
            .register_agent(NewAgent {
                publisher_id: "pub-1".to_string(),
                name: "Echo".to_string(),
                webhook_url: webhook_url.to_string(),
                webhook_secret: "whsec_test".to_string(),
                price,
                platform,
                input_schema: serde_json::json!({
                    "fields": [{"name": "text", "type": "string", "required": true}]
                }),
            })
            .await
            .unwrap();
        store
            .set_agent_status(&agent.id, AgentStatus::Active)
            .await
            .unwrap();
        agent.id
    }

    fn ok_app() -> Router {
        Router::new().route("/hook", post(|| async { axum::Json(serde_json::json!({"ok": true})) }))
    }

    fn request(user_id: &str, agent_id: &str) -> ExecuteRequest {
        ExecuteRequest {
            user_id: user_id.to_string(),
            agent_id: agent_id.to_string(),
            input: serde_json::json!({"text": "hello"}),
            account_id: None,
        }
    }

    #[tokio::test]
    async fn happy_path_charges_exactly_once() {
        let url = spawn_webhook(ok_app()).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.credits_used, 10);
        assert_eq!(result.remaining_credits, 0);
        assert_eq!(result.output, Some(serde_json::json!({"ok": true})));

        let exec = store
            .get_execution(&result.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.credits_charged, 10);

        let txns = store
            .transactions_for_execution(&result.execution_id)
            .await
            .unwrap();
        let user_net: i64 = txns
            .iter()
            .filter(|t| t.account_id == "u1")
            .map(|t| t.amount)
            .sum();
        assert_eq!(user_net, -10);
        // 20% platform fee leaves 8 for the publisher.
        assert_eq!(store.balance("pub-1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn exhausted_retries_refund_in_full() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let url = spawn_webhook(app).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.credits_used, 0);
        assert_eq!(result.remaining_credits, 10);
        let error = result.error.unwrap();
        assert!(error.contains("WebhookRejected"));
        assert!(error.contains("attempts: 3"));

        let txns = store
            .transactions_for_execution(&result.execution_id)
            .await
            .unwrap();
        let net: i64 = txns.iter().map(|t| t.amount).sum();
        assert_eq!(net, 0, "failed execution nets to zero on the ledger");
        assert_eq!(store.balance("pub-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insufficient_credits_is_preflight_noop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move || {
                let hits = hits_in_handler.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "ok"
                }
            }),
        );
        let url = spawn_webhook(app).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 5).await.unwrap();

        let err = dispatcher.execute(request("u1", &agent_id)).await.unwrap_err();
        assert_eq!(err.code(), "InsufficientCredits");
        assert_eq!(hits.load(Ordering::SeqCst), 0, "webhook never called");
        assert_eq!(store.balance("u1").await.unwrap(), 5);
        assert!(store.executions_for_user("u1", 10).await.unwrap().is_empty());
        assert!(store.transactions_for_account("u1").await.unwrap().len() == 1); // only the grant
    }

    #[tokio::test]
    async fn inactive_agent_is_preflight_noop() {
        let url = spawn_webhook(ok_app()).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, None).await;
        store
            .set_agent_status(&agent_id, AgentStatus::Disabled)
            .await
            .unwrap();
        store.grant_credits("u1", 100).await.unwrap();

        let err = dispatcher.execute(request("u1", &agent_id)).await.unwrap_err();
        assert_eq!(err.code(), "AgentNotActive");
        assert!(store.executions_for_user("u1", 10).await.unwrap().is_empty());
        assert_eq!(store.balance("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn invalid_input_lists_violations_without_reserving() {
        let url = spawn_webhook(ok_app()).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 100).await.unwrap();

        let mut req = request("u1", &agent_id);
        req.input = serde_json::json!({"text": 42});
        let err = dispatcher.execute(req).await.unwrap_err();
        match err {
            DispatchError::InvalidInput(violations) => {
                assert!(violations[0].contains("'text'"));
            }
            other => panic!("expected InvalidInput, got {other:?}"),
        }
        assert_eq!(store.balance("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn platform_agent_requires_connected_account() {
        let url = spawn_webhook(ok_app()).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, Some(Platform::Slack)).await;
        store.grant_credits("u1", 100).await.unwrap();

        let err = dispatcher.execute(request("u1", &agent_id)).await.unwrap_err();
        assert_eq!(err.code(), "AccountNotConnected");

        let acct = store
            .connect_account("u1", &agent_id, Platform::Slack)
            .await
            .unwrap();
        store
            .set_account_status(&acct.id, AccountStatus::Expired)
            .await
            .unwrap();
        let err = dispatcher.execute(request("u1", &agent_id)).await.unwrap_err();
        assert_eq!(err.code(), "AccountExpired");
        assert_eq!(store.balance("u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn success_touches_account_last_used() {
        let url = spawn_webhook(ok_app()).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, Some(Platform::Gmail)).await;
        let acct = store
            .connect_account("u1", &agent_id, Platform::Gmail)
            .await
            .unwrap();
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        let acct = store.get_account(&acct.id).await.unwrap().unwrap();
        assert!(acct.last_used_at.is_some());
    }

    #[tokio::test]
    async fn failure_does_not_touch_account_last_used() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::BAD_REQUEST, "rejected") }),
        );
        let url = spawn_webhook(app).await;
        let (store, dispatcher) = test_dispatcher(fast_config());
        let agent_id = active_agent(&store, &url, 10, Some(Platform::Gmail)).await;
        let acct = store
            .connect_account("u1", &agent_id, Platform::Gmail)
            .await
            .unwrap();
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        let acct = store.get_account(&acct.id).await.unwrap().unwrap();
        assert!(acct.last_used_at.is_none());
    }

    #[tokio::test]
    async fn webhook_timeout_fails_with_refund() {
        let app = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "too late"
            }),
        );
        let url = spawn_webhook(app).await;
        let mut config = fast_config();
        config.webhook_timeout = Duration::from_millis(100);
        config.max_retry_attempts = 1;
        let (store, dispatcher) = test_dispatcher(config);
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("WebhookTimeout"));
        assert_eq!(result.credits_used, 0);
        assert_eq!(result.remaining_credits, 10);
    }

    #[tokio::test]
    async fn overall_deadline_cancels_and_refunds() {
        let app = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let url = spawn_webhook(app).await;
        let mut config = fast_config();
        config.webhook_timeout = Duration::from_secs(10);
        config.overall_deadline = Duration::from_millis(100);
        let (store, dispatcher) = test_dispatcher(config);
        let agent_id = active_agent(&store, &url, 10, None).await;
        store.grant_credits("u1", 10).await.unwrap();

        let result = dispatcher.execute(request("u1", &agent_id)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("deadline"));
        assert_eq!(store.balance("u1").await.unwrap(), 10);

        let exec = store
            .get_execution(&result.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed, "never left running");
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_excess_requests() {
        let slots = InflightSlots::new();
        let first = slots.acquire("u1", 1);
        assert!(first.is_some());
        assert!(slots.acquire("u1", 1).is_none(), "cap reached");
        assert!(slots.acquire("u2", 1).is_some(), "caps are per user");
        drop(first);
        assert!(slots.acquire("u1", 1).is_some(), "slot returned on drop");
    }

    #[tokio::test]
    async fn register_agent_requires_reachable_webhook() {
        let (_, dispatcher) = {
            let store = Arc::new(test_store());
            (store.clone(), Dispatcher::new(store, fast_config(), TestClock::new()))
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dispatcher
            .register_agent(NewAgent {
                publisher_id: "pub-1".to_string(),
                name: "Dead".to_string(),
                webhook_url: format!("http://{addr}/hook"),
                webhook_secret: "whsec_test".to_string(),
                price: 1,
                platform: None,
                input_schema: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
        assert!(err.to_string().contains("connectivity test failed"));

        let url = spawn_webhook(ok_app()).await;
        let agent = dispatcher
            .register_agent(NewAgent {
                publisher_id: "pub-1".to_string(),
                name: "Live".to_string(),
                webhook_url: url,
                webhook_secret: "whsec_test".to_string(),
                price: 1,
                platform: None,
                input_schema: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Draft);
    }
}
