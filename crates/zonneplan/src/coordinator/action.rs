use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zonneplan_api::ApiError;
use zonneplan_api::path;

use super::Coordinator;
use super::timer::ScheduledTask;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("action not available: {0}")]
    Precondition(String),

    #[error("`{failed}` failed after completing {completed:?}: {source}")]
    Partial {
        completed: Vec<String>,
        failed: String,
        #[source]
        source: ApiError,
    },

    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("no cached data for {0}")]
    MissingData(String),
}

/// How an action waits for the backend to pick up a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Idle,
    /// Waiting for the `processing` flag to clear.
    Pending,
    Confirmed,
    /// Gave up re-polling. The local flag is dropped so the entity can be
    /// used again; the next fetch shows what the backend actually did.
    Unconfirmed,
}

/// Re-polls a coordinator after an action until its `processing` flag is
/// gone from the fetched payload, or the attempt cap is reached.
pub struct ProcessingRetry {
    processing_path: &'static str,
    options: RetryOptions,
    status: Arc<Mutex<ActionStatus>>,
    task: ScheduledTask,
}

impl ProcessingRetry {
    pub fn new(processing_path: &'static str, options: RetryOptions) -> Self {
        Self {
            processing_path,
            options,
            status: Arc::new(Mutex::new(ActionStatus::Idle)),
            task: ScheduledTask::new(),
        }
    }

    pub fn processing_path(&self) -> &'static str {
        self.processing_path
    }

    pub fn status(&self) -> ActionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start re-polling. A retry loop that is already running is replaced.
    pub fn start(&self, coordinator: Coordinator) {
        set_status(&self.status, ActionStatus::Pending);

        let status = self.status.clone();
        let options = self.options;
        let processing_path = self.processing_path;
        self.task.schedule(options.delay, async move {
            for attempt in 1..=options.max_attempts {
                if attempt > 1 {
                    tokio::time::sleep(options.delay).await;
                }
                if let Err(e) = coordinator.refresh().await {
                    debug!("{} re-poll {} failed: {}", coordinator.name(), attempt, e);
                }
                if !is_processing(&coordinator, processing_path) {
                    info!(
                        "{} confirmed action after {} re-poll(s)",
                        coordinator.name(),
                        attempt
                    );
                    set_status(&status, ActionStatus::Confirmed);
                    return;
                }
            }

            warn!(
                "{} still processing after {} re-polls, giving up",
                coordinator.name(),
                options.max_attempts
            );
            coordinator.update(|data| {
                path::set(data, processing_path, Value::Bool(false));
            });
            set_status(&status, ActionStatus::Unconfirmed);
        });
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }
}

fn set_status(status: &Mutex<ActionStatus>, value: ActionStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

pub fn is_processing(coordinator: &Coordinator, processing_path: &str) -> bool {
    coordinator
        .get_value(processing_path)
        .is_some_and(|v| path::is_truthy(&v))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::coordinator::AuthSignal;
    use crate::coordinator::CoordinatorOptions;
    use crate::coordinator::tests::Scripted;

    fn retry_options(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            delay: Duration::from_secs(10),
            max_attempts,
        }
    }

    async fn processing_coordinator(
        later: Vec<Result<Option<serde_json::Value>, ApiError>>,
    ) -> (Coordinator, Arc<std::sync::atomic::AtomicUsize>) {
        let mut results = vec![Ok(Some(json!({"state": {"state": "Charging"}})))];
        results.extend(later);
        let fetch = Scripted::new(results);
        let calls = fetch.calls.clone();
        let coordinator = Coordinator::new(
            CoordinatorOptions::new("charge_point", Duration::from_secs(60)),
            fetch,
            AuthSignal::new(),
        );
        coordinator.refresh().await.unwrap();
        coordinator.set_value("state.processing", json!(true));
        (coordinator, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_when_flag_clears() {
        // First re-poll is a 304, second brings a payload without the flag.
        let (coordinator, calls) = processing_coordinator(vec![
            Ok(None),
            Ok(Some(json!({"state": {"state": "Charging"}}))),
        ])
        .await;
        let retry = ProcessingRetry::new("state.processing", retry_options(30));

        retry.start(coordinator.clone());
        assert_eq!(retry.status(), ActionStatus::Pending);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retry.status(), ActionStatus::Pending);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.status(), ActionStatus::Confirmed);
        assert!(!is_processing(&coordinator, "state.processing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_after_attempt_cap() {
        let (coordinator, calls) = processing_coordinator(vec![]).await;
        let retry = ProcessingRetry::new("state.processing", retry_options(3));

        retry.start(coordinator.clone());
        tokio::time::sleep(Duration::from_secs(120)).await;

        // One initial refresh plus three re-polls.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retry.status(), ActionStatus::Unconfirmed);
        assert!(!is_processing(&coordinator, "state.processing"));
        assert_eq!(coordinator.get_value("state.state"), Some(json!("Charging")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_giving_up_notifies_listeners() {
        let (coordinator, _) = processing_coordinator(vec![]).await;
        let mut rx = coordinator.inner.state.subscribe();
        rx.borrow_and_update();
        let retry = ProcessingRetry::new("state.processing", retry_options(2));

        retry.start(coordinator.clone());
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(retry.status(), ActionStatus::Unconfirmed);
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            path::get(rx.borrow_and_update().data.as_ref().unwrap(), "state.processing"),
            Some(&json!(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let (coordinator, calls) = processing_coordinator(vec![]).await;
        let retry = ProcessingRetry::new("state.processing", retry_options(30));

        retry.start(coordinator);
        retry.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.status(), ActionStatus::Pending);
    }

    #[test]
    fn test_partial_error_message() {
        let err = ActionError::Partial {
            completed: vec!["disable_home_optimization".to_string()],
            failed: "enable_self_consumption".to_string(),
            source: ApiError::Timeout,
        };
        insta::assert_snapshot!(
            err.to_string(),
            @r#"`enable_self_consumption` failed after completing ["disable_home_optimization"]: request timed out"#
        );
    }
}
