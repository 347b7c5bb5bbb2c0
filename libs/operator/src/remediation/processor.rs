use crate::conditions::{new_condition, set_condition, TYPE_NOTIFICATIONS_HEALTHY};
use crate::crd::remediation::{
    NotificationSinkSpec, RemediationPolicy, RemediationPolicyStatus,
};
use crate::error::Result;
use crate::mcp::client::RetryPolicy;
use crate::mcp::remediate::{RemediateClient, RemediateRequest};
use crate::metrics::ControllerMetrics;
use crate::remediation::cooldown::object_cooldown_key;
use crate::remediation::matcher::{
    effective_params, event_dedup_key, find_match, issue_description, ProcessedEvents,
};
use crate::remediation::notify::{
    google_chat, slack, CompletionOutcome, Notification, Notifier, SinkKind,
};
use crate::remediation::owner::resolve_owner;
use crate::remediation::rate_limit::{
    object_identifier, rate_limit_key, ObjectCooldowns, RateLimitDecision, RateLimiter,
};
use crate::remediation::PolicyRegistry;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::events::{Event as RecorderEvent, EventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const SWEEP_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(10 * 60);

/// Processed-event keys are kept for one hour before the sweep drops them.
fn dedup_max_age() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// Shared pipeline for every Kubernetes Event: match, dedup, rate-limit,
/// remediate, notify.
pub struct EventProcessor {
    client: Client,
    policies: PolicyRegistry,
    limiter: RateLimiter,
    cooldowns: Arc<ObjectCooldowns>,
    processed: Mutex<ProcessedEvents>,
    notifier: Notifier,
    pub metrics: Arc<ControllerMetrics>,
    reporter: Reporter,
}

impl EventProcessor {
    pub fn new(
        client: Client,
        policies: PolicyRegistry,
        cooldowns: Arc<ObjectCooldowns>,
        metrics: Arc<ControllerMetrics>,
        reporter: Reporter,
    ) -> Result<Self> {
        Ok(Self {
            client,
            policies,
            limiter: RateLimiter::default(),
            cooldowns,
            processed: Mutex::new(ProcessedEvents::default()),
            notifier: Notifier::new()?,
            metrics,
            reporter,
        })
    }

    #[instrument(skip(self, event), fields(event = %event.name_any()))]
    pub async fn handle_event(&self, event: &Event) {
        // snapshot the active policies ordered by key so first-match-wins is
        // deterministic
        let policies: Vec<_> = {
            let registry = self.policies.read().await;
            let mut entries: Vec<_> = registry.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            entries.into_iter().map(|(_, p)| p.clone()).collect()
        };

        let Some((policy, selector)) = find_match(&policies, event) else {
            return;
        };

        let now = Utc::now();
        let dedup_key = event_dedup_key(event);
        if !self.processed.lock().await.observe(&dedup_key, now) {
            debug!(msg = "event already processed", key = %dedup_key);
            return;
        }

        // safe unwrap: RemediationPolicy is namespaced
        let policy_namespace = policy.namespace().unwrap();
        let policy_name = policy.name_any();

        let object = &event.involved_object;
        let object_namespace = object
            .namespace
            .clone()
            .or_else(|| event.metadata.namespace.clone())
            .unwrap_or_default();
        let object_kind = object.kind.clone().unwrap_or_default();
        let object_name = object.name.clone().unwrap_or_default();
        let reason = event.reason.clone().unwrap_or_default();

        self.update_status(policy, |status| {
            status.events_processed = Some(status.events_processed.unwrap_or(0) + 1);
            status.last_event_time = Some(Time(now));
        })
        .await;

        let (owner_kind, owner_name) =
            resolve_owner(&self.client, &object_namespace, &object_kind, &object_name).await;
        let identifier = object_identifier(&owner_kind, &owner_name);

        // always-on per-object cooldown; unlike the rate limiter this is
        // keyed per reason
        let cooldown_key = object_cooldown_key(
            &policy_namespace,
            &policy_name,
            &object_namespace,
            &identifier,
            &reason,
        );
        if self.cooldowns.active(&cooldown_key, now) {
            debug!(msg = "object still cooling down", key = %cooldown_key);
            return;
        }

        if let Some(limits) = &policy.spec.rate_limiting {
            let key = rate_limit_key(
                &policy_namespace,
                &policy_name,
                &object_namespace,
                &owner_kind,
                &owner_name,
            );
            if self.limiter.check(
                &key,
                limits.events_per_minute,
                limits.cooldown_minutes,
                now,
            ) == RateLimitDecision::Limited
            {
                info!(msg = "event rate limited", %key);
                self.update_status(policy, |status| {
                    status.rate_limited_events = Some(status.rate_limited_events.unwrap_or(0) + 1);
                    status.last_rate_limited_event = Some(Time(now));
                })
                .await;
                return;
            }
        }

        let params = effective_params(&policy.spec, selector);
        let issue = issue_description(event);
        let mode_label = match params.mode {
            crate::crd::remediation::RemediationMode::Manual => "manual",
            crate::crd::remediation::RemediationMode::Automatic => "automatic",
        };

        self.notify(
            policy,
            &Notification::Started {
                issue: &issue,
                mode: mode_label,
            },
            true,
        )
        .await;
        self.record_k8s_event(
            policy,
            EventType::Normal,
            "RemediationStarted",
            &format!("Calling MCP for: {issue}"),
        )
        .await;

        let request = RemediateRequest {
            issue: issue.clone(),
            mode: params.mode,
            confidence_threshold: params.confidence_threshold,
            max_risk_level: params.max_risk_level,
        };
        let outcome = match RemediateClient::new(&policy.spec.mcp_endpoint, RetryPolicy::default())
        {
            Ok(client) => {
                self.update_status(policy, |status| {
                    status.mcp_messages_sent = Some(status.mcp_messages_sent.unwrap_or(0) + 1);
                })
                .await;
                client.remediate(&request, &CancellationToken::new()).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                self.metrics.mcp_request_inc("remediate", "ok");
                self.cooldowns.mark(&cooldown_key, now);
                self.update_status(policy, |status| {
                    status.successful_remediations =
                        Some(status.successful_remediations.unwrap_or(0) + 1);
                    status.last_remediation_time = Some(Time(Utc::now()));
                })
                .await;

                let completion = if outcome.executed {
                    CompletionOutcome::Executed
                } else {
                    CompletionOutcome::ManualActionRequired
                };
                self.notify(
                    policy,
                    &Notification::Completed {
                        issue: &issue,
                        outcome: completion,
                        message: &outcome.message,
                    },
                    false,
                )
                .await;
                self.record_k8s_event(
                    policy,
                    EventType::Normal,
                    if outcome.executed {
                        "RemediationExecuted"
                    } else {
                        "RemediationManual"
                    },
                    &outcome.message,
                )
                .await;
            }
            Err(e) => {
                self.metrics.mcp_request_inc("remediate", "error");
                warn!(msg = "remediation failed", %e);
                self.update_status(policy, |status| {
                    status.failed_remediations = Some(status.failed_remediations.unwrap_or(0) + 1);
                })
                .await;
                self.notify(
                    policy,
                    &Notification::Completed {
                        issue: &issue,
                        outcome: CompletionOutcome::Failed,
                        message: &e.to_string(),
                    },
                    false,
                )
                .await;
                self.record_k8s_event(
                    policy,
                    EventType::Warning,
                    "RemediationFailed",
                    &e.to_string(),
                )
                .await;
            }
        }
    }

    /// Fan a notification out to every enabled sink. Sink failures never
    /// fail the event; they flip the `NotificationsHealthy` condition.
    async fn notify(&self, policy: &RemediationPolicy, notification: &Notification<'_>, start: bool) {
        let Some(notifications) = &policy.spec.notifications else {
            return;
        };
        // safe unwrap: RemediationPolicy is namespaced
        let namespace = policy.namespace().unwrap();
        let policy_name = policy.name_any();
        let mut failure: Option<String> = None;
        let mut attempted = false;

        for (sink, kind) in [
            (notifications.slack.as_ref(), SinkKind::Slack),
            (notifications.google_chat.as_ref(), SinkKind::GoogleChat),
        ] {
            let Some(sink) = sink else { continue };
            if !sink.enabled || !phase_enabled(sink, start) {
                continue;
            }
            attempted = true;
            let result = self.send_to_sink(&namespace, &policy_name, sink, kind, notification).await;
            if let Err(e) = result {
                warn!(msg = "notification failed", sink = kind.name(), %e);
                failure = Some(format!("{}: {e}", kind.name()));
            }
        }

        if attempted {
            self.set_notifications_condition(policy, failure).await;
        }
    }

    async fn send_to_sink(
        &self,
        namespace: &str,
        policy_name: &str,
        sink: &NotificationSinkSpec,
        kind: SinkKind,
        notification: &Notification<'_>,
    ) -> Result<()> {
        let url =
            crate::remediation::notify::resolve_webhook_url(&self.client, namespace, sink, kind)
                .await?;
        let payload = match kind {
            SinkKind::Slack => slack::payload(policy_name, sink.channel.as_deref(), notification),
            SinkKind::GoogleChat => google_chat::payload(policy_name, notification),
        };
        self.notifier.post(&url, &payload).await
    }

    async fn set_notifications_condition(
        &self,
        policy: &RemediationPolicy,
        failure: Option<String>,
    ) {
        let healthy = failure.is_none();
        let message = failure.unwrap_or_else(|| "all sinks delivered".to_string());
        self.update_status(policy, move |status| {
            let mut conditions = status.conditions.take().unwrap_or_default();
            set_condition(
                &mut conditions,
                new_condition(
                    TYPE_NOTIFICATIONS_HEALTHY,
                    healthy,
                    if healthy { "Delivered" } else { "SinkFailed" },
                    &message,
                    None,
                ),
            );
            status.conditions = Some(conditions);
        })
        .await;
    }

    /// Read a fresh copy, apply the mutation, merge-patch the status. A 409
    /// is abandoned; the next event catches the counters up.
    async fn update_status<F>(&self, policy: &RemediationPolicy, mutate: F)
    where
        F: FnOnce(&mut RemediationPolicyStatus),
    {
        // safe unwrap: RemediationPolicy is namespaced
        let namespace = policy.namespace().unwrap();
        let name = policy.name_any();
        let api: Api<RemediationPolicy> = Api::namespaced(self.client.clone(), &namespace);

        let fresh = match api.get(&name).await {
            Ok(fresh) => fresh,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return,
            Err(e) => {
                warn!(msg = "failed to read policy for status update", %e);
                return;
            }
        };
        let mut status = fresh.status.unwrap_or_default();
        mutate(&mut status);

        match api
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"status": status})),
            )
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {}
            Err(e) => warn!(msg = "failed to patch policy status", %e),
        }
    }

    async fn record_k8s_event(
        &self,
        policy: &RemediationPolicy,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            policy.object_ref(&()),
        );
        if let Err(e) = recorder
            .publish(RecorderEvent {
                type_,
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Remediating".to_string(),
                secondary: None,
            })
            .await
        {
            debug!(msg = "failed to publish event", %e);
        }
    }

    /// Expire dedup keys, rate-limit windows and object cooldowns.
    pub async fn sweep(&self) {
        let now = Utc::now();
        self.processed.lock().await.cleanup(now, dedup_max_age());
        self.limiter.sweep(now);
        self.cooldowns.sweep(now);
    }
}

fn phase_enabled(sink: &NotificationSinkSpec, start: bool) -> bool {
    if start {
        sink.notify_on_start
    } else {
        sink.notify_on_complete
    }
}

/// Watch all Kubernetes Events and feed them through the processor; sweeps
/// expired bookkeeping on a timer.
pub async fn run_event_watcher(
    processor: Arc<EventProcessor>,
    client: Client,
    token: CancellationToken,
) {
    let api: Api<Event> = Api::all(client);
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut sweeper = tokio::time::interval(SWEEP_INTERVAL);
    sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sweeper.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sweeper.tick() => processor.sweep().await,
            event = stream.try_next() => match event {
                Ok(Some(watcher::Event::Apply(event))) => {
                    processor.handle_event(&event).await;
                }
                // the initial listing is historical noise; remediating it
                // would replay old incidents on every restart
                Ok(_) => {}
                Err(e) => {
                    warn!(msg = "event watch error", %e);
                    processor.metrics.watch_operations_failed_inc();
                }
            },
        }
    }
    debug!(msg = "event watcher stopped");
}
