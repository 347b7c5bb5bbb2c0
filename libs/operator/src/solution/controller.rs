use crate::conditions::{new_condition, set_condition, TYPE_READY};
use crate::controller::{check_api_queryable, Context, ControllerId, State};
use crate::crd::solution::{ResourceReference, Solution, SolutionState, SolutionStatus};
use crate::error::{Error, Result};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::discovery::{pinned_kind, Scope};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::Resource;
use serde_json::json;
use tokio::time::Duration;
use tracing::{error, field, info, instrument, warn, Span};

pub const CONTROLLER_ID: ControllerId = "solution";

const READY_REQUEUE: Duration = Duration::from_secs(10 * 60);
const DEGRADED_REQUEUE: Duration = Duration::from_secs(60);

pub struct Ctx {
    pub base: Arc<Context>,
}

fn error_policy(obj: Arc<Solution>, error: &Error, ctx: Arc<Ctx>) -> Action {
    crate::controller::error_policy(obj, error, ctx.base.clone())
}

fn gvk_of(reference: &ResourceReference) -> GroupVersionKind {
    match reference.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &reference.kind),
        None => GroupVersionKind::gvk("", &reference.api_version, &reference.kind),
    }
}

/// The owner reference a Solution stamps onto its resources: an additional
/// owner so the garbage collector cascades, never the controller.
fn solution_owner_ref(solution: &Solution) -> OwnerReference {
    OwnerReference {
        api_version: Solution::api_version(&()).to_string(),
        kind: Solution::kind(&()).to_string(),
        name: solution.name_any(),
        uid: solution.uid().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(true),
    }
}

#[instrument(skip(ctx, solution), fields(trace_id))]
async fn reconcile(solution: Arc<Solution>, ctx: Arc<Ctx>) -> Result<Action> {
    let trace_id = telemetry::current_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.base.metrics.count_and_measure(&trace_id);
    ctx.base.diagnostics.write().await.last_event = Utc::now();

    // safe unwrap: Solution is namespaced
    let namespace = solution.namespace().unwrap();
    let name = solution.name_any();

    if solution.metadata.deletion_timestamp.is_some() {
        // deletion cascades through the owner references; nothing to do
        return Ok(Action::await_change());
    }

    let owner_ref = solution_owner_ref(&solution);
    let total = solution.spec.resources.len();
    let mut owned = 0usize;
    let mut missing: Vec<String> = Vec::new();

    for reference in &solution.spec.resources {
        match adopt_resource(&ctx.base.client, &namespace, reference, &owner_ref).await {
            Ok(true) => owned += 1,
            Ok(false) => missing.push(format!("{}/{}", reference.kind, reference.name)),
            Err(e) => {
                warn!(msg = "failed to adopt resource", kind = %reference.kind, name = %reference.name, %e);
                missing.push(format!("{}/{}", reference.kind, reference.name));
            }
        }
    }

    let state = if missing.is_empty() {
        SolutionState::Deployed
    } else {
        SolutionState::Degraded
    };
    info!(msg = "solution reconciled", solution = %format!("{namespace}/{name}"), total, owned);

    let api: Api<Solution> = Api::namespaced(ctx.base.client.clone(), &namespace);
    let mut conditions = solution
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        new_condition(
            TYPE_READY,
            missing.is_empty(),
            if missing.is_empty() {
                "AllResourcesOwned"
            } else {
                "ResourcesMissing"
            },
            &if missing.is_empty() {
                format!("{owned} resources owned")
            } else {
                format!("missing: {}", missing.join(", "))
            },
            solution.metadata.generation,
        ),
    );
    let status = SolutionStatus {
        state: Some(state),
        resources_total: Some(total as i64),
        resources_owned: Some(owned as i64),
        conditions: Some(conditions),
    };
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
        Err(e) => error!(msg = "failed to patch solution status", %e),
    }

    Ok(Action::requeue(if missing.is_empty() {
        READY_REQUEUE
    } else {
        DEGRADED_REQUEUE
    }))
}

/// Add the Solution as a non-controlling owner of one referenced resource.
/// Returns false when the resource does not exist.
async fn adopt_resource(
    client: &Client,
    solution_namespace: &str,
    reference: &ResourceReference,
    owner_ref: &OwnerReference,
) -> Result<bool> {
    let gvk = gvk_of(reference);
    let (api_resource, capabilities) = pinned_kind(client, &gvk).await.map_err(|e| {
        Error::DiscoveryError(format!(
            "cannot resolve {}/{}: {e}",
            reference.api_version, reference.kind
        ))
    })?;

    let api: Api<DynamicObject> = if capabilities.scope == Scope::Namespaced {
        let namespace = reference
            .namespace
            .as_deref()
            .unwrap_or(solution_namespace);
        Api::namespaced_with(client.clone(), namespace, &api_resource)
    } else {
        Api::all_with(client.clone(), &api_resource)
    };

    let object = match api.get(&reference.name).await {
        Ok(object) => object,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(false),
        Err(e) => {
            return Err(Error::KubeError(
                format!("failed to get {} {}", reference.kind, reference.name),
                Box::new(e),
            ))
        }
    };

    let mut owners = object.owner_references().to_vec();
    if owners.iter().any(|o| o.uid == owner_ref.uid) {
        return Ok(true);
    }
    owners.push(owner_ref.clone());

    api.patch(
        &reference.name,
        &PatchParams::default(),
        &Patch::Merge(&json!({"metadata": {"ownerReferences": owners}})),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to own {} {}", reference.kind, reference.name),
            Box::new(e),
        )
    })?;
    Ok(true)
}

/// Initialize the solution controller and shared state
pub async fn run(state: State, client: Client) {
    let api = check_api_queryable::<Solution>(client.clone()).await;

    let ctx = Arc::new(Ctx {
        base: state.to_context(client, CONTROLLER_ID),
    });

    info!(msg = "starting solution controller");
    let controller = Controller::new(api, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.base.metrics.ready_set(1);
    controller.await;
}
