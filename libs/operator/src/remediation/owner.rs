use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::client::Client;
use kube::ResourceExt;
use tracing::debug;

/// Owner resolved for rate-limit bucketing: `(kind, name)` where kind is
/// `"cronjob"`, `"job"` or empty for the bare object.
pub type ResolvedOwner = (String, String);

/// Parse the CronJob name out of a Job pod's name:
/// `<name>-<digits>-<suffix>` with at least three segments, the
/// second-to-last all digits and a non-empty suffix.
pub fn parse_cronjob_name(pod_name: &str) -> Option<String> {
    let segments: Vec<&str> = pod_name.split('-').collect();
    if segments.len() < 3 {
        return None;
    }
    let digits = segments[segments.len() - 2];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if segments[segments.len() - 1].is_empty() {
        return None;
    }
    Some(segments[..segments.len() - 2].join("-"))
}

/// Walk a Pod's owner chain (Pod → Job → CronJob) so retried pods of the
/// same workload share one rate-limit bucket. Non-Pods map to themselves.
pub async fn resolve_owner(
    client: &Client,
    namespace: &str,
    kind: &str,
    name: &str,
) -> ResolvedOwner {
    if kind != "Pod" || namespace.is_empty() {
        return (String::new(), name.to_string());
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = match pods.get(name).await {
        Ok(pod) => pod,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            // the pod is already gone; its name may still encode the CronJob
            return match parse_cronjob_name(name) {
                Some(cronjob) => ("cronjob".to_string(), cronjob),
                None => (String::new(), name.to_string()),
            };
        }
        Err(e) => {
            debug!(msg = "pod fetch failed during owner resolution", %e);
            return (String::new(), name.to_string());
        }
    };

    let Some(job_ref) = pod
        .owner_references()
        .iter()
        .find(|o| o.kind == "Job")
        .cloned()
    else {
        return (String::new(), name.to_string());
    };

    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    let job = match jobs.get(&job_ref.name).await {
        Ok(job) => job,
        Err(e) => {
            debug!(msg = "job fetch failed during owner resolution", %e);
            return ("job".to_string(), job_ref.name);
        }
    };

    match job.owner_references().iter().find(|o| o.kind == "CronJob") {
        Some(cronjob_ref) => ("cronjob".to_string(), cronjob_ref.name.clone()),
        None => ("job".to_string(), job.name_any()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Request, Response};
    use kube::client::Body;
    use serde_json::json;

    #[test]
    fn test_parse_cronjob_name() {
        assert_eq!(
            parse_cronjob_name("db-cleanup-29409620-xyz99").as_deref(),
            Some("db-cleanup")
        );
        assert_eq!(
            parse_cronjob_name("my-cronjob-111111-abc").as_deref(),
            Some("my-cronjob")
        );
        // two segments only
        assert_eq!(parse_cronjob_name("my-pod"), None);
        // second-to-last not all digits
        assert_eq!(parse_cronjob_name("web-abc123-xyz"), None);
        // empty suffix
        assert_eq!(parse_cronjob_name("job-123456-"), None);
    }

    #[test]
    fn test_single_segment_and_empty() {
        assert_eq!(parse_cronjob_name("standalone"), None);
        assert_eq!(parse_cronjob_name(""), None);
    }

    #[tokio::test]
    async fn test_non_pod_maps_to_itself() {
        let (mock_service, _handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let owner = resolve_owner(&client, "default", "Deployment", "web").await;
        assert_eq!(owner, (String::new(), "web".to_string()));
    }

    #[tokio::test]
    async fn test_deleted_pod_falls_back_to_name_parsing() {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("pod get");
            assert!(request.uri().path().ends_with("/pods/db-cleanup-29409620-xyz99"));
            let not_found = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "reason": "NotFound",
                "code": 404
            });
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&not_found).unwrap()))
                    .unwrap(),
            );
        });

        let owner = resolve_owner(&client, "default", "Pod", "db-cleanup-29409620-xyz99").await;
        assert_eq!(owner, ("cronjob".to_string(), "db-cleanup".to_string()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_job_cronjob_chain() {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("pod get");
            assert!(request
                .uri()
                .path()
                .ends_with("/pods/my-cronjob-111111-abc"));
            let pod = json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "my-cronjob-111111-abc",
                    "namespace": "default",
                    "ownerReferences": [{
                        "apiVersion": "batch/v1",
                        "kind": "Job",
                        "name": "my-cronjob-111111",
                        "uid": "j-1"
                    }]
                }
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&pod).unwrap()))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("job get");
            assert!(request.uri().path().ends_with("/jobs/my-cronjob-111111"));
            let job = json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": {
                    "name": "my-cronjob-111111",
                    "namespace": "default",
                    "ownerReferences": [{
                        "apiVersion": "batch/v1",
                        "kind": "CronJob",
                        "name": "my-cronjob",
                        "uid": "cj-1"
                    }]
                }
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&job).unwrap()))
                    .unwrap(),
            );
        });

        let owner = resolve_owner(&client, "default", "Pod", "my-cronjob-111111-abc").await;
        assert_eq!(owner, ("cronjob".to_string(), "my-cronjob".to_string()));
        server.await.unwrap();
    }
}
