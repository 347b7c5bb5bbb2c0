use crate::crd::SecretKeyRef;
use crate::error::{Error, Result};

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;

/// Resolve one non-empty value from `{name, key}` in the given namespace.
///
/// Missing secret, missing key and empty value each produce a distinct
/// error so the condition message tells the user what to fix.
pub async fn resolve_secret_value(
    client: &Client,
    namespace: &str,
    secret_ref: &SecretKeyRef,
) -> Result<String> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(&secret_ref.name).await.map_err(|e| match e {
        kube::Error::Api(ref ae) if ae.code == 404 => Error::AuthError(format!(
            "secret {namespace}/{} not found",
            secret_ref.name
        )),
        e => Error::KubeError(
            format!("failed to get secret {namespace}/{}", secret_ref.name),
            Box::new(e),
        ),
    })?;

    let data = secret.data.unwrap_or_default();
    let value = data.get(&secret_ref.key).ok_or_else(|| {
        Error::AuthError(format!(
            "key {} not found in secret {namespace}/{}",
            secret_ref.key, secret_ref.name
        ))
    })?;

    let token = std::str::from_utf8(&value.0)
        .map_err(|_| {
            Error::AuthError(format!(
                "key {} in secret {namespace}/{} is not valid UTF-8",
                secret_ref.key, secret_ref.name
            ))
        })?
        .trim()
        .to_string();

    if token.is_empty() {
        return Err(Error::AuthError(format!(
            "key {} in secret {namespace}/{} is empty",
            secret_ref.key, secret_ref.name
        )));
    }
    Ok(token)
}

/// Resolve an MCP bearer token from a secret reference.
pub async fn resolve_bearer_token(
    client: &Client,
    namespace: &str,
    secret_ref: &SecretKeyRef,
) -> Result<String> {
    resolve_secret_value(client, namespace, secret_ref).await
}

/// Like [`resolve_bearer_token`] but tolerates an absent reference.
pub async fn resolve_optional_bearer_token(
    client: &Client,
    namespace: &str,
    secret_ref: Option<&SecretKeyRef>,
) -> Result<Option<String>> {
    match secret_ref {
        Some(secret_ref) => Ok(Some(resolve_bearer_token(client, namespace, secret_ref).await?)),
        None => Ok(None),
    }
}
