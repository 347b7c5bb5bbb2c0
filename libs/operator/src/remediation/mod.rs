pub mod controller;
pub mod cooldown;
pub mod matcher;
pub mod notify;
pub mod owner;
pub mod processor;
pub mod rate_limit;

use crate::crd::remediation::RemediationPolicy;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Active policies by `<namespace>/<name>`, shared between the reconciler,
/// the event processor and the cooldown persister.
pub type PolicyRegistry = Arc<RwLock<HashMap<String, Arc<RemediationPolicy>>>>;
