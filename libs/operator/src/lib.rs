pub mod capability_scan;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod git_knowledge;
pub mod mcp;
pub mod metrics;
pub mod remediation;
pub mod resource_sync;
pub mod solution;
pub mod telemetry;
