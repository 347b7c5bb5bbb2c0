//! Capability id pattern matching.
//!
//! Ids are `Kind` for the core group and `Kind.group` otherwise. Patterns
//! come in the forms `*`, `Kind`, `Kind.group`, `Kind.*`, `*.group` and
//! `*.suffix` (`*.crossplane.io` matches every crossplane group).

/// Whether `id` matches a single `pattern`.
pub fn matches_pattern(id: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == id {
        return true;
    }
    // "*.group" and "*.suffix": anything whose id ends with the suffix
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') {
            return id.ends_with(suffix);
        }
    }
    // "Kind.group" / "Kind.*": both sides match independently
    match (id.split_once('.'), pattern.split_once('.')) {
        (Some((id_kind, id_group)), Some((pattern_kind, pattern_group))) => {
            (pattern_kind == "*" || pattern_kind == id_kind)
                && (pattern_group == "*" || pattern_group == id_group)
        }
        _ => false,
    }
}

/// Apply include/exclude filtering: an exclude match always rejects; with a
/// non-empty include list the id must match at least one include.
pub fn capability_allowed(id: &str, includes: &[String], excludes: &[String]) -> bool {
    if excludes.iter().any(|pattern| matches_pattern(id, pattern)) {
        return false;
    }
    includes.is_empty() || includes.iter().any(|pattern| matches_pattern(id, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard() {
        assert!(matches_pattern("Pod", "Pod"));
        assert!(matches_pattern("Pod", "*"));
        assert!(matches_pattern("SQL.devopstoolkit.live", "SQL.devopstoolkit.live"));
        assert!(!matches_pattern("Pod", "Service"));
        assert!(!matches_pattern("Pod", "Pod.apps"));
    }

    #[test]
    fn test_kind_and_group_sides_match_independently() {
        assert!(matches_pattern("Deployment.apps", "Deployment.*"));
        assert!(matches_pattern("Deployment.apps", "*.apps"));
        assert!(!matches_pattern("Deployment.apps", "StatefulSet.*"));
        // bare kinds have no group side to match
        assert!(!matches_pattern("Pod", "Pod.*"));
    }

    #[test]
    fn test_group_suffix_patterns() {
        assert!(matches_pattern(
            "Provider.pkg.crossplane.io",
            "*.crossplane.io"
        ));
        assert!(matches_pattern(
            "RDSInstance.database.aws.crossplane.io",
            "*.aws.crossplane.io"
        ));
        assert!(!matches_pattern("Application.argoproj.io", "*.crossplane.io"));
    }

    #[test]
    fn test_reflexive_and_monotone_under_star() {
        for id in ["Pod", "Deployment.apps", "Provider.pkg.crossplane.io"] {
            assert!(matches_pattern(id, id), "{id} must match itself");
            assert!(matches_pattern(id, "*"), "{id} must match *");
        }
        // widening one side of a matching pattern keeps it matching
        assert!(matches_pattern("Deployment.apps", "Deployment.apps"));
        assert!(matches_pattern("Deployment.apps", "*.apps"));
        assert!(matches_pattern("Deployment.apps", "Deployment.*"));
    }

    #[test]
    fn test_include_exclude_scenario() {
        let includes = vec!["*.crossplane.io".to_string()];
        let excludes = vec!["*.aws.crossplane.io".to_string()];

        assert!(capability_allowed(
            "Provider.pkg.crossplane.io",
            &includes,
            &excludes
        ));
        assert!(!capability_allowed(
            "RDSInstance.database.aws.crossplane.io",
            &includes,
            &excludes
        ));
        assert!(!capability_allowed("Application.argoproj.io", &includes, &excludes));
    }

    #[test]
    fn test_empty_include_list_accepts_everything_not_excluded() {
        assert!(capability_allowed("Pod", &[], &[]));
        assert!(!capability_allowed("Pod", &[], &["Pod".to_string()]));
    }
}
