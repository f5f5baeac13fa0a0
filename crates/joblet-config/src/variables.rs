//! `${VAR}` substitution for workflow environment values.
//!
//! Substitution is single-pass: the replacement text is never re-scanned, so
//! values may safely contain `${...}` themselves. Unknown names pass through
//! literally. Secret values participate in substitution like any other
//! variable but the scope remembers which names are secret so log masking can
//! redact them.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// The variables visible at one point of a workflow: the global environment
/// merged with a job's own, job values winning on collision.
#[derive(Debug, Clone, Default)]
pub struct EnvScope {
    values: HashMap<String, String>,
    secret_names: HashSet<String>,
}

impl EnvScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the scope for one job: globals first, then job-local values on
    /// top.
    pub fn for_job(
        global_env: &HashMap<String, String>,
        global_secrets: &HashMap<String, String>,
        job_env: &HashMap<String, String>,
        job_secrets: &HashMap<String, String>,
    ) -> Self {
        let mut scope = Self::new();
        for (k, v) in global_env {
            scope.values.insert(k.clone(), v.clone());
        }
        for (k, v) in global_secrets {
            scope.values.insert(k.clone(), v.clone());
            scope.secret_names.insert(k.clone());
        }
        for (k, v) in job_env {
            scope.values.insert(k.clone(), v.clone());
            scope.secret_names.remove(k);
        }
        for (k, v) in job_secrets {
            scope.values.insert(k.clone(), v.clone());
            scope.secret_names.insert(k.clone());
        }
        scope
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.secret_names.contains(name)
    }

    /// Substitute `${NAME}` occurrences in one value. Single pass; unknown
    /// names are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                self.values
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| format!("${{{name}}}"))
            })
            .to_string()
    }

    /// Interpolate every value of a map.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Interpolate a list of strings (command arguments).
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// The split of this scope back into regular and secret maps, after
    /// interpolation. Used to build the dispatched job spec.
    pub fn into_environments(self) -> (HashMap<String, String>, HashMap<String, String>) {
        let interpolated: HashMap<String, String> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect();
        let mut regular = HashMap::new();
        let mut secret = HashMap::new();
        for (k, v) in interpolated {
            if self.secret_names.contains(&k) {
                secret.insert(k, v);
            } else {
                regular.insert(k, v);
            }
        }
        (regular, secret)
    }

    /// Values that must never appear in logs.
    pub fn secret_values(&self) -> Vec<&str> {
        self.secret_names
            .iter()
            .filter_map(|name| self.values.get(name).map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn basic_substitution() {
        let scope = EnvScope::for_job(
            &map(&[("REGION", "us-east-1")]),
            &map(&[]),
            &map(&[]),
            &map(&[]),
        );
        assert_eq!(
            scope.interpolate("deploy to ${REGION}"),
            "deploy to us-east-1"
        );
    }

    #[test]
    fn unknown_names_pass_through() {
        let scope = EnvScope::new();
        assert_eq!(scope.interpolate("x ${NOPE} y"), "x ${NOPE} y");
    }

    #[test]
    fn job_values_override_globals() {
        let scope = EnvScope::for_job(
            &map(&[("LEVEL", "global")]),
            &map(&[]),
            &map(&[("LEVEL", "job")]),
            &map(&[]),
        );
        assert_eq!(scope.interpolate("${LEVEL}"), "job");
    }

    #[test]
    fn substitution_is_single_pass() {
        let scope = EnvScope::for_job(
            &map(&[("A", "${B}"), ("B", "deep")]),
            &map(&[]),
            &map(&[]),
            &map(&[]),
        );
        // The replacement text is not re-scanned.
        assert_eq!(scope.interpolate("${A}"), "${B}");
    }

    #[test]
    fn secrets_substitute_but_are_tracked() {
        let scope = EnvScope::for_job(
            &map(&[]),
            &map(&[("TOKEN", "hunter2")]),
            &map(&[]),
            &map(&[]),
        );
        assert_eq!(scope.interpolate("auth ${TOKEN}"), "auth hunter2");
        assert!(scope.is_secret("TOKEN"));
        assert_eq!(scope.secret_values(), vec!["hunter2"]);
    }

    #[test]
    fn job_env_can_shadow_a_secret_into_the_open() {
        let scope = EnvScope::for_job(
            &map(&[]),
            &map(&[("KEY", "secret")]),
            &map(&[("KEY", "public")]),
            &map(&[]),
        );
        assert!(!scope.is_secret("KEY"));
        assert_eq!(scope.interpolate("${KEY}"), "public");
    }

    #[test]
    fn scope_splits_back_into_env_maps() {
        let scope = EnvScope::for_job(
            &map(&[("HOST", "db.internal"), ("URL", "pg://${HOST}/app")]),
            &map(&[("PASS", "hunter2")]),
            &map(&[]),
            &map(&[]),
        );
        let (regular, secret) = scope.into_environments();
        assert_eq!(regular.get("URL").map(String::as_str), Some("pg://db.internal/app"));
        assert_eq!(secret.get("PASS").map(String::as_str), Some("hunter2"));
        assert!(!regular.contains_key("PASS"));
    }
}
