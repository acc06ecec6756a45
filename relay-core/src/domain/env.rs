//! Environment maps and their resolution along the stage chain
//!
//! Every merge returns a fresh map; inputs are never mutated.

use std::collections::HashMap;

/// Environment / parameter mapping carried by runs, stages and jobs
pub type Env = HashMap<String, serde_json::Value>;

/// Build number of the run, stamped at creation
pub const ENV_BUILD_NUMBER: &str = "PIPELINE_BUILD_NUMBER";

/// Operator who triggered the run, stamped at creation
pub const ENV_TRIGGER_USER: &str = "PIPELINE_TRIGGER_USER";

/// Keys the engine writes into a run's environment
pub const RESERVED_KEYS: [&str; 2] = [ENV_BUILD_NUMBER, ENV_TRIGGER_USER];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Reserved keys present in `layer`, sorted.
///
/// Callers use this to report when an overlay is about to shadow a value
/// stamped by the engine.
pub fn reserved_keys_in(layer: &Env) -> Vec<&str> {
    let mut keys: Vec<&str> = layer
        .keys()
        .map(String::as_str)
        .filter(|k| is_reserved(k))
        .collect();
    keys.sort_unstable();
    keys
}

/// Overlay `top` onto `base`; keys from `top` win.
pub fn overlay(base: &Env, top: &Env) -> Env {
    let mut merged = base.clone();
    merged.extend(top.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Fold the envs produced by a stage's jobs, in iteration order.
///
/// Later jobs overwrite earlier ones on conflicting keys.
pub fn merge_stage_job_envs<'a, I>(job_envs: I) -> Env
where
    I: IntoIterator<Item = &'a Env>,
{
    job_envs
        .into_iter()
        .fold(Env::new(), |acc, env| overlay(&acc, env))
}

/// New stage env: the previously persisted stage env overwritten by what the
/// jobs produced.
pub fn resolve_stage_env(stage_env: &Env, merged_job_env: &Env) -> Env {
    overlay(stage_env, merged_job_env)
}

/// Environment a stage's jobs start with: the inherited env (run env for the
/// first stage, previous stage env otherwise) overlaid with the stage's
/// custom params.
pub fn env_before_stage(inherited: &Env, custom_params: &Env) -> Env {
    overlay(inherited, custom_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, serde_json::Value)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_later_job_wins_on_conflict() {
        let a = env(&[("IMAGE", json!("a:1")), ("ONLY_A", json!(true))]);
        let b = env(&[("IMAGE", json!("b:2"))]);

        let merged = merge_stage_job_envs([&a, &b]);

        assert_eq!(merged["IMAGE"], json!("b:2"));
        assert_eq!(merged["ONLY_A"], json!(true));
    }

    #[test]
    fn test_job_values_override_stage_env() {
        let stage = env(&[("TAG", json!("old")), ("KEEP", json!(1))]);
        let jobs = env(&[("TAG", json!("new"))]);

        let resolved = resolve_stage_env(&stage, &jobs);

        assert_eq!(resolved["TAG"], json!("new"));
        assert_eq!(resolved["KEEP"], json!(1));
        assert_eq!(stage["TAG"], json!("old"));
    }

    #[test]
    fn test_custom_params_take_precedence() {
        let inherited = env(&[("BRANCH", json!("main")), ("X", json!(1))]);
        let custom = env(&[("BRANCH", json!("release"))]);

        let start = env_before_stage(&inherited, &custom);

        assert_eq!(start["BRANCH"], json!("release"));
        assert_eq!(start["X"], json!(1));
    }

    #[test]
    fn test_reserved_keys_detection() {
        let layer = env(&[
            (ENV_TRIGGER_USER, json!("mallory")),
            ("OTHER", json!(1)),
            (ENV_BUILD_NUMBER, json!(9)),
        ]);
        assert_eq!(
            reserved_keys_in(&layer),
            vec![ENV_BUILD_NUMBER, ENV_TRIGGER_USER]
        );
        assert!(reserved_keys_in(&Env::new()).is_empty());
    }
}
