//! Job descriptions as loaded from per-type YAML spec files.

use crate::types::JobType;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeMap;

/// A template variable value. Literals are format-substituted, lists render
/// each element and join, `{eval: expr}` entries go through the restricted
/// expression evaluator. Scalars pass through as their display form.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VarValue {
    Eval(EvalSpec),
    Literal(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<VarValue>),
}

/// `{eval: expr}` wrapper; the expression is substituted against the
/// variable scope before evaluation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EvalSpec {
    pub eval: String,
}

/// Per-simulation resource requirements and bundling of one job type.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub nnodes: u32,
    pub nprocs: u32,
    pub cores_per_task: u32,
    #[serde(default)]
    pub ngpus: u32,
    #[serde(default = "default_bundle_size")]
    pub bundle_size: usize,
    #[serde(default)]
    pub use_broker: bool,
    #[serde(default)]
    pub broker_options: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub wrapper: Option<String>,
}

fn default_bundle_size() -> usize {
    1
}

/// Full description of one job type: scheduling shape, launch script
/// template, and the variable scope the template renders against.
///
/// `variables` keeps document order: each variable renders with every
/// earlier variable already in scope, so later entries may reference
/// earlier ones. A null-valued variable is legal and simply skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub job_type: JobType,
    /// Workdir family override; defaults to the job type's own family.
    #[serde(default)]
    pub dir_sim: Option<String>,
    pub jobname: String,
    pub jobdesc: String,
    pub script: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub variables: IndexMap<String, Option<VarValue>>,
    pub config: ResourceConfig,
}

impl JobSpec {
    /// Workdir family used for this job type's simulations.
    pub fn sim_dir_family(&self) -> &str {
        self.dir_sim
            .as_deref()
            .unwrap_or_else(|| self.job_type.sim_dir_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC_YAML: &str = r#"
job_type: createsim
dir_sim: cg
jobname: csim
jobdesc: "create sims for {}"
script: |
  run_sim --name {simname} --out {outdir}
imports: [math]
variables:
  workdir: "/scratch/{simname}"
  outdir: "{workdir}/out"
  retries: 3
  threads: {eval: "2 * 4"}
config:
  nnodes: 1
  nprocs: 1
  cores_per_task: 2
  ngpus: 1
  bundle_size: 1
"#;

    #[test]
    fn parses_full_spec() {
        let spec: JobSpec = serde_yaml::from_str(SPEC_YAML).unwrap();
        assert_eq!(spec.job_type, JobType::CreateSim);
        assert_eq!(spec.sim_dir_family(), "cg");
        assert_eq!(spec.config.bundle_size, 1);
        assert_eq!(spec.config.ngpus, 1);
        assert_eq!(spec.imports, vec!["math".to_string()]);
        assert_eq!(
            spec.variables.get("workdir"),
            Some(&Some(VarValue::Literal("/scratch/{simname}".to_string())))
        );
        assert_eq!(
            spec.variables.get("retries"),
            Some(&Some(VarValue::Int(3)))
        );
        assert!(matches!(
            spec.variables.get("threads"),
            Some(Some(VarValue::Eval(EvalSpec { eval }))) if eval == "2 * 4"
        ));
    }

    #[test]
    fn variables_keep_document_order() {
        let spec: JobSpec = serde_yaml::from_str(SPEC_YAML).unwrap();
        let keys: Vec<&str> = spec.variables.keys().map(String::as_str).collect();
        // Document order, not alphabetical: outdir references workdir and
        // must render after it.
        assert_eq!(keys, vec!["workdir", "outdir", "retries", "threads"]);
    }

    #[test]
    fn null_variables_are_tolerated() {
        let yaml = r#"
job_type: cg
jobname: cg
jobdesc: "cg sim {}"
script: "run {simname}"
variables:
  opt_flag:
  outdir: "/scratch/{simname}"
config:
  nnodes: 1
  nprocs: 1
  cores_per_task: 1
"#;
        let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.variables.get("opt_flag"), Some(&None));
        assert_eq!(
            spec.variables.get("outdir"),
            Some(&Some(VarValue::Literal("/scratch/{simname}".to_string())))
        );
    }

    #[test]
    fn bundle_size_defaults_to_one() {
        let yaml = r#"
job_type: cg
jobname: cg
jobdesc: "cg sim {}"
script: "run {simname}"
config:
  nnodes: 1
  nprocs: 1
  cores_per_task: 1
"#;
        let spec: JobSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.config.bundle_size, 1);
        assert_eq!(spec.sim_dir_family(), "cg");
        assert!(spec.variables.is_empty());
    }
}
