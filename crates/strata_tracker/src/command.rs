//! Launch-script rendering.
//!
//! A bundle's shell script is the fixed diagnostic preamble followed by the
//! job spec's script template. Templates substitute `{simname}`,
//! `{timestamp}` and user-defined variables; `{eval: expr}` variables go
//! through a restricted expression evaluator (arithmetic, strings,
//! comparisons). Builtin function families must be imported explicitly via
//! the spec's `imports` list; everything else is rejected up front.

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Local;
use evalexpr::{eval_with_context, Context as _, ContextWithMutableVariables, HashMapContext, Value};
use std::collections::BTreeMap;
use strata_protocol::{JobSpec, VarValue};

/// Importable function families. Importing any of them enables the
/// evaluator's builtin functions (`min`, `max`, `floor`, string helpers...).
const KNOWN_IMPORTS: &[&str] = &["math", "str"];

/// Diagnostic lines prefixed to every rendered script.
const PREAMBLE: &str = "ulimit -m 28 10485760\n\
                        echo \"date:\" `date`\n\
                        echo \"host:\" `hostname`\n\
                        echo \"pwd: \" `pwd`\n\
                        echo \"uri:  \" $FLUX_URI\n\n";

/// Substitute `{name}` placeholders from `scope`. `{{` and `}}` escape to
/// literal braces; unknown variables are an error naming the variable.
pub fn substitute(template: &str, scope: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => bail!("unterminated '{{' in template"),
                    }
                }
                let value = scope
                    .get(&name)
                    .ok_or_else(|| anyhow!("undefined template variable '{name}'"))?;
                out.push_str(value);
            }
            '}' => bail!("unmatched '}}' in template"),
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Evaluate a restricted expression against the rendered variable scope.
fn evaluate(expr: &str, scope: &BTreeMap<String, String>, builtins: bool) -> Result<String> {
    let mut ctx: HashMapContext = HashMapContext::new();
    ctx.set_builtin_functions_disabled(!builtins)
        .map_err(|e| anyhow!("evaluator setup failed: {e}"))?;
    for (name, value) in scope {
        ctx.set_value(name.clone(), Value::from(value.clone()))
            .map_err(|e| anyhow!("evaluator scope for '{name}': {e}"))?;
    }

    let value = eval_with_context(expr, &ctx)
        .map_err(|e| anyhow!("expression '{expr}' failed: {e}"))?;
    match value {
        Value::String(s) => Ok(s),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => bail!("expression '{expr}' produced unusable value {other:?}"),
    }
}

/// Render one variable value against the scope built so far.
fn render_value(value: &VarValue, scope: &BTreeMap<String, String>, builtins: bool) -> Result<String> {
    match value {
        VarValue::Literal(s) => substitute(s, scope),
        VarValue::Int(i) => Ok(i.to_string()),
        VarValue::Float(f) => Ok(f.to_string()),
        VarValue::Bool(b) => Ok(b.to_string()),
        VarValue::List(items) => {
            let parts: Result<Vec<String>> = items
                .iter()
                .map(|item| render_value(item, scope, builtins))
                .collect();
            Ok(parts?.concat())
        }
        VarValue::Eval(spec) => {
            let expr = substitute(&spec.eval, scope)?;
            evaluate(&expr, scope, builtins)
        }
    }
}

/// Renders the per-bundle launch script of one job spec.
pub struct ScriptRenderer<'a> {
    spec: &'a JobSpec,
}

impl<'a> ScriptRenderer<'a> {
    pub fn new(spec: &'a JobSpec) -> Result<Self> {
        for import in &spec.imports {
            if !KNOWN_IMPORTS.contains(&import.as_str()) {
                bail!(
                    "[{}] unknown import '{}' (known: {:?})",
                    spec.job_type,
                    import,
                    KNOWN_IMPORTS
                );
            }
        }
        Ok(Self { spec })
    }

    /// Bundle display name: the sim itself, or the names joined for
    /// multi-sim bundles.
    pub fn bundle_name(sims: &[String]) -> String {
        if sims.len() == 1 {
            sims[0].clone()
        } else {
            sims.join("_")
        }
    }

    /// Render the full script for one bundle.
    pub fn render(&self, sims: &[String]) -> Result<String> {
        let builtins = !self.spec.imports.is_empty();

        let mut scope = BTreeMap::new();
        scope.insert("simname".to_string(), Self::bundle_name(sims));
        scope.insert(
            "timestamp".to_string(),
            Local::now().format("%Y%m%d-%H%M%S").to_string(),
        );

        // Document order: each variable renders with every earlier one
        // already in scope. Null-valued variables are skipped.
        for (name, value) in &self.spec.variables {
            let Some(value) = value else {
                continue;
            };
            let rendered = render_value(value, &scope, builtins).with_context(|| {
                format!(
                    "[{}] variable '{}' for bundle '{}'",
                    self.spec.job_type,
                    name,
                    Self::bundle_name(sims)
                )
            })?;
            scope.insert(name.clone(), rendered);
        }

        let body = substitute(&self.spec.script, &scope).with_context(|| {
            format!(
                "[{}] script template for bundle '{}'",
                self.spec.job_type,
                Self::bundle_name(sims)
            )
        })?;

        Ok(format!("{PREAMBLE}{body}"))
    }
}
