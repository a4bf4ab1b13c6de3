//! Decode pipeline: user rules evaluated against each coalesced receive
//! buffer.
//!
//! Rules are compiled once when the rule set changes. A rule that fails to
//! compile or evaluate contributes nothing; the others still run.

use crate::serial::error::DecodeRuleError;
use crate::serial::expr::Expr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, user-authored decode expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeRule {
    pub name: String,
    pub title: String,
    pub expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Output of one pipeline pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Annotation {
    /// Concatenated `" [title: value]"` fragments.
    pub text: String,
    pub failures: Vec<DecodeRuleError>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    title: String,
    compiled: Result<Expr, DecodeRuleError>,
}

/// The enabled rules, in ascending name order.
#[derive(Debug, Clone, Default)]
pub struct DecodePipeline {
    rules: Vec<CompiledRule>,
}

impl DecodePipeline {
    /// Compile the enabled subset of `rules`. Compile errors are kept and
    /// reported on every evaluation rather than rejected here, so one bad
    /// rule never blocks the rest.
    pub fn compile(rules: &BTreeMap<String, DecodeRule>) -> Self {
        let compiled = rules
            .values()
            .filter(|r| r.enabled && !r.expression.trim().is_empty())
            .map(|r| CompiledRule {
                name: r.name.clone(),
                title: r.title.clone(),
                compiled: Expr::parse(&r.expression).map_err(|source| {
                    log::warn!("Decode rule '{}' does not compile: {}", r.name, source);
                    DecodeRuleError {
                        rule: r.name.clone(),
                        source,
                    }
                }),
            })
            .collect();
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Names of rules that failed to compile.
    pub fn broken_rules(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.compiled.is_err())
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Evaluate every rule against `buf`.
    pub fn annotate(&self, buf: &[u8]) -> Annotation {
        let mut out = Annotation::default();
        for rule in &self.rules {
            let expr = match &rule.compiled {
                Ok(expr) => expr,
                Err(e) => {
                    out.failures.push(e.clone());
                    continue;
                }
            };
            match expr.eval(buf) {
                Ok(value) => {
                    let label = if rule.title.is_empty() {
                        &rule.name
                    } else {
                        &rule.title
                    };
                    out.text.push_str(&format!(" [{}: {}]", label, value));
                }
                Err(source) => {
                    log::debug!("Decode rule '{}' failed: {}", rule.name, source);
                    out.failures.push(DecodeRuleError {
                        rule: rule.name.clone(),
                        source,
                    });
                }
            }
        }
        out
    }
}
