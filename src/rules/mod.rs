use crate::config::{RuleConfig, ServiceConfig};
use crate::error::LimitError;
use crate::limiter::Policy;
use regex::Regex;

/// A rule compiled at config load — regex built once, policy validated,
/// never per-request.
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub pattern: Regex,
    /// Uppercased; `None` matches every method.
    pub method: Option<String>,
    pub priority: i32,
    pub policy: Policy,
    /// Insertion position — the tie-break for equal priorities.
    position: usize,
}

/// The active rule set plus the mandatory default policy. Immutable once
/// built; the service swaps whole sets atomically via `ArcSwap`, so readers
/// always observe a consistent set.
pub struct RuleSet {
    /// Sorted by priority descending, insertion order ascending.
    rules: Vec<CompiledRule>,
    default_policy: Policy,
}

impl RuleSet {
    pub fn compile(cfg: &ServiceConfig) -> Result<Self, LimitError> {
        let default_policy = Policy::from_config(&cfg.default_policy)
            .map_err(|e| LimitError::Config(format!("default_policy: {}", e)))?;

        let mut rules = Vec::new();
        for (position, rule) in cfg.rules.iter().enumerate() {
            if !rule.enabled {
                tracing::debug!("rules: skipped disabled rule, name={}", rule.display_name());
                continue;
            }
            rules.push(compile_rule(rule, position)?);
        }

        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.position.cmp(&b.position))
        });

        tracing::info!("rules: compiled rule set, count={}", rules.len());

        Ok(Self {
            rules,
            default_policy,
        })
    }

    /// Select the policy for a request. Highest-priority enabled rule whose
    /// pattern matches the path and whose method (if any) equals the request
    /// method; the default policy when none match.
    pub fn select(&self, path: &str, method: &str) -> (&Policy, Option<&CompiledRule>) {
        let method_upper = method.to_uppercase();
        for rule in &self.rules {
            if let Some(ref m) = rule.method {
                if *m != method_upper {
                    continue;
                }
            }
            if rule.pattern.is_match(path) {
                return (&rule.policy, Some(rule));
            }
        }
        (&self.default_policy, None)
    }

    pub fn default_policy(&self) -> &Policy {
        &self.default_policy
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(rule: &RuleConfig, position: usize) -> Result<CompiledRule, LimitError> {
    let pattern = Regex::new(&rule.path_pattern).map_err(|e| {
        LimitError::Config(format!(
            "rule '{}': bad pattern: {}",
            rule.display_name(),
            e
        ))
    })?;
    let policy = Policy::from_config(&rule.policy)
        .map_err(|e| LimitError::Config(format!("rule '{}': {}", rule.display_name(), e)))?;

    Ok(CompiledRule {
        id: rule.id.clone(),
        name: rule.name.clone(),
        pattern,
        method: rule.method.as_ref().map(|m| m.to_uppercase()),
        priority: rule.priority,
        policy,
        position,
    })
}
