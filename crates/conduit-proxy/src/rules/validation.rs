//! Static checks over a rule set.
//!
//! Nothing here blocks serving: the resolver skips rules whose route does not compile
//! and the sandbox reports script failures per request. Validation surfaces the same
//! problems up front, for `conduit check` and the startup log.

use std::collections::HashMap;
use std::fmt;

use hyper::{Method, Uri};

use super::ForwardRule;
use crate::routing::RoutePattern;
use crate::scripting::{validate_script, ScriptLanguage, ScriptRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    Warning,
    Error,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueSeverity::Warning => f.write_str("warning"),
            IssueSeverity::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIssue {
    pub rule_id: i64,
    pub slug: String,
    pub severity: IssueSeverity,
    pub message: String,
}

impl RuleIssue {
    fn new(rule: &ForwardRule, severity: IssueSeverity, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule.id,
            slug: rule.slug.clone(),
            severity,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl fmt::Display for RuleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rule {} ({}): {}",
            self.severity, self.rule_id, self.slug, self.message
        )
    }
}

/// Check every rule, in store order. Scripts are compiled with the rule's engine.
pub fn validate_rules(rules: &[ForwardRule], default_language: ScriptLanguage) -> Vec<RuleIssue> {
    let mut issues = Vec::new();
    let mut ids: HashMap<i64, usize> = HashMap::new();
    let mut slugs: HashMap<&str, i64> = HashMap::new();

    for rule in rules {
        let seen = ids.entry(rule.id).or_default();
        *seen += 1;
        if *seen == 2 {
            issues.push(RuleIssue::new(
                rule,
                IssueSeverity::Error,
                format!("duplicate rule id {}", rule.id),
            ));
        }

        if rule.slug.is_empty() {
            issues.push(RuleIssue::new(rule, IssueSeverity::Error, "slug is empty"));
        } else if let Some(first) = slugs.get(rule.slug.as_str()) {
            issues.push(RuleIssue::new(
                rule,
                IssueSeverity::Warning,
                format!(
                    "slug '{}' is also used by rule {first}; the earlier rule wins where both match",
                    rule.slug
                ),
            ));
        } else {
            slugs.insert(rule.slug.as_str(), rule.id);
        }

        if Method::from_bytes(rule.method.as_bytes()).is_err() || rule.method.is_empty() {
            issues.push(RuleIssue::new(
                rule,
                IssueSeverity::Error,
                format!("invalid method '{}'", rule.method),
            ));
        }

        check_target(rule, &mut issues);

        if !rule.slug.is_empty() {
            if let Err(e) = RoutePattern::for_rule(rule) {
                issues.push(RuleIssue::new(rule, IssueSeverity::Error, e.to_string()));
            }
        }

        check_scripts(rule, default_language, &mut issues);
    }

    issues
}

fn check_target(rule: &ForwardRule, issues: &mut Vec<RuleIssue>) {
    match rule.target_url.trim().parse::<Uri>() {
        Ok(uri) => match uri.scheme_str() {
            Some("http") | Some("https") if uri.host().is_some() => {}
            _ => issues.push(RuleIssue::new(
                rule,
                IssueSeverity::Error,
                format!("targetUrl '{}' must be an absolute http(s) URL", rule.target_url),
            )),
        },
        Err(e) => issues.push(RuleIssue::new(
            rule,
            IssueSeverity::Error,
            format!("targetUrl '{}' is not a valid URL: {e}", rule.target_url),
        )),
    }
}

fn check_scripts(rule: &ForwardRule, default_language: ScriptLanguage, issues: &mut Vec<RuleIssue>) {
    if !rule.has_scripts() {
        return;
    }

    let language = match ScriptLanguage::for_rule(rule, default_language) {
        Ok(language) => language,
        Err(e) => {
            issues.push(RuleIssue::new(rule, IssueSeverity::Error, e.to_string()));
            return;
        }
    };

    for role in ScriptRole::ALL {
        let Some(source) = rule.script_for(role) else {
            continue;
        };
        if let Err(e) = validate_script(language, source) {
            issues.push(RuleIssue::new(
                rule,
                IssueSeverity::Error,
                format!("{role} script: {e}"),
            ));
        }
    }
}
