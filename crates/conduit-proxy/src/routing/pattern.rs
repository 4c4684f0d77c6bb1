//! Route templates compiled to anchored, segment-aligned prefix regexes.

use std::collections::BTreeMap;

use hyper::Uri;
use regex::Regex;

use super::RouteError;
use crate::rules::ForwardRule;

/// Positional parameter holding the wildcard remainder.
pub const WILDCARD_PARAM: &str = "0";

/// A compiled rule route.
///
/// Every pattern matches as a prefix aligned on a `/` boundary, so `/echo/v1` matches
/// `/echo/v1` and `/echo/v1/more` but never `/echo/v10`. Whatever follows the prefix is
/// the remainder.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    regex: Regex,
    param_names: Vec<String>,
    wildcard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub params: BTreeMap<String, String>,
    /// Unmatched tail including its leading `/`, or empty.
    pub remainder: String,
}

impl RoutePattern {
    /// Build the pattern for a rule.
    ///
    /// With a `customRoute` the template is `/{slug}` followed by the normalized route.
    /// Without one, the path of `targetUrl` is used literally with an implicit wildcard.
    pub fn for_rule(rule: &ForwardRule) -> Result<Self, RouteError> {
        if rule.slug.is_empty() || rule.slug.contains('/') {
            return Err(RouteError::InvalidSlug(rule.slug.clone()));
        }

        match rule.custom_route.as_deref().map(str::trim) {
            Some(route) if !route.is_empty() => Self::compile(&rule.slug, route),
            _ => {
                let uri: Uri = rule
                    .target_url
                    .parse()
                    .map_err(|e: hyper::http::uri::InvalidUri| RouteError::InvalidTarget {
                        url: rule.target_url.clone(),
                        reason: e.to_string(),
                    })?;
                Self::literal(&rule.slug, uri.path())
            }
        }
    }

    /// Compile a template containing `{name}` placeholders and an optional trailing `*`.
    pub fn compile(slug: &str, template: &str) -> Result<Self, RouteError> {
        let mut route = normalize_route(template);
        let wildcard = route.ends_with('*');
        if wildcard {
            route.pop();
            while route.ends_with('/') {
                route.pop();
            }
        }

        let source = format!("/{slug}{route}");
        let mut param_names = Vec::new();
        let mut pattern = String::from("^");
        for segment in source.split('/').skip(1) {
            pattern.push('/');
            compile_segment(segment, &mut pattern, &mut param_names, template)?;
        }
        pattern.push_str("(/.*)?$");

        let regex = Regex::new(&pattern).map_err(|e| RouteError::InvalidTemplate {
            template: template.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: if wildcard { format!("{source}/*") } else { source },
            regex,
            param_names,
            wildcard,
        })
    }

    /// A literal prefix with an implicit wildcard. Braces carry no meaning here.
    fn literal(slug: &str, path: &str) -> Result<Self, RouteError> {
        let path = normalize_route(path);
        let prefix = format!("/{slug}{path}");
        let pattern = format!("^{}(/.*)?$", regex::escape(&prefix));
        let regex = Regex::new(&pattern).map_err(|e| RouteError::InvalidTemplate {
            template: prefix.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: format!("{prefix}/*"),
            regex,
            param_names: Vec::new(),
            wildcard: true,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Match a request path. Matching is case-sensitive.
    pub fn matches(&self, path: &str) -> Option<PatternMatch> {
        let captures = self.regex.captures(path)?;

        let mut params = BTreeMap::new();
        for (index, name) in self.param_names.iter().enumerate() {
            if let Some(value) = captures.get(index + 1) {
                params.insert(name.clone(), decode_segment(value.as_str()));
            }
        }

        let remainder = captures
            .get(self.param_names.len() + 1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        if self.wildcard {
            params.insert(
                WILDCARD_PARAM.to_string(),
                remainder.trim_start_matches('/').to_string(),
            );
        }

        Some(PatternMatch { params, remainder })
    }
}

/// Leading `/`, no empty segments, no trailing `/`. The root route normalizes to "".
fn normalize_route(route: &str) -> String {
    let mut normalized = String::with_capacity(route.len() + 1);
    for segment in route.trim().split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    normalized
}

fn compile_segment(
    segment: &str,
    pattern: &mut String,
    param_names: &mut Vec<String>,
    template: &str,
) -> Result<(), RouteError> {
    let invalid = |reason: &str| RouteError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    let mut rest = segment;
    while let Some(open) = rest.find('{') {
        let (literal, after) = rest.split_at(open);
        if literal.contains('}') {
            return Err(invalid("unbalanced '}'"));
        }
        pattern.push_str(&regex::escape(literal));

        let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
        let name = &after[1..close];
        if !is_param_name(name) {
            return Err(invalid(&format!("invalid parameter name '{name}'")));
        }
        if param_names.iter().any(|existing| existing == name) {
            return Err(invalid(&format!("duplicate parameter '{name}'")));
        }
        param_names.push(name.to_string());
        pattern.push_str("([^/]+)");
        rest = &after[close + 1..];
    }

    if rest.contains('}') {
        return Err(invalid("unbalanced '}'"));
    }
    pattern.push_str(&regex::escape(rest));
    Ok(())
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn decode_segment(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
