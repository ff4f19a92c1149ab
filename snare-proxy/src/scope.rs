use bytes::Bytes;
use http::{Request, Response, Uri};
use regex::Regex;

use crate::config::{ScopePatternType, ScopeRule, ScopeRuleType, ScopeTarget};
use crate::error::ProxyError;
use crate::intercept::{RequestFilter, ResponseFilter};
use crate::modify::ForwardedRequest;

/// Scope rules compiled for matching. Exclude rules win; with no matching
/// include the target is out of scope.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule_type: ScopeRuleType,
    target: ScopeTarget,
    matcher: Regex,
}

impl ScopeFilter {
    pub fn new(rules: &[ScopeRule]) -> Result<Self, ProxyError> {
        let rules = rules
            .iter()
            .filter(|rule| rule.enabled)
            .map(|rule| {
                let source = match rule.pattern_type {
                    ScopePatternType::Wildcard => wildcard_regex(&rule.pattern),
                    ScopePatternType::Regex => rule.pattern.clone(),
                };
                let matcher = Regex::new(&source).map_err(|err| {
                    ProxyError::Config(format!("invalid scope pattern {:?}: {err}", rule.pattern))
                })?;
                Ok(CompiledRule {
                    rule_type: rule.rule_type,
                    target: rule.target,
                    matcher,
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;
        Ok(Self { rules })
    }

    pub fn is_in_scope(&self, host: &str, path: &str) -> bool {
        let mut include_match = false;

        for rule in &self.rules {
            let value = match rule.target {
                ScopeTarget::Host => host,
                ScopeTarget::Path => path,
            };
            if !rule.matcher.is_match(value) {
                continue;
            }
            match rule.rule_type {
                ScopeRuleType::Include => include_match = true,
                ScopeRuleType::Exclude => return false,
            }
        }

        include_match
    }

    fn uri_in_scope(&self, uri: &Uri) -> bool {
        self.is_in_scope(uri.host().unwrap_or_default(), uri.path())
    }
}

impl RequestFilter for ScopeFilter {
    fn matches_request(&self, req: &Request<Bytes>) -> bool {
        self.uri_in_scope(req.uri())
    }
}

impl ResponseFilter for ScopeFilter {
    fn matches_response(&self, res: &Response<Bytes>) -> bool {
        res.extensions()
            .get::<ForwardedRequest>()
            .is_some_and(|forwarded| self.uri_in_scope(&forwarded.uri))
    }
}

/// Translates a `*` wildcard into a regex anchored at both ends; every
/// other character matches literally.
fn wildcard_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{body}$")
}
