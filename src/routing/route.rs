// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::http::{Request, Response};
use crate::{AppError, AppResult};

/// Param name the remainder matched by `*`/`**` is stored under.
pub const WILDCARD_PARAM: &str = "wildcard";

const LITERAL_BASE: i32 = 1000;
const REGEX_SCORE: i32 = 900;
const PATTERN_BASE: i32 = 500;
const PARAM_PENALTY: i32 = 10;
const CONSTRAINT_BONUS: i32 = 5;
const WILDCARD_SCORE: i32 = 1;

pub trait RouteHandler: Send + Sync + 'static {
    fn handle(&self, request: &mut Request, response: &mut Response) -> AppResult<()>;
}

impl<F> RouteHandler for F
where
    F: Fn(&mut Request, &mut Response) -> AppResult<()> + Send + Sync + 'static,
{
    fn handle(&self, request: &mut Request, response: &mut Response) -> AppResult<()> {
        self(request, response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Literal,
    Pattern,
    Wildcard,
    Regex,
}

/// A compiled route path.
///
/// `/users/:id` captures one segment, `/files/:name([a-z]+\.txt)` narrows the capture with
/// an inline expression, `/static/*` matches the rest of the path. Explicit expressions
/// registered with [`PathSpec::regex`] use their named groups as params.
#[derive(Clone)]
pub struct PathSpec {
    raw: String,
    kind: SpecKind,
    matcher: Option<Regex>,
    /// (capture group, param name)
    params: Vec<(String, String)>,
    specificity: i32,
}

impl fmt::Debug for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSpec")
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("specificity", &self.specificity)
            .finish()
    }
}

/// Leading `/`, no trailing `/` except for the root.
pub fn normalize_route_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

impl PathSpec {
    pub fn parse(path: &str) -> AppResult<PathSpec> {
        let raw = normalize_route_path(path);
        let is_pattern = raw.split('/').any(|s| s.starts_with(':') || s == "*" || s == "**");
        if !is_pattern {
            return Ok(PathSpec {
                specificity: LITERAL_BASE + raw.len() as i32,
                raw,
                kind: SpecKind::Literal,
                matcher: None,
                params: Vec::new(),
            });
        }

        let mut expr = String::from("^");
        let mut params = Vec::new();
        let mut constrained = 0;
        let mut wildcard = false;
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if wildcard {
                return Err(AppError::InvalidValue(format!(
                    "wildcard must be the last segment in {}",
                    raw
                )));
            }
            expr.push('/');
            if let Some(param) = segment.strip_prefix(':') {
                let group = format!("p{}", params.len());
                let (name, constraint) = match param.find('(') {
                    Some(open) if open > 0 && param.ends_with(')') => {
                        constrained += 1;
                        (&param[..open], Some(&param[open + 1..param.len() - 1]))
                    }
                    Some(_) => {
                        return Err(AppError::InvalidValue(format!(
                            "malformed parameter {:?} in {}",
                            segment, raw
                        )))
                    }
                    None => (param, None),
                };
                if name.is_empty() || params.iter().any(|(_, n): &(String, String)| n == name) {
                    return Err(AppError::InvalidValue(format!(
                        "empty or repeated parameter name in {}",
                        raw
                    )));
                }
                expr.push_str(&format!(
                    "(?P<{}>{})",
                    group,
                    constraint.unwrap_or("[^/]+")
                ));
                params.push((group, name.to_string()));
            } else if segment == "*" || segment == "**" {
                expr.push_str(&format!("(?P<{}>.*)", WILDCARD_PARAM));
                wildcard = true;
            } else {
                expr.push_str(&regex::escape(segment));
            }
        }
        expr.push('$');
        if wildcard {
            params.push((WILDCARD_PARAM.to_string(), WILDCARD_PARAM.to_string()));
        }

        let matcher = Regex::new(&expr)
            .map_err(|e| AppError::InvalidValue(format!("invalid route {}: {}", raw, e)))?;
        let (kind, specificity) = if wildcard {
            (SpecKind::Wildcard, WILDCARD_SCORE)
        } else {
            let named = params.len() as i32;
            (
                SpecKind::Pattern,
                PATTERN_BASE - PARAM_PENALTY * named
                    + raw.len() as i32
                    + CONSTRAINT_BONUS * constrained,
            )
        };
        Ok(PathSpec {
            raw,
            kind,
            matcher: Some(matcher),
            params,
            specificity,
        })
    }

    /// An explicit expression matched against the whole path.
    pub fn regex(pattern: &str) -> AppResult<PathSpec> {
        let anchored = format!(
            "^(?:{})$",
            pattern.trim_start_matches('^').trim_end_matches('$')
        );
        let matcher = Regex::new(&anchored)
            .map_err(|e| AppError::InvalidValue(format!("invalid route pattern {}: {}", pattern, e)))?;
        let params = matcher
            .capture_names()
            .flatten()
            .map(|name| (name.to_string(), name.to_string()))
            .collect();
        Ok(PathSpec {
            raw: pattern.to_string(),
            kind: SpecKind::Regex,
            matcher: Some(matcher),
            params,
            specificity: REGEX_SCORE,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> SpecKind {
        self.kind
    }

    pub fn specificity(&self) -> i32 {
        self.specificity
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(_, name)| name.as_str())
    }

    /// Params captured from `path`, or `None` if it does not match.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match &self.matcher {
            None => (self.raw == path).then(HashMap::new),
            Some(matcher) => {
                let captures = matcher.captures(path)?;
                let params = self
                    .params
                    .iter()
                    .filter_map(|(group, name)| {
                        captures
                            .name(group)
                            .map(|m| (name.clone(), m.as_str().to_string()))
                    })
                    .collect();
                Some(params)
            }
        }
    }
}

pub struct Route {
    pub method: String,
    pub spec: PathSpec,
    pub handler: Arc<dyn RouteHandler>,
    /// Registration sequence, keeps equal scores in registration order.
    pub(crate) seq: u64,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("spec", &self.spec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn literal_routes_match_exactly() {
        let spec = PathSpec::parse("users/active/").unwrap();
        assert_eq!(spec.as_str(), "/users/active");
        assert_eq!(spec.kind(), SpecKind::Literal);
        assert!(spec.matches("/users/active").is_some());
        assert!(spec.matches("/users/active/x").is_none());
    }

    #[test]
    fn params_and_constraints() {
        let spec = PathSpec::parse("/users/:id/posts/:post(\\d+)").unwrap();
        let params = spec.matches("/users/alice/posts/42").unwrap();
        assert_eq!(params["id"], "alice");
        assert_eq!(params["post"], "42");
        assert!(spec.matches("/users/alice/posts/latest").is_none());
        assert!(spec.matches("/users/a/b/posts/1").is_none());
        assert_eq!(spec.param_names().collect::<Vec<_>>(), vec!["id", "post"]);
    }

    #[test]
    fn wildcard_captures_remainder() {
        let spec = PathSpec::parse("/static/*").unwrap();
        let params = spec.matches("/static/css/site.css").unwrap();
        assert_eq!(params[WILDCARD_PARAM], "css/site.css");
        assert!(spec.matches("/other/x").is_none());
        assert!(PathSpec::parse("/a/*/b").is_err());
    }

    #[test]
    fn explicit_regex_uses_named_groups() {
        let spec = PathSpec::regex(r"/v(?P<version>\d+)/.*").unwrap();
        let params = spec.matches("/v2/items").unwrap();
        assert_eq!(params["version"], "2");
        assert!(spec.matches("/x/v2/items").is_none());
    }

    #[rstest]
    #[case("/users/:id/:id")]
    #[case("/users/:")]
    #[case("/users/:(\\d+)")]
    #[case("/users/:id(\\d+")]
    fn invalid_specs(#[case] spec: &str) {
        assert!(PathSpec::parse(spec).is_err());
    }

    #[test]
    fn specificity_order() {
        let literal = PathSpec::parse("/users/active").unwrap();
        let regex = PathSpec::regex("/users/.+").unwrap();
        let constrained = PathSpec::parse("/users/:id(\\d+)").unwrap();
        let param = PathSpec::parse("/users/:id").unwrap();
        let wildcard = PathSpec::parse("/users/*").unwrap();
        assert!(literal.specificity() > regex.specificity());
        assert!(regex.specificity() > constrained.specificity());
        assert!(constrained.specificity() > param.specificity());
        assert!(param.specificity() > wildcard.specificity());
        // longer literal paths rank above shorter ones
        assert!(
            PathSpec::parse("/users/active/today").unwrap().specificity() > literal.specificity()
        );
    }
}
