//! Minimal path matcher for the gateway's fixed endpoint table.
//!
//! Supports static segments and `{param}` captures. Routes are tried in
//! order; the first whose method set and path pattern both match wins.

use http::Method;
use std::collections::HashMap;

#[derive(Debug)]
enum PathSegment {
    Static(String),
    Param(String),
}

#[derive(Debug)]
struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    /// Parses a path pattern string.
    /// Supports:
    /// - Static segments: "/in"
    /// - Dynamic parameters: "/in/{campaign_id}"
    fn parse(path_str: &str) -> Self {
        let normalized_path = path_str.trim().trim_matches('/');

        let segments: Vec<PathSegment> = if normalized_path.is_empty() {
            vec![]
        } else {
            normalized_path
                .split('/')
                .map(|s| {
                    if let Some(stripped) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                        PathSegment::Param(stripped.to_string())
                    } else {
                        PathSegment::Static(s.to_string())
                    }
                })
                .collect()
        };

        Path { segments }
    }

    /// Matches a request path against this pattern. Trailing slashes are
    /// normalized away on both sides.
    fn matches<'a>(&self, request_path: &'a str) -> Option<HashMap<String, &'a str>> {
        let normalized_path = request_path.trim().trim_matches('/');

        let request_segments: Vec<&'a str> = if normalized_path.is_empty() {
            vec![]
        } else {
            normalized_path.split('/').collect()
        };

        if request_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();

        for (segment, request_segment) in self.segments.iter().zip(request_segments) {
            match segment {
                PathSegment::Static(s) => {
                    if request_segment != s {
                        return None;
                    }
                }
                PathSegment::Param(name) => {
                    params.insert(name.clone(), request_segment);
                }
            }
        }

        Some(params)
    }
}

#[derive(Debug, PartialEq)]
pub struct RouteMatch<'a, A> {
    pub params: HashMap<String, &'a str>,
    pub action: &'a A,
}

#[derive(Debug)]
pub struct Route<A> {
    methods: Option<Vec<Method>>,
    path: Path,
    action: A,
}

impl<A> Route<A> {
    /// Creates a new route. `methods: None` matches any method.
    pub fn new(methods: Option<Vec<Method>>, path: &str, action: A) -> Self {
        Self {
            methods,
            path: Path::parse(path),
            action,
        }
    }

    fn matches<'a>(&'a self, method: &Method, request_path: &'a str) -> Option<RouteMatch<'a, A>> {
        if let Some(methods) = &self.methods
            && !methods.contains(method)
        {
            return None;
        }

        let params = self.path.matches(request_path)?;
        Some(RouteMatch {
            params,
            action: &self.action,
        })
    }
}

pub struct RouteTable<A> {
    routes: Vec<Route<A>>,
}

impl<A> RouteTable<A> {
    pub fn new(routes: Vec<Route<A>>) -> Self {
        Self { routes }
    }

    /// Returns the first route matching the method and path, if any.
    pub fn resolve<'a>(&'a self, method: &Method, path: &'a str) -> Option<RouteMatch<'a, A>> {
        self.routes
            .iter()
            .find_map(|route| route.matches(method, path))
    }
}
