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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use super::route::{normalize_route_path, PathSpec, Route, RouteHandler};
use crate::{AppError, AppResult};

pub const SUPPORTED_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD", "TRACE", "CONNECT",
];

/// A successful lookup.
pub struct RouteMatch {
    pub handler: Arc<dyn RouteHandler>,
    pub params: HashMap<String, String>,
    pub route: String,
}

#[derive(Default)]
struct RouteTable {
    by_method: HashMap<String, Vec<Arc<Route>>>,
    dirty: bool,
}

impl RouteTable {
    fn sort(&mut self) {
        for routes in self.by_method.values_mut() {
            routes.sort_by(|a, b| {
                b.spec
                    .specificity()
                    .cmp(&a.spec.specificity())
                    .then(a.seq.cmp(&b.seq))
            });
        }
        self.dirty = false;
    }
}

/// Method + path lookup over routes kept in descending specificity.
///
/// Adding a route only marks the table dirty. The first lookup that sees the flag sorts
/// under the write lock and downgrades to a read lock for its own scan; later lookups run
/// under the shared lock until the next addition.
#[derive(Default)]
pub struct Router {
    table: RwLock<RouteTable>,
    next_seq: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_method(method: &str) -> AppResult<String> {
        let method = method.to_ascii_uppercase();
        if SUPPORTED_METHODS.contains(&method.as_str()) {
            Ok(method)
        } else {
            Err(AppError::InvalidValue(format!(
                "unsupported http method {}",
                method
            )))
        }
    }

    fn insert(&self, method: &str, spec: PathSpec, handler: Arc<dyn RouteHandler>) -> AppResult<()> {
        let method = Self::check_method(method)?;
        let route = Arc::new(Route {
            method: method.clone(),
            spec,
            handler,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });
        debug!(
            "add route {} {} (specificity {})",
            method,
            route.spec.as_str(),
            route.spec.specificity()
        );
        let mut table = self.table.write();
        let routes = table.by_method.entry(method).or_default();
        // a second registration of the same spec replaces the first
        routes.retain(|r| r.spec.as_str() != route.spec.as_str());
        routes.push(route);
        table.dirty = true;
        Ok(())
    }

    pub fn add_route<H: RouteHandler>(&self, method: &str, path: &str, handler: H) -> AppResult<()> {
        self.insert(method, PathSpec::parse(path)?, Arc::new(handler))
    }

    pub fn add_pattern_route<H: RouteHandler>(
        &self,
        method: &str,
        pattern: &str,
        handler: H,
    ) -> AppResult<()> {
        self.insert(method, PathSpec::regex(pattern)?, Arc::new(handler))
    }

    pub fn get<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("GET", path, handler)
    }

    pub fn post<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("POST", path, handler)
    }

    pub fn put<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("PUT", path, handler)
    }

    pub fn delete<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("DELETE", path, handler)
    }

    pub fn patch<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("PATCH", path, handler)
    }

    pub fn options<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("OPTIONS", path, handler)
    }

    pub fn head<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.add_route("HEAD", path, handler)
    }

    pub fn find_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let table = {
            let table = self.table.read();
            if table.dirty {
                drop(table);
                let mut table = self.table.write();
                // another lookup may have sorted while we waited
                if table.dirty {
                    table.sort();
                }
                RwLockWriteGuard::downgrade(table)
            } else {
                table
            }
        };
        let routes = table.by_method.get(method)?;
        routes.iter().find_map(|route| {
            route.spec.matches(path).map(|params| RouteMatch {
                handler: route.handler.clone(),
                params,
                route: route.spec.as_str().to_string(),
            })
        })
    }

    pub fn route_count(&self) -> usize {
        self.table.read().by_method.values().map(Vec::len).sum()
    }

    pub fn route_count_for(&self, method: &str) -> usize {
        self.table
            .read()
            .by_method
            .get(&method.to_ascii_uppercase())
            .map_or(0, Vec::len)
    }

    pub fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .table
            .read()
            .by_method
            .iter()
            .filter(|(_, routes)| !routes.is_empty())
            .map(|(m, _)| m.clone())
            .collect();
        methods.sort();
        methods
    }

    pub fn clear(&self) {
        let mut table = self.table.write();
        table.by_method.clear();
        table.dirty = false;
    }

    pub fn group(&self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            router: self,
            prefix: normalize_route_path(prefix),
        }
    }
}

/// Registers routes under a common path prefix.
pub struct RouteGroup<'a> {
    router: &'a Router,
    prefix: String,
}

impl<'a> RouteGroup<'a> {
    fn full_path(&self, path: &str) -> String {
        let path = normalize_route_path(path);
        match (self.prefix.as_str(), path.as_str()) {
            ("/", p) => p.to_string(),
            (prefix, "/") => prefix.to_string(),
            (prefix, p) => format!("{}{}", prefix, p),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn route<H: RouteHandler>(&self, method: &str, path: &str, handler: H) -> AppResult<()> {
        self.router.add_route(method, &self.full_path(path), handler)
    }

    pub fn get<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("GET", path, handler)
    }

    pub fn post<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("POST", path, handler)
    }

    pub fn put<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("PUT", path, handler)
    }

    pub fn delete<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("DELETE", path, handler)
    }

    pub fn patch<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("PATCH", path, handler)
    }

    pub fn options<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("OPTIONS", path, handler)
    }

    pub fn head<H: RouteHandler>(&self, path: &str, handler: H) -> AppResult<()> {
        self.route("HEAD", path, handler)
    }

    pub fn group(&self, prefix: &str) -> RouteGroup<'a> {
        RouteGroup {
            router: self.router,
            prefix: self.full_path(prefix),
        }
    }
}
