//! Route table with longest-prefix matching

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;
use waypoint_core::{validate_routes, GatewayError, GatewayResult, RouteRule};

/// Immutable, validated set of routes ordered longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Validate and index a set of routes
    pub fn new(mut rules: Vec<RouteRule>) -> GatewayResult<Self> {
        validate_routes(&rules)?;
        rules.sort_by(|a, b| {
            let a = a.prefix.trim_end_matches('/').len();
            let b = b.prefix.trim_end_matches('/').len();
            b.cmp(&a)
        });
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the most specific route accepting `method` on `path`.
    ///
    /// Fails with `MethodNotAllowed` when some prefix matches but none of the
    /// matching rules allows the method.
    pub fn match_route(&self, method: &str, path: &str) -> GatewayResult<&RouteRule> {
        let mut prefix_matched = false;
        for rule in &self.rules {
            if !rule.matches_path(path) {
                continue;
            }
            if rule.allows_method(method) {
                return Ok(rule);
            }
            prefix_matched = true;
        }

        if prefix_matched {
            Err(GatewayError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
            })
        } else {
            Err(GatewayError::RouteNotFound(path.to_string()))
        }
    }
}

/// Shared handle to the active route table; reloads swap the whole table
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Snapshot of the active table
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Validate `rules` and atomically replace the table.
    ///
    /// On validation failure the current table stays in place.
    pub fn reload(&self, rules: Vec<RouteRule>) -> GatewayResult<Arc<RouteTable>> {
        let table = Arc::new(RouteTable::new(rules)?);
        self.current.store(table.clone());
        info!(routes = table.len(), "Route table reloaded");
        Ok(table)
    }
}
