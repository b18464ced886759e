//! Route Table
//! Mission: a single ordered list mapping ingress path+method to
//! (auth requirement, target service, upstream path template, forwarding
//! mode, rate-limit class). First match wins.

use reqwest::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    NoAuth,
    Required,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitClass {
    Standard,
    Strict,
    Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// Forward method/body/query verbatim to the mapped upstream path.
    Passthrough,
    /// Route is serviced locally (health, metrics, websocket status).
    Local,
}

/// A path pattern: either an exact path, a prefix mount (`/api/v1/x/*`), or
/// a segment with named parameters (`/api/v1/users/:id`).
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(&'static str),
    Prefix(&'static str),
}

impl PathPattern {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => *p == path,
            PathPattern::Prefix(p) => path == *p || path.starts_with(&format!("{p}/")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub method: Method,
    pub pattern: PathPattern,
    pub auth: AuthRequirement,
    pub service: &'static str,
    pub upstream_path_template: &'static str,
    pub forwarding: ForwardingMode,
    pub rate_limit_class: RateLimitClass,
}

pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

pub struct RouteMatch<'a> {
    pub entry: &'a RouteEntry,
    /// The upstream path: for a prefix mount this is the upstream template
    /// with the remainder of the incoming path appended.
    pub upstream_path: String,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    /// First matching entry wins; declaration order matters.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        for entry in &self.entries {
            if &entry.method != method {
                continue;
            }
            if !entry.pattern.matches(path) {
                continue;
            }
            let upstream_path = match entry.pattern {
                PathPattern::Exact(_) => entry.upstream_path_template.to_string(),
                PathPattern::Prefix(prefix) => {
                    let remainder = path.strip_prefix(prefix).unwrap_or("");
                    format!("{}{}", entry.upstream_path_template, remainder)
                }
            };
            return Some(RouteMatch { entry, upstream_path });
        }
        None
    }

    /// The default table wiring all 9 backend services.
    pub fn default_table() -> Self {
        use AuthRequirement::*;
        use ForwardingMode::*;
        use Method as M;
        use PathPattern::*;
        use RateLimitClass::*;

        let entries = vec![
            RouteEntry {
                method: M::GET,
                pattern: Exact("/health"),
                auth: NoAuth,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Bypass,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/health"),
                auth: NoAuth,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Bypass,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/status"),
                auth: NoAuth,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Bypass,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/metrics"),
                auth: NoAuth,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/performance"),
                auth: NoAuth,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Exact("/api/v1/users/register"),
                auth: NoAuth,
                service: "user",
                upstream_path_template: "/register",
                forwarding: Passthrough,
                rate_limit_class: Strict,
            },
            RouteEntry {
                method: M::POST,
                pattern: Exact("/api/v1/users/login"),
                auth: NoAuth,
                service: "user",
                upstream_path_template: "/login",
                forwarding: Passthrough,
                rate_limit_class: Strict,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/v1/leaderboard"),
                auth: Optional,
                service: "user",
                upstream_path_template: "/leaderboard",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/users"),
                auth: Required,
                service: "user",
                upstream_path_template: "/users",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/users"),
                auth: Required,
                service: "user",
                upstream_path_template: "/users",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/ai"),
                auth: Required,
                service: "ai-scouting",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/ai"),
                auth: Required,
                service: "ai-scouting",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/v1/marketplace/opportunities"),
                auth: Required,
                service: "marketplace-monitor",
                upstream_path_template: "/opportunities",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/v1/marketplace/arbitrage"),
                auth: Required,
                service: "marketplace-monitor",
                upstream_path_template: "/arbitrage",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/marketplace/alerts"),
                auth: Required,
                service: "marketplace-monitor",
                upstream_path_template: "/alerts",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/marketplace/alerts"),
                auth: Required,
                service: "marketplace-monitor",
                upstream_path_template: "/alerts",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/marketplace"),
                auth: Optional,
                service: "marketplace-monitor",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Exact("/api/v1/trades/execute"),
                auth: Required,
                service: "trading",
                upstream_path_template: "/trades/execute",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/trades"),
                auth: Required,
                service: "trading",
                upstream_path_template: "/trades",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/trades"),
                auth: Required,
                service: "trading",
                upstream_path_template: "/trades",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/notifications"),
                auth: Required,
                service: "notification",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/notifications"),
                auth: Required,
                service: "notification",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/strategies"),
                auth: Required,
                service: "strategy",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Prefix("/api/v1/strategies"),
                auth: Required,
                service: "strategy",
                upstream_path_template: "",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Prefix("/api/v1/portfolio"),
                auth: Required,
                service: "user",
                upstream_path_template: "/portfolio",
                forwarding: Passthrough,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::GET,
                pattern: Exact("/api/v1/websocket/status"),
                auth: Required,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Standard,
            },
            RouteEntry {
                method: M::POST,
                pattern: Exact("/api/v1/websocket/test-message"),
                auth: Required,
                service: "local",
                upstream_path_template: "",
                forwarding: Local,
                rate_limit_class: Standard,
            },
        ];

        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_path_resolves_to_none() {
        let table = RouteTable::default_table();
        assert!(table.resolve(&Method::GET, "/api/v2/users").is_none());
        assert!(table.resolve(&Method::GET, "/totally/unknown").is_none());
    }

    #[test]
    fn register_and_login_require_no_auth_and_strict_class() {
        let table = RouteTable::default_table();
        let m = table.resolve(&Method::POST, "/api/v1/users/login").unwrap();
        assert_eq!(m.entry.auth, AuthRequirement::NoAuth);
        assert_eq!(m.entry.rate_limit_class, RateLimitClass::Strict);
    }

    #[test]
    fn prefix_mount_appends_remainder() {
        let table = RouteTable::default_table();
        let m = table
            .resolve(&Method::GET, "/api/v1/users/42/profile")
            .unwrap();
        assert_eq!(m.upstream_path, "/users/42/profile");
    }

    #[test]
    fn first_match_wins_for_overlapping_prefixes() {
        let table = RouteTable::default_table();
        // /api/v1/marketplace/opportunities is declared before the general
        // /api/v1/marketplace/* mount and must win.
        let m = table
            .resolve(&Method::GET, "/api/v1/marketplace/opportunities")
            .unwrap();
        assert_eq!(m.entry.upstream_path_template, "/opportunities");
        assert_eq!(m.entry.auth, AuthRequirement::Required);
    }

    #[test]
    fn trade_execute_requires_auth() {
        let table = RouteTable::default_table();
        let m = table.resolve(&Method::POST, "/api/v1/trades/execute").unwrap();
        assert_eq!(m.entry.auth, AuthRequirement::Required);
        assert_eq!(m.entry.service, "trading");
    }
}
