//! Bootstrap configuration - seeds the routing intent, then the manager owns it.

use serde::{Deserialize, Serialize};

/// One declared connection between two endpoints.
///
/// A list with a single name is a point; a longer list is an ordered set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub source: Vec<String>,
    pub sink: Vec<String>,

    /// Fan-out policy name (mono, dual, line, bcast, merge, trunc, default).
    #[serde(default = "RouteConfig::default_policy")]
    pub policy: String,
}

impl RouteConfig {
    fn default_policy() -> String {
        "default".to_string()
    }
}

/// Routing intent declared at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}
