//! Request-to-backend matching
//!
//! Routing is method-specific: `read_resource` requests match on the
//! `uri` parameter (prefixes across all backends first, then compiled
//! regexes), `call_tool` requests match on the exact `name`, and every
//! other method is unroutable. First match wins in configuration order.

use crate::codec::{JsonRpcRequest, METHOD_CALL_TOOL, METHOD_READ_RESOURCE};
use crate::gateway::Backend;

/// Pick the backend serving `request`, or `None` when nothing matches.
pub fn route<'a>(request: &JsonRpcRequest, backends: &'a [Backend]) -> Option<&'a Backend> {
    match request.method.as_str() {
        METHOD_READ_RESOURCE => {
            let uri = request.param_str("uri")?;
            route_resource(uri, backends)
        }
        METHOD_CALL_TOOL => {
            let name = request.param_str("name")?;
            backends
                .iter()
                .find(|b| b.rules.tool_names.iter().any(|t| t == name))
        }
        _ => None,
    }
}

/// Prefixes take precedence over regexes across the whole fleet.
fn route_resource<'a>(uri: &str, backends: &'a [Backend]) -> Option<&'a Backend> {
    for backend in backends {
        if backend
            .rules
            .uri_prefixes
            .iter()
            .any(|prefix| uri.starts_with(prefix.as_str()))
        {
            return Some(backend);
        }
    }
    for backend in backends {
        if backend.rules.uri_regexes.iter().any(|r| r.is_match(uri)) {
            return Some(backend);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn backend(
        name: &str,
        prefixes: Vec<&str>,
        regexes: Vec<&str>,
        tools: Vec<&str>,
    ) -> Backend {
        Backend::from_config(&BackendConfig {
            name: name.to_string(),
            address: "127.0.0.1:9100".to_string(),
            timeout_ms: 1000,
            resource_prefixes: prefixes.into_iter().map(String::from).collect(),
            resource_regexes: regexes.into_iter().map(String::from).collect(),
            tool_names: tools.into_iter().map(String::from).collect(),
            pool_min_connections: None,
            pool_max_connections: None,
        })
        .unwrap()
    }

    fn read_resource(uri: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(1, METHOD_READ_RESOURCE, serde_json::json!({ "uri": uri }))
    }

    fn call_tool(name: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(1, METHOD_CALL_TOOL, serde_json::json!({ "name": name }))
    }

    #[tokio::test]
    async fn test_resource_routes_by_prefix_and_tool_by_name() {
        let backends = vec![
            backend("users", vec!["example://users/"], vec![], vec![]),
            backend("tools", vec![], vec![], vec!["echo"]),
        ];

        let matched = route(&read_resource("example://users/42"), &backends).unwrap();
        assert_eq!(matched.name, "users");

        let matched = route(&call_tool("echo"), &backends).unwrap();
        assert_eq!(matched.name, "tools");

        assert!(route(&call_tool("missing"), &backends).is_none());
        assert!(route(&read_resource("other://x"), &backends).is_none());
    }

    #[tokio::test]
    async fn test_first_prefix_match_wins_in_config_order() {
        let backends = vec![
            backend("first", vec!["example://"], vec![], vec![]),
            backend("second", vec!["example://users/"], vec![], vec![]),
        ];
        let matched = route(&read_resource("example://users/42"), &backends).unwrap();
        assert_eq!(matched.name, "first");
    }

    #[tokio::test]
    async fn test_prefixes_checked_before_regexes_across_fleet() {
        let backends = vec![
            backend("rx", vec![], vec!["^example://users/.*$"], vec![]),
            backend("px", vec!["example://users/"], vec![], vec![]),
        ];
        // Backend `rx` comes first, but prefix matching runs over the
        // whole fleet before any regex is consulted.
        let matched = route(&read_resource("example://users/42"), &backends).unwrap();
        assert_eq!(matched.name, "px");
    }

    #[tokio::test]
    async fn test_regex_fallback_matches() {
        let backends = vec![backend(
            "rx",
            vec![],
            vec!["^files://[0-9]+$"],
            vec![],
        )];
        assert!(route(&read_resource("files://123"), &backends).is_some());
        assert!(route(&read_resource("files://abc"), &backends).is_none());
    }

    #[tokio::test]
    async fn test_other_methods_are_unroutable() {
        let backends = vec![backend("any", vec!["x://"], vec![], vec!["t"])];
        let request = JsonRpcRequest::new(1, "ping", serde_json::json!({}));
        assert!(route(&request, &backends).is_none());
    }

    #[tokio::test]
    async fn test_missing_params_do_not_route() {
        let backends = vec![backend("any", vec!["x://"], vec![], vec!["t"])];
        let request = JsonRpcRequest::new(1, METHOD_READ_RESOURCE, serde_json::json!({}));
        assert!(route(&request, &backends).is_none());
    }
}
