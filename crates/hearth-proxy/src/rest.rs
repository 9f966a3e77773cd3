use crate::config::{MergePolicy, ProxyConfig};
use crate::merge::merge_clients;
use crate::upstream::{fetch_json, route_for, Upstream};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use hearth_api::cache::ApiCache;
use hearth_api::security::TokenQuery;
use hearth_core::error::{Error, Result};
use hearth_core::timefmt;
use serde_json::{json, Map, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Cap on upstream health probes, independent of the data-path timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ProxyState {
    upstreams: Arc<Vec<Upstream>>,
    client: reqwest::Client,
    cache: Arc<ApiCache>,
    api_token: Arc<String>,
    policy: MergePolicy,
    timeout: Duration,
}

pub fn router(config: &ProxyConfig) -> Result<Router> {
    let upstreams = config
        .upstreams
        .iter()
        .map(Upstream::from_config)
        .collect::<Result<Vec<_>>>()?;

    let state = ProxyState {
        upstreams: Arc::new(upstreams),
        client: reqwest::Client::new(),
        cache: Arc::new(ApiCache::new(Duration::from_secs(config.proxy_cache_ttl))),
        api_token: Arc::new(config.api_token.clone()),
        policy: config.duplicate_mac_policy,
        timeout: Duration::from_secs(config.dhcp_timeout_seconds),
    };

    Ok(Router::new()
        .route("/api/client/{ip}", get(get_client))
        .route("/api/clients", get(get_clients))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn token_ok(state: &ProxyState, provided: Option<&str>) -> bool {
    !state.api_token.is_empty() && provided == Some(state.api_token.as_str())
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})))
}

async fn get_client(
    State(state): State<ProxyState>,
    Path(ip): Path<String>,
    Query(query): Query<TokenQuery>,
) -> (StatusCode, Json<Value>) {
    if !token_ok(&state, query.token.as_deref()) {
        return unauthorized();
    }

    let routed = ip
        .parse::<Ipv4Addr>()
        .ok()
        .and_then(|p| route_for(&state.upstreams, p).cloned().map(|u| (u, p)));
    let (upstream, parsed) = match routed {
        Some(pair) => pair,
        None => {
            warn!(%ip, "no upstream covers the requested address");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "No DHCP server responsible for this IP subnet"})),
            );
        }
    };

    if let Some((mut value, status)) = state.cache.get(&ip) {
        value["is_cached"] = json!(true);
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            Json(value),
        );
    }

    match fetch_json(
        &state.client,
        &upstream.client_url(parsed),
        &upstream.addr,
        state.timeout,
    )
    .await
    {
        Ok((status, mut value)) => {
            // The node's own cache flag moves aside for the proxy's
            let dhcp_cached = value
                .get("is_cached")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            value["is_dhcp_cached"] = json!(dhcp_cached);
            value["is_cached"] = json!(false);
            value["is_proxy"] = json!(true);
            value["source_server"] = json!(upstream.addr);

            state.cache.insert(ip, value.clone(), status);
            (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                Json(value),
            )
        }
        Err(Error::UpstreamTimeout(which)) => {
            warn!(upstream = %which, "upstream timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({"error": format!("upstream {which} timed out"), "is_proxy": true})),
            )
        }
        Err(e) => {
            warn!("upstream error: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "is_proxy": true})),
            )
        }
    }
}

async fn get_clients(
    State(state): State<ProxyState>,
    Query(query): Query<TokenQuery>,
) -> (StatusCode, Json<Value>) {
    if !token_ok(&state, query.token.as_deref()) {
        return unauthorized();
    }

    const CACHE_KEY: &str = "all_clients";
    if let Some((mut value, _)) = state.cache.get(CACHE_KEY) {
        value["is_cached"] = json!(true);
        return (StatusCode::OK, Json(value));
    }

    let fetches = state.upstreams.iter().map(|upstream| {
        let client = state.client.clone();
        let timeout = state.timeout;
        async move {
            let result =
                fetch_json(&client, &upstream.clients_url(), &upstream.addr, timeout).await;
            (upstream, result)
        }
    });
    let results = futures::future::join_all(fetches).await;

    let mut lists = Vec::new();
    let mut dhcp_cached = Vec::new();
    let mut errors = Map::new();
    for (upstream, result) in results {
        match result {
            Ok((200, value)) => {
                dhcp_cached.push(
                    value
                        .get("is_cached")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                );
                lists.push(
                    value
                        .get("clients")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            Ok((status, _)) => {
                dhcp_cached.push(false);
                warn!(upstream = %upstream.name, status, "upstream refused listing");
                errors.insert(upstream.name.clone(), json!(format!("http status {status}")));
            }
            Err(e) => {
                dhcp_cached.push(false);
                warn!(upstream = %upstream.name, "upstream listing failed: {e}");
                errors.insert(upstream.name.clone(), json!(e.to_string()));
            }
        }
    }

    let merged = merge_clients(state.policy, lists);
    let value = json!({
        "clients": merged,
        "total": merged.len(),
        "is_cached": false,
        "is_proxy": true,
        "is_dhcp_cached": dhcp_cached,
        "duplicate_mac_policy": state.policy.to_string(),
        "generated_at": timefmt::format_api(Utc::now()),
        "errors": if errors.is_empty() { Value::Null } else { Value::Object(errors) },
    });

    state.cache.insert(CACHE_KEY.to_string(), value.clone(), 200);
    (StatusCode::OK, Json(value))
}

async fn health(State(state): State<ProxyState>) -> Json<Value> {
    let checks = state.upstreams.iter().map(|upstream| {
        let client = state.client.clone();
        async move {
            let result = fetch_json(
                &client,
                &upstream.health_url(),
                &upstream.addr,
                HEALTH_TIMEOUT,
            )
            .await;
            (upstream, result)
        }
    });
    let results = futures::future::join_all(checks).await;

    let mut upstreams = Map::new();
    let mut any_ok = false;
    for (upstream, result) in results {
        match result {
            Ok((200, _)) => {
                any_ok = true;
                upstreams.insert(upstream.name.clone(), json!("ok"));
            }
            Ok((status, _)) => {
                upstreams.insert(upstream.name.clone(), json!(format!("http status {status}")));
            }
            Err(e) => {
                upstreams.insert(upstream.name.clone(), json!(e.to_string()));
            }
        }
    }

    Json(json!({
        "status": if any_ok { "ok" } else { "degraded" },
        "upstreams": upstreams,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            listen: "0.0.0.0:8090".to_string(),
            api_token: "proxy-token".to_string(),
            duplicate_mac_policy: MergePolicy::PreferIp,
            dhcp_timeout_seconds: 1,
            proxy_cache_ttl: 10,
            upstreams: vec![
                UpstreamConfig {
                    name: "a".to_string(),
                    addr: "192.168.1.10:8080".to_string(),
                    token: "t1".to_string(),
                },
                UpstreamConfig {
                    name: "b".to_string(),
                    addr: "192.168.2.10:8080".to_string(),
                    token: "t2".to_string(),
                },
            ],
            logging: Default::default(),
        }
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_token_is_required() {
        let app = router(&test_config()).unwrap();
        let (status, body) = get_json(&app, "/api/clients").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_unknown_subnet_is_a_400() {
        // An address outside every upstream subnet never fans out
        let app = router(&test_config()).unwrap();

        let (status, body) = get_json(&app, "/api/client/10.0.0.1?token=proxy-token").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No DHCP server responsible for this IP subnet");

        let (status, _) = get_json(&app, "/api/client/not-an-ip?token=proxy-token").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
