use crate::security::{internal_error, token_ok, unauthorized, TokenQuery};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use hearth_core::addr;
use hearth_core::timefmt;
use hearth_core::types::Lease;
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/client/{ip}", get(get_client))
        .route("/api/clients", get(get_clients))
}

/// Detail view served at /api/client/{ip}.
fn client_detail(lease: &Lease) -> Value {
    json!({
        "mac": lease.mac,
        "ip": lease.ip.map(|ip| ip.to_string()),
        "hostname": lease.hostname,
        "client_id": lease.client_id,
        "created_at": timefmt::format_api(lease.created_at),
        "updated_at": timefmt::format_api(lease.updated_at),
        "expire_at": timefmt::format_api_opt(lease.expire_at),
        "time_to_expiry": timefmt::time_to_expiry(lease.expire_at),
        "is_expired": lease.is_expired,
        "lease_type": lease.lease_type.to_string(),
        "is_blocked": lease.is_blocked,
        "is_custom_hostname": lease.is_custom_hostname,
        "trust_flag": lease.trust_flag,
        "is_cached": false,
    })
}

/// Full-row view served inside /api/clients.
fn client_row(lease: &Lease) -> Value {
    json!({
        "id": lease.id,
        "client_id": lease.client_id,
        "mac": lease.mac,
        "hostname": lease.hostname,
        "ip": lease.ip.map(|ip| ip.to_string()),
        "lease_type": lease.lease_type.to_string(),
        "expire_at": timefmt::format_api_opt(lease.expire_at),
        "time_to_expiry": timefmt::time_to_expiry(lease.expire_at),
        "is_expired": lease.is_expired,
        "updated_at": timefmt::format_api(lease.updated_at),
        "created_at": timefmt::format_api(lease.created_at),
        "create_channel": lease.create_channel.to_string(),
        "deleted_at": timefmt::format_api_opt(lease.deleted_at),
        "is_blocked": lease.is_blocked,
        "is_custom_hostname": lease.is_custom_hostname,
        "trust_flag": lease.trust_flag,
    })
}

async fn get_client(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    Query(query): Query<TokenQuery>,
) -> (StatusCode, Json<Value>) {
    if !token_ok(&state, query.token.as_deref()) {
        return unauthorized();
    }

    if let Some((mut value, status)) = state.cache.get(&ip) {
        value["is_cached"] = json!(true);
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            Json(value),
        );
    }

    let lease = match addr::parse_ipv4(&ip) {
        Ok(parsed) => match state.store.get_client_by_ip(parsed) {
            Ok(lease) => lease,
            Err(e) => return internal_error(e),
        },
        Err(_) => None,
    };

    let (value, status) = match lease {
        Some(lease) => (client_detail(&lease), StatusCode::OK),
        None => (
            json!({"error": "Client not found", "is_cached": false}),
            StatusCode::NOT_FOUND,
        ),
    };

    state.cache.insert(ip, value.clone(), status.as_u16());
    (status, Json(value))
}

async fn get_clients(
    State(state): State<AppState>,
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

    let leases = match state.store.get_all_leases(true) {
        Ok(leases) => leases,
        Err(e) => return internal_error(e),
    };
    let clients: Vec<Value> = leases.iter().map(client_row).collect();
    let value = json!({
        "clients": clients,
        "total": clients.len(),
        "is_cached": false,
    });

    state.cache.insert(CACHE_KEY.to_string(), value.clone(), 200);
    (StatusCode::OK, Json(value))
}
