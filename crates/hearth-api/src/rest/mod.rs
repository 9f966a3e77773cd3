pub mod clients;
pub mod health;

use crate::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new().merge(clients::router()).merge(health::router())
}

#[cfg(test)]
mod tests {
    use crate::ApiServer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hearth_core::types::{ChangeChannel, CreateChannel, LeaseType};
    use hearth_msg::noop::NoopNotifier;
    use hearth_store::{HistoryLog, LeaseStore, StoreOptions};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const TOKEN: &str = "sekrit";

    fn test_server() -> (axum::Router, LeaseStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let history = HistoryLog::open(&dir.path().join("history.redb")).unwrap();
        let store = LeaseStore::open(
            &dir.path().join("leases.redb"),
            history,
            Arc::new(NoopNotifier),
            StoreOptions {
                lease_time_secs: 3600,
                inactive_period: chrono::Duration::days(7),
            },
        )
        .unwrap();

        let server = ApiServer::new(
            "127.0.0.1:0".parse().unwrap(),
            store.clone(),
            TOKEN.to_string(),
            Duration::from_secs(10),
        );
        (server.router(), store, dir)
    }

    async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
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

    fn seed_lease(store: &LeaseStore, mac: &str, ip: &str, hostname: &str) {
        store
            .create_lease(
                mac,
                ip.parse().unwrap(),
                Some(hostname),
                LeaseType::Dynamic,
                None,
                CreateChannel::DhcpRequest,
                ChangeChannel::Dhcp,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_is_required() {
        let (app, _store, _dir) = test_server();

        let (status, body) = get_json(&app, "/api/clients").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let (status, _) = get_json(&app, "/api/client/10.0.0.1?token=wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Health stays open
        let (status, body) = get_json(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_client_lookup() {
        let (app, store, _dir) = test_server();
        seed_lease(&store, "aa:bb:cc:dd:ee:01", "192.168.1.100", "laptop");

        let (status, body) =
            get_json(&app, &format!("/api/client/192.168.1.100?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mac"], "aa:bb:cc:dd:ee:01");
        assert_eq!(body["hostname"], "laptop");
        assert_eq!(body["lease_type"], "DYNAMIC");
        assert_eq!(body["is_cached"], false);
        assert_eq!(body["is_blocked"], false);
        assert!(body["expire_at"].is_string());
        assert!(body["time_to_expiry"].is_string());

        // Second read is served from the response cache
        let (status, body) =
            get_json(&app, &format!("/api/client/192.168.1.100?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_cached"], true);
    }

    #[tokio::test]
    async fn test_client_not_found() {
        let (app, _store, _dir) = test_server();

        let (status, body) =
            get_json(&app, &format!("/api/client/10.9.9.9?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Client not found");

        // Negative result is cached as well
        let (status, body) =
            get_json(&app, &format!("/api/client/10.9.9.9?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["is_cached"], true);
    }

    #[tokio::test]
    async fn test_clients_listing_excludes_expired() {
        let (app, store, _dir) = test_server();
        seed_lease(&store, "aa:bb:cc:dd:ee:01", "192.168.1.100", "one");
        seed_lease(&store, "aa:bb:cc:dd:ee:02", "192.168.1.101", "two");
        store
            .mark_lease_expired("aa:bb:cc:dd:ee:02", "192.168.1.101".parse().unwrap())
            .unwrap();

        let (status, body) = get_json(&app, &format!("/api/clients?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["is_cached"], false);
        let clients = body["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["mac"], "aa:bb:cc:dd:ee:01");
        assert!(clients[0]["id"].is_number());
        assert_eq!(clients[0]["create_channel"], "DHCP_REQUEST");

        let (_, body) = get_json(&app, &format!("/api/clients?token={TOKEN}")).await;
        assert_eq!(body["is_cached"], true);
    }
}
