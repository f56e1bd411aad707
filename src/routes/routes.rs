//! Defines routes for the relay.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /api/upload`            - multipart upload (`?once=`, `?ttl=`)
//!   - `PUT    /api/upload/{filename}` - raw body upload
//!
//! - **Object endpoints**
//!   - `GET    /d/{id}`                - download (consumes single-use objects)
//!   - `GET    /api/objects/{id}`      - status, read-only
//!   - `DELETE /api/objects/{id}`      - remove before expiry

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    object_handlers::{delete_object, download_object, object_status, upload_multipart, upload_raw},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Slack on top of the file limit for multipart framing and small fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router. `max_file_size` sizes the request body limit; the
/// store enforces the exact file limit itself while streaming.
pub fn routes(max_file_size: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/upload", post(upload_multipart))
        .route("/api/upload/{filename}", put(upload_raw))
        .route(
            "/api/objects/{id}",
            get(object_status).delete(delete_object),
        )
        .route("/d/{id}", get(download_object))
        .layer(DefaultBodyLimit::max(body_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::ConsumptionPolicy,
        services::{
            blob_store::TypeAllowlist,
            object_service::{ObjectService, StoreSettings},
        },
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "relay-test-boundary";

    async fn app(dir: &TempDir, policy: ConsumptionPolicy) -> Router {
        let settings = StoreSettings {
            storage_dir: dir.path().to_path_buf(),
            max_file_size: 64,
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(3600),
            policy,
            allowlist: TypeAllowlist::new([".txt", "image/*"]),
            expired_retention: Duration::from_secs(3600),
        };
        let objects = ObjectService::start(settings).await.unwrap();
        routes(64).with_state(AppState {
            objects,
            public_url: Some("https://relay.test".into()),
        })
    }

    fn multipart_upload(uri: &str, filename: &str, mime: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: {mime}\r\n\r\n{content}\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn upload_then_single_use_download() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::SingleUse).await;

        let response = app
            .clone()
            .oneshot(multipart_upload("/api/upload", "hello.txt", "text/plain", "hello relay"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = json(response).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["url"], format!("https://relay.test/d/{id}"));
        assert_eq!(created["size"], 11);
        assert_eq!(created["originalName"], "hello.txt");
        assert_eq!(created["policy"], "single-use");

        let status = app
            .clone()
            .oneshot(get(&format!("/api/objects/{id}")))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(json(status).await["exists"], true);

        let download = app.clone().oneshot(get(&format!("/d/{id}"))).await.unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        let headers = download.headers().clone();
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert!(
            headers[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("hello.txt")
        );
        let bytes = axum::body::to_bytes(download.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello relay");

        let again = app.oneshot(get(&format!("/d/{id}"))).await.unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ttl_override_and_expiry_returns_gone() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let response = app
            .clone()
            .oneshot(multipart_upload("/api/upload?ttl=1", "a.txt", "text/plain", "brief"))
            .await
            .unwrap();
        let id = json(response).await["id"].as_str().unwrap().to_string();

        let first = app.clone().oneshot(get(&format!("/d/{id}"))).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let late = app.oneshot(get(&format!("/d/{id}"))).await.unwrap();
        assert_eq!(late.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn raw_upload_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let request = Request::builder()
            .method("PUT")
            .uri("/api/upload/big.txt")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(vec![b'x'; 65]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn disallowed_type_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let response = app
            .oneshot(multipart_upload("/api/upload", "run.sh", "text/x-sh", "echo hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let malformed = app.clone().oneshot(get("/d/not-an-id")).await.unwrap();
        assert_eq!(malformed.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(malformed).await["status"], 404);

        let unknown = crate::services::id_generator::ObjectId::generate().unwrap();
        let response = app
            .oneshot(get(&format!("/api/objects/{unknown}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_then_download_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let response = app
            .clone()
            .oneshot(multipart_upload("/api/upload", "gone.txt", "text/plain", "bye"))
            .await
            .unwrap();
        let id = json(response).await["id"].as_str().unwrap().to_string();

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/objects/{id}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get(&format!("/d/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readiness_reports_disk_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::TtlOnly).await;

        let response = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["checks"]["disk"]["ok"], true);
        assert_eq!(body["objects"]["live"], 0);
    }

    /// Plain HTTP/1.1 GET over a fresh connection; returns the raw response.
    async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8(raw).unwrap()
    }

    #[tokio::test]
    async fn single_use_download_over_tcp_consumes_the_object() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ConsumptionPolicy::SingleUse).await;

        let response = app
            .clone()
            .oneshot(multipart_upload("/api/upload", "wire.txt", "text/plain", "over the wire"))
            .await
            .unwrap();
        let id = json(response).await["id"].as_str().unwrap().to_string();
        let blob_path = dir.path().join(&id);
        assert!(blob_path.exists());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let first = http_get(addr, &format!("/d/{id}")).await;
        assert!(first.starts_with("HTTP/1.1 200"), "{first}");
        assert!(first.ends_with("\r\n\r\nover the wire"), "{first}");

        let second = http_get(addr, &format!("/d/{id}")).await;
        assert!(second.starts_with("HTTP/1.1 404"), "{second}");

        let mut removed = false;
        for _ in 0..50 {
            if !blob_path.exists() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);

        server.abort();
    }
}
