//! Shared fixtures for the kernel integration tests

#![allow(dead_code)]

use bytes::Bytes;
use cms_kernel::config::Config;
use cms_kernel::plugin::{PluginEndpoint, ProcessStatus};
use cms_kernel::settings::{AUTHENTICATION_KEY, USE_TWO_FACTOR};
use cms_kernel::state::{Kernel, Stores};
use cms_kernel::store::{InMemoryStore, Permission, User};
use cms_kernel::web::{self, Pipeline};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warp::http::{HeaderMap, Method, Response};
use warp::path::FullPath;
use warp::Filter;

pub const AUTH_KEY: &str = "integration-secret";
pub const ADMIN_ID: i64 = 1;
pub const EDITOR_ID: i64 = 2;
pub const DISABLED_ID: i64 = 3;

pub fn store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.set_setting(AUTHENTICATION_KEY, AUTH_KEY);
    store.set_setting(USE_TWO_FACTOR, "false");
    store.set_permissions(vec![
        Permission {
            id: 10,
            name: "admin".into(),
        },
        Permission {
            id: 11,
            name: "content.edit".into(),
        },
    ]);
    for (id, name, enabled) in [
        (ADMIN_ID, "Ada Admin", true),
        (EDITOR_ID, "Ed Editor", true),
        (DISABLED_ID, "Gone User", false),
    ] {
        store.add_user(User {
            id,
            full_name: name.into(),
            email: format!("user{}@example.com", id),
            enabled,
        });
    }
    store.grant(ADMIN_ID, 10);
    store.grant(EDITOR_ID, 11);
    store
}

/// Lay out `<root>/<id>/manifest.json` with an entry point next to it
pub fn write_plugin(root: &Path, id: &str, manifest: serde_json::Value, script: &str) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
    let entry_point = dir.join("main");
    std::fs::write(&entry_point, script).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&entry_point, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

pub fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.plugins.root_dir = root.to_path_buf();
    config.plugins.proxy_timeout_ms = 500;
    config.plugins.shutdown_grace_ms = 500;
    config
}

pub async fn kernel(config: Config, store: Arc<InMemoryStore>) -> Arc<Kernel> {
    Kernel::bootstrap(config, Stores::shared(store))
        .await
        .expect("bootstrap failed")
}

/// An endpoint for a plugin that some test server is already serving
pub fn endpoint(plugin_id: &str, addr: SocketAddr) -> PluginEndpoint {
    PluginEndpoint {
        plugin_id: plugin_id.into(),
        name: plugin_id.into(),
        schema: "http".into(),
        host: addr.ip().to_string(),
        port: addr.port(),
        pid: None,
        status: ProcessStatus::Running,
    }
}

/// A stand-in plugin process.
///
/// `/guard` answers 403 when `x-block` is set and 204 otherwise, `/slow`
/// takes two seconds, and anything else echoes the body back with status
/// 201 and what it saw in `x-seen-*` headers.
pub async fn fake_plugin() -> SocketAddr {
    let query = warp::query::raw()
        .or(warp::any().map(String::new))
        .unify();

    let app = warp::method()
        .and(warp::path::full())
        .and(query)
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(
            |method: Method, path: FullPath, query: String, headers: HeaderMap, body: Bytes| async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                };

                let reply = if path.as_str().ends_with("/guard") {
                    if headers.contains_key("x-block") {
                        Response::builder()
                            .status(403)
                            .header("x-blocked-by", "guard")
                            .body(b"blocked by plugin".to_vec())
                    } else {
                        Response::builder().status(204).body(Vec::new())
                    }
                } else if path.as_str().ends_with("/slow") {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Response::builder().status(200).body(Vec::new())
                } else {
                    Response::builder()
                        .status(201)
                        .header("x-plugin", "fake")
                        .header("x-seen-method", method.as_str())
                        .header("x-seen-path", path.as_str())
                        .header("x-seen-query", query)
                        .header("x-seen-request-id", header("x-request-id"))
                        .header("x-seen-original-uri", header("x-original-uri"))
                        .body(body.to_vec())
                };
                reply.map_err(|_| warp::reject())
            },
        );

    let (addr, server) = warp::serve(app).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

/// A plugin that sends its status line, headers and a few body bytes, then
/// goes quiet while holding the connection open.
pub async fn stalled_plugin(status: u16) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {} Stalled\r\ncontent-length: 100\r\ncontent-type: text/plain\r\n\r\npartial",
                    status
                );
                let _ = socket.write_all(head.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

/// A local address nothing is listening on
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn filter(
    pipeline: Pipeline,
) -> impl Filter<Extract = (web::HttpResponse,), Error = warp::Rejection> + Clone {
    web::routes(Arc::new(pipeline))
}

pub fn body_json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).expect("body is not JSON")
}
