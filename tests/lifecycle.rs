//! Proxy lifecycle driven by a watched target list

use std::sync::Arc;
use std::time::Duration;

use meshgate::manager::{ManagerSettings, ProxyManager};
use meshgate::model::{ProxyEvent, ProxyStatus};
use meshgate::providers::{LocalProvider, LocalSettings};
use meshgate::targets::{ListProvider, ListSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Reserve a free port by binding and dropping a listener
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait until something accepts on the port
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Wait until nothing accepts on the port
async fn wait_for_port_closed(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn http_get(port: u16, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

async fn start_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

fn target_list(port: u16, upstream: u16) -> String {
    format!(
        r#"
[targets.web]
hostname = "web"

[[targets.web.ports]]
proxy_port = {}
proxy_protocol = "http"
targets = ["http://127.0.0.1:{}"]
"#,
        port, upstream
    )
}

async fn wait_for_status(rx: &mut mpsc::Receiver<ProxyEvent>, status: ProxyStatus) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            if event.id == "web" && event.status == status {
                return;
            }
        }
        panic!("status channel closed before {}", status);
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", status);
}

fn manager_for(path: &std::path::Path) -> Arc<ProxyManager> {
    let manager = ProxyManager::new(ManagerSettings {
        default_proxy_provider: "local".to_string(),
        ..ManagerSettings::default()
    });
    manager.add_proxy_provider(
        "local",
        Arc::new(LocalProvider::new(LocalSettings {
            bind: "127.0.0.1".parse().unwrap(),
            shutdown_timeout: Duration::from_secs(2),
            ..LocalSettings::default()
        })),
    );
    manager.add_target_provider(Arc::new(ListProvider::new(
        "list",
        ListSettings {
            path: path.to_path_buf(),
            default_proxy_provider: "local".to_string(),
            poll_interval: Duration::from_millis(50),
        },
    )));
    manager
}

#[tokio::test]
async fn test_target_list_drives_proxy_lifecycle() {
    let upstream = start_upstream().await;
    let port = free_port().await;

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), target_list(port, upstream)).unwrap();

    let manager = manager_for(file.path());
    manager.start().await.unwrap();
    let (_id, mut status) = manager.subscribe_status_events();
    manager.watch_events();

    wait_for_status(&mut status, ProxyStatus::Running).await;
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "proxy port never opened");

    let response = http_get(port, "/health").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.ends_with("ok"));
    assert!(manager.get_proxy("WEB").is_some());

    // Dropping the target stops the proxy and frees its port
    std::fs::write(file.path(), "").unwrap();
    wait_for_status(&mut status, ProxyStatus::Stopped).await;
    assert!(wait_for_port_closed(port, Duration::from_secs(5)).await, "proxy port still open");
    assert!(manager.get_proxies().is_empty());

    manager.stop_all_proxies().await;
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let upstream = free_port().await;
    let port = free_port().await;

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), target_list(port, upstream)).unwrap();

    let manager = manager_for(file.path());
    manager.start().await.unwrap();
    manager.watch_events();

    assert!(wait_for_port(port, Duration::from_secs(5)).await, "proxy port never opened");
    let response = http_get(port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {}", response);

    manager.stop_all_proxies().await;
    assert!(wait_for_port_closed(port, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_stop_all_closes_running_proxies() {
    let upstream = start_upstream().await;
    let port = free_port().await;

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), target_list(port, upstream)).unwrap();

    let manager = manager_for(file.path());
    manager.start().await.unwrap();
    let (id, mut status) = manager.subscribe_status_events();
    manager.watch_events();

    wait_for_status(&mut status, ProxyStatus::Running).await;
    manager.stop_all_proxies().await;
    wait_for_status(&mut status, ProxyStatus::Stopped).await;

    manager.unsubscribe_status_events(id);
    assert!(manager.get_proxies().is_empty());
    assert!(wait_for_port_closed(port, Duration::from_secs(5)).await);
}
