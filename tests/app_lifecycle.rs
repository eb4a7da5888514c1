//! End-to-end lifecycle tests: boot, serve, hot reload, shutdown.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use appboot::app::{App, HttpStarter, LoggerStarter, SchedulerStarter};
use appboot::config::ConfigManager;
use appboot::metrics::Metrics;
use appboot::resource::http::HttpBuilder;
use appboot::resource::logsink::{FilterHandle, LogSinkBuilder};
use appboot::resource::scheduler::SchedulerBuilder;
use appboot::resource::HotSwap;

type FilterLayer =
    tracing_subscriber::reload::Layer<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

// The layer must stay alive for filter reloads to land.
fn detached_filter() -> (FilterLayer, FilterHandle) {
    tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"))
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file.flush().unwrap();
    file
}

async fn probe_health(addr: std::net::SocketAddr) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn boot_serve_reload_and_shutdown() {
    let file = write_config(
        "logger:\n  level: info\nhttp:\n  addr: 127.0.0.1\n  port: 0\nscheduler:\n  jobs:\n    - name: heartbeat\n      interval_secs: 60\n",
    );

    let metrics = Arc::new(Metrics::new().unwrap());
    let config = ConfigManager::new(file.path(), Arc::clone(&metrics));
    config.load(None).await.unwrap();

    let (_filter_layer, filter_handle) = detached_filter();
    let logsink = HotSwap::new(LogSinkBuilder::new(filter_handle), Arc::clone(&metrics));
    let http = HotSwap::new(HttpBuilder::new(Arc::clone(&metrics)), Arc::clone(&metrics));
    let scheduler = HotSwap::new(
        SchedulerBuilder::new().with_job("heartbeat", || async {}),
        Arc::clone(&metrics),
    );

    let app = App::new(config.clone())
        .with_starter(Box::new(LoggerStarter::new(Arc::clone(&logsink))))
        .with_starter(Box::new(HttpStarter::new(Arc::clone(&http))))
        .with_starter(Box::new(SchedulerStarter::new(Arc::clone(&scheduler))));

    app.boot().await.unwrap();

    // The listener answers health probes once started.
    let addr = http.get().await.unwrap().local_addr();
    let response = probe_health(addr).await;
    assert!(response.contains("200"));

    // The scheduler resolved its configured job.
    assert_eq!(scheduler.get().await.unwrap().job_count(), 1);

    // A file rewrite plus reload propagates to all subscribers; the log
    // filter picks up the new level.
    std::fs::write(
        file.path(),
        "logger:\n  level: debug\nhttp:\n  addr: 127.0.0.1\n  port: 0\nscheduler:\n  jobs:\n    - name: heartbeat\n      interval_secs: 60\n",
    )
    .unwrap();
    config.reload_local().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(logsink.get().await.unwrap().level(), "debug");

    // The listener still serves; its options did not change, so the
    // instance was not rebuilt.
    let same_addr = http.get().await.unwrap().local_addr();
    assert_eq!(addr, same_addr);

    app.shutdown().await;

    // After shutdown the resources are closed.
    assert!(http.get().await.is_err());
    assert!(scheduler.get().await.is_err());
}

#[tokio::test]
async fn metrics_endpoint_reports_reload_counters() {
    let file = write_config("http:\n  addr: 127.0.0.1\n  port: 0\n");

    let metrics = Arc::new(Metrics::new().unwrap());
    let config = ConfigManager::new(file.path(), Arc::clone(&metrics));
    config.load(None).await.unwrap();

    let http = HotSwap::new(HttpBuilder::new(Arc::clone(&metrics)), Arc::clone(&metrics));
    let tree = config.snapshot().await;
    http.apply(&tree).await.unwrap();
    http.start().await.unwrap();

    config.reload_local().await;

    let addr = http.get().await.unwrap().local_addr();
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.contains("config_reloads_total"));
    assert!(response.contains("resource_swaps_total"));

    http.close().await;
}
