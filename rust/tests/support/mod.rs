#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use cove_core::{App, InMemoryBus};
use cove_media::LoopbackFabric;
use tempfile::TempDir;

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub struct TestClient {
    pub app: Arc<App>,
    _data_dir: TempDir,
}

/// One client on the shared bus/fabric pair. Short reconnect and stats
/// windows keep the timing-sensitive tests fast.
pub fn spawn_client(bus: &InMemoryBus, fabric: &LoopbackFabric, name: &str) -> TestClient {
    let data_dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "display_name": name,
        "stats_interval_ms": 100,
        "reconnect_timeout_secs": 2,
    });
    std::fs::write(
        data_dir.path().join("cove_config.json"),
        serde_json::to_vec(&config).unwrap(),
    )
    .unwrap();

    let app = App::new(
        data_dir.path().to_string_lossy().into_owned(),
        Arc::new(bus.clone()),
        Arc::new(fabric.connector(name)),
    );
    wait_until("client boots", Duration::from_secs(5), || {
        !app.state().participant_id.is_empty()
    });
    TestClient {
        app,
        _data_dir: data_dir,
    }
}
