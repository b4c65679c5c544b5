use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use parking_monitor::MonitorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PARKING_MONITOR_CONFIG",
        "BACKEND_API_URL",
        "UPDATE_INTERVAL",
        "MAX_WORKERS",
        "HOST",
        "PORT",
        "DEBUG",
        "SAVE_DEBUG_IMAGES",
        "DEBUG_IMAGE_DIR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let debug_dir = file.path().with_extension("frames");
    let json = format!(
        r#"{{
            "api": {{ "host": "127.0.0.1", "port": 9001 }},
            "backend": {{ "api_url": "http://backend.local/api", "timeout_secs": 3 }},
            "reporter": {{ "max_workers": 2 }},
            "worker": {{ "update_interval_secs": 20, "window_size": 7 }},
            "processing": {{ "empty_threshold": 1100 }},
            "debug_image_dir": "{}"
        }}"#,
        debug_dir.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("PARKING_MONITOR_CONFIG", file.path());
    std::env::set_var("BACKEND_API_URL", "http://override.local:8000/api");
    std::env::set_var("UPDATE_INTERVAL", "30");
    std::env::set_var("MAX_WORKERS", "6");
    std::env::set_var("SAVE_DEBUG_IMAGES", "true");

    let cfg = MonitorConfig::load().expect("load config");

    assert_eq!(cfg.api_addr(), "127.0.0.1:9001");
    assert_eq!(cfg.backend.api_url, "http://override.local:8000/api");
    assert_eq!(cfg.backend.timeout, Duration::from_secs(3));
    assert_eq!(cfg.reporter.max_workers, 6);
    assert_eq!(cfg.reporter.queue_depth, 6);
    assert_eq!(cfg.worker.update_interval, Duration::from_secs(30));
    assert_eq!(cfg.worker.window_size, 7);
    assert_eq!(cfg.processing.empty_threshold, 1100);
    assert_eq!(cfg.worker.debug_image_dir.as_deref(), Some(debug_dir.as_path()));

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr(), "0.0.0.0:8001");
    assert_eq!(cfg.backend.api_url, "http://localhost:8000/api");
    assert_eq!(cfg.worker.update_interval, Duration::from_secs(15));
    assert!(cfg.worker.debug_image_dir.is_none());
}

#[test]
fn rejects_bad_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("UPDATE_INTERVAL", "soon");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("UPDATE_INTERVAL", "0");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("BACKEND_API_URL", "not a url");
    assert!(MonitorConfig::load().is_err());
    clear_env();

    std::env::set_var("PARKING_MONITOR_CONFIG", "/nonexistent/parking-monitor.json");
    assert!(MonitorConfig::load().is_err());
    clear_env();
}
