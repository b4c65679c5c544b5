use anyhow::Result;
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_monitor::api::{ApiConfig, ApiHandle, ApiServer, ServiceContext};
use parking_monitor::detect::encode_jpeg;
use parking_monitor::{DefaultOpener, MemorySink, MonitorConfig};

struct TestApi {
    ctx: ServiceContext,
    sink: Arc<MemorySink>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_body_limit(16 * 1024 * 1024)
    }

    fn with_body_limit(max_body_bytes: usize) -> Result<Self> {
        let mut config = MonitorConfig::default();
        config.worker.update_interval = Duration::from_millis(100);
        config.worker.connect_attempts = 1;
        config.worker.frame_pause = Duration::from_millis(5);
        let sink = Arc::new(MemorySink::new());
        let ctx = ServiceContext::new(&config, sink.clone(), Arc::new(DefaultOpener))?;

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_body_bytes,
        };
        let api_handle = ApiServer::new(api_config, ctx.clone()).spawn()?;
        Ok(Self {
            ctx,
            sink,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, method: &str, path: &str, content_type: &str, body: &[u8]) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let head = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<(String, String)> {
        self.send("GET", path, "text/plain", b"")
    }

    fn post_json(&self, path: &str, body: &str) -> Result<(String, String)> {
        self.send("POST", path, "application/json", body.as_bytes())
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        self.ctx.shutdown();
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn lot_body(lot_id: i64, url: &str) -> String {
    format!(
        r#"{{
            "lot_id": {lot_id},
            "name": "Lot {lot_id}",
            "location": "Test campus",
            "video_feed_url": "{url}",
            "parking_spots": [{{"id": 1, "x": 10, "y": 10}}, {{"id": 2, "x": 130, "y": 10}}]
        }}"#
    )
}

fn multipart(lot_id: &str, image: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"--BOUNDARY\r\nContent-Disposition: form-data; name=\"lot_id\"\r\n\r\n");
    body.extend_from_slice(lot_id.as_bytes());
    body.extend_from_slice(b"\r\n");
    if let Some(image) = image {
        body.extend_from_slice(
            b"--BOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"lot.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
        );
        body.extend_from_slice(image);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"--BOUNDARY--\r\n");
    body
}

/// A 250x80 lot: a striped car in bay 1, bare asphalt in bay 2.
fn lot_snapshot() -> Vec<u8> {
    let mut img = RgbImage::from_pixel(250, 80, Rgb([120, 120, 120]));
    for y in 10..53 {
        let v = if ((y - 10) / 4) % 2 == 0 { 30 } else { 220 };
        for x in 10..113 {
            img.put_pixel(x, y, Rgb([v, v, v]));
        }
    }
    encode_jpeg(&img).expect("encode snapshot")
}

#[test]
fn root_reports_version() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.get("/")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[test]
fn configure_status_and_stop_round_trip() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.post_json(
        "/config/parking-lot",
        &lot_body(7, "stub://north?width=250&height=130"),
    )?;
    assert!(headers.contains("200 OK"), "{headers}\n{body}");
    let configured: Value = serde_json::from_str(&body)?;
    assert_eq!(configured["lot_id"], 7);
    assert_eq!(configured["status"], "processing");
    assert!(configured["generation"].as_u64().is_some());

    let (headers, body) = api.get("/status")?;
    assert!(headers.contains("200 OK"));
    let status: Value = serde_json::from_str(&body)?;
    assert_eq!(status["active_jobs"], 1);
    let job = &status["job_details"][0];
    assert_eq!(job["lot_id"], 7);
    assert_eq!(job["lot_name"], "Lot 7");
    assert_eq!(job["spots_count"], 2);
    assert_eq!(job["thread_alive"], true);

    let (headers, body) = api.send("DELETE", "/config/parking-lot/7", "text/plain", b"")?;
    assert!(headers.contains("200 OK"));
    let stopped: Value = serde_json::from_str(&body)?;
    assert_eq!(stopped["video_url"], "stub://north?width=250&height=130");
    assert!(stopped["stopped_at"].is_string());

    let (headers, body) = api.send("DELETE", "/config/parking-lot/7", "text/plain", b"")?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains("detail"));
    Ok(())
}

#[test]
fn configured_lot_reports_to_sink() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.post_json(
        "/config/parking-lot",
        &lot_body(3, "stub://south?width=250&height=130"),
    )?;
    assert!(headers.contains("200 OK"));

    let deadline = Instant::now() + Duration::from_secs(10);
    while api.sink.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    let batches = api.sink.batches_for(3);
    assert!(!batches.is_empty());
    assert_eq!(batches[0].detections.len(), 2);
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, _) = api.post_json("/config/parking-lot", "{not json")?;
    assert!(headers.contains("400 Bad Request"));

    let no_spots = r#"{"lot_id": 1, "name": "Empty", "video_feed_url": "stub://x", "parking_spots": []}"#;
    let (headers, body) = api.post_json("/config/parking-lot", no_spots)?;
    assert!(headers.contains("422"), "{headers}");
    assert!(body.contains("parking_spots"));

    let missing_field = r#"{"lot_id": 1, "name": "No feed", "parking_spots": []}"#;
    let (headers, _) = api.post_json("/config/parking-lot", missing_field)?;
    assert!(headers.contains("422"));

    let (headers, _) = api.send("DELETE", "/config/parking-lot/abc", "text/plain", b"")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.get("/nope")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/config/parking-lot")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.post_json("/status", "{}")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn health_reports_dispatcher_pool() -> Result<()> {
    let api = TestApi::new()?;
    // backend status is filled in by the background probe
    let deadline = Instant::now() + Duration::from_secs(10);
    let health = loop {
        let (headers, body) = api.get("/health")?;
        assert!(headers.contains("200 OK"));
        let health: Value = serde_json::from_str(&body)?;
        if health["backend_connection"]["status"] != "unknown" || Instant::now() >= deadline {
            break health;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["workers"]["max_workers"], 4);
    assert_eq!(health["backend_connection"]["status"], "connected");
    assert!(health["system"]["worker_threads"].as_u64().unwrap_or(0) >= 4);
    Ok(())
}

#[test]
fn single_image_classifies_uploaded_snapshot() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.post_json(
        "/config/parking-lot",
        &lot_body(9, "stub://east?width=250&height=130"),
    )?;
    assert!(headers.contains("200 OK"));

    let body = multipart("9", Some(&lot_snapshot()));
    let (headers, body) = api.send(
        "POST",
        "/test/single-image",
        "multipart/form-data; boundary=BOUNDARY",
        &body,
    )?;
    assert!(headers.contains("200 OK"), "{headers}\n{body}");
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["lot_id"], 9);
    let detections = value["detections"].as_array().expect("detections");
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0]["spot_id"], 1);
    assert_eq!(detections[0]["is_occupied"], true);
    assert_eq!(detections[1]["is_occupied"], false);
    assert!(detections[0]["license_plate"].is_null());
    assert!(value["annotated_image"]
        .as_str()
        .expect("image")
        .starts_with("data:image/jpeg;base64,"));
    Ok(())
}

#[test]
fn single_image_error_cases() -> Result<()> {
    let api = TestApi::new()?;
    let content_type = "multipart/form-data; boundary=BOUNDARY";

    let (headers, _) = api.send("POST", "/test/single-image", content_type, &multipart("5", Some(&lot_snapshot())))?;
    assert!(headers.contains("404 Not Found"));

    api.post_json("/config/parking-lot", &lot_body(5, "stub://west?width=250&height=130"))?;
    let (headers, _) = api.send("POST", "/test/single-image", content_type, &multipart("5", None))?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _) = api.send(
        "POST",
        "/test/single-image",
        content_type,
        &multipart("5", Some(b"definitely not an image")),
    )?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn oversize_request_is_rejected() -> Result<()> {
    let api = TestApi::with_body_limit(1024)?;
    let mut stream = TcpStream::connect(api.handle().addr)?;
    let head = "POST /test/single-image HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1000000\r\n\r\n";
    stream.write_all(head.as_bytes())?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("413"));
    Ok(())
}
