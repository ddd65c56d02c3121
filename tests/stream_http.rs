//! End-to-end tests of the HTTP surface with an in-process capture worker.

use dogcam::capture::placeholder_jpeg;
use dogcam::config::{Isolation, SensorBackend};
use dogcam::retry::RetryPolicy;
use dogcam::{App, Config};
use std::time::{Duration, Instant};

const USER: &str = "admin";
const PASS: &str = "hunter2";
const PART_HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

fn config() -> Config {
    let mut config = Config::default();
    config.server.bind = [127, 0, 0, 1].into();
    config.server.port = 0;
    config.server.username = Some(USER.into());
    config.server.password = Some(PASS.into());
    config.camera.width = 64;
    config.camera.height = 48;
    config.camera.init = RetryPolicy::fixed(1, Duration::ZERO);
    config.worker.isolation = Isolation::Thread;
    config
}

fn url(app: &App, path: &str) -> String {
    format!("http://{}{}", app.local_addr(), path)
}

async fn get(app: &App, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(url(app, path))
        .basic_auth(USER, Some(PASS))
        .send()
        .await
        .unwrap()
}

/// Splits a multipart body into JPEG parts as chunks arrive.
struct PartReader {
    response: reqwest::Response,
    buf: Vec<u8>,
}

impl PartReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buf: Vec::new(),
        }
    }

    async fn next_part(&mut self) -> Vec<u8> {
        loop {
            if let Some(part) = self.take_part() {
                return part;
            }
            let chunk = self.response.chunk().await.unwrap().expect("stream ended early");
            self.buf.extend_from_slice(&chunk);
        }
    }

    fn take_part(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < PART_HEAD.len() {
            return None;
        }
        assert!(self.buf.starts_with(PART_HEAD), "bad part header");
        let body = &self.buf[PART_HEAD.len()..];
        let end = body.windows(4).position(|w| w == b"\xFF\xD9\r\n")?;
        let jpeg = body[..end + 2].to_vec();
        self.buf.drain(..PART_HEAD.len() + end + 4);
        Some(jpeg)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_viewer_gets_jpeg_parts() {
    let app = App::start(config()).await.unwrap();

    let response = get(&app, "/stream").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut parts = PartReader::new(response);
    let first = tokio::time::timeout(Duration::from_secs(1), parts.next_part())
        .await
        .expect("first part within a second");
    assert_eq!(&first[..2], &[0xFF, 0xD8]);
    assert_eq!(&first[first.len() - 2..], &[0xFF, 0xD9]);

    drop(parts);
    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_video_feed_alias_streams() {
    let app = App::start(config()).await.unwrap();
    let response = get(&app, "/video_feed").await;
    assert_eq!(response.status(), 200);
    let mut parts = PartReader::new(response);
    let part = tokio::time::timeout(Duration::from_secs(2), parts.next_part())
        .await
        .unwrap();
    assert_eq!(&part[..2], &[0xFF, 0xD8]);
    drop(parts);
    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_viewer_limit_rejects_extra_request_immediately() {
    let mut config = config();
    config.server.max_viewers = 5;
    let app = App::start(config).await.unwrap();

    let requests = (0..5).map(|_| get(&app, "/stream"));
    let mut open = futures::future::join_all(requests).await;
    assert!(open.iter().all(|r| r.status() == 200));

    let start = Instant::now();
    let rejected = get(&app, "/stream").await;
    assert_eq!(rejected.status(), 503);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(rejected.text().await.unwrap().contains("Max viewers reached"));

    // A slot frees up once a viewer disconnects.
    drop(open.pop());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = get(&app, "/stream").await;
        if response.status() == 200 {
            break;
        }
        assert!(Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    drop(open);
    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_camera_sends_placeholders_and_stays_open() {
    let mut config = config();
    config.camera.stall_after_frames = Some(3);
    config.server.frame_timeout_ms = 500;
    let app = App::start(config).await.unwrap();
    let placeholder = placeholder_jpeg().unwrap();

    let response = get(&app, "/stream").await;
    assert_eq!(response.status(), 200);
    let mut parts = PartReader::new(response);

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < 2 {
        assert!(Instant::now() < deadline, "no placeholders during stall");
        let part = parts.next_part().await;
        if part[..] == placeholder[..] {
            seen.push(Instant::now());
        }
    }
    let gap = seen[1] - seen[0];
    assert!(gap >= Duration::from_millis(400), "placeholders {gap:?} apart");

    // Still open: another placeholder follows.
    let next = tokio::time::timeout(Duration::from_secs(2), parts.next_part())
        .await
        .unwrap();
    assert_eq!(next[..], placeholder[..]);

    drop(parts);
    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_reports_reading_after_transient_failures() {
    let mut config = config();
    config.sensor.backend = SensorBackend::Mock;
    config.sensor.mock.celsius = 23.5;
    config.sensor.mock.humidity = Some(40.0);
    config.sensor.mock.transient_failures = 2;
    config.sensor.init = RetryPolicy::fixed(1, Duration::ZERO);
    config.sensor.read = RetryPolicy::fixed(3, Duration::from_millis(20));
    config.sensor.interval_ms = 100;
    config.server.display_name = "Rex".into();
    let app = App::start(config).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let text = loop {
        let response = get(&app, "/status").await;
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        if text.contains("23.5°C") {
            break text;
        }
        assert!(Instant::now() < deadline, "no reading, last status: {text}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(text.starts_with("Rex: 23.5°C, 40% humidity"), "{text}");

    let temp = get(&app, "/temp").await.text().await.unwrap();
    assert!(temp.starts_with("Rex: "), "{temp}");

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_without_sensor_is_explicitly_unavailable() {
    let app = App::start(config()).await.unwrap();
    let response = get(&app, "/status").await;
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("temperature unavailable"));
    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_authentication_and_health() {
    let app = App::start(config()).await.unwrap();
    let client = reqwest::Client::new();

    for path in ["/", "/stream", "/status", "/metrics"] {
        let response = client.get(url(&app, path)).send().await.unwrap();
        assert_eq!(response.status(), 401, "{path}");
        assert!(response.headers().contains_key("www-authenticate"));
    }
    let wrong = client
        .get(url(&app, "/status"))
        .basic_auth(USER, Some("nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let health = client.get(url(&app, "/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "OK");

    let page = get(&app, "/").await.text().await.unwrap();
    assert!(page.contains("<img src=\"/stream\""));

    let metrics = get(&app, "/metrics").await.text().await.unwrap();
    assert!(metrics.contains("dogcam_active_viewers"));

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_credentials_are_fatal() {
    let mut config = config();
    config.server.password = None;
    assert!(matches!(App::start(config).await, Err(dogcam::Error::Config(_))));
}
