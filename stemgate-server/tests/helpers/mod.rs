//! Shared setup for router-level tests
//!
//! Each test gets its own temp root, a fixed host sampler, a manual clock for
//! the ledger and scripted audio tools.

#![allow(dead_code)]

pub mod fake_tools;

use axum::{
    body::Body,
    http::{header, Request},
    Router,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use stemgate_common::config::RootLayout;
use stemgate_common::time::from_unix_seconds;
use stemgate_common::{ManualClock, ResourceLimits};
use stemgate_server::guard::FixedSampler;
use stemgate_server::ledger::TrafficLedger;
use stemgate_server::metrics::MetricsRecorder;
use stemgate_server::storage::StorageAccountant;
use stemgate_server::{build_router, AppState};
use tempfile::TempDir;

pub use fake_tools::{FakeMode, FakeTools};

pub const MB: usize = 1024 * 1024;
const BOUNDARY: &str = "stemgate-test-boundary";

/// Running test service; the temp root lives as long as this value
pub struct TestApp {
    pub dir: TempDir,
    pub layout: RootLayout,
    pub state: AppState,
    pub router: Router,
    pub sampler: Arc<FixedSampler>,
    pub clock: Arc<ManualClock>,
    pub tools: Arc<FakeTools>,
}

impl TestApp {
    pub fn new(limits: ResourceLimits, tools: FakeTools) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let layout = RootLayout::new(dir.path().join("root"));
        layout.ensure_directories().expect("layout");

        let limits = Arc::new(limits);
        let sampler = Arc::new(FixedSampler::new(1024.0, 25.0));
        let clock = Arc::new(ManualClock::new(start_time()));
        let tools = Arc::new(tools);

        let ledger = Arc::new(TrafficLedger::open(
            layout.ledger_path(),
            limits.monthly_traffic_cap_bytes,
            clock.clone(),
        ));
        let storage = Arc::new(StorageAccountant::new(
            layout.upload_dir(),
            layout.output_dir(),
            limits.max_file_mb,
            limits.max_storage_mb,
        ));

        let state = AppState::new(
            limits,
            sampler.clone(),
            ledger,
            storage,
            Arc::new(MetricsRecorder::new(100)),
            tools.clone(),
            "spleeter:2stems",
        );
        let router = build_router(state.clone());

        Self {
            dir,
            layout,
            state,
            router,
            sampler,
            clock,
            tools,
        }
    }

    pub fn with_defaults(tools: FakeTools) -> Self {
        Self::new(ResourceLimits::default(), tools)
    }

    pub fn uploads(&self) -> Vec<String> {
        dir_entries(&self.layout.upload_dir())
    }

    pub fn outputs(&self) -> Vec<String> {
        dir_entries(&self.layout.output_dir())
    }
}

pub fn start_time() -> DateTime<Utc> {
    from_unix_seconds(1_760_000_000)
}

/// Names of the direct entries of `dir`, sorted
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Deterministic, poorly compressible audio stand-in
pub fn fake_audio(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// `POST /separate` with `contents` in the `file` field
pub fn upload_request(filename: &str, contents: &[u8]) -> Request<Body> {
    multipart_request("file", Some(filename), contents)
}

pub fn multipart_request(field: &str, filename: Option<&str>, contents: &[u8]) -> Request<Body> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };

    let mut body = Vec::with_capacity(contents.len() + 256);
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/separate")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(body: Body) -> Vec<u8> {
    body.collect()
        .await
        .expect("Should read body")
        .to_bytes()
        .to_vec()
}

/// Extract JSON body from response
pub async fn extract_json(body: Body) -> Value {
    serde_json::from_slice(&body_bytes(body).await).expect("Should parse JSON")
}
