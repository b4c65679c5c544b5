//! HTTP control API.
//!
//! A single thread accepts connections on a non-blocking listener and serves one
//! request per connection:
//!
//! - `GET /`
//! - `POST /config/parking-lot`
//! - `DELETE /config/parking-lot/{lot_id}`
//! - `GET /status`
//! - `GET /health`
//! - `POST /test/single-image`
//!
//! Errors use the `{"detail": "..."}` body shape.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Serialize;
use serde_json::json;

use crate::config::MonitorConfig;
use crate::detect::{annotate, encode_jpeg, FramePipeline, Stabilizer};
use crate::frame::Frame;
use crate::health::{HealthReport, SinkMonitor};
use crate::ingest::SourceOpener;
use crate::lot::{ConfigError, LotConfigRequest};
use crate::registry::{JobFailure, JobRegistry, JobSummary};
use crate::reporter::Reporter;
use crate::transport::ReportSink;
use crate::worker::WorkerContext;
use crate::{LotId, SpotDetection};

mod http;
mod multipart;

use http::{read_request, write_response, HttpRequest, RequestError, Response};

const LOT_CONFIG_PATH: &str = "/config/parking-lot";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl ApiConfig {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            addr: config.api_addr(),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ServiceContext {
    pub registry: JobRegistry,
    pub reporter: Arc<Reporter>,
    pub backend: Arc<SinkMonitor>,
}

impl ServiceContext {
    /// Wire the reporter, registry and backend monitor for `config`.
    pub fn new(
        config: &MonitorConfig,
        sink: Arc<dyn ReportSink>,
        opener: Arc<dyn SourceOpener>,
    ) -> Result<Self> {
        let reporter = Arc::new(Reporter::start(Arc::clone(&sink), config.reporter)?);
        let backend = Arc::new(SinkMonitor::start(sink, config.backend.probe_interval)?);
        let registry = JobRegistry::new(WorkerContext {
            opener,
            reporter: Arc::clone(&reporter),
            pipeline: FramePipeline::new(config.processing.clone()),
            settings: config.worker.clone(),
        });
        Ok(Self {
            registry,
            reporter,
            backend,
        })
    }

    /// Stop every lot worker, drain and join the reporter, stop probing.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.reporter.shutdown();
        self.backend.shutdown();
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    ctx: ServiceContext,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, ctx: ServiceContext) -> Self {
        Self { cfg, ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind api listener {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, self.cfg, self.ctx, shutdown_thread) {
                    log::error!("api server stopped: {}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    ctx: ServiceContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg, &ctx) {
                    log::warn!("api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, ctx: &ServiceContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(http::READ_TIMEOUT))?;
    let response = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => {
            let response = route(ctx, &request);
            log::debug!("{} {} -> {}", request.method, request.path, response.status);
            response
        }
        Err(RequestError::TooLarge) => Response::detail(413, "request body too large"),
        Err(RequestError::Malformed(reason)) => Response::detail(400, reason),
        Err(RequestError::Io(err)) => return Err(err.into()),
    };
    write_response(&mut stream, &response)
}

/// Dispatch one parsed request.
fn route(ctx: &ServiceContext, request: &HttpRequest) -> Response {
    let method = request.method.as_str();
    let path = request.path.trim_end_matches('/');
    match path {
        "" => match method {
            "GET" => root(),
            _ => method_not_allowed(),
        },
        LOT_CONFIG_PATH => match method {
            "POST" => configure_lot(ctx, &request.body),
            _ => method_not_allowed(),
        },
        "/status" => match method {
            "GET" => status(ctx),
            _ => method_not_allowed(),
        },
        "/health" => match method {
            "GET" => Response::json(
                200,
                &HealthReport::collect(&ctx.registry, &ctx.reporter, ctx.backend.latest()),
            ),
            _ => method_not_allowed(),
        },
        "/test/single-image" => match method {
            "POST" => single_image(ctx, request),
            _ => method_not_allowed(),
        },
        _ => match path
            .strip_prefix(LOT_CONFIG_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(raw_id) if !raw_id.contains('/') => match method {
                "DELETE" => stop_lot(ctx, raw_id),
                _ => method_not_allowed(),
            },
            _ => Response::detail(404, "Not Found"),
        },
    }
}

fn method_not_allowed() -> Response {
    Response::detail(405, "Method Not Allowed")
}

fn root() -> Response {
    Response::json(
        200,
        &json!({
            "message": "Welcome to the Parking Occupancy Monitor",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

fn configure_lot(ctx: &ServiceContext, body: &[u8]) -> Response {
    let request: LotConfigRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) if err.is_data() => return Response::detail(422, err),
        Err(err) => return Response::detail(400, format!("invalid JSON body: {}", err)),
    };
    let config = match request.validate() {
        Ok(config) => config,
        Err(err) => return Response::detail(422, err),
    };
    match ctx.registry.configure(config) {
        Ok(info) => Response::json(
            200,
            &json!({
                "message": "Parking lot configuration accepted",
                "lot_id": info.lot_id,
                "status": "processing",
                "started_at": info.started_at,
                "generation": info.generation,
            }),
        ),
        Err(err) => {
            log::error!("configure failed: {:#}", err);
            Response::detail(500, "failed to start lot worker")
        }
    }
}

fn stop_lot(ctx: &ServiceContext, raw_id: &str) -> Response {
    let Ok(lot_id) = raw_id.parse::<LotId>() else {
        return Response::detail(400, format!("lot ID must be an integer, got '{}'", raw_id));
    };
    match ctx.registry.stop(lot_id) {
        Some(stopped) => Response::json(
            200,
            &json!({
                "message": format!("Processing stopped for lot ID {}", lot_id),
                "lot_id": lot_id,
                "video_url": stopped.video_url,
                "started_at": stopped.started_at,
                "stopped_at": stopped.stopped_at,
            }),
        ),
        None => Response::detail(404, ConfigError::UnknownLot(lot_id)),
    }
}

#[derive(Serialize)]
struct StatusBody {
    active_jobs: usize,
    job_details: Vec<JobSummary>,
    failed_jobs: Vec<JobFailure>,
}

fn status(ctx: &ServiceContext) -> Response {
    let job_details = ctx.registry.status();
    Response::json(
        200,
        &StatusBody {
            active_jobs: job_details.len(),
            job_details,
            failed_jobs: ctx.registry.failures(),
        },
    )
}

#[derive(Serialize)]
struct SingleImageBody {
    lot_id: LotId,
    detections: Vec<SpotDetection>,
    annotated_image: String,
}

fn single_image(ctx: &ServiceContext, request: &HttpRequest) -> Response {
    let Some(boundary) = request.header("content-type").and_then(multipart::boundary) else {
        return Response::detail(400, "expected a multipart/form-data body");
    };
    let parts = match multipart::parse(&request.body, &boundary) {
        Ok(parts) => parts,
        Err(err) => return Response::detail(400, err),
    };
    let Some(file) = parts.iter().find(|part| part.name == "file") else {
        return Response::detail(400, "missing form field 'file'");
    };
    let Some(lot_part) = parts.iter().find(|part| part.name == "lot_id") else {
        return Response::detail(400, "missing form field 'lot_id'");
    };
    let Ok(lot_id) = String::from_utf8_lossy(&lot_part.data).trim().parse::<LotId>() else {
        return Response::detail(400, "lot_id must be an integer");
    };

    log::debug!(
        "single-image upload for lot {} ({} bytes, {:?})",
        lot_id,
        file.data.len(),
        file.filename
    );
    let Some(regions) = ctx.registry.regions_for(lot_id) else {
        return Response::detail(404, ConfigError::UnknownLot(lot_id));
    };
    let frame = match Frame::decode(&file.data, 1) {
        Ok(frame) => frame,
        Err(err) => return Response::detail(400, format!("could not decode image: {}", err)),
    };

    match classify_single(ctx, &frame, &regions) {
        Ok((detections, jpeg)) => Response::json(
            200,
            &SingleImageBody {
                lot_id,
                detections,
                annotated_image: format!(
                    "data:image/jpeg;base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(jpeg)
                ),
            },
        ),
        Err(err) => {
            log::warn!("single-image classification failed for lot {}: {:#}", lot_id, err);
            Response::detail(500, "image processing failed")
        }
    }
}

/// One-frame classification with a single-entry window, plus annotated JPEG.
fn classify_single(
    ctx: &ServiceContext,
    frame: &Frame,
    regions: &[crate::Region],
) -> Result<(Vec<SpotDetection>, Vec<u8>)> {
    let raw = ctx.registry.context().pipeline.classify(frame, regions)?;
    let detections = Stabilizer::new(1).detections(&raw);
    let annotated = annotate(frame.image(), regions, &detections);
    Ok((detections, encode_jpeg(&annotated)?))
}
