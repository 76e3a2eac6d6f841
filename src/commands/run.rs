use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, IntGaugeVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use hsj_operator::config::Settings;
use hsj_operator::crd::HotStandbyJob;
use hsj_operator::error::Error;
use hsj_operator::gateway::ClusterGateway;
use hsj_operator::probe::ProbeEngine;
use hsj_operator::reconciler::{reconcile_once, ReconcileDeps};
use hsj_operator::store::StateMonitor;

/* ============================= CONFIG ============================= */

const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "hsj_reconcile_total",
        "Total HotStandbyJob reconcile ticks",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "hsj_reconcile_errors_total",
        "Total HotStandbyJob reconcile tick errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "hsj_reconcile_duration_seconds",
        "Duration of each reconcile tick in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static BUSY_PODS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("hsj_busy_pods", "Busy pods per HotStandbyJob"),
        &["namespace", "hsj"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static IDLE_PODS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("hsj_idle_pods", "Idle pods per HotStandbyJob"),
        &["namespace", "hsj"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static DESIRED_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "hsj_desired_active",
            "Desired active child Jobs per HotStandbyJob",
        ),
        &["namespace", "hsj"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static ACTIVE_JOBS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "hsj_active_jobs",
            "Active child Jobs per HotStandbyJob",
        ),
        &["namespace", "hsj"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static JOBS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("hsj_jobs_created_total", "Total child Jobs created")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static JOBS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("hsj_jobs_deleted_total", "Total child Jobs deleted")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= STATE ============================= */

pub(crate) struct RunState {
    pub(crate) ready: bool,
}

/* ============================= CONTEXT ============================= */

struct RunContext {
    client: Client,
    deps: ReconcileDeps,
    reporter: Reporter,
    sync_interval: Duration,
}

/* ============================= ENTRY ============================= */

pub async fn run(scale_down_enabled: bool) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    println!("Starting HotStandbyJob operator...\n");

    let settings = Settings::from_env();

    let client = Client::try_default()
        .await
        .context("Failed to load cluster config")?;

    // Verify actual cluster connectivity before starting the controller
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // The store is optional: only HSJs with busyProbe.mode=redis need it.
    // When configured, an unreachable store is an init failure.
    let monitor = match &settings.redis {
        Some(redis) => {
            print!("  Pod-state store ............. ");
            match StateMonitor::connect(redis).await {
                Ok(monitor) => {
                    println!("OK ({})", redis.url());
                    Some(monitor)
                }
                Err(e) => {
                    println!("FAIL");
                    return Err(e).context("Cannot open pod-state store");
                }
            }
        }
        None => None,
    };

    let gateway = Arc::new(ClusterGateway::new(client.clone()));
    let deps = ReconcileDeps {
        gateway: gateway.clone(),
        probes: ProbeEngine::new(gateway, monitor),
        scale_down_enabled,
    };

    let hsjs: Api<HotStandbyJob> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());

    let ctx = Arc::new(RunContext {
        client: client.clone(),
        deps,
        reporter: Reporter {
            controller: "hsj-operator".into(),
            instance: None,
        },
        sync_interval: settings.sync_interval,
    });

    // Force-init Prometheus metrics so they appear on /metrics
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&BUSY_PODS);
    LazyLock::force(&IDLE_PODS);
    LazyLock::force(&DESIRED_ACTIVE);
    LazyLock::force(&ACTIVE_JOBS);
    LazyLock::force(&JOBS_CREATED);
    LazyLock::force(&JOBS_DELETED);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... HotStandbyJob.apps.paia.tech/v1alpha1");
    println!(
        "  Sync interval ............... {}s",
        settings.sync_interval.as_secs()
    );
    println!(
        "  Scale-down .................. {}",
        if scale_down_enabled { "enabled" } else { "disabled" }
    );
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!(
        "    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)"
    );
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_started");

    let run_state = Arc::new(Mutex::new(RunState { ready: false }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = run_state.clone();
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    // The controller watches HotStandbyJobs (create/update and the startup
    // replay of existing ones) and owns the child Jobs, so Job status flips
    // also trigger a tick. Reconciles are serialised per object by the
    // runtime; distinct HSJs proceed in parallel.
    let controller_state = run_state.clone();
    let controller = Controller::new(hsjs, Default::default())
        .owns(jobs, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                // Mark ready after first reconcile dispatch
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                match result {
                    Ok((_obj, _action)) => {}
                    Err(e) => {
                        warn!(error = %e, "reconcile_dispatch_error");
                        eprintln!("[ERROR] Reconcile dispatch: {e}");
                    }
                }
            }
        });

    // Use select! so Ctrl+C drops (cancels) the controller stream.
    // The kube Controller has no built-in shutdown hook, so dropping
    // the future is the only way to stop it cleanly.
    tokio::select! {
        _ = controller => {
            info!("operator_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    // Signal the HTTP server to shut down
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    hsj: Arc<HotStandbyJob>,
    ctx: Arc<RunContext>,
) -> std::result::Result<Action, Error> {
    let name = hsj.name_any();
    let namespace = hsj.namespace().unwrap_or_default();

    // Owner references cascade child-Job deletion; nothing to tear down here
    // beyond this HSJ's gauges.
    if hsj.metadata.deletion_timestamp.is_some() {
        clear_gauges(&namespace, &name);
        info!(hsj = %name, namespace = %namespace, "hsj_deleted");
        return Ok(Action::await_change());
    }

    RECONCILE_TOTAL.inc();
    let _timer = RECONCILE_DURATION.start_timer();

    info!(hsj = %name, namespace = %namespace, "reconcile_start");

    let outcome = match reconcile_once(&hsj, &ctx.deps).await {
        Ok(outcome) => outcome,
        Err(e) => {
            publish_reconcile_error(&ctx, &hsj, &e).await;
            return Err(e);
        }
    };

    let status = &outcome.status;

    // Last-write-wins; a conflict here is rewritten by the next tick.
    let api: Api<HotStandbyJob> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    if let Err(e) = api
        .patch_status(
            &name,
            &PatchParams::apply("hsj-operator"),
            &Patch::Merge(&patch),
        )
        .await
    {
        warn!(hsj = %name, namespace = %namespace, error = %e, "status_patch_failed");
    }

    BUSY_PODS
        .with_label_values(&[&namespace, &name])
        .set(status.busy_count.unwrap_or(0) as i64);
    IDLE_PODS
        .with_label_values(&[&namespace, &name])
        .set(status.idle_count.unwrap_or(0) as i64);
    DESIRED_ACTIVE
        .with_label_values(&[&namespace, &name])
        .set(status.desired_active.unwrap_or(0) as i64);
    ACTIVE_JOBS
        .with_label_values(&[&namespace, &name])
        .set(status.active_jobs.unwrap_or(0) as i64);
    JOBS_CREATED.inc_by(outcome.jobs_created as u64);
    JOBS_DELETED.inc_by(outcome.jobs_deleted as u64);

    println!(
        "[{}] {namespace}/{name}: busy={} idle={} desired={} jobs={}/{} (+{} -{}), requeue in {}s",
        chrono::Utc::now().format("%H:%M:%S"),
        status.busy_count.unwrap_or(0),
        status.idle_count.unwrap_or(0),
        status.desired_active.unwrap_or(0),
        status.active_jobs.unwrap_or(0),
        status.child_jobs.unwrap_or(0),
        outcome.jobs_created,
        outcome.jobs_deleted,
        ctx.sync_interval.as_secs()
    );

    info!(
        hsj = %name,
        namespace = %namespace,
        busy = status.busy_count.unwrap_or(0),
        idle = status.idle_count.unwrap_or(0),
        desired = status.desired_active.unwrap_or(0),
        created = outcome.jobs_created,
        deleted = outcome.jobs_deleted,
        "reconcile_complete"
    );

    Ok(Action::requeue(ctx.sync_interval))
}

/* ============================= ERROR POLICY ============================= */

fn error_policy(_hsj: Arc<HotStandbyJob>, error: &Error, _ctx: Arc<RunContext>) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(error = %error, "reconcile_error");
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

async fn publish_reconcile_error(ctx: &RunContext, hsj: &HotStandbyJob, error: &Error) {
    let recorder = Recorder::new(
        ctx.client.clone(),
        ctx.reporter.clone(),
        hsj.object_ref(&()),
    );
    let event = Event {
        type_: EventType::Warning,
        reason: "ReconcileError".to_string(),
        note: Some(format!("reconcile failed: {error}")),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        warn!(error = %e, "event_publish_failed");
    }
}

fn clear_gauges(namespace: &str, name: &str) {
    let _ = BUSY_PODS.remove_label_values(&[namespace, name]);
    let _ = IDLE_PODS.remove_label_values(&[namespace, name]);
    let _ = DESIRED_ACTIVE.remove_label_values(&[namespace, name]);
    let _ = ACTIVE_JOBS.remove_label_values(&[namespace, name]);
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_run_router(state: Arc<Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(run_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || run_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<RunState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_run_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn run_ready_handler(state: Arc<Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn run_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
