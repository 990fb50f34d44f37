use crate::{
    admin::Admin,
    allocator::AllocatorConfig,
    api::{Api, ApiMetrics},
    controller::{ControllerConfig, GatewayController},
    delivery::HttpDelivery,
    membership::StaticMembership,
    ports::ReservedPorts,
    server,
};
use anyhow::{Context, Result};
use clap::Parser;
use gateway_controller_core::delivery::Membership;
use gateway_controller_propagate::{
    Backoff, Config as PropagateConfig, PropagateMetrics, Propagator, Reconciler,
};
use gateway_controller_store::InMemoryStore;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gateway-controller", about = "A gateway rule controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "gateway_controller=info,warn",
        env = "GATEWAY_CONTROLLER_LOG"
    )]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:8888", env = "GATEWAY_CONTROLLER_API_ADDR")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990", env = "GATEWAY_CONTROLLER_ADMIN_ADDR")]
    admin_addr: SocketAddr,

    /// External TCP ports must be strictly greater than this.
    #[clap(long, default_value = "1024")]
    min_external_port: u16,

    #[clap(long, default_value = "65535")]
    max_external_port: u16,

    /// How long a port handed out by `available-port?lock=true` stays held.
    #[clap(long, default_value = "300")]
    placeholder_ttl_secs: u64,

    /// Ports and port ranges never handed out by port discovery, e.g. `8080,9000-9100`.
    #[clap(long, default_value = "")]
    reserved_ports: ReservedPorts,

    /// Data-plane proxy addresses (`host:port`) that receive rule events.
    #[clap(
        long,
        value_delimiter = ',',
        env = "GATEWAY_CONTROLLER_DATAPLANE_ADDRS"
    )]
    dataplane_addrs: Vec<String>,

    #[clap(long, default_value = "4")]
    propagate_workers: usize,

    #[clap(long, default_value = "1024")]
    propagate_queue_size: usize,

    #[clap(long, default_value = "100")]
    enqueue_timeout_ms: u64,

    #[clap(long, default_value = "100")]
    retry_initial_ms: u64,

    #[clap(long, default_value = "10000")]
    retry_max_ms: u64,

    #[clap(long, default_value = "8")]
    retry_max_attempts: u32,

    #[clap(long, default_value = "30")]
    reconcile_period_secs: u64,

    /// How long delete events keep being re-sent by the reconciliation sweep.
    #[clap(long, default_value = "600")]
    tombstone_retention_secs: u64,

    #[clap(long, default_value = "5000")]
    request_timeout_ms: u64,

    #[clap(long, default_value = "2000")]
    publish_timeout_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            api_addr,
            admin_addr,
            min_external_port,
            max_external_port,
            placeholder_ttl_secs,
            reserved_ports,
            dataplane_addrs,
            propagate_workers,
            propagate_queue_size,
            enqueue_timeout_ms,
            retry_initial_ms,
            retry_max_ms,
            retry_max_attempts,
            reconcile_period_secs,
            tombstone_retention_secs,
            request_timeout_ms,
            publish_timeout_ms,
        } = self;

        init_tracing(&log_level, log_format)?;
        anyhow::ensure!(
            min_external_port < max_external_port,
            "--min-external-port must be lower than --max-external-port"
        );

        let mut prom = <Registry>::default();
        let propagate_metrics =
            PropagateMetrics::register(prom.sub_registry_with_prefix("propagate"));
        let api_metrics = ApiMetrics::register(prom.sub_registry_with_prefix("api"));

        let store = InMemoryStore::shared();
        gateway_controller_store::metrics::register(
            prom.sub_registry_with_prefix("store"),
            store.clone(),
        );

        let (signal, drain) = drain::channel();

        let membership: Arc<dyn Membership> = Arc::new(StaticMembership::new(dataplane_addrs));
        let delivery = HttpDelivery::new(
            membership.clone(),
            Duration::from_millis(publish_timeout_ms),
        );
        let propagator = Propagator::spawn(
            PropagateConfig {
                workers: propagate_workers,
                queue_size: propagate_queue_size,
                enqueue_timeout: Duration::from_millis(enqueue_timeout_ms),
                backoff: Backoff {
                    initial: Duration::from_millis(retry_initial_ms),
                    max: Duration::from_millis(retry_max_ms),
                    max_attempts: retry_max_attempts,
                    ..Backoff::default()
                },
            },
            Arc::new(delivery),
            propagate_metrics.clone(),
            drain.clone(),
        );

        // The first sweep runs immediately, re-sending everything the data plane may have
        // missed while the controller was down.
        let reconciler = Reconciler::new(
            store.clone(),
            propagator.clone(),
            Duration::from_secs(tombstone_retention_secs),
            propagate_metrics,
        );
        tokio::spawn(
            reconciler
                .run(Duration::from_secs(reconcile_period_secs), drain.clone())
                .instrument(info_span!("reconcile")),
        );

        let controller = GatewayController::new(
            store,
            propagator,
            membership,
            ControllerConfig {
                allocator: AllocatorConfig {
                    min_external_port,
                    max_external_port,
                    reserved: reserved_ports,
                    placeholder_ttl: Duration::from_secs(placeholder_ttl_secs),
                },
                request_timeout: Duration::from_millis(request_timeout_ms),
            },
        );

        let (ready_tx, ready_rx) = watch::channel(false);
        let admin = Admin::new(ready_rx, Arc::new(prom));
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("binding admin server to {admin_addr}"))?;
        let admin_task = tokio::spawn(
            server::serve("admin", admin_listener, admin, drain.clone())
                .instrument(info_span!("admin")),
        );

        let api = Api::new(controller, api_metrics);
        let api_listener = TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("binding api server to {api_addr}"))?;
        let api_task = tokio::spawn(
            server::serve("api", api_listener, api, drain).instrument(info_span!("api")),
        );

        let _ = ready_tx.send(true);

        // Block the main thread on the shutdown signal. Once it fires, wait for in-flight requests
        // and queued events to drain before exiting.
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("Shutting down");
        let _ = ready_tx.send(false);
        signal.drain().await;

        for task in [admin_task, api_task] {
            task.await.context("server task panicked")??;
        }
        Ok(())
    }
}

fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level {log_level:?}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    res.map_err(|error| anyhow::anyhow!("failed to initialize tracing: {error}"))
}
