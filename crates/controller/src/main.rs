use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use xcc_core::{LABEL_KEY, LABEL_VALUE_FOLLOWER, LABEL_VALUE_SOURCE};
use xcc_kubehub::{client_from_config, local_config, remote_config, validate_hosts_differ, run_reader};
use xcc_leader::LeaderElector;
use xcc_pipeline::{Augmenter, EndpointsWhitelist, Label, Pipeline, ServiceWhitelist, Transformer};
use xcc_writer::Writer;

#[derive(Parser, Debug, Clone)]
#[command(name = "xcc-controller", version, about = "Cross-cluster Service/Endpoints replicator")]
struct Args {
    #[arg(long, env = "KUBECONFIG_PATH")]
    kubeconfig: Option<String>,

    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    devmode: bool,

    #[arg(long, env = "XCC_LOCAL_CONTEXT", default_value = "prototype-general")]
    local_context: String,

    #[arg(long, env = "XCC_REMOTE_CONTEXT", default_value = "prototype-secure")]
    remote_context: String,

    #[arg(long, env = "XCC_RESYNC_SECONDS", default_value_t = 30)]
    resync_seconds: u64,

    #[arg(long, env = "XCC_CLEAN_INTERVAL_SECONDS", default_value_t = 300)]
    clean_interval_seconds: u64,

    #[arg(long, env = "XCC_CHANNEL_CAPACITY", default_value_t = 4)]
    channel_capacity: usize,

    #[arg(long, env = "XCC_LEASE_NAMESPACE", default_value = "fair-system")]
    lease_namespace: String,

    #[arg(long, env = "XCC_LEASE_NAME", default_value = "cross-cluster-controller")]
    lease_name: String,

    #[arg(long, env = "XCC_LOG", default_value = "info")]
    log: String,

    #[arg(long, env = "XCC_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,
}

fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn install_metrics(addr: &str) -> anyhow::Result<()> {
    let socket = addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(socket)
        .install()?;
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log);

    if let Err(err) = install_metrics(&args.metrics_addr) {
        warn!(error = %err, "failed to install prometheus exporter, continuing without metrics");
    }

    let local_cfg = local_config(args.devmode, &args.local_context).await?;
    let remote_cfg = remote_config(args.devmode, args.kubeconfig.as_deref(), &args.remote_context).await?;
    validate_hosts_differ(&local_cfg, &remote_cfg, args.devmode)?;

    let local_client = client_from_config(local_cfg)?;
    let remote_client = client_from_config(remote_cfg)?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    let lease = LeaderElector::new(local_client.clone(), args.lease_namespace.clone(), args.lease_name.clone());

    let run_args = args.clone();
    lease
        .run_while_leader(
            Duration::from_secs(5),
            Duration::from_secs(15),
            shutdown.clone(),
            move |token| {
                run_while_leading(run_args.clone(), local_client.clone(), remote_client.clone(), token)
            },
        )
        .await;

    Ok(())
}

async fn run_while_leading(args: Args, local_client: kube::Client, remote_client: kube::Client, stop: CancellationToken) {
    let resync = Duration::from_secs(args.resync_seconds);
    let remote_source_cfg = watcher::Config::default()
        .labels(&format!("{LABEL_KEY}={LABEL_VALUE_SOURCE}"))
        .timeout(resync.as_secs() as u32);

    let svc_api: kube::Api<Service> = kube::Api::all(remote_client.clone());
    let (svc_tx, svc_rx) = mpsc::channel(args.channel_capacity);
    spawn_service_chain(svc_api, local_client.clone(), remote_source_cfg.clone(), svc_tx.clone(), svc_rx, stop.clone());

    let eps_api: kube::Api<Endpoints> = kube::Api::all(remote_client.clone());
    let (eps_tx, eps_rx) = mpsc::channel(args.channel_capacity);
    spawn_endpoints_chain(eps_api, local_client.clone(), remote_source_cfg, eps_tx.clone(), eps_rx, stop.clone());

    let local_selector = format!("{LABEL_KEY}={LABEL_VALUE_FOLLOWER}");
    let remote_selector = format!("{LABEL_KEY}={LABEL_VALUE_SOURCE}");
    let clean_interval = Duration::from_secs(args.clean_interval_seconds);

    let mut svc_cleaner = xcc_cleaner::spawn_cleaner(
        local_client.clone(),
        remote_client.clone(),
        None,
        local_selector.clone(),
        remote_selector.clone(),
        clean_interval,
        svc_tx,
    );
    let mut eps_cleaner = xcc_cleaner::spawn_cleaner(
        local_client,
        remote_client,
        None,
        local_selector,
        remote_selector,
        clean_interval,
        eps_tx,
    );

    stop.cancelled().await;
    svc_cleaner.cancel();
    eps_cleaner.cancel();
}

fn spawn_service_chain(
    remote_api: kube::Api<Service>,
    local_client: kube::Client,
    watcher_cfg: watcher::Config,
    writer_tx: mpsc::Sender<xcc_core::ServiceReplicationRequest>,
    writer_rx: mpsc::Receiver<xcc_core::ServiceReplicationRequest>,
    stop: CancellationToken,
) {
    let (reader_tx, reader_rx) = mpsc::channel(writer_tx.capacity().max(1));

    let reader_stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = run_reader(remote_api, watcher_cfg, reader_tx) => {
                if let Err(err) = res {
                    error!(error = %err, kind = "Service", "watcher stream failed");
                }
            }
            _ = reader_stop.cancelled() => {}
        }
    });

    let pipeline = Pipeline::new(vec![
        Box::new(Augmenter::<Service>::new(local_client.clone())) as Box<dyn Transformer<Service>>,
        Box::new(ServiceWhitelist),
        Box::new(Label),
    ]);
    let pipeline_stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = pipeline.run(reader_rx, writer_tx) => {}
            _ = pipeline_stop.cancelled() => {}
        }
    });

    let writer = Writer::<Service>::new(local_client);
    tokio::spawn(async move {
        tokio::select! {
            _ = writer.run(writer_rx) => {}
            _ = stop.cancelled() => {}
        }
    });
}

fn spawn_endpoints_chain(
    remote_api: kube::Api<Endpoints>,
    local_client: kube::Client,
    watcher_cfg: watcher::Config,
    writer_tx: mpsc::Sender<xcc_core::EndpointsReplicationRequest>,
    writer_rx: mpsc::Receiver<xcc_core::EndpointsReplicationRequest>,
    stop: CancellationToken,
) {
    let (reader_tx, reader_rx) = mpsc::channel(writer_tx.capacity().max(1));

    let reader_stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = run_reader(remote_api, watcher_cfg, reader_tx) => {
                if let Err(err) = res {
                    error!(error = %err, kind = "Endpoints", "watcher stream failed");
                }
            }
            _ = reader_stop.cancelled() => {}
        }
    });

    let pipeline = Pipeline::new(vec![
        Box::new(Augmenter::<Endpoints>::new(local_client.clone())) as Box<dyn Transformer<Endpoints>>,
        Box::new(EndpointsWhitelist),
        Box::new(Label),
    ]);
    let pipeline_stop = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = pipeline.run(reader_rx, writer_tx) => {}
            _ = pipeline_stop.cancelled() => {}
        }
    });

    let writer = Writer::<Endpoints>::new(local_client);
    tokio::spawn(async move {
        tokio::select! {
            _ = writer.run(writer_rx) => {}
            _ = stop.cancelled() => {}
        }
    });
}
