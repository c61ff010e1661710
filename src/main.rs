use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::{Args, Parser};
use k8s_openapi::api::{
    core::v1::{Secret, Service},
    networking::v1::Ingress,
};
use kube::runtime::reflector::Store;
use kube::ResourceExt as _;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::cloud::gce::GceCloud;
use crate::clusters::ClusterManager;
use crate::controller::LbController;
use crate::namer::Namer;
use crate::queue::TaskQueue;
use crate::state::KubeState;
use crate::tls::SecretTlsLoader;

mod backends;
mod cloud;
mod clusters;
mod controller;
mod firewall;
mod k8s;
mod loadbalancers;
mod metrics;
mod namer;
mod queue;
mod state;
mod tls;
mod urlmap;

// TODO: regional (non-global) provider resources

const WATCH_DEBOUNCE: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// a cluster ingress reconciler for provider L7 load balancers
#[derive(Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    log_pretty: bool,

    /// The local address to serve prometheus metrics on.
    #[arg(long, default_value = "127.0.0.1:8008")]
    metrics_addr: String,

    /// The cluster name. Namespaced into every provider resource name so
    /// multiple clusters can share a project.
    #[arg(long)]
    cluster_name: String,

    /// The provider project to manage resources in.
    #[arg(long)]
    project: String,

    /// The provider compute API endpoint.
    #[arg(long, default_value = "https://compute.googleapis.com")]
    compute_endpoint: String,

    /// The node port of the cluster default backend. Used when a routing
    /// resource declares no default backend of its own.
    #[arg(long, default_value_t = 30000)]
    default_backend_port: i32,

    /// The number of concurrent sync workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[command(flatten)]
    namespace_args: NamespaceArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct NamespaceArgs {
    /// Watch all namespaces. Defaults to false.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    all_namespaces: bool,

    /// The namespace to watch. If this option is not set explicitly, griddle
    /// will watch the namespace set in the kubeconfig's current context, the
    /// namespace specified by the service account the server is running as,
    /// or the `default` namespace.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "griddle=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder.json().flatten_event(true).with_span_list(false).init();
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    metrics::install_prom(&args.metrics_addr)?;

    let token = std::env::var("COMPUTE_ACCESS_TOKEN")
        .context("COMPUTE_ACCESS_TOKEN must be set to a provider API token")?;
    let cloud = Arc::new(GceCloud::new(
        &args.compute_endpoint,
        &args.project,
        &token,
    ));

    let client = kube::Client::try_default().await?;
    let all = args.namespace_args.all_namespaces;
    let ns = args.namespace_args.namespace.as_deref();

    let (ingress_watch, run_ingress_watch) =
        k8s::watch::<Ingress>(kube_api(&client, all, ns), WATCH_DEBOUNCE);
    let (svc_watch, run_svc_watch) =
        k8s::watch::<Service>(kube_api(&client, all, ns), WATCH_DEBOUNCE);
    let (secret_watch, run_secret_watch) =
        k8s::watch::<Secret>(kube_api(&client, all, ns), WATCH_DEBOUNCE);

    let state = Arc::new(KubeState::new(
        ingress_watch.store.clone(),
        svc_watch.store.clone(),
    ));
    let tls = Arc::new(SecretTlsLoader::new(secret_watch.store.clone()));
    let (status, run_status_writer) = state::status_writer(client.clone());
    tokio::spawn(run_status_writer);

    let namer = Namer::new(&args.cluster_name);
    let manager = ClusterManager::new(cloud, namer, args.default_backend_port);
    let controller = Arc::new(LbController::new(
        state,
        tls,
        Arc::new(status),
        manager,
        args.default_backend_port,
    ));

    let queue = Arc::new(TaskQueue::new());

    // routing resource changes enqueue their own key
    tokio::spawn({
        let queue = queue.clone();
        let store = ingress_watch.store.clone();
        let mut changes = ingress_watch.changes.subscribe();
        async move {
            loop {
                match changes.recv().await {
                    Ok(refs) => {
                        for obj in refs.iter() {
                            let namespace = obj.namespace.as_deref().unwrap_or("default");
                            queue.add(format!("{namespace}/{}", obj.name));
                        }
                    }
                    Err(RecvError::Lagged(_)) => enqueue_all(&queue, &store),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    // service and secret changes fan out to every key that references them.
    // this is how routes declared before their backing service self-heal.
    tokio::spawn({
        let queue = queue.clone();
        let controller = controller.clone();
        let store = ingress_watch.store.clone();
        let mut changes = svc_watch.changes.subscribe();
        async move {
            loop {
                match changes.recv().await {
                    Ok(refs) => {
                        for obj in refs.iter() {
                            let namespace = obj.namespace.as_deref().unwrap_or("default");
                            for key in controller.keys_for_service(namespace, &obj.name) {
                                queue.add(key);
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => enqueue_all(&queue, &store),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    tokio::spawn({
        let queue = queue.clone();
        let controller = controller.clone();
        let store = ingress_watch.store.clone();
        let mut changes = secret_watch.changes.subscribe();
        async move {
            loop {
                match changes.recv().await {
                    Ok(refs) => {
                        for obj in refs.iter() {
                            let namespace = obj.namespace.as_deref().unwrap_or("default");
                            for key in controller.keys_for_secret(namespace, &obj.name) {
                                queue.add(key);
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => enqueue_all(&queue, &store),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    for _ in 0..args.workers {
        let queue = queue.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                let key = queue.next().await;

                // the provider client is synchronous, keep it off the runtime
                let result = tokio::task::spawn_blocking({
                    let controller = controller.clone();
                    let key = key.clone();
                    move || controller.sync(&key)
                })
                .await;

                match result {
                    Ok(Ok(())) => {
                        ::metrics::counter!("syncs").increment(1);
                    }
                    Ok(Err(e)) => {
                        ::metrics::counter!("sync_errors").increment(1);
                        tracing::warn!(key, err = %e, "sync failed, requeueing");
                        let queue = queue.clone();
                        let key = key.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(RETRY_DELAY).await;
                            queue.add(key);
                        });
                    }
                    Err(e) => {
                        ::metrics::counter!("sync_errors").increment(1);
                        tracing::error!(key, err = %e, "sync task panicked");
                    }
                }
                queue.done(&key);
            }
        });
    }

    tokio::try_join!(
        spawn_watch(run_ingress_watch),
        spawn_watch(run_svc_watch),
        spawn_watch(run_secret_watch),
    )?;

    Ok(())
}

/// Re-enqueue every known routing resource. The fallback when a change feed
/// lags and drops events.
fn enqueue_all(queue: &TaskQueue, store: &Store<Ingress>) {
    for ingress in store.state() {
        queue.add(format!("{}/{}", ingress.namespace().unwrap_or_default(), ingress.name_any()));
    }
}

fn kube_api<K>(client: &kube::Client, all_namespaces: bool, namespace: Option<&str>) -> kube::Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match (all_namespaces, namespace) {
        (true, _) => kube::Api::all(client.clone()),
        (_, Some(namespace)) => kube::Api::namespaced(client.clone(), namespace),
        _ => kube::Api::default_namespaced(client.clone()),
    }
}

async fn spawn_watch<F, E>(watch: F) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let handle = tokio::spawn(watch);

    match handle.await {
        Ok(Ok(val)) => Ok(val),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
