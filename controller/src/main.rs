use std::sync::Arc;

use controller::util::{
    config::ControllerConfig, controller_ctx::ControllerContext, health_check_action, indexer,
    machine_set_action, node_link_watcher,
};
use mapi_shared::k8s::events::RecorderSink;
use mapi_shared::k8s::KubeImpl;
use mapi_shared::mapi::metrics::run_metrics_server;
use mapi_shared::os::env_var::ActualEnvVarQuery;

/// This is the entry point for the generic controller suite: MachineSet,
/// MachineHealthCheck and NodeLink plus the index feeds. The Machine
/// controller links into provider binaries together with their actuator.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    env_logger::try_init()?;
    log::info!("mapi-controller start");

    let config = ControllerConfig::from_env(&ActualEnvVarQuery);
    log::info!("controller configuration: {:?}", config);
    let metrics_port = config.metrics_port;

    let kube = KubeImpl::new().await?;
    let events = Arc::new(RecorderSink::new(kube.client()));
    let ctx = Arc::new(ControllerContext::new(Arc::new(kube), events, config));

    let mut tasks = Vec::new();

    // Start server for prometheus metrics
    tasks.push(tokio::spawn(async move {
        run_metrics_server(metrics_port).await;
    }));

    // Feed the secondary indexes
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            indexer::run_machine_index(ctx).await.unwrap();
        }
    }));
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            indexer::run_node_index(ctx).await.unwrap();
        }
    }));

    // Enforce MachineSet replica counts
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            machine_set_action::run(ctx).await;
        }
    }));
    // Watch fleet health and remediate
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            health_check_action::run(ctx).await;
        }
    }));
    // Correlate Nodes with Machines
    tasks.push(tokio::spawn(async move {
        node_link_watcher::run(ctx).await;
    }));

    futures::future::try_join_all(tasks).await?;

    log::info!("mapi-controller end");
    Ok(())
}
