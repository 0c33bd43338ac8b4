use crate::{
    core::{
        derivative::PARENT_LABEL,
        metrics,
        resolve::{StaticGroup, STATIC_PROVIDER},
        Config, DerivativeCache, KeyScope, Orchestrator, ProviderResolver, ReconcileMetrics,
        RetryConfig, StaticProvider, TaskScheduler,
    },
    index,
    k8s::{policy::NetworkPolicy, watcher},
    lease, status, KubeStore,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "groups-policy-controller",
    about = "Maintains derivative policies for group-based network policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "groups=info,warn",
        env = "GROUPS_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the controller's Deployment, which owns the write lease.
    #[clap(long, default_value = "groups-policy-controller")]
    deployment_name: String,

    /// The namespace in which the write lease is held.
    #[clap(long, default_value = "kube-system")]
    controller_namespace: String,

    /// The number of times a parent's groups are resolved before a deny-all
    /// derivative is installed.
    #[clap(long, default_value = "5", value_parser = clap::value_parser!(u32).range(1..))]
    resolve_attempts: u32,

    #[clap(long, default_value = "5000")]
    resolve_retry_delay_ms: u64,

    /// How often derivatives are re-resolved to follow group membership.
    #[clap(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    refresh_interval_secs: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Either `per-operation` or `per-parent`.
    #[clap(long, default_value = "per-operation")]
    key_scope: KeyScope,

    /// A group served by the `static` provider, as `NAME=CIDR[,CIDR...]`.
    #[clap(long = "static-group")]
    static_groups: Vec<StaticGroup>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            deployment_name,
            controller_namespace,
            resolve_attempts,
            resolve_retry_delay_ms,
            refresh_interval_secs,
            patch_timeout_ms,
            key_scope,
            static_groups,
        } = self;

        let cache = DerivativeCache::default();
        let scheduler = TaskScheduler::default();

        let mut prom = <Registry>::default();
        let reconcile_metrics = ReconcileMetrics::register(&mut prom);
        metrics::register_state(&mut prom, cache.clone(), scheduler.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME")
            .context("failed to read the `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &deployment_name,
            &hostname,
        )
        .await?;
        let leader = lease::leadership(hostname, claims);

        let groups = static_groups.len();
        let resolver = ProviderResolver::default().with_provider(
            STATIC_PROVIDER,
            static_groups.into_iter().collect::<StaticProvider>(),
        );
        info!(static_groups = groups, "Configured group providers");

        let patch_timeout = Duration::from_millis(patch_timeout_ms);
        let orchestrator = Orchestrator::new(
            scheduler,
            resolver,
            KubeStore::new(runtime.client(), patch_timeout),
            status::StatusPatcher::new(runtime.client(), patch_timeout),
            cache,
            reconcile_metrics,
            Config {
                retry: RetryConfig {
                    max_attempts: resolve_attempts,
                    delay: Duration::from_millis(resolve_retry_delay_ms),
                },
                key_scope,
            },
        );
        let index = index::Index::shared(leader, Arc::new(orchestrator));

        // Derivatives carry the parent label and are never parents
        // themselves.
        let policies = runtime.watch_all::<NetworkPolicy>(
            watcher::Config::default().labels(&format!("!{PARENT_LABEL}")),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        tokio::spawn(
            index::Index::run(index, Duration::from_secs(refresh_interval_secs))
                .instrument(info_span!("refresh")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
