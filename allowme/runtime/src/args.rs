use crate::{
    core::{AllowListStore, RetryPolicy, UpdateMetrics, Updater},
    k8s::ServiceStore,
    metrics::RequestMetrics,
    server::{self, NewAllowMe},
    termination,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "allowme",
    about = "Adds callers to a LoadBalancer Service's source ranges"
)]
pub struct Args {
    #[clap(long, default_value = "allowme=info,warn", env = "ALLOWME_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:5000")]
    listen_addr: SocketAddr,

    /// Name of the LoadBalancer Service whose source ranges are updated.
    #[clap(long, env = "KUBERNETES_SERVICE_NAME")]
    service_name: Option<String>,

    /// Namespace of the Service. Defaults to the client's namespace, i.e. the
    /// pod's namespace when running in-cluster.
    #[clap(long, env = "POD_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum number of write attempts per request when updates race.
    #[clap(long, default_value = "5")]
    max_attempts: NonZeroU32,

    #[clap(long, default_value = "50")]
    retry_backoff_ms: u64,

    #[clap(long, default_value = "10000")]
    store_timeout_ms: u64,

    #[clap(long, default_value = "/dev/termination-log")]
    termination_log: PathBuf,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    /// Runs the server until shutdown, recording fatal errors in the
    /// termination log.
    pub async fn run(self) -> Result<()> {
        let termination_log = self.termination_log.clone();
        let res = self.serve().await;
        if let Err(error) = &res {
            termination::report(&termination_log, error);
        }
        res
    }

    async fn serve(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            listen_addr,
            service_name,
            namespace,
            max_attempts,
            retry_backoff_ms,
            store_timeout_ms,
            termination_log: _,
        } = self;

        let service_name = service_name.ok_or_else(|| {
            anyhow!("Missing env KUBERNETES_SERVICE_NAME, you need to provide the value")
        })?;

        let mut prom = <Registry>::default();
        let allowme = prom.sub_registry_with_prefix("allowme");
        let request_metrics = RequestMetrics::register(allowme);
        let update_metrics = UpdateMetrics::register(allowme);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        let store = ServiceStore::new(
            client,
            &namespace,
            &service_name,
            Duration::from_millis(store_timeout_ms),
        );

        // Fail fast if the Service cannot be read, rather than on the first
        // request.
        store.fetch().await.with_context(|| {
            format!(
                "Service {service_name} not accessible or does not exist, check Role permissions?"
            )
        })?;
        info!(%namespace, service = %service_name, "Updating LoadBalancer source ranges");

        let policy = RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(retry_backoff_ms),
        };
        let updater = Arc::new(Updater::new(store, policy, update_metrics));

        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;
        tokio::spawn(
            server::serve(
                listener,
                NewAllowMe::new(updater, request_metrics),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("allowme")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // in-flight requests to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["allowme", "--service-name=web"]).unwrap();
        assert_eq!(args.service_name.as_deref(), Some("web"));
        assert_eq!(args.listen_addr, SocketAddr::from(([0, 0, 0, 0], 5000)));
        assert_eq!(args.max_attempts.get(), 5);
        assert_eq!(args.retry_backoff_ms, 50);
        assert_eq!(args.store_timeout_ms, 10_000);
        assert_eq!(args.termination_log, PathBuf::from("/dev/termination-log"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let res = Args::try_parse_from(["allowme", "--service-name=web", "--max-attempts=0"]);
        assert!(res.is_err());
    }
}
