use crate::{
    deadline::Deadline,
    dns::{self, Resolution},
    http::{check_http, create_http_pool},
    ratelimit::ProbeRateLimiter,
    types::{FanOutConfig, ProbeConfig, ProbeError},
};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

/// Decides whether one domain is reachable.
///
/// Implementations fold every failure into `Ok(false)` except running out
/// of the caller's [`Deadline`].
pub trait Probe: Send + Sync + 'static {
    fn probe(
        &self,
        domain: &str,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send;
}

impl<P: Probe> Probe for Arc<P> {
    fn probe(
        &self,
        domain: &str,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
        (**self).probe(domain, deadline)
    }
}

/// DNS against a fixed resolver, then HTTPS HEAD (GET on 405).
pub struct Prober {
    client: Client,
    rate_limiter: Arc<ProbeRateLimiter>,
    config: ProbeConfig,
}

impl Prober {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(ProbeConfig::default())
    }

    pub fn with_config(config: ProbeConfig) -> Result<Self, reqwest::Error> {
        let client = create_http_pool(config.http_timeout)?;
        Ok(Self {
            client,
            rate_limiter: Arc::new(ProbeRateLimiter::new(config.max_probes_per_second)),
            config,
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub async fn probe_one(&self, domain: &str, deadline: &Deadline) -> Result<bool, ProbeError> {
        deadline.run(self.rate_limiter.acquire()).await?;

        match deadline
            .run(dns::resolve(self.config.resolver, domain, self.config.dns_timeout))
            .await?
        {
            Ok(Resolution::NotFound) => {
                debug!(%domain, "name not found");
                return Ok(false);
            }
            Ok(Resolution::Resolved) => {}
            Ok(Resolution::Inconclusive) => debug!(%domain, "truncated dns reply, trying http anyway"),
            Err(e) => debug!(%domain, error = %e, "resolver unreachable, trying http anyway"),
        }

        check_http(&self.client, &format!("https://{}", domain), deadline).await
    }
}

impl Probe for Prober {
    fn probe(
        &self,
        domain: &str,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<bool, ProbeError>> + Send {
        self.probe_one(domain, deadline)
    }
}

impl Clone for Prober {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
            config: self.config.clone(),
        }
    }
}

/// Transient probers for a batch of `jobs` domains.
///
/// `jobs / ratio` capped at `limit`, but never zero while there is work:
/// a batch smaller than the ratio still gets one prober.
pub fn worker_count(jobs: usize, config: &FanOutConfig) -> usize {
    if jobs == 0 {
        return 0;
    }
    let ratio = config.workers_ratio.max(1);
    (jobs / ratio).min(config.workers_limit).max(1)
}

/// Probes every domain concurrently and returns statuses in input order.
///
/// The first error aborts the batch; nothing partial is returned.
pub async fn check_all<P: Probe>(
    prober: &P,
    domains: &[String],
    config: &FanOutConfig,
    deadline: &Deadline,
) -> Result<Vec<bool>, ProbeError> {
    let workers = worker_count(domains.len(), config);
    let mut statuses = vec![false; domains.len()];
    if workers == 0 {
        return Ok(statuses);
    }

    let mut queued = domains.iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    for (index, domain) in queued.by_ref().take(workers) {
        in_flight.push(probe_at(prober, index, domain, deadline));
    }

    while let Some((index, result)) = in_flight.next().await {
        match result {
            Ok(status) => statuses[index] = status,
            Err(e) => {
                warn!(domain = %domains[index], error = %e, "batch aborted");
                return Err(e);
            }
        }
        if let Some((index, domain)) = queued.next() {
            in_flight.push(probe_at(prober, index, domain, deadline));
        }
    }

    Ok(statuses)
}

async fn probe_at<P: Probe>(
    prober: &P,
    index: usize,
    domain: &str,
    deadline: &Deadline,
) -> (usize, Result<bool, ProbeError>) {
    (index, prober.probe(domain, deadline).await)
}
