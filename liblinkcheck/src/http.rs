use crate::{deadline::Deadline, types::ProbeError};
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::debug;

pub fn create_http_pool(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .use_rustls_tls()
        .build()
}

/// HEAD `url`, retrying once with GET on 405. Any transport failure counts
/// as "not available"; only the deadline can turn this into an error.
pub async fn check_http(client: &Client, url: &str, deadline: &Deadline) -> Result<bool, ProbeError> {
    let status = match send(client, Method::HEAD, url, deadline).await? {
        Some(StatusCode::METHOD_NOT_ALLOWED) => send(client, Method::GET, url, deadline).await?,
        status => status,
    };

    Ok(status == Some(StatusCode::OK))
}

async fn send(
    client: &Client,
    method: Method,
    url: &str,
    deadline: &Deadline,
) -> Result<Option<StatusCode>, ProbeError> {
    match deadline.run(client.request(method.clone(), url).send()).await? {
        Ok(response) => Ok(Some(response.status())),
        Err(e) => {
            debug!(%url, %method, error = %e, "request failed, treating as unavailable");
            Ok(None)
        }
    }
}
