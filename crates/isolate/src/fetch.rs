use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, Method, redirect};
use runtime_core::net_policy::{self, NetDenial};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug)]
pub enum FetchError {
    LimitExceeded,
    Denied(NetDenial),
    Failed(String),
    ResponseTooLarge,
    BudgetExceeded,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::LimitExceeded => f.write_str("Fetch limit exceeded"),
            FetchError::Denied(denial) => write!(f, "Network denied: {}", denial),
            FetchError::Failed(reason) => write!(f, "Fetch failed: {}", reason),
            FetchError::ResponseTooLarge => f.write_str("Response too large"),
            FetchError::BudgetExceeded => f.write_str("Fetch byte budget exceeded"),
        }
    }
}

/// Body bytes allowed across every fetch of one run, in flight or done.
#[derive(Debug)]
pub struct ByteMeter {
    used: AtomicU64,
    limit: u64,
}

impl ByteMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Charge `bytes`. Nothing is charged when the limit would be passed.
    pub fn charge(&self, bytes: u64) -> Result<(), FetchError> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|_| FetchError::BudgetExceeded)
    }
}

/// Ceilings for one request.
#[derive(Debug, Clone)]
pub struct FetchBudget {
    pub per_response: u64,
    pub total: Arc<ByteMeter>,
    pub timeout: Duration,
    pub deny_private_networks: bool,
}

/// Validate `url` and pick the address to connect to.
///
/// Returns `None` when private networks are allowed and no pinning is needed.
pub async fn resolve_target(url: &Url, deny_private: bool) -> Result<Option<SocketAddr>, NetDenial> {
    net_policy::check_scheme(url.scheme())?;
    if !deny_private {
        return Ok(None);
    }
    let host = url.host_str().ok_or(NetDenial::InvalidUrl)?;
    net_policy::check_host(host)?;
    let port = url.port_or_known_default().ok_or(NetDenial::InvalidUrl)?;

    let ip = match url.host() {
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
        Some(Host::Domain(domain)) => {
            let answers = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|_| NetDenial::Unresolvable)?;
            net_policy::check_resolved(answers.map(|addr| addr.ip()))?
        }
        None => return Err(NetDenial::InvalidUrl),
    };
    Ok(Some(SocketAddr::new(ip, port)))
}

/// Perform one request. Body bytes are charged to `budget.total` as they
/// arrive.
pub async fn perform(request: FetchRequest, budget: FetchBudget) -> Result<FetchResponse, FetchError> {
    let url = Url::parse(&request.url).map_err(|_| FetchError::Denied(NetDenial::InvalidUrl))?;
    let target = resolve_target(&url, budget.deny_private_networks)
        .await
        .map_err(FetchError::Denied)?;

    let mut builder = Client::builder()
        .redirect(redirect::Policy::none())
        .timeout(budget.timeout)
        .no_proxy();
    if let (Some(addr), Some(Host::Domain(domain))) = (target, url.host()) {
        builder = builder.resolve(domain, addr);
    }
    let client = builder
        .build()
        .map_err(|err| FetchError::Failed(err.to_string()))?;

    let method = request.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| FetchError::Failed(format!("invalid method {}", method)))?;
    let mut outgoing = client.request(method, url);
    for (name, value) in &request.headers {
        outgoing = outgoing.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        outgoing = outgoing.body(body);
    }

    let mut response = outgoing
        .send()
        .await
        .map_err(|err| FetchError::Failed(describe(&err)))?;

    if response
        .content_length()
        .is_some_and(|length| length > budget.per_response)
    {
        return Err(FetchError::ResponseTooLarge);
    }

    let status = response.status();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| FetchError::Failed(describe(&err)))?
    {
        if (body.len() + chunk.len()) as u64 > budget.per_response {
            return Err(FetchError::ResponseTooLarge);
        }
        budget.total.charge(chunk.len() as u64)?;
        body.extend_from_slice(&chunk);
    }

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        err.to_string()
    }
}
