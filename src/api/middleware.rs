//! Access control for the HTTP API: bearer-token auth and per-client rate limits.
//!
//! Both are off for a local server. Setting `MANIFEST_LOG_API_KEY` turns on
//! auth and, unless `MANIFEST_LOG_RATE_LIMIT=0`, rate limiting.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub const API_KEY_ENV: &str = "MANIFEST_LOG_API_KEY";
pub const CORS_ORIGINS_ENV: &str = "MANIFEST_LOG_CORS_ORIGINS";
pub const RATE_LIMIT_ENV: &str = "MANIFEST_LOG_RATE_LIMIT";

/// Requests per client per [`RATE_WINDOW`] when the limit is not configured.
pub const DEFAULT_RATE_LIMIT: u32 = 100;
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub api_key: Option<String>,
    /// `None` means any origin may call the API.
    pub cors_origins: Option<Vec<String>>,
    pub rate_limiter: Option<RateLimiter>,
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var(API_KEY_ENV);
        let cors_origins = var(CORS_ORIGINS_ENV).map(|origins| {
            origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect()
        });

        let limit = match var(RATE_LIMIT_ENV).map(|v| v.trim().parse::<u32>()) {
            Some(Ok(limit)) => limit,
            Some(Err(_)) => {
                tracing::warn!("{} is not a number, using {}", RATE_LIMIT_ENV, DEFAULT_RATE_LIMIT);
                DEFAULT_RATE_LIMIT
            }
            None => DEFAULT_RATE_LIMIT,
        };
        let rate_limiter = (api_key.is_some() && limit > 0)
            .then(|| RateLimiter::new(limit, RATE_WINDOW));

        Self {
            api_key,
            cors_origins,
            rate_limiter,
        }
    }

    pub fn disabled() -> Self {
        Self {
            api_key: None,
            cors_origins: None,
            rate_limiter: None,
        }
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..Self::disabled()
        }
    }

    pub fn with_rate_limit(max_requests: u32) -> Self {
        Self {
            rate_limiter: Some(RateLimiter::new(max_requests, RATE_WINDOW)),
            ..Self::disabled()
        }
    }
}

/// Sliding-window request counter per client address.
///
/// Clients with no request inside the window are dropped on every check, so
/// the table only holds clients that are currently active.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests as usize,
            window,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a request from `client` and report whether it is within the limit.
    pub fn check(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        clients.retain(|_, hits| {
            while hits
                .front()
                .is_some_and(|&hit| now.duration_since(hit) >= self.window)
            {
                hits.pop_front();
            }
            !hits.is_empty()
        });

        let hits = clients.entry(client).or_default();
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Number of clients with requests inside the current window.
    pub fn tracked_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn window(&self) -> Duration {
        self.window
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = config.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = bearer_token(request.headers()).map(|token| token == expected);
    if presented == Some(true) {
        return next.run(request).await;
    }

    tracing::warn!(
        path = %request.uri().path(),
        token_present = presented.is_some(),
        "Rejected request without a valid API key"
    );
    (StatusCode::UNAUTHORIZED, "API key required or invalid").into_response()
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = client_addr(&request);
    if limiter.check(client) {
        return next.run(request).await;
    }

    tracing::warn!(client = %client, "Rate limit exceeded");
    let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from(limiter.window().as_secs()),
    );
    response
}

/// The address a request is attributed to: the first proxy-reported hop,
/// then the socket peer, then loopback.
fn client_addr(request: &Request<Body>) -> IpAddr {
    let headers = request.headers();
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok());
    let real_ip = || {
        headers
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };
    let peer = || {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };

    forwarded
        .or_else(real_ip)
        .or_else(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
