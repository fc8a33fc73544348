//! Agent Worker Pool: issues HTTP requests against `plan.endpoints`,
//! records latency and status codes, and adjusts active concurrency to
//! track a ramp-up target.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::errors::ErrorCategory;
use crate::metrics::{AGENT_ACTIVE_WORKERS, AGENT_ERRORS_TOTAL, AGENT_REQUESTS_TOTAL, AGENT_REQUEST_DURATION_SECONDS, AGENT_STATUS_CODES_TOTAL};
use crate::model::{AgentMetrics, Endpoint};
use crate::rate_limiter::RateLimiter;

/// Single-writer-per-agent metrics structure: mutated under `Mutex` by
/// whichever worker just completed a request, read by the telemetry
/// publisher.
#[derive(Default)]
pub struct MetricsState {
    pub requests: u64,
    pub errors: u64,
    pub latency_sum_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub status_codes: std::collections::HashMap<String, u64>,
}

impl MetricsState {
    fn record_success(&mut self, latency_ms: f64, status: u16) {
        self.requests += 1;
        self.latency_sum_ms += latency_ms;
        if self.requests == 1 {
            self.min_latency_ms = latency_ms;
            self.max_latency_ms = latency_ms;
        } else {
            if latency_ms < self.min_latency_ms {
                self.min_latency_ms = latency_ms;
            }
            if latency_ms > self.max_latency_ms {
                self.max_latency_ms = latency_ms;
            }
        }
        *self.status_codes.entry(status.to_string()).or_insert(0) += 1;
    }

    fn record_error(&mut self) {
        self.requests += 1;
        self.errors += 1;
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let successes = self.requests.saturating_sub(self.errors);
        if successes == 0 {
            0.0
        } else {
            self.latency_sum_ms / successes as f64
        }
    }

    pub fn to_metrics(&self, agent_id: &str) -> AgentMetrics {
        AgentMetrics {
            agent_id: agent_id.to_string(),
            timestamp: chrono::Utc::now(),
            requests: self.requests,
            errors: self.errors,
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: self.min_latency_ms,
            max_latency_ms: self.max_latency_ms,
            status_codes: self.status_codes.clone(),
        }
    }
}

pub struct WorkerPoolConfig {
    pub concurrency: u32,
    pub default_think_time: Duration,
    pub rate_limit: u32,
    pub keep_alive: bool,
    pub request_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            concurrency: 1,
            default_think_time: Duration::ZERO,
            rate_limit: 0,
            keep_alive: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs a bounded-duration worker pool against `endpoints`. `target` is
/// shared with an external ramp-up controller (see [`crate::agent`]) that
/// mutates it over time; workers whose index exceeds the current target
/// park briefly instead of consuming work.
pub struct WorkerPool {
    client: reqwest::Client,
    endpoints: Arc<Vec<Endpoint>>,
    rate_limiter: Arc<RateLimiter>,
    default_think_time: Duration,
    metrics: Arc<Mutex<MetricsState>>,
    /// Current target concurrency; updated externally during ramp-up.
    target: Arc<AtomicU32>,
    request_timeout: Duration,
}

impl WorkerPool {
    pub fn new(endpoints: Vec<Endpoint>, config: &WorkerPoolConfig) -> Result<Self, crate::errors::AppError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.concurrency as usize)
            .pool_idle_timeout(if config.keep_alive { Some(Duration::from_secs(30)) } else { Some(Duration::ZERO) })
            .build()
            .map_err(|e| crate::errors::AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(WorkerPool {
            client,
            endpoints: Arc::new(endpoints),
            rate_limiter: RateLimiter::new(config.rate_limit),
            default_think_time: config.default_think_time,
            metrics: Arc::new(Mutex::new(MetricsState::default())),
            target: Arc::new(AtomicU32::new(config.concurrency)),
            request_timeout: config.request_timeout,
        })
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsState>> {
        Arc::clone(&self.metrics)
    }

    pub fn target_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.target)
    }

    /// Drives `max_workers` logical workers for `duration` or until `stop`
    /// flips to `true`, whichever comes first. A single producer task feeds
    /// a bounded queue of depth `10 * max_workers` by round-robining through
    /// `endpoints`; workers dequeue from it. Workers observe the stop
    /// signal between requests, never mid-flight.
    pub async fn run(&self, max_workers: u32, duration: Duration, stop: tokio::sync::watch::Receiver<bool>) {
        if self.endpoints.is_empty() || max_workers == 0 {
            return;
        }

        let active_count = Arc::new(RwLock::new(0u32));
        let deadline = TokioInstant::now() + duration;
        let queue_depth = (max_workers as usize) * 10;
        let (tx, rx) = mpsc::channel::<Endpoint>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let producer = tokio::spawn(produce_requests(Arc::clone(&self.endpoints), tx, stop.clone(), deadline));

        let mut handles = Vec::with_capacity(max_workers as usize);

        for worker_index in 0..max_workers {
            let client = self.client.clone();
            let queue = Arc::clone(&rx);
            let rate_limiter = Arc::clone(&self.rate_limiter);
            let metrics = Arc::clone(&self.metrics);
            let target = Arc::clone(&self.target);
            let stop = stop.clone();
            let default_think_time = self.default_think_time;
            let request_timeout = self.request_timeout;
            let active_count = Arc::clone(&active_count);

            handles.push(tokio::spawn(async move {
                *active_count.write().await += 1;
                AGENT_ACTIVE_WORKERS.inc();
                run_worker(
                    worker_index,
                    client,
                    queue,
                    rate_limiter,
                    metrics,
                    target,
                    stop,
                    default_think_time,
                    request_timeout,
                    deadline,
                )
                .await;
                *active_count.write().await -= 1;
                AGENT_ACTIVE_WORKERS.dec();
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }

        if let Err(e) = producer.await {
            warn!(error = %e, "request producer task panicked");
        }
    }
}

/// Round-robins through `endpoints`, pushing one at a time into the bounded
/// queue until `deadline` or `stop` fires. Blocks on `tx.send` (applying
/// backpressure) once the queue is at its `10 * concurrency` capacity.
async fn produce_requests(
    endpoints: Arc<Vec<Endpoint>>,
    tx: mpsc::Sender<Endpoint>,
    mut stop: tokio::sync::watch::Receiver<bool>,
    deadline: TokioInstant,
) {
    let mut next_endpoint = 0usize;
    loop {
        if TokioInstant::now() >= deadline || *stop.borrow() {
            return;
        }

        let endpoint = endpoints[next_endpoint].clone();
        next_endpoint = (next_endpoint + 1) % endpoints.len();

        tokio::select! {
            result = tx.send(endpoint) => {
                if result.is_err() {
                    return;
                }
            }
            _ = stop.changed() => return,
            _ = tokio::time::sleep_until(deadline) => return,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_index: u32,
    client: reqwest::Client,
    queue: Arc<Mutex<mpsc::Receiver<Endpoint>>>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<Mutex<MetricsState>>,
    target: Arc<AtomicU32>,
    mut stop: tokio::sync::watch::Receiver<bool>,
    default_think_time: Duration,
    request_timeout: Duration,
    deadline: TokioInstant,
) {
    loop {
        if TokioInstant::now() >= deadline || *stop.borrow() {
            return;
        }

        if worker_index >= target.load(Ordering::Relaxed) {
            // Throttled below the ramp-up target: park briefly rather than
            // issuing work, per the worker-count-based throttle design.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                _ = stop.changed() => return,
            }
        }

        let endpoint = {
            let mut rx = queue.lock().await;
            tokio::select! {
                item = rx.recv() => match item {
                    Some(endpoint) => endpoint,
                    None => return,
                },
                _ = stop.changed() => return,
                _ = tokio::time::sleep_until(deadline) => return,
            }
        };

        rate_limiter.acquire().await;

        if TokioInstant::now() >= deadline || *stop.borrow() {
            return;
        }

        let (status, latency_ms) = execute_request(&client, &endpoint, request_timeout).await;

        {
            let mut m = metrics.lock().await;
            match status {
                Some(code) => m.record_success(latency_ms, code),
                None => m.record_error(),
            }
        }
        AGENT_REQUESTS_TOTAL.inc();
        match status {
            Some(code) => {
                AGENT_STATUS_CODES_TOTAL.with_label_values(&[&code.to_string()]).inc();
                AGENT_REQUEST_DURATION_SECONDS.observe(latency_ms / 1000.0);
            }
            None => AGENT_ERRORS_TOTAL.inc(),
        }

        if *stop.borrow() {
            return;
        }

        let think_time = effective_think_time(endpoint, default_think_time);
        if !think_time.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(think_time) => {}
                _ = stop.changed() => return,
            }
        }
    }
}

fn effective_think_time(endpoint: &Endpoint, default_think_time: Duration) -> Duration {
    endpoint
        .think_time
        .as_deref()
        .and_then(|s| crate::duration::parse_duration_string(s).ok())
        .unwrap_or(default_think_time)
}

/// Issues one HTTP request and returns `(status_code, latency_ms)`.
/// `status_code` is `None` on a transport-level error (recorded as an error,
/// no status bucket). Latency is measured from request start to full
/// response-body drain, per the documented open-question decision.
async fn execute_request(client: &reqwest::Client, endpoint: &Endpoint, _timeout: Duration) -> (Option<u16>, f64) {
    let start = Instant::now();

    let mut request = client.request(endpoint.method.as_reqwest(), &endpoint.url);
    for (name, value) in &endpoint.headers {
        request = request.header(name, value);
    }
    if !matches!(endpoint.method, crate::model::HttpMethod::Get) {
        if let Some(body) = &endpoint.body {
            request = request.json(body);
        }
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if let Some(category) = ErrorCategory::from_status_code(status) {
                debug!(url = %endpoint.url, status, ?category, "non-success response");
            }
            // Fully drain and close the body so the connection can be reused.
            let _ = response.bytes().await;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            (Some(status), latency_ms)
        }
        Err(e) => {
            let category = ErrorCategory::from_reqwest_error(&e);
            debug!(url = %endpoint.url, ?category, error = %e, "request failed");
            (None, start.elapsed().as_secs_f64() * 1000.0)
        }
    }
}

/// Small jitter helper used by the control loop when staggering heartbeats
/// across a fleet started at the same instant, avoiding thundering-herd
/// publishes on `armonite.agent.heartbeat`.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpMethod;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get_endpoint(url: String) -> Endpoint {
        Endpoint {
            method: HttpMethod::Get,
            url,
            headers: Default::default(),
            body: None,
            think_time: None,
        }
    }

    #[tokio::test]
    async fn records_successful_requests_with_latency_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let endpoint = get_endpoint(format!("{}/ok", server.uri()));
        let pool = WorkerPool::new(
            vec![endpoint],
            &WorkerPoolConfig {
                concurrency: 1,
                ..Default::default()
            },
        )
        .unwrap();

        let (_stop_tx, stop) = tokio::sync::watch::channel(false);
        pool.run(1, Duration::from_millis(300), stop).await;

        let metrics = pool.metrics();
        let m = metrics.lock().await;
        assert!(m.requests >= 1);
        assert_eq!(m.errors, 0);
        assert_eq!(m.status_codes.get("200").copied().unwrap_or(0), m.requests);
    }

    #[tokio::test]
    async fn records_transport_errors_without_status_code() {
        let endpoint = get_endpoint("http://127.0.0.1:1".to_string());
        let pool = WorkerPool::new(
            vec![endpoint],
            &WorkerPoolConfig {
                concurrency: 1,
                request_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .unwrap();

        let (_stop_tx, stop) = tokio::sync::watch::channel(false);
        pool.run(1, Duration::from_millis(300), stop).await;

        let m = pool.metrics();
        let m = m.lock().await;
        assert!(m.requests >= 1);
        assert_eq!(m.errors, m.requests);
        assert!(m.status_codes.is_empty());
    }

    #[tokio::test]
    async fn workers_above_target_do_not_consume_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let endpoint = get_endpoint(server.uri());
        let pool = WorkerPool::new(
            vec![endpoint],
            &WorkerPoolConfig {
                concurrency: 4,
                ..Default::default()
            },
        )
        .unwrap();
        pool.target_handle().store(0, Ordering::Relaxed);

        let (_stop_tx, stop) = tokio::sync::watch::channel(false);
        pool.run(4, Duration::from_millis(250), stop).await;

        let m = pool.metrics();
        let m = m.lock().await;
        assert_eq!(m.requests, 0);
    }

    #[tokio::test]
    async fn min_and_max_latency_bounds_extend_correctly() {
        let mut state = MetricsState::default();
        state.record_success(10.0, 200);
        state.record_success(5.0, 200);
        state.record_success(20.0, 200);
        assert_eq!(state.min_latency_ms, 5.0);
        assert_eq!(state.max_latency_ms, 20.0);
        assert_eq!(state.requests, 3);
    }

    #[test]
    fn effective_think_time_falls_back_to_default() {
        let endpoint = Endpoint {
            method: HttpMethod::Get,
            url: "http://example.com".into(),
            headers: Default::default(),
            body: None,
            think_time: Some("not-a-duration".into()),
        };
        let effective = effective_think_time(&endpoint, Duration::from_millis(200));
        assert_eq!(effective, Duration::from_millis(200));
    }
}
