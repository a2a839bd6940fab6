//! Trace job orchestration.
//!
//! [`RouteEngine`] runs at most one trace at a time. `compute` waits on a
//! one-permit job guard, resets the route state, and spawns the job task;
//! the permit travels with the task and is released when it finishes, so
//! a second `compute` call waits until the prior job has fully completed,
//! pending-notification drain included.

use crate::listener::{DispatchContext, Registration, RouteListener};
use crate::pipeline::NotificationPipeline;
use async_trait::async_trait;
use geotrace_channel::ProbeChannel;
use geotrace_core::{
    normalize_destination, CancellationMonitor, DnsResolver, EngineConfig, GeoEnricher,
    GeoPoint, HistoryStore, Hop, HopSink, ProbeOutcome, ProbeStrategy, RouteReport,
    TraceError, TraceSpec,
};
use geotrace_os::OsProcessProbe;
use geotrace_raw::RawProbe;
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builds a probe channel bound to the given IPv4 target.
pub type ChannelFactory =
    Arc<dyn Fn(Ipv4Addr) -> Result<Box<dyn ProbeChannel>, TraceError> + Send + Sync>;

/// Handle to a running trace job.
#[derive(Debug)]
pub struct TraceJob {
    pub id: String,
    monitor: CancellationMonitor,
    handle: JoinHandle<()>,
}

impl TraceJob {
    pub fn monitor(&self) -> &CancellationMonitor {
        &self.monitor
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    /// Waits for the job task to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }
}

#[derive(Default)]
struct JobState {
    id: String,
    destination: String,
    resolved_ip: Option<IpAddr>,
    source_geo: GeoPoint,
    hops: Vec<Hop>,
    started: Option<Instant>,
    elapsed_ms: u64,
}

pub struct RouteEngine {
    config: EngineConfig,
    geo: Arc<dyn GeoEnricher>,
    dns: Arc<dyn DnsResolver>,
    history: Option<Arc<dyn HistoryStore>>,
    listeners: Arc<RwLock<Vec<Registration>>>,
    pipeline: Arc<NotificationPipeline>,
    guard: Arc<Semaphore>,
    job: Arc<RwLock<JobState>>,
    channel_factory: ChannelFactory,
}

impl RouteEngine {
    /// Creates an engine; must be called inside a Tokio runtime (the
    /// notification consumer is spawned immediately).
    pub fn new(
        config: EngineConfig,
        geo: Arc<dyn GeoEnricher>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        let listeners: Arc<RwLock<Vec<Registration>>> = Arc::new(RwLock::new(Vec::new()));
        let pipeline = Arc::new(NotificationPipeline::new(listeners.clone()));
        Self {
            config,
            geo,
            dns,
            history: None,
            listeners,
            pipeline,
            guard: Arc::new(Semaphore::new(1)),
            job: Arc::new(RwLock::new(JobState::default())),
            channel_factory: default_channel_factory(),
        }
    }

    pub fn set_history(&mut self, history: Arc<dyn HistoryStore>) {
        self.history = Some(history);
    }

    /// Replaces how raw probe channels are opened; used by embedders and
    /// tests that probe over something other than a live raw socket.
    pub fn set_channel_factory(&mut self, factory: ChannelFactory) {
        self.channel_factory = factory;
    }

    /// Registers a listener whose callbacks run inline on the
    /// dispatching task.
    pub fn add_listener(&self, listener: Arc<dyn RouteListener>) {
        self.listeners.write().push(Registration::inline(listener));
    }

    /// Registers a listener with its own dispatch context.
    pub fn add_listener_with(
        &self,
        listener: Arc<dyn RouteListener>,
        dispatch: Arc<dyn DispatchContext>,
    ) {
        self.listeners.write().push(Registration {
            listener,
            dispatch,
        });
    }

    /// Starts a trace job. Waits until any previous job has fully
    /// completed, then runs this one in the background; progress and the
    /// terminal event arrive through the registered listeners.
    pub async fn compute(
        &self,
        mut spec: TraceSpec,
        monitor: CancellationMonitor,
    ) -> Result<TraceJob, TraceError> {
        if spec.max_hops == 0 {
            spec.max_hops = self.config.default_max_hops;
        }
        spec.validate()?;

        let permit = self
            .guard
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TraceError::Internal(format!("Job guard closed: {e}")))?;

        let destination = normalize_destination(&spec.destination);
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.job.write();
            *state = JobState {
                id: id.clone(),
                destination: destination.clone(),
                source_geo: self.geo.local_public(),
                ..JobState::default()
            };
        }

        let ctx = JobContext {
            config: self.config.clone(),
            geo: self.geo.clone(),
            dns: self.dns.clone(),
            history: self.history.clone(),
            listeners: self.listeners.clone(),
            pipeline: self.pipeline.clone(),
            job: self.job.clone(),
            channel_factory: self.channel_factory.clone(),
        };
        let job_monitor = monitor.clone();
        let handle = tokio::spawn(async move {
            ctx.run(spec, destination, job_monitor).await;
            drop(permit);
        });

        Ok(TraceJob {
            id,
            monitor,
            handle,
        })
    }

    /// Snapshot of the current route.
    pub fn snapshot(&self) -> Vec<Hop> {
        self.job.read().hops.clone()
    }

    /// Report over the current route state.
    pub fn report(&self) -> RouteReport {
        let state = self.job.read();
        let elapsed_ms = if state.elapsed_ms > 0 {
            state.elapsed_ms
        } else {
            state
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0)
        };
        RouteReport {
            job_id: state.id.clone(),
            destination: state.destination.clone(),
            resolved_ip: state.resolved_ip,
            elapsed_ms,
            total_distance_km: state
                .hops
                .iter()
                .map(|h| h.distance_to_previous_km)
                .sum(),
            hops: state.hops.clone(),
        }
    }

    pub fn to_csv(&self) -> String {
        self.report().to_csv()
    }

    pub fn to_text(&self) -> String {
        self.report().to_text()
    }
}

/// Everything a running job needs, detached from the engine's lifetime.
struct JobContext {
    config: EngineConfig,
    geo: Arc<dyn GeoEnricher>,
    dns: Arc<dyn DnsResolver>,
    history: Option<Arc<dyn HistoryStore>>,
    listeners: Arc<RwLock<Vec<Registration>>>,
    pipeline: Arc<NotificationPipeline>,
    job: Arc<RwLock<JobState>>,
    channel_factory: ChannelFactory,
}

impl JobContext {
    async fn run(&self, spec: TraceSpec, destination: String, monitor: CancellationMonitor) {
        info!(destination = %destination, max_hops = spec.max_hops, "Trace job starting");
        self.job.write().started = Some(Instant::now());
        self.broadcast({
            let resolve_hostname = spec.resolve_hostname;
            move |l| l.new_route(resolve_hostname)
        });

        let watchdog = spec.timeout.map(|timeout| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                debug!("Watchdog fired");
                monitor.mark_timed_out();
            })
        });

        let outcome = self.probe(&spec, &destination, &monitor).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }

        // Listeners must observe every hop before the terminal event.
        self.pipeline.wait_for_drain().await;

        let elapsed_ms = {
            let mut state = self.job.write();
            let elapsed = state
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0);
            state.elapsed_ms = elapsed;
            elapsed
        };

        match outcome {
            Ok(ProbeOutcome::Completed) => {
                let total_km: f64 = {
                    let state = self.job.read();
                    state.hops.iter().map(|h| h.distance_to_previous_km).sum()
                };
                info!(elapsed_ms, total_km, "Trace complete");
                if let Some(history) = &self.history {
                    history.record(&destination);
                }
                self.broadcast(move |l| l.route_done(elapsed_ms, total_km));
            }
            Ok(ProbeOutcome::Cancelled) => {
                if monitor.timed_out() {
                    info!(elapsed_ms, "Trace timed out");
                    self.broadcast(|l| l.route_timeout());
                } else {
                    info!(elapsed_ms, "Trace cancelled");
                    self.broadcast(|l| l.route_cancelled());
                }
            }
            Ok(ProbeOutcome::MaxHopsExceeded) => {
                info!(elapsed_ms, "Hop budget exhausted");
                self.broadcast(|l| l.max_hops());
            }
            Err((origin, e)) => {
                warn!(origin, error = %e, "Trace failed");
                let err = Arc::new(e);
                self.broadcast(move |l| l.error(&err, origin));
            }
        }
    }

    async fn probe(
        &self,
        spec: &TraceSpec,
        destination: &str,
        monitor: &CancellationMonitor,
    ) -> Result<ProbeOutcome, (&'static str, TraceError)> {
        let resolved = match destination.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => self
                .dns
                .resolve(destination, spec.ipv4)
                .await
                .map_err(|e| ("resolve", e))?,
        };
        self.job.write().resolved_ip = Some(resolved);
        debug!(destination = %destination, resolved = %resolved, "Destination resolved");

        let mut strategy = self
            .select_strategy(spec, destination, resolved)
            .map_err(|e| ("probe", e))?;

        let sink = JobSink {
            geo: self.geo.clone(),
            job: self.job.clone(),
            pipeline: self.pipeline.clone(),
        };
        strategy
            .run(&sink, monitor)
            .await
            .map_err(|e| ("probe", e))
    }

    /// The embedded prober handles IPv4 only; everything else goes
    /// through the OS traceroute process.
    fn select_strategy(
        &self,
        spec: &TraceSpec,
        destination: &str,
        resolved: IpAddr,
    ) -> Result<Box<dyn ProbeStrategy>, TraceError> {
        let use_os = spec.use_os_probe
            || self.config.prefer_os_probe
            || !spec.ipv4
            || !resolved.is_ipv4();
        if use_os {
            debug!("Using OS process probe");
            return Ok(Box::new(OsProcessProbe::new(
                self.config.host_os,
                destination.to_string(),
                resolved,
                spec.max_hops,
                spec.resolve_hostname,
                spec.ipv4,
            )));
        }

        let IpAddr::V4(target) = resolved else {
            return Err(TraceError::Internal(
                "IPv4 strategy selected for a non-IPv4 target".to_string(),
            ));
        };
        debug!(target = %target, "Using embedded raw probe");
        let channel = (self.channel_factory)(target)?;
        Ok(Box::new(RawProbe::new(
            channel,
            spec.max_hops,
            spec.resolve_hostname,
            Some(self.dns.clone()),
        )))
    }

    fn broadcast<F>(&self, f: F)
    where
        F: Fn(&dyn RouteListener) + Send + Clone + 'static,
    {
        for reg in self.listeners.read().iter() {
            let listener = reg.listener.clone();
            let f = f.clone();
            reg.dispatch
                .execute(Box::new(move || f(listener.as_ref())));
        }
    }
}

/// Hop sink for the active job: enriches, numbers, and appends each hop,
/// then queues it for listener delivery.
struct JobSink {
    geo: Arc<dyn GeoEnricher>,
    job: Arc<RwLock<JobState>>,
    pipeline: Arc<NotificationPipeline>,
}

#[async_trait]
impl HopSink for JobSink {
    async fn add_point(
        &self,
        ip: IpAddr,
        hostname: Option<String>,
        latency_ms: u32,
        dns_lookup_ms: Option<u32>,
    ) -> Hop {
        // Private and loopback addresses have no public location; they
        // stand where the local host's public address does.
        let located = if is_local_address(ip) {
            self.geo.local_public()
        } else {
            self.geo.resolve(ip)
        };

        let mut state = self.job.write();
        let geo = if located.unknown {
            // An unlocatable hop inherits its predecessor's position so
            // distance accumulation stays continuous.
            state
                .hops
                .last()
                .map(|h| h.geo.clone())
                .unwrap_or_else(|| state.source_geo.clone())
        } else {
            located
        };

        let mut hop = Hop {
            number: state.hops.len() as u32 + 1,
            ip,
            hostname,
            latency_ms,
            dns_lookup_ms,
            distance_to_previous_km: 0.0,
            geo,
            synthetic_unknown: false,
        };
        if let Some(previous) = state.hops.last() {
            hop.distance_to_previous_km = hop.distance_from(previous);
        }
        state.hops.push(hop.clone());
        drop(state);

        self.pipeline.enqueue(hop.clone());
        hop
    }

    async fn add_unknown_point(&self) -> Hop {
        let mut state = self.job.write();
        let previous = state.hops.last().cloned();
        let hop = Hop {
            number: state.hops.len() as u32 + 1,
            ip: previous
                .as_ref()
                .map(|h| h.ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            hostname: None,
            latency_ms: 0,
            dns_lookup_ms: None,
            distance_to_previous_km: 0.0,
            geo: previous
                .map(|h| h.geo)
                .unwrap_or_else(|| state.source_geo.clone()),
            synthetic_unknown: true,
        };
        state.hops.push(hop.clone());
        drop(state);

        self.pipeline.enqueue(hop.clone());
        hop
    }
}

fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        // fc00::/7 unique-local plus loopback.
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(unix)]
fn default_channel_factory() -> ChannelFactory {
    use geotrace_channel::RawIcmpChannel;
    use std::time::Duration;
    Arc::new(|target| {
        let channel = RawIcmpChannel::open(target, Duration::from_millis(1))?;
        Ok(Box::new(channel) as Box<dyn ProbeChannel>)
    })
}

#[cfg(not(unix))]
fn default_channel_factory() -> ChannelFactory {
    Arc::new(|_| {
        Err(TraceError::Internal(
            "No embedded probe channel on this platform".to_string(),
        ))
    })
}
