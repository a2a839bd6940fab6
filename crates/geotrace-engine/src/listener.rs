//! Listener registration and dispatch contexts.

use geotrace_core::{Hop, TraceError};
use std::sync::Arc;

/// Observer of route-discovery progress.
///
/// All methods have empty default bodies so implementors only override
/// what they care about. Exactly one of the terminal callbacks
/// ([`route_done`], [`route_timeout`], [`max_hops`], [`route_cancelled`],
/// [`error`]) fires per trace job.
///
/// [`route_done`]: Self::route_done
/// [`route_timeout`]: Self::route_timeout
/// [`max_hops`]: Self::max_hops
/// [`route_cancelled`]: Self::route_cancelled
/// [`error`]: Self::error
#[allow(unused_variables)]
pub trait RouteListener: Send + Sync {
    /// A new trace job started.
    fn new_route(&self, resolve_hostname: bool) {}

    /// A hop was appended to the route.
    fn route_point_added(&self, hop: &Hop) {}

    /// The newest hop should be brought into focus. Fires after
    /// [`route_point_added`](Self::route_point_added) has reached every
    /// listener for the same hop.
    fn focus_route(&self, hop: &Hop, is_tracing: bool, animate: bool) {}

    /// The destination answered and every hop was delivered.
    fn route_done(&self, elapsed_ms: u64, total_distance_km: f64) {}

    /// The watchdog cancelled the job.
    fn route_timeout(&self) {}

    /// The hop budget ran out before the destination answered.
    fn max_hops(&self) {}

    /// The caller cancelled the job.
    fn route_cancelled(&self) {}

    /// The job failed. `origin` names the operation that failed.
    fn error(&self, error: &TraceError, origin: &str) {}
}

/// Execution capability a listener is registered with.
///
/// The engine never inspects listener identity; whether a callback runs
/// inline on the dispatching task or is marshaled elsewhere is decided
/// entirely by the context supplied at registration time.
pub trait DispatchContext: Send + Sync {
    fn execute(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks directly on the dispatching task.
#[derive(Debug, Default)]
pub struct InlineDispatch;

impl DispatchContext for InlineDispatch {
    fn execute(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}

/// A listener paired with its dispatch context.
#[derive(Clone)]
pub struct Registration {
    pub listener: Arc<dyn RouteListener>,
    pub dispatch: Arc<dyn DispatchContext>,
}

impl Registration {
    pub fn inline(listener: Arc<dyn RouteListener>) -> Self {
        Self {
            listener,
            dispatch: Arc::new(InlineDispatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_inline_dispatch_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatch = InlineDispatch;
        let c = count.clone();
        dispatch.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_listener_methods_are_noops() {
        struct Silent;
        impl RouteListener for Silent {}
        let listener = Silent;
        listener.new_route(true);
        listener.route_timeout();
        listener.error(&TraceError::TruncatedOutput, "probe");
    }
}
