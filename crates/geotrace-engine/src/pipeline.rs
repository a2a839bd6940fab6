//! Ordered hop-notification delivery.
//!
//! A single consumer task drains a FIFO queue fed by the engine's hop
//! sink. For each dequeued hop it invokes every listener's
//! `route_point_added`, then every listener's `focus_route`, each inside
//! that listener's own dispatch context. A delivered counter lets the
//! engine wait until listeners have observed every hop before the
//! terminal event fires.

use crate::listener::Registration;
use geotrace_core::Hop;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::trace;

pub struct NotificationPipeline {
    tx: mpsc::UnboundedSender<Hop>,
    enqueued: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    drained: Arc<Notify>,
}

impl NotificationPipeline {
    /// Spawns the consumer task; must be called inside a Tokio runtime.
    ///
    /// The consumer ends when the pipeline is dropped; hops still queued
    /// at that point are discarded without redelivery.
    pub fn new(listeners: Arc<RwLock<Vec<Registration>>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Hop>();
        let enqueued = Arc::new(AtomicU64::new(0));
        let delivered = Arc::new(AtomicU64::new(0));
        let drained = Arc::new(Notify::new());

        let consumer_delivered = delivered.clone();
        let consumer_drained = drained.clone();
        tokio::spawn(async move {
            while let Some(hop) = rx.recv().await {
                trace!(hop = hop.number, "Dispatching hop notification");
                let registrations: Vec<Registration> =
                    listeners.read().iter().cloned().collect();
                for reg in &registrations {
                    let listener = reg.listener.clone();
                    let hop = hop.clone();
                    reg.dispatch
                        .execute(Box::new(move || listener.route_point_added(&hop)));
                }
                for reg in &registrations {
                    let listener = reg.listener.clone();
                    let hop = hop.clone();
                    reg.dispatch
                        .execute(Box::new(move || listener.focus_route(&hop, true, true)));
                }
                consumer_delivered.fetch_add(1, Ordering::SeqCst);
                consumer_drained.notify_waiters();
            }
        });

        Self {
            tx,
            enqueued,
            delivered,
            drained,
        }
    }

    /// Queues a hop for delivery. Returns immediately.
    pub fn enqueue(&self, hop: Hop) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(hop);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Completes once every hop enqueued so far has been delivered.
    pub async fn wait_for_drain(&self) {
        loop {
            // Register for the notification before re-checking so a
            // delivery between the check and the await is not missed.
            let notified = self.drained.notified();
            if self.delivered.load(Ordering::SeqCst) >= self.enqueued.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::RouteListener;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl RouteListener for Recorder {
        fn route_point_added(&self, hop: &Hop) {
            self.calls.lock().push(("added".to_string(), hop.number));
        }
        fn focus_route(&self, hop: &Hop, _is_tracing: bool, _animate: bool) {
            self.calls.lock().push(("focus".to_string(), hop.number));
        }
    }

    fn hop(number: u32) -> Hop {
        Hop {
            number,
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, number as u8)),
            hostname: None,
            latency_ms: 1,
            dns_lookup_ms: None,
            distance_to_previous_km: 0.0,
            geo: geotrace_core::GeoPoint::default(),
            synthetic_unknown: false,
        }
    }

    #[tokio::test]
    async fn test_hops_delivered_in_order_added_before_focus() {
        let recorder = Arc::new(Recorder::default());
        let listeners = Arc::new(RwLock::new(vec![Registration::inline(
            recorder.clone() as Arc<dyn RouteListener>
        )]));
        let pipeline = NotificationPipeline::new(listeners);

        for n in 1..=3 {
            pipeline.enqueue(hop(n));
        }
        pipeline.wait_for_drain().await;

        let calls = recorder.calls.lock();
        assert_eq!(
            *calls,
            vec![
                ("added".to_string(), 1),
                ("focus".to_string(), 1),
                ("added".to_string(), 2),
                ("focus".to_string(), 2),
                ("added".to_string(), 3),
                ("focus".to_string(), 3),
            ]
        );
        assert_eq!(pipeline.delivered(), 3);
    }

    #[tokio::test]
    async fn test_drain_with_empty_queue_returns_immediately() {
        let listeners = Arc::new(RwLock::new(Vec::new()));
        let pipeline = NotificationPipeline::new(listeners);
        pipeline.wait_for_drain().await;
        assert_eq!(pipeline.delivered(), 0);
    }

    #[tokio::test]
    async fn test_both_passes_reach_every_listener() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let listeners = Arc::new(RwLock::new(vec![
            Registration::inline(first.clone() as Arc<dyn RouteListener>),
            Registration::inline(second.clone() as Arc<dyn RouteListener>),
        ]));
        let pipeline = NotificationPipeline::new(listeners);

        pipeline.enqueue(hop(1));
        pipeline.wait_for_drain().await;

        assert_eq!(first.calls.lock().len(), 2);
        assert_eq!(second.calls.lock().len(), 2);
    }
}
