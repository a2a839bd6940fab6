//! Route-discovery engine: orchestrates probe strategies, geographic
//! enrichment, and ordered listener notification.

pub mod engine;
pub mod listener;
pub mod pipeline;
pub mod resolve;

pub use engine::{ChannelFactory, RouteEngine, TraceJob};
pub use listener::{DispatchContext, InlineDispatch, Registration, RouteListener};
pub use pipeline::NotificationPipeline;
pub use resolve::HickoryDnsResolver;
