//! # Bifrost Bus - Channel-Addressed Message Bus
//!
//! In-process publish/subscribe over named channels, with request/response
//! correlation layered on top.
//!
//! ```text
//! ┌──────────────┐   publish()   ┌──────────────┐   deliver    ┌──────────────┐
//! │   Consumer   │ ────────────► │  Dispatcher  │ ───────────► │ Subscribers  │
//! └──────────────┘               └──────────────┘  (in order)  └──────────────┘
//!        │ request()                    ▲
//!        ▼                              │ timeout / failure
//! ┌──────────────┐                      │
//! │  Correlator  │ ─────────────────────┘
//! └──────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Ordered delivery:** subscribers of a channel see envelopes in publish
//!   order, in registration order.
//! - **Serialized handlers:** handlers never run concurrently; publishes from
//!   inside a handler are queued.
//! - **Immediate cutoff:** a closed subscription never receives another
//!   envelope, even one already being dispatched.
//! - **Exactly one response:** every request handler runs once, with the
//!   matching reply, a synthesized timeout or a transport failure. A
//!   cancelled request runs nothing.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod config;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod handler;
mod messaging;
pub mod monitor;
pub mod registry;

pub use bus::{ChannelLifecycle, EventBus, ListenerHandle, RequestOptions};
pub use config::{BusConfig, ConfigError, MAX_REQUEST_TIMEOUT};
pub use correlator::{PendingRequestInfo, ResponseCallback};
pub use error::BusError;
pub use handler::{ListenMode, MessageHandler};
pub use monitor::{MonitorError, MonitorEvent, MonitorStream, MonitorSubscription};
pub use registry::{ChannelInfo, EnvelopeFilter, SubscribeOptions, SubscriptionId};
