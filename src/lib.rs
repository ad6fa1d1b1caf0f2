//! Vigil: a desktop client for a remote JVM metrics backend.
//!
//! The core (session, transport, normalizer, history, controller) carries no
//! UI dependency beyond the shared palette types, so it can be driven from
//! tests or another front end. [`ui::Vigil`] is the iced shell on top.

pub mod chart;
pub mod config;
pub mod controller;
pub mod error;
pub mod gauge;
pub mod history;
pub mod metrics;
pub mod ringbuf;
pub mod session;
pub mod theme;
pub mod transport;
pub mod ui;

pub use config::Settings;
pub use controller::{View, ViewController};
pub use error::DashboardError;
pub use metrics::{MetricCategory, MetricsData};
pub use session::{Session, SessionStore};
