//! Which metrics area is on screen, and the state around getting it there.
//!
//! Switching to a detail view is two-phase so the UI can run the fetch on
//! its own executor: [`ViewController::begin_switch`] hands out a
//! [`FetchTicket`], the caller fetches, and [`ViewController::complete`]
//! applies the result. The aggregate pull on sign-in and overview refresh
//! goes through the same gate. Only one ticket is outstanding at a time, and
//! tickets issued before a [`ViewController::teardown`] or
//! [`ViewController::reconfigure`] are ignored on completion.

use chrono::Utc;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::DashboardError;
use crate::history::{BufferLifetime, MetricHistory};
use crate::metrics::{MetricCategory, MetricsData};
use crate::transport::{ChannelEvent, MetricsApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum View {
    #[default]
    Overview,
    DetailCpu,
    DetailMemory,
    DetailThread,
}

impl View {
    pub const ALL: [View; 4] = [View::Overview, View::DetailCpu, View::DetailMemory, View::DetailThread];

    /// The category a detail view focuses on. `None` for the overview.
    pub fn category(&self) -> Option<MetricCategory> {
        match self {
            View::Overview => None,
            View::DetailCpu => Some(MetricCategory::Cpu),
            View::DetailMemory => Some(MetricCategory::Memory),
            View::DetailThread => Some(MetricCategory::Threads),
        }
    }

    pub fn detail(category: MetricCategory) -> View {
        match category {
            MetricCategory::Cpu => View::DetailCpu,
            MetricCategory::Memory => View::DetailMemory,
            MetricCategory::Threads => View::DetailThread,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            View::Overview => "Overview",
            View::DetailCpu => "CPU",
            View::DetailMemory => "Memory",
            View::DetailThread => "Threads",
        })
    }
}

/// The last failure shown to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub error: DashboardError,
    /// View the failed action was heading to, if it was a transition.
    pub during: Option<View>,
    /// Epoch ms.
    pub at: i64,
}

impl ErrorInfo {
    fn now(error: DashboardError, during: Option<View>) -> Self {
        Self { error, during, at: Utc::now().timestamp_millis() }
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

/// What a snapshot pull asks the backend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    /// Every category as one frame.
    All,
    Category(MetricCategory),
}

impl FetchScope {
    pub async fn fetch(self, api: &MetricsApi) -> Result<MetricsData, DashboardError> {
        match self {
            FetchScope::All => api.fetch_all().await,
            FetchScope::Category(category) => api.fetch_snapshot(category).await,
        }
    }
}

impl fmt::Display for FetchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchScope::All => f.write_str("metrics"),
            FetchScope::Category(category) => f.write_str(category.label()),
        }
    }
}

/// Permission to apply one snapshot result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    serial: u64,
    scope: FetchScope,
    target: Option<View>,
}

impl FetchTicket {
    pub fn scope(&self) -> FetchScope {
        self.scope
    }

    /// The view this fetch transitions to, or `None` for an in-place refresh.
    pub fn target(&self) -> Option<View> {
        self.target
    }
}

#[derive(Debug)]
pub struct ViewController {
    view: View,
    lifetime: BufferLifetime,
    detail_capacity: usize,
    /// Dashboard history. With `Persistent` every view reads this one.
    overview: MetricHistory,
    /// Detail-view history under `PerView`; `None` otherwise.
    detail: Option<MetricHistory>,
    connected: bool,
    in_flight: Option<FetchTicket>,
    last_error: Option<ErrorInfo>,
    last_update: Option<i64>,
    generation: u64,
    serial: u64,
}

impl ViewController {
    pub fn new(lifetime: BufferLifetime, dashboard_capacity: usize, detail_capacity: usize) -> Self {
        Self {
            view: View::Overview,
            lifetime,
            detail_capacity,
            overview: MetricHistory::new(dashboard_capacity),
            detail: None,
            connected: false,
            in_flight: None,
            last_error: None,
            last_update: None,
            generation: 0,
            serial: 0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.buffer_lifetime, settings.dashboard_buffer_size, settings.detail_buffer_size)
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn lifetime(&self) -> BufferLifetime {
        self.lifetime
    }

    /// History backing the current view.
    pub fn history(&self) -> &MetricHistory {
        self.detail.as_ref().unwrap_or(&self.overview)
    }

    /// History backing the combined dashboard.
    pub fn overview_history(&self) -> &MetricHistory {
        &self.overview
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// What the in-flight snapshot fetch is pulling, if anything.
    pub fn loading(&self) -> Option<FetchScope> {
        self.in_flight.map(|t| t.scope)
    }

    pub fn pending(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.last_error.as_ref()
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    pub fn last_update(&self) -> Option<i64> {
        self.last_update
    }

    /// Start a transition. The overview is entered at once and yields no
    /// ticket; a detail view needs its snapshot first.
    pub fn begin_switch(&mut self, view: View) -> Result<Option<FetchTicket>, DashboardError> {
        if self.in_flight.is_some() {
            debug!(%view, "switch rejected, a fetch is in flight");
            return Err(DashboardError::Busy);
        }
        let Some(category) = view.category() else {
            self.enter(View::Overview);
            return Ok(None);
        };
        Ok(Some(self.issue(FetchScope::Category(category), Some(view))))
    }

    /// Start an in-place snapshot fetch for the current view.
    pub fn begin_fetch(&mut self, category: MetricCategory) -> Result<FetchTicket, DashboardError> {
        if self.in_flight.is_some() {
            return Err(DashboardError::Busy);
        }
        Ok(self.issue(FetchScope::Category(category), None))
    }

    /// Start an aggregate pull of every category into the current buffers.
    pub fn begin_fetch_all(&mut self) -> Result<FetchTicket, DashboardError> {
        if self.in_flight.is_some() {
            return Err(DashboardError::Busy);
        }
        Ok(self.issue(FetchScope::All, None))
    }

    fn issue(&mut self, scope: FetchScope, target: Option<View>) -> FetchTicket {
        self.serial += 1;
        let ticket = FetchTicket { generation: self.generation, serial: self.serial, scope, target };
        self.in_flight = Some(ticket);
        ticket
    }

    /// Apply a fetch result. Returns false if the ticket is stale and the
    /// result was dropped.
    pub fn complete(&mut self, ticket: FetchTicket, result: Result<MetricsData, DashboardError>) -> bool {
        if ticket.generation != self.generation || self.in_flight != Some(ticket) {
            debug!(scope = %ticket.scope, "discarding stale snapshot result");
            return false;
        }
        self.in_flight = None;

        match result {
            Ok(data) => {
                if let Some(view) = ticket.target {
                    self.enter(view);
                }
                self.history_mut().ingest(&data);
                self.last_update = Some(data.timestamp);
                self.last_error = None;
            }
            Err(error) => {
                warn!(scope = %ticket.scope, %error, "snapshot fetch failed");
                self.last_error = Some(ErrorInfo::now(error, ticket.target));
            }
        }
        true
    }

    /// Fetch-and-switch in one call.
    pub async fn switch_to(&mut self, api: &MetricsApi, view: View) -> Result<(), DashboardError> {
        let Some(ticket) = self.begin_switch(view)? else {
            return Ok(());
        };
        let result = ticket.scope.fetch(api).await;
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
        self.complete(ticket, result);
        outcome
    }

    /// A frame arrived on the push feed.
    pub fn apply_push(&mut self, data: &MetricsData) {
        self.overview.ingest(data);
        if let Some(detail) = self.detail.as_mut() {
            detail.ingest(data);
        }
        self.last_update = Some(data.timestamp);
        self.last_error = None;
    }

    pub fn on_channel_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.connected = true,
            ChannelEvent::Disconnected { .. } | ChannelEvent::Reconnecting { .. } => self.connected = false,
            ChannelEvent::Failed { error } => {
                self.connected = false;
                self.last_error = Some(ErrorInfo::now(error.clone(), None));
            }
            ChannelEvent::ServerError { message } => {
                self.last_error = Some(ErrorInfo::now(DashboardError::Transport(message.clone()), None));
            }
        }
    }

    /// Drop all buffers and forget any in-flight fetch. Results of fetches
    /// issued before this call are discarded when they arrive.
    pub fn teardown(&mut self) {
        self.generation += 1;
        self.in_flight = None;
        self.view = View::Overview;
        self.overview.clear();
        self.detail = None;
        self.connected = false;
        self.last_error = None;
        self.last_update = None;
    }

    /// Rebuild the buffers for new settings, back on the overview. The link
    /// state is kept; an in-flight fetch is forgotten as on teardown.
    pub fn reconfigure(&mut self, settings: &Settings) {
        let mut next = Self::from_settings(settings);
        next.connected = self.connected;
        next.generation = self.generation + 1;
        next.serial = self.serial;
        *self = next;
    }

    fn enter(&mut self, view: View) {
        if view != self.view {
            info!(from = %self.view, to = %view, "view changed");
        }
        self.view = view;
        self.detail = match (self.lifetime, view) {
            (BufferLifetime::PerView, View::Overview) | (BufferLifetime::Persistent, _) => None,
            (BufferLifetime::PerView, _) => Some(MetricHistory::new(self.detail_capacity)),
        };
    }

    fn history_mut(&mut self) -> &mut MetricHistory {
        self.detail.as_mut().unwrap_or(&mut self.overview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuSample, MemorySample};

    fn cpu_frame(ts: i64, pct: f64) -> MetricsData {
        MetricsData {
            cpu: Some(CpuSample { system_pct: pct, timestamp: ts, ..Default::default() }),
            timestamp: ts,
            ..Default::default()
        }
    }

    fn mem_frame(ts: i64) -> MetricsData {
        MetricsData {
            memory: Some(MemorySample { used_mb: 1.0, max_mb: 2.0, percentage: 50.0, timestamp: ts, ..Default::default() }),
            timestamp: ts,
            ..Default::default()
        }
    }

    fn persistent() -> ViewController {
        ViewController::new(BufferLifetime::Persistent, 50, 60)
    }

    #[test]
    fn test_overview_is_immediate() {
        let mut vc = persistent();
        assert_eq!(vc.begin_switch(View::Overview).unwrap(), None);
        assert_eq!(vc.view(), View::Overview);
        assert!(!vc.is_busy());
    }

    #[test]
    fn test_detail_switch_applies_on_success() {
        let mut vc = persistent();
        let ticket = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        assert_eq!(vc.loading(), Some(FetchScope::Category(MetricCategory::Cpu)));
        assert_eq!(vc.view(), View::Overview);

        assert!(vc.complete(ticket, Ok(cpu_frame(10, 5.0))));
        assert_eq!(vc.view(), View::DetailCpu);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);
        assert_eq!(vc.last_update(), Some(10));
        assert!(vc.loading().is_none());
    }

    #[test]
    fn test_failed_switch_keeps_view() {
        let mut vc = persistent();
        let ticket = vc.begin_switch(View::DetailMemory).unwrap().unwrap();
        vc.complete(ticket, Err(DashboardError::http(403, None)));
        assert_eq!(vc.view(), View::Overview);
        let err = vc.last_error().unwrap();
        assert_eq!(err.during, Some(View::DetailMemory));
        assert_eq!(err.message(), "access denied");
        assert!(vc.history().is_empty());
    }

    #[test]
    fn test_second_request_rejected_while_in_flight() {
        let mut vc = persistent();
        let first = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        assert_eq!(vc.begin_switch(View::DetailMemory), Err(DashboardError::Busy));
        assert_eq!(vc.begin_switch(View::Overview), Err(DashboardError::Busy));
        assert_eq!(vc.begin_fetch(MetricCategory::Threads), Err(DashboardError::Busy));

        vc.complete(first, Ok(cpu_frame(1, 1.0)));
        assert_eq!(vc.view(), View::DetailCpu);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);
        assert_eq!(vc.history().len(MetricCategory::Memory), 0);
    }

    #[test]
    fn test_completing_twice_is_ignored() {
        let mut vc = persistent();
        let t = vc.begin_fetch(MetricCategory::Cpu).unwrap();
        assert!(vc.complete(t, Ok(cpu_frame(1, 1.0))));
        assert!(!vc.complete(t, Ok(cpu_frame(2, 2.0))));
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);
    }

    #[test]
    fn test_teardown_discards_in_flight_result() {
        let mut vc = persistent();
        vc.apply_push(&cpu_frame(1, 1.0));
        let ticket = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        vc.teardown();
        assert!(!vc.is_busy());
        assert!(!vc.complete(ticket, Ok(cpu_frame(2, 2.0))));
        assert_eq!(vc.view(), View::Overview);
        assert!(vc.history().is_empty());
        // a fresh ticket works after teardown
        let t = vc.begin_fetch(MetricCategory::Cpu).unwrap();
        assert!(vc.complete(t, Ok(cpu_frame(3, 3.0))));
    }

    #[test]
    fn test_persistent_history_survives_switches() {
        let mut vc = persistent();
        vc.apply_push(&cpu_frame(1, 1.0));
        let t = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        vc.complete(t, Ok(cpu_frame(2, 2.0)));
        vc.begin_switch(View::Overview).unwrap();
        assert_eq!(vc.history().len(MetricCategory::Cpu), 2);
        assert_eq!(vc.history().capacity(), 50);
    }

    #[test]
    fn test_per_view_history_is_recreated() {
        let mut vc = ViewController::new(BufferLifetime::PerView, 50, 60);
        vc.apply_push(&cpu_frame(1, 1.0));

        let t = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        vc.complete(t, Ok(cpu_frame(2, 2.0)));
        assert_eq!(vc.history().capacity(), 60);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);

        vc.apply_push(&mem_frame(3));
        assert_eq!(vc.history().len(MetricCategory::Memory), 1);
        assert_eq!(vc.overview_history().len(MetricCategory::Memory), 1);

        let t = vc.begin_switch(View::DetailMemory).unwrap().unwrap();
        vc.complete(t, Ok(mem_frame(4)));
        assert_eq!(vc.history().len(MetricCategory::Memory), 1);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 0);

        vc.begin_switch(View::Overview).unwrap();
        assert_eq!(vc.history().capacity(), 50);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);
    }

    #[test]
    fn test_push_clears_error_and_stamps_update() {
        let mut vc = persistent();
        let t = vc.begin_fetch(MetricCategory::Cpu).unwrap();
        vc.complete(t, Err(DashboardError::Network("cannot reach server".into())));
        assert!(vc.last_error().is_some());
        vc.apply_push(&cpu_frame(77, 1.0));
        assert!(vc.last_error().is_none());
        assert_eq!(vc.last_update(), Some(77));
    }

    #[test]
    fn test_aggregate_pull_shares_the_gate() {
        let mut vc = persistent();
        let all = vc.begin_fetch_all().unwrap();
        assert_eq!(vc.loading(), Some(FetchScope::All));
        assert_eq!(vc.begin_fetch_all(), Err(DashboardError::Busy));
        assert_eq!(vc.begin_fetch(MetricCategory::Cpu), Err(DashboardError::Busy));
        assert_eq!(vc.begin_switch(View::DetailCpu), Err(DashboardError::Busy));

        let mut frame = cpu_frame(5, 1.0);
        frame.memory = mem_frame(5).memory;
        assert!(vc.complete(all, Ok(frame)));
        assert_eq!(vc.view(), View::Overview);
        assert_eq!(vc.history().len(MetricCategory::Cpu), 1);
        assert_eq!(vc.history().len(MetricCategory::Memory), 1);

        let t = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        vc.complete(t, Ok(cpu_frame(10, 2.0)));
        // a duplicate of the aggregate result lands nowhere
        assert!(!vc.complete(all, Ok(cpu_frame(3, 3.0))));
        let stamps: Vec<i64> = vc.history().cpu().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![5, 10]);
    }

    #[test]
    fn test_reconfigure_retires_in_flight_ticket() {
        let mut vc = persistent();
        vc.on_channel_event(&ChannelEvent::Connected);
        vc.apply_push(&cpu_frame(1, 1.0));
        let old = vc.begin_switch(View::DetailCpu).unwrap().unwrap();

        let settings = Settings { buffer_lifetime: BufferLifetime::PerView, ..Settings::default() };
        vc.reconfigure(&settings);
        assert_eq!(vc.lifetime(), BufferLifetime::PerView);
        assert!(vc.is_connected());
        assert!(!vc.is_busy());
        assert!(vc.history().is_empty());

        let fresh = vc.begin_switch(View::DetailCpu).unwrap().unwrap();
        assert_ne!(old, fresh);
        assert!(!vc.complete(old, Ok(cpu_frame(2, 2.0))));
        assert!(vc.is_busy());
        assert!(vc.complete(fresh, Ok(cpu_frame(3, 3.0))));
        let stamps: Vec<i64> = vc.history().cpu().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![3]);
    }

    #[test]
    fn test_channel_events() {
        let mut vc = persistent();
        vc.on_channel_event(&ChannelEvent::Connected);
        assert!(vc.is_connected());
        vc.on_channel_event(&ChannelEvent::Reconnecting {
            attempt: 1,
            max: 5,
            delay: std::time::Duration::from_millis(3000),
        });
        assert!(!vc.is_connected());
        vc.on_channel_event(&ChannelEvent::Failed { error: DashboardError::Transport("gone".into()) });
        assert!(!vc.is_connected());
        assert_eq!(vc.last_error().unwrap().error, DashboardError::Transport("gone".into()));
    }
}
