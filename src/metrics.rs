//! Canonical metric records and the normalizer that produces them.
//!
//! Payloads from the backend are loosely typed: numbers may arrive as strings,
//! optional fields may be absent or `null`, and timestamps may be missing.
//! Normalization never fails. Anything that cannot be read is zero-filled and
//! reported as a [`Degradation`] so callers can log it without interrupting
//! the live feed.

use chrono::Utc;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// The metric families the backend exposes individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricCategory {
    Cpu,
    Memory,
    Threads,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 3] = [MetricCategory::Cpu, MetricCategory::Memory, MetricCategory::Threads];

    /// Path segment of the category's REST endpoint.
    pub fn path(&self) -> &'static str {
        match self {
            MetricCategory::Cpu => "cpu",
            MetricCategory::Memory => "memory",
            MetricCategory::Threads => "threads",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MetricCategory::Cpu => "CPU",
            MetricCategory::Memory => "Memory",
            MetricCategory::Threads => "Threads",
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Anything carrying an epoch-millisecond timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuSample {
    pub system_pct: f64,
    pub process_pct: f64,
    pub cores: Option<u32>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemorySample {
    pub used_mb: f64,
    pub max_mb: f64,
    pub committed_mb: Option<f64>,
    pub percentage: f64,
    pub heap_used_mb: Option<f64>,
    pub non_heap_used_mb: Option<f64>,
    pub timestamp: i64,
}

impl MemorySample {
    pub fn free_mb(&self) -> f64 {
        (self.max_mb - self.used_mb).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadSample {
    pub live: u32,
    pub daemon: u32,
    pub peak: u32,
    pub timestamp: i64,
}

impl ThreadSample {
    /// Live threads that are not daemons.
    pub fn user_threads(&self) -> u32 {
        self.live.saturating_sub(self.daemon)
    }

    /// Share of live threads that are daemons, in percent.
    pub fn daemon_pct(&self) -> f64 {
        ratio_pct(self.daemon, self.live)
    }

    /// Current live count relative to the recorded peak, in percent.
    pub fn peak_utilization_pct(&self) -> f64 {
        ratio_pct(self.live, self.peak)
    }
}

fn ratio_pct(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Static description of the monitored host. Memory figures are in MB.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemInfo {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub available_processors: u32,
    pub jvm_total_memory_mb: f64,
    pub jvm_free_memory_mb: f64,
    pub jvm_max_memory_mb: f64,
}

/// One frame of the live feed, or one pulled snapshot.
///
/// A pulled single-category snapshot populates only that category.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricsData {
    pub cpu: Option<CpuSample>,
    pub memory: Option<MemorySample>,
    pub threads: Option<ThreadSample>,
    pub system: Option<SystemInfo>,
    pub timestamp: i64,
}

impl MetricsData {
    pub fn has(&self, category: MetricCategory) -> bool {
        match category {
            MetricCategory::Cpu => self.cpu.is_some(),
            MetricCategory::Memory => self.memory.is_some(),
            MetricCategory::Threads => self.threads.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.threads.is_none() && self.system.is_none()
    }
}

impl Timestamped for CpuSample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for MemorySample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for ThreadSample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

// ─── DEGRADATION ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    Missing,
    NotNumeric,
    NonFinite,
    Negative,
    NotAnObject,
}

/// A field that could not be read and was zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub field: String,
    pub reason: DegradeReason,
}

/// A normalized value plus the list of fields that fell back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub degraded: Vec<Degradation>,
}

impl<T> Normalized<T> {
    pub fn is_clean(&self) -> bool {
        self.degraded.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }

    fn logged(self, what: &str) -> Self {
        if !self.degraded.is_empty() {
            let fields: Vec<&str> = self.degraded.iter().map(|d| d.field.as_str()).collect();
            debug!(payload = what, ?fields, "metrics payload degraded to defaults");
        }
        self
    }
}

// ─── NORMALIZER ─────────────────────────────────────────────────

/// Converts raw JSON payloads into canonical records.
///
/// Timestamps assigned on receipt never go backwards, even if the wall clock
/// does, so consecutive samples without a source timestamp stay ordered.
#[derive(Debug, Default)]
pub struct Normalizer {
    last_assigned: AtomicI64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receipt time in epoch milliseconds, monotonic non-decreasing.
    pub fn now_ms(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self.last_assigned.fetch_max(now, Ordering::Relaxed);
        prev.max(now)
    }

    /// Parse a push-channel body. Returns `None` when the body is not JSON at all.
    pub fn parse_frame(&self, body: &str) -> Option<Normalized<MetricsData>> {
        match serde_json::from_str::<Value>(body) {
            Ok(raw) => Some(self.frame(&raw)),
            Err(e) => {
                warn!(error = %e, "dropping push body that is not JSON");
                None
            }
        }
    }

    /// Normalize a whole frame (`{cpu, memory, threads, system, timestamp}`).
    ///
    /// Categories are present in the result only if the payload carried an
    /// object for them.
    pub fn frame(&self, raw: &Value) -> Normalized<MetricsData> {
        let mut degraded = Vec::new();
        let Some(obj) = raw.as_object() else {
            degraded.push(Degradation { field: "frame".into(), reason: DegradeReason::NotAnObject });
            return Normalized {
                value: MetricsData { timestamp: self.now_ms(), ..Default::default() },
                degraded,
            }
            .logged("frame");
        };

        let timestamp = read_timestamp(obj.get("timestamp")).unwrap_or_else(|| self.now_ms());
        let mut data = MetricsData { timestamp, ..Default::default() };

        if let Some(cpu) = section(obj, "cpu", &mut degraded) {
            data.cpu = Some(cpu_from(cpu, timestamp, &mut degraded));
        }
        if let Some(mem) = section(obj, "memory", &mut degraded) {
            data.memory = Some(memory_from(mem, timestamp, &mut degraded));
        }
        if let Some(threads) = section(obj, "threads", &mut degraded) {
            data.threads = Some(threads_from(threads, timestamp, &mut degraded));
        }
        if let Some(system) = section(obj, "system", &mut degraded) {
            data.system = Some(system_from(system, &mut degraded));
        }

        Normalized { value: data, degraded }.logged("frame")
    }

    /// Normalize a single-category snapshot body into a frame carrying only
    /// that category.
    pub fn category(&self, category: MetricCategory, raw: &Value) -> Normalized<MetricsData> {
        let mut degraded = Vec::new();
        let empty = Map::new();
        let obj = match raw.as_object() {
            Some(obj) => obj,
            None => {
                degraded.push(Degradation { field: category.path().into(), reason: DegradeReason::NotAnObject });
                &empty
            }
        };
        let timestamp = read_timestamp(obj.get("timestamp")).unwrap_or_else(|| self.now_ms());
        let mut data = MetricsData { timestamp, ..Default::default() };
        match category {
            MetricCategory::Cpu => data.cpu = Some(cpu_from(obj, timestamp, &mut degraded)),
            MetricCategory::Memory => data.memory = Some(memory_from(obj, timestamp, &mut degraded)),
            MetricCategory::Threads => data.threads = Some(threads_from(obj, timestamp, &mut degraded)),
        }
        Normalized { value: data, degraded }.logged(category.path())
    }

    pub fn cpu(&self, raw: &Value) -> Normalized<CpuSample> {
        let n = self.category(MetricCategory::Cpu, raw);
        Normalized { value: n.value.cpu.unwrap_or_default(), degraded: n.degraded }
    }

    pub fn memory(&self, raw: &Value) -> Normalized<MemorySample> {
        let n = self.category(MetricCategory::Memory, raw);
        Normalized { value: n.value.memory.unwrap_or_default(), degraded: n.degraded }
    }

    pub fn threads(&self, raw: &Value) -> Normalized<ThreadSample> {
        let n = self.category(MetricCategory::Threads, raw);
        Normalized { value: n.value.threads.unwrap_or_default(), degraded: n.degraded }
    }
}

fn section<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
    degraded: &mut Vec<Degradation>,
) -> Option<&'a Map<String, Value>> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Object(inner)) => Some(inner),
        Some(_) => {
            degraded.push(Degradation { field: key.into(), reason: DegradeReason::NotAnObject });
            None
        }
    }
}

/// Field reader that records every fallback it takes.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
    prefix: &'static str,
    degraded: &'a mut Vec<Degradation>,
}

impl Fields<'_> {
    fn note(&mut self, key: &str, reason: DegradeReason) {
        self.degraded.push(Degradation { field: format!("{}.{}", self.prefix, key), reason });
    }

    fn number(&mut self, key: &str) -> f64 {
        match coerce(self.obj.get(key)) {
            Ok(v) => v,
            Err(reason) => {
                self.note(key, reason);
                0.0
            }
        }
    }

    /// Absent or `null` stays `None`; present but unreadable becomes `Some(0.0)`.
    fn optional_number(&mut self, key: &str) -> Option<f64> {
        match self.obj.get(key) {
            None | Some(Value::Null) => None,
            Some(_) => Some(self.number(key)),
        }
    }

    fn count(&mut self, key: &str) -> u32 {
        let v = self.number(key).floor();
        if v < 0.0 {
            self.note(key, DegradeReason::Negative);
            return 0;
        }
        v.min(u32::MAX as f64) as u32
    }

    fn optional_count(&mut self, key: &str) -> Option<u32> {
        match self.obj.get(key) {
            None | Some(Value::Null) => None,
            Some(_) => Some(self.count(key)),
        }
    }

    fn text(&mut self, key: &str) -> String {
        match self.obj.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            None | Some(Value::Null) => {
                self.note(key, DegradeReason::Missing);
                String::new()
            }
            Some(_) => {
                self.note(key, DegradeReason::NotNumeric);
                String::new()
            }
        }
    }
}

fn coerce(value: Option<&Value>) -> Result<f64, DegradeReason> {
    match value {
        None | Some(Value::Null) => Err(DegradeReason::Missing),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or(DegradeReason::NonFinite),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(f),
            Ok(_) => Err(DegradeReason::NonFinite),
            Err(_) => Err(DegradeReason::NotNumeric),
        },
        Some(_) => Err(DegradeReason::NotNumeric),
    }
}

fn read_timestamp(value: Option<&Value>) -> Option<i64> {
    coerce(value)
        .ok()
        .filter(|t| *t >= 0.0 && *t < i64::MAX as f64)
        .map(|t| t.floor() as i64)
}

fn cpu_from(obj: &Map<String, Value>, fallback_ts: i64, degraded: &mut Vec<Degradation>) -> CpuSample {
    let mut f = Fields { obj, prefix: "cpu", degraded };
    CpuSample {
        system_pct: f.number("system"),
        process_pct: f.number("process"),
        cores: f.optional_count("cores"),
        timestamp: read_timestamp(obj.get("timestamp")).unwrap_or(fallback_ts),
    }
}

fn memory_from(obj: &Map<String, Value>, fallback_ts: i64, degraded: &mut Vec<Degradation>) -> MemorySample {
    let mut f = Fields { obj, prefix: "memory", degraded };
    MemorySample {
        used_mb: f.number("used"),
        max_mb: f.number("max"),
        committed_mb: f.optional_number("committed"),
        percentage: f.number("percentage"),
        heap_used_mb: f.optional_number("heapUsed"),
        non_heap_used_mb: f.optional_number("nonHeapUsed"),
        timestamp: read_timestamp(obj.get("timestamp")).unwrap_or(fallback_ts),
    }
}

fn threads_from(obj: &Map<String, Value>, fallback_ts: i64, degraded: &mut Vec<Degradation>) -> ThreadSample {
    let mut f = Fields { obj, prefix: "threads", degraded };
    ThreadSample {
        live: f.count("live"),
        daemon: f.count("daemon"),
        peak: f.count("peak"),
        timestamp: read_timestamp(obj.get("timestamp")).unwrap_or(fallback_ts),
    }
}

fn system_from(obj: &Map<String, Value>, degraded: &mut Vec<Degradation>) -> SystemInfo {
    let mut f = Fields { obj, prefix: "system", degraded };
    SystemInfo {
        os_name: f.text("osName"),
        os_version: f.text("osVersion"),
        architecture: f.text("architecture"),
        available_processors: f.count("availableProcessors"),
        jvm_total_memory_mb: f.number("jvmTotalMemory"),
        jvm_free_memory_mb: f.number("jvmFreeMemory"),
        jvm_max_memory_mb: f.number("jvmMaxMemory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_and_null_fields() {
        let n = Normalizer::new();
        let cpu = n.cpu(&json!({"system": "12.5", "process": null}));
        assert!((cpu.value.system_pct - 12.5).abs() < f64::EPSILON);
        assert_eq!(cpu.value.process_pct, 0.0);
        assert!(cpu.value.cores.is_none());
        assert!(cpu.degraded.iter().any(|d| d.field == "cpu.process" && d.reason == DegradeReason::Missing));
    }

    #[test]
    fn test_garbage_numbers_become_zero() {
        let n = Normalizer::new();
        let mem = n.memory(&json!({"used": "lots", "max": 1024, "percentage": [1], "committed": "x"}));
        assert_eq!(mem.value.used_mb, 0.0);
        assert_eq!(mem.value.max_mb, 1024.0);
        assert_eq!(mem.value.percentage, 0.0);
        assert_eq!(mem.value.committed_mb, Some(0.0));
        assert!(mem.value.heap_used_mb.is_none());
        assert_eq!(mem.degraded.len(), 3);
    }

    #[test]
    fn test_counts_are_floored() {
        let n = Normalizer::new();
        let t = n.threads(&json!({"live": "41.9", "daemon": 12.2, "peak": -3}));
        assert_eq!(t.value.live, 41);
        assert_eq!(t.value.daemon, 12);
        assert_eq!(t.value.peak, 0);
        assert_eq!(t.value.user_threads(), 29);
    }

    #[test]
    fn test_cores_floored_when_present() {
        let n = Normalizer::new();
        let cpu = n.cpu(&json!({"system": 1, "process": 2, "cores": "8.7"}));
        assert_eq!(cpu.value.cores, Some(8));
        assert!(cpu.is_clean());
    }

    #[test]
    fn test_timestamp_provided_is_kept() {
        let n = Normalizer::new();
        let t = n.threads(&json!({"live": 1, "daemon": 0, "peak": 1, "timestamp": 1_700_000_000_123u64}));
        assert_eq!(t.value.timestamp, 1_700_000_000_123);
    }

    #[test]
    fn test_missing_timestamp_uses_receipt_time() {
        let n = Normalizer::new();
        let before = Utc::now().timestamp_millis();
        let a = n.cpu(&json!({"system": 1, "process": 1})).value.timestamp;
        let b = n.cpu(&json!({"system": 1, "process": 1, "timestamp": "NaN"})).value.timestamp;
        let after = Utc::now().timestamp_millis();
        assert!(a >= before && a <= after);
        assert!(b >= a && b <= after);
    }

    #[test]
    fn test_frame_propagates_timestamp_and_skips_absent_sections() {
        let n = Normalizer::new();
        let frame = n.frame(&json!({
            "cpu": {"system": "3.5", "process": "1.0", "cores": 4},
            "threads": {"live": 10, "daemon": 4, "peak": 12},
            "system": {"osName": "Linux", "osVersion": "6.1", "architecture": "amd64",
                       "availableProcessors": 4, "jvmTotalMemory": 256, "jvmFreeMemory": 128, "jvmMaxMemory": 1024},
            "timestamp": 42
        }));
        let data = frame.value;
        assert_eq!(data.timestamp, 42);
        assert_eq!(data.cpu.unwrap().timestamp, 42);
        assert!(data.memory.is_none());
        assert_eq!(data.threads.unwrap().timestamp, 42);
        assert_eq!(data.system.unwrap().os_name, "Linux");
        assert!(frame.degraded.is_empty());
    }

    #[test]
    fn test_non_object_payloads_degrade() {
        let n = Normalizer::new();
        let frame = n.frame(&json!("hello"));
        assert!(frame.value.is_empty());
        assert_eq!(frame.degraded[0].reason, DegradeReason::NotAnObject);

        let frame = n.frame(&json!({"cpu": 5}));
        assert!(frame.value.cpu.is_none());

        let cpu = n.category(MetricCategory::Cpu, &Value::Null);
        assert_eq!(cpu.value.cpu, Some(CpuSample { timestamp: cpu.value.timestamp, ..Default::default() }));
    }

    #[test]
    fn test_parse_frame_rejects_non_json() {
        let n = Normalizer::new();
        assert!(n.parse_frame("not json").is_none());
        assert!(n.parse_frame(r#"{"memory":{"used":1,"max":2,"percentage":50}}"#).is_some());
    }

    #[test]
    fn test_thread_ratios_handle_zero() {
        let t = ThreadSample { live: 0, daemon: 0, peak: 0, timestamp: 0 };
        assert_eq!(t.daemon_pct(), 0.0);
        assert_eq!(t.peak_utilization_pct(), 0.0);
        let t = ThreadSample { live: 50, daemon: 10, peak: 100, timestamp: 0 };
        assert!((t.daemon_pct() - 20.0).abs() < 1e-9);
        assert!((t.peak_utilization_pct() - 50.0).abs() < 1e-9);
    }
}
