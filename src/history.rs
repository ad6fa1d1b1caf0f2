use serde::{Deserialize, Serialize};

use crate::metrics::{CpuSample, MemorySample, MetricCategory, MetricsData, SystemInfo, ThreadSample};
use crate::ringbuf::{RingBuffer, SeriesPoint};

/// How long rolling history survives navigation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferLifetime {
    /// One history shared by every view; switching views keeps it.
    #[default]
    Persistent,
    /// Each detail view gets a fresh history that is dropped when it is left.
    PerView,
}

/// Rolling windows for every metric category, plus the latest system info.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    cpu: RingBuffer<CpuSample>,
    memory: RingBuffer<MemorySample>,
    threads: RingBuffer<ThreadSample>,
    system: Option<SystemInfo>,
    last_update: Option<i64>,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cpu: RingBuffer::new(capacity),
            memory: RingBuffer::new(capacity),
            threads: RingBuffer::new(capacity),
            system: None,
            last_update: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cpu.capacity()
    }

    /// Append every category the frame carries. Returns how many samples were added.
    pub fn ingest(&mut self, data: &MetricsData) -> usize {
        let mut added = 0;
        if let Some(cpu) = data.cpu {
            self.cpu.push(cpu);
            added += 1;
        }
        if let Some(mem) = data.memory {
            self.memory.push(mem);
            added += 1;
        }
        if let Some(threads) = data.threads {
            self.threads.push(threads);
            added += 1;
        }
        if let Some(system) = &data.system {
            self.system = Some(system.clone());
        }
        if added > 0 || data.system.is_some() {
            self.last_update = Some(data.timestamp);
        }
        added
    }

    pub fn cpu(&self) -> &RingBuffer<CpuSample> {
        &self.cpu
    }

    pub fn memory(&self) -> &RingBuffer<MemorySample> {
        &self.memory
    }

    pub fn threads(&self) -> &RingBuffer<ThreadSample> {
        &self.threads
    }

    pub fn system(&self) -> Option<&SystemInfo> {
        self.system.as_ref()
    }

    /// Timestamp of the most recent frame that changed anything.
    pub fn last_update(&self) -> Option<i64> {
        self.last_update
    }

    pub fn len(&self, category: MetricCategory) -> usize {
        match category {
            MetricCategory::Cpu => self.cpu.len(),
            MetricCategory::Memory => self.memory.len(),
            MetricCategory::Threads => self.threads.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty() && self.threads.is_empty()
    }

    pub fn clear(&mut self) {
        self.cpu.clear();
        self.memory.clear();
        self.threads.clear();
        self.system = None;
        self.last_update = None;
    }

    /// Headline series of a category: system CPU %, heap usage %, live threads.
    pub fn series(&self, category: MetricCategory) -> Vec<SeriesPoint> {
        match category {
            MetricCategory::Cpu => self.cpu.to_series(|c| c.system_pct),
            MetricCategory::Memory => self.memory.to_series(|m| m.percentage),
            MetricCategory::Threads => self.threads.to_series(|t| t.live as f64),
        }
    }

    /// Window statistics over the headline series.
    pub fn stats(&self, category: MetricCategory) -> Option<WindowStats> {
        match category {
            MetricCategory::Cpu => WindowStats::over(self.cpu.iter().map(|c| c.system_pct)),
            MetricCategory::Memory => WindowStats::over(self.memory.iter().map(|m| m.percentage)),
            MetricCategory::Threads => WindowStats::over(self.threads.iter().map(|t| t.live as f64)),
        }
    }
}

impl Default for MetricHistory {
    fn default() -> Self {
        Self::new(RingBuffer::<CpuSample>::DEFAULT_CAPACITY)
    }
}

/// Latest, mean, and extremes of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub latest: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl WindowStats {
    /// `None` for an empty window.
    pub fn over(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut latest = 0.0;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
            latest = v;
        }
        if count == 0 {
            return None;
        }
        Some(Self { latest, avg: sum / count as f64, min, max })
    }
}
