//! Event & Progress (C9): a decentralized progress model. Rather than one
//! mutable counter the whole pipeline fights over, the total amount of work
//! is subdivided up front into an immutable allocation tree, and each step
//! only ever reports its own fractional completion within the slice it was
//! handed — matching §4.9's "allocation tree" design and sidestepping the
//! lock contention the teacher's `concurrency::monitor::ProgressTracker`
//! accepts via a single `RwLock<HashMap<...>>`.

use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum LogEvent {
    Info(String),
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Dotted path identifying the allocation, e.g. `"pull.layer.2"`.
    pub path: String,
    /// Fraction of *this allocation's own slice* completed, in `[0.0, 1.0]`.
    pub fraction: f64,
}

#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub name: String,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub enum Event {
    Log(LogEvent),
    Progress(ProgressEvent),
    Timer(TimerEvent),
}

/// A broadcast channel every step can publish onto and any number of
/// subscribers (a CLI renderer, a test harness) can drain independently.
/// Lagging subscribers drop old events rather than block publishers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is the common case in a library embedding (nobody's
        // watching a headless build); that's not an error.
        let _ = self.sender.send(event);
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.publish(Event::Log(LogEvent::Info(message.into())));
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.publish(Event::Log(LogEvent::Warning(message.into())));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.publish(Event::Log(LogEvent::Error(message.into())));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A node in the allocation tree: a named slice of the parent's total work,
/// reporting fractional progress scaled by its own weight. Subdivision is
/// immutable once built — a step never renegotiates how much of the whole
/// it owns mid-flight, which is what lets siblings report concurrently
/// without coordinating.
#[derive(Clone)]
pub struct Allocation {
    bus: Arc<EventBus>,
    path: String,
    /// This node's share of its parent's `[0.0, 1.0]` range.
    weight: f64,
}

impl Allocation {
    pub fn root(bus: Arc<EventBus>, name: impl Into<String>) -> Self {
        Self { bus, path: name.into(), weight: 1.0 }
    }

    /// Splits this allocation's slice into `n` equally-weighted children,
    /// named `<parent>.<index>`.
    pub fn subdivide_equal(&self, n: usize) -> Vec<Allocation> {
        let weight = if n == 0 { 0.0 } else { 1.0 / n as f64 };
        (0..n)
            .map(|i| Allocation { bus: self.bus.clone(), path: format!("{}.{}", self.path, i), weight })
            .collect()
    }

    /// Splits this allocation's slice into weighted children, e.g. giving a
    /// large base-image layer more of the bar than a small app layer.
    pub fn subdivide_weighted(&self, names_and_weights: &[(&str, f64)]) -> Vec<Allocation> {
        let total: f64 = names_and_weights.iter().map(|(_, w)| w).sum();
        names_and_weights
            .iter()
            .map(|(name, w)| Allocation {
                bus: self.bus.clone(),
                path: format!("{}.{}", self.path, name),
                weight: if total > 0.0 { w / total } else { 0.0 },
            })
            .collect()
    }

    /// Reports this allocation as `fraction` complete within its own slice.
    pub fn report(&self, fraction: f64) {
        self.bus.publish(Event::Progress(ProgressEvent { path: self.path.clone(), fraction: fraction.clamp(0.0, 1.0) }));
    }

    pub fn complete(&self) {
        self.report(1.0);
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_subdivision_weights_sum_to_one() {
        let bus = Arc::new(EventBus::default());
        let root = Allocation::root(bus, "build");
        let children = root.subdivide_equal(4);
        let total: f64 = children.iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_subdivision_normalizes() {
        let bus = Arc::new(EventBus::default());
        let root = Allocation::root(bus, "build");
        let children = root.subdivide_weighted(&[("base", 3.0), ("app", 1.0)]);
        assert!((children[0].weight() - 0.75).abs() < 1e-9);
        assert!((children[1].weight() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn child_path_nests_under_parent() {
        let bus = Arc::new(EventBus::default());
        let root = Allocation::root(bus, "build");
        let children = root.subdivide_equal(2);
        assert_eq!(children[0].path(), "build.0");
        assert_eq!(children[1].path(), "build.1");
    }

    #[tokio::test]
    async fn subscriber_receives_published_progress() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let allocation = Allocation::root(bus.clone(), "build");
        allocation.report(0.5);
        match rx.recv().await.unwrap() {
            Event::Progress(p) => assert_eq!(p.fraction, 0.5),
            other => panic!("expected Progress event, got {:?}", other),
        }
    }
}
