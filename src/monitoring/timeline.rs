//! Execution Timeline
//!
//! Records lifecycle events from a component tree with wall-clock
//! timestamps, for timing reports and Gantt charts.
//!
//! A timeline subscribes to an [`EventHub`]; attaching it to a workflow's
//! hub captures the workflow, its works and every step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::events::{Event, EventHub, Lifecycle, ListenerId};
use crate::workflow::model::ComponentKind;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Paused,
    Resumed,
    Completed,
    Failed,
    Stopped,
}

impl EventType {
    /// Maps a lifecycle to a timeline entry; `change` is not recorded.
    pub fn from_lifecycle(lifecycle: Lifecycle) -> Option<Self> {
        match lifecycle {
            Lifecycle::Start => Some(EventType::Started),
            Lifecycle::Pause => Some(EventType::Paused),
            Lifecycle::Resume => Some(EventType::Resumed),
            Lifecycle::Success => Some(EventType::Completed),
            Lifecycle::Failed => Some(EventType::Failed),
            Lifecycle::Stop => Some(EventType::Stopped),
            Lifecycle::Change => None,
        }
    }

    /// True for the events that end a run.
    pub fn is_end(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Failed | EventType::Stopped)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub component_id: String,
    pub level: ComponentKind,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Recorded {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

/// Tracks the execution timeline of a component tree.
///
/// Clones share the same record, so one clone can be attached to a hub
/// while another renders the report.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    recorded: Arc<Mutex<Recorded>>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded {
                events: Vec::new(),
                start_time: Utc::now(),
            })),
        }
    }

    /// Records every lifecycle event emitted on `hub`.
    pub fn attach(&self, hub: &EventHub) -> ListenerId {
        let timeline = self.clone();
        hub.on_any(move |event| timeline.record_event(event))
    }

    pub fn record_event(&self, event: &Event) {
        if let Some(event_type) = EventType::from_lifecycle(event.lifecycle()) {
            self.record(event.id(), event.level(), event_type, Utc::now());
        }
    }

    /// Records an event at an explicit time.
    pub fn record(
        &self,
        component_id: &str,
        level: ComponentKind,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) {
        self.recorded.lock().events.push(TimelineEvent {
            component_id: component_id.to_string(),
            level,
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events in arrival order.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.recorded.lock().events.clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.recorded.lock().start_time
    }

    /// Milliseconds since the timeline was created.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.start_time()).num_milliseconds()
    }

    /// Start and end offsets (ms from timeline start) of every finished run
    /// at `level`, ordered by start.
    fn spans(&self, level: ComponentKind) -> Vec<(String, i64, i64)> {
        let recorded = self.recorded.lock();
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut spans = Vec::new();

        for event in recorded.events.iter().filter(|e| e.level == level) {
            let offset = (event.timestamp - recorded.start_time).num_milliseconds();
            if event.event_type == EventType::Started {
                starts.insert(&event.component_id, offset);
            } else if event.event_type.is_end() {
                if let Some(start) = starts.remove(event.component_id.as_str()) {
                    spans.push((event.component_id.clone(), start, offset));
                }
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Returns run durations in milliseconds for components at `level`.
    ///
    /// Time spent paused is included. Runs that have not ended are left out.
    pub fn durations(&self, level: ComponentKind) -> HashMap<String, i64> {
        self.spans(level)
            .into_iter()
            .map(|(id, start, end)| (id, end - start))
            .collect()
    }

    /// Generates an ASCII Gantt chart of the step runs.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let spans = self.spans(ComponentKind::Step);
        let total_time = spans.iter().map(|(_, _, end)| *end).max().unwrap_or(0);
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (step_id, start, end) in spans {
            let start_pos = (start.max(0) as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a label to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Step, Work, Workflow};
    use chrono::Duration;
    use serde_json::json;

    fn at(timeline: &ExecutionTimeline, ms: i64) -> DateTime<Utc> {
        timeline.start_time() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events().is_empty());
        assert!(timeline.elapsed_ms() >= 0);
    }

    #[test]
    fn test_durations_per_level() {
        let timeline = ExecutionTimeline::new();
        timeline.record("w", ComponentKind::Work, EventType::Started, at(&timeline, 0));
        timeline.record("a", ComponentKind::Step, EventType::Started, at(&timeline, 10));
        timeline.record("a", ComponentKind::Step, EventType::Completed, at(&timeline, 60));
        timeline.record("w", ComponentKind::Work, EventType::Failed, at(&timeline, 80));

        let steps = timeline.durations(ComponentKind::Step);
        assert_eq!(steps.get("a"), Some(&50));
        assert_eq!(steps.len(), 1);

        let works = timeline.durations(ComponentKind::Work);
        assert_eq!(works.get("w"), Some(&80));
    }

    #[test]
    fn test_pause_time_counts_toward_duration() {
        let timeline = ExecutionTimeline::new();
        timeline.record("a", ComponentKind::Step, EventType::Started, at(&timeline, 0));
        timeline.record("a", ComponentKind::Step, EventType::Paused, at(&timeline, 20));
        timeline.record("a", ComponentKind::Step, EventType::Resumed, at(&timeline, 70));
        timeline.record("a", ComponentKind::Step, EventType::Stopped, at(&timeline, 90));

        assert_eq!(timeline.durations(ComponentKind::Step).get("a"), Some(&90));
    }

    #[test]
    fn test_unfinished_runs_are_left_out() {
        let timeline = ExecutionTimeline::new();
        timeline.record("a", ComponentKind::Step, EventType::Started, at(&timeline, 0));

        assert!(timeline.durations(ComponentKind::Step).is_empty());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let timeline = ExecutionTimeline::new();
        timeline.record("step1", ComponentKind::Step, EventType::Started, at(&timeline, 0));
        timeline.record("step1", ComponentKind::Step, EventType::Completed, at(&timeline, 50));
        timeline.record("step2", ComponentKind::Step, EventType::Started, at(&timeline, 50));
        timeline.record("step2", ComponentKind::Step, EventType::Failed, at(&timeline, 100));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("(50 ms)"));
        assert!(chart.contains("Total: 100 ms"));

        // step2 starts halfway across the chart
        let step2_line = chart.lines().find(|l| l.starts_with("step2")).unwrap();
        let bar = step2_line.split('|').nth(1).unwrap();
        assert_eq!(bar.find('#'), Some(25));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 12), "short");
        assert_eq!(truncate("a_very_long_step_name", 12), "a_very_lo...");
    }

    #[test]
    fn test_change_events_are_ignored() {
        assert_eq!(EventType::from_lifecycle(Lifecycle::Change), None);
        assert_eq!(EventType::from_lifecycle(Lifecycle::Success), Some(EventType::Completed));
    }

    #[tokio::test]
    async fn test_attach_records_whole_tree() {
        let workflow = Workflow::new("wf");
        let work = Work::new("w");
        work.add(Step::from_fn("a", |x| Ok(x))).add(Step::from_fn("b", |x| Ok(x)));
        workflow.add(work);

        let timeline = ExecutionTimeline::new();
        timeline.attach(workflow.events());
        workflow.run(json!(1)).await.unwrap();

        let events = timeline.events();
        assert_eq!(events.len(), 8);
        assert_eq!(events[0].level, ComponentKind::Workflow);
        assert_eq!(events[0].event_type, EventType::Started);
        assert_eq!(events[7].level, ComponentKind::Workflow);
        assert_eq!(events[7].event_type, EventType::Completed);

        let steps = timeline.durations(ComponentKind::Step);
        assert!(steps.contains_key("a"));
        assert!(steps.contains_key("b"));
    }
}
