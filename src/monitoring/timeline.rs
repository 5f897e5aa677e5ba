//! Execution Timeline
//!
//! Collects node start/end times from the observer stream for run
//! reports and Gantt charts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::execution::{ExecutionEvent, NodeExecution, Status};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Node entered RUNNING
    Started,
    /// Node closed as SUCCEEDED or SKIPPED
    Completed,
    /// Node closed as FAILED, ERRORED or EXPIRED
    Failed,
    /// Node closed as ABORTED
    Aborted,
}

impl EventType {
    fn for_status(status: Status) -> Option<Self> {
        match status {
            Status::Running => Some(Self::Started),
            Status::Succeeded | Status::Skipped => Some(Self::Completed),
            Status::Failed | Status::Errored | Status::Expired => Some(Self::Failed),
            Status::Aborted => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub node_execution_id: String,
    /// Plan node the execution belongs to, used as the chart label
    pub label: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Tracks when each node execution of a run starts and closes.
///
/// Feed it [`ExecutionEvent`]s from `Orchestrator::subscribe`, or build
/// it after the fact from the stored node executions.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start_time: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            start_time,
        }
    }

    /// Builds a timeline from the persisted start and end stamps.
    pub fn from_nodes(nodes: &[NodeExecution]) -> Self {
        let start_time = nodes
            .iter()
            .filter_map(|n| n.start_ts)
            .min()
            .unwrap_or_else(Utc::now);
        let mut timeline = Self::starting_at(start_time);

        for node in nodes {
            if let Some(started) = node.start_ts {
                timeline.add_event(&node.id, &node.plan_node_id, EventType::Started, started);
            }
            if let (Some(ended), Some(event_type)) = (node.end_ts, EventType::for_status(node.status)) {
                timeline.add_event(&node.id, &node.plan_node_id, event_type, ended);
            }
        }
        timeline
    }

    /// Records a node status event. Plan events and statuses without a
    /// timeline meaning are ignored.
    pub fn record(&mut self, event: &ExecutionEvent) {
        if let ExecutionEvent::Node(status) = event {
            if let Some(event_type) = EventType::for_status(status.new_status) {
                self.add_event(
                    &status.node_execution_id,
                    &status.plan_node_id,
                    event_type,
                    status.timestamp,
                );
            }
        }
    }

    pub fn add_event(
        &mut self,
        node_execution_id: &str,
        label: &str,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) {
        self.events.push(TimelineEvent {
            node_execution_id: node_execution_id.to_string(),
            label: label.to_string(),
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    fn offset_ms(&self, timestamp: DateTime<Utc>) -> i64 {
        (timestamp - self.start_time).num_milliseconds().max(0)
    }

    /// (label, start, end) per node execution, offsets in milliseconds.
    fn spans(&self) -> Vec<(String, i64, Option<i64>)> {
        let mut spans: HashMap<&str, (String, Option<i64>, Option<i64>)> = HashMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            let span = spans
                .entry(event.node_execution_id.as_str())
                .or_insert_with(|| (event.label.clone(), None, None));
            match event.event_type {
                // A retried or resumed node keeps its first start
                EventType::Started => {
                    span.1.get_or_insert(offset);
                }
                _ => span.2 = Some(offset),
            }
        }

        let mut spans: Vec<_> = spans
            .into_values()
            .filter_map(|(label, start, end)| start.map(|s| (label, s, end)))
            .collect();
        spans.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        spans
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each closed node execution is shown as a bar indicating when it
    /// ran relative to the whole run.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let spans = self.spans();
        let total_time = spans
            .iter()
            .filter_map(|(_, _, end)| *end)
            .max()
            .unwrap_or(0);

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (label, start, end) in spans {
            let Some(end) = end else { continue };
            let start_pos = (start as f64 * scale) as usize;
            let duration = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(duration));

            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(&label, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns node execution durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    starts.entry(event.node_execution_id.as_str()).or_insert(offset);
                }
                _ => {
                    if let Some(start) = starts.get(event.node_execution_id.as_str()) {
                        durations.insert(event.node_execution_id.clone(), offset - start);
                    }
                }
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Ambiance;
    use crate::execution::StatusEvent;
    use chrono::Duration;

    fn status_event(id: &str, label: &str, new_status: Status, at: DateTime<Utc>) -> ExecutionEvent {
        ExecutionEvent::Node(StatusEvent {
            node_execution_id: id.to_string(),
            plan_execution_id: "pe".to_string(),
            plan_node_id: label.to_string(),
            old_status: Status::Queued,
            new_status,
            ambiance: Ambiance::new("pe", "plan"),
            timestamp: at,
        })
    }

    #[test]
    fn test_record_ignores_waiting_statuses() {
        let start = Utc::now();
        let mut timeline = ExecutionTimeline::starting_at(start);
        timeline.record(&status_event("n1", "build", Status::Running, start));
        timeline.record(&status_event("n1", "build", Status::TaskWaiting, start));
        timeline.record(&status_event("n1", "build", Status::Succeeded, start));

        let types: Vec<_> = timeline.get_events().iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Started, EventType::Completed]);
    }

    #[test]
    fn test_durations_keep_first_start() {
        let start = Utc::now();
        let mut timeline = ExecutionTimeline::starting_at(start);
        timeline.add_event("n1", "build", EventType::Started, start);
        timeline.add_event("n1", "build", EventType::Started, start + Duration::milliseconds(30));
        timeline.add_event("n1", "build", EventType::Completed, start + Duration::milliseconds(50));

        assert_eq!(timeline.get_durations().get("n1"), Some(&50));
    }

    #[test]
    fn test_gantt_chart_orders_by_start() {
        let start = Utc::now();
        let mut timeline = ExecutionTimeline::starting_at(start);
        timeline.add_event("n2", "deploy", EventType::Started, start + Duration::milliseconds(50));
        timeline.add_event("n2", "deploy", EventType::Failed, start + Duration::milliseconds(100));
        timeline.add_event("n1", "build", EventType::Started, start);
        timeline.add_event("n1", "build", EventType::Completed, start + Duration::milliseconds(50));

        let chart = timeline.gantt_chart();
        let build = chart.find("build").unwrap();
        let deploy = chart.find("deploy").unwrap();
        assert!(build < deploy);
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_from_nodes_uses_stored_stamps() {
        let start = Utc::now();
        let mut node = NodeExecution::new("n1", "build", Ambiance::new("pe", "plan"));
        node.status = Status::Succeeded;
        node.start_ts = Some(start);
        node.end_ts = Some(start + Duration::milliseconds(20));

        let timeline = ExecutionTimeline::from_nodes(&[node]);
        assert_eq!(timeline.get_events().len(), 2);
        assert_eq!(timeline.get_durations().get("n1"), Some(&20));
    }

    #[test]
    fn test_truncate_long_label() {
        assert_eq!(truncate("a-very-long-stage-name", 10), "a-very-...");
        assert_eq!(truncate("short", 8), "short   ");
    }
}
