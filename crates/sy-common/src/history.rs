use chrono::{DateTime, Utc};
use serde::Serialize;

/// One visited node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub route_id: Option<String>,
    pub node_id: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: Option<u64>,
}

/// Ordered trace of nodes an exchange passed through. Each exchange owns its
/// own copy; branches start from a clone of their parent's history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageHistory {
    entries: Vec<HistoryEntry>,
}

impl MessageHistory {
    /// Record a node visit and return its position so the caller can fill in
    /// the elapsed time once the node finishes.
    pub fn begin(
        &mut self,
        route_id: Option<&str>,
        node_id: impl Into<String>,
        label: impl Into<String>,
    ) -> usize {
        self.entries.push(HistoryEntry {
            route_id: route_id.map(str::to_string),
            node_id: node_id.into(),
            label: label.into(),
            timestamp: Utc::now(),
            elapsed_ms: None,
        });
        self.entries.len() - 1
    }

    pub fn complete(&mut self, index: usize, elapsed_ms: u64) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.elapsed_ms = Some(elapsed_ms);
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.node_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_and_complete() {
        let mut history = MessageHistory::default();
        let first = history.begin(Some("orders"), "to1", "direct:audit");
        let second = history.begin(Some("orders"), "split2", "split");
        history.complete(first, 12);

        assert_eq!(history.node_ids(), vec!["to1", "split2"]);
        assert_eq!(history.entries()[first].elapsed_ms, Some(12));
        assert_eq!(history.entries()[second].elapsed_ms, None);
    }
}
