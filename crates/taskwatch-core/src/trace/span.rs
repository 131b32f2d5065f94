use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{SpanId, TraceId};

/// A single traced operation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub id: SpanId,
    pub trace_id: TraceId,
    #[serde(default)]
    pub parent_id: Option<SpanId>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the operation is still running.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Span {
    pub fn is_ongoing(&self) -> bool {
        self.end_time.is_none()
    }

    /// Elapsed time of a finished span.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// A span with its children, ready for display.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanNode {
    pub span: Span,
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// Number of spans in this subtree, including the root.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(SpanNode::size).sum::<usize>()
    }
}

/// Forest view of a flat span list.
pub struct SpanTree;

impl SpanTree {
    /// Builds the span forest. Spans whose parent is missing from `spans` are
    /// treated as roots. Siblings are ordered by start time, then id.
    pub fn build(spans: &[Span]) -> Vec<SpanNode> {
        let ids: HashSet<&SpanId> = spans.iter().map(|span| &span.id).collect();
        let mut children: HashMap<&SpanId, Vec<usize>> = HashMap::new();
        let mut roots: Vec<usize> = Vec::new();
        for (index, span) in spans.iter().enumerate() {
            match span.parent_id.as_ref() {
                Some(parent) if parent != &span.id && ids.contains(parent) => {
                    children.entry(parent).or_default().push(index);
                }
                _ => roots.push(index),
            }
        }
        sort_siblings(spans, &mut roots);
        // Tracked per position, so spans sharing an id are all kept.
        let mut visited = vec![false; spans.len()];
        let mut forest: Vec<SpanNode> = roots
            .into_iter()
            .map(|root| build_node(spans, root, &mut children, &mut visited))
            .collect();

        // Parent cycles never reach a root; surface them rather than lose them.
        for index in 0..spans.len() {
            if !visited[index] {
                forest.push(build_node(spans, index, &mut children, &mut visited));
            }
        }
        forest
    }
}

fn sort_siblings(spans: &[Span], indices: &mut [usize]) {
    indices.sort_by(|&a, &b| {
        let (a, b) = (&spans[a], &spans[b]);
        a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id))
    });
}

fn build_node<'a>(
    spans: &'a [Span],
    index: usize,
    children: &mut HashMap<&'a SpanId, Vec<usize>>,
    visited: &mut [bool],
) -> SpanNode {
    visited[index] = true;
    let span = &spans[index];
    let mut kids = children.remove(&span.id).unwrap_or_default();
    sort_siblings(spans, &mut kids);
    let mut children_nodes = Vec::with_capacity(kids.len());
    for child in kids {
        if !visited[child] {
            children_nodes.push(build_node(spans, child, children, visited));
        }
    }
    SpanNode {
        span: span.clone(),
        children: children_nodes,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone as _;

    pub(crate) fn span(id: &str, parent: Option<&str>, start_offset: i64) -> Span {
        Span {
            id: SpanId::new(id),
            trace_id: TraceId::new("tr-1"),
            parent_id: parent.map(SpanId::new),
            name: format!("op-{id}"),
            start_time: Utc
                .timestamp_opt(1_700_000_000 + start_offset, 0)
                .single()
                .expect("valid timestamp"),
            end_time: None,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn builds_nested_tree_in_start_order() {
        let spans = vec![
            span("child-b", Some("root"), 3),
            span("root", None, 0),
            span("child-a", Some("root"), 1),
            span("grandchild", Some("child-a"), 2),
        ];
        let forest = SpanTree::build(&spans);
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.size(), 4);
        let order: Vec<&str> = root.children.iter().map(|n| n.span.id.as_str()).collect();
        assert_eq!(order, vec!["child-a", "child-b"]);
        assert_eq!(root.children[0].children[0].span.id.as_str(), "grandchild");
    }

    #[test]
    fn unresolved_parent_renders_as_root() {
        let spans = vec![span("root", None, 0), span("orphan", Some("missing"), 1)];
        let forest = SpanTree::build(&spans);
        let roots: Vec<&str> = forest.iter().map(|n| n.span.id.as_str()).collect();
        assert_eq!(roots, vec!["root", "orphan"]);
    }

    #[test]
    fn parent_cycle_does_not_lose_spans() {
        let spans = vec![span("a", Some("b"), 0), span("b", Some("a"), 1)];
        let forest = SpanTree::build(&spans);
        let total: usize = forest.iter().map(SpanNode::size).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn duplicate_ids_are_all_rendered() {
        let spans = vec![
            span("root", None, 0),
            span("dup", Some("root"), 1),
            span("dup", Some("root"), 2),
            span("dup", None, 3),
        ];
        let forest = SpanTree::build(&spans);
        let total: usize = forest.iter().map(SpanNode::size).sum();
        assert_eq!(total, 4);
        assert_eq!(forest[0].children.len(), 2);
    }

    #[test]
    fn deserializes_camel_case_with_ongoing_end() {
        let raw = serde_json::json!({
            "id": "s1",
            "traceId": "tr-1",
            "parentId": null,
            "name": "llm.call",
            "startTime": "2024-05-01T10:00:00Z",
            "endTime": null,
            "input": {"prompt": "hi"},
        });
        let span: Span = serde_json::from_value(raw).expect("span");
        assert!(span.is_ongoing());
        assert_eq!(span.duration(), None);
        assert_eq!(span.input["prompt"], "hi");
        assert!(span.output.is_null());
    }
}
