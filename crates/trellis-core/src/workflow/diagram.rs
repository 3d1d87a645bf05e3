//! Mermaid rendering of a workflow.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use trellis_types::workflow::{EdgeKind, NodeStatus};

use super::builder::Workflow;

const CLASS_DEFS: [&str; 4] = [
    "classDef success fill:#90EE90",
    "classDef failed fill:#FFB6C1",
    "classDef running fill:#87CEEB",
    "classDef skipped fill:#D3D3D3",
];

fn is_plain(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Mermaid node ids must be plain identifiers. Anything else gets a
/// positional id that no other node uses, and keeps its real id as the label.
fn mermaid_ids(workflow: &Workflow) -> HashMap<&str, String> {
    let mut taken: HashSet<String> = workflow
        .nodes()
        .map(|node| node.id.as_str())
        .filter(|id| is_plain(id))
        .map(str::to_string)
        .collect();

    let mut ids = HashMap::new();
    for (position, node) in workflow.nodes().enumerate() {
        let id = if is_plain(&node.id) {
            node.id.clone()
        } else {
            let mut candidate = format!("node{position}");
            while taken.contains(&candidate) {
                candidate.push('_');
            }
            taken.insert(candidate.clone());
            candidate
        };
        ids.insert(node.id.as_str(), id);
    }
    ids
}

fn status_class(status: NodeStatus) -> Option<&'static str> {
    match status {
        NodeStatus::Pending => None,
        NodeStatus::Running => Some("running"),
        NodeStatus::Success => Some("success"),
        NodeStatus::Failed => Some("failed"),
        NodeStatus::Skipped => Some("skipped"),
    }
}

fn arrow(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Normal => "-->",
        EdgeKind::Conditional => "-.->",
        EdgeKind::Loop => "==>",
    }
}

/// `graph TD`, one line per node, one line per edge, then the class styles.
pub fn render(workflow: &Workflow) -> String {
    let ids = mermaid_ids(workflow);
    let mut out = String::from("graph TD\n");

    for node in workflow.nodes() {
        let id = ids.get(node.id.as_str()).map_or(node.id.as_str(), String::as_str);
        let label = node.id.replace('"', "#quot;");
        let _ = write!(out, "    {id}[\"{label}\"]");
        if let Some(class) = status_class(node.status()) {
            let _ = write!(out, ":::{class}");
        }
        out.push('\n');
    }

    for edge in workflow.edges() {
        let source = ids.get(edge.source.as_str()).map_or(edge.source.as_str(), String::as_str);
        let target = ids.get(edge.target.as_str()).map_or(edge.target.as_str(), String::as_str);
        let _ = writeln!(out, "    {source} {} {target}", arrow(edge.kind));
    }

    for class in CLASS_DEFS {
        let _ = writeln!(out, "    {class}");
    }
    out
}
