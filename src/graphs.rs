use std::path::PathBuf;
use std::sync::Mutex;

use crate::worker_protocol::{GraphRef, RunOutcome, RunStatus};

const BLOCK_RULE: &str = "============================================================";

/// Render the graph block appended to run output. The editor front-end
/// and the indexer both parse this exact shape.
pub fn render_graphs_block(graphs: &[GraphRef]) -> String {
    let mut block = format!(
        "\n\n{BLOCK_RULE}\nGRAPHS DETECTED: {} graph(s) created\n{BLOCK_RULE}\n",
        graphs.len()
    );
    for graph in graphs {
        block.push_str(&format!("  \u{2022} {}: {}\n", graph.name, graph.absolute_path));
    }
    block
}

/// Parse a `GRAPHS DETECTED` block out of run output, returning
/// `(name, path)` pairs in order of appearance.
pub fn parse_graphs_block(output: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut in_block = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("GRAPHS DETECTED:") {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if trimmed.chars().all(|c| c == '=') && !trimmed.is_empty() {
            continue;
        }
        let Some(bullet) = trimmed.strip_prefix('\u{2022}') else {
            if trimmed.is_empty() {
                continue;
            }
            in_block = false;
            continue;
        };
        if let Some((name, path)) = bullet.split_once(':') {
            // The VS Code extension appends `[CMD: ...]` annotations in
            // some paths; strip them if present.
            let path = match path.find("[CMD:") {
                Some(idx) => &path[..idx],
                None => path,
            };
            entries.push((name.trim().to_string(), path.trim().to_string()));
        }
    }
    entries
}

/// Per-session registry of the image artifacts produced by the latest
/// run. Single-shot semantics: each successful run replaces the whole
/// set; consumers persist history themselves.
#[derive(Default)]
pub struct GraphRegistry {
    entries: Mutex<Vec<GraphRef>>,
}

impl GraphRegistry {
    pub fn record_run(&self, outcome: &RunOutcome) {
        // Failed runs contribute nothing; the previous registry stays
        // valid so earlier graphs remain addressable.
        if outcome.status != RunStatus::Success {
            return;
        }
        let mut graphs = outcome.graphs.clone();
        if graphs.is_empty() {
            // Older workers only announce graphs through the output
            // block; recover the associations from there.
            graphs = parse_graphs_block(&outcome.output)
                .into_iter()
                .enumerate()
                .map(|(idx, (name, path))| GraphRef {
                    name,
                    absolute_path: path,
                    created_at: chrono::Utc::now(),
                    sequence: idx as u32 + 1,
                })
                .collect();
        }
        let mut entries = self.entries.lock().unwrap();
        *entries = graphs;
    }

    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        let bare = name.strip_suffix(".png").unwrap_or(name);
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|graph| graph.name == bare)
            .map(|graph| PathBuf::from(&graph.absolute_path))
    }

    pub fn list(&self) -> Vec<GraphRef> {
        self.entries.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn graph(name: &str, seq: u32) -> GraphRef {
        GraphRef {
            name: name.to_string(),
            absolute_path: format!("/tmp/graphs/{name}.png"),
            created_at: Utc::now(),
            sequence: seq,
        }
    }

    fn success_with(graphs: Vec<GraphRef>) -> RunOutcome {
        RunOutcome {
            status: RunStatus::Success,
            output: String::new(),
            log_path: String::new(),
            graphs,
        }
    }

    #[test]
    fn block_round_trips_through_parser() {
        let graphs = vec![graph("graph1", 1), graph("graph2", 2)];
        let block = render_graphs_block(&graphs);
        let parsed = parse_graphs_block(&block);
        assert_eq!(
            parsed,
            vec![
                ("graph1".to_string(), "/tmp/graphs/graph1.png".to_string()),
                ("graph2".to_string(), "/tmp/graphs/graph2.png".to_string()),
            ]
        );
    }

    #[test]
    fn parser_ignores_output_before_the_block() {
        let output = format!(
            "regression table here\n. display 1\n{}",
            render_graphs_block(&[graph("price_mpg", 1)])
        );
        let parsed = parse_graphs_block(&output);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "price_mpg");
    }

    #[test]
    fn parser_strips_cmd_annotations() {
        let output = "GRAPHS DETECTED: 1 graph(s) created\n  \u{2022} g1: /tmp/g1.png [CMD: scatter y x]\n";
        let parsed = parse_graphs_block(output);
        assert_eq!(parsed, vec![("g1".to_string(), "/tmp/g1.png".to_string())]);
    }

    #[test]
    fn registry_replaces_entries_on_each_successful_run() {
        let registry = GraphRegistry::default();
        registry.record_run(&success_with(vec![graph("a", 1), graph("b", 2)]));
        assert_eq!(registry.list().len(), 2);

        registry.record_run(&success_with(vec![graph("c", 1)]));
        let names: Vec<String> = registry.list().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn registry_ignores_failed_runs() {
        let registry = GraphRegistry::default();
        registry.record_run(&success_with(vec![graph("keep", 1)]));

        let failed = RunOutcome {
            status: RunStatus::Error,
            output: String::new(),
            log_path: String::new(),
            graphs: vec![graph("reject", 1)],
        };
        registry.record_run(&failed);

        let names: Vec<String> = registry.list().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["keep"]);
    }

    #[test]
    fn registry_is_single_shot_per_run() {
        // A successful run that makes no graphs clears the registry;
        // consumers persist history themselves.
        let registry = GraphRegistry::default();
        registry.record_run(&success_with(vec![graph("keep", 1)]));
        registry.record_run(&success_with(Vec::new()));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn lookup_accepts_names_with_and_without_extension() {
        let registry = GraphRegistry::default();
        registry.record_run(&success_with(vec![graph("graph2", 2)]));
        assert!(registry.lookup("graph2").is_some());
        assert!(registry.lookup("graph2.png").is_some());
        assert!(registry.lookup("missing").is_none());
    }
}
