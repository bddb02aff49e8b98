//! Assembles persisted stage outputs into one document.

use crate::checkpoint::write_atomic;
use crate::graph::StageGraph;
use crate::models::{PipelineError, Result, TaskResult};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Output format for assembled results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// One section per chunk, one subsection per stage
    #[default]
    Markdown,
    /// One TaskResult JSON object per line
    Jsonl,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "jsonl" => Ok(Self::Jsonl),
            other => Err(format!("unknown report format '{other}' (expected markdown or jsonl)")),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markdown => write!(f, "markdown"),
            Self::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// Orders results by chunk, then by the stage's position in the graph.
pub struct ReportWriter<'a> {
    graph: &'a StageGraph,
}

impl<'a> ReportWriter<'a> {
    pub fn new(graph: &'a StageGraph) -> Self {
        Self { graph }
    }

    /// Stage position in declaration order; unknown stages sort last.
    fn stage_rank(&self, result: &TaskResult) -> usize {
        self.graph
            .stages()
            .position(|s| s.name() == &result.stage_name)
            .unwrap_or(usize::MAX)
    }

    fn ordered<'r>(&self, results: &'r [TaskResult]) -> Vec<&'r TaskResult> {
        let mut ordered: Vec<&TaskResult> = results.iter().collect();
        ordered.sort_by(|a, b| match a.chunk_index.cmp(&b.chunk_index) {
            Ordering::Equal => (self.stage_rank(a), &a.stage_name)
                .cmp(&(self.stage_rank(b), &b.stage_name)),
            other => other,
        });
        ordered
    }

    /// Render a combined Markdown analysis.
    pub fn render_markdown(&self, run_id: &str, results: &[TaskResult]) -> String {
        let mut out = format!("# Analysis: {run_id}\n");
        let mut current_chunk = None;

        for result in self.ordered(results) {
            if current_chunk != Some(result.chunk_index) {
                current_chunk = Some(result.chunk_index);
                out.push_str(&format!("\n## Chunk {}\n", result.chunk_index));
            }
            out.push_str(&format!(
                "\n### {}\n\n{}\n",
                result.stage_name,
                result.output_text.trim_end()
            ));
        }
        out
    }

    /// Render one JSON object per result.
    pub fn render_jsonl(&self, results: &[TaskResult]) -> Result<String> {
        let mut out = String::new();
        for result in self.ordered(results) {
            let line = serde_json::to_string(result)
                .map_err(|e| PipelineError::Serialization(format!("task result: {e}")))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn render(&self, format: ReportFormat, run_id: &str, results: &[TaskResult]) -> Result<String> {
        match format {
            ReportFormat::Markdown => Ok(self.render_markdown(run_id, results)),
            ReportFormat::Jsonl => self.render_jsonl(results),
        }
    }

    /// Render and write atomically to `path`.
    pub fn write(
        &self,
        path: &Path,
        format: ReportFormat,
        run_id: &str,
        results: &[TaskResult],
    ) -> Result<()> {
        let rendered = self.render(format, run_id, results)?;
        write_atomic(path, rendered.as_bytes())?;
        info!(
            path = %path.display(),
            format = %format,
            results = results.len(),
            "Report written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Stage, StageName};
    use tempfile::TempDir;

    fn graph() -> StageGraph {
        StageGraph::new(vec![
            vec![Stage::new("Zeta", "z").unwrap(), Stage::new("Alpha", "a").unwrap()],
            vec![Stage::new("Summary", "s").unwrap()],
        ])
        .unwrap()
    }

    fn result(chunk: usize, stage: &str, text: &str) -> TaskResult {
        TaskResult::new(chunk, StageName::new(stage).unwrap(), text.to_string())
    }

    #[test]
    fn test_markdown_follows_graph_order() {
        let graph = graph();
        let results = vec![
            result(1, "Zeta", "z1"),
            result(0, "Summary", "s0"),
            result(0, "Alpha", "a0"),
            result(0, "Zeta", "z0\n"),
        ];

        let md = ReportWriter::new(&graph).render_markdown("acme", &results);
        assert_eq!(
            md,
            "# Analysis: acme\n\
             \n## Chunk 0\n\
             \n### Zeta\n\nz0\n\
             \n### Alpha\n\na0\n\
             \n### Summary\n\ns0\n\
             \n## Chunk 1\n\
             \n### Zeta\n\nz1\n"
        );
    }

    #[test]
    fn test_jsonl_one_line_per_result() {
        let graph = graph();
        let results = vec![result(0, "Alpha", "a"), result(0, "Zeta", "z")];

        let jsonl = ReportWriter::new(&graph).render_jsonl(&results).unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"stage_name\":\"Zeta\""));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("Markdown".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("jsonl".parse::<ReportFormat>().unwrap(), ReportFormat::Jsonl);
        assert!("csv".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.md");
        let graph = graph();

        ReportWriter::new(&graph)
            .write(&path, ReportFormat::Markdown, "run", &[result(0, "Alpha", "a")])
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("### Alpha"));
    }
}
