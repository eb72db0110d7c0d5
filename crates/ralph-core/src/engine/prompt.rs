//! Prompt construction, the completion sentinel, and the impact table.

use regex::Regex;
use std::sync::OnceLock;

use ralph_tracker::{ImpactPlan, Task};

/// Literal token an agent must emit to claim completion.
pub const COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Title budget inside derived commit messages.
const COMMIT_TITLE_MAX: usize = 60;

fn sentinel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*promise\s*>\s*COMPLETE\s*<\s*/\s*promise\s*>").expect("static regex")
    })
}

/// Case-insensitive, whitespace-tolerant sentinel detection.
pub fn contains_completion_sentinel(text: &str) -> bool {
    sentinel_re().is_match(text)
}

/// Collapse a title to one space-separated line.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `<taskId>: <title>` with the title truncated to 60 chars.
pub fn commit_message(task_id: &str, title: &str) -> String {
    let mut title = normalize_title(title);
    if title.chars().count() > COMMIT_TITLE_MAX {
        title = title
            .chars()
            .take(COMMIT_TITLE_MAX - 3)
            .collect::<String>()
            .trim_end()
            .to_string();
        title.push_str("...");
    }
    format!("{task_id}: {title}")
}

/// Last `max_lines` lines of output, additionally capped at `max_chars`.
pub fn output_tail(text: &str, max_lines: usize, max_chars: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let mut tail = lines[start..].join("\n");
    if tail.chars().count() > max_chars {
        let skip = tail.chars().count() - max_chars;
        tail = tail.chars().skip(skip).collect();
    }
    tail
}

// ---------------------------------------------------------------------------
// Impact table
// ---------------------------------------------------------------------------

/// Render the impact plan as the markdown table embedded in prompts.
pub fn render_impact_table(plan: &ImpactPlan) -> String {
    let mut out = String::from("| Path | Change |\n| --- | --- |\n");
    for (path, change) in plan.entries() {
        out.push_str(&format!("| {path} | {change} |\n"));
    }
    if !plan.expected_checks.is_empty() {
        out.push_str("\nExpected checks: ");
        out.push_str(&plan.expected_checks.join(", "));
        out.push('\n');
    }
    out
}

/// Parse (path, change) pairs back out of rendered markdown. Inverse of
/// [`render_impact_table`] for the table body.
pub fn parse_impact_table(markdown: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in markdown.lines() {
        let line = line.trim();
        if !line.starts_with('|') {
            continue;
        }
        let cells: Vec<&str> = line
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim())
            .collect();
        if cells.len() != 2 {
            continue;
        }
        let (path, change) = (cells[0], cells[1]);
        if path == "Path" || path.chars().all(|c| c == '-' || c == ' ') {
            continue;
        }
        entries.push((path.to_string(), change.to_string()));
    }
    entries
}

// ---------------------------------------------------------------------------
// Prompt builder
// ---------------------------------------------------------------------------

/// Builds iteration prompts. The tracker-owned template wins when it renders;
/// anything wrong with it falls back to the built-in prompt rather than
/// failing the iteration.
pub struct PromptBuilder {
    template: Option<String>,
    prd_context: Option<String>,
}

impl PromptBuilder {
    pub fn new(template: Option<String>, prd_context: Option<String>) -> Self {
        Self {
            template,
            prd_context,
        }
    }

    /// Sequential-mode prompt: template (or fallback) + recent progress.
    pub fn build_sequential(&self, task: &Task, recent_progress: Option<&str>) -> String {
        let mut prompt = match &self.template {
            Some(template) => {
                render_template(template, task).unwrap_or_else(|| self.fallback_prompt(task))
            }
            None => self.fallback_prompt(task),
        };

        if let Some(progress) = recent_progress {
            if !progress.trim().is_empty() {
                prompt.push_str("\n\n## Recent progress\n\n");
                prompt.push_str(progress.trim());
                prompt.push('\n');
            }
        }
        prompt.push_str(&sentinel_instructions());
        prompt
    }

    /// Parallel-mode prompt: task content plus the required impact table.
    pub fn build_parallel(&self, task: &Task) -> String {
        let mut prompt = self.fallback_prompt(task);

        let plan = task.impact_plan().unwrap_or_default();
        prompt.push_str("\n\n## Impact\n\nYou must stay within this impact table:\n\n");
        prompt.push_str(&render_impact_table(&plan));
        prompt.push_str(&sentinel_instructions());
        prompt
    }

    fn fallback_prompt(&self, task: &Task) -> String {
        let mut prompt = format!("# Task {}: {}\n\n{}\n", task.id, task.title, task.description);
        if let Some(prd) = &self.prd_context {
            if !prd.trim().is_empty() {
                prompt.push_str("\n## Product context\n\n");
                prompt.push_str(prd.trim());
                prompt.push('\n');
            }
        }
        prompt
    }
}

/// Replace `{{task.*}}` placeholders. Returns `None` when the rendered
/// output still carries unresolved placeholders, which callers treat as a
/// renderer failure.
fn render_template(template: &str, task: &Task) -> Option<String> {
    let rendered = template
        .replace("{{task.id}}", &task.id)
        .replace("{{task.title}}", &task.title)
        .replace("{{task.description}}", &task.description);
    if rendered.contains("{{") {
        return None;
    }
    Some(rendered)
}

fn sentinel_instructions() -> String {
    format!(
        "\n## Completion\n\nWork in small, committed steps. When the task is fully done and \
         committed, output exactly `{COMPLETION_SENTINEL}` on its own line. Do not output it \
         before the working tree is clean.\n"
    )
}

/// Build the commit-recovery prompt: original prompt + changed files + a
/// bounded stdout tail + strict commit instructions.
pub fn build_recovery_prompt(
    original_prompt: &str,
    changed_files: &[String],
    stdout: &str,
) -> String {
    let tail = output_tail(stdout, 20, 2000);
    let mut prompt = String::from(original_prompt);
    prompt.push_str("\n\n## Uncommitted changes detected\n\n");
    prompt.push_str(
        "You signalled completion but the working tree is dirty. These files changed:\n\n",
    );
    for file in changed_files {
        prompt.push_str(&format!("- {file}\n"));
    }
    if !tail.trim().is_empty() {
        prompt.push_str("\nYour previous output ended with:\n\n```\n");
        prompt.push_str(&tail);
        prompt.push_str("\n```\n");
    }
    prompt.push_str(
        "\nCommit only the files relevant to this task. Do not run `git add -A`. Never touch \
         `.ralph-tui/progress.md`. Do not merge, rebase, or push. When the tree is clean, output \
         the completion token again.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_tracker::RenameEntry;

    #[test]
    fn test_sentinel_detection() {
        assert!(contains_completion_sentinel("done\n<promise>COMPLETE</promise>\n"));
        assert!(contains_completion_sentinel("<PROMISE>complete</PROMISE>"));
        assert!(contains_completion_sentinel("< promise >COMPLETE< / promise >"));
        assert!(contains_completion_sentinel("<promise>\n  COMPLETE\n</promise>"));
        assert!(!contains_completion_sentinel("promise complete"));
        assert!(!contains_completion_sentinel("<promise>ALMOST</promise>"));
    }

    #[test]
    fn test_commit_message_normalizes_and_truncates() {
        assert_eq!(commit_message("T1", "Add  README"), "T1: Add README");
        assert_eq!(
            commit_message("T1", "Line\none\n\ttwo"),
            "T1: Line one two"
        );

        let long = "x".repeat(100);
        let message = commit_message("T1", &long);
        assert!(message.ends_with("..."));
        let title = message.strip_prefix("T1: ").unwrap();
        assert_eq!(title.chars().count(), 60);
    }

    #[test]
    fn test_short_title_not_truncated() {
        let title = "y".repeat(60);
        let message = commit_message("T1", &title);
        assert!(!message.ends_with("..."));
    }

    #[test]
    fn test_output_tail_limits() {
        let text = (0..50)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let tail = output_tail(&text, 20, 2000);
        assert_eq!(tail.lines().count(), 20);
        assert!(tail.starts_with("line 30"));

        let huge = "z".repeat(5000);
        assert_eq!(output_tail(&huge, 20, 2000).chars().count(), 2000);
    }

    #[test]
    fn test_impact_table_roundtrip() {
        let plan = ImpactPlan {
            create: vec!["src/new.rs".to_string()],
            modify: vec!["src/lib.rs".to_string(), "README.md".to_string()],
            delete: vec!["old.txt".to_string()],
            rename: vec![RenameEntry {
                from: "a.rs".to_string(),
                to: "b.rs".to_string(),
            }],
            expected_checks: vec!["cargo test".to_string()],
            module_tags: vec![],
        };
        let rendered = render_impact_table(&plan);
        let parsed = parse_impact_table(&rendered);
        assert_eq!(parsed, plan.entries());
    }

    #[test]
    fn test_impact_table_roundtrip_inside_full_prompt() {
        let mut task = Task::new("T7", "Wide change");
        task.metadata.insert(
            "impact_plan".to_string(),
            serde_json::json!({"create": ["x.rs"], "modify": ["y.rs"]}),
        );
        let builder = PromptBuilder::new(None, None);
        let prompt = builder.build_parallel(&task);
        let parsed = parse_impact_table(&prompt);
        assert_eq!(
            parsed,
            vec![
                ("x.rs".to_string(), "create".to_string()),
                ("y.rs".to_string(), "modify".to_string())
            ]
        );
    }

    #[test]
    fn test_template_preferred_with_fallback() {
        let task = Task::new("T1", "Add README");
        let builder = PromptBuilder::new(
            Some("Work on {{task.id}}: {{task.title}}".to_string()),
            None,
        );
        let prompt = builder.build_sequential(&task, None);
        assert!(prompt.starts_with("Work on T1: Add README"));
        assert!(prompt.contains(COMPLETION_SENTINEL));

        // Unknown placeholder -> renderer failure -> tolerant fallback.
        let builder = PromptBuilder::new(Some("{{task.nope}}".to_string()), None);
        let prompt = builder.build_sequential(&task, None);
        assert!(prompt.contains("# Task T1: Add README"));
    }

    #[test]
    fn test_sequential_appends_progress() {
        let task = Task::new("T1", "Add README");
        let builder = PromptBuilder::new(None, None);
        let prompt = builder.build_sequential(&task, Some("- iter 1: groundwork laid"));
        assert!(prompt.contains("## Recent progress"));
        assert!(prompt.contains("groundwork laid"));
    }

    #[test]
    fn test_recovery_prompt_contents() {
        let prompt = build_recovery_prompt(
            "original",
            &["a.rs".to_string(), "b.rs".to_string()],
            "lots of output\nfinal line",
        );
        assert!(prompt.starts_with("original"));
        assert!(prompt.contains("- a.rs"));
        assert!(prompt.contains("- b.rs"));
        assert!(prompt.contains("final line"));
        assert!(prompt.contains("Do not run `git add -A`"));
        assert!(prompt.contains(".ralph-tui/progress.md"));
    }
}
