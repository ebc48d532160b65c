//! Plan document parsing and queries.
//!
//! A plan is a markdown file with two logical facets: an ordered checklist
//! (`- [ ]` / `- [x]` / `- [SKIP]` lines, optionally carrying an inline
//! verify command) and an optional ordered `### Task N:` breakdown declaring
//! each task's file footprint and verify command.
//!
//! Task↔item correspondence is positional and only trusted when both
//! sequences have equal length. A checklist item may instead carry an
//! explicit `[T<N>]` tag linking it to task N; tags take precedence over
//! position and survive count mismatches. When neither form resolves, the
//! model never guesses.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static VERIFY_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*\|\s*`([^`]+)`\s*$").expect("verify suffix regex"));
static TASK_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^### Task (\d+): (.+)$").expect("task heading regex"));
static SECTION_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^## ").expect("section break regex"));
static FILE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^- (?:Create|Modify|Test|Delete): `([^`\n]+)`").expect("file line regex")
});
static VERIFY_INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*Verify:\*\*[ \t]*`([^`\n]+)`").expect("inline verify regex")
});
static VERIFY_FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\*\*Verify:\*\*\s*\n```[A-Za-z]*\n(.*?)\n```").expect("fenced verify regex")
});

/// State of one checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Unchecked,
    Checked,
    Skipped,
}

impl ItemState {
    fn marker(self) -> &'static str {
        match self {
            ItemState::Unchecked => " ",
            ItemState::Checked => "x",
            ItemState::Skipped => "SKIP",
        }
    }
}

/// One trackable work unit from the checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistItem {
    pub state: ItemState,
    /// Item text, including any trailing verify suffix.
    pub text: String,
    /// Inline verify command from a trailing `` | `cmd` `` suffix.
    pub verify: Option<String>,
    /// Zero-based line index within the plan text.
    pub line: usize,
}

/// Structured elaboration of a checklist item with a declared file footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub number: u32,
    pub title: String,
    pub files: BTreeSet<String>,
    /// Verify command from an inline `**Verify:**` line or a fenced block.
    pub verify: Option<String>,
    /// Raw section span, kept for prompt construction.
    pub section_text: String,
}

/// Parsed snapshot of a plan document.
///
/// The snapshot is read-mostly; callers reload from disk before trusting it,
/// since the backing file may be edited externally between reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    text: String,
    items: Vec<ChecklistItem>,
    tasks: Vec<TaskRecord>,
}

impl Plan {
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let items = parse_checklist(&text);
        let tasks = parse_tasks(&text);
        Self { text, items, tasks }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn checked(&self) -> usize {
        self.count(ItemState::Checked)
    }

    pub fn unchecked(&self) -> usize {
        self.count(ItemState::Unchecked)
    }

    pub fn skipped(&self) -> usize {
        self.count(ItemState::Skipped)
    }

    /// Tracked total: checked + unchecked. Skipped items are excluded.
    pub fn total(&self) -> usize {
        self.checked() + self.unchecked()
    }

    pub fn is_complete(&self) -> bool {
        self.unchecked() == 0
    }

    fn count(&self, state: ItemState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }

    /// Raw lines of the first `n` unchecked items, in document order.
    pub fn next_unchecked(&self, n: usize) -> Vec<String> {
        let lines: Vec<&str> = self.text.lines().collect();
        self.items
            .iter()
            .filter(|item| item.state == ItemState::Unchecked)
            .take(n)
            .filter_map(|item| lines.get(item.line).map(|line| (*line).to_string()))
            .collect()
    }

    /// True when the positional task↔item mapping is trustworthy.
    pub fn tasks_aligned(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.len() == self.items.len()
    }

    /// Resolve the checklist item linked to the task at `task_idx`.
    ///
    /// An explicit `[T<N>]` tag wins over position; position is only used
    /// when the sequences have equal length.
    pub fn item_index_for_task(&self, task_idx: usize) -> Option<usize> {
        let task = self.tasks.get(task_idx)?;
        let tag = format!("[T{}]", task.number);
        if let Some(idx) = self.items.iter().position(|item| item.text.contains(&tag)) {
            return Some(idx);
        }
        if self.tasks.len() == self.items.len() {
            return Some(task_idx);
        }
        None
    }

    /// Tasks whose linked checklist item is still unchecked.
    ///
    /// A task whose item cannot be resolved is included unconditionally: on a
    /// count mismatch the safe answer is the full task list, never a silent
    /// skip of pending work. When zero items are unchecked the result is
    /// empty regardless of mapping.
    pub fn unchecked_tasks(&self) -> Vec<TaskRecord> {
        if self.unchecked() == 0 {
            return Vec::new();
        }
        self.tasks
            .iter()
            .enumerate()
            .filter(|(idx, _)| match self.item_index_for_task(*idx) {
                Some(item_idx) => self.items[item_idx].state == ItemState::Unchecked,
                None => true,
            })
            .map(|(_, task)| task.clone())
            .collect()
    }
}

/// Parse checklist lines with their line indices.
pub fn parse_checklist(text: &str) -> Vec<ChecklistItem> {
    let mut items = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let (state, rest) = if let Some(rest) = line.strip_prefix("- [ ] ") {
            (ItemState::Unchecked, rest)
        } else if let Some(rest) = line.strip_prefix("- [x] ") {
            (ItemState::Checked, rest)
        } else if let Some(rest) = line.strip_prefix("- [SKIP] ") {
            (ItemState::Skipped, rest)
        } else {
            continue;
        };
        let verify = VERIFY_SUFFIX_RE
            .captures(rest)
            .map(|caps| caps[2].to_string());
        items.push(ChecklistItem {
            state,
            text: rest.to_string(),
            verify,
            line: line_idx,
        });
    }
    items
}

/// Parse `### Task N:` sections.
///
/// A section runs to the next task heading or the next `## ` heading.
/// Headings whose number does not fit a `u32` are skipped without aborting
/// the rest of the parse.
pub fn parse_tasks(text: &str) -> Vec<TaskRecord> {
    let headings: Vec<_> = TASK_HEADING_RE.captures_iter(text).collect();
    let mut tasks = Vec::new();

    for (idx, caps) in headings.iter().enumerate() {
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };
        let title = caps[2].trim().to_string();
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let end = match headings.get(idx + 1) {
            Some(next) => next.get(0).map(|m| m.start()).unwrap_or(text.len()),
            None => SECTION_BREAK_RE
                .find(&text[start..])
                .map(|m| start + m.start())
                .unwrap_or(text.len()),
        };
        let section_text = text[start..end].to_string();

        let files: BTreeSet<String> = FILE_LINE_RE
            .captures_iter(&section_text)
            .map(|c| c[1].to_string())
            .collect();
        let verify = extract_verify(&section_text);

        tasks.push(TaskRecord {
            number,
            title,
            files,
            verify,
            section_text,
        });
    }
    tasks
}

/// Extract a task's verify command: inline form first, fenced block second.
pub fn extract_verify(section_text: &str) -> Option<String> {
    if let Some(caps) = VERIFY_INLINE_RE.captures(section_text) {
        return Some(caps[1].to_string());
    }
    VERIFY_FENCED_RE
        .captures(section_text)
        .map(|caps| caps[1].trim().to_string())
}

/// Rewrite the nth checklist item to a new state, preserving everything else.
///
/// Returns `None` when `item_index` is out of range.
pub fn rewrite_item_state(text: &str, item_index: usize, state: ItemState) -> Option<String> {
    let items = parse_checklist(text);
    let item = items.get(item_index)?;

    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let line = lines.get_mut(item.line)?;
    *line = format!("- [{}] {}", state.marker(), item.text);

    let mut rebuilt = lines.join("\n");
    if text.ends_with('\n') {
        rebuilt.push('\n');
    }
    Some(rebuilt)
}
