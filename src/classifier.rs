//! Output Classifier
//!
//! Best-effort extraction of structured facts from free-text assistant
//! output: changed files, test totals and an error flag. This is pattern
//! matching, not parsing; it will misclassify output that merely talks about
//! errors or quotes test summaries.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

use crate::git_ops::GitRepo;

/// Test run counts. `total == passed + failed + skipped` when `ran`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub ran: bool,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

impl TestSummary {
    pub fn all_passed(&self) -> bool {
        self.ran && self.passed == self.total
    }
}

/// Everything the classifier extracts from one output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Deduplicated, sorted
    pub files_changed: Vec<String>,
    pub tests: TestSummary,
    pub is_error: bool,
}

pub struct OutputClassifier;

// "Created: path", "Modified: path", ...
static RE_FILE_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Created|Modified|Updated|Edited|Wrote):\s+([^\n]+)").unwrap()
});

// "File 'path' created"
static RE_FILE_QUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)File\s+["']?([^\n"']+)["']?\s+(?:created|modified|updated)"#).unwrap()
});

// "Writing to path"
static RE_FILE_WRITING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Writing to\s+([^\n]+)").unwrap()
});

// pytest: "5 passed, 1 failed, 2 skipped"
static RE_PYTEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s+passed(?:,\s+(\d+)\s+failed)?(?:,\s+(\d+)\s+skipped)?").unwrap()
});

// jest: "Tests:       1 failed, 4 passed, 5 total"
static RE_JEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Tests:\s+(?:(\d+)\s+failed,\s+)?(\d+)\s+passed,\s+(\d+)\s+total").unwrap()
});

static RE_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(error|exception|failed|traceback)").unwrap()
});

fn count(cap: Option<regex::Match<'_>>) -> usize {
    cap.and_then(|m| m.as_str().parse().ok()).unwrap_or(0)
}

impl OutputClassifier {
    /// Classify output produced in `working_dir`.
    /// Also consults the working tree's unstaged changes.
    pub fn classify(output: &str, working_dir: &Path) -> Classification {
        Self::combine(output, Self::working_tree_changes(working_dir))
    }

    /// `classify` with the git2 lookup moved to the blocking pool
    pub async fn classify_off_thread(output: &str, working_dir: &Path) -> Classification {
        let dir = working_dir.to_path_buf();
        let changed = tokio::task::spawn_blocking(move || Self::working_tree_changes(&dir))
            .await
            .unwrap_or_else(|e| {
                warn!("Working tree lookup task failed: {}", e);
                Vec::new()
            });
        Self::combine(output, changed)
    }

    fn combine(output: &str, working_tree: Vec<String>) -> Classification {
        let mut files = Self::extract_files(output);
        files.extend(working_tree);

        Classification {
            files_changed: files.into_iter().collect(),
            tests: Self::extract_test_results(output),
            is_error: Self::detect_error(output),
        }
    }

    /// File paths mentioned in the text, by any of the three phrasings
    pub fn extract_files(output: &str) -> BTreeSet<String> {
        [&*RE_FILE_ACTION, &*RE_FILE_QUOTED, &*RE_FILE_WRITING]
            .iter()
            .flat_map(|re| re.captures_iter(output))
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|path| !path.is_empty())
            .collect()
    }

    /// The jest form is the more specific one and wins when both match
    pub fn extract_test_results(output: &str) -> TestSummary {
        if let Some(cap) = RE_JEST.captures(output) {
            let failed = count(cap.get(1));
            let passed = count(cap.get(2));
            let total = count(cap.get(3));
            return TestSummary {
                ran: true,
                passed,
                failed,
                skipped: total.saturating_sub(passed + failed),
                total,
            };
        }

        if let Some(cap) = RE_PYTEST.captures(output) {
            let passed = count(cap.get(1));
            let failed = count(cap.get(2));
            let skipped = count(cap.get(3));
            return TestSummary {
                ran: true,
                passed,
                failed,
                skipped,
                total: passed + failed + skipped,
            };
        }

        TestSummary::default()
    }

    /// Keyword search; flags text that merely discusses errors too
    pub fn detect_error(output: &str) -> bool {
        RE_ERROR.is_match(output)
    }

    fn working_tree_changes(working_dir: &Path) -> Vec<String> {
        match GitRepo::open(working_dir).and_then(|repo| repo.changed_files()) {
            Ok(files) => files,
            Err(e) => {
                warn!("Could not get git diff: {}", e);
                Vec::new()
            }
        }
    }
}
