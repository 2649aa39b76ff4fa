//! Checklist progress over markdown `- [ ]` / `- [x]` items.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+[.)])?[ \t]*\[([ xX])\][ \t]+(\S.*?)[ \t]*\r?$")
        .expect("checklist regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistProgress {
    pub checked: usize,
    pub total: usize,
    pub first_unchecked: Option<String>,
}

impl ChecklistProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.checked as f64 * 100.0) / self.total as f64).round() as u32
    }

    pub fn remaining(&self) -> usize {
        self.total - self.checked
    }

    pub fn all_checked(&self) -> bool {
        self.total > 0 && self.checked == self.total
    }
}

impl fmt::Display for ChecklistProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}%)", self.checked, self.total, self.percent())
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Scan every source for checklist items.
///
/// Items are identified by their normalised text, so the same criterion
/// appearing unchecked in the task file and checked in agent output counts
/// once, as checked. Order follows first appearance.
pub fn scan<'a, I>(sources: I) -> ChecklistProgress
where
    I: IntoIterator<Item = &'a str>,
{
    let mut items: Vec<(String, String, bool)> = Vec::new();
    for source in sources {
        for caps in ITEM_RE.captures_iter(source) {
            let checked = !caps[1].trim().is_empty();
            let text = caps[2].to_string();
            let key = normalize(&text);
            match items.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => entry.2 |= checked,
                None => items.push((key, text, checked)),
            }
        }
    }

    ChecklistProgress {
        checked: items.iter().filter(|(_, _, checked)| *checked).count(),
        total: items.len(),
        first_unchecked: items
            .iter()
            .find(|(_, _, checked)| !checked)
            .map(|(_, text, _)| text.clone()),
    }
}

pub fn contains_completion_marker(output: &str, marker: &str) -> bool {
    !marker.is_empty() && output.contains(marker)
}

/// Completed when the marker appears or every item (at least one) is checked.
pub fn is_complete(progress: &ChecklistProgress, output: &str, marker: &str) -> bool {
    contains_completion_marker(output, marker) || progress.all_checked()
}

/// Render criteria as an unchecked checklist.
pub fn render_unchecked(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- [ ] {item}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_FILE: &str = "# Task\n\n- [ ] Add parser\n- [ ] Add tests\n- [ ] Update docs\n";

    #[test]
    fn two_of_three_checked_in_output() {
        let output = "Working...\n- [x] Add parser\n- [X] add   tests\n";
        let progress = scan([TASK_FILE, output]);
        assert_eq!(progress.to_string(), "2/3 (67%)");
        assert_eq!(progress.first_unchecked.as_deref(), Some("Update docs"));
        assert!(!is_complete(&progress, output, "<promise>COMPLETE</promise>"));
    }

    #[test]
    fn all_checked_completes() {
        let output = "- [x] Add parser\n- [x] Add tests\n- [x] Update docs\n";
        let progress = scan([TASK_FILE, output]);
        assert!(progress.all_checked());
        assert!(is_complete(&progress, output, "DONE"));
    }

    #[test]
    fn empty_checklist_is_not_complete() {
        let progress = scan(["no items here"]);
        assert_eq!(progress.total, 0);
        assert_eq!(progress.to_string(), "0/0 (0%)");
        assert!(!is_complete(&progress, "", "DONE"));
    }

    #[test]
    fn marker_completes_regardless_of_items() {
        let progress = scan([TASK_FILE]);
        assert!(is_complete(
            &progress,
            "all good <promise>COMPLETE</promise>",
            "<promise>COMPLETE</promise>"
        ));
        assert!(!contains_completion_marker("anything", ""));
    }

    #[test]
    fn accepts_numbered_and_star_bullets() {
        let text = "1. [x] first\n* [ ] second\n  + [x] third\r\n";
        let progress = scan([text]);
        assert_eq!(progress.checked, 2);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.first_unchecked.as_deref(), Some("second"));
    }

    #[test]
    fn ignores_inline_brackets() {
        let progress = scan(["call foo([x]) and [ ]empty"]);
        assert_eq!(progress.total, 0);
    }

    #[test]
    fn renders_unchecked_items() {
        let rendered = render_unchecked(&["a".to_string(), "b".to_string()]);
        assert_eq!(rendered, "- [ ] a\n- [ ] b\n");
        assert_eq!(scan([rendered.as_str()]).remaining(), 2);
    }
}
