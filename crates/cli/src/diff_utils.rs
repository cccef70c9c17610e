//! Line diffs between diagram versions

use owo_colors::OwoColorize;
use similar::{ChangeTag, TextDiff};

/// Colored unified diff of two markup versions
///
/// Returns an empty string when the texts are identical.
pub fn generate_unified_diff(old_markup: &str, new_markup: &str, context_lines: usize) -> String {
    let diff = TextDiff::from_lines(old_markup, new_markup);
    let mut output = String::new();

    for (hunk_idx, hunk) in diff.unified_diff().context_radius(context_lines).iter_hunks().enumerate() {
        if hunk_idx > 0 {
            output.push('\n');
        }

        let header = format!("{}", hunk.header());
        output.push_str(&format!("    {}\n", header.cyan()));

        for change in hunk.iter_changes() {
            let line: &str = change.value();
            match change.tag() {
                ChangeTag::Delete => output.push_str(&format!("    {}", format!("-{}", line).red())),
                ChangeTag::Insert => output.push_str(&format!("    {}", format!("+{}", line).green())),
                ChangeTag::Equal => output.push_str(&format!("    {}", format!(" {}", line).dimmed())),
            }
            if !line.ends_with('\n') {
                output.push('\n');
            }
        }
    }

    output
}

/// Inserted and deleted line counts
pub fn line_stats(old_markup: &str, new_markup: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old_markup, new_markup);
    diff.iter_all_changes().fold((0, 0), |(ins, del), change| match change.tag() {
        ChangeTag::Insert => (ins + 1, del),
        ChangeTag::Delete => (ins, del + 1),
        ChangeTag::Equal => (ins, del),
    })
}
