//! Deterministic cleanup of model output before it reaches the ledger.
//!
//! Models asked for a bare table still wrap it in ```` ```markdown ```` fences
//! or echo the `<table_markdown>` tag from the prompt, use CRLF line endings,
//! forget the header separator row or repeat it mid-table. Each rule below
//! is a pure `&str → String` pass; the two entry points chain them in a
//! fixed order (line endings first, so later rules only see `\n`).

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean a model-produced Markdown table.
///
/// 1. Normalise line endings
/// 2. Strip outer fences
/// 3. Strip `<table_markdown>` wrapper tags
/// 4. Trim trailing whitespace per line
/// 5. Insert a missing header separator row
/// 6. Drop separator rows inside the table body
/// 7. Remove invisible Unicode
/// 8. Trim surrounding blank lines
pub fn clean_table_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fences(&s);
    let s = strip_wrapper_tags(&s);
    let s = trim_trailing_whitespace(&s);
    let s = fix_missing_separator(&s);
    let s = remove_mid_table_separators(&s);
    let s = remove_invisible_chars(&s);
    s.trim_matches('\n').to_string()
}

/// Clean a free-text or tagged summary.
pub fn clean_summary(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fences(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Line endings ─────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Fences and tags ──────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*?)\n?```$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

static RE_WRAPPER_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*</?table_markdown>\s*$").unwrap());

fn strip_wrapper_tags(input: &str) -> String {
    RE_WRAPPER_TAG.replace_all(input, "").to_string()
}

// ── Whitespace ───────────────────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Tables ───────────────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert `| --- | … |` after a table's first row when the second row is data.
fn fix_missing_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 2);
    let mut prev_is_row = false;

    for (i, line) in lines.iter().enumerate() {
        out.push(line.to_string());
        let starts_table = is_table_row(line) && !is_separator_row(line) && !prev_is_row;
        if starts_table {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
                let sep: String = std::iter::once("|")
                    .chain(std::iter::repeat_n(" --- |", cols))
                    .collect();
                out.push(sep);
            }
        }
        prev_is_row = is_table_row(line);
    }

    out.join("\n")
}

/// Keep only the separator in position 2 of each table block.
fn remove_mid_table_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row_in_table = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            row_in_table += 1;
            if is_separator_row(line) && row_in_table != 2 {
                continue;
            }
        } else {
            row_in_table = 0;
        }
        out.push(line);
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_wrapper_tags() {
        let raw = "```markdown\n<table_markdown>\n| A | B |\n| --- | --- |\n| 1 | 2 |\n</table_markdown>\n```";
        assert_eq!(
            clean_table_markdown(raw),
            "| A | B |\n| --- | --- |\n| 1 | 2 |"
        );
    }

    #[test]
    fn inserts_missing_separator_once() {
        let cleaned = clean_table_markdown("| A | B |\r\n| 1 | 2 |\r\n| 3 | 4 |");
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(is_separator_row(lines[1]));
        assert!(!is_separator_row(lines[2]));
    }

    #[test]
    fn drops_mid_table_separators() {
        let raw = "| A | B |\n|---|---|\n| 1 | 2 |\n|---|---|\n| 3 | 4 |";
        let cleaned = clean_table_markdown(raw);
        assert_eq!(cleaned.lines().filter(|l| is_separator_row(l)).count(), 1);
        assert!(cleaned.ends_with("| 3 | 4 |"));
    }

    #[test]
    fn well_formed_table_is_untouched() {
        let table = "| H1 | H2 |\n| :--- | ---: |\n| a | b |";
        assert_eq!(clean_table_markdown(table), table);
    }

    #[test]
    fn summary_cleanup() {
        let raw = "```\n<image>\r\n<title>\u{200B}Chart\n\n\n\n</title>\n</image>\n```  ";
        assert_eq!(clean_summary(raw), "<image>\n<title>Chart\n\n</title>\n</image>");
        assert_eq!(clean_summary("  plain text \n"), "plain text");
    }
}
