use std::io;
use std::path::{Path, PathBuf};

use crate::config::DisplayMode;

/// Join lines ending with the Engine's `///` continuation token into
/// single logical lines, so options split across lines are not
/// submitted as separate commands.
pub fn join_line_continuations(code: &str) -> String {
    let mut joined: Vec<String> = Vec::new();
    let mut current = String::new();
    for raw_line in code.lines() {
        let stripped = raw_line.trim_end();
        if let Some(head) = stripped.strip_suffix("///") {
            current.push_str(head.trim_end());
            current.push(' ');
        } else {
            current.push_str(raw_line);
            joined.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        joined.push(current);
    }
    joined.join("\n")
}

/// Comment out lines that would fight the worker for the console or
/// the log handle: `cls`, `log using`, `log close`, `capture log close`.
pub fn sanitize_submission(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for line in code.lines() {
        let trimmed = line.trim();
        let lowered = trimmed.to_lowercase();
        let hostile = lowered == "cls"
            || lowered.starts_with("log using")
            || lowered.starts_with("log close")
            || lowered.starts_with("capture log close");
        if hostile {
            out.push_str("* COMMENTED OUT BY SERVER: ");
            out.push_str(line);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

const GRAPH_COMMANDS: &[&str] = &[
    "scatter",
    "histogram",
    "twoway",
    "kdensity",
    "graph bar",
    "graph box",
    "graph dot",
    "graph pie",
    "graph matrix",
    "graph hbar",
    "graph hbox",
    "graph combine",
];

/// Add `name(graphN, replace)` to graph commands that lack a `name()`
/// option, skipping numbers already taken in the submitted code, so
/// every produced graph can be exported and indexed afterwards.
pub fn auto_name_graph_commands(code: &str) -> String {
    let mut next_number = highest_named_graph(code);
    let mut out: Vec<String> = Vec::new();
    for line in code.lines() {
        match split_graph_command(line) {
            Some((indent, command, rest)) if !contains_name_option(rest) => {
                next_number += 1;
                let name = format!("graph{next_number}");
                let named_rest = if let Some(comma) = rest.find(',') {
                    format!(
                        "{}, name({name}, replace){}",
                        &rest[..comma],
                        &rest[comma + 1..]
                    )
                } else {
                    format!("{}, name({name}, replace)", rest.trim_end())
                };
                out.push(format!("{indent}{command} {named_rest}"));
            }
            _ => out.push(line.to_string()),
        }
    }
    out.join("\n")
}

fn highest_named_graph(code: &str) -> u32 {
    let mut highest = 0;
    let lowered = code.to_lowercase();
    let mut rest = lowered.as_str();
    while let Some(idx) = rest.find("name(") {
        rest = &rest[idx + "name(".len()..];
        let inner = rest.trim_start();
        if let Some(tail) = inner.strip_prefix("graph") {
            let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(number) = digits.parse::<u32>() {
                highest = highest.max(number);
            }
        }
    }
    highest
}

fn split_graph_command(line: &str) -> Option<(&str, &str, &str)> {
    let indent_len = line.len() - line.trim_start().len();
    let (indent, body) = line.split_at(indent_len);
    let lowered = body.to_lowercase();
    for command in GRAPH_COMMANDS {
        if lowered.starts_with(command) {
            let after = &body[command.len()..];
            if after.starts_with(' ') {
                return Some((indent, &body[..command.len()], after.trim_start()));
            }
        }
    }
    None
}

fn contains_name_option(rest: &str) -> bool {
    let lowered = rest.to_lowercase();
    let mut search = lowered.as_str();
    while let Some(idx) = search.find("name") {
        let before_ok = idx == 0
            || !search[..idx]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after = search[idx + "name".len()..].trim_start();
        if before_ok && after.starts_with('(') {
            return true;
        }
        search = &search[idx + "name".len()..];
    }
    false
}

pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn apply_display_mode(mode: DisplayMode, output: &str) -> String {
    match mode {
        DisplayMode::Compact => compact_filter(output),
        DisplayMode::Full => normalize_line_endings(output),
    }
}

/// Compact-mode filter: preserve results and errors, drop the noise an
/// AI consumer pays for twice. Idempotent by construction: nothing the
/// filter emits matches any of its drop rules.
pub fn compact_filter(output: &str) -> String {
    let normalized = normalize_line_endings(output);
    let mut kept: Vec<&str> = Vec::new();
    let mut loop_depth: usize = 0;
    let mut in_definition_block = false;

    for line in normalized.lines() {
        let trimmed = line.trim();

        if in_definition_block {
            if is_block_end(trimmed) {
                in_definition_block = false;
            }
            continue;
        }

        if let Some(echo) = command_echo(trimmed) {
            if is_definition_start(echo) {
                in_definition_block = true;
                continue;
            }
            if opens_loop(echo) {
                loop_depth += 1;
            }
            continue;
        }

        if trimmed.starts_with("> ") || trimmed == ">" {
            continue;
        }

        if let Some(body) = numbered_prefix(line) {
            // Inside a loop the numbered lines are the Engine echoing
            // each iteration's commands; the values those commands
            // print arrive unnumbered and are kept below.
            if loop_depth > 0 {
                if body.trim_end().ends_with('{') && opens_loop(body) {
                    loop_depth += 1;
                } else if body.trim() == "}" {
                    loop_depth = loop_depth.saturating_sub(1);
                }
                continue;
            }
            if body.trim().is_empty() {
                continue;
            }
        }

        if is_cosmetic_note(trimmed) {
            continue;
        }

        if trimmed.is_empty() && kept.last().is_some_and(|last| last.trim().is_empty()) {
            continue;
        }

        kept.push(line);
    }

    while kept.last().is_some_and(|last| last.trim().is_empty()) {
        kept.pop();
    }
    while kept.first().is_some_and(|first| first.trim().is_empty()) {
        kept.remove(0);
    }
    kept.join("\n")
}

fn command_echo(trimmed: &str) -> Option<&str> {
    if trimmed == "." {
        return Some("");
    }
    trimmed.strip_prefix(". ")
}

fn is_definition_start(echo: &str) -> bool {
    let lowered = echo.trim().to_lowercase();
    if let Some(rest) = lowered.strip_prefix("program") {
        let rest = rest.trim_start();
        // `program drop`, `program dir`, `program list` are ordinary
        // commands, not block definitions.
        return !rest.is_empty()
            && !rest.starts_with("drop")
            && !rest.starts_with("dir")
            && !rest.starts_with("list");
    }
    lowered == "python:"
        || lowered.starts_with("python:")
        || lowered == "mata:"
        || lowered == "mata"
}

fn is_block_end(trimmed: &str) -> bool {
    trimmed == ". end" || trimmed == "end"
}

fn opens_loop(echo: &str) -> bool {
    let lowered = echo.trim_start().to_lowercase();
    (lowered.starts_with("foreach ")
        || lowered.starts_with("forvalues ")
        || lowered.starts_with("forval ")
        || lowered.starts_with("while "))
        && lowered.trim_end().ends_with('{')
}

/// Strip an `  N. ` loop/echo prefix, returning the remainder. The
/// indentation before the number is what distinguishes nesting levels,
/// so it is deliberately not required to be zero.
fn numbered_prefix(line: &str) -> Option<&str> {
    let stripped = line.trim_start();
    let digits = stripped
        .chars()
        .take_while(char::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    let rest = &stripped[digits..];
    let body = rest.strip_prefix('.')?;
    if body.is_empty() || body.starts_with(' ') {
        Some(body.trim_start())
    } else {
        None
    }
}

fn is_cosmetic_note(trimmed: &str) -> bool {
    let Some(inner) = trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) else {
        return false;
    };
    let inner = inner.trim();
    let Some(first) = inner.split_whitespace().next() else {
        return false;
    };
    if first.parse::<u64>().is_err() {
        return false;
    }
    let rest = inner[first.len()..].trim();
    rest.starts_with("real change") && rest.ends_with("made")
        || rest.starts_with("missing value") && rest.ends_with("generated")
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[derive(Debug)]
pub struct CappedOutput {
    pub text: String,
    pub truncated_to_file: Option<PathBuf>,
}

/// Enforce the response token budget. Oversized output is written in
/// full to a uniquely named file beside the session log; the inline
/// text keeps a head portion plus a marker carrying the spill path.
/// `max_tokens == 0` disables the cap.
pub fn enforce_token_cap(
    text: String,
    max_tokens: u64,
    spill_dir: &Path,
    stem: &str,
) -> io::Result<CappedOutput> {
    if max_tokens == 0 || estimate_tokens(&text) <= max_tokens {
        return Ok(CappedOutput {
            text,
            truncated_to_file: None,
        });
    }

    std::fs::create_dir_all(spill_dir)?;
    let spill_path = spill_dir.join(format!(
        "{stem}_full_{}.txt",
        ulid::Ulid::new().to_string().to_lowercase()
    ));
    std::fs::write(&spill_path, &text)?;

    let head_bytes = (max_tokens * 4) as usize;
    let head = &text[..floor_char_boundary(&text, head_bytes.min(text.len()))];
    let inline = format!(
        "{head}\n[Output exceeds {max_tokens} tokens. Full output saved to: {}]",
        spill_path.display()
    );
    Ok(CappedOutput {
        text: inline,
        truncated_to_file: Some(spill_path),
    })
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuations_join_with_single_space() {
        let code = "twoway scatter price mpg, ///\n    legend(off)";
        assert_eq!(
            join_line_continuations(code),
            "twoway scatter price mpg, legend(off)"
        );
    }

    #[test]
    fn trailing_continuation_on_last_line_is_kept() {
        let code = "display 1 + ///";
        assert_eq!(join_line_continuations(code), "display 1 + ");
    }

    #[test]
    fn non_continuation_lines_pass_through() {
        let code = "display 1\ndisplay 2";
        assert_eq!(join_line_continuations(code), code);
    }

    #[test]
    fn sanitize_comments_out_cls_and_log_commands() {
        let code = "cls\nlog using foo.log\ndisplay 42\ncapture log close\n";
        let sanitized = sanitize_submission(code);
        assert!(sanitized.contains("* COMMENTED OUT BY SERVER: cls"));
        assert!(sanitized.contains("* COMMENTED OUT BY SERVER: log using foo.log"));
        assert!(sanitized.contains("* COMMENTED OUT BY SERVER: capture log close"));
        assert!(sanitized.contains("\ndisplay 42\n"));
    }

    #[test]
    fn auto_name_adds_name_option_without_comma() {
        let named = auto_name_graph_commands("scatter price mpg");
        assert_eq!(named, "scatter price mpg, name(graph1, replace)");
    }

    #[test]
    fn auto_name_inserts_after_first_comma() {
        let named = auto_name_graph_commands("histogram price, bin(20)");
        assert_eq!(named, "histogram price, name(graph1, replace) bin(20)");
    }

    #[test]
    fn auto_name_skips_commands_that_already_have_names() {
        let code = "twoway scatter y x, name(mine)";
        assert_eq!(auto_name_graph_commands(code), code);
    }

    #[test]
    fn auto_name_counts_past_existing_graph_numbers() {
        let code = "scatter y x, name(graph3)\nkdensity price";
        let named = auto_name_graph_commands(code);
        assert!(named.contains("name(graph4, replace)"));
    }

    #[test]
    fn auto_name_ignores_non_graph_commands() {
        let code = "regress price mpg\ngraph export out.png";
        assert_eq!(auto_name_graph_commands(code), code);
    }

    #[test]
    fn compact_drops_command_echoes_and_continuations() {
        let output = ". display 42\n42\n. list price ///\n> mpg\nsome value\n";
        assert_eq!(compact_filter(output), "42\nsome value");
    }

    #[test]
    fn compact_drops_loop_echoes_but_keeps_values() {
        let output = "\
. foreach x of numlist 1/2 {\n  2. display `x'\n  3. }\n1\n2\n";
        assert_eq!(compact_filter(output), "1\n2");
    }

    #[test]
    fn compact_handles_nested_loops_by_numbered_braces() {
        let output = "\
. forvalues i = 1/2 {\n  2. forvalues j = 1/2 {\n  3. display `i'*`j'\n  4. }\n  5. }\n1\n2\n2\n4\n";
        assert_eq!(compact_filter(output), "1\n2\n2\n4");
    }

    #[test]
    fn compact_drops_program_definitions() {
        let output = "\
. program define greet\n  1. display \"hi\"\n  2. end\n\n. greet\nhi\n";
        assert_eq!(compact_filter(output), "hi");
    }

    #[test]
    fn compact_keeps_program_drop_commands_output() {
        let output = ". program drop _all\nok\n";
        assert_eq!(compact_filter(output), "ok");
    }

    #[test]
    fn compact_drops_cosmetic_notes() {
        let output = "(12 real changes made)\n(3 missing values generated)\nmean = 4.2\n";
        assert_eq!(compact_filter(output), "mean = 4.2");
    }

    #[test]
    fn compact_keeps_parenthesized_results_that_are_not_notes() {
        let output = "(sum of wgt is 2,722)\n";
        assert_eq!(compact_filter(output), "(sum of wgt is 2,722)");
    }

    #[test]
    fn compact_drops_orphaned_numbered_lines() {
        let output = "  5.\nvalue\n";
        assert_eq!(compact_filter(output), "value");
    }

    #[test]
    fn compact_keeps_numbered_list_rows_outside_loops() {
        let output = "  1. | 4099  22 |\n  2. | 4749  17 |\n";
        assert_eq!(compact_filter(output), output.trim_end());
    }

    #[test]
    fn compact_is_idempotent() {
        let output = "\
. foreach x of numlist 1/2 {\n  2. replace price = 0\n  3. }\n(2 real changes made)\n. display 1\n1\n\n\n42\n";
        let once = compact_filter(output);
        assert_eq!(compact_filter(&once), once);
    }

    #[test]
    fn crlf_and_lf_filter_identically() {
        let lf = ". display 42\n42\nresult\n";
        let crlf = lf.replace('\n', "\r\n");
        assert_eq!(compact_filter(lf), compact_filter(&crlf));
    }

    #[test]
    fn token_cap_passes_output_at_exact_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let text = "x".repeat(40);
        let capped = enforce_token_cap(text.clone(), 10, temp.path(), "session")
            .expect("cap");
        assert_eq!(capped.text, text);
        assert!(capped.truncated_to_file.is_none());
    }

    #[test]
    fn token_cap_spills_one_byte_over_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let text = "x".repeat(41);
        let capped = enforce_token_cap(text.clone(), 10, temp.path(), "session")
            .expect("cap");
        let spill = capped.truncated_to_file.expect("spill path");
        assert_eq!(std::fs::read_to_string(&spill).expect("read spill"), text);
        assert!(capped.text.contains("Output exceeds 10 tokens"));
        assert!(capped.text.contains(&spill.display().to_string()));
    }

    #[test]
    fn token_cap_zero_disables_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let text = "y".repeat(100_000);
        let capped = enforce_token_cap(text.clone(), 0, temp.path(), "session")
            .expect("cap");
        assert_eq!(capped.text, text);
        assert!(capped.truncated_to_file.is_none());
    }
}
