//! 输出层：接收 ReportResult，渲染 text 或 json

use std::fmt::Write as _;

use crate::check::report::ReportResult;
use crate::check::result::{CheckResult, Status};
use crate::utils::{DiagError, Result};

pub fn display(result: &ReportResult, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", render_json(result)?),
        "text" => print!("{}", render_text(result)),
        other  => return Err(DiagError::Config(format!("unknown output format: {}", other))),
    }
    Ok(())
}

// ── JSON ────────────────────────────────────────────────────────────────────

pub fn render_json(result: &ReportResult) -> Result<String> {
    serde_json::to_string_pretty(result)
        .map_err(|e| DiagError::System(format!("JSON serialize: {}", e)))
}

// ── Text ────────────────────────────────────────────────────────────────────

pub fn render_text(result: &ReportResult) -> String {
    let mut out = String::new();
    let width = title_width(result);

    for section in &result.sections {
        print_section(&mut out, &section.title.to_uppercase());
        if section.results.is_empty() {
            out.push_str("  (nothing to report)\n");
            continue;
        }
        for r in &section.results {
            print_row(&mut out, r, width);
        }
    }

    print_section(&mut out, "SUMMARY");
    let _ = writeln!(out, "  {}", summary(result));
    out
}

fn print_section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n── {} {}", title, "─".repeat(60usize.saturating_sub(title.chars().count())));
}

fn print_row(out: &mut String, r: &CheckResult, width: usize) {
    let _ = write!(out, "  [{:<5}] {:<width$} : {}", r.status, r.title, r.value, width = width);
    if !r.message.is_empty() {
        if r.value.is_empty() {
            let _ = write!(out, "{}", r.message);
        } else {
            let _ = write!(out, "  ({})", r.message);
        }
    }
    out.push('\n');
}

fn title_width(result: &ReportResult) -> usize {
    result.sections.iter()
        .flat_map(|s| s.results.iter())
        .map(|r| r.title.chars().count())
        .max()
        .unwrap_or(0)
        .min(28)
}

fn summary(result: &ReportResult) -> String {
    let all: Vec<&CheckResult> = result.sections.iter().flat_map(|s| s.results.iter()).collect();
    let count = |status: Status| all.iter().filter(|r| r.status == status).count();
    format!(
        "{} results: {} fail, {} error, {} warn, {} pass",
        all.len(),
        count(Status::Fail),
        count(Status::Error),
        count(Status::Warn),
        count(Status::Pass),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::report::ResultSection;

    fn sample() -> ReportResult {
        ReportResult {
            version: "0.1.0".into(),
            sections: vec![
                ResultSection {
                    title: "Host".into(),
                    results: vec![
                        CheckResult::pass("Memory", "40.0%"),
                        CheckResult::warn("Disk /", "91.0%", "above 85%"),
                        CheckResult::error("Time sync", "timedatectl failed"),
                    ],
                },
                ResultSection { title: "Container".into(), results: vec![] },
            ],
        }
    }

    #[test]
    fn text_rows_are_aligned() {
        let text = render_text(&sample());
        assert!(text.contains("── HOST ──"));
        assert!(text.contains("  [PASS ] Memory    : 40.0%\n"));
        assert!(text.contains("  [WARN ] Disk /    : 91.0%  (above 85%)\n"));
        assert!(text.contains("  [ERROR] Time sync : N/A  (timedatectl failed)\n"));
    }

    #[test]
    fn empty_sections_and_summary() {
        let text = render_text(&sample());
        assert!(text.contains("── CONTAINER ──"));
        assert!(text.contains("  (nothing to report)\n"));
        assert!(text.ends_with("  3 results: 0 fail, 1 error, 1 warn, 1 pass\n"));
    }

    #[test]
    fn json_is_the_serialized_result() {
        let json = render_json(&sample()).unwrap();
        let back: ReportResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(matches!(display(&sample(), "yaml"), Err(DiagError::Config(_))));
    }
}
