use serde_json::{json, Value};

use crate::validation::{Severity, ValidationIssue, ValidationReport};

/// Render a validation report as plain text, grouped by severity. Used by
/// admin surfaces and template-authoring tooling.
pub fn format_text(report: &ValidationReport) -> String {
    let mut out = String::new();
    let subject = match (&report.template_id, &report.version) {
        (Some(id), Some(version)) => format!("{id}@{version}"),
        (Some(id), None) => id.clone(),
        _ => "<unknown template>".to_string(),
    };

    if report.is_valid() {
        out.push_str(&format!("{subject}: valid"));
    } else {
        out.push_str(&format!(
            "{subject}: INVALID ({} error(s))",
            report.errors().count()
        ));
    }
    if report.cached {
        out.push_str(" [cached]");
    }
    out.push('\n');

    for severity in [
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Info,
    ] {
        let issues: Vec<&ValidationIssue> = report
            .issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .collect();
        if issues.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{}:\n", severity_heading(severity)));
        for issue in issues {
            out.push_str(&format!("  [{}] {}: {}\n", issue.stage, issue.path, issue.message));
            if let Some(suggestion) = &issue.suggestion {
                out.push_str(&format!("      hint: {suggestion}\n"));
            }
        }
    }

    out.push_str(&format!(
        "\nstages completed: {}\n",
        report.stages_completed.join(", ")
    ));
    out
}

/// Structured summary suitable for API responses.
pub fn format_json(report: &ValidationReport) -> Value {
    json!({
        "valid": report.is_valid(),
        "template_id": report.template_id,
        "version": report.version,
        "issues": report.issues,
        "summary": {
            "errors": report.errors().count(),
            "warnings": report.warnings().count(),
            "info": report
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Info)
                .count(),
            "critical": report
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Critical)
                .count(),
        },
        "stages_completed": report.stages_completed,
        "cached": report.cached,
    })
}

/// One-line-per-file summary for a batch of reports.
pub fn format_batch_summary(reports: &[(String, ValidationReport)]) -> String {
    let valid = reports.iter().filter(|(_, report)| report.is_valid()).count();
    let mut out = format!(
        "validated {} template file(s): {} valid, {} invalid\n",
        reports.len(),
        valid,
        reports.len() - valid
    );
    for (path, report) in reports {
        let marker = if report.is_valid() { "ok " } else { "FAIL" };
        out.push_str(&format!(
            "  {marker} {path} ({} error(s), {} warning(s))\n",
            report.errors().count(),
            report.warnings().count()
        ));
    }
    out
}

fn severity_heading(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "critical",
        Severity::Error => "errors",
        Severity::Warning => "warnings",
        Severity::Info => "notes",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{ValidationContext, ValidationPipeline};
    use serde_json::json;

    async fn invalid_report() -> ValidationReport {
        let doc = json!({
            "template": {
                "id": "image_gen",
                "name": "Image Generation",
                "version": "not-semver",
                "interface": {
                    "inputs": {},
                    "outputs": {"image": {"type": "file"}}
                },
                "requirements": {
                    "resources": {"gpu": true, "vram_gb": 0.0, "cpu_cores": 2.0, "memory_gb": 4.0}
                }
            }
        });
        ValidationPipeline::default()
            .validate(&doc, &ValidationContext::new())
            .await
    }

    #[tokio::test]
    async fn text_report_groups_by_severity() {
        let report = invalid_report().await;
        let text = format_text(&report);
        assert!(text.contains("INVALID"));
        assert!(text.contains("errors:"));
        assert!(text.contains("template.version"));
        assert!(text.contains("stages completed:"));
    }

    #[tokio::test]
    async fn json_report_counts_summary() {
        let report = invalid_report().await;
        let value = format_json(&report);
        assert_eq!(value["valid"], false);
        assert!(value["summary"]["errors"].as_u64().unwrap() >= 2);
        assert_eq!(value["template_id"], "image_gen");
    }

    #[tokio::test]
    async fn batch_summary_counts_files() {
        let report = invalid_report().await;
        let summary = format_batch_summary(&[
            ("templates/bad.yaml".to_string(), report.clone()),
        ]);
        assert!(summary.contains("1 invalid"));
        assert!(summary.contains("FAIL templates/bad.yaml"));
    }
}
