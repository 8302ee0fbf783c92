/// Report Parsers - Build Tool Output → Normalized Results
///
/// **Core Responsibility:**
/// Read the XML reports the sandboxed build leaves in the workspace.
///
/// **Failure Policy:**
/// - Missing report directory/file is a legitimate empty result
/// - A corrupt test report becomes one synthetic failing outcome
/// - A corrupt style report becomes one synthetic violation
/// - Reports that are not regular files (symlinks, FIFOs, devices) or that
///   exceed `MAX_REPORT_BYTES` count as corrupt
/// Neither parser ever fails the grading run.

use grader_common::{StyleViolation, TestOutcome};
use roxmltree::{Document, Node};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

/// Largest report the host will read back from the workspace
pub const MAX_REPORT_BYTES: u64 = 16 * 1024 * 1024;

/// Read a sandbox-written report without following links or blocking
///
/// The file type is checked on the link itself, so a FIFO or a symlink to
/// a device is refused before anything is opened.
fn read_report(path: &Path, max_bytes: u64) -> io::Result<String> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.file_type().is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "report is not a regular file",
        ));
    }
    if metadata.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("report exceeds {} bytes", max_bytes),
        ));
    }

    let mut content = String::new();
    File::open(path)?
        .take(max_bytes + 1)
        .read_to_string(&mut content)?;
    if content.len() as u64 > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("report exceeds {} bytes", max_bytes),
        ));
    }
    Ok(content)
}

/// Concatenated text of a node and its descendants, trimmed
fn text_content(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn failure_message(node: Node) -> String {
    let text = text_content(node);
    if !text.is_empty() {
        return text;
    }
    match node.attribute("message") {
        Some(message) if !message.trim().is_empty() => message.trim().to_string(),
        _ => format!("test {}", node.tag_name().name()),
    }
}

fn parse_test_report(content: &str) -> Result<Vec<TestOutcome>, roxmltree::Error> {
    let doc = Document::parse(content)?;

    let outcomes = doc
        .descendants()
        .filter(|n| n.has_tag_name("testcase"))
        .map(|case| {
            let name = format!(
                "{}#{}",
                case.attribute("classname").unwrap_or_default(),
                case.attribute("name").unwrap_or_default()
            );
            let duration = case
                .attribute("time")
                .and_then(|t| t.trim().parse::<f64>().ok())
                .filter(|t| t.is_finite())
                .unwrap_or(0.0);

            let problem = case
                .descendants()
                .find(|n| n.has_tag_name("failure"))
                .or_else(|| case.descendants().find(|n| n.has_tag_name("error")));

            match problem {
                Some(node) => TestOutcome::fail(name, failure_message(node), duration),
                None => TestOutcome::pass(name, duration),
            }
        })
        .collect();

    Ok(outcomes)
}

/// Parse every `*.xml` test report in `reports_dir`, in file name order
pub fn parse_test_reports(reports_dir: &Path) -> Vec<TestOutcome> {
    let entries = match fs::read_dir(reports_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    // DirEntry::file_type does not follow symlinks; only directories are skipped
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "xml").unwrap_or(false))
        .collect();
    files.sort();

    let mut outcomes = Vec::new();
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let parsed = read_report(&path, MAX_REPORT_BYTES)
            .map_err(|e| e.to_string())
            .and_then(|content| parse_test_report(&content).map_err(|e| e.to_string()));

        match parsed {
            Ok(mut cases) => outcomes.append(&mut cases),
            Err(message) => {
                warn!(report = %file_name, error = %message, "Unreadable test report");
                outcomes.push(TestOutcome::fail(file_name, message, 0.0));
            }
        }
    }

    outcomes
}

fn parse_style_document(content: &str) -> Result<Vec<StyleViolation>, roxmltree::Error> {
    let doc = Document::parse(content)?;
    let mut violations = Vec::new();

    for file in doc.descendants().filter(|n| n.has_tag_name("file")) {
        let file_name = file.attribute("name").unwrap_or_default();
        for error in file.descendants().filter(|n| n.has_tag_name("error")) {
            violations.push(StyleViolation {
                file: file_name.to_string(),
                line: error
                    .attribute("line")
                    .and_then(|l| l.trim().parse().ok())
                    .unwrap_or(0),
                severity: error.attribute("severity").unwrap_or_default().to_string(),
                message: error.attribute("message").unwrap_or_default().to_string(),
                rule: error.attribute("source").unwrap_or_default().to_string(),
            });
        }
    }

    Ok(violations)
}

/// Parse the style report at `report_path`
pub fn parse_style_report(report_path: &Path) -> Vec<StyleViolation> {
    let content = match read_report(report_path, MAX_REPORT_BYTES) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(error = %e, "Unreadable style report");
            return vec![parse_error_violation(e.to_string())];
        }
    };

    match parse_style_document(&content) {
        Ok(violations) => violations,
        Err(e) => {
            warn!(error = %e, "Unreadable style report");
            vec![parse_error_violation(e.to_string())]
        }
    }
}

fn parse_error_violation(message: String) -> StyleViolation {
    StyleViolation {
        file: "parse-error".to_string(),
        line: 0,
        severity: "error".to_string(),
        message,
        rule: String::new(),
    }
}

/// Split outcomes into (visible, hidden) by the hidden marker
pub fn partition_hidden(outcomes: Vec<TestOutcome>, marker: &str) -> (Vec<TestOutcome>, Vec<TestOutcome>) {
    outcomes.into_iter().partition(|o| !o.name.contains(marker))
}
