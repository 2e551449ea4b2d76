//! Post-session quality signals.
//!
//! Two paths. The quick path is free: it re-reads the session's structured
//! log artifact and derives counters, issues and a 1-10 rating, all as a
//! deterministic function of the log bytes — re-running it on an unchanged
//! log produces an identical payload. The deep path costs an extra agent
//! invocation and runs in the background; it attaches a second quality
//! check to the same session and never touches the session row itself.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::Config;
use crate::driver::{self, AgentInvocation, prompt};
use crate::events::SessionEvent;
use crate::logsink::{self, LogCounters};
use crate::store::{CheckType, QualityIssue, Session, SessionKind, StoreHandle};

/// How many preceding events may separate a browser check from the test
/// pass it verifies.
const VERIFICATION_WINDOW: usize = 10;

/// Error-rate buckets, worst first: (threshold, rating penalty).
const ERROR_RATE_PENALTIES: &[(f64, i64)] = &[(0.10, 4), (0.05, 2), (0.02, 1)];

/// Rating ceiling for coding sessions that never opened the browser.
const NO_BROWSER_CEILING: i64 = 3;

/// Everything the quick path derives from one log artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogAnalysis {
    pub counters: LogCounters,
    /// update_test_result(pass) calls with a browser check in the
    /// preceding window.
    pub verified_passes: u64,
    /// ...and those without.
    pub unverified_passes: u64,
    pub total_events: u64,
}

impl LogAnalysis {
    pub fn error_rate(&self) -> f64 {
        if self.counters.tool_uses == 0 {
            return 0.0;
        }
        self.counters.errors as f64 / self.counters.tool_uses as f64
    }
}

/// Parse a structured log artifact. A truncated trailing line (crash
/// mid-write) is skipped, not an error.
pub fn analyze_log(path: &Path) -> Result<LogAnalysis> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session log {}", path.display()))?;
    let mut analysis = LogAnalysis::default();
    // (tool_name, was_browser_call) per event, for the look-back window.
    let mut recent: Vec<(String, bool)> = Vec::new();

    for line in content.lines() {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        analysis.total_events += 1;
        let event_kind = record.get("event").and_then(|v| v.as_str()).unwrap_or("");
        match event_kind {
            "tool_use" => {
                let tool_name = record
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let is_browser = tool_name.starts_with(logsink::BROWSER_TOOL_PREFIX);
                analysis.counters.tool_uses += 1;
                *analysis
                    .counters
                    .by_tool
                    .entry(tool_name.clone())
                    .or_insert(0) += 1;
                if is_browser {
                    analysis.counters.browser_calls += 1;
                    if tool_name.contains("screenshot") {
                        analysis.counters.screenshots += 1;
                    }
                }
                if is_passing_test_update(&tool_name, record.get("input")) {
                    let verified = recent
                        .iter()
                        .rev()
                        .take(VERIFICATION_WINDOW)
                        .any(|(_, browser)| *browser);
                    if verified {
                        analysis.verified_passes += 1;
                    } else {
                        analysis.unverified_passes += 1;
                    }
                }
                recent.push((tool_name, is_browser));
            }
            "tool_result" => {
                if record
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    analysis.counters.errors += 1;
                }
                recent.push((String::new(), false));
            }
            "error" => {
                analysis.counters.errors += 1;
                recent.push((String::new(), false));
            }
            _ => recent.push((String::new(), false)),
        }
    }
    Ok(analysis)
}

fn is_passing_test_update(tool_name: &str, input: Option<&Value>) -> bool {
    if tool_name != "update_test_result" {
        return false;
    }
    input
        .and_then(|v| v.get("outcome"))
        .and_then(|v| v.as_str())
        .map(|s| s == "pass")
        .unwrap_or(false)
}

/// Output of the quick path, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct QuickReview {
    pub rating: i64,
    pub critical_issues: Vec<QualityIssue>,
    pub warnings: Vec<QualityIssue>,
}

/// Deterministic rating and issue derivation. Initializer sessions are
/// exempt from browser-verification penalties: there is nothing to open a
/// browser on yet.
pub fn quick_review(analysis: &LogAnalysis, kind: SessionKind) -> QuickReview {
    let mut rating: i64 = 10;
    let mut critical_issues = Vec::new();
    let mut warnings = Vec::new();

    let is_initializer = kind == SessionKind::Initializer;

    if !is_initializer && analysis.counters.browser_calls == 0 {
        rating = rating.min(NO_BROWSER_CEILING);
        critical_issues.push(QualityIssue::new(
            "no-browser-verification",
            "session never used browser automation to verify its work",
        ));
    }

    let error_rate = analysis.error_rate();
    for (threshold, penalty) in ERROR_RATE_PENALTIES {
        if error_rate >= *threshold {
            rating -= penalty;
            let message = format!(
                "{} of {} tool calls errored ({:.1}%)",
                analysis.counters.errors,
                analysis.counters.tool_uses,
                error_rate * 100.0
            );
            if *threshold >= 0.10 {
                critical_issues.push(QualityIssue::new("high-error-rate", message));
            } else {
                warnings.push(QualityIssue::new("elevated-error-rate", message));
            }
            break;
        }
    }

    let passes = analysis.verified_passes + analysis.unverified_passes;
    if !is_initializer && passes > 0 && analysis.verified_passes == 0 {
        rating -= 2;
        critical_issues.push(QualityIssue::new(
            "unverified-test-passes",
            format!(
                "{} test(s) marked passing with no browser check in the preceding {} events",
                analysis.unverified_passes, VERIFICATION_WINDOW
            ),
        ));
    } else if analysis.unverified_passes > 0 {
        warnings.push(QualityIssue::new(
            "partially-verified-passes",
            format!(
                "{} of {} passing test updates lacked a nearby browser check",
                analysis.unverified_passes, passes
            ),
        ));
    }

    if analysis.counters.tool_uses == 0 {
        warnings.push(QualityIssue::new(
            "no-tool-activity",
            "session used no tools at all",
        ));
    }

    QuickReview {
        rating: rating.clamp(1, 10),
        critical_issues,
        warnings,
    }
}

/// Run the quick path for a finalized session and persist the result.
/// Returns the rating for the deep-review trigger decision.
pub async fn run_quick(
    store: &StoreHandle,
    session: &Session,
    workspace: &Path,
) -> Result<i64> {
    let (jsonl_path, _) = logsink::artifact_paths(workspace, session.session_number, session.kind);
    let analysis = analyze_log(&jsonl_path)?;
    let review = quick_review(&analysis, session.kind);

    let session_id = session.id;
    let rating = review.rating;
    let counters = analysis.counters.clone();
    store
        .call(move |db| {
            db.attach_quality_check(
                session_id,
                CheckType::Quick,
                rating,
                counters.tool_uses,
                counters.errors,
                counters.browser_calls,
                &review.critical_issues,
                &review.warnings,
                None,
            )
        })
        .await?;
    Ok(rating)
}

/// Deep-review trigger: every fifth session, any low quick rating, or a
/// long stretch without one.
pub async fn should_run_deep(
    store: &StoreHandle,
    project_id: &str,
    session_number: i64,
    quick_rating: i64,
) -> Result<bool> {
    if session_number == 0 {
        return Ok(false);
    }
    if session_number % 5 == 0 || quick_rating < 7 {
        return Ok(true);
    }
    let project_id = project_id.to_string();
    let last = store
        .call(move |db| db.last_deep_review(&project_id))
        .await?;
    Ok(match last {
        Some(n) => session_number - n >= 5,
        None => session_number >= 5,
    })
}

/// Cap on how much raw log is fed to the reviewing agent. The tail is the
/// interesting part: it holds the completion claims.
const REVIEW_LOG_CAP: usize = 200 * 1024;

/// Run the deep path. Called on a background task; failures are recorded
/// as a `deep` check carrying a `review_error` issue and never propagate.
pub async fn run_deep(
    config: Arc<Config>,
    store: StoreHandle,
    workspace: std::path::PathBuf,
    session: Session,
    quick_rating: i64,
) {
    let result = run_deep_inner(&config, &store, &workspace, &session, quick_rating).await;
    if let Err(e) = result {
        eprintln!(
            "[review] deep review for session {} failed: {:#}",
            session.id, e
        );
        let session_id = session.id;
        let issue = QualityIssue::new("review_error", format!("{:#}", e));
        let attach = store
            .call(move |db| {
                db.attach_quality_check(
                    session_id,
                    CheckType::Deep,
                    quick_rating,
                    0,
                    0,
                    0,
                    &[issue],
                    &[],
                    None,
                )
            })
            .await;
        if let Err(e) = attach {
            eprintln!(
                "[review] could not record deep-review failure for session {}: {}",
                session.id, e
            );
        }
    }
}

async fn run_deep_inner(
    config: &Config,
    store: &StoreHandle,
    workspace: &Path,
    session: &Session,
    quick_rating: i64,
) -> Result<()> {
    let (jsonl_path, _) = logsink::artifact_paths(workspace, session.session_number, session.kind);
    let log = std::fs::read_to_string(&jsonl_path)
        .with_context(|| format!("Failed to read session log {}", jsonl_path.display()))?;
    let excerpt = tail_bytes(&log, REVIEW_LOG_CAP);

    let invocation = AgentInvocation {
        agent_cmd: config.agent_cmd.clone(),
        model: config.coding_model.clone(),
        kind: SessionKind::Review,
        prompt: prompt::compose_review(session.session_number, excerpt),
        workspace: workspace.to_path_buf(),
        buffer_cap: config.buffer_cap,
    };
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut events = driver::run(invocation, None, cancel_rx);

    let mut review_text = String::new();
    let mut failed = false;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::AssistantText { content } => {
                review_text.push_str(&content);
                review_text.push('\n');
            }
            SessionEvent::SessionEnd { status, .. } => {
                failed = status != "completed";
            }
            _ => {}
        }
    }
    if failed || review_text.trim().is_empty() {
        anyhow::bail!("review agent produced no usable output");
    }

    let review_file = logsink::review_path(workspace, session.session_number);
    std::fs::write(&review_file, &review_text)
        .with_context(|| format!("Failed to write {}", review_file.display()))?;

    // Re-extract the rating from the text; unparseable reviews reuse the
    // quick rating.
    let rating = extract_rating(&review_text).unwrap_or(quick_rating);

    let quick = {
        let session_id = session.id;
        store
            .call(move |db| db.get_quality_check(session_id, CheckType::Quick))
            .await?
    };
    let (tool_uses, errors, browser) = quick
        .map(|q| (q.tool_uses, q.errors, q.browser_verifications))
        .unwrap_or_default();

    let session_id = session.id;
    store
        .call(move |db| {
            db.attach_quality_check(
                session_id,
                CheckType::Deep,
                rating,
                tool_uses,
                errors,
                browser,
                &[],
                &[],
                Some(&review_text),
            )
        })
        .await?;
    Ok(())
}

fn tail_bytes(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut start = s.len() - cap;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Find an "Overall rating: N/10" style line.
pub fn extract_rating(text: &str) -> Option<i64> {
    let pattern = Regex::new(r"(?i)overall rating[:\s]+(\d{1,2})\s*/\s*10").ok()?;
    let captures = pattern.captures(text)?;
    let rating: i64 = captures.get(1)?.as_str().parse().ok()?;
    (1..=10).contains(&rating).then_some(rating)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogRecord, TokenUsage};
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tool_use(name: &str, input: Value) -> SessionEvent {
        SessionEvent::ToolUse {
            tool_name: name.into(),
            input,
            duration_ms: Some(1),
        }
    }

    fn write_log(events: &[SessionEvent]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for event in events {
            let record = LogRecord::now(1, event.clone());
            writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn session_frame(events: Vec<SessionEvent>) -> Vec<SessionEvent> {
        let mut framed = vec![SessionEvent::SessionStart {
            kind: "coding".into(),
            model: "m".into(),
        }];
        framed.extend(events);
        framed.push(SessionEvent::SessionEnd {
            status: "completed".into(),
            duration_seconds: 10.0,
            tool_use_count: 0,
            error_count: 0,
            tokens: TokenUsage::default(),
        });
        framed
    }

    #[test]
    fn analysis_counts_tools_errors_and_verification() {
        let file = write_log(&session_frame(vec![
            tool_use("get_next_task", json!({})),
            tool_use("browser_navigate", json!({"url": "http://localhost"})),
            tool_use("update_test_result", json!({"test_id": 1, "outcome": "pass"})),
            SessionEvent::ToolResult {
                tool_name: "exec".into(),
                content: "err".into(),
                is_error: true,
            },
            tool_use("update_test_result", json!({"test_id": 2, "outcome": "fail"})),
        ]));
        let analysis = analyze_log(file.path()).unwrap();
        assert_eq!(analysis.counters.tool_uses, 5);
        assert_eq!(analysis.counters.errors, 1);
        assert_eq!(analysis.counters.browser_calls, 1);
        assert_eq!(analysis.verified_passes, 1);
        assert_eq!(analysis.unverified_passes, 0);
    }

    #[test]
    fn pass_without_nearby_browser_check_is_unverified() {
        let mut events = vec![tool_use("browser_navigate", json!({}))];
        // Push the browser call out of the look-back window.
        for _ in 0..VERIFICATION_WINDOW {
            events.push(tool_use("exec", json!({"command": "true"})));
        }
        events.push(tool_use(
            "update_test_result",
            json!({"test_id": 1, "outcome": "pass"}),
        ));
        let file = write_log(&session_frame(events));
        let analysis = analyze_log(file.path()).unwrap();
        assert_eq!(analysis.verified_passes, 0);
        assert_eq!(analysis.unverified_passes, 1);
    }

    #[test]
    fn truncated_trailing_line_is_tolerated() {
        let file = write_log(&session_frame(vec![tool_use("exec", json!({}))]));
        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap();
        write!(handle, "{{\"ts\":\"2025-01-01T00:00:00Z\",\"event\":\"tool_u").unwrap();
        let analysis = analyze_log(file.path()).unwrap();
        assert_eq!(analysis.counters.tool_uses, 1);
    }

    #[test]
    fn coding_session_without_browser_is_capped_hard() {
        let analysis = LogAnalysis {
            counters: LogCounters {
                tool_uses: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        let review = quick_review(&analysis, SessionKind::Coding);
        assert_eq!(review.rating, NO_BROWSER_CEILING);
        assert!(
            review
                .critical_issues
                .iter()
                .any(|i| i.tag == "no-browser-verification")
        );
    }

    #[test]
    fn initializer_is_exempt_from_browser_penalty() {
        let analysis = LogAnalysis {
            counters: LogCounters {
                tool_uses: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        let review = quick_review(&analysis, SessionKind::Initializer);
        assert_eq!(review.rating, 10);
        assert!(review.critical_issues.is_empty());
    }

    #[test]
    fn error_rate_buckets_apply_single_penalty() {
        let base = |errors| LogAnalysis {
            counters: LogCounters {
                tool_uses: 100,
                errors,
                browser_calls: 5,
                ..Default::default()
            },
            verified_passes: 1,
            ..Default::default()
        };
        assert_eq!(quick_review(&base(0), SessionKind::Coding).rating, 10);
        assert_eq!(quick_review(&base(3), SessionKind::Coding).rating, 9);
        assert_eq!(quick_review(&base(7), SessionKind::Coding).rating, 8);
        assert_eq!(quick_review(&base(15), SessionKind::Coding).rating, 6);
    }

    #[test]
    fn unverified_passes_cost_two_points() {
        let analysis = LogAnalysis {
            counters: LogCounters {
                tool_uses: 40,
                browser_calls: 2,
                ..Default::default()
            },
            verified_passes: 0,
            unverified_passes: 3,
            ..Default::default()
        };
        let review = quick_review(&analysis, SessionKind::Coding);
        assert_eq!(review.rating, 8);
        assert!(
            review
                .critical_issues
                .iter()
                .any(|i| i.tag == "unverified-test-passes")
        );
    }

    #[test]
    fn rating_never_leaves_the_scale() {
        let analysis = LogAnalysis {
            counters: LogCounters {
                tool_uses: 10,
                errors: 9,
                ..Default::default()
            },
            unverified_passes: 2,
            ..Default::default()
        };
        let review = quick_review(&analysis, SessionKind::Coding);
        assert_eq!(review.rating, 1);
    }

    #[test]
    fn quick_review_is_idempotent_on_unchanged_input() {
        let file = write_log(&session_frame(vec![
            tool_use("browser_navigate", json!({})),
            tool_use("update_test_result", json!({"outcome": "pass"})),
        ]));
        let first = quick_review(&analyze_log(file.path()).unwrap(), SessionKind::Coding);
        let second = quick_review(&analyze_log(file.path()).unwrap(), SessionKind::Coding);
        assert_eq!(first, second);
    }

    #[test]
    fn rating_extraction() {
        assert_eq!(
            extract_rating("...solid work.\n\nOverall rating: 8/10\n"),
            Some(8)
        );
        assert_eq!(extract_rating("overall rating: 10 / 10"), Some(10));
        assert_eq!(extract_rating("Overall rating: 0/10"), None);
        assert_eq!(extract_rating("no rating anywhere"), None);
        assert_eq!(extract_rating("Overall rating: 42/10"), None);
    }

    #[tokio::test]
    async fn deep_trigger_rules() {
        let store = StoreHandle::new(crate::store::TaskStore::open_in_memory().unwrap());
        let project = store
            .call(|db| {
                db.create_project("demo", "/tmp/demo", None, crate::sandbox::SandboxKind::None, "")
            })
            .await
            .unwrap();

        // Session 0 never triggers.
        assert!(!should_run_deep(&store, &project.id, 0, 3).await.unwrap());
        // Low quality triggers.
        assert!(should_run_deep(&store, &project.id, 2, 6).await.unwrap());
        // Every fifth session triggers.
        assert!(should_run_deep(&store, &project.id, 5, 9).await.unwrap());
        // Otherwise, only after five sessions without a deep review.
        assert!(!should_run_deep(&store, &project.id, 3, 9).await.unwrap());
        assert!(should_run_deep(&store, &project.id, 6, 9).await.unwrap());
    }
}
