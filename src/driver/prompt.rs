//! Prompt composition for agent invocations.
//!
//! The final system prompt is the base prompt, the per-kind template and a
//! sandbox addendum. Prompts are version-tagged; the version in play is
//! recorded on the session row so quality trends can be compared across
//! prompt revisions.

use crate::sandbox::SandboxKind;
use crate::store::SessionKind;

/// Bumped whenever any template text changes.
pub const PROMPT_VERSION: &str = "v4";

const BASE_SYSTEM: &str = "\
You are an autonomous software engineer working on a long-running project.
You operate in short sessions against a persistent workspace; everything
you do must leave the project in a state the next session can pick up.
Track all work through the task tools; never invent project state.
Before marking any test as passing, verify the behavior for real.";

const INITIALIZER_TEMPLATE: &str = "\
This is the project's first session. Read the specification in the
workspace (app_spec file), then build the complete roadmap:
1. Create epics in delivery order with create_epic (dense ordinals from 1).
2. Break every epic into concrete tasks with create_task or expand_epic.
3. Give every task at least one verifiable test with create_test.
4. Write an init.sh that installs project dependencies, and a
   claude-progress.md describing the roadmap for future sessions.
Do not start implementing features; this session only plans.";

const CODING_TEMPLATE: &str = "\
Continue the project. Call get_next_task and work on exactly that task:
1. start_task, then implement it in the workspace.
2. Verify every test of the task against the running application and
   record outcomes with update_test_result (a verification note is
   expected for each pass).
3. Only when all tests pass, mark the task done with update_task_status.
4. Keep claude-progress.md current and call log_session with a short
   summary before you finish.
If something is broken from a previous session, fix that first.";

const REVIEW_TEMPLATE: &str = "\
You are reviewing a completed coding session from its event log. Assess
whether the work was verified rather than merely claimed: look for browser
checks before test passes, error patterns, and skipped steps. Write a
thorough review ending with a line of the form 'Overall rating: N/10'.";

const CONTAINER_ADDENDUM: &str = "\
All shell commands must go through the exec tool, which runs inside the
project sandbox at /workspace. Do not assume host paths exist.";

const HOST_ADDENDUM: &str = "\
Shell commands run via the exec tool directly in the project workspace.
Destructive or privileged commands are blocked.";

/// A fully rendered prompt pair for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
    pub version: &'static str,
}

/// Compose the prompt for a regular (initializer/coding) session.
pub fn compose(kind: SessionKind, sandbox: SandboxKind) -> RenderedPrompt {
    let template = match kind {
        SessionKind::Initializer => INITIALIZER_TEMPLATE,
        SessionKind::Coding => CODING_TEMPLATE,
        SessionKind::Review => REVIEW_TEMPLATE,
    };
    let addendum = match sandbox {
        SandboxKind::Container | SandboxKind::Cloud => CONTAINER_ADDENDUM,
        SandboxKind::None => HOST_ADDENDUM,
    };
    RenderedPrompt {
        system: format!("{}\n\n{}", BASE_SYSTEM, addendum),
        user: template.to_string(),
        version: PROMPT_VERSION,
    }
}

/// Compose the deep-review prompt, embedding the session's raw log.
pub fn compose_review(session_number: i64, log_excerpt: &str) -> RenderedPrompt {
    let base = compose(SessionKind::Review, SandboxKind::None);
    RenderedPrompt {
        system: base.system,
        user: format!(
            "{}\n\nSession {} event log:\n\n```\n{}\n```",
            REVIEW_TEMPLATE, session_number, log_excerpt
        ),
        version: PROMPT_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_selects_the_template() {
        let init = compose(SessionKind::Initializer, SandboxKind::Container);
        let coding = compose(SessionKind::Coding, SandboxKind::Container);
        assert!(init.user.contains("first session"));
        assert!(coding.user.contains("get_next_task"));
        assert_ne!(init.user, coding.user);
    }

    #[test]
    fn sandbox_selects_the_addendum() {
        let contained = compose(SessionKind::Coding, SandboxKind::Container);
        let open = compose(SessionKind::Coding, SandboxKind::None);
        assert!(contained.system.contains("/workspace"));
        assert!(open.system.contains("directly in the project workspace"));
    }

    #[test]
    fn review_prompt_embeds_the_log() {
        let prompt = compose_review(4, "{\"event\":\"session_start\"}");
        assert!(prompt.user.contains("Session 4 event log"));
        assert!(prompt.user.contains("session_start"));
        assert_eq!(prompt.version, PROMPT_VERSION);
    }
}
