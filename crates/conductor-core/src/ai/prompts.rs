//! Prompt templates for the AI adapter.

/// Summarize a block of terminal output in a few sentences.
pub fn summarize_prompt(terminal_output: &str) -> String {
    format!(
        "You are a terminal output summarizer for a developer. You receive raw \
terminal output from a coding session.

Rules:
1. Summarize in 2-4 sentences maximum
2. Focus on: what happened, what succeeded, what failed
3. Include specific numbers (test counts, error counts, file names)
4. Skip noise: dependency installation details, warnings that don't matter, verbose logs
5. If there are errors, always mention the file name and error type
6. Use plain, simple English

Now summarize this terminal output:
---
{terminal_output}
---"
    )
}

/// Suggest 1-3 next actions as a JSON array of `{{label, command}}`.
pub fn suggest_prompt(
    terminal_output: &str,
    project_alias: &str,
    session_type: &str,
    working_dir: &str,
) -> String {
    format!(
        "You are a helpful coding assistant. Based on the terminal output and session \
context, suggest 1-3 logical next actions the developer should take.

Rules:
1. Each suggestion must be actionable (a specific command or instruction)
2. Order by priority (most important first)
3. Format each as: {{\"label\": \"short button text\", \"command\": \"actual command to run\"}}
4. If tests failed -> suggest viewing details or fixing
5. If build succeeded -> suggest deploy or next task
6. If error occurred -> suggest fix or debug
7. Max 3 suggestions

Session info:
- Project: {project_alias}
- Session type: {session_type}
- Working directory: {working_dir}

Terminal output (last 50 lines):
---
{terminal_output}
---

Respond in JSON array only, no other text:
[{{\"label\": \"...\", \"command\": \"...\"}}]"
    )
}

/// Parse free-text chat input into a structured command.
pub fn parse_nl_prompt(user_message: &str, session_list_json: &str, last_prompt: &str) -> String {
    format!(
        "You are a command parser for a terminal management bot. Convert the user's \
natural language message into a structured command.

Available commands:
- status: Show session status (optional: session name/number)
- input: Send text to a session (requires: session, text)
- kill: Kill a session (requires: session)
- restart: Restart a session (requires: session)
- pause: Pause a session (requires: session)
- resume: Resume a session (requires: session)
- output: Show recent output (optional: session)
- run: Execute shell command in session (requires: session, command)
- tokens: Show token usage (optional: session)
- new: Create session (requires: type [cc/sh], directory)
- help: Show help

Active sessions:
{session_list_json}

Last prompt context (if any):
{last_prompt}

User message: \"{user_message}\"

Respond in JSON only, no other text:
{{
  \"command\": \"status\",
  \"session\": null,
  \"args\": {{}},
  \"confidence\": 0.95
}}

If you cannot determine the command:
{{\"command\": \"unknown\", \"confidence\": 0.0, \"clarification\": \"Which session do you mean?\"}}"
    )
}
