//! Inline keyboards
//!
//! Callback data uses short prefixed forms routed by the daemon's
//! callback handler: `perm:`, `comp:`, `rate:`, `confirm:`, `undo:`,
//! `suggest:`, `pick:`, `status:refresh`.

use crate::ai::Suggestion;
use crate::telegram::{button, Keyboard};
use crate::types::Session;

/// Buttons for a permission or input prompt.
pub fn permission_keyboard(session_id: &str) -> Keyboard {
    Keyboard::new()
        .row(vec![
            button("✅ Yes", &format!("perm:yes:{session_id}")),
            button("❌ No", &format!("perm:no:{session_id}")),
        ])
        .row(vec![
            button("👀 Context", &format!("perm:ctx:{session_id}")),
            button("✏️ Custom", &format!("perm:custom:{session_id}")),
        ])
}

/// Buttons for a numbered choice list, one per detected option, with the
/// free-form escape hatch underneath.
pub fn options_keyboard(session_id: &str, options: &[(u32, String)]) -> Keyboard {
    let mut keyboard = Keyboard::new();
    for (number, label) in options {
        let label: String = label.chars().take(32).collect();
        keyboard = keyboard.row(vec![button(
            &format!("{number}. {label}"),
            &format!("perm:opt{number}:{session_id}"),
        )]);
    }
    keyboard.row(vec![button("✏️ Custom", &format!("perm:custom:{session_id}"))])
}

/// Buttons attached to a completion notice when no suggestions exist.
pub fn completion_keyboard(session_id: &str) -> Keyboard {
    Keyboard::new()
        .row(vec![
            button("▶️ Run Tests", &format!("comp:test:{session_id}")),
            button("📋 Full Log", &format!("comp:log:{session_id}")),
        ])
        .row(vec![button("⏭️ New Task", &format!("comp:new:{session_id}"))])
}

/// Buttons for a rate-limited session.
pub fn rate_limit_keyboard(session_id: &str) -> Keyboard {
    Keyboard::new()
        .row(vec![
            button("▶️ Resume Now", &format!("rate:resume:{session_id}")),
            button("⏰ Auto-Resume 15m", &format!("rate:auto:{session_id}")),
        ])
        .row(vec![button("↪️ Switch Task", &format!("rate:switch:{session_id}"))])
}

/// Second-tap confirmation for a destructive action.
pub fn confirm_keyboard(action: &str, session_id: &str) -> Keyboard {
    Keyboard::new().row(vec![
        button("⚠️ Confirm", &format!("confirm:yes:{action}:{session_id}")),
        button("↩️ Cancel", &format!("confirm:no:{action}:{session_id}")),
    ])
}

/// Time-limited undo for an auto-response.
pub fn undo_keyboard(session_id: &str, rule_id: i64) -> Keyboard {
    Keyboard::new().row(vec![button("🔙 Undo", &format!("undo:{session_id}:{rule_id}"))])
}

/// One button per AI suggestion, indexed into the remembered list.
pub fn suggestion_keyboard(suggestions: &[Suggestion], session_id: &str) -> Keyboard {
    let mut keyboard = Keyboard::new();
    for (i, suggestion) in suggestions.iter().enumerate() {
        keyboard = keyboard.row(vec![button(
            &format!("💡 {}", suggestion.label),
            &format!("suggest:{i}:{session_id}"),
        )]);
    }
    keyboard.row(vec![button("📋 Full Log", &format!("comp:log:{session_id}"))])
}

/// Session picker when a message could target several sessions.
pub fn pick_keyboard(sessions: &[Session]) -> Keyboard {
    let mut keyboard = Keyboard::new();
    for session in sessions {
        keyboard = keyboard.row(vec![button(
            &format!("{} #{} {}", session.color_token, session.number, session.alias),
            &format!("pick:{}", session.id),
        )]);
    }
    keyboard
}

/// Refresh button on the status dashboard.
pub fn status_keyboard() -> Keyboard {
    Keyboard::new().row(vec![button("🔄 Refresh", "status:refresh")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Session, SessionType};

    #[test]
    fn test_callback_prefixes() {
        let value = serde_json::to_value(permission_keyboard("s1")).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["callback_data"], "perm:yes:s1");

        let value = serde_json::to_value(rate_limit_keyboard("s1")).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["callback_data"], "rate:resume:s1");

        let value = serde_json::to_value(confirm_keyboard("kill", "s1")).unwrap();
        assert_eq!(
            value["inline_keyboard"][0][0]["callback_data"],
            "confirm:yes:kill:s1"
        );

        let value = serde_json::to_value(undo_keyboard("s1", 3)).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["callback_data"], "undo:s1:3");
    }

    #[test]
    fn test_options_keyboard() {
        let options = vec![(1, "Start the server".to_string()), (2, "Quit".to_string())];
        let value = serde_json::to_value(options_keyboard("s1", &options)).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["callback_data"], "perm:opt1:s1");
        assert_eq!(value["inline_keyboard"][1][0]["text"], "2. Quit");
        assert_eq!(value["inline_keyboard"][2][0]["callback_data"], "perm:custom:s1");
    }

    #[test]
    fn test_suggestion_keyboard_indexes() {
        let suggestions = vec![
            Suggestion {
                label: "Run tests".to_string(),
                command: "cargo test".to_string(),
            },
            Suggestion {
                label: "Deploy".to_string(),
                command: "make deploy".to_string(),
            },
        ];
        let value = serde_json::to_value(suggestion_keyboard(&suggestions, "s1")).unwrap();
        assert_eq!(value["inline_keyboard"][0][0]["callback_data"], "suggest:0:s1");
        assert_eq!(value["inline_keyboard"][1][0]["callback_data"], "suggest:1:s1");
        // trailing log row
        assert_eq!(value["inline_keyboard"][2][0]["callback_data"], "comp:log:s1");
    }

    #[test]
    fn test_pick_keyboard() {
        let session = Session::new(3, "App", SessionType::Shell, "/tmp", "conductor-3", "🟢", 45);
        let value = serde_json::to_value(pick_keyboard(&[session.clone()])).unwrap();
        assert_eq!(
            value["inline_keyboard"][0][0]["callback_data"],
            format!("pick:{}", session.id)
        );
    }
}
