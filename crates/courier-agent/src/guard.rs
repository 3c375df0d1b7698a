//! Guardrail: classify the user's request, then hold action-type turns to
//! the rule that they must end in tool use (or at least a concrete script
//! plan). Violations trigger a hint-and-retry; three strikes abort the turn.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::protocol::MessagesResponse;

/// Violations tolerated before the turn fails.
pub const MAX_GUARD_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Conversational — may be answered with plain text.
    Dialogue,
    /// Requires doing something; the response must carry tool use.
    Action,
}

/// Patterns that mark a message as plain conversation.
const DIALOGUE_PATTERNS: &[&str] = &[
    r"^你好",
    r"^hi\b",
    r"^hello\b",
    r"^hey\b",
    r"^早上好",
    r"^晚上好",
    r"^谢谢",
    r"^感谢",
    r"^thank",
    r"^再见",
    r"^bye\b",
    r"什么是.+",
    r".+是什么",
    r"^what is\b",
    r"^what's\b",
    r"怎么理解",
    r"请解释",
    r"^explain\b",
    r"^好的$",
    r"^明白$",
    r"^知道了$",
    r"^ok$",
    r"^okay$",
];

/// Patterns that mark a message as an action request: imperatives,
/// file/skill references, scheduling phrases.
const ACTION_PATTERNS: &[&str] = &[
    r"打开",
    r"创建",
    r"写.+文件",
    r"查.+",
    r"搜索",
    r"提醒",
    r"帮我",
    r"执行",
    r"运行",
    r"删除",
    r"修改",
    r"更新",
    r"发送",
    r"截图",
    r"下载",
    r"安装",
    r"设置.+提醒",
    r"\d+分钟后",
    r"每天.+点",
    r"\bopen\b",
    r"\bcreate\b",
    r"\bwrite\b",
    r"\bdelete\b",
    r"\bsearch\b",
    r"\brun\b",
    r"\binstall\b",
    r"\bremind\b",
    r"\bdownload\b",
    r"\bschedule\b",
    r"\bfile\b",
    r"\bskill\b",
    r"\bwindow\b",
];

/// The model "mentioning" a script counts as intent even without a
/// tool_use block — it is about to write one.
const SCRIPT_INTENT_PATTERNS: &[&str] = &[
    r"write_file.*\.py",
    r"run_shell.*python",
    r"创建.+脚本",
    r"写.+代码",
];

fn compiled(patterns: &[&str], slot: &'static OnceLock<Vec<Regex>>) -> &'static [Regex] {
    slot.get_or_init(|| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("guard pattern must compile"))
            .collect()
    })
}

fn dialogue_patterns() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(DIALOGUE_PATTERNS, &SLOT)
}

fn action_patterns() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(ACTION_PATTERNS, &SLOT)
}

fn script_intent_patterns() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(SCRIPT_INTENT_PATTERNS, &SLOT)
}

/// Deterministically classify a user message. Pure — the same input always
/// yields the same label. Dialogue rules win over action rules; short
/// questions are dialogue; the default is dialogue (conservative).
pub fn classify(user_message: &str) -> TaskKind {
    let text = user_message.trim().to_lowercase();

    if (text.ends_with('?') || text.ends_with('？')) && text.chars().count() < 50 {
        return TaskKind::Dialogue;
    }

    for pattern in dialogue_patterns() {
        if pattern.is_match(&text) {
            return TaskKind::Dialogue;
        }
    }

    for pattern in action_patterns() {
        if pattern.is_match(&text) {
            return TaskKind::Action;
        }
    }

    TaskKind::Dialogue
}

/// Whether a response satisfies the guardrail for an action request:
/// at least one tool_use block, or explicit script-creation intent.
pub fn response_passes(response: &MessagesResponse) -> bool {
    if response.has_tool_calls() {
        return true;
    }
    let text = response.text();
    script_intent_patterns().iter().any(|p| p.is_match(&text))
}

/// Hint injected on a violation retry.
pub fn retry_hint() -> &'static str {
    "This is an action request: you must use tools to carry it out, not just \
     reply with text. Call the relevant tool now; if no tool fits, create a \
     script with write_file and execute it with run_shell."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentBlock, StopReason, Usage};

    fn text_response(text: &str) -> MessagesResponse {
        MessagesResponse {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            model: "test".into(),
            usage: Usage::default(),
        }
    }

    #[test]
    fn greetings_and_questions_are_dialogue() {
        assert_eq!(classify("你好"), TaskKind::Dialogue);
        assert_eq!(classify("hello there"), TaskKind::Dialogue);
        assert_eq!(classify("什么是黑洞"), TaskKind::Dialogue);
        assert_eq!(classify("thanks a lot"), TaskKind::Dialogue);
        assert_eq!(classify("how big is it?"), TaskKind::Dialogue);
    }

    #[test]
    fn imperatives_are_action() {
        assert_eq!(classify("打开百度"), TaskKind::Action);
        assert_eq!(classify("创建一个目录"), TaskKind::Action);
        assert_eq!(classify("please run the tests in that file"), TaskKind::Action);
        assert_eq!(classify("提醒我3分钟后喝水"), TaskKind::Action);
        assert_eq!(classify("install the linter"), TaskKind::Action);
    }

    #[test]
    fn classification_is_idempotent() {
        for input in ["打开百度", "你好", "write a file called x.txt", "随便说说"] {
            assert_eq!(classify(input), classify(input));
        }
    }

    #[test]
    fn default_is_dialogue() {
        assert_eq!(classify("随便聊聊今天的天气吧还不错"), TaskKind::Dialogue);
    }

    #[test]
    fn tool_use_passes_guard() {
        let resp = MessagesResponse {
            content: vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "browser_open".into(),
                input: serde_json::json!({}),
            }],
            stop_reason: StopReason::ToolUse,
            model: "test".into(),
            usage: Usage::default(),
        };
        assert!(response_passes(&resp));
    }

    #[test]
    fn plain_acknowledgement_fails_guard() {
        assert!(!response_passes(&text_response("好的，我来为你打开百度")));
    }

    #[test]
    fn script_intent_passes_guard() {
        assert!(response_passes(&text_response(
            "I'll use write_file to create fetch.py and then run it"
        )));
        assert!(response_passes(&text_response("我会创建一个脚本来处理")));
    }
}
