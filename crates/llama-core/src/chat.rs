//! Chat-template formatting.

use std::ffi::{CString, c_char};

use serde::{Deserialize, Serialize};

use crate::model::LlamaModel;

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Apply a chat template to `messages`, appending an open assistant turn
/// when `add_assistant` is set. `None` template means llama.cpp's ChatML
/// default. Returns `None` when llama.cpp does not recognise the template.
pub fn apply_template(
    template: Option<&str>,
    messages: &[ChatMessage],
    add_assistant: bool,
) -> Option<String> {
    let c_tmpl = template.and_then(|t| CString::new(t).ok());
    let tmpl_ptr = c_tmpl.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

    // The CStrings must outlive both template calls.
    let c_roles: Vec<CString> = messages.iter().map(|m| c_lossless(&m.role)).collect();
    let c_contents: Vec<CString> = messages.iter().map(|m| c_lossless(&m.content)).collect();
    let c_msgs: Vec<llama_sys::llama_chat_message> = c_roles
        .iter()
        .zip(c_contents.iter())
        .map(|(r, c)| llama_sys::llama_chat_message {
            role: r.as_ptr(),
            content: c.as_ptr(),
        })
        .collect();

    let needed = unsafe {
        llama_sys::llama_chat_apply_template(
            tmpl_ptr,
            c_msgs.as_ptr(),
            c_msgs.len(),
            add_assistant,
            std::ptr::null_mut(),
            0,
        )
    };
    if needed <= 0 {
        return None;
    }

    let mut buf = vec![0u8; needed as usize + 1];
    let wrote = unsafe {
        llama_sys::llama_chat_apply_template(
            tmpl_ptr,
            c_msgs.as_ptr(),
            c_msgs.len(),
            add_assistant,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
        )
    };
    if wrote > 0 {
        buf.truncate((wrote as usize).min(buf.len()));
        Some(String::from_utf8_lossy(&buf).into_owned())
    } else {
        None
    }
}

/// Build the prompt for a single user turn, optionally preceded by a system
/// message, using the model's own template. Without a system prompt the
/// user text is passed through untouched.
pub fn build_prompt(model: &LlamaModel, system: Option<&str>, user: &str) -> String {
    let Some(system) = system.filter(|s| !s.trim().is_empty()) else {
        return user.to_string();
    };
    let messages = [ChatMessage::new("system", system), ChatMessage::new("user", user)];
    let template = model.chat_template();
    apply_template(template.as_deref(), &messages, true)
        .unwrap_or_else(|| plain_transcript(&messages))
}

/// Fallback when no template applies.
pub fn plain_transcript(messages: &[ChatMessage]) -> String {
    let mut out = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    out.push_str("\nassistant:");
    out
}

fn c_lossless(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_transcript_ends_with_open_assistant_turn() {
        let text = plain_transcript(&[
            ChatMessage::new("system", "Be brief."),
            ChatMessage::new("user", "Hi"),
        ]);
        assert_eq!(text, "system: Be brief.\nuser: Hi\nassistant:");
    }

    #[test]
    fn interior_nul_is_dropped() {
        assert_eq!(c_lossless("a\0b").to_str().unwrap(), "ab");
    }
}
