use kairos_common::{ChatMessage, Role};

// Fragments echoing these are dropped before filtering
const ECHOED_ROLE_MARKERS: &[&str] = &["<|assistant|>", "[assistant]"];

/// Section headers of the instruction-style prompt
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_header: String,
    pub user_header: String,
    pub assistant_header: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_header: "### System:".to_string(),
            user_header: "### User:".to_string(),
            assistant_header: "### Assistant:".to_string(),
        }
    }
}

/// Template engine for turning a conversation into a completion prompt
pub struct TemplateEngine;

impl TemplateEngine {
    /// Format the system prompt and history into a single prompt.
    ///
    /// Every turn is written as its header line, the content and a blank
    /// line. When the last message is from the user the assistant header
    /// is appended so the model answers next.
    pub fn format_prompt(
        history: &[ChatMessage],
        system_prompt: &str,
        template: &PromptTemplate,
    ) -> String {
        let mut prompt = String::with_capacity(1024);

        Self::write_section(&mut prompt, &template.system_header, system_prompt);

        for message in history {
            let header = match message.role {
                Role::User => &template.user_header,
                Role::Assistant => &template.assistant_header,
            };
            Self::write_section(&mut prompt, header, &message.content);
        }

        if matches!(history.last(), Some(m) if m.role == Role::User) {
            prompt.push_str(&template.assistant_header);
        }

        prompt
    }

    fn write_section(prompt: &mut String, header: &str, content: &str) {
        prompt.reserve(header.len() + content.len() + 3);
        prompt.push_str(header);
        prompt.push('\n');
        prompt.push_str(content);
        prompt.push_str("\n\n");
    }

    /// Whether a raw fragment is just the model repeating an assistant tag
    pub fn is_echoed_role_marker(fragment: &str) -> bool {
        ECHOED_ROLE_MARKERS.iter().any(|m| fragment.contains(m))
    }
}
