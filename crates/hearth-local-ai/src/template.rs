//! Prompt templates.
//!
//! Descriptors carry templates such as
//! `<|system|>\n{system_message}<|user|>\n{prompt}<|assistant|>`. The
//! server wants role prefixes (or a jinja chat template), so the text is
//! split around the two placeholders.

use crate::error::LocalAIError;

/// ChatML, used when a model does not ship its own template.
pub const CHATML_TEMPLATE: &str =
    "<|im_start|>system\n{system_message}<|im_end|>\n<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant";

const SYSTEM_PLACEHOLDER: &str = "{system_message}";
const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// A template split into the text that precedes each role's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub system_prefix: String,
    pub user_prefix: String,
    pub ai_prefix: String,
}

impl PromptTemplate {
    /// Split `template` around `{system_message}` and `{prompt}`.
    ///
    /// `{system_message}` is optional; `{prompt}` is not.
    pub fn parse(template: &str) -> Result<Self, LocalAIError> {
        let (system_prefix, rest) = match template.split_once(SYSTEM_PLACEHOLDER) {
            Some((system, rest)) => (system.to_string(), rest),
            None => (String::new(), template),
        };

        let (user_prefix, ai_prefix) = rest.split_once(PROMPT_PLACEHOLDER).ok_or_else(|| {
            LocalAIError::InvalidTemplate(format!("missing {} in '{}'", PROMPT_PLACEHOLDER, template))
        })?;

        Ok(Self {
            system_prefix,
            user_prefix: user_prefix.to_string(),
            ai_prefix: ai_prefix.to_string(),
        })
    }

    /// Render a single-turn prompt, the way the template itself reads.
    pub fn render(&self, system_message: &str, prompt: &str) -> String {
        let mut out = String::with_capacity(
            self.system_prefix.len()
                + system_message.len()
                + self.user_prefix.len()
                + prompt.len()
                + self.ai_prefix.len(),
        );
        out.push_str(&self.system_prefix);
        out.push_str(system_message);
        out.push_str(&self.user_prefix);
        out.push_str(prompt);
        out.push_str(&self.ai_prefix);
        out
    }

    /// Jinja chat template equivalent, for `--chat-template`.
    pub fn to_chat_template(&self) -> String {
        let mut out = String::from("{% for message in messages %}");
        out.push_str("{% if message['role'] == 'system' %}");
        out.push_str(&escape_jinja(&self.system_prefix));
        out.push_str("{{ message['content'] }}");
        out.push_str("{% elif message['role'] == 'user' %}");
        out.push_str(&escape_jinja(&self.user_prefix));
        out.push_str("{{ message['content'] }}");
        out.push_str("{% else %}");
        out.push_str(&escape_jinja(&self.ai_prefix));
        out.push_str("{{ message['content'] }}");
        out.push_str("{% endif %}{% endfor %}");
        out.push_str("{% if add_generation_prompt %}");
        out.push_str(&escape_jinja(&self.ai_prefix));
        out.push_str("{% endif %}");
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        match Self::parse(CHATML_TEMPLATE) {
            Ok(template) => template,
            Err(_) => Self {
                system_prefix: String::new(),
                user_prefix: String::new(),
                ai_prefix: String::new(),
            },
        }
    }
}

/// Literal text inside a jinja template must not open a tag.
fn escape_jinja(text: &str) -> String {
    if !text.contains("{{") && !text.contains("{%") && !text.contains("{#") {
        return text.to_string();
    }
    format!("{{% raw %}}{}{{% endraw %}}", text)
}
