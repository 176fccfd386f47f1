//! Personas ("modes"): a system prompt plus the candidate model list it uses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::providers::{ChatMessage, Role};

/// Name of the persona used when a request names none, or an unknown one.
pub const DEFAULT_PERSONA: &str = "vibe";

/// Which of the two disjoint candidate lists a persona draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    General,
    Coder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    pub family: ModelFamily,
}

/// Every configured persona plus both ordered candidate lists.
#[derive(Debug, Clone)]
pub struct PersonaSet {
    personas: HashMap<String, Persona>,
    fallback: Persona,
    general: Vec<String>,
    coder: Vec<String>,
}

impl PersonaSet {
    /// Requires a [`DEFAULT_PERSONA`] entry and two non-empty candidate lists.
    pub fn new(
        personas: Vec<Persona>,
        general: Vec<String>,
        coder: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if general.is_empty() {
            return Err(ConfigError::Invalid("models.general must not be empty".into()));
        }
        if coder.is_empty() {
            return Err(ConfigError::Invalid("models.coder must not be empty".into()));
        }
        let personas: HashMap<String, Persona> =
            personas.into_iter().map(|p| (p.name.clone(), p)).collect();
        let fallback = personas.get(DEFAULT_PERSONA).cloned().ok_or_else(|| {
            ConfigError::Invalid(format!("a '{}' persona is required", DEFAULT_PERSONA))
        })?;
        Ok(Self {
            personas,
            fallback,
            general,
            coder,
        })
    }

    /// Persona for `mode`; unknown modes fall back to [`DEFAULT_PERSONA`].
    pub fn resolve(&self, mode: &str) -> &Persona {
        self.personas.get(mode).unwrap_or(&self.fallback)
    }

    /// Candidate models, in fallback order.
    pub fn candidates(&self, persona: &Persona) -> &[String] {
        match persona.family {
            ModelFamily::General => &self.general,
            ModelFamily::Coder => &self.coder,
        }
    }

    pub fn contains(&self, mode: &str) -> bool {
        self.personas.contains_key(mode)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.personas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// System prompt, then the prior conversation, then the new user turn.
pub fn build_messages(persona: &Persona, history: &[ChatMessage], prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new(Role::System, persona.system_prompt.clone()));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::new(Role::User, prompt));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn persona(name: &str, family: ModelFamily) -> Persona {
        Persona {
            name: name.to_string(),
            system_prompt: format!("you are {}", name),
            family,
        }
    }

    fn set() -> PersonaSet {
        PersonaSet::new(
            vec![
                persona("vibe", ModelFamily::General),
                persona("ui", ModelFamily::General),
                persona("deepseek", ModelFamily::Coder),
            ],
            vec!["g1".into(), "g2".into()],
            vec!["c1".into()],
        )
        .expect("valid persona set")
    }

    #[rstest]
    #[case("vibe", "vibe")]
    #[case("ui", "ui")]
    #[case("deepseek", "deepseek")]
    #[case("", "vibe")]
    #[case("nonexistent", "vibe")]
    #[case("VIBE", "vibe")]
    fn test_resolve(#[case] mode: &str, #[case] expected: &str) {
        assert_eq!(set().resolve(mode).name, expected);
    }

    #[test]
    fn test_unknown_mode_uses_general_list() {
        let set = set();
        let p = set.resolve("made-up");
        assert_eq!(set.candidates(p), &["g1".to_string(), "g2".to_string()]);
    }

    #[test]
    fn test_coder_persona_uses_coder_list() {
        let set = set();
        let p = set.resolve("deepseek");
        assert_eq!(set.candidates(p), &["c1".to_string()]);
    }

    #[test]
    fn test_build_messages_order() {
        let p = persona("vibe", ModelFamily::General);
        let history = vec![
            ChatMessage::new(Role::User, "q1"),
            ChatMessage::new(Role::Assistant, "a1"),
        ];
        let msgs = build_messages(&p, &history, "q2");
        let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(msgs[0].content, "you are vibe");
        assert_eq!(msgs[3].content, "q2");
    }

    #[test]
    fn test_missing_default_persona_rejected() {
        let err = PersonaSet::new(
            vec![persona("ui", ModelFamily::General)],
            vec!["g".into()],
            vec!["c".into()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("vibe"));
    }

    #[test]
    fn test_empty_candidate_list_rejected() {
        let err = PersonaSet::new(vec![persona("vibe", ModelFamily::General)], vec![], vec!["c".into()])
            .unwrap_err();
        assert!(err.to_string().contains("models.general"));
    }

    #[test]
    fn test_names_sorted() {
        assert_eq!(set().names(), vec!["deepseek", "ui", "vibe"]);
    }
}
