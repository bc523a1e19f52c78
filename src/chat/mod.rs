//! Persona chat: retrieved context plus conversation history in, answer out
//!
//! Message persistence belongs to the caller. This module only assembles the
//! prompt and calls the language model.

mod openai;

pub use openai::OpenAiChatModel;

use crate::config::ChatConfig;
use crate::error::Result;
use crate::retrieve::{RetrievalResult, Retriever};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat-completion language model
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// The historical figure being impersonated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Figure {
    pub id: String,
    pub name: String,
}

impl Figure {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Derive a display name from a slug: `richard-iii` becomes `Richard III`
    pub fn from_slug(slug: &str) -> Self {
        let name = slug
            .split(['-', '_'])
            .filter(|w| !w.is_empty())
            .enumerate()
            .map(|(position, word)| {
                if position > 0 && is_regnal_number(word) {
                    word.to_uppercase()
                } else {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(slug, name)
    }
}

/// Regnal numbers as they appear in slugs: `ii`, `iv`, `viii`, `xiv`
fn is_regnal_number(word: &str) -> bool {
    word.len() <= 5 && word.chars().all(|c| matches!(c.to_ascii_lowercase(), 'i' | 'v' | 'x'))
}

/// Result of one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub answer: String,
    /// The context block sent to the model, if any
    pub context: Option<String>,
    pub sources: Vec<RetrievalResult>,
}

/// Join passages into the system context block; `None` when there are none
pub fn context_block(results: &[RetrievalResult]) -> Option<String> {
    if results.is_empty() {
        return None;
    }
    Some(
        results
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

pub struct PersonaChat {
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
    persona_template: String,
    context_top_k: usize,
}

impl PersonaChat {
    pub fn new(retriever: Retriever, model: Arc<dyn ChatModel>, config: &ChatConfig) -> Self {
        Self {
            retriever,
            model,
            persona_template: config.persona_template.clone(),
            context_top_k: config.context_top_k,
        }
    }

    pub fn persona_prompt(&self, figure: &Figure) -> String {
        self.persona_template.replace("{name}", &figure.name)
    }

    /// Persona prompt, optional context block, history, then the new message
    pub fn build_messages(
        &self,
        figure: &Figure,
        context: Option<&str>,
        history: &[ChatMessage],
        user_message: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(ChatMessage::system(self.persona_prompt(figure)));
        if let Some(context) = context {
            messages.push(ChatMessage::system(format!("Context:\n{}", context)));
        }
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(user_message));
        messages
    }

    /// Answer `user_message` in character.
    ///
    /// If retrieval fails the turn still goes ahead without context; only a
    /// model failure is an error.
    pub async fn respond(
        &self,
        figure: &Figure,
        history: &[ChatMessage],
        user_message: &str,
    ) -> Result<ChatTurn> {
        let sources = match self
            .retriever
            .search(user_message, &figure.id, self.context_top_k)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(figure = %figure.id, error = %e, "Retrieval failed; answering without context");
                Vec::new()
            }
        };

        let context = context_block(&sources);
        let messages = self.build_messages(figure, context.as_deref(), history, user_message);
        debug!(
            figure = %figure.id,
            model = self.model.model_name(),
            messages = messages.len(),
            passages = sources.len(),
            "Calling chat model"
        );

        let answer = self.model.complete(&messages).await?;
        Ok(ChatTurn {
            answer,
            context,
            sources,
        })
    }
}
