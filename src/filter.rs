//! Sender, keyword and custom-predicate filtering of messages
//!
//! Filters never fail on message content: a missing sender, subject or body
//! simply does not match. Errors come only from the filter configuration
//! (no search scope, bad regex) and are raised when the filter is built,
//! before any message is looked at.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{MailError, Result};
use crate::models::MessageRecord;

/// Custom message predicate, ANDed with the built-in filters
pub type MessagePredicate = Box<dyn Fn(&MessageRecord) -> bool + Send + Sync>;

/// Where and how to look for a keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordOptions {
    pub search_in_subject: bool,
    /// Covers both `bodyPreview` and the full body
    pub search_in_body: bool,
    pub case_sensitive: bool,
    /// Treat the keyword as a regular expression
    pub use_regex: bool,
}

impl Default for KeywordOptions {
    fn default() -> Self {
        Self {
            search_in_subject: true,
            search_in_body: true,
            case_sensitive: false,
            use_regex: false,
        }
    }
}

#[derive(Debug, Clone)]
enum KeywordMatcher {
    Literal { needle: String, case_sensitive: bool },
    Pattern(Regex),
}

impl KeywordMatcher {
    fn is_match(&self, haystack: &str) -> bool {
        match self {
            KeywordMatcher::Literal {
                needle,
                case_sensitive: true,
            } => haystack.contains(needle.as_str()),
            KeywordMatcher::Literal { needle, .. } => {
                haystack.to_lowercase().contains(needle.as_str())
            }
            KeywordMatcher::Pattern(regex) => regex.is_match(haystack),
        }
    }
}

/// Compiled keyword predicate
#[derive(Debug, Clone)]
pub struct KeywordFilter {
    pattern: String,
    matcher: KeywordMatcher,
    options: KeywordOptions,
}

impl KeywordFilter {
    pub fn new(pattern: &str, options: KeywordOptions) -> Result<Self> {
        if !options.search_in_subject && !options.search_in_body {
            return Err(MailError::InvalidFilterSpec(
                "keyword search needs the subject or the body selected".to_string(),
            ));
        }

        let matcher = if options.use_regex {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(!options.case_sensitive)
                .build()
                .map_err(|e| MailError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?;
            KeywordMatcher::Pattern(regex)
        } else if options.case_sensitive {
            KeywordMatcher::Literal {
                needle: pattern.to_string(),
                case_sensitive: true,
            }
        } else {
            KeywordMatcher::Literal {
                needle: pattern.to_lowercase(),
                case_sensitive: false,
            }
        };

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            options,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> KeywordOptions {
        self.options
    }

    /// Subject first, then preview, then full body; stops at the first hit
    pub fn matches(&self, message: &MessageRecord) -> bool {
        if self.options.search_in_subject && self.matcher.is_match(message.subject()) {
            return true;
        }
        if self.options.search_in_body {
            return self.matcher.is_match(message.body_preview())
                || self.matcher.is_match(message.body_content());
        }
        false
    }
}

/// Case-insensitive exact match on the sender address
pub fn is_from_sender(message: &MessageRecord, address: &str) -> bool {
    message
        .sender_address()
        .map(|sender| sender.to_lowercase() == address.to_lowercase())
        .unwrap_or(false)
}

/// One-shot keyword check; compile a [`KeywordFilter`] when testing many messages
pub fn contains_keyword(
    message: &MessageRecord,
    pattern: &str,
    options: KeywordOptions,
) -> Result<bool> {
    Ok(KeywordFilter::new(pattern, options)?.matches(message))
}

/// Reusable conjunction of sender, keyword and custom predicates
#[derive(Default)]
pub struct MessageFilter {
    sender: Option<String>,
    keyword: Option<KeywordFilter>,
    predicates: Vec<MessagePredicate>,
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("sender", &self.sender)
            .field("keyword", &self.keyword.as_ref().map(|k| k.pattern()))
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, address: impl Into<String>) -> Self {
        self.sender = Some(address.into());
        self
    }

    pub fn keyword(mut self, pattern: &str, options: KeywordOptions) -> Result<Self> {
        self.keyword = Some(KeywordFilter::new(pattern, options)?);
        Ok(self)
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MessageRecord) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn predicates(mut self, predicates: impl IntoIterator<Item = MessagePredicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    /// True when no criteria were added; such a filter keeps everything
    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.keyword.is_none() && self.predicates.is_empty()
    }

    pub fn matches(&self, message: &MessageRecord) -> bool {
        if let Some(sender) = &self.sender {
            if !is_from_sender(message, sender) {
                return false;
            }
        }
        if let Some(keyword) = &self.keyword {
            if !keyword.matches(message) {
                return false;
            }
        }
        self.predicates.iter().all(|predicate| predicate(message))
    }

    /// Keep matching messages, preserving their order
    pub fn apply(&self, messages: Vec<MessageRecord>) -> Vec<MessageRecord> {
        let total = messages.len();
        let kept: Vec<MessageRecord> = messages.into_iter().filter(|m| self.matches(m)).collect();
        debug!("Filter kept {} of {} message(s)", kept.len(), total);
        kept
    }
}

/// Sender, then keyword, then every custom predicate
pub fn filter_messages(
    messages: Vec<MessageRecord>,
    sender: Option<&str>,
    keyword: Option<(&str, KeywordOptions)>,
    custom_filters: Vec<MessagePredicate>,
) -> Result<Vec<MessageRecord>> {
    let mut filter = MessageFilter::new();
    if let Some(sender) = sender {
        filter = filter.sender(sender);
    }
    if let Some((pattern, options)) = keyword {
        filter = filter.keyword(pattern, options)?;
    }
    filter = filter.predicates(custom_filters);

    Ok(filter.apply(messages))
}
