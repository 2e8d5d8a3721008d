//! The execution surface an agent drives: a page it can observe and act on.
//!
//! A surface navigates on its own schedule. Any action may tear the current page
//! down, so callers re-observe instead of holding on to elements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::tasks::model::{Task, TaskType};

/// Query parameters that carry the task reference through navigations.
pub const TASK_ID_PARAM: &str = "task_id";
pub const TASK_TYPE_PARAM: &str = "task_type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Link,
    Button,
    Input,
    Checkbox,
    /// A block of text, optionally with a heading in `label`.
    Text,
}

/// One interactive or textual element of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Handle used to act on the element.
    pub selector: String,
    pub kind: ElementKind,
    /// Link text, button caption, or the heading of a text block.
    pub label: String,
    /// Body of a text block or current value of an input.
    pub text: String,
    pub href: Option<String>,
    pub enabled: bool,
}

impl Element {
    fn new(selector: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            selector: selector.into(),
            kind,
            label: String::new(),
            text: String::new(),
            href: None,
            enabled: true,
        }
    }

    pub fn link(selector: impl Into<String>, label: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            href: Some(href.into()),
            ..Self::new(selector, ElementKind::Link)
        }
    }

    pub fn button(selector: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::new(selector, ElementKind::Button)
        }
    }

    pub fn input(selector: impl Into<String>) -> Self {
        Self::new(selector, ElementKind::Input)
    }

    pub fn checkbox(selector: impl Into<String>) -> Self {
        Self::new(selector, ElementKind::Checkbox)
    }

    pub fn text(selector: impl Into<String>, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
            ..Self::new(selector, ElementKind::Text)
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enabled and not marked disabled by the page.
    pub fn is_clickable(&self) -> bool {
        self.enabled
    }

    /// Label and text, for loose content matching.
    pub fn content(&self) -> String {
        match (self.label.trim(), self.text.trim()) {
            ("", text) => text.to_string(),
            (label, "") => label.to_string(),
            (label, text) => format!("{label} {text}"),
        }
    }
}

/// A snapshot of the page at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    pub elements: Vec<Element>,
}

impl Observation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            elements: Vec::new(),
        }
    }

    pub fn with(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn by_selector(&self, selector: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.selector == selector)
    }

    pub fn has(&self, selector: &str) -> bool {
        self.by_selector(selector).is_some()
    }

    pub fn find(&self, kind: ElementKind, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        self.elements.iter().filter(|e| e.kind == kind).find(|e| pred(e))
    }

    /// First clickable button whose caption satisfies `pred` (lower-cased, trimmed).
    pub fn button(&self, pred: impl Fn(&str) -> bool) -> Option<&Element> {
        self.find(ElementKind::Button, |e| {
            e.is_clickable() && pred(&e.label.trim().to_lowercase())
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| e.kind == ElementKind::Text)
    }

    /// Path component of the address, or empty when it does not parse.
    pub fn path(&self) -> String {
        Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_default()
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        let url = Url::parse(&self.url).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Resolve a possibly relative link against the current address.
    pub fn resolve(&self, href: &str) -> Option<String> {
        Url::parse(&self.url)
            .and_then(|base| base.join(href))
            .map(String::from)
            .ok()
    }
}

/// The page an agent acts through.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn observe(&self) -> Result<Observation, WorkflowError>;

    /// Load a new address. The current page, and any agent bound to it, ends.
    async fn navigate(&self, url: &str) -> Result<(), WorkflowError>;

    async fn click(&self, selector: &str) -> Result<(), WorkflowError>;

    /// Set an input's value and notify the page of the change.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), WorkflowError>;

    /// Tick a checkbox. No-op when already ticked.
    async fn check(&self, selector: &str) -> Result<(), WorkflowError>;

    /// Rewrite the current address in place without loading anything.
    async fn replace_url(&self, url: &str) -> Result<(), WorkflowError>;
}

/// Task reference carried in a surface address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryReference {
    pub task_id: Option<Uuid>,
    pub task_type: Option<TaskType>,
}

impl EntryReference {
    /// Read `task_id` / `task_type` from an address. Values that do not parse are ignored.
    pub fn from_url(url: &str) -> Self {
        let Ok(url) = Url::parse(url) else {
            return Self::default();
        };
        let mut reference = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                TASK_ID_PARAM => reference.task_id = Uuid::parse_str(value.trim()).ok(),
                TASK_TYPE_PARAM => reference.task_type = value.parse().ok(),
                _ => {}
            }
        }
        reference
    }

    pub fn points_at(&self, task: &Task) -> bool {
        self.task_id == Some(task.id) && self.task_type == Some(task.task_type)
    }
}

/// `url` with `task_type` and `task_id` set for `task`, replacing any existing values.
pub fn with_task_params(url: &str, task: &Task) -> Result<String, WorkflowError> {
    rewrite_query(url, |pairs| {
        pairs.retain(|(k, _)| k != TASK_ID_PARAM && k != TASK_TYPE_PARAM);
        pairs.push((TASK_TYPE_PARAM.to_string(), task.task_type.code().to_string()));
        pairs.push((TASK_ID_PARAM.to_string(), task.id.to_string()));
    })
}

/// `url` without `task_id`. `task_type` stays so the next lease picks the same kind of work.
pub fn without_task_id(url: &str) -> Result<String, WorkflowError> {
    rewrite_query(url, |pairs| pairs.retain(|(k, _)| k != TASK_ID_PARAM))
}

fn rewrite_query(
    url: &str,
    edit: impl FnOnce(&mut Vec<(String, String)>),
) -> Result<String, WorkflowError> {
    let mut parsed =
        Url::parse(url).map_err(|e| WorkflowError::Surface(format!("Invalid address {url}: {e}")))?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    edit(&mut pairs);
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&pairs);
    }
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reference_reads_query() {
        let id = Uuid::new_v4();
        let r = EntryReference::from_url(&format!(
            "https://getmybonus.ca/promo?x=1&task_type=GETMYBONUS_ANYCARD&task_id={id}"
        ));
        assert_eq!(r.task_id, Some(id));
        assert_eq!(r.task_type, Some(TaskType::GetmybonusAnycard));

        let r = EntryReference::from_url("https://getmybonus.ca/?task_id=garbage");
        assert_eq!(r, EntryReference::default());
        assert_eq!(EntryReference::from_url("not a url"), EntryReference::default());
    }

    #[test]
    fn task_params_replace_existing() {
        let task = Task::new(TaskType::GetmybonusAnycard, json!({}));
        let url = with_task_params(
            "https://getmybonus.ca/anycard?ref=abc&task_id=old&task_type=old",
            &task,
        )
        .unwrap();
        let r = EntryReference::from_url(&url);
        assert!(r.points_at(&task));
        assert!(url.contains("ref=abc"));
        assert_eq!(url.matches("task_id=").count(), 1);
    }

    #[test]
    fn task_id_is_stripped_and_type_kept() {
        let task = Task::new(TaskType::GetmybonusAnycard, json!({}));
        let url = with_task_params("https://getmybonus.ca/codes?ref=abc", &task).unwrap();
        let stripped = without_task_id(&url).unwrap();
        let r = EntryReference::from_url(&stripped);
        assert_eq!(r.task_id, None);
        assert_eq!(r.task_type, Some(TaskType::GetmybonusAnycard));
        assert!(stripped.contains("ref=abc"));

        let bare = format!("https://getmybonus.ca/codes?task_id={}", task.id);
        assert_eq!(without_task_id(&bare).unwrap(), "https://getmybonus.ca/codes");
        assert!(without_task_id("not a url").is_err());
    }

    #[test]
    fn observation_helpers() {
        let obs = Observation::new("https://www.anycard.ca/swap/brands?task_type=anycard_load")
            .with(Element::link("a.nav-link", "Add new card", "/swap/loadcard"))
            .with(Element::button("input.next", "Next").disabled())
            .with(Element::button("button.save", " Save "));

        assert_eq!(obs.path(), "/swap/brands");
        assert_eq!(obs.query_param("task_type").as_deref(), Some("anycard_load"));
        assert!(obs.button(|l| l == "next").is_none());
        assert_eq!(obs.button(|l| l == "save").unwrap().selector, "button.save");
        assert_eq!(
            obs.resolve("/swap/loadcard").as_deref(),
            Some("https://www.anycard.ca/swap/loadcard")
        );
    }
}
