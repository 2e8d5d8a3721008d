//! Scripted surfaces for exercising steps and the executor without a browser.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::surface::{Observation, Surface};
use crate::error::WorkflowError;

struct Page {
    current: Observation,
    /// Served in order by later observations; the last one sticks.
    pending: VecDeque<Observation>,
}

/// A surface whose pages are scripted up front.
///
/// `observe` walks through the initial pages. An action with a registered
/// transition (`"click button.save"`, `"navigate https://..."`) switches to that
/// transition's pages. A navigation without one lands on an empty page.
pub struct ScriptedSurface {
    page: Mutex<Page>,
    transitions: Mutex<HashMap<String, Vec<Observation>>>,
    actions: Mutex<Vec<String>>,
}

impl ScriptedSurface {
    pub fn new(pages: Vec<Observation>) -> Self {
        let mut pending: VecDeque<Observation> = pages.into();
        let current = pending
            .pop_front()
            .unwrap_or_else(|| Observation::new("about:blank"));
        Self {
            page: Mutex::new(Page { current, pending }),
            transitions: Mutex::new(HashMap::new()),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn on(&self, action: &str, pages: Vec<Observation>) -> &Self {
        self.transitions
            .lock()
            .unwrap()
            .insert(action.to_string(), pages);
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn url(&self) -> String {
        self.page.lock().unwrap().current.url.clone()
    }

    /// Replace the page outright, as a user reload or redirect would.
    pub fn show(&self, pages: Vec<Observation>) {
        let mut pending: VecDeque<Observation> = pages.into();
        let mut page = self.page.lock().unwrap();
        if let Some(first) = pending.pop_front() {
            page.current = first;
        }
        page.pending = pending;
    }

    fn record(&self, action: String) -> bool {
        self.actions.lock().unwrap().push(action.clone());
        let next = self.transitions.lock().unwrap().get(&action).cloned();
        match next {
            Some(pages) => {
                self.show(pages);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Surface for ScriptedSurface {
    async fn observe(&self) -> Result<Observation, WorkflowError> {
        let mut page = self.page.lock().unwrap();
        let seen = page.current.clone();
        if let Some(next) = page.pending.pop_front() {
            page.current = next;
        }
        Ok(seen)
    }

    async fn navigate(&self, url: &str) -> Result<(), WorkflowError> {
        if !self.record(format!("navigate {url}")) {
            self.show(vec![Observation::new(url)]);
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), WorkflowError> {
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), WorkflowError> {
        self.record(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn check(&self, selector: &str) -> Result<(), WorkflowError> {
        self.record(format!("check {selector}"));
        Ok(())
    }

    async fn replace_url(&self, url: &str) -> Result<(), WorkflowError> {
        self.actions.lock().unwrap().push(format!("replace_url {url}"));
        self.page.lock().unwrap().current.url = url.to_string();
        Ok(())
    }
}
