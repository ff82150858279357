use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchHandle(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomError {
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("element {0:?} is detached")]
    Detached(ElementRef),
    #[error("mutation rejected by {operation}: {reason}")]
    MutationRejected {
        operation: &'static str,
        reason: String,
    },
    #[error("no text strategy took effect on element {0:?}")]
    TextStrategiesExhausted(ElementRef),
    #[error("mutation observation unavailable: {0}")]
    WatchUnavailable(String),
}

/// An element that entered the document after the initial personalization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedElement {
    pub element: ElementRef,
    pub tag: String,
    pub input_type: Option<String>,
    /// True when a button or submit/button input sits anywhere beneath the element.
    pub contains_button: bool,
}

pub type InsertionFilter = fn(&InsertedElement) -> bool;

/// Capability over a live document. Hosts bridge this to a real DOM; [`crate::MemoryDom`]
/// implements it in memory.
pub trait Mutator {
    fn query_selector_all(&self, selector: &str) -> Result<Vec<ElementRef>, DomError>;
    fn tag_name(&self, element: ElementRef) -> Option<String>;
    fn attribute(&self, element: ElementRef, name: &str) -> Option<String>;
    fn text_content(&self, element: ElementRef) -> Option<String>;

    fn set_text_content(&mut self, element: ElementRef, text: &str) -> Result<(), DomError>;
    /// Rewrites existing text nodes in place, leaving element children untouched.
    fn replace_text_nodes(&mut self, element: ElementRef, text: &str) -> Result<(), DomError>;
    /// Removes every child node and appends a single fresh text node.
    fn replace_children_with_text(
        &mut self,
        element: ElementRef,
        text: &str,
    ) -> Result<(), DomError>;
    fn set_inner_html(&mut self, element: ElementRef, html: &str) -> Result<(), DomError>;
    fn set_attribute(&mut self, element: ElementRef, name: &str, value: &str)
        -> Result<(), DomError>;

    /// Starts reporting inserted elements that pass `filter`. Batches are handed back to
    /// the owner of the handle by the host's mutation schedule.
    fn watch(&mut self, filter: InsertionFilter) -> Result<WatchHandle, DomError>;
    fn unwatch(&mut self, handle: WatchHandle);
}
