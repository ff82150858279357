pub mod applicator;
pub mod dom;
pub mod html;
pub mod memory_dom;
pub mod selector;

pub use applicator::{
    apply_rules, is_button_like, selectors_warrant_observation, ApplyReport, Personalizer,
};
pub use dom::{DomError, ElementRef, InsertedElement, InsertionFilter, Mutator, WatchHandle};
pub use html::strip_html;
pub use memory_dom::MemoryDom;
