use crate::dom::{DomError, ElementRef, InsertedElement, InsertionFilter, Mutator, WatchHandle};
use crate::html::strip_html;
use crate::selector::{ElementTree, SelectorList};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Markup(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<u64>,
    children: Vec<u64>,
}

struct Watch {
    filter: InsertionFilter,
    inserted: Vec<ElementRef>,
}

/// How a mutation on a given element misbehaves; used to reproduce hostile pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interference {
    /// The operation reports an error.
    Reject,
    /// The operation reports success but leaves the element unchanged.
    Ignore,
}

/// In-memory document with a `body` root.
pub struct MemoryDom {
    nodes: BTreeMap<u64, Node>,
    next_id: u64,
    root: ElementRef,
    watches: BTreeMap<u64, Watch>,
    next_watch: u64,
    interference: BTreeMap<(u64, &'static str), Interference>,
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDom {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            1,
            Node {
                kind: NodeKind::Element {
                    tag: "body".to_string(),
                    attrs: Vec::new(),
                },
                parent: None,
                children: Vec::new(),
            },
        );
        Self {
            nodes,
            next_id: 2,
            root: ElementRef(1),
            watches: BTreeMap::new(),
            next_watch: 1,
            interference: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> ElementRef {
        self.root
    }

    pub fn append_element(
        &mut self,
        parent: ElementRef,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> Result<ElementRef, DomError> {
        let attrs = attrs
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.to_string()))
            .collect();
        let id = self.append_node(
            parent,
            NodeKind::Element {
                tag: tag.to_lowercase(),
                attrs,
            },
        )?;
        let element = ElementRef(id);
        for watch in self.watches.values_mut() {
            watch.inserted.push(element);
        }
        Ok(element)
    }

    pub fn append_text(&mut self, parent: ElementRef, text: &str) -> Result<(), DomError> {
        self.append_node(parent, NodeKind::Text(text.to_string()))
            .map(|_| ())
    }

    pub fn remove(&mut self, element: ElementRef) {
        if let Some(parent) = self.nodes.get(&element.0).and_then(|node| node.parent) {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.retain(|child| *child != element.0);
            }
        }
        self.drop_subtree(element.0);
    }

    pub fn interfere(&mut self, element: ElementRef, operation: &'static str, mode: Interference) {
        self.interference.insert((element.0, operation), mode);
    }

    /// Drains elements inserted since the last call that pass the watch's filter.
    pub fn take_insertions(&mut self, handle: WatchHandle) -> Vec<InsertedElement> {
        let Some(watch) = self.watches.get_mut(&handle.0) else {
            return Vec::new();
        };
        let filter = watch.filter;
        let inserted = std::mem::take(&mut watch.inserted);
        inserted
            .into_iter()
            .filter_map(|element| self.describe_insertion(element))
            .filter(|inserted| filter(inserted))
            .collect()
    }

    pub fn is_watching(&self, handle: WatchHandle) -> bool {
        self.watches.contains_key(&handle.0)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn inner_html(&self, element: ElementRef) -> Option<String> {
        let node = self.nodes.get(&element.0)?;
        let mut out = String::new();
        for child in &node.children {
            self.serialize(*child, &mut out);
        }
        Some(out)
    }

    fn describe_insertion(&self, element: ElementRef) -> Option<InsertedElement> {
        let tag = self.tag_of(element)?.to_string();
        let input_type = self
            .attr_of(element, "type")
            .map(|value| value.to_lowercase());
        let contains_button = self
            .descendants(element.0)
            .into_iter()
            .any(|id| self.is_button_node(id));
        Some(InsertedElement {
            element,
            tag,
            input_type,
            contains_button,
        })
    }

    fn is_button_node(&self, id: u64) -> bool {
        match self.nodes.get(&id).map(|node| &node.kind) {
            Some(NodeKind::Element { tag, attrs }) => {
                tag == "button"
                    || (tag == "input"
                        && attrs.iter().any(|(name, value)| {
                            name == "type"
                                && matches!(value.to_lowercase().as_str(), "submit" | "button")
                        }))
            }
            _ => false,
        }
    }

    fn append_node(&mut self, parent: ElementRef, kind: NodeKind) -> Result<u64, DomError> {
        let parent_node = self
            .nodes
            .get_mut(&parent.0)
            .filter(|node| matches!(node.kind, NodeKind::Element { .. }))
            .ok_or(DomError::Detached(parent))?;
        let id = self.next_id;
        self.next_id += 1;
        parent_node.children.push(id);
        self.nodes.insert(
            id,
            Node {
                kind,
                parent: Some(parent.0),
                children: Vec::new(),
            },
        );
        Ok(id)
    }

    fn drop_subtree(&mut self, id: u64) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.drop_subtree(child);
            }
        }
    }

    fn clear_children(&mut self, id: u64) {
        let children = self
            .nodes
            .get_mut(&id)
            .map(|node| std::mem::take(&mut node.children))
            .unwrap_or_default();
        for child in children {
            self.drop_subtree(child);
        }
    }

    fn descendants(&self, id: u64) -> Vec<u64> {
        let mut out = Vec::new();
        let mut stack = self
            .nodes
            .get(&id)
            .map(|node| node.children.iter().rev().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn serialize(&self, id: u64, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Markup(markup) => out.push_str(markup),
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push_str(&format!(" {name}=\"{value}\""));
                }
                out.push('>');
                for child in &node.children {
                    self.serialize(*child, out);
                }
                out.push_str(&format!("</{tag}>"));
            }
        }
    }

    fn collect_text(&self, id: u64, out: &mut String) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        match &node.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Markup(markup) => out.push_str(&strip_html(markup)),
            NodeKind::Element { .. } => {
                for child in &node.children {
                    self.collect_text(*child, out);
                }
            }
        }
    }

    /// Returns `Ok(true)` when the caller should go ahead with the mutation.
    fn gate(&self, element: ElementRef, operation: &'static str) -> Result<bool, DomError> {
        if !self.nodes.contains_key(&element.0) {
            return Err(DomError::Detached(element));
        }
        match self.interference.get(&(element.0, operation)) {
            Some(Interference::Reject) => Err(DomError::MutationRejected {
                operation,
                reason: "rejected by page".to_string(),
            }),
            Some(Interference::Ignore) => Ok(false),
            None => Ok(true),
        }
    }
}

impl ElementTree for MemoryDom {
    fn tag_of(&self, element: ElementRef) -> Option<&str> {
        match self.nodes.get(&element.0).map(|node| &node.kind) {
            Some(NodeKind::Element { tag, .. }) => Some(tag.as_str()),
            _ => None,
        }
    }

    fn attr_of(&self, element: ElementRef, name: &str) -> Option<&str> {
        match self.nodes.get(&element.0).map(|node| &node.kind) {
            Some(NodeKind::Element { attrs, .. }) => attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    fn parent_of(&self, element: ElementRef) -> Option<ElementRef> {
        self.nodes
            .get(&element.0)
            .and_then(|node| node.parent)
            .map(ElementRef)
    }
}

impl Mutator for MemoryDom {
    fn query_selector_all(&self, selector: &str) -> Result<Vec<ElementRef>, DomError> {
        let selector = SelectorList::parse(selector)?;
        let mut candidates = vec![self.root.0];
        candidates.extend(self.descendants(self.root.0));
        Ok(candidates
            .into_iter()
            .map(ElementRef)
            .filter(|element| selector.matches(self, *element))
            .collect())
    }

    fn tag_name(&self, element: ElementRef) -> Option<String> {
        self.tag_of(element).map(str::to_string)
    }

    fn attribute(&self, element: ElementRef, name: &str) -> Option<String> {
        self.attr_of(element, &name.to_lowercase())
            .map(str::to_string)
    }

    fn text_content(&self, element: ElementRef) -> Option<String> {
        if !self.nodes.contains_key(&element.0) {
            return None;
        }
        let mut out = String::new();
        self.collect_text(element.0, &mut out);
        Some(out)
    }

    fn set_text_content(&mut self, element: ElementRef, text: &str) -> Result<(), DomError> {
        if !self.gate(element, "set_text_content")? {
            return Ok(());
        }
        self.clear_children(element.0);
        self.append_text(element, text)
    }

    fn replace_text_nodes(&mut self, element: ElementRef, text: &str) -> Result<(), DomError> {
        if !self.gate(element, "replace_text_nodes")? {
            return Ok(());
        }
        let children = self
            .nodes
            .get(&element.0)
            .map(|node| node.children.clone())
            .unwrap_or_default();
        let text_children = children
            .into_iter()
            .filter(|child| {
                matches!(
                    self.nodes.get(child).map(|node| &node.kind),
                    Some(NodeKind::Text(_))
                )
            })
            .collect::<Vec<_>>();

        let Some((first, rest)) = text_children.split_first() else {
            return self.append_text(element, text);
        };
        if let Some(node) = self.nodes.get_mut(first) {
            node.kind = NodeKind::Text(text.to_string());
        }
        if let Some(node) = self.nodes.get_mut(&element.0) {
            node.children.retain(|child| !rest.contains(child));
        }
        for id in rest {
            self.drop_subtree(*id);
        }
        Ok(())
    }

    fn replace_children_with_text(
        &mut self,
        element: ElementRef,
        text: &str,
    ) -> Result<(), DomError> {
        if !self.gate(element, "replace_children_with_text")? {
            return Ok(());
        }
        self.clear_children(element.0);
        self.append_text(element, text)
    }

    fn set_inner_html(&mut self, element: ElementRef, html: &str) -> Result<(), DomError> {
        if !self.gate(element, "set_inner_html")? {
            return Ok(());
        }
        self.clear_children(element.0);
        self.append_node(element, NodeKind::Markup(html.to_string()))
            .map(|_| ())
    }

    fn set_attribute(
        &mut self,
        element: ElementRef,
        name: &str,
        value: &str,
    ) -> Result<(), DomError> {
        if !self.gate(element, "set_attribute")? {
            return Ok(());
        }
        let name = name.to_lowercase();
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.nodes.get_mut(&element.0)
        {
            match attrs.iter_mut().find(|(key, _)| *key == name) {
                Some((_, existing)) => *existing = value.to_string(),
                None => attrs.push((name, value.to_string())),
            }
        }
        Ok(())
    }

    fn watch(&mut self, filter: InsertionFilter) -> Result<WatchHandle, DomError> {
        let handle = WatchHandle(self.next_watch);
        self.next_watch += 1;
        self.watches.insert(
            handle.0,
            Watch {
                filter,
                inserted: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn unwatch(&mut self, handle: WatchHandle) {
        self.watches.remove(&handle.0);
    }
}
