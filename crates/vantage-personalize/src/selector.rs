//! CSS selector subset used by [`crate::MemoryDom`]: type selectors, `*`, `#id`, `.class`,
//! `[attr]`, `[attr=value]`, compound forms of those, descendant and child combinators, and
//! comma-separated lists.

use crate::dom::{DomError, ElementRef};

pub trait ElementTree {
    fn tag_of(&self, element: ElementRef) -> Option<&str>;
    fn attr_of(&self, element: ElementRef, name: &str) -> Option<&str>;
    fn parent_of(&self, element: ElementRef) -> Option<ElementRef>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    selectors: Vec<ComplexSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ComplexSelector {
    // Right-most compound first; each entry's combinator links it to the next entry.
    parts: Vec<(Compound, Option<Combinator>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrCondition {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Compound(String),
    Child,
}

impl SelectorList {
    pub fn parse(input: &str) -> Result<Self, DomError> {
        let invalid = |reason: &str| DomError::InvalidSelector {
            selector: input.to_string(),
            reason: reason.to_string(),
        };

        let mut selectors = Vec::new();
        for raw in split_top_level(input, ',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(invalid("empty selector in list"));
            }
            selectors.push(parse_complex(raw).map_err(|reason| invalid(&reason))?);
        }
        if selectors.is_empty() {
            return Err(invalid("empty selector"));
        }
        Ok(Self { selectors })
    }

    pub fn matches(&self, tree: &impl ElementTree, element: ElementRef) -> bool {
        self.selectors
            .iter()
            .any(|selector| matches_from(tree, element, &selector.parts))
    }
}

fn matches_from(
    tree: &impl ElementTree,
    element: ElementRef,
    parts: &[(Compound, Option<Combinator>)],
) -> bool {
    let Some(((compound, combinator), rest)) = parts.split_first() else {
        return true;
    };
    if !compound.matches(tree, element) {
        return false;
    }
    match combinator {
        None => true,
        Some(Combinator::Child) => tree
            .parent_of(element)
            .map(|parent| matches_from(tree, parent, rest))
            .unwrap_or(false),
        Some(Combinator::Descendant) => {
            let mut ancestor = tree.parent_of(element);
            while let Some(current) = ancestor {
                if matches_from(tree, current, rest) {
                    return true;
                }
                ancestor = tree.parent_of(current);
            }
            false
        }
    }
}

impl Compound {
    fn matches(&self, tree: &impl ElementTree, element: ElementRef) -> bool {
        let Some(tag) = tree.tag_of(element) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if !expected.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if tree.attr_of(element, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = tree.attr_of(element, "class").unwrap_or_default();
            let present = class_attr.split_whitespace().collect::<Vec<_>>();
            if !self
                .classes
                .iter()
                .all(|class| present.contains(&class.as_str()))
            {
                return false;
            }
        }
        self.attrs.iter().all(|condition| {
            match (tree.attr_of(element, &condition.name), &condition.value) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
            }
        })
    }
}

fn parse_complex(raw: &str) -> Result<ComplexSelector, String> {
    let tokens = tokenize(raw)?;
    let mut left_to_right: Vec<(Compound, Option<Combinator>)> = Vec::new();
    let mut pending = Combinator::Descendant;

    for token in tokens {
        match token {
            Token::Child => {
                if left_to_right.is_empty() {
                    return Err("selector cannot start with '>'".to_string());
                }
                pending = Combinator::Child;
            }
            Token::Compound(text) => {
                let compound = parse_compound(&text)?;
                let combinator = if left_to_right.is_empty() {
                    None
                } else {
                    Some(pending)
                };
                left_to_right.push((compound, combinator));
                pending = Combinator::Descendant;
            }
        }
    }

    if left_to_right.is_empty() {
        return Err("empty selector".to_string());
    }
    if pending == Combinator::Child {
        return Err("dangling '>' combinator".to_string());
    }

    // Each combinator already links its compound to the left neighbour, which is the
    // next entry once the list is read right to left.
    left_to_right.reverse();
    Ok(ComplexSelector {
        parts: left_to_right,
    })
}

fn tokenize(raw: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        if let Some(open) = quote {
            current.push(ch);
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' if in_brackets => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' => {
                in_brackets = true;
                current.push(ch);
            }
            ']' => {
                in_brackets = false;
                current.push(ch);
            }
            '>' if !in_brackets => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Child);
            }
            c if c.is_whitespace() && !in_brackets => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    if quote.is_some() || in_brackets {
        return Err("unterminated attribute selector".to_string());
    }
    flush(&mut current, &mut tokens);
    Ok(tokens)
}

fn flush(current: &mut String, tokens: &mut Vec<Token>) {
    if !current.is_empty() {
        tokens.push(Token::Compound(std::mem::take(current)));
    }
}

fn parse_compound(text: &str) -> Result<Compound, String> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut compound = Compound::default();
    let mut idx = 0;

    if chars.first() == Some(&'*') {
        idx = 1;
    } else if chars.first().is_some_and(|c| c.is_ascii_alphabetic()) {
        let tag = read_ident(&chars, &mut idx);
        compound.tag = Some(tag.to_lowercase());
    }

    while idx < chars.len() {
        match chars[idx] {
            '#' => {
                idx += 1;
                let id = read_ident(&chars, &mut idx);
                if id.is_empty() {
                    return Err("empty id selector".to_string());
                }
                compound.id = Some(id);
            }
            '.' => {
                idx += 1;
                let class = read_ident(&chars, &mut idx);
                if class.is_empty() {
                    return Err("empty class selector".to_string());
                }
                compound.classes.push(class);
            }
            '[' => {
                let close = chars[idx..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| idx + offset)
                    .ok_or_else(|| "unterminated attribute selector".to_string())?;
                let body = chars[idx + 1..close].iter().collect::<String>();
                compound.attrs.push(parse_attr(&body)?);
                idx = close + 1;
            }
            other => return Err(format!("unsupported selector syntax at '{other}'")),
        }
    }

    Ok(compound)
}

fn parse_attr(body: &str) -> Result<AttrCondition, String> {
    match body.split_once('=') {
        None => {
            let name = body.trim();
            if name.is_empty() {
                return Err("empty attribute selector".to_string());
            }
            Ok(AttrCondition {
                name: name.to_lowercase(),
                value: None,
            })
        }
        Some((name, value)) => {
            let name = name.trim();
            if name.is_empty() || !name.chars().all(is_ident_char) {
                return Err(format!("unsupported attribute operator in '[{body}]'"));
            }
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .or_else(|| {
                    value
                        .strip_prefix('\'')
                        .and_then(|inner| inner.strip_suffix('\''))
                })
                .unwrap_or(value);
            Ok(AttrCondition {
                name: name.to_lowercase(),
                value: Some(unquoted.to_string()),
            })
        }
    }
}

fn read_ident(chars: &[char], idx: &mut usize) -> String {
    let start = *idx;
    while *idx < chars.len() && is_ident_char(chars[*idx]) {
        *idx += 1;
    }
    chars[start..*idx].iter().collect()
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (pos, ch) in input.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' if depth > 0 => quote = Some(ch),
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            c if c == separator && depth == 0 => {
                parts.push(&input[start..pos]);
                start = pos + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}
