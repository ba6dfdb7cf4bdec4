//! LDAPv3 search filters (RFC 2254) as used by SrvRqst predicates.

use super::attributes::{unescape, wildcard_match, Attributes};
use crate::error::{Result, SlpError};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The empty predicate.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Approx(String, String),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
}

impl Filter {
    pub fn parse(text: &str) -> Result<Filter> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Filter::All);
        }
        let mut parser = Parser { chars: text.chars().collect(), pos: 0 };
        let filter = parser.filter()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(SlpError::parse(format!("trailing characters in filter '{}'", text)));
        }
        Ok(filter)
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        match self {
            Filter::All => true,
            Filter::And(items) => items.iter().all(|f| f.matches(attrs)),
            Filter::Or(items) => items.iter().any(|f| f.matches(attrs)),
            Filter::Not(inner) => !inner.matches(attrs),
            Filter::Present(tag) => attrs.contains_tag(tag),
            Filter::Equal(tag, pattern) => {
                any_value(attrs, tag, |v| wildcard_match(pattern, v))
            }
            Filter::Approx(tag, value) => any_value(attrs, tag, |v| v.eq_ignore_ascii_case(value)),
            Filter::GreaterOrEqual(tag, value) => {
                any_value(attrs, tag, |v| compare(v, value) != Ordering::Less)
            }
            Filter::LessOrEqual(tag, value) => {
                any_value(attrs, tag, |v| compare(v, value) != Ordering::Greater)
            }
        }
    }
}

fn any_value(attrs: &Attributes, tag: &str, pred: impl Fn(&str) -> bool) -> bool {
    attrs
        .get(tag)
        .map(|values| values.iter().any(|v| pred(v)))
        .unwrap_or(false)
}

fn compare(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<i64>(), right.trim().parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(SlpError::parse(format!("expected '{}' at offset {} of filter", c, self.pos)))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect('(')?;
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(SlpError::parse("unexpected end of filter")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            items.push(self.filter()?);
        }
        if items.is_empty() {
            return Err(SlpError::parse("empty filter list"));
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '~' | '<' | '>' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let tag: String = self.chars[start..self.pos].iter().collect::<String>().trim().to_string();
        if tag.is_empty() {
            return Err(SlpError::parse("missing attribute tag in filter"));
        }
        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some('='), _) => {
                self.pos += 1;
                '='
            }
            (Some(c @ ('~' | '<' | '>')), Some('=')) => {
                self.pos += 2;
                c
            }
            _ => return Err(SlpError::parse(format!("missing operator after '{}'", tag))),
        };
        let value_start = self.pos;
        while let Some(c) = self.peek() {
            if c == ')' || c == '(' {
                break;
            }
            self.pos += 1;
        }
        let raw: String = self.chars[value_start..self.pos].iter().collect();
        let value = unescape(raw.trim())?;
        let filter = match op {
            '=' if value == "*" => Filter::Present(tag),
            '=' => Filter::Equal(tag, value),
            '~' => Filter::Approx(tag, value),
            '>' => Filter::GreaterOrEqual(tag, value),
            _ => Filter::LessOrEqual(tag, value),
        };
        Ok(filter)
    }
}
