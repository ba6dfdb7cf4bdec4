use crate::error::{Result, SlpError};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

const RESERVED: &[char] = &['(', ')', ',', '\\', '!', '<', '=', '>', '~'];

/// Service attributes: tag -> list of values. A tag with no values is a keyword.
///
/// Tags are case-insensitive and stored lower-cased; values keep their case.
/// Wire form is `(tag=v1,v2),(other=v),keyword` with reserved characters
/// escaped as `\XX`. Opaque values (`\FF` followed by escaped bytes) are
/// kept in that escaped form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: BTreeMap<String, Vec<String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    pub fn from_wire(text: &str) -> Result<Self> {
        let mut attrs = Attributes::new();
        let mut rest = text.trim();
        while !rest.is_empty() {
            if let Some(inner) = rest.strip_prefix('(') {
                let end = inner.find(')').ok_or_else(|| {
                    SlpError::parse(format!("unterminated attribute in '{}'", text))
                })?;
                let item = &inner[..end];
                let (tag, values) = item.split_once('=').ok_or_else(|| {
                    SlpError::parse(format!("missing '=' in attribute '{}'", item))
                })?;
                let values = values
                    .split(',')
                    .map(|v| unescape(v.trim()))
                    .collect::<Result<Vec<_>>>()?;
                attrs.add(&unescape(tag.trim())?, values);
                rest = &inner[end + 1..];
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                let keyword = rest[..end].trim();
                if keyword.contains(')') || keyword.is_empty() {
                    return Err(SlpError::parse(format!("malformed keyword in '{}'", text)));
                }
                attrs.add(&unescape(keyword)?, Vec::new());
                rest = &rest[end..];
            }
            rest = rest.trim_start();
            if let Some(next) = rest.strip_prefix(',') {
                rest = next.trim_start();
            } else if !rest.is_empty() {
                return Err(SlpError::parse(format!("unexpected '{}' in attribute list", rest)));
            }
        }
        Ok(attrs)
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (i, (tag, values)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if values.is_empty() {
                out.push_str(&escape(tag));
            } else {
                let joined = values.iter().map(|v| escape(v)).collect::<Vec<_>>().join(",");
                let _ = write!(out, "({}={})", escape(tag), joined);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replaces the values of `tag`.
    pub fn put<I, S>(&mut self, tag: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .insert(tag.to_ascii_lowercase(), values.into_iter().map(Into::into).collect());
    }

    /// Appends values to `tag`, skipping duplicates.
    pub fn add(&mut self, tag: &str, values: Vec<String>) {
        let existing = self.entries.entry(tag.to_ascii_lowercase()).or_default();
        for value in values {
            if !existing.contains(&value) {
                existing.push(value);
            }
        }
    }

    pub fn get(&self, tag: &str) -> Option<&[String]> {
        self.entries.get(&tag.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.entries.contains_key(&tag.to_ascii_lowercase())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Tags ORed together, value lists concatenated without duplicates.
    pub fn merge(&self, other: &Attributes) -> Attributes {
        let mut merged = self.clone();
        for (tag, values) in &other.entries {
            merged.add(tag, values.clone());
        }
        merged
    }

    /// Drops every tag matching one of `patterns` (`*` wildcards allowed).
    pub fn remove_tags(&self, patterns: &[String]) -> Attributes {
        let entries = self
            .entries
            .iter()
            .filter(|(tag, _)| !patterns.iter().any(|p| wildcard_match(p, tag)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Attributes { entries }
    }

    /// Keeps only tags matching `patterns`; an empty pattern list keeps everything.
    pub fn select(&self, patterns: &[String]) -> Attributes {
        if patterns.is_empty() {
            return self.clone();
        }
        let entries = self
            .entries
            .iter()
            .filter(|(tag, _)| patterns.iter().any(|p| wildcard_match(p, tag)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Attributes { entries }
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Parses a `<tag-list>`: comma separated tags, possibly with wildcards.
pub fn parse_tag_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn tag_list_to_wire(tags: &[String]) -> String {
    tags.join(",")
}

/// Escapes reserved and control characters, plus whitespace at either end
/// so that it survives the trimming done by [`Attributes::from_wire`].
pub(crate) fn escape(value: &str) -> String {
    if is_opaque(value) {
        return value.to_string();
    }
    let last = value.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let edge_space = c.is_whitespace() && (i == 0 || i == last);
        if RESERVED.contains(&c) || c.is_control() || edge_space {
            let mut utf8 = [0u8; 4];
            for byte in c.encode_utf8(&mut utf8).bytes() {
                let _ = write!(out, "\\{:02X}", byte);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes `\XX` escapes. Opaque values come back unchanged apart from
/// upper-cased hex digits.
pub(crate) fn unescape(text: &str) -> Result<String> {
    if !text.contains('\\') {
        return Ok(text.to_string());
    }
    let bytes = escaped_bytes(text)?;
    if is_opaque_prefix(text) {
        let mut out = String::with_capacity(text.len());
        for byte in bytes {
            let _ = write!(out, "\\{:02X}", byte);
        }
        return Ok(out);
    }
    String::from_utf8(bytes).map_err(|_| SlpError::parse("escaped value is not UTF-8"))
}

fn escaped_bytes(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = text
                .get(i + 1..i + 3)
                .ok_or_else(|| SlpError::parse(format!("truncated escape in '{}'", text)))?;
            let value = u8::from_str_radix(hex, 16)
                .map_err(|_| SlpError::parse(format!("bad escape '\\{}'", hex)))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn is_opaque_prefix(text: &str) -> bool {
    text.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("\\FF"))
}

/// `\FF` followed only by `\XX` byte escapes.
pub fn is_opaque(value: &str) -> bool {
    is_opaque_prefix(value)
        && value.len() % 3 == 0
        && value.as_bytes().chunks(3).all(|chunk| {
            chunk[0] == b'\\' && chunk[1..].iter().all(u8::is_ascii_hexdigit)
        })
}

/// Case-insensitive match where `*` in `pattern` matches any run of characters.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_form() {
        let attrs = Attributes::from_wire("(color=red,blue),(size=10),duplex").unwrap();
        assert_eq!(attrs.get("color"), Some(&["red".to_string(), "blue".to_string()][..]));
        assert_eq!(attrs.get("SIZE"), Some(&["10".to_string()][..]));
        assert_eq!(attrs.get("duplex"), Some(&[][..]));
        assert_eq!(attrs.to_wire(), "(color=red,blue),duplex,(size=10)");
    }

    #[test]
    fn test_escaping() {
        let mut attrs = Attributes::new();
        attrs.put("expr", ["a=(b,c)"]);
        let wire = attrs.to_wire();
        assert_eq!(wire, "(expr=a\\3D\\28b\\2Cc\\29)");
        assert_eq!(Attributes::from_wire(&wire).unwrap(), attrs);
    }

    #[test]
    fn test_empty_is_empty_string() {
        assert_eq!(Attributes::new().to_wire(), "");
        assert!(Attributes::from_wire("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed() {
        assert!(Attributes::from_wire("(color=red").is_err());
        assert!(Attributes::from_wire("(color)").is_err());
        assert!(Attributes::from_wire("(a=1)x").is_err());
        assert!(Attributes::from_wire("(a=\\4)").is_err());
        assert!(Attributes::from_wire("(a=\\C3\\28)").is_err());
        assert!(Attributes::from_wire("(o=\\FF\\0)").is_err());
    }

    #[test]
    fn test_edge_whitespace_survives() {
        let mut attrs = Attributes::new();
        attrs.put("name", [" padded ", "in side"]);
        let wire = attrs.to_wire();
        assert_eq!(wire, "(name=\\20padded\\20,in side)");
        let parsed = Attributes::from_wire(&wire).unwrap();
        assert_eq!(parsed.get("name"), Some(&[" padded ".to_string(), "in side".to_string()][..]));
        // unescaped edge whitespace is still insignificant
        let loose = Attributes::from_wire("( name = x , y )").unwrap();
        assert_eq!(loose.get("name"), Some(&["x".to_string(), "y".to_string()][..]));
    }

    #[test]
    fn test_opaque_values() {
        let attrs = Attributes::from_wire("(o=\\ff\\00\\2C),(s=plain)").unwrap();
        assert_eq!(attrs.get("o"), Some(&["\\FF\\00\\2C".to_string()][..]));
        assert!(is_opaque(&attrs.get("o").unwrap()[0]));
        assert_eq!(attrs.to_wire(), "(o=\\FF\\00\\2C),(s=plain)");
        assert_eq!(Attributes::from_wire(&attrs.to_wire()).unwrap(), attrs);
        assert!(!is_opaque("plain"));
        assert!(!is_opaque("\\FFx"));
    }

    #[test]
    fn test_merge_deduplicates() {
        let a = Attributes::from_wire("(a=1,2),k").unwrap();
        let b = Attributes::from_wire("(a=2,3),(b=x)").unwrap();
        let merged = a.merge(&b);
        assert_eq!(merged.to_wire(), "(a=1,2,3),(b=x),k");
    }

    #[test]
    fn test_remove_and_select() {
        let attrs = Attributes::from_wire("(alpha=1),(beta=2),(gamma=3)").unwrap();
        let removed = attrs.remove_tags(&parse_tag_list("al*, GAMMA"));
        assert_eq!(removed.to_wire(), "(beta=2)");
        let selected = attrs.select(&parse_tag_list("beta"));
        assert_eq!(selected.to_wire(), "(beta=2)");
        assert_eq!(attrs.select(&[]), attrs);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("ab*", "ABC"));
        assert!(wildcard_match("*b*d", "abcd"));
        assert!(!wildcard_match("a*z", "abc"));
        assert!(wildcard_match("a*b*c", "aXbYbZc"));
    }
}
