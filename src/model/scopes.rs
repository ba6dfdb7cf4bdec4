use std::collections::BTreeSet;
use std::fmt;

/// Case-insensitive set of scope names. Names are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scopes {
    names: BTreeSet<String>,
}

impl Scopes {
    pub const DEFAULT: &'static str = "default";

    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Scopes { names }
    }

    pub fn default_scopes() -> Self {
        Scopes::new([Self::DEFAULT])
    }

    /// Parses the comma separated `<scope-list>` wire form.
    pub fn from_wire(list: &str) -> Self {
        Scopes::new(list.split(','))
    }

    pub fn to_wire(&self) -> String {
        self.names.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.names.contains(&scope.to_ascii_lowercase())
    }

    pub fn overlaps(&self, other: &Scopes) -> bool {
        self.names.iter().any(|n| other.names.contains(n))
    }

    pub fn contains_all(&self, other: &Scopes) -> bool {
        other.names.is_subset(&self.names)
    }

    pub fn union(&self, other: &Scopes) -> Scopes {
        Scopes { names: self.names.union(&other.names).cloned().collect() }
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
