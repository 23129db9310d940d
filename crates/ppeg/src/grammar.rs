use std::fmt;

use crate::pattern::{Node, Pattern};

/// Identifies a rule of a grammar, positional rules use their index
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleKey {
    Index(usize),
    Name(String),
}

impl From<usize> for RuleKey {
    fn from(i: usize) -> Self {
        RuleKey::Index(i)
    }
}

impl From<&str> for RuleKey {
    fn from(name: &str) -> Self {
        RuleKey::Name(name.into())
    }
}

impl From<String> for RuleKey {
    fn from(name: String) -> Self {
        RuleKey::Name(name)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKey::Index(i) => write!(f, "{i}"),
            RuleKey::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Ordered set of mutually recursive rules.
///
/// ```
/// use ppeg::{Grammar, Pattern};
///
/// // S <- 'a' S 'b' / ''
/// let ab = Grammar::new()
///     .named("S", Pattern::literal("a") + Pattern::var("S") + "b" | true)
///     .start("S")
///     .build();
/// assert_eq!(ab.matches("aabb").unwrap().map(|m| m.end()), Some(4));
/// ```
#[derive(Clone)]
pub struct Grammar {
    pub(crate) rules: Vec<(RuleKey, Pattern)>,
    pub(crate) start: RuleKey,
    positional: usize,
}

impl Grammar {
    pub fn new() -> Grammar {
        Grammar {
            rules: vec![],
            start: RuleKey::Index(0),
            positional: 0,
        }
    }

    /// Add a rule referenced by its position among the positional rules
    pub fn rule(mut self, pattern: impl Into<Pattern>) -> Grammar {
        let key = RuleKey::Index(self.positional);
        self.positional += 1;
        self.rules.push((key, pattern.into()));
        self
    }

    /// Add a rule referenced by name
    pub fn named(mut self, name: impl Into<String>, pattern: impl Into<Pattern>) -> Grammar {
        self.rules.push((RuleKey::Name(name.into()), pattern.into()));
        self
    }

    /// Set the initial rule, the first positional rule by default
    pub fn start(mut self, key: impl Into<RuleKey>) -> Grammar {
        self.start = key.into();
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn build(self) -> Pattern {
        Pattern::from_node(Node::Grammar(self))
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Grammar::new()
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grammar(start: {}", self.start)?;
        for (key, rule) in &self.rules {
            write!(f, "; {key} <- {rule}")?;
        }
        write!(f, ")")
    }
}
