use std::{
    fmt,
    ops::{Add, BitOr, Neg, Sub},
    sync::Arc,
};

use bstr::{BString, ByteSlice};
use rustc_hash::FxHashMap;

use crate::{
    grammar::{Grammar, RuleKey},
    parsing_machine::{Compiler, Match, ParsingMachine, Program, Set},
    PegError, Value,
};

/// Largest index accepted by argument captures
pub(crate) const MAX_ARG: usize = i16::MAX as usize;

/// User matcher called by [`Pattern::func`], returns the new position
pub type MatchFn = Arc<dyn Fn(&[u8], usize) -> Option<usize> + Send + Sync>;

/// Match time capture callback, called with the subject, current position
/// and the values of nested captures. Returns the new position and
/// replacement values.
pub type RuntimeFn =
    Arc<dyn Fn(&[u8], usize, Vec<Value>) -> Option<(usize, Vec<Value>)> + Send + Sync>;

/// Fold capture callback, called with the accumulator and the values of the
/// next nested capture
pub type FoldFn = Arc<dyn Fn(Value, &[Value]) -> Value + Send + Sync>;

/// Function capture callback, maps nested capture values to new values
pub type MapFn = Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>;

/// Lookup table used by query captures
pub type QueryTable = Arc<FxHashMap<BString, Value>>;

/// Captures that wrap a pattern
#[derive(Clone)]
pub(crate) enum Capture {
    Simple,
    Table,
    Subst,
    Group(Option<String>),
    Fold(FoldFn),
    Function(MapFn),
    Query(QueryTable),
    String(BString),
    Runtime(RuntimeFn),
}

#[derive(Clone)]
pub(crate) enum Node {
    Any(i64),
    Literal(Vec<u8>),
    Set(Set),
    Fail,
    Succeed,
    Seq(Pattern, Pattern),
    Choice(Pattern, Pattern),
    Not(Pattern),
    And(Pattern),
    Repeat(Pattern, i64),
    Diff(Pattern, Pattern),
    Capture(Capture, Pattern),
    Position,
    Const(Vec<Value>),
    Arg(usize),
    Backref(String),
    Func(MatchFn),
    RuleRef(RuleKey),
    Grammar(Grammar),
}

/// Immutable parsing expression. Combining patterns always creates new ones,
/// cloning is cheap.
#[derive(Clone)]
pub struct Pattern(Arc<Node>);

impl Pattern {
    pub(crate) fn from_node(node: Node) -> Pattern {
        Pattern(Arc::new(node))
    }

    pub(crate) fn node(&self) -> &Node {
        &self.0
    }

    /// Positive `n` matches exactly `n` bytes. Negative `n` matches only if
    /// less than `-n` bytes remain, consuming nothing.
    pub fn any(n: i64) -> Pattern {
        Pattern::from_node(Node::Any(n))
    }

    pub fn literal(s: impl AsRef<[u8]>) -> Pattern {
        Pattern::from_node(Node::Literal(s.as_ref().to_vec()))
    }

    /// Matches any single byte in `s`
    pub fn set(s: impl AsRef<[u8]>) -> Pattern {
        Pattern::from_node(Node::Set(Set::from_bytes(s.as_ref())))
    }

    /// Matches a single byte in one of the inclusive ranges given as pairs,
    /// for example `"azAZ"`.
    pub fn range(pairs: impl AsRef<[u8]>) -> Result<Pattern, PegError> {
        let pairs = pairs.as_ref();
        if pairs.len() % 2 != 0 {
            return Err(PegError::OddRange(pairs.len()));
        }

        let mut set = Set::new();
        for pair in pairs.chunks_exact(2) {
            if pair[0] <= pair[1] {
                set = set | Set::range(pair[0], pair[1]);
            }
        }
        Ok(Pattern::from_node(Node::Set(set)))
    }

    pub fn fail() -> Pattern {
        Pattern::from_node(Node::Fail)
    }

    pub fn succeed() -> Pattern {
        Pattern::from_node(Node::Succeed)
    }

    /// Reference to a rule of the enclosing grammar
    pub fn var(key: impl Into<RuleKey>) -> Pattern {
        Pattern::from_node(Node::RuleRef(key.into()))
    }

    /// Grammar of positional rules starting from the first one
    pub fn grammar<I, P>(rules: I) -> Pattern
    where
        I: IntoIterator<Item = P>,
        P: Into<Pattern>,
    {
        rules
            .into_iter()
            .fold(Grammar::new(), |grammar, rule| grammar.rule(rule))
            .build()
    }

    /// Zero width capture of the current position
    pub fn position() -> Pattern {
        Pattern::from_node(Node::Position)
    }

    /// Zero width capture producing the given values
    pub fn constant<I, V>(values: I) -> Pattern
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Pattern::from_node(Node::Const(values.into_iter().map(Into::into).collect()))
    }

    /// Zero width capture producing the `n`th extra argument given to the
    /// match, 1 based
    pub fn arg(n: usize) -> Result<Pattern, PegError> {
        if n == 0 || n > MAX_ARG {
            return Err(PegError::ArgumentIndex(n));
        }
        Ok(Pattern::from_node(Node::Arg(n)))
    }

    /// Zero width capture producing the values of the most recent group
    /// capture named `name`
    pub fn backref(name: impl Into<String>) -> Pattern {
        Pattern::from_node(Node::Backref(name.into()))
    }

    /// Matches using a user function. The function receives the subject and
    /// the current position and returns the position to continue from.
    pub fn func<F>(f: F) -> Pattern
    where
        F: Fn(&[u8], usize) -> Option<usize> + Send + Sync + 'static,
    {
        Pattern::from_node(Node::Func(Arc::new(f)))
    }

    /// Positive lookahead
    pub fn followed_by(&self) -> Pattern {
        Pattern::from_node(Node::And(self.clone()))
    }

    /// Negative lookahead, same as `-pattern`
    pub fn not_followed_by(&self) -> Pattern {
        Pattern::from_node(Node::Not(self.clone()))
    }

    /// `n >= 0` matches at least `n` repetitions, `n < 0` at most `-n`.
    pub fn rep(&self, n: i64) -> Pattern {
        Pattern::from_node(Node::Repeat(self.clone(), n))
    }

    fn wrap(&self, capture: Capture) -> Pattern {
        Pattern::from_node(Node::Capture(capture, self.clone()))
    }

    /// Captures the matched text followed by the values of nested captures
    pub fn capture(&self) -> Pattern {
        self.wrap(Capture::Simple)
    }

    /// Collects the values of nested captures into a list
    pub fn table(&self) -> Pattern {
        self.wrap(Capture::Table)
    }

    /// Matched text where each nested capture is replaced by its value
    pub fn subst(&self) -> Pattern {
        self.wrap(Capture::Subst)
    }

    /// Anonymous group, the values of nested captures as one unit
    pub fn group(&self) -> Pattern {
        self.wrap(Capture::Group(None))
    }

    /// Named group. Produces no values itself but can be referenced
    /// by [`Pattern::backref`].
    pub fn named(&self, name: impl Into<String>) -> Pattern {
        self.wrap(Capture::Group(Some(name.into())))
    }

    /// Left fold over the nested captures seeded by the first one
    pub fn fold<F>(&self, f: F) -> Pattern
    where
        F: Fn(Value, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.wrap(Capture::Fold(Arc::new(f)))
    }

    /// Passes the values of nested captures, or the matched text, through `f`
    pub fn map<F>(&self, f: F) -> Pattern
    where
        F: Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    {
        self.wrap(Capture::Function(Arc::new(f)))
    }

    /// Looks up the first nested value, or the matched text, from `table`
    pub fn query(&self, table: FxHashMap<BString, Value>) -> Pattern {
        self.wrap(Capture::Query(Arc::new(table)))
    }

    /// Formats a string where `%0` is the matched text and `%1` to `%9` the
    /// values of nested captures
    pub fn template(&self, fmt: impl AsRef<[u8]>) -> Pattern {
        self.wrap(Capture::String(BString::from(fmt.as_ref())))
    }

    /// Capture evaluated while matching. See [`RuntimeFn`].
    pub fn match_time<F>(&self, f: F) -> Pattern
    where
        F: Fn(&[u8], usize, Vec<Value>) -> Option<(usize, Vec<Value>)> + Send + Sync + 'static,
    {
        self.wrap(Capture::Runtime(Arc::new(f)))
    }

    pub fn compile(&self) -> Result<Program, PegError> {
        Compiler::compile(self)
    }

    /// Compiled instructions as (mnemonic, aux, offset) tuples
    pub fn dump(&self) -> Result<Vec<(&'static str, i32, i32)>, PegError> {
        Ok(self.compile()?.dump())
    }

    /// Compile and match the subject from its start
    pub fn matches(&self, subject: impl AsRef<[u8]>) -> Result<Option<Match>, PegError> {
        ParsingMachine::new(self)?.parse(subject)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Pattern) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }

        match (self.compile(), other.compile()) {
            (Ok(a), Ok(b)) => a.ops == b.ops,
            _ => false,
        }
    }
}

impl From<&Pattern> for Pattern {
    fn from(p: &Pattern) -> Self {
        p.clone()
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::literal(s)
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::literal(s)
    }
}

impl From<&[u8]> for Pattern {
    fn from(s: &[u8]) -> Self {
        Pattern::literal(s)
    }
}

impl From<i64> for Pattern {
    fn from(n: i64) -> Self {
        Pattern::any(n)
    }
}

impl From<i32> for Pattern {
    fn from(n: i32) -> Self {
        Pattern::any(n as i64)
    }
}

impl From<bool> for Pattern {
    fn from(b: bool) -> Self {
        if b {
            Pattern::succeed()
        } else {
            Pattern::fail()
        }
    }
}

impl From<Grammar> for Pattern {
    fn from(g: Grammar) -> Self {
        g.build()
    }
}

macro_rules! binary_op {
    ($trait:ident, $fn:ident, $node:ident) => {
        impl<T: Into<Pattern>> $trait<T> for Pattern {
            type Output = Pattern;

            fn $fn(self, rhs: T) -> Pattern {
                Pattern::from_node(Node::$node(self, rhs.into()))
            }
        }

        impl<T: Into<Pattern>> $trait<T> for &Pattern {
            type Output = Pattern;

            fn $fn(self, rhs: T) -> Pattern {
                Pattern::from_node(Node::$node(self.clone(), rhs.into()))
            }
        }
    };
}

binary_op!(Add, add, Seq);
binary_op!(BitOr, bitor, Choice);
binary_op!(Sub, sub, Diff);

impl Neg for Pattern {
    type Output = Pattern;

    fn neg(self) -> Pattern {
        Pattern::from_node(Node::Not(self))
    }
}

impl Neg for &Pattern {
    type Output = Pattern;

    fn neg(self) -> Pattern {
        self.not_followed_by()
    }
}

impl fmt::Display for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capture::Simple => write!(f, "capture"),
            Capture::Table => write!(f, "table"),
            Capture::Subst => write!(f, "subst"),
            Capture::Group(None) => write!(f, "group"),
            Capture::Group(Some(name)) => write!(f, "group {name:?}"),
            Capture::Fold(_) => write!(f, "fold"),
            Capture::Function(_) => write!(f, "map"),
            Capture::Query(_) => write!(f, "query"),
            Capture::String(s) => write!(f, "template {:?}", s.as_bstr()),
            Capture::Runtime(_) => write!(f, "match_time"),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Node::Any(1) => write!(f, "."),
            Node::Any(n) => write!(f, "any({n})"),
            Node::Literal(s) => write!(f, "{:?}", s.as_bstr()),
            Node::Set(set) => write!(f, "{set:?}"),
            Node::Fail => write!(f, "fail"),
            Node::Succeed => write!(f, "''"),
            Node::Seq(a, b) => write!(f, "({a} {b})"),
            Node::Choice(a, b) => write!(f, "({a} / {b})"),
            Node::Not(a) => write!(f, "!({a})"),
            Node::And(a) => write!(f, "&({a})"),
            Node::Repeat(a, 0) => write!(f, "({a})*"),
            Node::Repeat(a, 1) => write!(f, "({a})+"),
            Node::Repeat(a, -1) => write!(f, "({a})?"),
            Node::Repeat(a, n) => write!(f, "({a})^{n}"),
            Node::Diff(a, b) => write!(f, "({a} - {b})"),
            Node::Capture(cap, a) => write!(f, "{cap}({a})"),
            Node::Position => write!(f, "position()"),
            Node::Const(values) => write!(f, "constant({})", Value::List(values.clone())),
            Node::Arg(n) => write!(f, "arg({n})"),
            Node::Backref(name) => write!(f, "backref({name:?})"),
            Node::Func(_) => write!(f, "func"),
            Node::RuleRef(key) => write!(f, "<{key}>"),
            Node::Grammar(g) => write!(f, "{g}"),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_odd() {
        assert_eq!(Pattern::range("abc").err(), Some(PegError::OddRange(3)));
        assert!(Pattern::range("").is_ok());
    }

    #[test]
    fn arg_index() {
        assert_eq!(Pattern::arg(0).err(), Some(PegError::ArgumentIndex(0)));
        assert_eq!(
            Pattern::arg(MAX_ARG + 1).err(),
            Some(PegError::ArgumentIndex(MAX_ARG + 1))
        );
        assert!(Pattern::arg(1).is_ok());
    }

    #[test]
    fn display() {
        let p = Pattern::literal("ab") + Pattern::set("xy").rep(0) | -Pattern::any(1);
        assert_eq!(p.to_string(), r#"(("ab" ([x-y])*) / !(.))"#);
    }

    #[test]
    fn conversions() {
        let p = Pattern::from("ab") + 2 + true;
        assert_eq!(p, Pattern::literal("ab") + Pattern::any(2));
        assert_eq!(Pattern::from(false), Pattern::fail());
    }

    #[test]
    fn charset_equality() {
        assert_eq!(Pattern::set("a"), Pattern::range("aa").unwrap());
        assert_eq!(Pattern::set("a"), Pattern::literal("a"));
        assert_eq!(Pattern::set("abc"), Pattern::range("ac").unwrap());
        assert_eq!(Pattern::set(""), Pattern::range("").unwrap());
        assert_eq!(Pattern::set(""), Pattern::fail());
        assert_eq!(
            Pattern::range("azAZ").unwrap(),
            Pattern::range("az").unwrap() | Pattern::range("AZ").unwrap()
        );
    }
}
