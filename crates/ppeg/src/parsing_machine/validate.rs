use rustc_hash::FxHashMap;

use crate::{
    grammar::{Grammar, RuleKey},
    pattern::{Capture, Node, Pattern},
    PegError,
};

/// Rules of one grammar indexed by key, and which of them may match
/// without consuming input
pub(crate) struct RuleTable {
    keys: Vec<RuleKey>,
    index: FxHashMap<RuleKey, usize>,
    nullable: Vec<bool>,
    start: usize,
}

impl RuleTable {
    /// Index the rules of a grammar and reject left recursive ones
    pub fn new(grammar: &Grammar) -> Result<RuleTable, PegError> {
        if grammar.is_empty() {
            return Err(PegError::EmptyGrammar);
        }

        let mut index = FxHashMap::default();
        let mut keys = Vec::with_capacity(grammar.len());
        for (i, (key, _)) in grammar.rules.iter().enumerate() {
            if index.insert(key.clone(), i).is_some() {
                return Err(PegError::DuplicateRule(key.clone()));
            }
            keys.push(key.clone());
        }

        let start = *index
            .get(&grammar.start)
            .ok_or_else(|| PegError::MissingStart(grammar.start.clone()))?;

        let mut table = RuleTable {
            nullable: vec![false; keys.len()],
            keys,
            index,
            start,
        };

        for (_, rule) in &grammar.rules {
            table.check_references(rule)?;
        }
        table.compute_nullable(grammar);
        table.check_left_recursion(grammar)?;

        Ok(table)
    }

    pub fn get(&self, key: &RuleKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn key(&self, rule: usize) -> &RuleKey {
        &self.keys[rule]
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn is_nullable(&self, rule: usize) -> bool {
        self.nullable[rule]
    }

    fn check_references(&self, pattern: &Pattern) -> Result<(), PegError> {
        match pattern.node() {
            Node::RuleRef(key) => {
                if self.get(key).is_none() {
                    return Err(PegError::UndefinedRule(key.clone()));
                }
            }
            Node::Seq(a, b) | Node::Choice(a, b) | Node::Diff(a, b) => {
                self.check_references(a)?;
                self.check_references(b)?;
            }
            Node::Not(a) | Node::And(a) | Node::Repeat(a, _) | Node::Capture(_, a) => {
                self.check_references(a)?
            }
            _ => {}
        }

        Ok(())
    }

    fn compute_nullable(&mut self, grammar: &Grammar) {
        loop {
            let mut changed = false;
            for (i, (_, rule)) in grammar.rules.iter().enumerate() {
                if !self.nullable[i] && nullable(rule, Some(self)) {
                    self.nullable[i] = true;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// A rule is left recursive if it can reach itself through calls made
    /// before consuming anything
    fn check_left_recursion(&self, grammar: &Grammar) -> Result<(), PegError> {
        let edges: Vec<Vec<usize>> = grammar
            .rules
            .iter()
            .map(|(_, rule)| {
                let mut calls = vec![];
                self.first_calls(rule, &mut calls);
                calls
            })
            .collect();

        for rule in 0..edges.len() {
            let mut visited = vec![false; edges.len()];
            let mut stack = edges[rule].clone();

            while let Some(next) = stack.pop() {
                if next == rule {
                    return Err(PegError::LeftRecursion(self.keys[rule].clone()));
                }

                if visited[next] {
                    continue;
                }
                visited[next] = true;
                stack.extend_from_slice(&edges[next]);
            }
        }

        Ok(())
    }

    /// Rules that may be called before the pattern consumes anything
    fn first_calls(&self, pattern: &Pattern, calls: &mut Vec<usize>) {
        match pattern.node() {
            Node::RuleRef(key) => calls.extend(self.get(key)),
            Node::Seq(a, b) => {
                self.first_calls(a, calls);
                if nullable(a, Some(self)) {
                    self.first_calls(b, calls);
                }
            }
            Node::Choice(a, b) | Node::Diff(a, b) => {
                self.first_calls(a, calls);
                self.first_calls(b, calls);
            }
            Node::Not(a) | Node::And(a) | Node::Repeat(a, _) | Node::Capture(_, a) => {
                self.first_calls(a, calls)
            }
            _ => {}
        }
    }
}

/// Whether the pattern may succeed without consuming input
pub(crate) fn nullable(pattern: &Pattern, rules: Option<&RuleTable>) -> bool {
    match pattern.node() {
        Node::Any(n) => *n <= 0,
        Node::Literal(s) => s.is_empty(),
        Node::Set(_) | Node::Fail => false,
        Node::Succeed => true,
        Node::Seq(a, b) => nullable(a, rules) && nullable(b, rules),
        Node::Choice(a, b) => nullable(a, rules) || nullable(b, rules),
        Node::Not(_) | Node::And(_) => true,
        Node::Repeat(a, n) => *n <= 0 || nullable(a, rules),
        Node::Diff(a, _) => nullable(a, rules),
        // Position is decided by user code
        Node::Capture(Capture::Runtime(_), _) | Node::Func(_) => true,
        Node::Capture(_, a) => nullable(a, rules),
        Node::Position | Node::Const(_) | Node::Arg(_) | Node::Backref(_) => true,
        Node::RuleRef(key) => rules
            .and_then(|table| table.get(key).map(|i| table.is_nullable(i)))
            .unwrap_or(false),
        Node::Grammar(grammar) => RuleTable::new(grammar)
            .map(|table| table.is_nullable(table.start()))
            .unwrap_or(false),
    }
}

/// Reject a repetition whose body may match without consuming input.
/// `rule` is the grammar and rule the repetition is in, if any.
pub(crate) fn check_loop(body: &Pattern, rule: Option<(&RuleTable, usize)>) -> Result<(), PegError> {
    let rules = rule.map(|(table, _)| table);
    if !nullable(body, rules) {
        return Ok(());
    }

    match rule {
        Some((table, i)) => Err(PegError::InfiniteLoop(table.key(i).clone())),
        None => Err(PegError::EmptyLoop),
    }
}

#[cfg(test)]
mod test {
    use crate::{Grammar, Pattern, PegError, RuleKey};

    fn compile_err(p: &Pattern) -> PegError {
        p.compile().expect_err("pattern should be rejected")
    }

    #[test]
    fn left_recursion_direct() {
        let p = Pattern::grammar([Pattern::var(0) + "a"]);
        assert_eq!(compile_err(&p), PegError::LeftRecursion(RuleKey::Index(0)));
    }

    #[test]
    fn left_recursion_through_nullable_prefix() {
        let p = Grammar::new()
            .named("expr", Pattern::var("ws") + Pattern::var("expr") + "+" | "x")
            .named("ws", Pattern::set(" ").rep(0))
            .start("expr")
            .build();
        assert_eq!(compile_err(&p), PegError::LeftRecursion("expr".into()));
    }

    #[test]
    fn left_recursion_mutual() {
        let p = Pattern::grammar([Pattern::var(1) + "a", Pattern::var(0) + "b"]);
        assert_eq!(compile_err(&p), PegError::LeftRecursion(RuleKey::Index(0)));
    }

    #[test]
    fn right_recursion_accepted() {
        let p = Pattern::grammar([Pattern::literal("a") + Pattern::var(0) | true]);
        assert!(p.compile().is_ok());
    }

    #[test]
    fn empty_loop() {
        assert_eq!(compile_err(&Pattern::literal("").rep(0)), PegError::EmptyLoop);
        assert_eq!(
            compile_err(&(Pattern::literal("a").rep(-1)).rep(1)),
            PegError::EmptyLoop
        );
        assert!(Pattern::literal("a").rep(-3).compile().is_ok());
    }

    #[test]
    fn user_positions_are_nullable() {
        let runtime = Pattern::literal("a").match_time(|_, i, _| Some((i, vec![])));
        assert_eq!(compile_err(&runtime.rep(0)), PegError::EmptyLoop);
        assert_eq!(
            compile_err(&Pattern::func(|_, i| Some(i + 1)).rep(0)),
            PegError::EmptyLoop
        );

        let p = Pattern::grammar([Pattern::func(|_, i| Some(i)) + Pattern::var(0)]);
        assert_eq!(compile_err(&p), PegError::LeftRecursion(RuleKey::Index(0)));

        assert!((Pattern::literal("a") + runtime).rep(0).compile().is_ok());
    }

    #[test]
    fn infinite_loop_in_rule() {
        let p = Grammar::new()
            .named("list", Pattern::var("item").rep(0))
            .named("item", Pattern::set("ab").rep(0))
            .start("list")
            .build();
        assert_eq!(compile_err(&p), PegError::InfiniteLoop("list".into()));
    }

    #[test]
    fn rule_errors() {
        assert_eq!(compile_err(&Grammar::new().build()), PegError::EmptyGrammar);
        assert_eq!(
            compile_err(&Pattern::var("x")),
            PegError::OutsideGrammar("x".into())
        );
        assert_eq!(
            compile_err(&Pattern::grammar([Pattern::var("y")])),
            PegError::UndefinedRule("y".into())
        );
        let dup = Grammar::new().named("a", "x").named("a", "y").start("a");
        assert_eq!(
            compile_err(&dup.build()),
            PegError::DuplicateRule("a".into())
        );
        let missing = Grammar::new().named("a", "x");
        assert_eq!(
            compile_err(&missing.build()),
            PegError::MissingStart(RuleKey::Index(0))
        );
    }
}
