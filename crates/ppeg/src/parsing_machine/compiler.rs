use std::fmt;

use bstr::BString;

use crate::{
    grammar::Grammar,
    pattern::{Capture, FoldFn, MapFn, MatchFn, Node, Pattern, QueryTable, RuntimeFn},
    PegError, Value,
};

use super::{
    op::{CaptureKind, Offset, Operation, MAX_OFF},
    set::Set,
    validate::{self, RuleTable},
};

type Code = Vec<Operation>;

/// Constant data referenced by instructions, indexed from 1
#[derive(Clone)]
pub(crate) enum KValue {
    Value(Value),
    Name(String),
    Template(BString),
    Query(QueryTable),
    Fold(FoldFn),
    Function(MapFn),
    Runtime(RuntimeFn),
    Func(MatchFn),
}

#[derive(Clone)]
pub struct Program {
    pub(crate) ops: Vec<Operation>,
    pub(crate) ktable: Vec<KValue>,
}

impl Program {
    /// Instructions as (mnemonic, aux, offset) tuples up to and including
    /// the final `end`
    pub fn dump(&self) -> Vec<(&'static str, i32, i32)> {
        let end = self
            .ops
            .iter()
            .position(|op| *op == Operation::End)
            .map(|i| i + 1)
            .unwrap_or(self.ops.len());

        self.ops[..end]
            .iter()
            .map(|op| {
                let (aux, offset) = op.operands();
                (op.name(), aux, offset)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn kvalue(&self, idx: usize) -> Option<&KValue> {
        idx.checked_sub(1).and_then(|i| self.ktable.get(i))
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            write!(f, "{i}: {op:?} ")?;

            writeln!(f)?;
        }

        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            let target = |off: Offset| i as i64 + off as i64;
            let fail = |off: Offset| {
                if off == 0 {
                    "FAIL".to_string()
                } else {
                    target(off).to_string()
                }
            };

            write!(f, "{i:02}: {}", op.name())?;
            match op {
                Operation::Any { n, fail: off } => write!(f, " * {n} -> {}", fail(*off))?,
                Operation::Char { byte, fail: off } => {
                    write!(f, " '{}' -> {}", byte.escape_ascii(), fail(*off))?
                }
                Operation::Set { set, fail: off } => write!(f, " {set:?} -> {}", fail(*off))?,
                Operation::Span(set) => write!(f, " {set:?}")?,
                Operation::Choice { to, back } => write!(f, " -> {} ({back})", target(*to))?,
                Operation::Jump(o)
                | Operation::Call(o)
                | Operation::Commit(o)
                | Operation::PartialCommit(o)
                | Operation::BackCommit(o) => write!(f, " -> {}", target(*o))?,
                Operation::OpenCall(rule) => write!(f, " {rule}")?,
                Operation::Func(idx) => write!(f, " (idx = {idx})")?,
                Operation::FullCapture { kind, len, idx } => {
                    write!(f, " {kind:?}(idx = {idx}) (off = {len})")?
                }
                Operation::EmptyCapture { kind, idx }
                | Operation::EmptyCaptureIdx { kind, idx } => write!(f, " {kind:?}(idx = {idx})")?,
                Operation::OpenCapture { kind, off, idx } => {
                    write!(f, " {kind:?}(idx = {idx}) (off = {off})")?
                }
                _ => {}
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

/// Grammar and rule the pattern being compiled belongs to
#[derive(Clone, Copy)]
struct Scope<'a> {
    rules: &'a RuleTable,
    rule: usize,
}

// Read these if confused
// https://www.inf.puc-rio.br/~roberto/docs/peg.pdf
// https://github.com/roberto-ieru/LPeg/blob/master/lpcode.c
//
// Every pattern is compiled into a self contained block of code, all offsets
// are relative so blocks can be concatenated freely. Rule calls stay open
// until the enclosing grammar is linked.
#[derive(Default)]
pub(crate) struct Compiler {
    ktable: Vec<KValue>,
}

impl Compiler {
    pub fn compile(pattern: &Pattern) -> Result<Program, PegError> {
        let mut compiler = Compiler::default();
        let mut ops = compiler.lower(pattern, None)?;

        optimize_captures(&mut ops);
        ops.push(Operation::End);
        optimize_jumps(&mut ops);
        ops.push(Operation::Giveup);
        offset(ops.len())?;

        log::debug!(
            "Compiled pattern into {} operations and {} constants",
            ops.len(),
            compiler.ktable.len()
        );

        Ok(Program {
            ops,
            ktable: compiler.ktable,
        })
    }

    fn push_kvalue(&mut self, value: KValue) -> usize {
        self.ktable.push(value);
        self.ktable.len()
    }

    fn lower(&mut self, pattern: &Pattern, scope: Option<Scope>) -> Result<Code, PegError> {
        let code = match pattern.node() {
            Node::Any(n) => any(*n)?,
            Node::Literal(s) => s
                .iter()
                .map(|byte| Operation::Char {
                    byte: *byte,
                    fail: 0,
                })
                .collect(),
            Node::Set(set) => charset_code(set),
            Node::Fail => vec![Operation::Fail],
            Node::Succeed => vec![],
            Node::Seq(a, b) => {
                let a = self.lower(a, scope)?;
                let b = self.lower(b, scope)?;
                sequence(a, b)?
            }
            Node::Choice(a, b) => {
                let a = self.lower(a, scope)?;
                let b = self.lower(b, scope)?;
                choice(a, b)?
            }
            Node::Not(a) => {
                let a = self.lower(a, scope)?;
                difference(vec![], a)?
            }
            Node::And(a) => {
                let a = self.lower(a, scope)?;
                and(a)?
            }
            Node::Repeat(a, n) => {
                if *n >= 0 {
                    validate::check_loop(a, scope.map(|s| (s.rules, s.rule)))?;
                }
                let body = self.lower(a, scope)?;
                repeat(body, *n)?
            }
            Node::Diff(a, b) => {
                let a = self.lower(a, scope)?;
                let b = self.lower(b, scope)?;
                difference(a, b)?
            }
            Node::Capture(cap, a) => {
                let body = self.lower(a, scope)?;
                self.capture(cap, body)
            }
            Node::Position => vec![Operation::EmptyCapture {
                kind: CaptureKind::Position,
                idx: 0,
            }],
            Node::Const(values) => values
                .iter()
                .map(|value| Operation::EmptyCaptureIdx {
                    kind: CaptureKind::Const,
                    idx: self.push_kvalue(KValue::Value(value.clone())),
                })
                .collect(),
            Node::Arg(n) => vec![Operation::EmptyCapture {
                kind: CaptureKind::Arg,
                idx: *n,
            }],
            Node::Backref(name) => vec![Operation::EmptyCaptureIdx {
                kind: CaptureKind::Backref,
                idx: self.push_kvalue(KValue::Name(name.clone())),
            }],
            Node::Func(f) => vec![Operation::Func(self.push_kvalue(KValue::Func(f.clone())))],
            Node::RuleRef(key) => {
                let scope = scope.ok_or_else(|| PegError::OutsideGrammar(key.clone()))?;
                let rule = scope
                    .rules
                    .get(key)
                    .ok_or_else(|| PegError::UndefinedRule(key.clone()))?;
                vec![Operation::OpenCall(rule)]
            }
            Node::Grammar(grammar) => self.grammar(grammar)?,
        };

        Ok(code)
    }

    fn capture(&mut self, cap: &Capture, mut body: Code) -> Code {
        let (kind, idx) = match cap {
            Capture::Simple => (CaptureKind::Simple, 0),
            Capture::Table => (CaptureKind::Table, 0),
            Capture::Subst => (CaptureKind::Subst, 0),
            Capture::Group(None) => (CaptureKind::Group, 0),
            Capture::Group(Some(name)) => (
                CaptureKind::Group,
                self.push_kvalue(KValue::Name(name.clone())),
            ),
            Capture::Fold(f) => (CaptureKind::Fold, self.push_kvalue(KValue::Fold(f.clone()))),
            Capture::Function(f) => (
                CaptureKind::Function,
                self.push_kvalue(KValue::Function(f.clone())),
            ),
            Capture::Query(table) => (
                CaptureKind::Query,
                self.push_kvalue(KValue::Query(table.clone())),
            ),
            Capture::String(fmt) => (
                CaptureKind::String,
                self.push_kvalue(KValue::Template(fmt.clone())),
            ),
            Capture::Runtime(f) => (
                CaptureKind::Runtime,
                self.push_kvalue(KValue::Runtime(f.clone())),
            ),
        };

        if kind != CaptureKind::Runtime {
            if let Some(len) = fixed_len(&body) {
                body.push(Operation::FullCapture { kind, len, idx });
                return body;
            }
        }

        let close = if kind == CaptureKind::Runtime {
            Operation::CloseRuntime
        } else {
            Operation::CloseCapture
        };

        let mut code = Vec::with_capacity(body.len() + 2);
        code.push(Operation::OpenCapture { kind, off: 0, idx });
        code.extend(body);
        code.push(close);
        code
    }

    //     Call <start>
    //     Jump L1
    //     <rule 0>
    //     Return
    //     ...
    //     <rule n>
    //     Return
    // L1: ...
    fn grammar(&mut self, grammar: &Grammar) -> Result<Code, PegError> {
        let rules = RuleTable::new(grammar)?;

        let mut bodies = Vec::with_capacity(grammar.len());
        for (i, (_, rule)) in grammar.rules.iter().enumerate() {
            let scope = Scope { rules: &rules, rule: i };
            bodies.push(self.lower(rule, Some(scope))?);
        }

        let mut positions = Vec::with_capacity(bodies.len());
        let mut size = 2;
        for body in &bodies {
            positions.push(size);
            size += body.len() + 1;
        }

        let mut code = Vec::with_capacity(size);
        code.push(Operation::Call(offset(positions[rules.start()])?));
        code.push(Operation::Jump(offset(size - 1)?));
        for body in bodies {
            code.extend(body);
            code.push(Operation::Return);
        }

        // Link rule calls, calls in tail position become jumps
        for i in 0..code.len() {
            if let Operation::OpenCall(rule) = code[i] {
                let rel = offset(positions[rule])? - offset(i)?;
                code[i] = if is_tail(&code, i + 1) {
                    Operation::Jump(rel)
                } else {
                    Operation::Call(rel)
                };
            }
        }

        Ok(code)
    }
}

fn offset(n: usize) -> Result<Offset, PegError> {
    Offset::try_from(n).map_err(|_| PegError::PatternTooBig)
}

fn is_fail(code: &[Operation]) -> bool {
    matches!(code, [Operation::Fail])
}

/// Single byte check
fn charset(code: &[Operation]) -> Option<Set> {
    match code {
        [op] if op.is_check() && op.step() == 1 => op.first_set(),
        _ => None,
    }
}

fn charset_code(set: &Set) -> Code {
    if set.is_empty() {
        return vec![Operation::Fail];
    }

    match set.single() {
        Some(byte) => vec![Operation::Char { byte, fail: 0 }],
        None => vec![Operation::Set { set: *set, fail: 0 }],
    }
}

/// Total length of a block made only of checks, if small enough to be
/// captured with a full capture
fn fixed_len(code: &[Operation]) -> Option<u8> {
    let mut len = 0usize;
    for op in code {
        if !op.is_check() {
            return None;
        }
        len += op.step() as usize;
    }

    (len <= MAX_OFF as usize).then_some(len as u8)
}

/// Total length of a block made only of any checks
fn any_len(code: &[Operation]) -> Option<i64> {
    code.iter()
        .map(|op| match op {
            Operation::Any { n, fail: 0 } => Some(*n as i64),
            _ => None,
        })
        .sum()
}

/// Block that can only fail at its first instruction, which is a check
/// nothing jumps back to
fn is_headfail(code: &[Operation]) -> bool {
    match code.split_first() {
        Some((head, rest)) => {
            head.is_check() && rest.iter().all(Operation::cannot_fail) && !jump_targets(code)[0]
        }
        None => false,
    }
}

/// Instructions some jump in the block lands on. The extra last slot is the
/// end of the block.
fn jump_targets(code: &[Operation]) -> Vec<bool> {
    let mut targets = vec![false; code.len() + 1];
    for (i, op) in code.iter().enumerate() {
        if let Some(off) = op.offset() {
            let target = i as i64 + off as i64;
            if let Some(slot) = usize::try_from(target).ok().and_then(|t| targets.get_mut(t)) {
                *slot = true;
            }
        }
    }
    targets
}

/// Whether the instruction at `at` returns right away
fn is_tail(code: &[Operation], mut at: usize) -> bool {
    for _ in 0..code.len() {
        match code.get(at) {
            Some(Operation::Jump(off)) => match usize::try_from(at as i64 + *off as i64) {
                Ok(next) => at = next,
                Err(_) => return false,
            },
            Some(Operation::Return) => return true,
            _ => return false,
        }
    }

    false
}

fn any(n: i64) -> Result<Code, PegError> {
    let count = n.unsigned_abs();
    let size = usize::try_from(count.div_ceil(u8::MAX as u64))
        .map_err(|_| PegError::PatternTooBig)?;
    offset(size)?;

    if n >= 0 {
        return Ok(any_code(count));
    }

    if count <= u8::MAX as u64 {
        // Fails if count bytes are available
        return Ok(vec![
            Operation::Any {
                n: count as u8,
                fail: 2,
            },
            Operation::Fail,
        ]);
    }

    difference(vec![], any_code(count))
}

/// Checks consuming exactly `count` bytes
fn any_code(count: u64) -> Code {
    let mut code = vec![];
    let mut left = count;
    while left > 0 {
        let step = left.min(u8::MAX as u64);
        code.push(Operation::Any {
            n: step as u8,
            fail: 0,
        });
        left -= step;
    }
    code
}

fn sequence(mut a: Code, b: Code) -> Result<Code, PegError> {
    if is_fail(&a) || b.is_empty() {
        return Ok(a);
    }

    if is_fail(&b) || a.is_empty() {
        return Ok(b);
    }

    if let (Some(x), Some(y)) = (any_len(&a), any_len(&b)) {
        return any(x + y);
    }

    a.extend(b);
    Ok(a)
}

fn choice(a: Code, b: Code) -> Result<Code, PegError> {
    if is_fail(&a) {
        return Ok(b);
    }

    if is_fail(&b) || a.is_empty() {
        return Ok(a);
    }

    if let (Some(x), Some(y)) = (charset(&a), charset(&b)) {
        return Ok(charset_code(&(x | y)));
    }

    let la = a.len();
    let lb = b.len();

    let exclusive = match (a[0].first_set(), b.first().filter(|op| op.is_check())) {
        (Some(x), Some(head)) if a[0].is_check() && !jump_targets(&a)[0] => head
            .first_set()
            .map(|y| x.is_disjoint(&y))
            .unwrap_or(false),
        _ => false,
    };

    //     Test L1
    //     <a>
    //     Jump L2
    // L1: <b>
    // L2: ...
    if exclusive || is_headfail(&a) {
        let mut code = a;
        code[0].set_test(offset(la + 1)?);
        code.push(Operation::Jump(offset(lb + 1)?));
        code.extend(b);
        return Ok(code);
    }

    //     Choice L1
    //     <a>
    //     Commit L2
    // L1: <b>
    // L2: ...
    let mut code = Vec::with_capacity(la + lb + 2);
    code.push(Operation::Choice {
        to: offset(la + 2)?,
        back: 0,
    });
    code.extend(a);
    code.push(Operation::Commit(offset(lb + 1)?));
    code.extend(b);
    optimize_choice(&mut code, 0);
    Ok(code)
}

/// Matches `a` if `b` does not match
fn difference(a: Code, b: Code) -> Result<Code, PegError> {
    if is_fail(&b) {
        return Ok(a);
    }

    if b.is_empty() {
        return Ok(vec![Operation::Fail]);
    }

    if let (Some(x), Some(y)) = (charset(&a), charset(&b)) {
        return Ok(charset_code(&(x - y)));
    }

    let lb = b.len();

    //     Test L1
    //     <b>
    //     Fail
    // L1: <a>
    if is_headfail(&b) {
        let mut code = b;
        code[0].set_test(offset(lb + 1)?);
        code.push(Operation::Fail);
        code.extend(a);
        return Ok(code);
    }

    //     Choice L1
    //     <b>
    //     FailTwice
    // L1: <a>
    let mut code = Vec::with_capacity(a.len() + lb + 2);
    code.push(Operation::Choice {
        to: offset(lb + 2)?,
        back: 0,
    });
    code.extend(b);
    code.push(Operation::FailTwice);
    code.extend(a);
    optimize_choice(&mut code, 0);
    Ok(code)
}

//     Choice L1
//     <a>
//     BackCommit L2
// L1: Fail
// L2: ...
fn and(a: Code) -> Result<Code, PegError> {
    if a.is_empty() || is_fail(&a) {
        return Ok(a);
    }

    let la = a.len();
    let mut code = Vec::with_capacity(la + 3);
    code.push(Operation::Choice {
        to: offset(la + 2)?,
        back: 0,
    });
    code.extend(a);
    code.push(Operation::BackCommit(2));
    code.push(Operation::Fail);
    Ok(code)
}

fn repeat(body: Code, n: i64) -> Result<Code, PegError> {
    let len = body.len();
    let count = usize::try_from(n.unsigned_abs()).map_err(|_| PegError::PatternTooBig)?;
    let size = count
        .checked_add(2)
        .and_then(|c| c.checked_mul(len + 1))
        .ok_or(PegError::PatternTooBig)?;
    offset(size)?;

    let mut code = Vec::with_capacity(size);

    if n >= 0 {
        for _ in 0..count {
            code.extend_from_slice(&body);
        }

        if let Some(set) = charset(&body) {
            code.push(Operation::Span(set));
        } else if is_headfail(&body) {
            // L1: Test L2
            //     <body>
            //     Jump L1
            // L2: ...
            let mut test = body;
            test[0].set_test(offset(len + 1)?);
            code.extend(test);
            code.push(Operation::Jump(-offset(len)?));
        } else {
            //     Choice L2
            // L1: <body>
            //     PartialCommit L1
            // L2: ...
            code.push(Operation::Choice {
                to: offset(len + 2)?,
                back: 0,
            });
            code.extend(body);
            code.push(Operation::PartialCommit(-offset(len)?));
        }

        return Ok(code);
    }

    if is_headfail(&body) {
        // Each test jumps to the end
        for i in 0..count {
            let mut copy = body.clone();
            copy[0].set_test(offset((count - i) * len)?);
            code.extend(copy);
        }
        return Ok(code);
    }

    //     Choice L1
    //     <body>
    //     PartialCommit 1
    //     ...
    //     <body>
    //     Commit 1
    // L1: ...
    code.push(Operation::Choice {
        to: offset(1 + count * (len + 1))?,
        back: 0,
    });
    for i in 0..count {
        code.extend_from_slice(&body);
        if i + 1 == count {
            code.push(Operation::Commit(1));
        } else {
            code.push(Operation::PartialCommit(1));
        }
    }
    optimize_choice(&mut code, 0);
    Ok(code)
}

/// Move a check following a choice in front of it as a test, so failing
/// the check does not need to push and pop a backtrack entry
fn optimize_choice(code: &mut Code, at: usize) {
    let Some(Operation::Choice { to, .. }) = code.get(at).cloned() else {
        return;
    };
    let Some(check) = code.get(at + 1).filter(|op| op.is_check()).cloned() else {
        return;
    };
    if to <= 1 || jump_targets(code)[at + 1] {
        return;
    }

    let back = check.step();
    let mut test = check;
    test.set_test(to);
    code[at] = test;
    code[at + 1] = Operation::Choice { to: to - 1, back };
}

/// Move open captures past the fixed length checks following them
fn optimize_captures(code: &mut Code) {
    let targets = jump_targets(code);
    let mut i = 0;

    while i < code.len() {
        let Operation::OpenCapture { kind, off: 0, idx } = code[i] else {
            i += 1;
            continue;
        };

        let mut j = i + 1;
        let mut off = 0u8;
        while j < code.len() && code[j].is_check() && !targets[j] {
            let step = code[j].step();
            if off as usize + step as usize > MAX_OFF as usize {
                break;
            }
            off += step;
            j += 1;
        }

        if j > i + 1 {
            code[i..j].rotate_left(1);
            code[j - 1] = Operation::OpenCapture { kind, off, idx };
        }
        i = j;
    }
}

/// Make jumps to jumps go directly to the final destination
fn optimize_jumps(code: &mut Code) {
    for i in 0..code.len() {
        let Some(off) = code[i].offset() else {
            continue;
        };

        let mut target = i as i64 + off as i64;
        for _ in 0..code.len() {
            match usize::try_from(target).ok().and_then(|t| code.get(t)) {
                Some(Operation::Jump(next)) if *next != 0 => target += *next as i64,
                _ => break,
            }
        }

        if let Some(off) = code[i].offset_mut() {
            *off = (target - i as i64) as Offset;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Grammar, Pattern, PegError};

    fn names(p: &Pattern) -> Vec<&'static str> {
        let program = p.compile().unwrap();
        let mut names: Vec<_> = program.dump().iter().map(|(name, _, _)| *name).collect();
        assert_eq!(names.pop(), Some("end"));
        names
    }

    #[test]
    fn compile_any() {
        assert!(names(&Pattern::any(0)).is_empty());
        assert_eq!(names(&Pattern::any(1)), ["any"]);
        assert_eq!(names(&Pattern::any(-1)), ["any", "fail"]);
        assert_eq!(names(&Pattern::any(300)), ["any", "any"]);

        let dump = Pattern::any(300).dump().unwrap();
        assert_eq!(dump[0], ("any", 255, 0));
        assert_eq!(dump[1], ("any", 45, 0));
        assert_eq!(Pattern::any(2) + Pattern::any(3), Pattern::any(5));
    }

    #[test]
    fn compile_any_too_big() {
        for n in [i64::MIN, i64::MAX, 1 << 40, -(1 << 40)] {
            assert_eq!(
                Pattern::any(n).compile().err(),
                Some(PegError::PatternTooBig),
                "any({n})"
            );
        }
    }

    #[test]
    fn compile_charsets() {
        assert_eq!(names(&Pattern::literal("ab")), ["char", "char"]);
        assert_eq!(names(&Pattern::set("abc")), ["set"]);
        assert_eq!(names(&Pattern::range("az").unwrap()), ["set"]);
        assert_eq!(names(&(Pattern::set("ab") | Pattern::set("cd"))), ["set"]);
        assert_eq!(names(&(Pattern::set("ab") - Pattern::set("a"))), ["char"]);
    }

    #[test]
    fn compile_and() {
        assert!(names(&Pattern::succeed().followed_by()).is_empty());
        assert_eq!(names(&Pattern::fail().followed_by()), ["fail"]);
        assert_eq!(
            names(&Pattern::any(5).followed_by()),
            ["choice", "any", "back_commit", "fail"]
        );
        let p = Pattern::any(1) + "ab";
        assert_eq!(
            names(&p.followed_by()),
            ["choice", "any", "char", "char", "back_commit", "fail"]
        );
    }

    #[test]
    fn compile_not() {
        assert_eq!(names(&-Pattern::succeed()), ["fail"]);
        assert!(names(&-Pattern::fail()).is_empty());
        assert_eq!(
            names(&(Pattern::literal("bc") - Pattern::literal("ef"))),
            ["char", "choice", "char", "failtwice", "char", "char"]
        );
        assert_eq!(names(&-Pattern::set("ab")), ["set", "fail"]);
    }

    #[test]
    fn compile_choice() {
        assert_eq!(names(&(Pattern::literal("a") | false)), ["char"]);
        assert_eq!(names(&(Pattern::fail() | "a")), ["char"]);
        assert!(names(&(Pattern::succeed() | "a")).is_empty());
        assert_eq!(
            names(&(Pattern::literal("ab") | "cd")),
            ["char", "char", "jmp", "char", "char"]
        );
        assert_eq!(
            names(&(Pattern::literal("ab") | "ac")),
            ["char", "choice", "char", "commit", "char", "char"]
        );
    }

    #[test]
    fn compile_repeat() {
        assert_eq!(
            names(&Pattern::any(1).rep(3)),
            ["any", "any", "any", "span"]
        );
        assert_eq!(
            names(&Pattern::literal("ab").rep(0)),
            ["choice", "char", "char", "partial_commit"]
        );
        let headfail = Pattern::literal("a") + Pattern::set("bc").rep(0);
        assert_eq!(names(&headfail.rep(0)), ["char", "span", "jmp"]);
        assert_eq!(names(&Pattern::set("ab").rep(-2)), ["set", "set"]);
        assert_eq!(
            names(&Pattern::literal("ab").rep(-2)),
            ["char", "choice", "char", "partial_commit", "char", "char", "commit"]
        );
    }

    #[test]
    fn compile_captures() {
        let dump = Pattern::any(1).capture().dump().unwrap();
        assert_eq!(dump.len(), 3);
        assert_eq!(dump[1].0, "fullcapture");
        assert_eq!(dump[1].1 & 0xf, CaptureKind::Simple as i32);
        assert_eq!(dump[1].2, 0);

        let dump = Pattern::any(1).rep(1).capture().dump().unwrap();
        let ops: Vec<_> = dump.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(ops, ["any", "opencapture", "span", "closecapture", "end"]);
        assert_eq!(dump[1].1 & 0xf, CaptureKind::Simple as i32);
        assert_eq!(dump[1].1 >> 4, 1);

        let kind = |p: Pattern| p.dump().unwrap()[0].1 & 0xf;
        assert_eq!(kind(Pattern::position()), CaptureKind::Position as i32);
        assert_eq!(kind(Pattern::arg(1).unwrap()), CaptureKind::Arg as i32);
        assert_eq!(kind(Pattern::constant(["x"])), CaptureKind::Const as i32);
        assert_eq!(kind(Pattern::backref("x")), CaptureKind::Backref as i32);
        assert_eq!(
            Pattern::any(1).table().dump().unwrap()[1].1 & 0xf,
            CaptureKind::Table as i32
        );
        assert_eq!(
            Pattern::any(1).subst().dump().unwrap()[1].1 & 0xf,
            CaptureKind::Subst as i32
        );
        // Open moved past the check, one byte back
        let runtime = Pattern::any(1).match_time(|_, pos, _| Some((pos, vec![])));
        assert_eq!(names(&runtime), ["any", "opencapture", "closeruntime"]);
        let dump = runtime.dump().unwrap();
        assert_eq!(dump[1].1 & 0xf, CaptureKind::Runtime as i32);
        assert_eq!(dump[1].1 >> 4, 1);
    }

    #[test]
    fn compile_grammar() {
        let g = Pattern::grammar([Pattern::literal("Omega") | Pattern::any(1) + Pattern::var(0)]);
        let p = Pattern::constant(["hello"]) + &g | Pattern::constant([12i64]);
        let program = p.compile().unwrap();
        let expected = "\
00: choice -> 15 (0)
01: emptycaptureidx Const(idx = 1)
02: call -> 4
03: jmp -> 14
04: char 'O' -> 11
05: choice -> 11 (1)
06: char 'm' -> FAIL
07: char 'e' -> FAIL
08: char 'g' -> FAIL
09: char 'a' -> FAIL
10: commit -> 13
11: any * 1 -> FAIL
12: jmp -> 4
13: ret
14: commit -> 16
15: emptycaptureidx Const(idx = 2)
16: end
17: giveup
";
        assert_eq!(program.to_string(), expected);
    }

    #[test]
    fn compile_named_grammar() {
        let g = Grammar::new()
            .named("a", Pattern::literal("x") + Pattern::var("b"))
            .named("b", Pattern::literal("y") + Pattern::var("a") | "z")
            .start("a")
            .build();
        let program = g.compile().unwrap();
        assert!(!program.dump().iter().any(|(name, _, _)| *name == "open_call"));
    }
}
