mod captures;
mod compiler;
mod op;
mod set;
mod stack;
mod validate;

use crate::{pattern::Pattern, PegError, Value};

use self::{
    captures::{find_open, CaptureEntry, Resolver},
    compiler::KValue,
    op::Offset,
    stack::{Stack, StackEntry},
};

pub(crate) use self::compiler::Compiler;
pub use self::compiler::Program;
pub use self::op::CaptureKind;
pub(crate) use self::op::Operation;
pub(crate) use self::set::Set;

// https://github.com/roberto-ieru/LPeg/blob/master/lpvm.c

/// Default limit for pending backtrack and return entries
const MAX_STACK: usize = 1 << 18;

/// Limits applied to a single match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Maximum number of pending choices and calls. Exceeding it aborts the
    /// match with [`PegError::StackOverflow`].
    pub max_stack: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_stack: MAX_STACK,
        }
    }
}

/// Successful match
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    end: usize,
    captures: Vec<Value>,
}

impl Match {
    /// Subject position where the match ended
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn captures(&self) -> &[Value] {
        &self.captures
    }

    pub fn into_captures(self) -> Vec<Value> {
        self.captures
    }
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Normal,
    Failure,
}

fn jump(ip: usize, offset: Offset) -> usize {
    (ip as i64 + offset as i64) as usize
}

/// Compiled pattern ready for matching. Can be reused for any number of
/// matches.
#[derive(Debug, Clone)]
pub struct ParsingMachine {
    program: Program,
    options: Options,
}

impl ParsingMachine {
    pub fn new(pattern: &Pattern) -> Result<ParsingMachine, PegError> {
        Self::with_options(pattern, Options::default())
    }

    pub fn with_options(pattern: &Pattern, options: Options) -> Result<ParsingMachine, PegError> {
        let program = Compiler::compile(pattern)?;
        Ok(ParsingMachine { program, options })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Instructions as (mnemonic, aux, offset) tuples
    pub fn dump(&self) -> Vec<(&'static str, i32, i32)> {
        self.program.dump()
    }

    /// Match the subject from its start. Returns `Ok(None)` if the pattern
    /// does not match.
    pub fn parse(&self, subject: impl AsRef<[u8]>) -> Result<Option<Match>, PegError> {
        self.do_parse(subject.as_ref(), 0, &[])
    }

    /// Match the subject starting at `start`. Positions past the end of the
    /// subject are clamped to its length. `args` are the values of argument
    /// captures, `Pattern::arg(1)` being the first one.
    pub fn parse_at(
        &self,
        subject: impl AsRef<[u8]>,
        start: usize,
        args: &[Value],
    ) -> Result<Option<Match>, PegError> {
        let subject = subject.as_ref();
        self.do_parse(subject, start.min(subject.len()), args)
    }

    fn push(&self, stack: &mut Stack, entry: StackEntry) -> Result<(), PegError> {
        if stack.len() >= self.options.max_stack {
            log::debug!(
                "Match aborted, stack limit of {} entries reached",
                self.options.max_stack
            );
            return Err(PegError::StackOverflow);
        }

        stack.push(entry);
        Ok(())
    }

    fn do_parse(
        &self,
        subject: &[u8],
        sp: usize,
        args: &[Value],
    ) -> Result<Option<Match>, PegError> {
        let ops = &self.program.ops;
        let slen = subject.len();
        // Instruction pointer
        let mut ip = 0;
        // Subject pointer
        let mut sp = sp;
        // State to indicate failure
        let mut state = State::Normal;
        // Stack for backtracking and returns, failing the bottom entry gives up
        let mut stack: Stack = vec![StackEntry::Backtrack {
            addr: ops.len().saturating_sub(1),
            spos: sp,
            caplevel: 0,
        }];
        // Captures made so far
        let mut captures: Vec<CaptureEntry> = vec![];

        log::trace!("Match start at {sp}, subject length {slen}");

        loop {
            let op = &ops[ip];

            match op {
                Operation::Any { n, fail } => {
                    let n = *n as usize;
                    if sp + n <= slen {
                        ip += 1;
                        sp += n;
                    } else if *fail != 0 {
                        ip = jump(ip, *fail);
                    } else {
                        state = State::Failure;
                    }
                }
                Operation::Char { byte, fail } => {
                    if subject.get(sp) == Some(byte) {
                        ip += 1;
                        sp += 1;
                    } else if *fail != 0 {
                        ip = jump(ip, *fail);
                    } else {
                        state = State::Failure;
                    }
                }
                Operation::Set { set, fail } => {
                    if subject.get(sp).map(|byte| set.has(*byte)).unwrap_or(false) {
                        ip += 1;
                        sp += 1;
                    } else if *fail != 0 {
                        ip = jump(ip, *fail);
                    } else {
                        state = State::Failure;
                    }
                }
                Operation::Span(set) => {
                    sp += subject[sp..]
                        .iter()
                        .take_while(|byte| set.has(**byte))
                        .count();
                    ip += 1;
                }
                Operation::Return => match stack.pop() {
                    Some(StackEntry::Return { addr }) => ip = addr,
                    _ => return Err(PegError::InvalidStack(ip)),
                },
                Operation::End => {
                    log::trace!("Match end at {sp}");
                    let values = Resolver::new(&self.program, subject, args, &captures).resolve()?;
                    return Ok(Some(Match {
                        end: sp,
                        captures: values,
                    }));
                }
                Operation::Choice { to, back } => {
                    let entry = StackEntry::Backtrack {
                        addr: jump(ip, *to),
                        spos: sp - *back as usize,
                        caplevel: captures.len(),
                    };
                    self.push(&mut stack, entry)?;
                    ip += 1;
                }
                Operation::Jump(l) => {
                    ip = jump(ip, *l);
                }
                Operation::Call(l) => {
                    self.push(&mut stack, StackEntry::Return { addr: ip + 1 })?;
                    ip = jump(ip, *l);
                }
                Operation::OpenCall(_) => return Err(PegError::UnresolvedCall(ip)),
                Operation::Commit(l) => {
                    match stack.pop() {
                        Some(StackEntry::Backtrack { .. }) => {}
                        _ => return Err(PegError::InvalidStack(ip)),
                    }
                    ip = jump(ip, *l);
                }
                Operation::PartialCommit(l) => {
                    match stack.last_mut() {
                        Some(StackEntry::Backtrack { spos, caplevel, .. }) => {
                            *spos = sp;
                            *caplevel = captures.len();
                        }
                        _ => return Err(PegError::InvalidStack(ip)),
                    }
                    ip = jump(ip, *l);
                }
                Operation::BackCommit(l) => {
                    match stack.pop() {
                        Some(StackEntry::Backtrack { spos, caplevel, .. }) => {
                            sp = spos;
                            captures.truncate(caplevel);
                        }
                        _ => return Err(PegError::InvalidStack(ip)),
                    }
                    ip = jump(ip, *l);
                }
                Operation::FailTwice => {
                    stack.pop();
                    state = State::Failure;
                }
                Operation::Fail => {
                    state = State::Failure;
                }
                Operation::Giveup => {
                    log::trace!("Match failed");
                    return Ok(None);
                }
                Operation::Func(idx) => {
                    let Some(KValue::Func(f)) = self.program.kvalue(*idx) else {
                        return Err(PegError::InvalidStack(ip));
                    };

                    match f(subject, sp) {
                        Some(next) if (sp..=slen).contains(&next) => {
                            ip += 1;
                            sp = next;
                        }
                        Some(next) => {
                            log::debug!("Function returned position {next} outside {sp}..={slen}");
                            state = State::Failure;
                        }
                        None => state = State::Failure,
                    }
                }
                Operation::FullCapture { kind, len, idx } => {
                    let len = *len as usize;
                    captures.push(CaptureEntry::Full {
                        kind: *kind,
                        idx: *idx,
                        pos: sp - len,
                        len,
                    });
                    ip += 1;
                }
                Operation::EmptyCapture { kind, idx } | Operation::EmptyCaptureIdx { kind, idx } => {
                    captures.push(CaptureEntry::Full {
                        kind: *kind,
                        idx: *idx,
                        pos: sp,
                        len: 0,
                    });
                    ip += 1;
                }
                Operation::OpenCapture { kind, off, idx } => {
                    captures.push(CaptureEntry::Open {
                        kind: *kind,
                        idx: *idx,
                        pos: sp - *off as usize,
                    });
                    ip += 1;
                }
                Operation::CloseCapture => {
                    match captures.last() {
                        // Nothing nested, turn into a full capture
                        Some(&CaptureEntry::Open { kind, idx, pos }) => {
                            captures.pop();
                            captures.push(CaptureEntry::Full {
                                kind,
                                idx,
                                pos,
                                len: sp - pos,
                            });
                        }
                        _ => captures.push(CaptureEntry::Close { pos: sp }),
                    }
                    ip += 1;
                }
                Operation::CloseRuntime => {
                    match self.close_runtime(subject, sp, args, &mut captures)? {
                        Some(next) => {
                            ip += 1;
                            sp = next;
                        }
                        None => state = State::Failure,
                    }
                }
            }

            // Recover from failure state
            while state != State::Normal {
                match stack.pop() {
                    Some(StackEntry::Backtrack {
                        addr,
                        spos,
                        caplevel,
                    }) => {
                        state = State::Normal;
                        ip = addr;
                        sp = spos;
                        captures.truncate(caplevel);
                    }
                    Some(StackEntry::Return { .. }) => {}
                    None => return Ok(None),
                }
            }
        }
    }

    /// Run the callback of the innermost open match time capture. Returns
    /// the position to continue from, or `None` if the capture fails.
    fn close_runtime(
        &self,
        subject: &[u8],
        sp: usize,
        args: &[Value],
        captures: &mut Vec<CaptureEntry>,
    ) -> Result<Option<usize>, PegError> {
        let open = find_open(captures).ok_or(PegError::MalformedCaptures)?;
        let (idx, start) = match &captures[open] {
            CaptureEntry::Open { idx, pos, .. } => (*idx, *pos),
            _ => return Err(PegError::MalformedCaptures),
        };
        let Some(KValue::Runtime(f)) = self.program.kvalue(idx) else {
            return Err(PegError::MalformedCaptures);
        };

        captures.push(CaptureEntry::Close { pos: sp });
        let values = Resolver::new(&self.program, subject, args, captures).nested(open);
        captures.pop();

        match f(subject, sp, values?) {
            Some((next, values)) if (start..=subject.len()).contains(&next) => {
                captures.truncate(open);
                if !values.is_empty() {
                    captures.push(CaptureEntry::Dynamic {
                        start,
                        end: next,
                        values,
                    });
                }
                Ok(Some(next))
            }
            Some((next, _)) => {
                log::debug!(
                    "Match time capture returned position {next} outside {start}..={}",
                    subject.len()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Grammar;

    fn end(p: &Pattern, subject: &str) -> Option<usize> {
        let result = p.matches(subject);
        assert!(result.is_ok(), "Parse failed with {result:?}");
        result.unwrap().map(|m| m.end())
    }

    #[test]
    fn parse_simple() {
        let p = Pattern::literal("ab") + Pattern::set("xy").rep(0);
        assert_eq!(end(&p, "abxyxz"), Some(5));
        assert_eq!(end(&p, "ba"), None);
        assert_eq!(end(&p, ""), None);
    }

    #[test]
    fn parse_ordered_choice() {
        let a = Pattern::literal("a");
        assert_eq!(end(&(a.clone() | Pattern::fail()), "a"), Some(1));
        assert_eq!(end(&(Pattern::fail() | a.clone()), "a"), Some(1));
        assert_eq!(end(&(a.clone() | "ab"), "ab"), Some(1));
        assert_eq!(end(&((a.clone() | "ab") + "c"), "abc"), None);
    }

    #[test]
    fn parse_balanced() {
        let inner = (Pattern::any(1) - Pattern::set("()"))
            | (Pattern::literal("(").followed_by() + Pattern::var(0));
        let p = Pattern::grammar([Pattern::literal("(") + inner.rep(0) + ")"]);

        assert_eq!(end(&p, "(a1())()"), Some(6));
        assert_eq!(end(&p, "(a1()()"), None);
    }

    #[test]
    fn parse_tail_recursion() {
        let rules = (0..4).map(|i| {
            let byte = b"abcd"[i];
            Pattern::literal([byte]) + Pattern::var((i + 1) % 4) | true
        });
        let p = Pattern::grammar(rules);
        let content = "abcd".repeat(10000);

        assert_eq!(end(&p, &content), Some(content.len()));
    }

    #[test]
    fn parse_lookaheads() {
        let p = Pattern::literal("a").followed_by() + "ab";
        assert_eq!(end(&p, "ab"), Some(2));
        assert_eq!(end(&p, "b"), None);

        let p = Pattern::set("ab").followed_by();
        assert_eq!(end(&p, "b"), Some(0));
        assert_eq!(end(&p, ""), None);

        let p = Pattern::literal("a").not_followed_by() + Pattern::any(1);
        assert_eq!(end(&p, "b"), Some(1));
        assert_eq!(end(&p, "a"), None);

        assert_eq!(end(&-Pattern::fail(), "x"), Some(0));
        assert_eq!(end(&-Pattern::succeed(), "x"), None);
    }

    #[test]
    fn parse_any() {
        assert_eq!(end(&Pattern::any(-1), ""), Some(0));
        assert_eq!(end(&Pattern::any(-1), "a"), None);
        assert_eq!(end(&Pattern::any(300), &"x".repeat(300)), Some(300));
        assert_eq!(end(&Pattern::any(-300), &"x".repeat(299)), Some(0));
        assert_eq!(end(&Pattern::any(-300), &"x".repeat(300)), None);
        assert_eq!(end(&Pattern::any(1).rep(3), "abcde"), Some(5));
        assert_eq!(end(&Pattern::any(1).rep(3), "ab"), None);
    }

    #[test]
    fn parse_bounded_repetition() {
        let p = Pattern::literal("ab").rep(-2);
        assert_eq!(end(&p, "ababab"), Some(4));
        assert_eq!(end(&p, "x"), Some(0));

        let p = (Pattern::literal("a") + "b" | "ac").rep(-2);
        assert_eq!(end(&p, "acab"), Some(4));
    }

    #[test]
    fn parse_at_offset() {
        let machine = ParsingMachine::new(&Pattern::literal("b")).unwrap();
        let m = machine.parse_at("ab", 1, &[]).unwrap().unwrap();
        assert_eq!(m.end(), 2);
        assert_eq!(machine.parse_at("ab", 0, &[]).unwrap(), None);

        let machine = ParsingMachine::new(&Pattern::position()).unwrap();
        let m = machine.parse_at("ab", 10, &[]).unwrap().unwrap();
        assert_eq!(m.captures(), &[Value::Int(2)]);
    }

    #[test]
    fn parse_func() {
        let until_semi = Pattern::func(|s, i| s[i..].iter().position(|b| *b == b';').map(|n| i + n));
        let p = until_semi + ";";
        assert_eq!(end(&p, "abc;d"), Some(4));
        assert_eq!(end(&p, "abc"), None);

        let backwards = Pattern::any(1) + Pattern::func(|_, _| Some(0));
        assert_eq!(end(&backwards, "ab"), None);

        // Past the end of the subject fails and backtracks
        let past_end = Pattern::func(|s, _| Some(s.len() + 1)) | Pattern::any(1);
        assert_eq!(end(&past_end, "ab"), Some(1));
        assert_eq!(end(&past_end, ""), None);

        let to_end = Pattern::func(|s, _| Some(s.len())) | Pattern::any(1);
        assert_eq!(end(&to_end, "ab"), Some(2));
    }

    #[test]
    fn parse_stack_overflow() {
        let p = Grammar::new()
            .rule(Pattern::literal("a") + Pattern::var(0) + "b" | true)
            .build();
        let options = Options { max_stack: 16 };
        let machine = ParsingMachine::with_options(&p, options).unwrap();

        assert!(machine.parse("aabb").unwrap().is_some());

        let deep = format!("{}{}", "a".repeat(100), "b".repeat(100));
        assert_eq!(machine.parse(&deep).err(), Some(PegError::StackOverflow));

        let machine = ParsingMachine::new(&p).unwrap();
        assert_eq!(machine.parse(&deep).unwrap().map(|m| m.end()), Some(200));
    }

    #[test]
    fn parse_match_time() {
        let count = (Pattern::any(1).capture() + Pattern::any(1).capture())
            .match_time(|_, pos, values| Some((pos, vec![Value::Int(values.len() as i64)])));
        let m = count.matches("ab").unwrap().unwrap();
        assert_eq!(m.captures(), &[Value::Int(2)]);

        // Skip ahead to the end of the subject
        let rest = Pattern::succeed().match_time(|s, _, _| Some((s.len(), vec![])));
        let m = (Pattern::literal("x") + rest).matches("xyz").unwrap().unwrap();
        assert_eq!(m.end(), 3);
        assert!(m.captures().is_empty());

        let backwards = Pattern::literal("x") + Pattern::any(2).match_time(|_, _, _| Some((0, vec![])));
        assert_eq!(end(&backwards, "xab"), None);

        let rejected = Pattern::any(1).match_time(|_, _, _| None) | Pattern::any(2);
        assert_eq!(end(&rejected, "ab"), Some(2));

        // Past the end of the subject fails and backtracks
        let past_end = Pattern::any(1)
            .capture()
            .match_time(|s, _, values| Some((s.len() + 1, values)))
            | Pattern::literal("a");
        let m = past_end.matches("ab").unwrap().unwrap();
        assert_eq!(m.end(), 1);
        assert!(m.captures().is_empty());
        assert_eq!(end(&past_end, "b"), None);
    }

    #[test]
    fn parse_grammar_without_captures() {
        let p = Grammar::new()
            .named("s", Pattern::literal("a") + Pattern::var("s") | "b")
            .start("s")
            .build();
        let m = p.matches("aab").unwrap().unwrap();
        assert_eq!(m.end(), 3);
        assert!(m.captures().is_empty());
    }
}
