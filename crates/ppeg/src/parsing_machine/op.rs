use super::set;

/// Relative jump distance from the current instruction
pub(crate) type Offset = i32;

/// Maximum distance an open capture can be moved past fixed length checks
pub(crate) const MAX_OFF: u8 = 0xf;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaptureKind {
    Close = 0,
    Position,
    Const,
    Backref,
    Arg,
    Simple,
    Table,
    Function,
    Query,
    String,
    Subst,
    Fold,
    Runtime,
    Group,
}

/// Parsing machine instruction.
///
/// Checks (`Any`, `Char`, `Set`) with a zero `fail` offset fail normally,
/// otherwise they are tests that jump by `fail` without consuming anything.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub(crate) enum Operation {
    Any { n: u8, fail: Offset },
    Char { byte: u8, fail: Offset },
    Set { set: set::Set, fail: Offset },
    Span(set::Set),
    Return,
    End,
    /// Push a backtrack entry to `to`, `back` bytes before the current position
    Choice { to: Offset, back: u8 },
    Jump(Offset),
    Call(Offset),
    /// Call to a rule index, resolved when the grammar is linked
    OpenCall(usize),
    Commit(Offset),
    PartialCommit(Offset),
    BackCommit(Offset),
    FailTwice,
    Fail,
    Giveup,
    Func(usize),
    FullCapture { kind: CaptureKind, len: u8, idx: usize },
    EmptyCapture { kind: CaptureKind, idx: usize },
    EmptyCaptureIdx { kind: CaptureKind, idx: usize },
    OpenCapture { kind: CaptureKind, off: u8, idx: usize },
    CloseCapture,
    CloseRuntime,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        use Operation::*;
        match self {
            Any { .. } => "any",
            Char { .. } => "char",
            Set { .. } => "set",
            Span(_) => "span",
            Return => "ret",
            End => "end",
            Choice { .. } => "choice",
            Jump(_) => "jmp",
            Call(_) => "call",
            OpenCall(_) => "open_call",
            Commit(_) => "commit",
            PartialCommit(_) => "partial_commit",
            BackCommit(_) => "back_commit",
            FailTwice => "failtwice",
            Fail => "fail",
            Giveup => "giveup",
            Func(_) => "func",
            FullCapture { .. } => "fullcapture",
            EmptyCapture { .. } => "emptycapture",
            EmptyCaptureIdx { .. } => "emptycaptureidx",
            OpenCapture { .. } => "opencapture",
            CloseCapture => "closecapture",
            CloseRuntime => "closeruntime",
        }
    }

    /// Auxiliary operand and offset as shown in program dumps
    pub fn operands(&self) -> (i32, i32) {
        use Operation::*;

        fn cap(kind: &CaptureKind, off: u8) -> i32 {
            *kind as i32 | (off as i32) << 4
        }

        match self {
            Any { n, fail } => (*n as i32, *fail),
            Char { byte, fail } => (*byte as i32, *fail),
            Set { fail, .. } => (0, *fail),
            Choice { to, back } => (*back as i32, *to),
            Jump(o) | Call(o) | Commit(o) | PartialCommit(o) | BackCommit(o) => (0, *o),
            OpenCall(rule) => (0, *rule as i32),
            Func(idx) => (0, *idx as i32),
            FullCapture { kind, len, idx } => (cap(kind, *len), *idx as i32),
            EmptyCapture { kind, idx } | EmptyCaptureIdx { kind, idx } => {
                (cap(kind, 0), *idx as i32)
            }
            OpenCapture { kind, off, idx } => (cap(kind, *off), *idx as i32),
            CloseCapture => (cap(&CaptureKind::Close, 0), 0),
            CloseRuntime => (cap(&CaptureKind::Close, 0), 0),
            Span(_) | Return | End | FailTwice | Fail | Giveup => (0, 0),
        }
    }

    /// Relative jump target of the instruction if it has one
    pub fn offset(&self) -> Option<Offset> {
        use Operation::*;
        match self {
            Any { fail, .. } | Char { fail, .. } | Set { fail, .. } if *fail != 0 => Some(*fail),
            Choice { to, .. } => Some(*to),
            Jump(o) | Call(o) | Commit(o) | PartialCommit(o) | BackCommit(o) => Some(*o),
            _ => None,
        }
    }

    pub fn offset_mut(&mut self) -> Option<&mut Offset> {
        use Operation::*;
        match self {
            Any { fail, .. } | Char { fail, .. } | Set { fail, .. } if *fail != 0 => Some(fail),
            Choice { to, .. } => Some(to),
            Jump(o) | Call(o) | Commit(o) | PartialCommit(o) | BackCommit(o) => Some(o),
            _ => None,
        }
    }

    /// Check that fails normally
    pub fn is_check(&self) -> bool {
        use Operation::*;
        matches!(
            self,
            Any { fail: 0, .. } | Char { fail: 0, .. } | Set { fail: 0, .. }
        )
    }

    /// Number of bytes consumed by a check
    pub fn step(&self) -> u8 {
        match self {
            Operation::Any { n, .. } => *n,
            Operation::Char { .. } | Operation::Set { .. } => 1,
            _ => 0,
        }
    }

    /// Turn a check into a test that jumps by `offset` on failure
    pub fn set_test(&mut self, offset: Offset) {
        use Operation::*;
        match self {
            Any { fail, .. } | Char { fail, .. } | Set { fail, .. } => *fail = offset,
            _ => {}
        }
    }

    /// Bytes a check may start with
    pub fn first_set(&self) -> Option<set::Set> {
        match self {
            Operation::Any { .. } => Some(set::Set::any()),
            Operation::Char { byte, .. } => Some(set::Set::from_bytes(&[*byte])),
            Operation::Set { set, .. } => Some(*set),
            _ => None,
        }
    }

    /// Instruction never fails when executed
    pub fn cannot_fail(&self) -> bool {
        use Operation::*;
        matches!(
            self,
            Span(_)
                | FullCapture { .. }
                | EmptyCapture { .. }
                | EmptyCaptureIdx { .. }
                | OpenCapture { .. }
                | CloseCapture
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_operands() {
        let op = Operation::OpenCapture {
            kind: CaptureKind::Simple,
            off: 1,
            idx: 0,
        };
        let (aux, offset) = op.operands();
        assert_eq!(aux & 0xf, 5);
        assert_eq!(aux >> 4, 1);
        assert_eq!(offset, 0);
    }

    #[test]
    fn checks_and_tests() {
        let mut op = Operation::Char { byte: b'a', fail: 0 };
        assert!(op.is_check());
        assert_eq!(op.offset(), None);

        op.set_test(3);
        assert!(!op.is_check());
        assert_eq!(op.offset(), Some(3));
        assert_eq!(op.name(), "char");
    }
}
