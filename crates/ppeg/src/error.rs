use thiserror::Error;

use crate::grammar::RuleKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PegError {
    #[error("Range string must have an even length, got {0}")]
    OddRange(usize),

    #[error("Invalid argument index {0}")]
    ArgumentIndex(usize),

    #[error("Rule {0} referenced outside a grammar")]
    OutsideGrammar(RuleKey),

    #[error("Rule {0} is not defined")]
    UndefinedRule(RuleKey),

    #[error("Rule {0} is defined more than once")]
    DuplicateRule(RuleKey),

    #[error("Grammar has no rules")]
    EmptyGrammar,

    #[error("Start rule {0} is not defined")]
    MissingStart(RuleKey),

    #[error("Rule {0} is left recursive")]
    LeftRecursion(RuleKey),

    #[error("Loop body may accept empty string")]
    EmptyLoop,

    #[error("Rule {0} contains a loop that may accept empty string")]
    InfiniteLoop(RuleKey),

    #[error("Pattern is too big")]
    PatternTooBig,

    #[error("Unresolved call to rule at {0}")]
    UnresolvedCall(usize),

    #[error("Invalid stack entry at {0}")]
    InvalidStack(usize),

    #[error("Too many pending calls or choices")]
    StackOverflow,

    #[error("Back reference {0:?} not found")]
    BackReference(String),

    #[error("No argument {0} given")]
    MissingArgument(usize),

    #[error("No initial value for fold capture")]
    EmptyFold,

    #[error("Invalid capture index %{0}")]
    CaptureIndex(usize),

    #[error("No value for capture %{0}")]
    NoCaptureValue(usize),

    #[error("Capture value cannot be used as replacement text")]
    InvalidReplacement,

    #[error("Malformed capture list")]
    MalformedCaptures,
}
