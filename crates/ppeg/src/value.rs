use std::fmt;

use bstr::{BString, ByteSlice};

/// Value produced by captures
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Str(BString),
    List(Vec<Value>),
}

impl Value {
    pub fn str(bytes: impl AsRef<[u8]>) -> Value {
        Value::Str(BString::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Text used when the value is spliced into a substitution or used as a
    /// query key. Only strings and numbers have one.
    pub(crate) fn to_text(&self) -> Option<BString> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(BString::from(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{:?}", s.as_bstr()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(BString::from(s))
    }
}

impl From<&[u8]> for Value {
    fn from(s: &[u8]) -> Self {
        Value::str(s)
    }
}

impl From<BString> for Value {
    fn from(s: BString) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Nil)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        let value = Value::from(vec![Value::from("a"), Value::Int(2), Value::Nil]);
        assert_eq!(value.to_string(), r#"["a", 2, nil]"#);
    }

    #[test]
    fn text() {
        assert_eq!(Value::Int(12).to_text(), Some(BString::from("12")));
        assert_eq!(Value::from("x").to_text(), Some(BString::from("x")));
        assert_eq!(Value::Bool(true).to_text(), None);
    }
}
