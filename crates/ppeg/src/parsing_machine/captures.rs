use bstr::BString;

use crate::{PegError, Value};

use super::{
    compiler::{KValue, Program},
    op::CaptureKind,
};

/// Maximum number of pieces a string capture can refer to, `%0` to `%9`
const MAX_STR_CAPS: usize = 10;

/// Capture stack entry recorded while matching
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CaptureEntry {
    /// Capture waiting for its close
    Open {
        kind: CaptureKind,
        idx: usize,
        pos: usize,
    },
    /// Capture with no nested captures
    Full {
        kind: CaptureKind,
        idx: usize,
        pos: usize,
        len: usize,
    },
    Close {
        pos: usize,
    },
    /// Values returned by a match time capture
    Dynamic {
        start: usize,
        end: usize,
        values: Vec<Value>,
    },
}

impl CaptureEntry {
    fn kind(&self) -> Option<CaptureKind> {
        match self {
            CaptureEntry::Open { kind, .. } | CaptureEntry::Full { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn start(&self) -> usize {
        match self {
            CaptureEntry::Open { pos, .. }
            | CaptureEntry::Full { pos, .. }
            | CaptureEntry::Close { pos } => *pos,
            CaptureEntry::Dynamic { start, .. } => *start,
        }
    }
}

/// Index of the innermost capture still open at the end of the list
pub(crate) fn find_open(entries: &[CaptureEntry]) -> Option<usize> {
    let mut depth = 0;
    for (i, entry) in entries.iter().enumerate().rev() {
        match entry {
            CaptureEntry::Close { .. } => depth += 1,
            CaptureEntry::Open { .. } => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }

    None
}

/// Pieces of text a string capture can refer to
#[derive(Debug)]
enum StrItem {
    Text(usize, usize),
    Capture(usize),
}

/// Turns the capture list into values, walking it once left to right
pub(crate) struct Resolver<'a> {
    program: &'a Program,
    subject: &'a [u8],
    args: &'a [Value],
    entries: &'a [CaptureEntry],
    cur: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(
        program: &'a Program,
        subject: &'a [u8],
        args: &'a [Value],
        entries: &'a [CaptureEntry],
    ) -> Resolver<'a> {
        Resolver {
            program,
            subject,
            args,
            entries,
            cur: 0,
        }
    }

    /// Values of all the captures
    pub fn resolve(mut self) -> Result<Vec<Value>, PegError> {
        let mut values = vec![];
        while self.cur < self.entries.len() {
            self.push_capture(&mut values)?;
        }
        Ok(values)
    }

    /// Values nested in the closed capture at `open`, or its matched text
    pub fn nested(mut self, open: usize) -> Result<Vec<Value>, PegError> {
        self.cur = open;
        let mut values = vec![];
        self.nested_values(&mut values, false)?;
        Ok(values)
    }

    fn entry(&self) -> Result<&'a CaptureEntry, PegError> {
        self.entries
            .get(self.cur)
            .ok_or(PegError::MalformedCaptures)
    }

    fn at_close(&self) -> Result<bool, PegError> {
        Ok(matches!(self.entry()?, CaptureEntry::Close { .. }))
    }

    fn close_pos(&self) -> Result<usize, PegError> {
        match self.entry()? {
            CaptureEntry::Close { pos } => Ok(*pos),
            _ => Err(PegError::MalformedCaptures),
        }
    }

    fn kvalue(&self, idx: usize) -> Result<&'a KValue, PegError> {
        self.program
            .kvalue(idx)
            .ok_or(PegError::MalformedCaptures)
    }

    fn slice(&self, start: usize, end: usize) -> Result<&'a [u8], PegError> {
        self.subject
            .get(start..end)
            .ok_or(PegError::MalformedCaptures)
    }

    fn text(&self, start: usize, end: usize) -> Result<Value, PegError> {
        Ok(Value::Str(BString::from(self.slice(start, end)?)))
    }

    /// Index right after the capture starting at `i`
    fn skip(&self, i: usize) -> Result<usize, PegError> {
        match self.entries.get(i) {
            Some(CaptureEntry::Open { .. }) => {
                let mut depth = 0;
                for (j, entry) in self.entries.iter().enumerate().skip(i) {
                    match entry {
                        CaptureEntry::Open { .. } => depth += 1,
                        CaptureEntry::Close { .. } => {
                            depth -= 1;
                            if depth == 0 {
                                return Ok(j + 1);
                            }
                        }
                        _ => {}
                    }
                }
                Err(PegError::MalformedCaptures)
            }
            Some(CaptureEntry::Close { .. }) | None => Err(PegError::MalformedCaptures),
            Some(_) => Ok(i + 1),
        }
    }

    /// Index of the open matching the close at `i`
    fn open_of(&self, i: usize) -> Result<usize, PegError> {
        find_open(&self.entries[..i]).ok_or(PegError::MalformedCaptures)
    }

    /// Subject position where the capture starting at `i` ends
    fn end_of(&self, i: usize) -> Result<usize, PegError> {
        match &self.entries[i] {
            CaptureEntry::Full { pos, len, .. } => Ok(pos + len),
            CaptureEntry::Dynamic { end, .. } => Ok(*end),
            CaptureEntry::Open { .. } => {
                let after = self.skip(i)?;
                Ok(self.entries[after - 1].start())
            }
            CaptureEntry::Close { .. } => Err(PegError::MalformedCaptures),
        }
    }

    /// Push the values nested in the current capture. The matched text is
    /// pushed last if `whole` is set or there are no nested values.
    fn nested_values(&mut self, out: &mut Vec<Value>, whole: bool) -> Result<usize, PegError> {
        let entry = self.entry()?;
        self.cur += 1;

        match entry {
            CaptureEntry::Full { pos, len, .. } => {
                out.push(self.text(*pos, pos + len)?);
                Ok(1)
            }
            CaptureEntry::Open { pos, .. } => {
                let mut n = 0;
                while !self.at_close()? {
                    n += self.push_capture(out)?;
                }

                let end = self.close_pos()?;
                self.cur += 1;

                if whole || n == 0 {
                    out.push(self.text(*pos, end)?);
                    n += 1;
                }
                Ok(n)
            }
            _ => Err(PegError::MalformedCaptures),
        }
    }

    /// Push the values of the current capture and move past it
    fn push_capture(&mut self, out: &mut Vec<Value>) -> Result<usize, PegError> {
        let entry = self.entry()?;
        let (kind, idx, pos) = match entry {
            CaptureEntry::Open { kind, idx, pos } | CaptureEntry::Full { kind, idx, pos, .. } => {
                (*kind, *idx, *pos)
            }
            CaptureEntry::Dynamic { values, .. } => {
                self.cur += 1;
                out.extend(values.iter().cloned());
                return Ok(values.len());
            }
            CaptureEntry::Close { .. } => return Err(PegError::MalformedCaptures),
        };

        match kind {
            CaptureKind::Position => {
                self.cur += 1;
                out.push(Value::Int(pos as i64));
                Ok(1)
            }
            CaptureKind::Const => {
                self.cur += 1;
                match self.kvalue(idx)? {
                    KValue::Value(value) => out.push(value.clone()),
                    _ => return Err(PegError::MalformedCaptures),
                }
                Ok(1)
            }
            CaptureKind::Arg => {
                self.cur += 1;
                let value = idx
                    .checked_sub(1)
                    .and_then(|i| self.args.get(i))
                    .ok_or(PegError::MissingArgument(idx))?;
                out.push(value.clone());
                Ok(1)
            }
            CaptureKind::Backref => self.backref(idx, out),
            CaptureKind::Simple => {
                let first = out.len();
                let n = self.nested_values(out, true)?;
                // Matched text goes first
                out[first..].rotate_right(1);
                Ok(n)
            }
            CaptureKind::Table => {
                let mut items = vec![];
                self.cur += 1;
                if matches!(entry, CaptureEntry::Open { .. }) {
                    while !self.at_close()? {
                        self.push_capture(&mut items)?;
                    }
                    self.cur += 1;
                }
                out.push(Value::List(items));
                Ok(1)
            }
            CaptureKind::Group => {
                if idx == 0 {
                    self.nested_values(out, false)
                } else {
                    // Named groups only produce values through back references
                    self.cur = self.skip(self.cur)?;
                    Ok(0)
                }
            }
            CaptureKind::Function => {
                let KValue::Function(f) = self.kvalue(idx)? else {
                    return Err(PegError::MalformedCaptures);
                };
                let mut args = vec![];
                self.nested_values(&mut args, false)?;
                let values = f(args);
                let n = values.len();
                out.extend(values);
                Ok(n)
            }
            CaptureKind::Query => {
                let KValue::Query(table) = self.kvalue(idx)? else {
                    return Err(PegError::MalformedCaptures);
                };
                let mut keys = vec![];
                self.nested_values(&mut keys, false)?;
                match keys
                    .first()
                    .and_then(Value::to_text)
                    .and_then(|key| table.get(&key))
                {
                    Some(value) => {
                        out.push(value.clone());
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            CaptureKind::String => {
                let mut buf = vec![];
                self.string_capture(&mut buf)?;
                out.push(Value::Str(buf.into()));
                Ok(1)
            }
            CaptureKind::Subst => {
                let mut buf = vec![];
                self.substitution(&mut buf)?;
                out.push(Value::Str(buf.into()));
                Ok(1)
            }
            CaptureKind::Fold => self.fold(idx, out),
            CaptureKind::Runtime | CaptureKind::Close => {
                self.cur = self.skip(self.cur)?;
                Ok(0)
            }
        }
    }

    fn backref(&mut self, idx: usize, out: &mut Vec<Value>) -> Result<usize, PegError> {
        let KValue::Name(name) = self.kvalue(idx)? else {
            return Err(PegError::MalformedCaptures);
        };

        let group = self.find_group(name)?;
        let at = self.cur;
        self.cur = group;
        let n = self.nested_values(out, false)?;
        self.cur = at + 1;
        Ok(n)
    }

    fn is_group(&self, i: usize, name: &str) -> bool {
        match &self.entries[i] {
            CaptureEntry::Open {
                kind: CaptureKind::Group,
                idx,
                ..
            }
            | CaptureEntry::Full {
                kind: CaptureKind::Group,
                idx,
                ..
            } => matches!(self.program.kvalue(*idx), Some(KValue::Name(n)) if n == name),
            _ => false,
        }
    }

    /// Most recent closed group named `name` before the current capture.
    /// Captures that enclose the current one are not closed yet and are
    /// skipped, as are the captures nested in earlier ones.
    fn find_group(&self, name: &str) -> Result<usize, PegError> {
        let mut i = self.cur;
        while i > 0 {
            i -= 1;
            match &self.entries[i] {
                CaptureEntry::Close { .. } => {
                    i = self.open_of(i)?;
                }
                CaptureEntry::Open { .. } => continue,
                _ => {}
            }

            if self.is_group(i, name) {
                return Ok(i);
            }
        }

        Err(PegError::BackReference(name.to_string()))
    }

    fn fold(&mut self, idx: usize, out: &mut Vec<Value>) -> Result<usize, PegError> {
        let KValue::Fold(f) = self.kvalue(idx)? else {
            return Err(PegError::MalformedCaptures);
        };

        let entry = self.entry()?;
        self.cur += 1;
        if matches!(entry, CaptureEntry::Full { .. }) || self.at_close()? {
            return Err(PegError::EmptyFold);
        }

        let mut first = vec![];
        self.push_capture(&mut first)?;
        let mut acc = first.into_iter().next().ok_or(PegError::EmptyFold)?;

        while !self.at_close()? {
            let mut values = vec![];
            self.push_capture(&mut values)?;
            acc = f(acc, &values);
        }
        self.cur += 1;

        out.push(acc);
        Ok(1)
    }

    fn substitution(&mut self, buf: &mut Vec<u8>) -> Result<(), PegError> {
        let entry = self.entry()?;
        self.cur += 1;

        match entry {
            CaptureEntry::Full { pos, len, .. } => {
                buf.extend_from_slice(self.slice(*pos, pos + len)?);
                Ok(())
            }
            CaptureEntry::Open { pos, .. } => {
                let mut curr = *pos;
                while !self.at_close()? {
                    let next = self.entry()?.start();
                    let end = self.end_of(self.cur)?;
                    buf.extend_from_slice(self.slice(curr, next)?);
                    // Captures without a value keep their original text
                    curr = if self.add_one_string(buf)? { end } else { next };
                }

                let end = self.close_pos()?;
                self.cur += 1;
                buf.extend_from_slice(self.slice(curr, end)?);
                Ok(())
            }
            _ => Err(PegError::MalformedCaptures),
        }
    }

    /// Append the first value of the current capture as text
    fn add_one_string(&mut self, buf: &mut Vec<u8>) -> Result<bool, PegError> {
        match self.entry()?.kind() {
            Some(CaptureKind::String) => {
                self.string_capture(buf)?;
                Ok(true)
            }
            Some(CaptureKind::Subst) => {
                self.substitution(buf)?;
                Ok(true)
            }
            _ => {
                let mut values = vec![];
                self.push_capture(&mut values)?;
                match values.first() {
                    Some(value) => {
                        let text = value.to_text().ok_or(PegError::InvalidReplacement)?;
                        buf.extend_from_slice(&text);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    fn string_capture(&mut self, buf: &mut Vec<u8>) -> Result<(), PegError> {
        let idx = match self.entry()? {
            CaptureEntry::Open { idx, .. } | CaptureEntry::Full { idx, .. } => *idx,
            _ => return Err(PegError::MalformedCaptures),
        };
        let KValue::Template(fmt) = self.kvalue(idx)? else {
            return Err(PegError::MalformedCaptures);
        };

        let mut items = vec![];
        self.string_items(&mut items)?;
        let after = self.cur;

        let mut bytes = fmt.iter();
        while let Some(c) = bytes.next() {
            if *c != b'%' {
                buf.push(*c);
                continue;
            }

            match bytes.next() {
                Some(d) if d.is_ascii_digit() => {
                    let l = (d - b'0') as usize;
                    match items.get(l) {
                        Some(StrItem::Text(start, end)) => {
                            buf.extend_from_slice(self.slice(*start, *end)?)
                        }
                        Some(StrItem::Capture(i)) => {
                            self.cur = *i;
                            if !self.add_one_string(buf)? {
                                return Err(PegError::NoCaptureValue(l));
                            }
                        }
                        None => return Err(PegError::CaptureIndex(l)),
                    }
                }
                Some(other) => buf.push(*other),
                None => buf.push(b'%'),
            }
        }

        self.cur = after;
        Ok(())
    }

    /// Collect the pieces `%n` refers to, the whole match first. Simple
    /// captures contribute their text and their nested pieces.
    fn string_items(&mut self, items: &mut Vec<StrItem>) -> Result<(), PegError> {
        let entry = self.entry()?;
        let start = entry.start();
        let k = items.len();
        items.push(StrItem::Text(start, start));
        self.cur += 1;

        let end = match entry {
            CaptureEntry::Full { pos, len, .. } => pos + len,
            CaptureEntry::Open { .. } => {
                while !self.at_close()? {
                    if items.len() >= MAX_STR_CAPS {
                        self.cur = self.skip(self.cur)?;
                    } else if self.entry()?.kind() == Some(CaptureKind::Simple) {
                        self.string_items(items)?;
                    } else {
                        items.push(StrItem::Capture(self.cur));
                        self.cur = self.skip(self.cur)?;
                    }
                }

                let end = self.close_pos()?;
                self.cur += 1;
                end
            }
            _ => return Err(PegError::MalformedCaptures),
        };

        items[k] = StrItem::Text(start, end);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rustc_hash::FxHashMap;

    use crate::{Pattern, PegError, Value};

    fn captures(p: &Pattern, subject: &str) -> Vec<Value> {
        p.matches(subject)
            .unwrap()
            .expect("pattern should match")
            .into_captures()
    }

    fn strs(items: &[&str]) -> Vec<Value> {
        items.iter().map(|s| Value::from(*s)).collect()
    }

    #[test]
    fn simple_nested() {
        let p = (Pattern::any(1) + Pattern::any(2).capture()).capture();
        assert_eq!(captures(&p, "abc"), strs(&["abc", "bc"]));
    }

    #[test]
    fn positions() {
        let p = Pattern::any(3) + Pattern::position() + Pattern::any(2) + Pattern::position();
        assert_eq!(captures(&p, "abcdef"), vec![Value::Int(3), Value::Int(5)]);
    }

    #[test]
    fn constants() {
        let p = Pattern::constant([Value::from("x"), Value::Int(1)]) + "a";
        assert_eq!(captures(&p, "a"), vec![Value::from("x"), Value::Int(1)]);
    }

    #[test]
    fn table() {
        let letter = Pattern::range("az").unwrap();
        let p = letter.capture().rep(1).table();
        assert_eq!(
            captures(&p, "alo"),
            vec![Value::List(strs(&["a", "l", "o"]))]
        );
        assert_eq!(
            captures(&Pattern::any(1).table(), "x"),
            vec![Value::List(vec![])]
        );
    }

    #[test]
    fn substitution() {
        let p = Pattern::any(1) + (Pattern::position() + Pattern::any(2)).subst();
        assert_eq!(captures(&p, "abc"), strs(&["1bc"]));
        assert_eq!(captures(&p.capture(), "abc"), strs(&["abc", "1bc"]));

        let vowel = Pattern::set("aeiou").capture().map(|v| {
            v.into_iter()
                .map(|s| Value::str(s.as_bytes().unwrap_or_default().to_ascii_uppercase()))
                .collect()
        });
        let p = (vowel | Pattern::any(1)).rep(0).subst();
        assert_eq!(captures(&p, "hello world"), strs(&["hEllO wOrld"]));
    }

    #[test]
    fn query() {
        let mut table = FxHashMap::default();
        table.insert("cat".into(), Value::from("dog"));
        let word = Pattern::range("az").unwrap().rep(1);
        let p = (word.query(table) | Pattern::any(1)).rep(0).subst();
        assert_eq!(captures(&p, "cat, cow"), strs(&["dog, cow"]));
    }

    #[test]
    fn template() {
        let digit = Pattern::range("09").unwrap();
        let p = (digit.rep(1).capture() + "-" + digit.rep(1).capture()).template("%2..%1%%");
        assert_eq!(captures(&p, "12-34"), strs(&["34..12%"]));

        let p = Pattern::any(2).template("<%0>");
        assert_eq!(captures(&p, "ab"), strs(&["<ab>"]));

        let p = Pattern::any(1).template("%3");
        assert_eq!(p.matches("a").err(), Some(PegError::CaptureIndex(3)));
    }

    #[test]
    fn groups_and_backrefs() {
        let p = (Pattern::any(1).capture() + Pattern::any(1).capture()).group();
        assert_eq!(captures(&p, "ab"), strs(&["a", "b"]));

        let p = Pattern::any(1).capture().named("k") + Pattern::backref("k");
        assert_eq!(captures(&p, "ab"), strs(&["a"]));

        let p = Pattern::any(2).named("k") + Pattern::backref("k") + Pattern::backref("k");
        assert_eq!(captures(&p, "ab"), strs(&["ab", "ab"]));

        let p = Pattern::backref("missing") + "a";
        assert_eq!(
            p.matches("a").err(),
            Some(PegError::BackReference("missing".into()))
        );
    }

    #[test]
    fn backref_latest_group() {
        let name = Pattern::range("az").unwrap().rep(1).capture();
        let p = name.named("k") + " " + name.named("k") + Pattern::backref("k");
        assert_eq!(captures(&p, "ab cd"), strs(&["cd"]));
    }

    #[test]
    fn fold() {
        let digits = Pattern::range("09").unwrap().rep(1);
        let number = digits.capture().map(|v| {
            v.into_iter()
                .map(|s| {
                    let text = s.as_bytes().and_then(|b| std::str::from_utf8(b).ok());
                    Value::Int(text.and_then(|t| t.parse().ok()).unwrap_or(0))
                })
                .collect()
        });
        let sum = (number.clone() + (Pattern::literal("+") + number).rep(0)).fold(|acc, v| {
            Value::Int(acc.as_int().unwrap_or(0) + v[0].as_int().unwrap_or(0))
        });
        assert_eq!(captures(&sum, "1+20+300"), vec![Value::Int(321)]);

        let empty = Pattern::any(1).fold(|acc, _| acc);
        assert_eq!(empty.matches("a").err(), Some(PegError::EmptyFold));
    }

    #[test]
    fn arguments() {
        let p = Pattern::arg(1).unwrap() + Pattern::arg(3).unwrap() + Pattern::arg(2).unwrap();
        let machine = crate::ParsingMachine::new(&p).unwrap();
        let args = [Value::Int(1), Value::from("hi"), Value::Nil];
        let m = machine.parse_at("", 0, &args).unwrap().unwrap();
        assert_eq!(m.captures(), &[Value::Int(1), Value::Nil, Value::from("hi")]);

        assert_eq!(
            machine.parse_at("", 0, &args[..1]).err(),
            Some(PegError::MissingArgument(3))
        );
    }
}
