//! Parser for C-preprocessed devicetree source
//!
//! Consumes the dialect the preprocessor hands us: cpp linemarkers, root
//! blocks, `&label { ... }` extension blocks, delete directives, and cell
//! lists whose expanded macros leave parenthesized C constant expressions
//! behind. Repeated definitions merge into one tree; phandle references
//! resolve after the whole source is read.

use crate::dts::model::{Cell, Devicetree, NodeId, Piece, RefTarget};
use crate::error::{DtsParseError, Position};

/// Parse preprocessed DTS into a merged, reference-resolved tree
pub fn parse_dts(source: &str) -> Result<Devicetree, DtsParseError> {
    let mut parser = Parser {
        cur: Cursor::new(source),
        dt: Devicetree::new(),
    };
    parser.parse_file()?;
    let mut dt = parser.dt;
    dt.resolve_refs()?;
    Ok(dt)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn position(&self) -> Position {
        Position {
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(byte)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.bytes[self.pos..].starts_with(s.as_bytes())
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.starts_with(s) {
            for _ in 0..s.len() {
                self.bump();
            }
            true
        } else {
            false
        }
    }

    fn skip_to_eol(&mut self) {
        while let Some(byte) = self.peek() {
            if byte == b'\n' {
                break;
            }
            self.bump();
        }
    }

    /// A `#` at the start of a line introduces a cpp linemarker when a line
    /// number (or `line`) follows; `#gpio-cells` and friends never do
    fn at_linemarker(&self) -> bool {
        if self.col != 1 || self.peek() != Some(b'#') {
            return false;
        }
        let rest = &self.bytes[self.pos + 1..];
        if rest.starts_with(b"line") {
            return true;
        }
        let digits_at = rest.iter().take_while(|&&b| b == b' ').count();
        matches!(rest.get(digits_at), Some(b'0'..=b'9'))
    }

    fn skip_ws(&mut self) -> Result<(), DtsParseError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.starts_with("//") => self.skip_to_eol(),
                Some(b'/') if self.starts_with("/*") => {
                    let start = self.position();
                    self.bump();
                    self.bump();
                    loop {
                        if self.eat("*/") {
                            break;
                        }
                        if self.bump().is_none() {
                            return Err(DtsParseError::UnexpectedEof(start));
                        }
                    }
                }
                Some(b'#') if self.at_linemarker() => self.skip_to_eol(),
                _ => return Ok(()),
            }
        }
    }

    fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), DtsParseError> {
        let pos = self.position();
        match self.peek() {
            Some(found) if found == byte => {
                self.bump();
                Ok(())
            }
            Some(found) => Err(DtsParseError::Expected {
                pos,
                expected,
                found: found as char,
            }),
            None => Err(DtsParseError::UnexpectedEof(pos)),
        }
    }

    /// Longest run of node/property name characters
    fn take_name(&mut self) -> String {
        let mut out = String::new();
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric()
                || matches!(byte, b',' | b'.' | b'_' | b'+' | b'?' | b'#' | b'-')
            {
                out.push(byte as char);
                self.bump();
            } else {
                break;
            }
        }
        out
    }
}

struct Parser<'a> {
    cur: Cursor<'a>,
    dt: Devicetree,
}

impl Parser<'_> {
    fn parse_file(&mut self) -> Result<(), DtsParseError> {
        loop {
            self.cur.skip_ws()?;
            let pos = self.cur.position();
            let Some(byte) = self.cur.peek() else {
                return Ok(());
            };
            match byte {
                b'/' => {
                    if self.cur.eat("/dts-v1/") || self.cur.eat("/plugin/") {
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                    } else if self.cur.eat("/memreserve/") {
                        self.cur.skip_ws()?;
                        let address = self.parse_int()? as u64;
                        self.cur.skip_ws()?;
                        let size = self.parse_int()? as u64;
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                        self.dt.add_memreserve(address, size);
                    } else if self.cur.eat("/delete-node/") {
                        self.cur.skip_ws()?;
                        self.cur.expect(b'&', "'&'")?;
                        let target = self.parse_ref_target()?;
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                        let id = self.dt.resolve_target(&target)?;
                        self.dt.detach(id);
                    } else if self.cur.peek_at(1).is_some_and(|b| b.is_ascii_alphabetic()) {
                        let construct = self.directive_word();
                        return Err(DtsParseError::Unsupported { pos, construct });
                    } else {
                        // root block
                        self.cur.bump();
                        self.cur.skip_ws()?;
                        self.cur.expect(b'{', "'{'")?;
                        let root = self.dt.root();
                        self.parse_body(root)?;
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                    }
                }
                b'&' => {
                    self.cur.bump();
                    let target = self.parse_ref_target()?;
                    let id = self.dt.resolve_target(&target)?;
                    self.cur.skip_ws()?;
                    self.cur.expect(b'{', "'{'")?;
                    self.parse_body(id)?;
                    self.cur.skip_ws()?;
                    self.cur.expect(b';', "';'")?;
                }
                found => {
                    return Err(DtsParseError::Expected {
                        pos,
                        expected: "a root block, extension block, or directive",
                        found: found as char,
                    })
                }
            }
        }
    }

    /// Collect a `/word/` directive for diagnostics
    fn directive_word(&mut self) -> String {
        let mut word = String::from("/");
        self.cur.bump();
        while let Some(byte) = self.cur.peek() {
            if byte.is_ascii_alphabetic() || byte == b'-' {
                word.push(byte as char);
                self.cur.bump();
            } else {
                break;
            }
        }
        if self.cur.peek() == Some(b'/') {
            word.push('/');
            self.cur.bump();
        }
        word
    }

    fn parse_ref_target(&mut self) -> Result<RefTarget, DtsParseError> {
        let pos = self.cur.position();
        if self.cur.peek() == Some(b'{') {
            self.cur.bump();
            let mut path = String::new();
            loop {
                match self.cur.bump() {
                    Some(b'}') => break,
                    Some(byte) => path.push(byte as char),
                    None => return Err(DtsParseError::UnexpectedEof(pos)),
                }
            }
            Ok(RefTarget::Path(path.trim().to_owned()))
        } else {
            let label = self.cur.take_name();
            if label.is_empty() {
                return Err(DtsParseError::Expected {
                    pos,
                    expected: "a label",
                    found: self.cur.peek().map_or('\0', |b| b as char),
                });
            }
            Ok(RefTarget::Label(label))
        }
    }

    /// Body of a node; the opening `{` is already consumed
    fn parse_body(&mut self, node: NodeId) -> Result<(), DtsParseError> {
        loop {
            self.cur.skip_ws()?;
            let pos = self.cur.position();
            match self.cur.peek() {
                None => return Err(DtsParseError::UnexpectedEof(pos)),
                Some(b'}') => {
                    self.cur.bump();
                    return Ok(());
                }
                Some(b'/') => {
                    if self.cur.eat("/delete-property/") {
                        self.cur.skip_ws()?;
                        let name = self.cur.take_name();
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                        self.dt.delete_prop(node, &name);
                    } else if self.cur.eat("/delete-node/") {
                        self.cur.skip_ws()?;
                        if self.cur.peek() == Some(b'&') {
                            self.cur.bump();
                            let target = self.parse_ref_target()?;
                            let id = self.dt.resolve_target(&target)?;
                            self.dt.detach(id);
                        } else {
                            let name = self.node_name();
                            self.dt.delete_child(node, &name);
                        }
                        self.cur.skip_ws()?;
                        self.cur.expect(b';', "';'")?;
                    } else {
                        let construct = self.directive_word();
                        return Err(DtsParseError::Unsupported { pos, construct });
                    }
                }
                Some(_) => self.parse_member(node)?,
            }
        }
    }

    /// Node name including the optional `@<unit-addr>` suffix
    fn node_name(&mut self) -> String {
        let name = self.cur.take_name();
        if self.cur.peek() == Some(b'@') {
            self.cur.bump();
            format!("{name}@{}", self.cur.take_name())
        } else {
            name
        }
    }

    /// One labeled child node or one property
    fn parse_member(&mut self, node: NodeId) -> Result<(), DtsParseError> {
        let mut labels = Vec::new();
        loop {
            let pos = self.cur.position();
            let name = self.cur.take_name();
            if name.is_empty() {
                return Err(DtsParseError::Expected {
                    pos,
                    expected: "a node or property name",
                    found: self.cur.peek().map_or('\0', |b| b as char),
                });
            }

            if self.cur.peek() == Some(b'@') {
                self.cur.bump();
                let full = format!("{name}@{}", self.cur.take_name());
                return self.parse_child(node, &full, labels);
            }

            self.cur.skip_ws()?;
            let pos = self.cur.position();
            match self.cur.peek() {
                Some(b':') => {
                    self.cur.bump();
                    self.cur.skip_ws()?;
                    labels.push(name);
                }
                Some(b'{') => return self.parse_child(node, &name, labels),
                Some(b'=') if labels.is_empty() => {
                    self.cur.bump();
                    let pieces = self.parse_value()?;
                    self.cur.skip_ws()?;
                    self.cur.expect(b';', "';'")?;
                    self.dt.set_prop(node, name, pieces);
                    return Ok(());
                }
                Some(b';') if labels.is_empty() => {
                    self.cur.bump();
                    self.dt.set_prop(node, name, Vec::new());
                    return Ok(());
                }
                Some(found) => {
                    return Err(DtsParseError::Expected {
                        pos,
                        expected: "':', '{', '=' or ';'",
                        found: found as char,
                    })
                }
                None => return Err(DtsParseError::UnexpectedEof(pos)),
            }
        }
    }

    fn parse_child(
        &mut self,
        parent: NodeId,
        name: &str,
        labels: Vec<String>,
    ) -> Result<(), DtsParseError> {
        self.cur.skip_ws()?;
        self.cur.expect(b'{', "'{'")?;
        let child = self.dt.add_child(parent, name);
        for label in labels {
            self.dt.add_label(child, label);
        }
        self.parse_body(child)?;
        self.cur.skip_ws()?;
        self.cur.expect(b';', "';'")?;
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Vec<Piece>, DtsParseError> {
        let mut pieces = Vec::new();
        loop {
            self.cur.skip_ws()?;
            let pos = self.cur.position();
            match self.cur.peek() {
                Some(b'<') => {
                    self.cur.bump();
                    pieces.push(Piece::Cells(self.parse_cells()?));
                }
                Some(b'"') => pieces.push(Piece::Str(self.parse_string()?)),
                Some(b'[') => {
                    self.cur.bump();
                    pieces.push(Piece::Bytes(self.parse_bytes()?));
                }
                Some(b'&') => {
                    self.cur.bump();
                    pieces.push(Piece::Ref(self.parse_ref_target()?));
                }
                Some(b'/') => {
                    let construct = self.directive_word();
                    return Err(DtsParseError::Unsupported { pos, construct });
                }
                Some(found) => {
                    return Err(DtsParseError::Expected {
                        pos,
                        expected: "a property value",
                        found: found as char,
                    })
                }
                None => return Err(DtsParseError::UnexpectedEof(pos)),
            }
            self.cur.skip_ws()?;
            if self.cur.peek() == Some(b',') {
                self.cur.bump();
                continue;
            }
            return Ok(pieces);
        }
    }

    /// Cell list; the opening `<` is already consumed
    fn parse_cells(&mut self) -> Result<Vec<Cell>, DtsParseError> {
        let mut cells = Vec::new();
        loop {
            self.cur.skip_ws()?;
            let pos = self.cur.position();
            match self.cur.peek() {
                Some(b'>') => {
                    self.cur.bump();
                    return Ok(cells);
                }
                Some(b'&') => {
                    self.cur.bump();
                    cells.push(Cell::Ref(self.parse_ref_target()?));
                }
                Some(b'(') => {
                    self.cur.bump();
                    let value = self.parse_expr()?;
                    self.cur.skip_ws()?;
                    self.cur.expect(b')', "')'")?;
                    cells.push(Cell::Num(value as u32));
                }
                Some(b'0'..=b'9' | b'\'') => cells.push(Cell::Num(self.parse_int()? as u32)),
                Some(found) => {
                    return Err(DtsParseError::Expected {
                        pos,
                        expected: "a cell",
                        found: found as char,
                    })
                }
                None => return Err(DtsParseError::UnexpectedEof(pos)),
            }
        }
    }

    /// Integer or character literal in C syntax, `U`/`L` suffixes ignored
    fn parse_int(&mut self) -> Result<i64, DtsParseError> {
        let pos = self.cur.position();
        if self.cur.peek() == Some(b'\'') {
            return self.parse_char_literal();
        }
        let mut literal = String::new();
        while let Some(byte) = self.cur.peek() {
            if byte.is_ascii_alphanumeric() {
                literal.push(byte as char);
                self.cur.bump();
            } else {
                break;
            }
        }
        let digits = literal.trim_end_matches(['u', 'U', 'l', 'L']);
        let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16)
        } else if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8)
        } else {
            digits.parse::<u64>()
        };
        parsed
            .map(|value| value as i64)
            .map_err(|_| DtsParseError::InvalidInt { pos, literal })
    }

    fn parse_char_literal(&mut self) -> Result<i64, DtsParseError> {
        let pos = self.cur.position();
        self.cur.expect(b'\'', "'''")?;
        let value = match self.cur.bump() {
            None => return Err(DtsParseError::UnexpectedEof(pos)),
            Some(b'\\') => match self.cur.bump() {
                None => return Err(DtsParseError::UnexpectedEof(pos)),
                Some(b'n') => b'\n',
                Some(b't') => b'\t',
                Some(b'r') => b'\r',
                Some(b'0') => 0,
                Some(other) => other,
            },
            Some(byte) => byte,
        };
        self.cur.expect(b'\'', "'''")?;
        Ok(i64::from(value))
    }

    // C constant expressions, as left behind by expanded dt-bindings macros

    fn parse_expr(&mut self) -> Result<i64, DtsParseError> {
        let cond = self.parse_binary(0)?;
        self.cur.skip_ws()?;
        if self.cur.peek() == Some(b'?') {
            self.cur.bump();
            let then = self.parse_expr()?;
            self.cur.skip_ws()?;
            self.cur.expect(b':', "':'")?;
            let otherwise = self.parse_expr()?;
            Ok(if cond != 0 { then } else { otherwise })
        } else {
            Ok(cond)
        }
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<i64, DtsParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.cur.skip_ws()?;
            let Some((op, prec)) = self.peek_binary_op() else {
                return Ok(lhs);
            };
            if prec < min_prec {
                return Ok(lhs);
            }
            let pos = self.cur.position();
            for _ in 0..op.len() {
                self.cur.bump();
            }
            let rhs = self.parse_binary(prec + 1)?;
            lhs = apply_op(op, lhs, rhs, pos)?;
        }
    }

    fn peek_binary_op(&self) -> Option<(&'static str, u8)> {
        // Longest operator first within each leading character
        const OPS: &[(&str, u8)] = &[
            ("||", 1),
            ("&&", 2),
            ("==", 6),
            ("!=", 6),
            ("<<", 8),
            (">>", 8),
            ("<=", 7),
            (">=", 7),
            ("<", 7),
            (">", 7),
            ("|", 3),
            ("^", 4),
            ("&", 5),
            ("+", 9),
            ("-", 9),
            ("*", 10),
            ("/", 10),
            ("%", 10),
        ];
        OPS.iter()
            .find(|&&(op, _)| self.cur.starts_with(op))
            .copied()
    }

    fn parse_unary(&mut self) -> Result<i64, DtsParseError> {
        self.cur.skip_ws()?;
        let pos = self.cur.position();
        match self.cur.peek() {
            Some(b'-') => {
                self.cur.bump();
                Ok(self.parse_unary()?.wrapping_neg())
            }
            Some(b'~') => {
                self.cur.bump();
                Ok(!self.parse_unary()?)
            }
            Some(b'!') => {
                self.cur.bump();
                Ok(i64::from(self.parse_unary()? == 0))
            }
            Some(b'(') => {
                self.cur.bump();
                let value = self.parse_expr()?;
                self.cur.skip_ws()?;
                self.cur.expect(b')', "')'")?;
                Ok(value)
            }
            Some(b'0'..=b'9' | b'\'') => self.parse_int(),
            Some(found) => Err(DtsParseError::Expected {
                pos,
                expected: "an expression",
                found: found as char,
            }),
            None => Err(DtsParseError::UnexpectedEof(pos)),
        }
    }

    fn parse_string(&mut self) -> Result<String, DtsParseError> {
        let start = self.cur.position();
        self.cur.expect(b'"', "'\"'")?;
        let mut out = String::new();
        loop {
            match self.cur.bump() {
                None => return Err(DtsParseError::UnexpectedEof(start)),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.cur.bump() {
                    None => return Err(DtsParseError::UnexpectedEof(start)),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'0') => out.push('\0'),
                    Some(other) => out.push(other as char),
                },
                Some(byte) => out.push(byte as char),
            }
        }
    }

    /// Byte string; the opening `[` is already consumed
    fn parse_bytes(&mut self) -> Result<Vec<u8>, DtsParseError> {
        let pos = self.cur.position();
        let mut digits = String::new();
        loop {
            self.cur.skip_ws()?;
            match self.cur.peek() {
                Some(b']') => {
                    self.cur.bump();
                    break;
                }
                Some(byte) if byte.is_ascii_hexdigit() => {
                    digits.push(byte as char);
                    self.cur.bump();
                }
                Some(found) => {
                    return Err(DtsParseError::Expected {
                        pos: self.cur.position(),
                        expected: "a hex digit",
                        found: found as char,
                    })
                }
                None => return Err(DtsParseError::UnexpectedEof(pos)),
            }
        }
        if digits.len() % 2 != 0 {
            return Err(DtsParseError::InvalidInt {
                pos,
                literal: digits,
            });
        }
        Ok(digits
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                u8::from_str_radix(std::str::from_utf8(pair).expect("hex digits are ascii"), 16)
                    .expect("checked hex digits")
            })
            .collect())
    }
}

fn apply_op(op: &str, lhs: i64, rhs: i64, pos: Position) -> Result<i64, DtsParseError> {
    Ok(match op {
        "||" => i64::from(lhs != 0 || rhs != 0),
        "&&" => i64::from(lhs != 0 && rhs != 0),
        "|" => lhs | rhs,
        "^" => lhs ^ rhs,
        "&" => lhs & rhs,
        "==" => i64::from(lhs == rhs),
        "!=" => i64::from(lhs != rhs),
        "<" => i64::from(lhs < rhs),
        ">" => i64::from(lhs > rhs),
        "<=" => i64::from(lhs <= rhs),
        ">=" => i64::from(lhs >= rhs),
        "<<" => lhs.wrapping_shl(rhs as u32),
        ">>" => lhs.wrapping_shr(rhs as u32),
        "+" => lhs.wrapping_add(rhs),
        "-" => lhs.wrapping_sub(rhs),
        "*" => lhs.wrapping_mul(rhs),
        "/" if rhs == 0 => return Err(DtsParseError::DivisionByZero(pos)),
        "/" => lhs.wrapping_div(rhs),
        "%" if rhs == 0 => return Err(DtsParseError::DivisionByZero(pos)),
        "%" => lhs.wrapping_rem(rhs),
        _ => unreachable!("operator list and evaluator agree"),
    })
}
