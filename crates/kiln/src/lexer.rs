//! Source bytes -> token stream.
//!
//! Outer state machine: `Raw -> TagMark -> TagName -> ParamsOpen ->
//! ParamScan -> (nested) -> ParamsClose -> BlockMark -> Raw`. A backslash
//! immediately before the tag mark escapes it into the raw stream; a tag
//! mark not followed by a valid identifier or `(` decays back into the raw
//! stream rather than erroring.

use crate::error::{ParseError, SourceLoc};
use crate::operator::Operator;
use crate::token::{Literal, ParamToken, Token, TokenKind};
use crate::variable::{Keyword, Variable};

/// Scans `src` (from template `name`) into a token stream, using
/// `tag_indicator` as the tag-open character (`#` unless reconfigured
/// before the engine started).
pub fn lex(src: &str, name: &str, tag_indicator: char) -> Result<Vec<Token>, ParseError> {
    Lexer::new(src, name, tag_indicator).run()
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    name: &'a str,
    tag_indicator: char,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, name: &'a str, tag_indicator: char) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            name,
            tag_indicator,
            tokens: Vec::new(),
        }
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.name, self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(message, self.loc())
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        let mut raw = String::new();
        let mut raw_loc = self.loc();
        loop {
            let Some(c) = self.peek() else { break };
            if c == '\\' && self.peek_at(1) == Some(self.tag_indicator) {
                // Escaped tag mark: consume the backslash, keep the indicator literal.
                self.advance();
                raw.push(self.advance().expect("checked by peek_at"));
                continue;
            }
            if c == self.tag_indicator {
                let save = (self.pos, self.line, self.column);
                self.advance();
                if self.try_tag_open(&mut raw, &raw_loc)? {
                    raw_loc = self.loc();
                    continue;
                }
                // Not a valid tag: restore position, decay into raw text.
                self.pos = save.0;
                self.line = save.1;
                self.column = save.2;
                raw.push(self.advance().expect("tag indicator present"));
                continue;
            }
            raw.push(self.advance().expect("checked by peek"));
        }
        if !raw.is_empty() {
            self.tokens.push(Token::new(TokenKind::Raw(raw), raw_loc));
        }
        Ok(self.tokens)
    }

    /// Attempts to parse a tag starting right after the indicator was
    /// consumed. Returns `Ok(true)` if a tag was recognized and fully
    /// lexed (pushing its tokens, including trailing `:` if present).
    /// Returns `Ok(false)` if this was not a valid tag opener at all.
    fn try_tag_open(&mut self, raw: &mut String, raw_loc: &SourceLoc) -> Result<bool, ParseError> {
        let tag_loc = self.loc();
        let anonymous = self.peek() == Some('(');
        let name = if anonymous {
            None
        } else if self.peek().is_some_and(is_ident_start) {
            Some(self.scan_ident())
        } else {
            return Ok(false);
        };

        if anonymous && self.peek() != Some('(') {
            return Ok(false);
        }

        if !raw.is_empty() {
            self.tokens.push(Token::new(TokenKind::Raw(std::mem::take(raw)), raw_loc.clone()));
        }
        self.tokens.push(Token::new(TokenKind::TagStart, tag_loc.clone()));
        self.tokens.push(Token::new(TokenKind::TagName(name), tag_loc));

        // Named tags may omit a parameter list entirely -- closers
        // (`#endif`) and some chain links (`#else:`) carry none.
        if self.peek() == Some('(') {
            self.scan_params()?;
        }

        self.skip_inline_whitespace();
        if self.peek() == Some(':') {
            let loc = self.loc();
            self.advance();
            self.tokens.push(Token::new(TokenKind::BlockStart, loc));
        }
        Ok(true)
    }

    fn scan_params(&mut self) -> Result<(), ParseError> {
        let loc = self.loc();
        self.advance(); // consume '('
        self.tokens.push(Token::new(TokenKind::ParamsStart, loc));

        let mut depth = 1usize;
        let mut pending_space = false;
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated parameter list"));
            };
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                    pending_space = true;
                }
                '(' => {
                    depth += 1;
                    let tok = self.single(TokenKind::ParamsStart);
                    self.tokens.push(tok);
                    pending_space = false;
                }
                ')' => {
                    depth -= 1;
                    let tok = self.single(TokenKind::ParamsEnd);
                    self.tokens.push(tok);
                    pending_space = false;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                ',' => {
                    let tok = self.single(TokenKind::ParamDelim);
                    self.tokens.push(tok);
                    pending_space = false;
                }
                ':' => {
                    let tok = self.single(TokenKind::LabelMark);
                    self.tokens.push(tok);
                    pending_space = false;
                }
                '"' => {
                    let s = self.scan_string()?;
                    self.tokens.push(Token::new(
                        TokenKind::Parameter(ParamToken::Literal(Literal::Str(s))),
                        self.loc(),
                    ));
                    pending_space = false;
                }
                c if c.is_ascii_digit() => {
                    let lit = self.scan_number();
                    self.tokens
                        .push(Token::new(TokenKind::Parameter(ParamToken::Literal(lit)), self.loc()));
                    pending_space = false;
                }
                '[' => {
                    if pending_space {
                        let tok = self.single_no_advance(TokenKind::Whitespace);
                        self.tokens.push(tok);
                    }
                    if let Some(lit) = self.try_scan_empty_collection() {
                        self.tokens
                            .push(Token::new(TokenKind::Parameter(ParamToken::Literal(lit)), self.loc()));
                    } else {
                        self.advance();
                        self.tokens.push(Token::new(
                            TokenKind::Parameter(ParamToken::Operator(Operator::LBracket)),
                            self.loc(),
                        ));
                    }
                    pending_space = false;
                }
                c if is_ident_start(c) => {
                    let loc = self.loc();
                    let ident = self.scan_ident();
                    let next_is_call = self.peek() == Some('(');
                    let kind = if next_is_call {
                        ParamToken::FunctionIdent(ident)
                    } else if let Some(kw) = Keyword::from_str(&ident) {
                        ParamToken::Keyword(kw)
                    } else {
                        ParamToken::VariablePart(ident)
                    };
                    self.tokens.push(Token::new(TokenKind::Parameter(kind), loc));
                    pending_space = false;
                }
                _ => {
                    let op = self.scan_operator()?;
                    self.tokens
                        .push(Token::new(TokenKind::Parameter(ParamToken::Operator(op)), self.loc()));
                    pending_space = false;
                }
            }
        }
    }

    fn single(&mut self, kind: TokenKind) -> Token {
        let loc = self.loc();
        self.advance();
        Token::new(kind, loc)
    }

    fn single_no_advance(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.loc())
    }

    fn try_scan_empty_collection(&mut self) -> Option<Literal> {
        if self.peek_at(1) == Some(']') {
            self.advance();
            self.advance();
            Some(Literal::EmptyArray)
        } else if self.peek_at(1) == Some(':') && self.peek_at(2) == Some(']') {
            self.advance();
            self.advance();
            self.advance();
            Some(Literal::EmptyDict)
        } else {
            None
        }
    }

    fn scan_ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        s
    }

    fn scan_number(&mut self) -> Literal {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            s.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    s.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            Literal::Double(s.parse().expect("validated digit sequence"))
        } else {
            Literal::Int(s.parse().expect("validated digit sequence"))
        }
    }

    fn scan_string(&mut self) -> Result<String, ParseError> {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.advance() {
                None => return Err(self.err("unterminated string literal")),
                Some('"') => return Ok(s),
                Some('\\') => match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some(other) => return Err(self.err(format!("invalid escape sequence `\\{other}`"))),
                    None => return Err(self.err("unterminated string literal")),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn scan_operator(&mut self) -> Result<Operator, ParseError> {
        for op in Operator::vocabulary() {
            if let Some(lexeme) = op.lexeme() {
                if self.matches_literal(lexeme) {
                    for _ in 0..lexeme.chars().count() {
                        self.advance();
                    }
                    return Ok(*op);
                }
            }
        }
        Err(self.err(format!("unexpected character `{}`", self.peek().unwrap_or(' '))))
    }

    fn matches_literal(&self, lexeme: &str) -> bool {
        lexeme
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.advance();
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

/// Builds a [`Variable`] from a run of `VariablePart` tokens separated by
/// `.` operators; used by the parser but colocated here as the inverse of
/// how the lexer emits path parts.
#[must_use]
pub fn variable_from_parts(parts: Vec<String>) -> Variable {
    Variable::new(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src, "t", '#').unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn plain_raw_text() {
        assert_eq!(kinds("hello"), vec![TokenKind::Raw("hello".into())]);
    }

    #[test]
    fn escaped_tag_mark_stays_raw() {
        assert_eq!(kinds(r"\#not a tag"), vec![TokenKind::Raw("#not a tag".into())]);
    }

    #[test]
    fn invalid_tag_decays_to_raw() {
        // `#` not followed by identifier or `(` is not a tag.
        assert_eq!(kinds("# hi"), vec![TokenKind::Raw("# hi".into())]);
    }

    #[test]
    fn anonymous_expression_tag() {
        let toks = kinds("#(todo.title)");
        assert_eq!(
            toks,
            vec![
                TokenKind::TagStart,
                TokenKind::TagName(None),
                TokenKind::ParamsStart,
                TokenKind::Parameter(ParamToken::VariablePart("todo".into())),
                TokenKind::Parameter(ParamToken::Operator(Operator::Dot)),
                TokenKind::Parameter(ParamToken::VariablePart("title".into())),
                TokenKind::ParamsEnd,
            ]
        );
    }

    #[test]
    fn function_identifier_detected_by_following_paren() {
        let toks = kinds("#(len(a))");
        assert!(matches!(
            toks[3],
            TokenKind::Parameter(ParamToken::FunctionIdent(ref s)) if s == "len"
        ));
    }

    #[test]
    fn block_tag_with_colon() {
        let toks = kinds("#if(a):");
        assert_eq!(toks.last(), Some(&TokenKind::BlockStart));
    }

    #[test]
    fn bare_closer_tag_has_no_params() {
        let toks = kinds("#endif");
        assert_eq!(
            toks,
            vec![TokenKind::TagStart, TokenKind::TagName(Some("endif".into()))]
        );
    }

    #[test]
    fn bare_chain_link_still_opens_a_block() {
        let toks = kinds("#else:");
        assert_eq!(
            toks,
            vec![
                TokenKind::TagStart,
                TokenKind::TagName(Some("else".into())),
                TokenKind::BlockStart,
            ]
        );
    }

    #[test]
    fn string_literal_escapes() {
        let toks = kinds(r#"#("a\nb\t\"c\\")"#);
        assert!(toks.iter().any(
            |t| matches!(&t.kind, TokenKind::Parameter(ParamToken::Literal(Literal::Str(s))) if s == "a\nb\t\"c\\")
        ));
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(lex(r#"#("unterminated)"#, "t", '#').is_err());
    }

    #[test]
    fn double_literal() {
        let toks = kinds("#(1.5)");
        assert!(toks
            .iter()
            .any(|t| matches!(&t.kind, TokenKind::Parameter(ParamToken::Literal(Literal::Double(d))) if (*d - 1.5).abs() < 1e-9)));
    }

    #[test]
    fn empty_array_and_dict_literals() {
        let toks = kinds("#(a = []) #(b = [:])");
        assert!(toks
            .iter()
            .any(|t| matches!(&t.kind, TokenKind::Parameter(ParamToken::Literal(Literal::EmptyArray)))));
        assert!(toks
            .iter()
            .any(|t| matches!(&t.kind, TokenKind::Parameter(ParamToken::Literal(Literal::EmptyDict)))));
    }

    #[test]
    fn whitespace_marks_array_literal_vs_subscript() {
        let subscript = kinds("#(a[i])");
        assert!(!subscript.iter().any(|t| t.kind == TokenKind::Whitespace));

        let array_literal = kinds("#(a [i])");
        assert!(array_literal.iter().any(|t| t.kind == TokenKind::Whitespace));
    }
}
