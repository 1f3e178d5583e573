//! Lexer with significant indentation.
//!
//! Columns are 0-based character offsets, lines 1-based, matching the ranges
//! the rest of the system uses. Blank and comment-only lines produce no
//! tokens; inside brackets lines join implicitly and indentation is ignored.

use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),

    Def,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Pass,
    Break,
    Continue,
    And,
    Or,
    Not,
    True,
    False,
    None,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,

    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,

    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,

    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,

    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub lineno: u32,
    pub col_offset: u32,
    pub end_lineno: u32,
    pub end_col_offset: u32,
}

impl Token {
    fn new(tok: Tok, lineno: u32, col_offset: u32, end_col_offset: u32) -> Self {
        Self {
            tok,
            lineno,
            col_offset,
            end_lineno: lineno,
            end_col_offset,
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<u32> = vec![0];
    let mut bracket_depth: u32 = 0;

    for (line_idx, raw_line) in source.split('\n').enumerate() {
        let lineno = (line_idx + 1) as u32;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let chars: Vec<char> = line.chars().collect();

        let mut col: u32 = 0;
        if bracket_depth == 0 {
            while (col as usize) < chars.len() && chars[col as usize] == ' ' {
                col += 1;
            }
            if (col as usize) < chars.len() && chars[col as usize] == '\t' {
                return Err(SyntaxError::new("tab in indentation", lineno, col));
            }
            if (col as usize) >= chars.len() || chars[col as usize] == '#' {
                continue; // blank or comment-only line
            }

            let indent = col;
            let current = *indents.last().unwrap();
            if indent > current {
                indents.push(indent);
                tokens.push(Token::new(Tok::Indent, lineno, 0, indent));
            } else {
                while indent < *indents.last().unwrap() {
                    indents.pop();
                    tokens.push(Token::new(Tok::Dedent, lineno, 0, 0));
                }
                if indent != *indents.last().unwrap() {
                    return Err(SyntaxError::new(
                        "unindent does not match any outer indentation level",
                        lineno,
                        col,
                    ));
                }
            }
        }

        let emitted_before = tokens.len();
        lex_line(&chars, lineno, &mut col, &mut bracket_depth, &mut tokens)?;

        if bracket_depth == 0 && tokens.len() > emitted_before {
            let end = chars.len() as u32;
            tokens.push(Token::new(Tok::Newline, lineno, end, end));
        }
    }

    if bracket_depth > 0 {
        let last = source.split('\n').count() as u32;
        return Err(SyntaxError::new("unexpected end of input inside brackets", last, 0));
    }

    let last_line = source.split('\n').count() as u32;
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token::new(Tok::Dedent, last_line, 0, 0));
    }
    tokens.push(Token::new(Tok::Eof, last_line, 0, 0));
    Ok(tokens)
}

fn lex_line(
    chars: &[char],
    lineno: u32,
    col: &mut u32,
    bracket_depth: &mut u32,
    tokens: &mut Vec<Token>,
) -> Result<(), SyntaxError> {
    while (*col as usize) < chars.len() {
        let start = *col;
        let c = chars[start as usize];

        match c {
            ' ' | '\t' => {
                *col += 1;
            }
            '#' => break,
            '\'' | '"' => {
                let text = lex_string(chars, lineno, col, c)?;
                tokens.push(Token::new(Tok::Str(text), lineno, start, *col));
            }
            '0'..='9' => {
                let tok = lex_number(chars, lineno, col)?;
                tokens.push(Token::new(tok, lineno, start, *col));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start as usize;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[start as usize..end].iter().collect();
                *col = end as u32;
                tokens.push(Token::new(keyword_or_name(word), lineno, start, *col));
            }
            _ => {
                let tok = lex_operator(chars, lineno, col, bracket_depth)?;
                tokens.push(Token::new(tok, lineno, start, *col));
            }
        }
    }
    Ok(())
}

fn keyword_or_name(word: String) -> Tok {
    match word.as_str() {
        "def" => Tok::Def,
        "return" => Tok::Return,
        "if" => Tok::If,
        "elif" => Tok::Elif,
        "else" => Tok::Else,
        "while" => Tok::While,
        "for" => Tok::For,
        "in" => Tok::In,
        "pass" => Tok::Pass,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "and" => Tok::And,
        "or" => Tok::Or,
        "not" => Tok::Not,
        "True" => Tok::True,
        "False" => Tok::False,
        "None" => Tok::None,
        _ => Tok::Name(word),
    }
}

fn lex_string(
    chars: &[char],
    lineno: u32,
    col: &mut u32,
    quote: char,
) -> Result<String, SyntaxError> {
    let start = *col;
    let mut i = (*col + 1) as usize;
    let mut text = String::new();
    while i < chars.len() {
        match chars[i] {
            c if c == quote => {
                *col = (i + 1) as u32;
                return Ok(text);
            }
            '\\' => {
                i += 1;
                if i >= chars.len() {
                    break;
                }
                text.push(match chars[i] {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '\'' => '\'',
                    '"' => '"',
                    '0' => '\0',
                    other => {
                        return Err(SyntaxError::new(
                            format!("unknown escape sequence: \\{other}"),
                            lineno,
                            i as u32,
                        ))
                    }
                });
                i += 1;
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(SyntaxError::new(
        "unterminated string literal",
        lineno,
        start,
    ))
}

fn lex_number(chars: &[char], lineno: u32, col: &mut u32) -> Result<Tok, SyntaxError> {
    let start = *col as usize;
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    let mut is_float = false;
    if end < chars.len() && chars[end] == '.' {
        is_float = true;
        end += 1;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
    }
    let text: String = chars[start..end].iter().collect();
    *col = end as u32;
    if is_float {
        text.parse::<f64>()
            .map(Tok::Float)
            .map_err(|_| SyntaxError::new(format!("invalid number: {text}"), lineno, start as u32))
    } else {
        text.parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| SyntaxError::new(format!("invalid number: {text}"), lineno, start as u32))
    }
}

fn lex_operator(
    chars: &[char],
    lineno: u32,
    col: &mut u32,
    bracket_depth: &mut u32,
) -> Result<Tok, SyntaxError> {
    let i = *col as usize;
    let c = chars[i];
    let next = chars.get(i + 1).copied();

    let (tok, len) = match (c, next) {
        ('(', _) => (Tok::LParen, 1),
        (')', _) => (Tok::RParen, 1),
        ('[', _) => (Tok::LBracket, 1),
        (']', _) => (Tok::RBracket, 1),
        ('{', _) => (Tok::LBrace, 1),
        ('}', _) => (Tok::RBrace, 1),
        (',', _) => (Tok::Comma, 1),
        (':', _) => (Tok::Colon, 1),
        ('+', Some('=')) => (Tok::PlusAssign, 2),
        ('+', _) => (Tok::Plus, 1),
        ('-', Some('=')) => (Tok::MinusAssign, 2),
        ('-', _) => (Tok::Minus, 1),
        ('*', Some('=')) => (Tok::StarAssign, 2),
        ('*', _) => (Tok::Star, 1),
        ('/', Some('/')) => (Tok::DoubleSlash, 2),
        ('/', Some('=')) => (Tok::SlashAssign, 2),
        ('/', _) => (Tok::Slash, 1),
        ('%', _) => (Tok::Percent, 1),
        ('<', Some('=')) => (Tok::Le, 2),
        ('<', _) => (Tok::Lt, 1),
        ('>', Some('=')) => (Tok::Ge, 2),
        ('>', _) => (Tok::Gt, 1),
        ('=', Some('=')) => (Tok::EqEq, 2),
        ('=', _) => (Tok::Assign, 1),
        ('!', Some('=')) => (Tok::NotEq, 2),
        _ => {
            return Err(SyntaxError::new(
                format!("unexpected character: {c:?}"),
                lineno,
                *col,
            ))
        }
    };

    match tok {
        Tok::LParen | Tok::LBracket | Tok::LBrace => *bracket_depth += 1,
        Tok::RParen | Tok::RBracket | Tok::RBrace => {
            *bracket_depth = bracket_depth.saturating_sub(1)
        }
        _ => {}
    }

    *col += len;
    Ok(tok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source)
            .expect("tokenizing")
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn simple_assignment() {
        assert_eq!(
            toks("x = 1\n"),
            vec![
                Tok::Name("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let tokens = toks("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        // dedent comes before the z line's tokens
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        let z_pos = tokens
            .iter()
            .position(|t| *t == Tok::Name("z".into()))
            .unwrap();
        assert!(dedent_pos < z_pos);
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let tokens = toks("x = 1\n\n# comment\n   \ny = 2\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn brackets_join_lines() {
        let tokens = toks("x = [1,\n     2]\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            toks("s = 'a\\nb'\n")[2],
            Tok::Str("a\nb".into())
        );
    }

    #[test]
    fn token_positions_are_exact() {
        let tokens = tokenize("x = 10\n").unwrap();
        let ten = &tokens[2];
        assert_eq!((ten.lineno, ten.col_offset, ten.end_col_offset), (1, 4, 6));
    }

    #[test]
    fn bad_indent_is_an_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.lineno, 3);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("s = 'oops\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
