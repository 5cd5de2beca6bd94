//! Line-oriented lexer with Python-style indentation tracking.
//!
//! Blank and comment-only lines are skipped; indentation changes produce
//! `Indent`/`Dedent` tokens; newlines inside brackets are implicit line
//! joins.

use crate::interp::error::ScriptError;
use crate::interp::token::Tok;
use crate::interp::token::Token;
use crate::interp::token::keyword;

pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let mut chars: Vec<char> = source.chars().collect();
    // Guarantee a trailing newline so the last logical line terminates.
    if chars.last() != Some(&'\n') {
        chars.push('\n');
    }

    let mut i = 0;
    let mut line = 1;
    let mut at_line_start = true;

    while i < chars.len() {
        if at_line_start && depth == 0 {
            // Measure indentation; spaces only, tabs count as 8.
            let mut width = 0usize;
            let mut j = i;
            while j < chars.len() {
                match chars[j] {
                    ' ' => width += 1,
                    '\t' => width += 8 - (width % 8),
                    _ => break,
                }
                j += 1;
            }
            // Blank or comment-only lines do not affect indentation.
            if j >= chars.len() || chars[j] == '\n' || chars[j] == '#' {
                while j < chars.len() && chars[j] != '\n' {
                    j += 1;
                }
                i = j + 1;
                line += 1;
                continue;
            }
            let current = *indents.last().unwrap_or(&0);
            if width > current {
                indents.push(width);
                tokens.push(Token {
                    tok: Tok::Indent,
                    line,
                });
            } else {
                while width < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    tokens.push(Token {
                        tok: Tok::Dedent,
                        line,
                    });
                }
                if width != *indents.last().unwrap_or(&0) {
                    return Err(ScriptError::syntax(format!(
                        "inconsistent indentation on line {line}"
                    )));
                }
            }
            i = j;
            at_line_start = false;
            continue;
        }

        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Token {
                        tok: Tok::Newline,
                        line,
                    });
                    at_line_start = true;
                }
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let (text, next, lines) = lex_string(&chars, i, line)?;
                tokens.push(Token {
                    tok: Tok::Str(text),
                    line,
                });
                line += lines;
                i = next;
            }
            '0'..='9' => {
                let (tok, next) = lex_number(&chars, i, line)?;
                tokens.push(Token { tok, line });
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let tok = keyword(&ident).unwrap_or(Tok::Ident(ident));
                tokens.push(Token { tok, line });
            }
            _ => {
                let (tok, next) = lex_operator(&chars, i, line)?;
                match tok {
                    Tok::LParen | Tok::LBracket | Tok::LBrace => depth += 1,
                    Tok::RParen | Tok::RBracket | Tok::RBrace => {
                        depth = depth.saturating_sub(1);
                    }
                    _ => {}
                }
                tokens.push(Token { tok, line });
                i = next;
            }
        }
    }

    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token {
            tok: Tok::Dedent,
            line,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line,
    });
    Ok(tokens)
}

fn lex_string(
    chars: &[char],
    start: usize,
    line: usize,
) -> Result<(String, usize, usize), ScriptError> {
    let quote = chars[start];
    // Triple-quoted strings may span lines.
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };
    let mut text = String::new();
    let mut newlines = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if triple {
            if c == quote && chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return Ok((text, i + 3, newlines));
            }
        } else if c == quote {
            return Ok((text, i + 1, newlines));
        } else if c == '\n' {
            return Err(ScriptError::syntax(format!(
                "unterminated string on line {line}"
            )));
        }
        if c == '\\' {
            let escaped = chars.get(i + 1).copied().ok_or_else(|| {
                ScriptError::syntax(format!("unterminated escape on line {line}"))
            })?;
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                other => other,
            });
            i += 2;
            continue;
        }
        if c == '\n' {
            newlines += 1;
        }
        text.push(c);
        i += 1;
    }
    Err(ScriptError::syntax(format!(
        "unterminated string on line {line}"
    )))
}

fn lex_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), ScriptError> {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_float = false;
    if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text: String = chars[start..i].iter().collect();
    if is_float {
        text.parse::<f64>()
            .map(|f| (Tok::Float(f), i))
            .map_err(|_| ScriptError::syntax(format!("bad number '{text}' on line {line}")))
    } else {
        text.parse::<i64>()
            .map(|n| (Tok::Int(n), i))
            .map_err(|_| ScriptError::syntax(format!("bad number '{text}' on line {line}")))
    }
}

fn lex_operator(chars: &[char], i: usize, line: usize) -> Result<(Tok, usize), ScriptError> {
    let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
    let tok = match two.as_str() {
        "==" => return Ok((Tok::Eq, i + 2)),
        "!=" => return Ok((Tok::NotEq, i + 2)),
        "<=" => return Ok((Tok::LtEq, i + 2)),
        ">=" => return Ok((Tok::GtEq, i + 2)),
        "+=" => return Ok((Tok::PlusAssign, i + 2)),
        "-=" => return Ok((Tok::MinusAssign, i + 2)),
        "*=" => return Ok((Tok::StarAssign, i + 2)),
        "/=" => return Ok((Tok::SlashAssign, i + 2)),
        _ => match chars[i] {
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '<' => Tok::Lt,
            '>' => Tok::Gt,
            '=' => Tok::Assign,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            other => {
                return Err(ScriptError::syntax(format!(
                    "unexpected character '{other}' on line {line}"
                )));
            }
        },
    };
    Ok((tok, i + 1))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn lexes_assignment() {
        assert_eq!(
            toks("x = 42"),
            vec![
                Tok::Ident("x".to_string()),
                Tok::Assign,
                Tok::Int(42),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn tracks_indentation() {
        let tokens = toks("def f(x):\n    return x\n");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let tokens = toks("x = 1\n\n# comment\ny = 2\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn brackets_join_lines() {
        let tokens = toks("x = [1,\n     2]\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            toks(r#"s = 'a\'b'"#)[2],
            Tok::Str("a'b".to_string())
        );
        assert_eq!(
            toks(r#"s = "tab\there""#)[2],
            Tok::Str("tab\there".to_string())
        );
    }

    #[test]
    fn triple_quoted_strings_span_lines() {
        let tokens = toks("s = \"\"\"line one\nline two\"\"\"\n");
        assert_eq!(tokens[2], Tok::Str("line one\nline two".to_string()));
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = tokenize("s = 'oops\n").err().expect("error");
        assert_eq!(err.kind, "SyntaxError");
    }

    #[test]
    fn numbers_and_floats() {
        assert_eq!(toks("x = 3.5")[2], Tok::Float(3.5));
        assert_eq!(toks("x = 10")[2], Tok::Int(10));
    }
}
