//! GraphQL lexer.
//!
//! Commas are insignificant in GraphQL and are treated as whitespace, as are
//! `#` line comments.

use chumsky::{error::Cheap, prelude::*};

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: std::ops::Range<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// `query`, field names, enum values, type names.
    Name(String),
    /// `$ident`
    Var(String),
    /// `@ident`
    Directive(String),
    Literal(Literal),
    /// `...`
    Spread,
    /// single-char control tokens: `{ } ( ) [ ] : = !`
    Control(char),
}

/// Floats keep their source text so the token stays `Eq + Hash`; the parser
/// converts on demand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Literal {
    Int(i64),
    Float(String),
    Str(String),
    Bool(bool),
    Null,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Name(n) => write!(f, "`{n}`"),
            TokenKind::Var(n) => write!(f, "`${n}`"),
            TokenKind::Directive(n) => write!(f, "`@{n}`"),
            TokenKind::Literal(Literal::Int(i)) => write!(f, "`{i}`"),
            TokenKind::Literal(Literal::Float(s)) => write!(f, "`{s}`"),
            TokenKind::Literal(Literal::Str(s)) => write!(f, "string {s:?}"),
            TokenKind::Literal(Literal::Bool(b)) => write!(f, "`{b}`"),
            TokenKind::Literal(Literal::Null) => f.write_str("`null`"),
            TokenKind::Spread => f.write_str("`...`"),
            TokenKind::Control(c) => write!(f, "`{c}`"),
        }
    }
}

/// Lex a GraphQL document to tokens until the end of the input.
pub fn lexer() -> impl Parser<char, Vec<Token>, Error = Cheap<char>> {
    lex_token()
        .repeated()
        .then_ignore(ignored())
        .then_ignore(end())
}

fn lex_token() -> impl Parser<char, Token, Error = Cheap<char>> {
    let spread = just("...").to(TokenKind::Spread);

    let control = one_of("{}()[]:=!").map(TokenKind::Control);

    let var = just('$').ignore_then(ident_part()).map(TokenKind::Var);

    let directive = just('@').ignore_then(ident_part()).map(TokenKind::Directive);

    let name = ident_part().map(|name| match name.as_str() {
        "true" => TokenKind::Literal(Literal::Bool(true)),
        "false" => TokenKind::Literal(Literal::Bool(false)),
        "null" => TokenKind::Literal(Literal::Null),
        _ => TokenKind::Name(name),
    });

    let literal = literal().map(TokenKind::Literal);

    let token = choice((spread, var, directive, literal, name, control));

    ignored().ignore_then(token.map_with_span(|kind, span| Token { kind, span }))
}

/// Whitespace, commas and `#` comments.
fn ignored() -> impl Parser<char, (), Error = Cheap<char>> {
    let comment = just('#')
        .then(filter(|c: &char| *c != '\n').repeated())
        .ignored();
    let ws = filter(|c: &char| c.is_whitespace() || *c == ',').ignored();

    ws.or(comment).repeated().ignored()
}

fn ident_part() -> impl Parser<char, String, Error = Cheap<char>> + Clone {
    filter(|c: &char| c.is_ascii_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_').repeated())
        .collect()
}

fn literal() -> impl Parser<char, Literal, Error = Cheap<char>> {
    let frac = just('.').chain::<char, _, _>(text::digits(10));
    let exp = one_of("eE")
        .chain::<char, _, _>(one_of("+-").or_not())
        .chain::<char, _, _>(text::digits(10));

    let number = just('-')
        .or_not()
        .chain::<char, _, _>(text::digits(10))
        .chain::<char, _, _>(frac.or_not().flatten())
        .chain::<char, _, _>(exp.or_not().flatten())
        .collect::<String>()
        .map(|text| {
            if let Ok(i) = text.parse::<i64>() {
                Literal::Int(i)
            } else {
                Literal::Float(text)
            }
        });

    let escaped = just('\\').ignore_then(choice((
        just('"').to('"'),
        just('\\').to('\\'),
        just('/').to('/'),
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
    )));

    let string = just('"')
        .ignore_then(filter(|c: &char| *c != '"' && *c != '\\').or(escaped).repeated())
        .then_ignore(just('"'))
        .collect::<String>()
        .map(Literal::Str);

    number.or(string)
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        lexer()
            .parse(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lex_simple_query() {
        assert_debug_snapshot!(lex("query { users { id } }"), @r###"
        [
            Name(
                "query",
            ),
            Control(
                '{',
            ),
            Name(
                "users",
            ),
            Control(
                '{',
            ),
            Name(
                "id",
            ),
            Control(
                '}',
            ),
            Control(
                '}',
            ),
        ]
        "###);
    }

    #[test]
    fn lex_args_and_vars() {
        assert_debug_snapshot!(lex(r#"user(id: $id, rating: 4.5) @object"#), @r###"
        [
            Name(
                "user",
            ),
            Control(
                '(',
            ),
            Name(
                "id",
            ),
            Control(
                ':',
            ),
            Var(
                "id",
            ),
            Name(
                "rating",
            ),
            Control(
                ':',
            ),
            Literal(
                Float(
                    "4.5",
                ),
            ),
            Control(
                ')',
            ),
            Directive(
                "object",
            ),
        ]
        "###);
    }

    #[test]
    fn commas_and_comments_are_whitespace() {
        assert_eq!(
            lex("{ a, b } # trailing"),
            lex("{ a\n  b }")
        );
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(
            lex(r#"search(q: "a \"b\" c")"#)[4],
            TokenKind::Literal(Literal::Str("a \"b\" c".into()))
        );
    }

    #[test]
    fn negative_int() {
        assert_eq!(
            lex("limit: -5")[2],
            TokenKind::Literal(Literal::Int(-5))
        );
    }
}
