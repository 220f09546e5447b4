//! Parameterized SPARQL statements.
//!
//! Statements are written as templates with `{{name}}` placeholders and
//! filled with typed values, the same way SQL is bound with
//! `sqlx::query(..).bind(..)`. All escaping happens here; no caller ever
//! formats a term into query text itself.
//!
//! ```rust
//! use pdf_signature_remover::sparql;
//!
//! let text = sparql::statement("ASK { {{piece}} ?p {{title}} }")
//!     .bind_iri("piece", "http://example.org/piece/1")
//!     .bind_str("title", "Nota \"B\"")
//!     .render()
//!     .unwrap();
//! assert_eq!(text, r#"ASK { <http://example.org/piece/1> ?p "Nota \"B\"" }"#);
//! ```
//!
//! Rendering fails if a placeholder has no binding, a binding is never
//! used, or an IRI contains characters that cannot appear in an IRIREF.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use thiserror::Error;

const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
const XSD_DATETIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SparqlError {
    #[error("invalid IRI: '{0}'")]
    InvalidIri(String),
    #[error("invalid variable name: '{0}'")]
    InvalidVariable(String),
    #[error("placeholder '{{{{{0}}}}}' has no binding")]
    Unbound(String),
    #[error("binding '{0}' is not used by the statement")]
    Unused(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

/// A typed RDF term or expression bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Iri(String),
    Str(String),
    Int(i64),
    DateTime(DateTime<Utc>),
    Expr(Expr),
}

impl Value {
    pub fn render(&self) -> Result<String, SparqlError> {
        match self {
            Value::Iri(iri) => escape_iri(iri),
            Value::Str(s) => Ok(escape_string(s)),
            Value::Int(n) => Ok(format!("\"{}\"^^<{}>", n, XSD_INTEGER)),
            Value::DateTime(dt) => Ok(format!(
                "\"{}\"^^<{}>",
                dt.to_rfc3339_opts(SecondsFormat::Millis, true),
                XSD_DATETIME
            )),
            Value::Expr(expr) => expr.render(),
        }
    }
}

/// A SPARQL expression, used inside `BIND` and `FILTER`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    Term(Box<Value>),
    Equals(Box<Expr>, Box<Expr>),
    IfElse(Box<Expr>, Box<Expr>, Box<Expr>),
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_string())
    }

    pub fn iri(iri: &str) -> Self {
        Expr::Term(Box::new(Value::Iri(iri.to_string())))
    }

    pub fn string(s: &str) -> Self {
        Expr::Term(Box::new(Value::Str(s.to_string())))
    }

    pub fn equals(lhs: Expr, rhs: Expr) -> Self {
        Expr::Equals(Box::new(lhs), Box::new(rhs))
    }

    pub fn if_else(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::IfElse(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn concat(parts: Vec<Expr>) -> Self {
        Expr::Concat(parts)
    }

    pub fn render(&self) -> Result<String, SparqlError> {
        Ok(match self {
            Expr::Var(name) => {
                if !is_valid_var(name) {
                    return Err(SparqlError::InvalidVariable(name.clone()));
                }
                format!("?{}", name)
            }
            Expr::Term(value) => value.render()?,
            Expr::Equals(l, r) => format!("{} = {}", l.render()?, r.render()?),
            Expr::IfElse(c, t, e) => {
                format!("IF({}, {}, {})", c.render()?, t.render()?, e.render()?)
            }
            Expr::Concat(parts) => {
                let rendered = parts
                    .iter()
                    .map(Expr::render)
                    .collect::<Result<Vec<_>, _>>()?;
                format!("CONCAT({})", rendered.join(", "))
            }
        })
    }
}

fn is_valid_var(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape an IRI as `<iri>`, rejecting characters IRIREF does not allow.
pub fn escape_iri(iri: &str) -> Result<String, SparqlError> {
    let forbidden = |c: char| {
        c <= ' ' || matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\')
    };
    if iri.is_empty() || iri.chars().any(forbidden) {
        return Err(SparqlError::InvalidIri(iri.to_string()));
    }
    Ok(format!("<{}>", iri))
}

/// Escape a plain string literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// A statement template awaiting bindings.
#[derive(Debug, Clone)]
pub struct Statement {
    template: String,
    params: HashMap<String, Value>,
}

/// Start a statement from a template.
pub fn statement(template: impl Into<String>) -> Statement {
    Statement {
        template: template.into(),
        params: HashMap::new(),
    }
}

impl Statement {
    pub fn bind(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn bind_iri(self, name: &str, iri: &str) -> Self {
        self.bind(name, Value::Iri(iri.to_string()))
    }

    pub fn bind_str(self, name: &str, s: &str) -> Self {
        self.bind(name, Value::Str(s.to_string()))
    }

    pub fn bind_int(self, name: &str, n: i64) -> Self {
        self.bind(name, Value::Int(n))
    }

    pub fn bind_datetime(self, name: &str, dt: DateTime<Utc>) -> Self {
        self.bind(name, Value::DateTime(dt))
    }

    pub fn bind_expr(self, name: &str, expr: Expr) -> Self {
        self.bind(name, Value::Expr(expr))
    }

    pub fn render(&self) -> Result<String, SparqlError> {
        let mut out = String::with_capacity(self.template.len());
        let mut used: Vec<&str> = Vec::new();
        let mut rest = self.template.as_str();
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(SparqlError::Unterminated(offset + start))?;
            let name = after[..end].trim();
            let value = self
                .params
                .get(name)
                .ok_or_else(|| SparqlError::Unbound(name.to_string()))?;
            out.push_str(&value.render()?);
            used.push(name);

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);

        if let Some(unused) = self.params.keys().find(|k| !used.contains(&k.as_str())) {
            return Err(SparqlError::Unused(unused.clone()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn binds_all_term_kinds() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let text = statement("{{s}} {{n}} {{d}} {{l}}")
            .bind_iri("s", "http://example.org/a")
            .bind_int("n", 42)
            .bind_datetime("d", dt)
            .bind_str("l", "x")
            .render()
            .unwrap();
        assert_eq!(
            text,
            "<http://example.org/a> \"42\"^^<http://www.w3.org/2001/XMLSchema#integer> \
             \"2024-03-01T12:30:00.000Z\"^^<http://www.w3.org/2001/XMLSchema#dateTime> \"x\""
        );
    }

    #[test]
    fn repeated_placeholder_renders_each_time() {
        let text = statement("{{a}} {{a}}")
            .bind_iri("a", "http://x/1")
            .render()
            .unwrap();
        assert_eq!(text, "<http://x/1> <http://x/1>");
    }

    #[test]
    fn string_escaping_blocks_injection() {
        let text = statement("{{t}}")
            .bind_str("t", "a\" } ; DROP ALL ; #\n\\")
            .render()
            .unwrap();
        assert_eq!(text, r#""a\" } ; DROP ALL ; #\n\\""#);
    }

    #[test]
    fn rejects_bad_iri() {
        for bad in ["", "http://x/a b", "http://x/>", "http://x/{y}", "http://x/\"q"] {
            let err = statement("{{s}}").bind_iri("s", bad).render().unwrap_err();
            assert!(matches!(err, SparqlError::InvalidIri(_)), "{:?}", bad);
        }
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let err = statement("ASK { {{s}} ?p ?o }").render().unwrap_err();
        assert_eq!(err, SparqlError::Unbound("s".to_string()));
    }

    #[test]
    fn unused_binding_is_an_error() {
        let err = statement("ASK { ?s ?p ?o }")
            .bind_iri("s", "http://x/1")
            .render()
            .unwrap_err();
        assert_eq!(err, SparqlError::Unused("s".to_string()));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let err = statement("ASK { {{s ?p ?o }")
            .bind_iri("s", "http://x/1")
            .render()
            .unwrap_err();
        assert!(matches!(err, SparqlError::Unterminated(6)));
    }

    #[test]
    fn sparql_braces_pass_through() {
        let text = statement("SELECT * WHERE { GRAPH {{g}} { ?s ?p ?o } }")
            .bind_iri("g", "http://x/g")
            .render()
            .unwrap();
        assert_eq!(text, "SELECT * WHERE { GRAPH <http://x/g> { ?s ?p ?o } }");
    }

    #[test]
    fn expressions_render() {
        let expr = Expr::concat(vec![Expr::var("name"), Expr::string(" (copy)")]);
        assert_eq!(expr.render().unwrap(), r#"CONCAT(?name, " (copy)")"#);
        assert!(matches!(
            Expr::var("bad name").render(),
            Err(SparqlError::InvalidVariable(_))
        ));
    }
}
