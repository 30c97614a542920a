//! Message personalization.
//!
//! Templates use flat `{key}` placeholders. A placeholder may carry an inline
//! fallback (`{name|there}`); `{{` and `}}` produce literal braces. Rendering
//! is a pure function of the template and the variable maps.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template syntax error at byte {position}: {reason}")]
    Syntax { position: usize, reason: String },

    #[error("missing template variable '{0}' and no default is configured")]
    MissingVariable(String),
}

/// Flat variable map used for rendering. Ordered so that serialized
/// enrollments are stable.
pub type Variables = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var {
        name: String,
        fallback: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    text.push('{');
                    i += 2;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    text.push('}');
                    i += 2;
                }
                b'{' => {
                    let Some(len) = source[i + 1..].find('}') else {
                        return Err(RenderError::Syntax {
                            position: i,
                            reason: "unclosed '{'".into(),
                        });
                    };
                    let inner = &source[i + 1..i + 1 + len];
                    if inner.contains('{') {
                        return Err(RenderError::Syntax {
                            position: i,
                            reason: "nested '{' inside placeholder".into(),
                        });
                    }
                    let (name, fallback) = match inner.split_once('|') {
                        Some((n, f)) => (n.trim(), Some(f.to_string())),
                        None => (inner.trim(), None),
                    };
                    if !is_valid_name(name) {
                        return Err(RenderError::Syntax {
                            position: i,
                            reason: format!("invalid variable name '{name}'"),
                        });
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Var {
                        name: name.to_string(),
                        fallback,
                    });
                    i += len + 2;
                }
                _ => {
                    // Advance by one full UTF-8 character.
                    let ch = source[i..].chars().next().unwrap_or_default();
                    text.push(ch);
                    i += ch.len_utf8().max(1);
                }
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every variable referenced by the template.
    pub fn variables(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Var { name, .. } => Some(name.as_str()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Variables that have neither an inline fallback nor a value in
    /// `defaults`, and are absent from `vars`.
    pub fn missing_variables(&self, vars: &Variables, defaults: &Variables) -> Vec<String> {
        let mut missing = BTreeSet::new();
        for seg in &self.segments {
            if let Segment::Var { name, fallback } = seg {
                if lookup(vars, name).is_none()
                    && fallback.is_none()
                    && lookup(defaults, name).is_none()
                {
                    missing.insert(name.clone());
                }
            }
        }
        missing.into_iter().collect()
    }

    /// Render with per-recipient `vars`, falling back to the inline default
    /// and then to campaign-level `defaults`.
    pub fn render(&self, vars: &Variables, defaults: &Variables) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.source.len());
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Var { name, fallback } => {
                    let value = lookup(vars, name)
                        .or(fallback.as_deref())
                        .or_else(|| lookup(defaults, name))
                        .ok_or_else(|| RenderError::MissingVariable(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Render `template` against `variables` with no campaign defaults.
pub fn render(template: &str, variables: &Variables) -> Result<String, RenderError> {
    Template::parse(template)?.render(variables, &Variables::new())
}

/// Blank values count as missing so that defaults still apply.
fn lookup<'a>(map: &'a Variables, name: &str) -> Option<&'a str> {
    map.get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_flat_keys() {
        let out = render(
            "Hi {name}, your code is {promo_code}.",
            &vars(&[("name", "Ana"), ("promo_code", "SPRING")]),
        )
        .unwrap();
        assert_eq!(out, "Hi Ana, your code is SPRING.");
    }

    #[test]
    fn missing_variable_without_default_fails() {
        let err = render("Hi {name}", &Variables::new()).unwrap_err();
        assert_eq!(err, RenderError::MissingVariable("name".into()));
    }

    #[test]
    fn inline_default_then_campaign_default() {
        let t = Template::parse("Hi {name|there}, from {company}").unwrap();
        let defaults = vars(&[("company", "Acme"), ("name", "ignored")]);
        let out = t.render(&Variables::new(), &defaults).unwrap();
        assert_eq!(out, "Hi there, from Acme");
    }

    #[test]
    fn blank_value_falls_back() {
        let t = Template::parse("Hi {name|friend}").unwrap();
        let out = t.render(&vars(&[("name", "  ")]), &Variables::new()).unwrap();
        assert_eq!(out, "Hi friend");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let out = render("{{not a var}} {x}", &vars(&[("x", "1")])).unwrap();
        assert_eq!(out, "{not a var} 1");
    }

    #[test]
    fn multibyte_text_survives() {
        let out = render("¡Hola {name}! 👋", &vars(&[("name", "Zoë")])).unwrap();
        assert_eq!(out, "¡Hola Zoë! 👋");
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(
            Template::parse("Hi {name"),
            Err(RenderError::Syntax { position: 3, .. })
        ));
        assert!(Template::parse("Hi {}").is_err());
        assert!(Template::parse("Hi {1abc}").is_err());
        assert!(Template::parse("Hi {a{b}}").is_err());
    }

    #[test]
    fn reports_variables_and_missing() {
        let t = Template::parse("{greeting|Hello} {name}, {city}").unwrap();
        let names: Vec<&str> = t.variables().into_iter().collect();
        assert_eq!(names, vec!["city", "greeting", "name"]);

        let missing = t.missing_variables(&vars(&[("name", "Li")]), &Variables::new());
        assert_eq!(missing, vec!["city".to_string()]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let t = Template::parse("{a}-{b|x}-{c}").unwrap();
        let v = vars(&[("a", "1"), ("c", "3")]);
        let first = t.render(&v, &Variables::new()).unwrap();
        for _ in 0..10 {
            assert_eq!(t.render(&v, &Variables::new()).unwrap(), first);
        }
        assert_eq!(first, "1-x-3");
    }
}
