//! Configuration directive tree
//!
//! The config file is a list of directives, one per line: a name followed by
//! whitespace-separated parameters, with optional quoting. A directive whose
//! line ends with `{` opens a block of child directives closed by a lone `}`.
//!
//! ```text
//! frontend example.com:443 {
//!     backend tcp://localhost:8080
//!     protocol h2 http/1.1
//! }
//! ```
//!
//! Parsing only builds the tree; directive names are interpreted when the
//! tree is applied to a [`crate::Server`], so an unknown directive is a load
//! error, not a parse error.

use std::path::Path;

use crate::error::{Error, Result};

/// A single configuration directive with its parameters and children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    pub name: String,
    pub params: Vec<String>,
    pub children: Vec<Directive>,
}

impl Directive {
    /// Get the parameter at `index`, or an error naming this directive.
    pub fn param(&self, index: usize) -> Result<&str> {
        self.params.get(index).map(String::as_str).ok_or_else(|| {
            Error::Config(format!(
                "directive {:?}: want at least {} parameters, got {}",
                self.name,
                index + 1,
                self.params.len()
            ))
        })
    }

    /// First child with the given name, if any.
    pub fn child(&self, name: &str) -> Option<&Directive> {
        self.children.iter().find(|d| d.name == name)
    }

    /// All children with the given name, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Directive> {
        self.children.iter().filter(move |d| d.name == name)
    }
}

/// Load and parse a configuration file.
pub async fn load(path: impl AsRef<Path>) -> Result<Vec<Directive>> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    parse(&text)
}

/// Parse configuration text into a directive tree.
pub fn parse(text: &str) -> Result<Vec<Directive>> {
    let mut root = Vec::new();
    // Currently open blocks, outermost first.
    let mut stack: Vec<Directive> = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let mut words = split_words(line)
            .map_err(|e| Error::Config(format!("line {}: {}", lineno + 1, e)))?;
        if words.is_empty() {
            continue;
        }

        if words.len() == 1 && words[0] == "}" {
            let done = stack
                .pop()
                .ok_or_else(|| Error::Config(format!("line {}: unexpected '}}'", lineno + 1)))?;
            match stack.last_mut() {
                Some(parent) => parent.children.push(done),
                None => root.push(done),
            }
            continue;
        }

        let opens_block = words.last().map(String::as_str) == Some("{");
        if opens_block {
            words.pop();
            if words.is_empty() {
                return Err(Error::Config(format!(
                    "line {}: block without a directive name",
                    lineno + 1
                )));
            }
        }

        let directive = Directive {
            name: words.remove(0),
            params: words,
            children: Vec::new(),
        };

        if opens_block {
            stack.push(directive);
        } else {
            match stack.last_mut() {
                Some(parent) => parent.children.push(directive),
                None => root.push(directive),
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(Error::Config(format!("unclosed block {:?}", open.name)));
    }

    Ok(root)
}

/// Split a line into words with shell-like quoting.
///
/// Double and single quotes group words; an unquoted `#` starts a comment.
fn split_words(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_word = true;
                }
                '#' => break,
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".into());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_directives() {
        let cfg = parse("tls\nfrontend example.com:443\n").unwrap();
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg[0].name, "tls");
        assert_eq!(cfg[1].params, vec!["example.com:443"]);
    }

    #[test]
    fn parses_nested_blocks() {
        let text = r#"
frontend example.com:443 {
    backend tcp://localhost:8080
    protocol h2 http/1.1
}
tls {
    on_demand {
        validate_command /bin/true
    }
}
"#;
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.len(), 2);

        let fe = &cfg[0];
        assert_eq!(fe.name, "frontend");
        assert_eq!(fe.child("backend").unwrap().params, vec!["tcp://localhost:8080"]);
        assert_eq!(
            fe.child("protocol").unwrap().params,
            vec!["h2", "http/1.1"]
        );

        let validate = cfg[1]
            .child("on_demand")
            .and_then(|d| d.child("validate_command"))
            .unwrap();
        assert_eq!(validate.params, vec!["/bin/true"]);
    }

    #[test]
    fn quoting_and_comments() {
        let cfg = parse("exec \"a b\" 'c d' # trailing\n# full line\n").unwrap();
        assert_eq!(cfg.len(), 1);
        assert_eq!(cfg[0].params, vec!["a b", "c d"]);
    }

    #[test]
    fn rejects_unbalanced_blocks() {
        assert!(parse("frontend x {\n").is_err());
        assert!(parse("}\n").is_err());
        assert!(parse("exec \"unterminated\n").is_err());
    }

    #[test]
    fn param_errors_name_the_directive() {
        let cfg = parse("backend\n").unwrap();
        let err = cfg[0].param(0).unwrap_err();
        assert!(err.to_string().contains("backend"));
    }
}
