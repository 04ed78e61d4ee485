//! Compile-time macro expansion over parsed [`Sexpr`] forms.
//!
//! ```text
//! (macro log (value) (syscall 0 value))
//! (log x)        ; => (syscall 0 x)
//! ```
//!
//! Definitions are collected from the whole program before anything expands, so
//! a macro may be used above its definition. Invocations are replaced by the
//! macro body with parameters substituted by the argument forms; a body with
//! several forms splices all of them in place of the call. Expansion runs
//! strictly before scope IDs are assigned, and running it on its own output
//! changes nothing.

use std::collections::{HashMap, HashSet};

use crate::Error;
use crate::ast::{Pos, Sexpr};
use crate::builtinops::is_mnemonic;
use crate::config::RuntimeConfig;

/// Heads with a fixed meaning in the text form
pub const KEYWORDS: &[&str] = &["macro", "scope", "list", "if", "<"];

pub fn is_reserved(name: &str) -> bool {
    KEYWORDS.contains(&name) || is_mnemonic(name)
}

#[derive(Debug, Clone)]
struct MacroDef {
    params: Vec<String>,
    body: Vec<Sexpr>,
}

type MacroTable = HashMap<String, MacroDef>;

fn macro_error(message: String, pos: Pos) -> Error {
    Error::MacroExpansion(format!("{message} at {pos}"))
}

/// Remove every `(macro ...)` form from `forms`, recording it in `table`
fn collect_definitions(forms: Vec<Sexpr>, table: &mut MacroTable) -> Result<Vec<Sexpr>, Error> {
    let mut kept = Vec::with_capacity(forms.len());
    for form in forms {
        match form {
            Sexpr::List { items, pos } if items.first().and_then(Sexpr::as_symbol) == Some("macro") => {
                let (name, def) = parse_definition(items, pos)?;
                if table.contains_key(&name) {
                    return Err(macro_error(format!("macro '{name}' is defined twice"), pos));
                }
                tracing::trace!(%name, params = def.params.len(), "macro defined");
                table.insert(name, def);
            }
            Sexpr::List { items, pos } => {
                let items = collect_definitions(items, table)?;
                kept.push(Sexpr::List { items, pos });
            }
            atom => kept.push(atom),
        }
    }
    Ok(kept)
}

fn parse_definition(items: Vec<Sexpr>, pos: Pos) -> Result<(String, MacroDef), Error> {
    let mut items = items.into_iter().skip(1);
    let name = match items.next() {
        Some(Sexpr::Symbol(name)) => name,
        Some(other) => {
            return Err(macro_error(format!("macro name must be a symbol, found {other}"), pos));
        }
        None => return Err(macro_error("macro definition has no name".into(), pos)),
    };
    if is_reserved(&name) {
        return Err(macro_error(format!("macro '{name}' would shadow a builtin"), pos));
    }

    let params = match items.next() {
        Some(Sexpr::List { items: params, .. }) => params,
        _ => {
            return Err(macro_error(format!("macro '{name}' needs a parameter list"), pos));
        }
    };
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(params.len());
    for param in params {
        let param = match param {
            Sexpr::Symbol(param) => param,
            other => {
                return Err(macro_error(
                    format!("macro '{name}' parameter {other} is not a symbol"),
                    pos,
                ));
            }
        };
        if !seen.insert(param.clone()) {
            return Err(macro_error(
                format!("macro '{name}' repeats parameter '{param}'"),
                pos,
            ));
        }
        names.push(param);
    }

    let body: Vec<Sexpr> = items.collect();
    Ok((
        name,
        MacroDef {
            params: names,
            body,
        },
    ))
}

fn substitute(form: &Sexpr, bindings: &HashMap<&str, &Sexpr>) -> Sexpr {
    match form {
        Sexpr::Symbol(s) => bindings
            .get(s.as_str())
            .map_or_else(|| form.clone(), |arg| (*arg).clone()),
        Sexpr::List { items, pos } => Sexpr::List {
            items: items.iter().map(|item| substitute(item, bindings)).collect(),
            pos: *pos,
        },
        atom => atom.clone(),
    }
}

struct Expander<'a> {
    table: &'a MacroTable,
    active: Vec<String>,
    max_depth: usize,
}

impl Expander<'_> {
    fn expand_forms(&mut self, forms: Vec<Sexpr>) -> Result<Vec<Sexpr>, Error> {
        let table = self.table;
        let mut out = Vec::with_capacity(forms.len());
        for form in forms {
            match form {
                Sexpr::List { items, pos } => {
                    let head = items.first().and_then(Sexpr::as_symbol);
                    match head.and_then(|h| table.get_key_value(h)) {
                        Some((name, def)) => out.extend(self.invoke(name, def, &items[1..], pos)?),
                        None => {
                            let items = self.expand_forms(items)?;
                            out.push(Sexpr::List { items, pos });
                        }
                    }
                }
                atom => out.push(atom),
            }
        }
        Ok(out)
    }

    fn invoke(
        &mut self,
        name: &str,
        def: &MacroDef,
        args: &[Sexpr],
        pos: Pos,
    ) -> Result<Vec<Sexpr>, Error> {
        if self.active.iter().any(|active| active == name) {
            return Err(macro_error(
                format!(
                    "macro '{name}' expands into itself ({} -> {name})",
                    self.active.join(" -> ")
                ),
                pos,
            ));
        }
        if self.active.len() >= self.max_depth {
            return Err(macro_error(
                format!(
                    "macro expansion deeper than {} levels while expanding '{name}'",
                    self.max_depth
                ),
                pos,
            ));
        }
        if args.len() != def.params.len() {
            return Err(macro_error(
                format!(
                    "macro '{name}' expects {} argument(s), got {}",
                    def.params.len(),
                    args.len()
                ),
                pos,
            ));
        }

        let bindings: HashMap<&str, &Sexpr> = def
            .params
            .iter()
            .map(String::as_str)
            .zip(args.iter())
            .collect();
        let body: Vec<Sexpr> = def
            .body
            .iter()
            .map(|form| substitute(form, &bindings))
            .collect();

        self.active.push(name.to_owned());
        let expanded = self.expand_forms(body);
        self.active.pop();
        expanded
    }
}

/// Collect all macro definitions and expand every invocation
pub fn expand(forms: Vec<Sexpr>, config: &RuntimeConfig) -> Result<Vec<Sexpr>, Error> {
    let mut table = MacroTable::new();
    let forms = collect_definitions(forms, &mut table)?;
    if table.is_empty() {
        return Ok(forms);
    }
    tracing::debug!(macros = table.len(), "expanding macros");
    Expander {
        table: &table,
        active: Vec::new(),
        max_depth: config.max_macro_depth,
    }
    .expand_forms(forms)
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::svmp::parse_forms;
    use pretty_assertions::assert_eq;

    fn expand_text(source: &str) -> Result<String, Error> {
        let forms = parse_forms(source, &RuntimeConfig::default())?;
        let expanded = expand(forms, &RuntimeConfig::default())?;
        Ok(expanded
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" "))
    }

    #[test]
    fn test_expansion_data_driven() {
        let test_cases: Vec<(&str, Result<&str, &str>)> = vec![
            // no macros: untouched
            ("(set x 1) (print x)", Ok("(set x 1) (print x)")),
            ("(macro log (v) (syscall 0 v)) (log x)", Ok("(syscall 0 x)")),
            // used before its definition
            ("(log 5) (macro log (v) (syscall 0 v))", Ok("(syscall 0 5)")),
            // multi-form bodies splice in place
            (
                "(macro twice (v) (print v) (print v)) (twice \"a\") (exit 0)",
                Ok("(print \"a\") (print \"a\") (exit 0)"),
            ),
            // nested invocation inside another form and inside a scope
            (
                "(macro inc (v) (add v 1)) (set x (inc x)) (scope s (set y (inc y)))",
                Ok("(set x (add x 1)) (scope s (set y (add y 1)))"),
            ),
            // macro using another macro
            (
                "(macro a (v) (b v v)) (macro b (p q) (add p q)) (print (a 2))",
                Ok("(print (add 2 2))"),
            ),
            // zero-parameter macro
            ("(macro hi () (println \"hi\")) (hi)", Ok("(println \"hi\")")),
            // errors
            ("(macro r (v) (r v)) (r 1)", Err("expands into itself")),
            ("(macro a (v) (b v)) (macro b (v) (a v)) (a 1)", Err("expands into itself")),
            ("(macro m (v) v) (macro m (v) v)", Err("defined twice")),
            ("(macro print (v) v)", Err("shadow a builtin")),
            ("(macro list (v) v)", Err("shadow a builtin")),
            ("(macro m (v v) v)", Err("repeats parameter")),
            ("(macro m (1) 1)", Err("not a symbol")),
            ("(macro m v v)", Err("parameter list")),
            ("(macro)", Err("no name")),
            ("(macro m (a b) a) (m 1)", Err("expects 2 argument(s), got 1")),
        ];

        for (i, (input, expected)) in test_cases.into_iter().enumerate() {
            let result = expand_text(input);
            match (result, expected) {
                (Ok(actual), Ok(text)) => assert_eq!(actual, text, "case #{}", i + 1),
                (Err(err), Err(text)) => {
                    let msg = err.to_string();
                    assert!(msg.starts_with("MacroExpansionError"), "case #{}: {msg}", i + 1);
                    assert!(msg.contains(text), "case #{}: '{msg}' lacks '{text}'", i + 1);
                }
                (Ok(actual), Err(text)) => {
                    panic!("case #{}: expected error '{text}', got {actual}", i + 1)
                }
                (Err(err), Ok(_)) => panic!("case #{}: unexpected error {err}", i + 1),
            }
        }
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let source = "(macro log (v) (syscall 0 v)) (set x 1) (log x) (scope s (log (add x 1)))";
        let config = RuntimeConfig::default();
        let once = expand(parse_forms(source, &config).unwrap(), &config).unwrap();
        let twice = expand(once.clone(), &config).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_expansion_depth_limit() {
        // a chain of 5 macros each calling the next
        let mut source = String::new();
        for i in 0..5 {
            source.push_str(&format!("(macro m{i} (v) (m{} v)) ", i + 1));
        }
        source.push_str("(macro m5 (v) (print v)) (m0 1)");

        let config = RuntimeConfig::default();
        let forms = parse_forms(&source, &config).unwrap();
        assert!(expand(forms.clone(), &config).is_ok());

        let shallow = RuntimeConfig {
            max_macro_depth: 3,
            ..config
        };
        let err = expand(forms, &shallow).unwrap_err();
        assert!(err.to_string().contains("deeper than 3"));
    }
}
