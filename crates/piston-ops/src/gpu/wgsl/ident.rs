//! Identifier-aware rewriting of WGSL fragments.
//!
//! Fragments are small, so these work on plain text with identifier boundaries instead
//! of a full parser. Member accesses (`foo.name`) are never treated as identifiers.

/// Prefix used by fragments to refer to kernel arguments, e.g. `args.bias`.
pub const ARGS_PREFIX: &str = "args.";

pub fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Reads the identifier starting at byte `start`, returning its end offset.
pub fn ident_end(code: &str, start: usize) -> usize {
    code[start..]
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| start + i)
        .unwrap_or(code.len())
}

fn preceded_by_ident_or_dot(code: &str, at: usize) -> bool {
    code[..at]
        .chars()
        .next_back()
        .is_some_and(|c| is_ident_char(c) || c == '.')
}

/// Names introduced by `let` / `var` / `const` declarations in a fragment.
pub fn declared_locals(code: &str) -> Vec<String> {
    let mut locals = Vec::new();
    let mut cursor = 0;
    while cursor < code.len() {
        let Some(c) = code[cursor..].chars().next() else {
            break;
        };
        if !is_ident_start(c) || preceded_by_ident_or_dot(code, cursor) {
            cursor += c.len_utf8();
            continue;
        }
        let end = ident_end(code, cursor);
        let word = &code[cursor..end];
        if matches!(word, "let" | "var" | "const") {
            let rest = &code[end..];
            let skipped = rest.len() - rest.trim_start().len();
            let name_start = end + skipped;
            if code[name_start..].starts_with(|c: char| is_ident_start(c)) {
                let name_end = ident_end(code, name_start);
                let name = code[name_start..name_end].to_string();
                if !locals.contains(&name) {
                    locals.push(name);
                }
            }
        }
        cursor = end;
    }
    locals
}

/// Appends `postfix` to whole-word uses of every identifier in `names`, leaving member
/// accesses and `args.` selectors untouched.
pub fn postfix_identifiers(code: &str, names: &[String], postfix: &str) -> String {
    let mut out = String::with_capacity(code.len() + 16);
    let mut cursor = 0;
    while cursor < code.len() {
        let Some(c) = code[cursor..].chars().next() else {
            break;
        };
        if is_ident_start(c) && !preceded_by_ident_or_dot(code, cursor) {
            let end = ident_end(code, cursor);
            let word = &code[cursor..end];
            out.push_str(word);
            if names.iter().any(|n| n == word) {
                out.push_str(postfix);
            }
            cursor = end;
        } else {
            out.push(c);
            cursor += c.len_utf8();
        }
    }
    out
}

/// Appends `postfix` to every `args.<name>` selector whose name satisfies `is_arg`.
pub fn postfix_arguments(code: &str, postfix: &str, is_arg: impl Fn(&str) -> bool) -> String {
    let mut out = String::with_capacity(code.len() + 16);
    let mut cursor = 0;
    for reference in arg_references(code) {
        if !is_arg(reference.name) {
            continue;
        }
        let name_end = reference.range.start + ARGS_PREFIX.len() + reference.name.len();
        out.push_str(&code[cursor..name_end]);
        out.push_str(postfix);
        cursor = name_end;
    }
    out.push_str(&code[cursor..]);
    out
}

/// One `args.<name>` reference found in a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgReference<'a> {
    /// Byte range of the whole selector, including a trailing `.shape`.
    pub range: std::ops::Range<usize>,
    pub name: &'a str,
    pub shape: bool,
}

/// Finds every `args.<name>` or `args.<name>.shape` selector in order.
pub fn arg_references(code: &str) -> Vec<ArgReference<'_>> {
    const SHAPE: &str = ".shape";
    let mut refs = Vec::new();
    let mut cursor = 0;
    while let Some(found) = code[cursor..].find(ARGS_PREFIX) {
        let at = cursor + found;
        let name_start = at + ARGS_PREFIX.len();
        if preceded_by_ident_or_dot(code, at) {
            cursor = name_start;
            continue;
        }
        let name_end = ident_end(code, name_start);
        let tail = &code[name_end..];
        let shape = tail.starts_with(SHAPE)
            && !tail[SHAPE.len()..].starts_with(|c: char| is_ident_char(c));
        let end = if shape { name_end + SHAPE.len() } else { name_end };
        refs.push(ArgReference {
            range: at..end,
            name: &code[name_start..name_end],
            shape,
        });
        cursor = end;
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_locals() {
        let code = "let lo = 1.0;\n var hi: f32 = 2.0;\n in_out_value = clamp(in_out_value, lo, hi);";
        assert_eq!(declared_locals(code), vec!["lo", "hi"]);
    }

    #[test]
    fn test_declared_locals_ignores_substrings() {
        assert!(declared_locals("outlet = variable + 1;").is_empty());
    }

    #[test]
    fn test_postfix_identifiers_respects_boundaries() {
        let code = "let e = exp(-v); x = e + e2 + v.e + args.e;";
        assert_eq!(
            postfix_identifiers(code, &["e".to_string()], "_link1"),
            "let e_link1 = exp(-v); x = e_link1 + e2 + v.e + args.e;"
        );
    }

    #[test]
    fn test_postfix_arguments() {
        let code = "a = args.bias[s] + args.bias_scale + margs.bias + args.src.shape;";
        assert_eq!(
            postfix_arguments(code, "_link2", |name| name == "bias" || name == "src"),
            "a = args.bias_link2[s] + args.bias_scale + margs.bias + args.src_link2.shape;"
        );
    }

    #[test]
    fn test_arg_references() {
        let code = "let s = args.src.shape; v = args.src[0] + args.scale + args.src.shaped;";
        let refs = arg_references(code);
        let summary: Vec<_> = refs.iter().map(|r| (r.name, r.shape)).collect();
        assert_eq!(
            summary,
            vec![("src", true), ("src", false), ("scale", false), ("src", false)]
        );
        assert_eq!(&code[refs[0].range.clone()], "args.src.shape");
    }
}
