/// Expand `${VAR}` references in a raw config string from the process
/// environment.
///
/// References that resolve to nothing are kept as written, so a literal
/// `${PLACEHOLDER}` survives a round trip through the loader.
pub fn substitute_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok())
}

/// Expansion against an arbitrary variable source. Split out so tests never
/// have to mutate the real process environment.
fn expand(raw: &str, vars: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after_brace = &rest[start + 2..];
        match after_brace.find('}') {
            Some(end) if end > 0 => {
                let name = &after_brace[..end];
                match vars(name) {
                    Some(value) => out.push_str(&value),
                    // Unknown variable: keep the reference intact.
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after_brace[end + 1..];
            },
            // `${}` or a reference that never closes: emit the opener
            // literally and keep scanning after it.
            _ => {
                out.push_str("${");
                rest = after_brace;
            },
        }
    }

    out.push_str(rest);
    out
}
