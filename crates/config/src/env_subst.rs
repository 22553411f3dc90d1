use std::{borrow::Cow, sync::LazyLock};

use regex::{Captures, Regex};

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unresolvable variables are left as-is so the parse error (or the empty
/// token diagnostic) points at the placeholder instead of silently blanking it.
pub fn substitute_env(input: &str) -> Cow<'_, str> {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with an injectable lookup, so tests never touch
/// the process environment.
pub fn substitute_env_with(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Cow<'_, str> {
    PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
}
