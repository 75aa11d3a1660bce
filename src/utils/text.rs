use std::borrow::Cow;

/// Pluralizes a piece of text.
pub fn pluralize(base: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        base.into()
    } else {
        format!("{base}s").into()
    }
}

/// Shortens `text` to at most `max_chars` characters, replacing the tail with `omission`
/// when it does not fit.
pub fn truncate<'a>(text: &'a str, max_chars: usize, omission: &str) -> Cow<'a, str> {
    if text.chars().count() <= max_chars {
        return text.into();
    }

    let omission_len = omission.chars().count();
    if max_chars <= omission_len {
        return omission.chars().take(max_chars).collect::<String>().into();
    }

    let mut shortened: String = text.chars().take(max_chars - omission_len).collect();
    shortened.push_str(omission);
    shortened.into()
}

/// Generates a short random identifier used to correlate log lines of a single evaluation.
pub fn short_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
