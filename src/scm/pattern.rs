//! Gitignore-style path matching, used by `modified_files` script predicates and by the
//! pipeline failure allowance check.
use regex::Regex;

#[derive(thiserror::Error, Debug)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("pattern {0:?} contains three or more consecutive asterisks")]
    TooManyAsterisks(String),
    #[error("pattern {pattern:?} could not be compiled: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Left-anchored pattern without wildcards, compared directly against the path.
    Literal(String),
    Regex(Regex),
    /// The bare root pattern `/`.
    Nothing,
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    matcher: Matcher,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        if pattern.contains("***") {
            return Err(PatternError::TooManyAsterisks(pattern.to_string()));
        }

        let matcher = if pattern == "/" {
            Matcher::Nothing
        } else if pattern.starts_with('/') && !pattern.contains(['*', '?', '\\']) {
            Matcher::Literal(pattern[1..].to_string())
        } else {
            let regex = build_regex(pattern).map_err(|source| PatternError::Regex {
                pattern: pattern.to_string(),
                source,
            })?;
            Matcher::Regex(regex)
        };

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        match &self.matcher {
            Matcher::Nothing => false,
            Matcher::Literal(prefix) => {
                if prefix.ends_with('/') {
                    return path.starts_with(prefix.as_str());
                }
                if path.len() == prefix.len() {
                    return path == *prefix;
                }
                path.len() > prefix.len()
                    && path.as_bytes()[prefix.len()] == b'/'
                    && path.starts_with(prefix.as_str())
            }
            Matcher::Regex(regex) => regex.is_match(&path),
        }
    }
}

fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut segments: Vec<&str> = pattern.split('/').collect();

    if segments[0].is_empty() {
        // Anchored to the root.
        segments.remove(0);
    } else if (segments.len() == 1 || (segments.len() == 2 && segments[1].is_empty()))
        && segments[0] != "**"
    {
        // A single segment matches at any depth.
        segments.insert(0, "**");
    }

    if segments.len() > 1 && segments.last() == Some(&"") {
        if let Some(last) = segments.last_mut() {
            *last = "**";
        }
    }

    let last_index = segments.len() - 1;
    let mut expression = String::from(r"\A");
    let mut needs_slash = false;

    for (index, segment) in segments.iter().enumerate() {
        match *segment {
            "**" => {
                if index == 0 && index == last_index {
                    expression.push_str(".+");
                } else if index == 0 {
                    expression.push_str("(?:.+/)?");
                    needs_slash = false;
                } else if index == last_index {
                    expression.push_str("/.*");
                } else {
                    expression.push_str("(?:/.+)?");
                    needs_slash = true;
                }
            }
            "*" => {
                if needs_slash {
                    expression.push('/');
                }
                expression.push_str("[^/]+");
                needs_slash = true;
            }
            segment => {
                if needs_slash {
                    expression.push('/');
                }

                let mut escaped = false;
                for ch in segment.chars() {
                    if escaped {
                        escaped = false;
                        expression.push_str(&regex::escape(&ch.to_string()));
                        continue;
                    }
                    match ch {
                        '\\' => escaped = true,
                        '*' => expression.push_str("[^/]*"),
                        '?' => expression.push_str("[^/]"),
                        ch => expression.push_str(&regex::escape(&ch.to_string())),
                    }
                }

                // A path segment may also name a directory.
                if index == last_index {
                    expression.push_str("(?:/.*)?");
                }
                needs_slash = true;
            }
        }
    }

    expression.push_str(r"\z");
    Regex::new(&expression)
}

/// Compiles every pattern, failing on the first invalid one.
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<PathPattern>, PatternError> {
    patterns
        .iter()
        .map(|pattern| PathPattern::new(pattern.as_ref()))
        .collect()
}

/// Returns the files (in input order) that match at least one of the patterns.
pub fn find_modified_files<F, P>(files: &[F], patterns: &[P]) -> Result<Vec<String>, PatternError>
where
    F: AsRef<str>,
    P: AsRef<str>,
{
    let patterns = compile_patterns(patterns)?;
    Ok(files
        .iter()
        .map(|file| file.as_ref())
        .filter(|file| patterns.iter().any(|pattern| pattern.matches(file)))
        .map(|file| file.to_string())
        .collect())
}
