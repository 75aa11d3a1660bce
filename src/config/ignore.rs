use serde::Deserialize;

use crate::scm::Actor;

/// Actors whose activity is not considered by the activity predicates.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IgnoreActivityFrom {
    #[serde(default)]
    pub bots: bool,
    #[serde(default)]
    pub usernames: Vec<String>,
    /// Only matches actors with a public email.
    #[serde(default)]
    pub emails: Vec<String>,
}

impl IgnoreActivityFrom {
    pub fn matches(&self, actor: &Actor) -> bool {
        if actor.is_bot && self.bots {
            return true;
        }
        if self.usernames.iter().any(|name| name == &actor.username) {
            return true;
        }
        match &actor.email {
            Some(email) => self.emails.iter().any(|ignored| ignored == email),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jane() -> Actor {
        Actor {
            id: "1".to_string(),
            username: "jane".to_string(),
            email: Some("jane@example.com".to_string()),
            is_bot: false,
        }
    }

    fn bot() -> Actor {
        Actor {
            id: "2".to_string(),
            username: "scm-engine".to_string(),
            email: None,
            is_bot: true,
        }
    }

    #[test]
    fn empty_matches_nothing() {
        let ignore = IgnoreActivityFrom::default();
        assert!(!ignore.matches(&jane()));
        assert!(!ignore.matches(&bot()));
    }

    #[test]
    fn username_must_match_exactly() {
        let ignore = IgnoreActivityFrom {
            usernames: vec!["jane".to_string()],
            ..Default::default()
        };
        assert!(ignore.matches(&jane()));

        let ignore = IgnoreActivityFrom {
            usernames: vec!["janet".to_string()],
            ..Default::default()
        };
        assert!(!ignore.matches(&jane()));
    }

    #[test]
    fn bots() {
        let ignore = IgnoreActivityFrom {
            bots: true,
            ..Default::default()
        };
        assert!(ignore.matches(&bot()));
        assert!(!ignore.matches(&jane()));
    }

    #[test]
    fn emails() {
        let ignore = IgnoreActivityFrom {
            emails: vec!["jane@example.com".to_string()],
            ..Default::default()
        };
        assert!(ignore.matches(&jane()));

        let mut without_email = jane();
        without_email.email = None;
        assert!(!ignore.matches(&without_email));

        let ignore = IgnoreActivityFrom {
            emails: vec!["other@example.com".to_string()],
            ..Default::default()
        };
        assert!(!ignore.matches(&jane()));
    }
}
