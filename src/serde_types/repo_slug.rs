use std::{fmt::Display, str::FromStr};

use serde::de::Visitor;

/// A repository slug in `owner/name` form, as used in hosting-service
/// API paths. Both parts are restricted to the character set the
/// hosting service itself allows, which keeps the slug safe for
/// interpolation into URL paths and report paths.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, serde::Serialize)]
pub struct RepoSlug(String);

fn valid_part(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

impl RepoSlug {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn owner(&self) -> &str {
        self.0.split('/').next().expect("checked at construction")
    }

    pub fn name(&self) -> &str {
        self.0.split('/').nth(1).expect("checked at construction")
    }
}

impl AsRef<str> for RepoSlug {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepoSlugError {
    #[error("a repository slug must contain exactly one '/', got {0:?}")]
    WrongShape(String),
    #[error("invalid character in repository slug {0:?}")]
    InvalidCharacter(String),
}

impl FromStr for RepoSlug {
    type Err = RepoSlugError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) => {
                if valid_part(owner) && valid_part(name) {
                    Ok(Self(s.into()))
                } else {
                    Err(RepoSlugError::InvalidCharacter(s.into()))
                }
            }
            _ => Err(RepoSlugError::WrongShape(s.into())),
        }
    }
}

struct RepoSlugVisitor;
impl<'de> Visitor<'de> for RepoSlugVisitor {
    type Value = RepoSlug;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a repository slug in owner/name form")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> serde::Deserialize<'de> for RepoSlug {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(RepoSlugVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_repo_slug() {
        let r: RepoSlug = "JuliaLang/julia".parse().unwrap();
        assert_eq!(r.owner(), "JuliaLang");
        assert_eq!(r.name(), "julia");
        assert_eq!(r.to_string(), "JuliaLang/julia");

        assert!("julia".parse::<RepoSlug>().is_err());
        assert!("a/b/c".parse::<RepoSlug>().is_err());
        assert!("a b/c".parse::<RepoSlug>().is_err());
        assert!("/x".parse::<RepoSlug>().is_err());
    }
}
