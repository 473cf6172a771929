//! The `vs` reference resolver.
//!
//! Grammar: `[owner/name]<sep><ref>` with `<sep>` one of `:` (branch
//! head), `@` (commit SHA), `#` (tag name), plus the literal `%self`.

use std::{fmt::Display, str::FromStr};

use crate::{
    api::GithubApi,
    error::IntakeError,
    serde_types::{git_hash::GitHash, repo_slug::RepoSlug},
    submission::BuildRef,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsSpec {
    /// `%self`: compare the submission's build against itself (under
    /// a differing configuration, or to stress-test variance).
    SelfBuild,
    Branch {
        repo: Option<RepoSlug>,
        name: String,
    },
    Sha {
        repo: Option<RepoSlug>,
        sha: GitHash,
    },
    Tag {
        repo: Option<RepoSlug>,
        name: String,
    },
}

impl VsSpec {
    pub fn is_tag(&self) -> bool {
        matches!(self, VsSpec::Tag { .. })
    }

    pub fn branch_name(&self) -> Option<&str> {
        match self {
            VsSpec::Branch { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Resolve to a pinned build. `default_repo` fills in an absent
    /// `owner/name` prefix; `primary` is the submission's build, for
    /// `%self`. All resolution failures surface as validation errors
    /// (the ref came from user input).
    pub async fn resolve(
        &self,
        api: &GithubApi,
        default_repo: &RepoSlug,
        primary: &BuildRef,
    ) -> Result<BuildRef, IntakeError> {
        let build = match self {
            VsSpec::SelfBuild => return Ok(primary.clone()),
            VsSpec::Branch { repo, name } => {
                let repo = repo.as_ref().unwrap_or(default_repo);
                let sha = api.branch_head(repo, name).await.map_err(|_| {
                    IntakeError::Validation(format!("cannot resolve branch {name:?} in {repo}"))
                })?;
                fetch_commit(api, repo, &sha).await?
            }
            VsSpec::Sha { repo, sha } => {
                let repo = repo.as_ref().unwrap_or(default_repo);
                fetch_commit(api, repo, sha).await?
            }
            VsSpec::Tag { repo, name } => {
                let repo = repo.as_ref().unwrap_or(default_repo);
                let sha = api.tag_sha(repo, name).await.map_err(|_| {
                    IntakeError::Validation(format!("cannot resolve tag {name:?} in {repo}"))
                })?;
                fetch_commit(api, repo, &sha).await?
            }
        };
        Ok(build)
    }
}

async fn fetch_commit(
    api: &GithubApi,
    repo: &RepoSlug,
    sha: &GitHash,
) -> Result<BuildRef, IntakeError> {
    let commit = api.commit(repo, &sha.to_string()).await.map_err(|_| {
        IntakeError::Validation(format!("unknown commit {} in {repo}", sha.short()))
    })?;
    Ok(BuildRef {
        repo: repo.clone(),
        sha: sha.clone(),
        commit_time: commit.commit.committer.date,
        vinfo: None,
    })
}

impl Display for VsSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn prefix(repo: &Option<RepoSlug>) -> String {
            repo.as_ref().map(|r| r.to_string()).unwrap_or_default()
        }
        match self {
            VsSpec::SelfBuild => f.write_str("%self"),
            VsSpec::Branch { repo, name } => write!(f, "{}:{name}", prefix(repo)),
            VsSpec::Sha { repo, sha } => write!(f, "{}@{sha}", prefix(repo)),
            VsSpec::Tag { repo, name } => write!(f, "{}#{name}", prefix(repo)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VsSpecError {
    #[error("a `vs` reference needs one of the separators ':', '@', '#', or be \"%self\": {0:?}")]
    MissingSeparator(String),
    #[error("empty reference name in {0:?}")]
    EmptyRef(String),
    #[error("invalid repository prefix in {0:?}: {1}")]
    BadRepo(String, String),
    #[error("invalid commit hash in {0:?}: {1}")]
    BadSha(String, String),
}

impl FromStr for VsSpec {
    type Err = VsSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "%self" {
            return Ok(VsSpec::SelfBuild);
        }
        let (at, sep) = s
            .char_indices()
            .find(|(_, c)| matches!(c, ':' | '@' | '#'))
            .ok_or_else(|| VsSpecError::MissingSeparator(s.to_string()))?;
        let prefix = &s[..at];
        let name = &s[at + 1..];
        if name.is_empty() {
            return Err(VsSpecError::EmptyRef(s.to_string()));
        }
        let repo = if prefix.is_empty() {
            None
        } else {
            Some(
                prefix
                    .parse()
                    .map_err(|e: crate::serde_types::repo_slug::RepoSlugError| {
                        VsSpecError::BadRepo(s.to_string(), e.to_string())
                    })?,
            )
        };
        Ok(match sep {
            ':' => VsSpec::Branch {
                repo,
                name: name.to_string(),
            },
            '@' => VsSpec::Sha {
                repo,
                sha: name
                    .parse()
                    .map_err(|e: anyhow::Error| VsSpecError::BadSha(s.to_string(), e.to_string()))?,
            },
            '#' => VsSpec::Tag {
                repo,
                name: name.to_string(),
            },
            _ => unreachable!("find() only matches the three separators"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_parse() {
        assert_eq!("%self".parse::<VsSpec>().unwrap(), VsSpec::SelfBuild);

        match ":master".parse::<VsSpec>().unwrap() {
            VsSpec::Branch { repo, name } => {
                assert_eq!(repo, None);
                assert_eq!(name, "master");
            }
            other => panic!("{other:?}"),
        }

        match "JuliaLang/julia:release-1.10".parse::<VsSpec>().unwrap() {
            VsSpec::Branch { repo, name } => {
                assert_eq!(repo.unwrap().as_str(), "JuliaLang/julia");
                assert_eq!(name, "release-1.10");
            }
            other => panic!("{other:?}"),
        }

        match "@18fdd1625c4d98526736ea8e5047a4ca818de0b4"
            .parse::<VsSpec>()
            .unwrap()
        {
            VsSpec::Sha { repo: None, sha } => {
                assert_eq!(sha.short(), "18fdd16");
            }
            other => panic!("{other:?}"),
        }

        assert!("#v1.9.0".parse::<VsSpec>().unwrap().is_tag());
    }

    #[test]
    fn t_parse_errors() {
        assert!("master".parse::<VsSpec>().is_err());
        assert!(":".parse::<VsSpec>().is_err());
        assert!("@deadbeef".parse::<VsSpec>().is_err());
        assert!("owner only:branch".parse::<VsSpec>().is_err());
    }

    #[test]
    fn t_display_roundtrip() {
        for s in [
            "%self",
            ":master",
            "JuliaLang/julia:master",
            "#v1.9.0",
            "@18fdd1625c4d98526736ea8e5047a4ca818de0b4",
        ] {
            let spec: VsSpec = s.parse().unwrap();
            assert_eq!(spec.to_string(), s);
            assert_eq!(spec.to_string().parse::<VsSpec>().unwrap(), spec);
        }
    }
}
