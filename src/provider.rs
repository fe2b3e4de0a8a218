use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::Issue;

/// Error from a change provider.
#[derive(Debug)]
pub enum ProviderError {
    /// The provider could not produce or evaluate a change.
    Failed { detail: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Failed { detail } => write!(f, "provider failed: {detail}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One file a provider wants written, path relative to the workspace root.
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub path: String,
    pub content: String,
}

/// A reviewer's judgement on a set of proposed changes.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub approved: bool,
    pub comments: String,
}

/// The seam where real agents plug in. Workers call `propose_change` to turn
/// a claimed issue into file contents; reviewers call `evaluate_change` to
/// judge a submitted PR. Implementations must be deterministic enough that
/// a retried call for the same issue converges.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn propose_change(&self, issue: &Issue) -> Result<Vec<ChangeProposal>, ProviderError>;

    async fn evaluate_change(
        &self,
        issue: &Issue,
        changes: &BTreeMap<String, String>,
    ) -> Result<Verdict, ProviderError>;
}

/// Deterministic provider used by the built-in session runner and the tests.
/// Proposes one source file derived from the issue title and approves any
/// submission with meaningful content.
pub struct ScriptedProvider;

impl ScriptedProvider {
    /// Lowercases the title and maps every non-alphanumeric run to a single
    /// underscore, so "Add config parser!" becomes "add_config_parser".
    fn slug(title: &str) -> String {
        let mut slug = String::with_capacity(title.len());
        let mut last_was_sep = true;
        for ch in title.chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch.to_ascii_lowercase());
                last_was_sep = false;
            } else if !last_was_sep {
                slug.push('_');
                last_was_sep = true;
            }
        }
        let trimmed = slug.trim_end_matches('_');
        if trimmed.is_empty() {
            "change".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn propose_change(&self, issue: &Issue) -> Result<Vec<ChangeProposal>, ProviderError> {
        let slug = Self::slug(&issue.title);
        let content = format!(
            "// {}\n//\n// {}\n\npub fn {}() {{\n    // implementation pending review\n}}\n",
            issue.title, issue.description, slug
        );
        Ok(vec![ChangeProposal {
            path: format!("src/{slug}.rs"),
            content,
        }])
    }

    async fn evaluate_change(
        &self,
        _issue: &Issue,
        changes: &BTreeMap<String, String>,
    ) -> Result<Verdict, ProviderError> {
        if changes.is_empty() {
            return Ok(Verdict {
                approved: false,
                comments: "Submission contains no files.".to_string(),
            });
        }
        let total: usize = changes.values().map(|c| c.len()).sum();
        if total > 10 {
            Ok(Verdict {
                approved: true,
                comments: "Changes look complete and address the issue.".to_string(),
            })
        } else {
            Ok(Verdict {
                approved: false,
                comments: "Submission is too small to address the issue.".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_normalizes_title() {
        assert_eq!(ScriptedProvider::slug("Add config parser!"), "add_config_parser");
        assert_eq!(ScriptedProvider::slug("Fix  double  spaces"), "fix_double_spaces");
        assert_eq!(ScriptedProvider::slug("!!!"), "change");
    }

    #[tokio::test]
    async fn test_proposal_targets_slug_path() {
        let issue = Issue::new("Add config parser", "Parse TOML into Config");
        let changes = ScriptedProvider.propose_change(&issue).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "src/add_config_parser.rs");
        assert!(changes[0].content.contains("Parse TOML into Config"));
    }

    #[tokio::test]
    async fn test_evaluation_rejects_trivial_submissions() {
        let issue = Issue::new("Tiny", "too small");
        let mut changes = BTreeMap::new();
        changes.insert("a.rs".to_string(), "x".to_string());
        let verdict = ScriptedProvider
            .evaluate_change(&issue, &changes)
            .await
            .unwrap();
        assert!(!verdict.approved);

        changes.insert("b.rs".to_string(), "pub fn b() { /* real content */ }".to_string());
        let verdict = ScriptedProvider
            .evaluate_change(&issue, &changes)
            .await
            .unwrap();
        assert!(verdict.approved);
    }
}
