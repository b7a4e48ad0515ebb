use crate::config::SearchDirs;
use crate::traits::{Reranker, SearchResult, TEXT_CONTENT_TYPE};
use anyhow::{Result, anyhow, bail};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use log::{debug, info};
use std::path::PathBuf;

/// Cross-encoder reranker using FastEmbed models.
pub struct LocalReranker {
    model: TextRerank,
}

impl LocalReranker {
    /// Creates a reranker with the specified model or default BGERerankerBase.
    /// If cache_dir is provided, uses that; otherwise uses SearchDirs default.
    pub fn new(model: Option<RerankerModel>, cache_dir: Option<PathBuf>) -> Result<Self> {
        let model = model.unwrap_or(RerankerModel::BGERerankerBase);
        let cache_dir = match cache_dir {
            Some(dir) => dir,
            None => SearchDirs::new().ensure_cache_dir()?,
        };

        let init_options = RerankInitOptions::new(model.clone()).with_cache_dir(cache_dir);
        let reranker = TextRerank::try_new(init_options)?;
        info!("Initialized reranking model: {:?}", model);
        Ok(LocalReranker { model: reranker })
    }

    /// Creates a reranker with the default model and default cache directory.
    pub fn new_with_default_model() -> Result<Self> {
        Self::new(None, None)
    }
}

/// Reorders `results` by the indices a cross-encoder ranked, rejecting a
/// ranking that does not cover every result exactly once.
pub(crate) fn apply_ranking(results: &[SearchResult], ranking: &[usize]) -> Result<Vec<SearchResult>> {
    if ranking.len() != results.len() {
        bail!(
            "reranker ranked {} of {} results",
            ranking.len(),
            results.len()
        );
    }
    let mut seen = vec![false; results.len()];
    let mut reordered = Vec::with_capacity(results.len());
    for &index in ranking {
        let result = results
            .get(index)
            .ok_or_else(|| anyhow!("reranker returned out-of-range index {}", index))?;
        if std::mem::replace(&mut seen[index], true) {
            bail!("reranker returned index {} twice", index);
        }
        reordered.push(result.clone());
    }
    Ok(reordered)
}

impl Reranker for LocalReranker {
    fn rerank(
        &self,
        query: &str,
        results: &[SearchResult],
        content_type: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let content_type = content_type.unwrap_or(TEXT_CONTENT_TYPE);
        if content_type != TEXT_CONTENT_TYPE {
            bail!("content type '{}' is not supported by the text reranker", content_type);
        }
        let documents: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
        let ranked = self.model.rerank(query, documents, false, None)?;
        debug!("Reranked {} results for query '{}'", ranked.len(), query);
        let ranking: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        apply_ranking(results, &ranking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DocumentInfo;

    fn result(content: &str) -> SearchResult {
        SearchResult {
            content: content.to_string(),
            score: 0.5,
            content_type: "text".to_string(),
            document: DocumentInfo {
                id: 1,
                source: "a.txt".to_string(),
                title: "A".to_string(),
                content_type: "text".to_string(),
            },
            metadata: None,
        }
    }

    #[test]
    fn test_apply_ranking_reorders() {
        let results = vec![result("a"), result("b"), result("c")];
        let reordered = apply_ranking(&results, &[2, 0, 1]).unwrap();
        let contents: Vec<&str> = reordered.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_apply_ranking_rejects_partial_or_duplicate() {
        let results = vec![result("a"), result("b")];
        assert!(apply_ranking(&results, &[1]).is_err());
        assert!(apply_ranking(&results, &[1, 1]).is_err());
        assert!(apply_ranking(&results, &[0, 5]).is_err());
    }

    #[test]
    #[ignore = "downloads the default reranking model"]
    fn test_rerank_keeps_every_result() {
        let reranker = LocalReranker::new_with_default_model().expect("Failed to create reranker");
        let results = vec![result("pandas eat bamboo"), result("rust is a language")];
        let reranked = reranker.rerank("what is rust?", &results, None).unwrap();
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].content, "rust is a language");
    }
}
