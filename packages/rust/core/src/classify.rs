//! Link classification.
//!
//! A [`Classifier`] decides whether a link is a job posting, a feed post or
//! unknown. Only concrete classifications are routed to an acquisition queue.

use linkflow_shared::{Classification, LinkflowError, PipelineConfig, Result};
use regex::{Regex, RegexBuilder};

/// Assigns a classification to a link.
pub trait Classifier: Send + Sync {
    fn classify(&self, link: &str, category_hint: Option<&str>) -> Classification;
}

/// Regex-based classifier. URL patterns win; the source's category hint is
/// only consulted when no pattern matches.
#[derive(Debug, Clone)]
pub struct UrlPatternClassifier {
    job: Vec<Regex>,
    post: Vec<Regex>,
}

impl UrlPatternClassifier {
    pub fn new(job_patterns: &[String], post_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            job: compile(job_patterns)?,
            post: compile(post_patterns)?,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(&config.job_patterns, &config.post_patterns)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| LinkflowError::config(format!("invalid pattern '{p}': {e}")))
        })
        .collect()
}

impl Classifier for UrlPatternClassifier {
    fn classify(&self, link: &str, category_hint: Option<&str>) -> Classification {
        let link = link.trim();
        if self.job.iter().any(|re| re.is_match(link)) {
            return Classification::Job;
        }
        if self.post.iter().any(|re| re.is_match(link)) {
            return Classification::Post;
        }
        match category_hint.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
            Some("job" | "jobs") => Classification::Job,
            Some("post" | "posts") => Classification::Post,
            _ => Classification::Unknown,
        }
    }
}
