//! Token-budgeted context assembly from search results
//!
//! Search results become titled sections, near-duplicate sections collapse,
//! the survivors are ranked by relevance, type fit, recency, and project
//! match, then packed into the token budget and rendered through the
//! template for the requested context type.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::retriever::SearchResult;
use super::tokens::{create_token_counter, ApproxTokenCounter, TokenCounter};

/// Tokens reserved for template structure around the sections
const TEMPLATE_OVERHEAD_TOKENS: usize = 200;

/// Word-Jaccard similarity above which two sections are duplicates
const DUPLICATE_THRESHOLD: f32 = 0.8;

/// Context build errors
#[derive(Debug, thiserror::Error)]
pub enum ContextBuildError {
    #[error("invalid context request ({field}): {reason}")]
    InvalidRequest { field: &'static str, reason: String },
}

/// Shapes of assembled context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    StoryBible,
    CharacterProfiles,
    WorldBuilding,
    PlotGuidelines,
    StyleGuide,
    Mixed,
}

/// Request for building context from search results
#[derive(Debug, Clone)]
pub struct ContextBuildRequest {
    pub search_results: Vec<SearchResult>,
    pub context_type: ContextType,
    pub max_context_tokens: usize,
    pub prioritize_recent: bool,
    pub remove_duplicates: bool,
    pub project_id: Option<String>,
}

impl ContextBuildRequest {
    pub fn new(search_results: Vec<SearchResult>, context_type: ContextType) -> Self {
        Self {
            search_results,
            context_type,
            max_context_tokens: 8000,
            prioritize_recent: true,
            remove_duplicates: true,
            project_id: None,
        }
    }
}

/// One titled block of assembled context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    pub title: String,
    pub content: String,
    pub document_type: String,
    pub relevance_score: f32,
    pub token_count: usize,
    pub priority_score: f32,
    pub metadata: HashMap<String, Value>,
}

/// Response from context building
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuildResponse {
    pub formatted_context: String,
    pub sections: Vec<ContextSection>,
    pub total_tokens: usize,
    pub context_type: ContextType,
    pub build_time_seconds: f64,
}

/// Builder for creating structured context from search results
pub struct ContextBuilder {
    default_max_tokens: usize,
    counter: Box<dyn TokenCounter>,
}

impl ContextBuilder {
    /// Builder with the default generation model's tokenizer.
    pub fn new() -> Self {
        Self::for_model("gpt-4")
    }

    /// Builder counting tokens with the best tokenizer available for
    /// `model`, falling back to the character approximation.
    pub fn for_model(model: &str) -> Self {
        Self {
            default_max_tokens: 8000,
            counter: create_token_counter(model),
        }
    }

    /// Builder using the deterministic character approximation.
    pub fn approximate() -> Self {
        Self {
            default_max_tokens: 8000,
            counter: Box::new(ApproxTokenCounter),
        }
    }

    pub fn build(&self, request: ContextBuildRequest) -> Result<ContextBuildResponse, ContextBuildError> {
        let started = Instant::now();
        self.validate(&request)?;

        let mut sections = self.sections_from_results(&request);
        if request.remove_duplicates {
            sections = dedupe_sections(sections);
        }
        self.prioritize(&mut sections, &request);

        let final_sections = fit_to_budget(sections, request.max_context_tokens, self.counter.as_ref());
        let formatted_context = format_context(&final_sections, request.context_type);
        let total_tokens = self.counter.count_tokens(&formatted_context);

        tracing::debug!(
            "Built {:?} context: {} sections, {} tokens",
            request.context_type,
            final_sections.len(),
            total_tokens
        );

        Ok(ContextBuildResponse {
            formatted_context,
            sections: final_sections,
            total_tokens,
            context_type: request.context_type,
            build_time_seconds: started.elapsed().as_secs_f64(),
        })
    }

    fn validate(&self, request: &ContextBuildRequest) -> Result<(), ContextBuildError> {
        if request.search_results.is_empty() {
            return Err(ContextBuildError::InvalidRequest {
                field: "search_results",
                reason: "no search results provided".to_string(),
            });
        }
        if request.max_context_tokens <= TEMPLATE_OVERHEAD_TOKENS {
            return Err(ContextBuildError::InvalidRequest {
                field: "max_context_tokens",
                reason: format!("budget must exceed the {} token overhead", TEMPLATE_OVERHEAD_TOKENS),
            });
        }
        if request.max_context_tokens > 50_000 {
            return Err(ContextBuildError::InvalidRequest {
                field: "max_context_tokens",
                reason: "budget exceeds the reasonable upper limit".to_string(),
            });
        }
        Ok(())
    }

    fn sections_from_results(&self, request: &ContextBuildRequest) -> Vec<ContextSection> {
        request
            .search_results
            .iter()
            .map(|result| {
                let document_type = result
                    .metadata
                    .get("document_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                ContextSection {
                    title: section_title(result, &document_type),
                    content: result.content.clone(),
                    document_type,
                    relevance_score: result.similarity_score.clamp(0.0, 1.0),
                    token_count: self.counter.count_tokens(&result.content),
                    priority_score: 0.0,
                    metadata: result.metadata.clone(),
                }
            })
            .collect()
    }

    /// priority = 0.4 relevance + 0.3 type fit + 0.2 recency + 0.1 project
    fn prioritize(&self, sections: &mut [ContextSection], request: &ContextBuildRequest) {
        for section in sections.iter_mut() {
            let mut score = section.relevance_score * 0.4;
            score += type_bonus(&section.document_type, request.context_type) * 0.3;
            if request.prioritize_recent {
                if let Some(created_at) = section.metadata.get("created_at").and_then(|v| v.as_str()) {
                    score += recency_bonus(created_at) * 0.2;
                }
            }
            if let Some(project_id) = &request.project_id {
                if section.metadata.get("project_id").and_then(|v| v.as_str()) == Some(project_id) {
                    score += 0.1;
                }
            }
            section.priority_score = score;
        }
        sections.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn default_max_tokens(&self) -> usize {
        self.default_max_tokens
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn section_title(result: &SearchResult, document_type: &str) -> String {
    if let Some(title) = result.metadata.get("title").and_then(|v| v.as_str()) {
        return title.to_string();
    }

    let base = match document_type {
        "character" => "Character Information",
        "setting" => "Setting Details",
        "plot" => "Plot Guidelines",
        "style" => "Style Guidelines",
        "dialogue" => "Dialogue Examples",
        "scene" => "Scene Description",
        "story_bible" => "Story Bible",
        "world_building" => "World Building",
        _ => "Context Information",
    };

    if let Some(name) = result.metadata.get("character_name").and_then(|v| v.as_str()) {
        format!("{}: {}", base, name)
    } else if let Some(scene) = result.metadata.get("scene_type").and_then(|v| v.as_str()) {
        format!("{}: {}", base, scene)
    } else if let Some(chapter) = result.metadata.get("chapter") {
        format!("{}: Chapter {}", base, chapter)
    } else {
        base.to_string()
    }
}

fn word_jaccard(a: &str, b: &str) -> f32 {
    let words_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let words_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(str::to_string).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    intersection as f32 / union as f32
}

/// Collapse near-duplicate sections, keeping the higher-relevance copy.
fn dedupe_sections(sections: Vec<ContextSection>) -> Vec<ContextSection> {
    let mut unique: Vec<ContextSection> = Vec::new();
    for section in sections {
        let mut duplicate_of = None;
        for (index, existing) in unique.iter().enumerate() {
            if word_jaccard(&section.content, &existing.content) > DUPLICATE_THRESHOLD {
                duplicate_of = Some(index);
                break;
            }
        }
        match duplicate_of {
            Some(index) => {
                if section.relevance_score > unique[index].relevance_score {
                    unique[index] = section;
                }
            }
            None => unique.push(section),
        }
    }
    unique
}

fn type_bonus(document_type: &str, context_type: ContextType) -> f32 {
    let table: &[(&str, f32)] = match context_type {
        ContextType::StoryBible => &[
            ("story_bible", 1.0),
            ("plot", 0.8),
            ("world_building", 0.6),
            ("character", 0.4),
        ],
        ContextType::CharacterProfiles => &[
            ("character", 1.0),
            ("dialogue", 0.8),
            ("relationship", 0.6),
            ("plot", 0.3),
        ],
        ContextType::WorldBuilding => &[
            ("world_building", 1.0),
            ("setting", 0.9),
            ("environment", 0.8),
            ("culture", 0.7),
        ],
        ContextType::PlotGuidelines => &[
            ("plot", 1.0),
            ("structure", 0.9),
            ("pacing", 0.8),
            ("scene", 0.6),
        ],
        ContextType::StyleGuide => &[
            ("style", 1.0),
            ("tone", 0.9),
            ("format", 0.8),
            ("dialogue", 0.6),
        ],
        ContextType::Mixed => return 0.5,
    };
    table
        .iter()
        .find(|(doc_type, _)| *doc_type == document_type)
        .map(|(_, bonus)| *bonus)
        .unwrap_or(0.2)
}

fn recency_bonus(created_at: &str) -> f32 {
    let parsed = DateTime::parse_from_rfc3339(created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(created_at, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| naive.and_utc())
        });
    let Ok(created) = parsed else {
        return 0.5;
    };
    let days = (Utc::now() - created).num_days();
    match days {
        d if d <= 1 => 1.0,
        d if d <= 7 => 0.8,
        d if d <= 30 => 0.6,
        d if d <= 90 => 0.4,
        _ => 0.2,
    }
}

/// Pack whole sections in priority order; when the next section does not fit
/// and meaningful space remains, truncate it at a sentence boundary and stop.
fn fit_to_budget(
    sections: Vec<ContextSection>,
    max_tokens: usize,
    counter: &dyn TokenCounter,
) -> Vec<ContextSection> {
    let available = max_tokens.saturating_sub(TEMPLATE_OVERHEAD_TOKENS);
    let mut packed = Vec::new();
    let mut used = 0usize;

    for section in sections {
        if used + section.token_count <= available {
            used += section.token_count;
            packed.push(section);
            continue;
        }

        // Partial fit only when we are below 90% utilisation and at least
        // 100 tokens remain.
        let remaining = available.saturating_sub(used);
        if (used as f32) < available as f32 * 0.9 && remaining > 100 {
            let truncated = truncate_at_sentence(&section.content, remaining, counter);
            if !truncated.is_empty() {
                let token_count = counter.count_tokens(&truncated);
                if token_count <= remaining {
                    packed.push(ContextSection {
                        content: truncated,
                        token_count,
                        ..section
                    });
                }
            }
        }
        break;
    }
    packed
}

fn truncate_at_sentence(content: &str, max_tokens: usize, counter: &dyn TokenCounter) -> String {
    if counter.count_tokens(content) <= max_tokens {
        return content.to_string();
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for sentence in content.split(". ") {
        let tokens = counter.count_tokens(sentence);
        if used + tokens <= max_tokens.saturating_sub(20) {
            kept.push(sentence);
            used += tokens;
        } else {
            break;
        }
    }

    if kept.is_empty() {
        // Character fallback when not even one sentence fits
        let char_limit = max_tokens.saturating_mul(4).saturating_sub(3);
        let truncated: String = content.chars().take(char_limit).collect();
        return format!("{}...", truncated);
    }

    let mut joined = kept.join(". ");
    if !joined.ends_with('.') {
        joined.push_str("...");
    }
    joined
}

fn format_context(sections: &[ContextSection], context_type: ContextType) -> String {
    if sections.is_empty() {
        return String::new();
    }
    match context_type {
        ContextType::Mixed => {
            let body: Vec<String> = sections
                .iter()
                .map(|section| format!("### {}\n\n{}", section.title, section.content))
                .collect();
            format!("## Context Information\n\n{}", body.join("\n\n"))
        }
        typed => {
            let (header, buckets) = template_buckets(typed);
            let mut out = format!("## {}\n", header);
            let mut placed: Vec<bool> = vec![false; sections.len()];

            for (bucket_title, doc_types) in buckets {
                let matching: Vec<usize> = sections
                    .iter()
                    .enumerate()
                    .filter(|(index, section)| {
                        !placed[*index] && doc_types.contains(&section.document_type.as_str())
                    })
                    .map(|(index, _)| index)
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                out.push_str(&format!("\n### {}\n\n", bucket_title));
                for index in matching {
                    placed[index] = true;
                    out.push_str(&format!("{}\n\n", sections[index].content));
                }
            }

            let leftovers: Vec<usize> = placed
                .iter()
                .enumerate()
                .filter(|(_, placed)| !**placed)
                .map(|(index, _)| index)
                .collect();
            if !leftovers.is_empty() {
                out.push_str("\n### Additional Context\n\n");
                for index in leftovers {
                    out.push_str(&format!("{}\n\n", sections[index].content));
                }
            }
            out.trim_end().to_string()
        }
    }
}

fn template_buckets(context_type: ContextType) -> (&'static str, &'static [(&'static str, &'static [&'static str])]) {
    match context_type {
        ContextType::StoryBible => (
            "Story Bible Context",
            &[
                ("Project Overview", &["story_bible"] as &[&str]),
                ("Story Elements", &["plot", "world_building"]),
                ("Guidelines", &["style", "character"]),
            ],
        ),
        ContextType::CharacterProfiles => (
            "Character Information",
            &[
                ("Main Characters", &["character"] as &[&str]),
                ("Dialogue Examples", &["dialogue"]),
                ("Character Relationships", &["relationship"]),
            ],
        ),
        ContextType::WorldBuilding => (
            "World Building Context",
            &[
                ("Setting Information", &["setting"] as &[&str]),
                ("Environment Details", &["environment", "world_building"]),
                ("Cultural Context", &["culture"]),
            ],
        ),
        ContextType::PlotGuidelines => (
            "Plot Guidelines",
            &[
                ("Story Structure", &["structure"] as &[&str]),
                ("Key Plot Points", &["plot"]),
                ("Pacing Guidelines", &["pacing", "scene"]),
            ],
        ),
        ContextType::StyleGuide => (
            "Style Guidelines",
            &[
                ("Writing Style", &["style"] as &[&str]),
                ("Tone and Voice", &["tone"]),
                ("Format Requirements", &["format", "dialogue"]),
            ],
        ),
        ContextType::Mixed => ("Context Information", &[]),
    }
}
