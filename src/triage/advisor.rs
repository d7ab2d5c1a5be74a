//! Tool recommendations drawn from past solves in the same category.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use super::db::DbHandle;
use super::models::{SolveRecord, ToolRecommendation};

/// Similar solves kept after overlap ranking.
pub const SHORTLIST_SIZE: usize = 10;
/// Recommendations returned.
pub const MAX_RECOMMENDATIONS: usize = 10;

const SUCCESSFUL_TOOL_POINTS: u32 = 2;
const SEQUENCE_TOOL_POINTS: u32 = 1;

pub struct HistoryAdvisor {
    db: DbHandle,
}

impl HistoryAdvisor {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Past solves in `category`, most file-type overlap first, recency
    /// breaking ties.
    pub async fn similar_solves(
        &self,
        category: &str,
        file_types: &[String],
        limit: usize,
    ) -> Result<Vec<SolveRecord>> {
        let category = category.to_string();
        let fetch = (limit * 2) as i64;
        let recent = self
            .db
            .call(move |db| db.recent_solves(&category, fetch))
            .await?;
        Ok(shortlist(recent, file_types, limit))
    }

    pub async fn recommend(
        &self,
        category: &str,
        file_types: &[String],
    ) -> Result<Vec<ToolRecommendation>> {
        let similar = self
            .similar_solves(category, file_types, SHORTLIST_SIZE)
            .await?;
        let recommendations = score_tools(&similar);
        tracing::debug!(
            category,
            similar = similar.len(),
            recommendations = recommendations.len(),
            "Computed tool recommendations"
        );
        Ok(recommendations)
    }
}

/// Stable sort by overlap keeps the newest-first input order for ties.
fn shortlist(mut records: Vec<SolveRecord>, file_types: &[String], limit: usize) -> Vec<SolveRecord> {
    let query: HashSet<&str> = file_types.iter().map(String::as_str).collect();
    let overlap = |r: &SolveRecord| -> usize {
        r.file_types
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>()
            .intersection(&query)
            .count()
    };
    records.sort_by_cached_key(|r| std::cmp::Reverse(overlap(r)));
    records.truncate(limit);
    records
}

/// +2 per successful-tools entry, +1 per tool-sequence entry. Ties keep
/// first-seen order.
fn score_tools(records: &[SolveRecord]) -> Vec<ToolRecommendation> {
    struct Tally {
        score: u32,
        solves: usize,
    }

    let mut order: Vec<String> = Vec::new();
    let mut tallies: HashMap<String, Tally> = HashMap::new();
    let mut bump = |tool: &str, points: u32, seen: &mut HashSet<String>| {
        let tally = tallies.entry(tool.to_string()).or_insert_with(|| {
            order.push(tool.to_string());
            Tally { score: 0, solves: 0 }
        });
        tally.score += points;
        if seen.insert(tool.to_string()) {
            tally.solves += 1;
        }
    };

    for record in records {
        let mut seen = HashSet::new();
        for tool in &record.successful_tools {
            bump(tool, SUCCESSFUL_TOOL_POINTS, &mut seen);
        }
        for tool in &record.tool_sequence {
            bump(tool, SEQUENCE_TOOL_POINTS, &mut seen);
        }
    }

    let mut recommendations: Vec<ToolRecommendation> = order
        .into_iter()
        .filter_map(|tool| {
            let tally = tallies.get(&tool)?;
            Some(ToolRecommendation {
                reason: format!(
                    "Used in {} similar solves (score {})",
                    tally.solves, tally.score
                ),
                score: tally.score,
                tool,
            })
        })
        .collect();
    recommendations.sort_by(|a, b| b.score.cmp(&a.score));
    recommendations.truncate(MAX_RECOMMENDATIONS);
    recommendations
}
