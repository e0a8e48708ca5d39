use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// A number, optionally followed by "star"/"stars".
static RATING_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d+(?:\.\d+)?)(?:\s*stars?\b)?").expect("Failed to compile rating regex")
});

/// "in" followed by a run of capitalized words.
static AREA_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[Ii]n\s+([A-Z][\w'-]*(?:\s+[A-Z][\w'-]*)*)").expect("Failed to compile area regex")
});

const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedQuery {
    /// What is left for the semantic search
    pub query: String,
    pub min_rating: Option<f64>,
    pub area: Option<String>,
}

impl ParsedQuery {
    pub fn has_filters(&self) -> bool {
        self.min_rating.is_some() || self.area.is_some()
    }
}

/// Peel the rating and area constraints off a free-text search query.
///
/// Only the first number within the 0-5 rating scale counts as a rating;
/// anything else (sizes, years) stays in the query.
pub fn parse_query(raw: &str) -> ParsedQuery {
    let mut rest = raw.to_string();
    let mut min_rating = None;

    for caps in RATING_REGEX.captures_iter(raw) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(value) = number.as_str().parse::<f64>() else {
            continue;
        };
        if (0.0..=MAX_RATING).contains(&value) {
            min_rating = Some(value);
            rest.replace_range(whole.range(), " ");
            break;
        }
    }

    let mut area = None;
    if let Some(caps) = AREA_REGEX.captures(&rest) {
        if let (Some(whole), Some(phrase)) = (caps.get(0), caps.get(1)) {
            area = Some(phrase.as_str().to_string());
            let range = whole.range();
            rest.replace_range(range, " ");
        }
    }

    ParsedQuery {
        query: rest.split_whitespace().collect::<Vec<_>>().join(" "),
        min_rating,
        area,
    }
}
