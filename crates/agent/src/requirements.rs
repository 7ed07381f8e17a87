//! Deterministic extraction of event requirements from free text.
//!
//! Only fields that are clearly stated are captured; anything ambiguous is left
//! for the clarification prompt to ask about.

use std::collections::BTreeMap;

use eventcrew_core::domain::conversation::requirement_fields as fields;

#[derive(Clone, Debug, Default)]
pub struct RequirementExtractor;

impl RequirementExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Field name to normalized value for every requirement found in `text`.
    pub fn extract(&self, text: &str) -> BTreeMap<String, String> {
        let normalized_text = normalize_text(text);
        let tokens = tokenize(&normalized_text);

        let mut found = BTreeMap::new();
        if let Some(event_type) = extract_event_type(&tokens) {
            found.insert(fields::EVENT_TYPE.to_string(), event_type);
        }
        if let Some(attendees) = extract_attendees(&tokens) {
            found.insert(fields::ATTENDEES.to_string(), attendees.to_string());
        }
        if let Some(cents) = extract_budget_cents(&tokens) {
            found.insert(fields::BUDGET.to_string(), format_dollars(cents));
        }
        if let Some(timeline) = extract_timeline(&tokens) {
            found.insert(fields::TIMELINE.to_string(), timeline);
        }
        if let Some(location) = extract_location(text) {
            found.insert(fields::LOCATION.to_string(), location);
        }
        found
    }
}

/// Coordinator reply asking for whatever is still missing.
pub fn clarification_prompt(missing: &[&str]) -> String {
    let asks: Vec<&str> = missing.iter().map(|field| field_question(field)).collect();
    match asks.as_slice() {
        [] => "I have everything I need to draft a proposal.".to_string(),
        [only] => format!("To put a proposal together I still need {only}."),
        [init @ .., last] => {
            format!("To put a proposal together I still need {} and {last}.", init.join(", "))
        }
    }
}

fn field_question(field: &str) -> &'static str {
    match field {
        fields::EVENT_TYPE => "the kind of event (conference, wedding, gala, ...)",
        fields::ATTENDEES => "the expected number of attendees",
        fields::BUDGET => "your budget",
        fields::TIMELINE => "when the event should take place",
        fields::LOCATION => "the city or venue",
        _ => "a few more details",
    }
}

fn normalize_text(text: &str) -> String {
    text.to_ascii_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '$' | '.') {
            sanitized.push(character);
        } else if character != ',' {
            // commas are dropped so "$50,000" stays one token
            sanitized.push(' ');
        }
    }
    sanitized
        .split_whitespace()
        .map(|token| token.trim_matches('.').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

const EVENT_TYPES: &[(&str, &str)] = &[
    ("conference", "conference"),
    ("wedding", "wedding"),
    ("gala", "gala"),
    ("summit", "summit"),
    ("workshop", "workshop"),
    ("meetup", "meetup"),
    ("retreat", "retreat"),
    ("offsite", "offsite"),
    ("festival", "festival"),
    ("concert", "concert"),
    ("seminar", "seminar"),
    ("webinar", "webinar"),
    ("hackathon", "hackathon"),
    ("fundraiser", "fundraiser"),
    ("launch", "product launch"),
    ("expo", "trade show"),
    ("tradeshow", "trade show"),
    ("party", "party"),
    ("banquet", "banquet"),
];

fn extract_event_type(tokens: &[String]) -> Option<String> {
    for (index, token) in tokens.iter().enumerate() {
        if token == "trade" && tokens.get(index + 1).is_some_and(|next| next == "show") {
            return Some("trade show".to_string());
        }
        let singular = token.strip_suffix('s').unwrap_or(token);
        if let Some((_, label)) =
            EVENT_TYPES.iter().find(|(keyword, _)| *keyword == token || *keyword == singular)
        {
            return Some((*label).to_string());
        }
    }
    None
}

fn extract_attendees(tokens: &[String]) -> Option<u32> {
    for window in tokens.windows(2) {
        if let [value, unit] = window {
            if !is_attendee_unit(unit) {
                continue;
            }
            if let Ok(count) = value.parse::<u32>() {
                if count > 0 {
                    return Some(count);
                }
            }
        }
    }
    None
}

fn is_attendee_unit(token: &str) -> bool {
    matches!(
        token,
        "people"
            | "person"
            | "persons"
            | "guest"
            | "guests"
            | "attendee"
            | "attendees"
            | "participant"
            | "participants"
            | "delegate"
            | "delegates"
            | "pax"
            | "heads"
    )
}

fn extract_budget_cents(tokens: &[String]) -> Option<i64> {
    let budget_context = ["budget", "spend", "cap", "under", "below", "max"];
    for (index, token) in tokens.iter().enumerate() {
        let next = tokens.get(index + 1).map(String::as_str);
        if next.is_some_and(is_attendee_unit) {
            continue;
        }
        let in_context = index > 0 && budget_context.contains(&tokens[index - 1].as_str());
        let followed_by_dollars = matches!(next, Some("dollars" | "usd"));
        if token.starts_with('$') || in_context || followed_by_dollars {
            if let Some(cents) = parse_money_token(token) {
                return Some(cents);
            }
        }
    }
    None
}

fn parse_money_token(token: &str) -> Option<i64> {
    let trimmed = token.trim_start_matches('$');
    if trimmed.is_empty() {
        return None;
    }

    let (number_part, multiplier) = if let Some(prefix) = trimmed.strip_suffix('k') {
        (prefix, 1_000.0)
    } else if let Some(prefix) = trimmed.strip_suffix('m') {
        (prefix, 1_000_000.0)
    } else {
        (trimmed, 1.0)
    };

    if !is_plain_decimal(number_part) {
        return None;
    }
    let amount = number_part.parse::<f64>().ok()?;
    if amount <= 0.0 {
        return None;
    }
    let cents = (amount * multiplier * 100.0).round();
    if !cents.is_finite() || cents >= i64::MAX as f64 {
        return None;
    }
    Some(cents as i64)
}

/// Digits with at most one decimal point; rules out `nan`, `inf` and exponents.
fn is_plain_decimal(value: &str) -> bool {
    let mut seen_point = false;
    let mut seen_digit = false;
    for ch in value.chars() {
        match ch {
            '0'..='9' => seen_digit = true,
            '.' if !seen_point => seen_point = true,
            _ => return false,
        }
    }
    seen_digit
}

fn format_dollars(cents: i64) -> String {
    let dollars = cents / 100;
    let remainder = cents % 100;
    let digits = dollars.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if remainder == 0 {
        format!("${grouped}")
    } else {
        format!("${grouped}.{remainder:02}")
    }
}

const MONTHS: &[&str] = &[
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const SEASONS: &[&str] = &["spring", "summer", "fall", "autumn", "winter"];

fn extract_timeline(tokens: &[String]) -> Option<String> {
    for window in tokens.windows(3) {
        if let [preposition, count, unit] = window {
            let relative_unit = matches!(
                unit.as_str(),
                "day" | "days" | "week" | "weeks" | "month" | "months" | "year" | "years"
            );
            if preposition == "in" && relative_unit && count.parse::<u32>().is_ok() {
                return Some(format!("in {count} {unit}"));
            }
        }
    }

    for window in tokens.windows(2) {
        if let [lead, unit] = window {
            let anchored = matches!(lead.as_str(), "next" | "this" | "early" | "late");
            let period = matches!(unit.as_str(), "week" | "month" | "quarter" | "year")
                || SEASONS.contains(&unit.as_str());
            if anchored && period {
                return Some(format!("{lead} {unit}"));
            }
        }
    }

    for (index, token) in tokens.iter().enumerate() {
        if matches!(token.as_str(), "q1" | "q2" | "q3" | "q4") {
            return Some(with_year(token.to_ascii_uppercase(), tokens.get(index + 1)));
        }
        // "may" is too often a verb to count on its own
        if MONTHS.contains(&token.as_str()) && token != "may" {
            return Some(with_year(token.clone(), tokens.get(index + 1)));
        }
        if SEASONS.contains(&token.as_str()) {
            return Some(with_year(token.clone(), tokens.get(index + 1)));
        }
    }
    None
}

fn with_year(period: String, next: Option<&String>) -> String {
    match next.filter(|candidate| is_year(candidate)) {
        Some(year) => format!("{period} {year}"),
        None => period,
    }
}

fn is_year(token: &str) -> bool {
    token.len() == 4 && token.starts_with("20") && token.chars().all(|c| c.is_ascii_digit())
}

/// Capitalized words following "in" or "at", taken from the original casing.
fn extract_location(text: &str) -> Option<String> {
    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '!' | '?' | '(' | ')'))
        .filter(|word| !word.is_empty())
        .collect();

    for (index, word) in words.iter().enumerate() {
        if !matches!(word.to_ascii_lowercase().as_str(), "in" | "at") {
            continue;
        }

        let mut cursor = index + 1;
        if words.get(cursor).is_some_and(|next| next.eq_ignore_ascii_case("the")) {
            cursor += 1;
        }

        let mut place = Vec::new();
        while let Some(candidate) = words.get(cursor) {
            let trimmed = candidate.trim_end_matches('.');
            if !is_place_word(trimmed) || place.len() == 3 {
                break;
            }
            place.push(trimmed);
            cursor += 1;
            if trimmed.len() != candidate.len() {
                break;
            }
        }

        if !place.is_empty() {
            return Some(place.join(" "));
        }
    }
    None
}

fn is_place_word(word: &str) -> bool {
    let starts_upper = word.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    let lowered = word.to_ascii_lowercase();
    starts_upper
        && word.chars().all(|c| c.is_alphabetic() || matches!(c, '-' | '\'' | '.'))
        && !MONTHS.contains(&lowered.as_str())
        && !SEASONS.contains(&lowered.as_str())
        && !matches!(lowered.as_str(), "q1" | "q2" | "q3" | "q4" | "i")
}
