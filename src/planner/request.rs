// src/planner/request.rs

//! Free-text trip request parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StepflowError};
use crate::planner::catalog;

/// Fields extracted so far. Kept in the run state between prompts so that
/// answers to follow-up questions fill the gaps one by one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub destination: Option<String>,
    pub days: Option<u32>,
    pub budget: Option<f64>,
    pub travel_date: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Destination,
    Days,
    Budget,
}

impl Field {
    pub fn key(self) -> &'static str {
        match self {
            Field::Destination => "destination",
            Field::Days => "days",
            Field::Budget => "budget",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            Field::Destination => "Where would you like to go?",
            Field::Days => "How many days is the trip?",
            Field::Budget => "What is your budget?",
        }
    }
}

/// A request with every required field present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelInfo {
    pub destination: String,
    pub days: u32,
    pub budget: f64,
    pub travel_date: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl TripRequest {
    pub fn missing(&self) -> Vec<Field> {
        let mut missing = Vec::new();
        if self.destination.is_none() {
            missing.push(Field::Destination);
        }
        if self.days.is_none() {
            missing.push(Field::Days);
        }
        if self.budget.is_none() {
            missing.push(Field::Budget);
        }
        missing
    }

    pub fn complete(&self) -> Option<TravelInfo> {
        Some(TravelInfo {
            destination: self.destination.clone()?,
            days: self.days?,
            budget: self.budget?,
            travel_date: self.travel_date.clone(),
            requirements: self.requirements.clone(),
        })
    }

    /// Fill any missing required field with the stock defaults.
    pub fn with_defaults(mut self) -> Self {
        self.destination.get_or_insert_with(|| "Yunnan".to_string());
        self.days.get_or_insert(5);
        self.budget.get_or_insert(5000.0);
        self
    }
}

/// Regex-based extractor for destination, duration, budget and extras.
#[derive(Debug, Clone)]
pub struct RequestParser {
    days: Regex,
    budget: Regex,
    bare_amount: Regex,
    destination: Regex,
    date: Regex,
    requirements: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| StepflowError::Configuration(format!("invalid request pattern: {e}")))
}

impl RequestParser {
    pub fn new() -> Result<Self> {
        let names: Vec<String> = catalog::known_destinations().map(regex::escape).collect();
        Ok(Self {
            days: compile(r"(?i)\b(\d{1,3})\s*(?:-\s*)?days?\b")?,
            budget: compile(
                r"(?i)(?:budget(?:\s+of|\s+is)?\s*:?\s*|\$|¥)\s*(\d+(?:\.\d+)?)\s*(k|w)?\b",
            )?,
            bare_amount: compile(r"(?i)\b(\d+(?:\.\d+)?)\s*(k|w)?\s*(?:yuan|rmb|cny|dollars?)\b")?,
            destination: compile(&format!(r"(?i)\b({})\b", names.join("|")))?,
            date: compile(r"(?i)\b(spring festival|national day|next (?:week|month)|summer|winter)\b")?,
            requirements: compile(
                r"(?i)\b(luxury|five-star|first class|family|culture|nature|budget-friendly)\b",
            )?,
        })
    }

    pub fn parse(&self, text: &str) -> TripRequest {
        let mut request = TripRequest::default();
        self.fill(&mut request, text);
        request
    }

    /// Merge whatever `text` mentions into `request`, leaving known fields
    /// untouched.
    pub fn fill(&self, request: &mut TripRequest, text: &str) {
        if request.destination.is_none() {
            request.destination = self.destination(text);
        }
        if request.days.is_none() {
            request.days = self
                .days
                .captures(text)
                .and_then(|c| c[1].parse().ok())
                .filter(|d| *d > 0);
        }
        if request.budget.is_none() {
            request.budget = self.amount(&self.budget, text).or_else(|| self.amount(&self.bare_amount, text));
        }
        if request.travel_date.is_none() {
            request.travel_date = self.date.captures(text).map(|c| c[1].to_lowercase());
        }
        for cap in self.requirements.captures_iter(text) {
            let req = cap[1].to_lowercase();
            if !request.requirements.contains(&req) {
                request.requirements.push(req);
            }
        }
    }

    /// Interpret a follow-up answer for one specific field, accepting
    /// bare values ("Japan", "7", "12000").
    pub fn answer(&self, request: &mut TripRequest, field: Field, text: &str) {
        let text = text.trim();
        self.fill(request, text);
        match field {
            Field::Destination if request.destination.is_none() && !text.is_empty() => {
                request.destination = Some(text.to_string());
            }
            Field::Days if request.days.is_none() => {
                request.days = leading_number(text).map(|n| n as u32).filter(|d| *d > 0);
            }
            Field::Budget if request.budget.is_none() => {
                request.budget = leading_number(text).filter(|b| *b > 0.0);
            }
            _ => {}
        }
    }

    fn destination(&self, text: &str) -> Option<String> {
        let found = self.destination.captures(text)?;
        let raw = &found[1];
        catalog::known_destinations()
            .find(|name| name.eq_ignore_ascii_case(raw))
            .map(str::to_string)
    }

    fn amount(&self, re: &Regex, text: &str) -> Option<f64> {
        let cap = re.captures(text)?;
        let value: f64 = cap[1].parse().ok()?;
        let scale = match cap.get(2).map(|m| m.as_str().to_lowercase()) {
            Some(s) if s == "k" => 1_000.0,
            Some(s) if s == "w" => 10_000.0,
            _ => 1.0,
        };
        Some(value * scale)
    }
}

fn leading_number(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}
