// src/planner/catalog.rs

//! Deterministic price and attraction tables standing in for external
//! lookup services.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTable {
    pub flight: (u32, u32),
    pub hotel_per_night: (u32, u32),
    pub daily: u32,
}

const DEFAULT_PRICES: PriceTable = PriceTable {
    flight: (800, 2000),
    hotel_per_night: (300, 800),
    daily: 300,
};

const DESTINATIONS: &[(&str, PriceTable)] = &[
    ("Yunnan", PriceTable { flight: (1200, 2500), hotel_per_night: (400, 1000), daily: 300 }),
    ("Beijing", PriceTable { flight: (800, 1800), hotel_per_night: (500, 1200), daily: 350 }),
    ("Shanghai", PriceTable { flight: (600, 1500), hotel_per_night: (600, 1500), daily: 400 }),
    ("Sanya", PriceTable { flight: (1500, 3000), hotel_per_night: (800, 2000), daily: 450 }),
    ("Xian", PriceTable { flight: (1000, 2000), hotel_per_night: (300, 800), daily: 250 }),
    ("Europe", PriceTable { flight: (8000, 15000), hotel_per_night: (1200, 3000), daily: 800 }),
    ("Japan", PriceTable { flight: (3000, 6000), hotel_per_night: (800, 2000), daily: 600 }),
    ("Korea", PriceTable { flight: (2000, 4000), hotel_per_night: (600, 1500), daily: 500 }),
    ("Singapore", PriceTable { flight: (3500, 6500), hotel_per_night: (1000, 2500), daily: 700 }),
];

const ATTRACTIONS: &[(&str, &[&str])] = &[
    ("Yunnan", &["Lijiang Old Town", "Jade Dragon Snow Mountain", "Erhai Lake", "Shangri-La", "Xishuangbanna Rainforest"]),
    ("Beijing", &["Forbidden City", "Great Wall", "Tiananmen Square", "Summer Palace", "Temple of Heaven"]),
    ("Shanghai", &["The Bund", "Disneyland", "Oriental Pearl Tower", "Nanjing Road", "Yu Garden"]),
    ("Sanya", &["Yalong Bay", "Tianya Haijiao", "Nanshan Temple", "Wuzhizhou Island", "Daxiaodongtian"]),
    ("Xian", &["Terracotta Army", "Big Wild Goose Pagoda", "City Wall", "Huaqing Palace", "Bell and Drum Towers"]),
];

const GENERIC_ATTRACTIONS: &[&str] = &["Old town walk", "Local museum", "Scenic park"];

pub const RESTRICTED: &[&str] = &["North Korea", "Afghanistan", "Syria"];
pub const POPULAR: &[&str] = &["Japan", "Korea", "Thailand", "Singapore", "Malaysia"];
pub const INTERNATIONAL: &[&str] = &["Europe", "Japan", "Korea", "Singapore", "Thailand", "USA"];
pub const DOMESTIC: &[&str] = &["Yunnan", "Beijing", "Shanghai", "Sanya", "Xian", "Guangzhou", "Chengdu"];

/// Destination names the request parser recognises.
pub fn known_destinations() -> impl Iterator<Item = &'static str> {
    DESTINATIONS
        .iter()
        .map(|(name, _)| *name)
        .chain(RESTRICTED.iter().copied())
}

pub fn prices(destination: &str) -> PriceTable {
    DESTINATIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(destination))
        .map(|(_, table)| *table)
        .unwrap_or(DEFAULT_PRICES)
}

pub fn daily_expense(destination: &str) -> u32 {
    prices(destination).daily
}

fn midpoint((low, high): (u32, u32)) -> u32 {
    low + (high - low) / 2
}

fn is_peak(travel_date: Option<&str>) -> bool {
    travel_date.is_some_and(|d| {
        let d = d.to_lowercase();
        d.contains("spring festival") || d.contains("national day")
    })
}

fn wants(requirements: &[String], keyword: &str) -> bool {
    requirements.iter().any(|r| r.to_lowercase().contains(keyword))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightQuote {
    pub destination: String,
    pub price: u32,
    pub airlines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelQuote {
    pub destination: String,
    pub price_per_night: u32,
    pub nights: u32,
    pub total_price: u32,
    pub recommended: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttractionList {
    pub destination: String,
    pub attractions: Vec<String>,
    pub daily_plans: Vec<String>,
}

pub fn quote_flight(destination: &str, travel_date: Option<&str>, requirements: &[String]) -> FlightQuote {
    let mut price = midpoint(prices(destination).flight);
    if is_peak(travel_date) {
        price = price * 3 / 2;
    }
    if wants(requirements, "first class") {
        price = price * 5 / 2;
    } else if wants(requirements, "luxury") {
        price = price * 9 / 5;
    }
    FlightQuote {
        destination: destination.to_string(),
        price,
        airlines: vec!["China Eastern".into(), "Air China".into()],
    }
}

pub fn quote_hotel(destination: &str, days: u32, requirements: &[String]) -> HotelQuote {
    let mut per_night = midpoint(prices(destination).hotel_per_night);
    if wants(requirements, "five-star") {
        per_night *= 3;
    } else if wants(requirements, "luxury") {
        per_night *= 2;
    }
    let nights = days.saturating_sub(1);
    HotelQuote {
        destination: destination.to_string(),
        price_per_night: per_night,
        nights,
        total_price: per_night * nights,
        recommended: format!("{destination} central hotel"),
    }
}

pub fn list_attractions(destination: &str, days: u32) -> AttractionList {
    let pool: &[&str] = ATTRACTIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(destination))
        .map(|(_, list)| *list)
        .unwrap_or(GENERIC_ATTRACTIONS);

    let daily_plans = (0..days as usize)
        .map(|i| format!("Day {}: {}", i + 1, pool[i % pool.len()]))
        .collect();

    AttractionList {
        destination: destination.to_string(),
        attractions: pool
            .iter()
            .take(days as usize + 2)
            .map(|s| s.to_string())
            .collect(),
        daily_plans,
    }
}
