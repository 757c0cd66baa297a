use chrono::{DateTime, Utc, Weekday};

/// One observation routed to a (point, weekday) bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Running summary for one (point, weekday) pair.
///
/// The optional scalars are `None` until the first merge lands. `evaluations`
/// counts merges, `count` counts samples, and `evaluations` doubles as the
/// row version that [`super::store::AggregateStore::save`] compares against.
#[derive(Clone, Debug, PartialEq)]
pub struct WeekdayAggregate {
    pub id: i64,
    pub point_id: u32,
    pub day_of_week: Weekday,
    pub last_updated: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub evaluations: i64,
    pub count: i64,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl WeekdayAggregate {
    pub fn empty(id: i64, point_id: u32, day_of_week: Weekday, now: DateTime<Utc>) -> Self {
        Self {
            id,
            point_id,
            day_of_week,
            last_updated: now,
            start: None,
            end: None,
            evaluations: 0,
            count: 0,
            sum: None,
            mean: None,
            std_dev: None,
            min: None,
            max: None,
        }
    }
}

/// Monday-first 0-6 encoding used by the persisted schema and the wire protocol.
pub fn weekday_index(day: Weekday) -> i16 {
    day.num_days_from_monday() as i16
}

pub fn weekday_from_index(index: i64) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}
