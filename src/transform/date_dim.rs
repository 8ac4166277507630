use chrono::{Datelike, NaiveDate, Weekday};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::constants::{DATE_DIMENSION, DATE_KEY_COLUMN, LOADED_AT_COLUMN, SOURCE_COLUMN};
use crate::keys::generate_date_key;
use crate::table::{Table, TableKind};

const COLUMNS: [&str; 15] = [
    DATE_KEY_COLUMN,
    "full_date",
    "year",
    "quarter",
    "month",
    "month_name",
    "week_of_year",
    "day_of_month",
    "day_of_week",
    "day_name",
    "is_weekend",
    "is_month_start",
    "is_month_end",
    LOADED_AT_COLUMN,
    SOURCE_COLUMN,
];

fn last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt().map_or(true, |next| next.month() != date.month())
}

/// Date dimension covering exactly the observed dates, in ascending order.
pub fn build_date_dimension(dates: &BTreeSet<NaiveDate>, loaded_at: &str) -> Table {
    let mut table = Table::new(
        DATE_DIMENSION,
        TableKind::Dimension,
        COLUMNS.iter().map(|c| c.to_string()).collect(),
    );
    for date in dates {
        let Some(key) = generate_date_key(*date) else {
            continue;
        };
        let weekday = date.weekday();
        table.rows.push(vec![
            json!(key),
            json!(date.format("%Y-%m-%d").to_string()),
            json!(date.year()),
            json!((date.month() - 1) / 3 + 1),
            json!(date.month()),
            json!(date.format("%B").to_string()),
            json!(date.iso_week().week()),
            json!(date.day()),
            json!(weekday.number_from_monday()),
            json!(date.format("%A").to_string()),
            json!(matches!(weekday, Weekday::Sat | Weekday::Sun)),
            json!(date.day() == 1),
            json!(last_day_of_month(*date)),
            Value::String(loaded_at.to_string()),
            json!("generated"),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calendar_attributes() {
        let dates: BTreeSet<_> = [
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 6).unwrap(),
        ]
        .into_iter()
        .collect();
        let table = build_date_dimension(&dates, "2024-03-01T00:00:00Z");
        assert_eq!(table.len(), 2);

        let jan = table.row_as_record(0).unwrap();
        assert_eq!(jan["date_key"], json!(20240106));
        assert_eq!(jan["day_name"], json!("Saturday"));
        assert_eq!(jan["is_weekend"], json!(true));
        assert_eq!(jan["quarter"], json!(1));

        let leap = table.row_as_record(1).unwrap();
        assert_eq!(leap["month_name"], json!("February"));
        assert_eq!(leap["is_month_end"], json!(true));
        assert_eq!(leap["is_month_start"], json!(false));
    }

    #[test]
    fn test_empty_input_gives_empty_table_with_columns() {
        let table = build_date_dimension(&BTreeSet::new(), "x");
        assert!(table.is_empty());
        assert_eq!(table.columns.len(), COLUMNS.len());
    }
}
