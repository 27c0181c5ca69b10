use std::fmt;
use std::str::FromStr;

use aws_cfn_stack::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    Minutes,
    Hours,
    Days,
}

impl RateUnit {
    fn as_str(&self, value: u32) -> &'static str {
        match (self, value == 1) {
            (RateUnit::Minutes, true) => "minute",
            (RateUnit::Minutes, false) => "minutes",
            (RateUnit::Hours, true) => "hour",
            (RateUnit::Hours, false) => "hours",
            (RateUnit::Days, true) => "day",
            (RateUnit::Days, false) => "days",
        }
    }
}

/// the six fields of an eventbridge cron expression:
/// minutes, hours, day-of-month, month, day-of-week, year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    pub minutes: String,
    pub hours: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
    pub year: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronExpression),
    Rate(u32, RateUnit),
}

fn invalid(expr: &str, reason: &str) -> Error {
    Error::InvalidInput(format!("Invalid schedule expression {:?}\n{}", expr, reason))
}

fn valid_field(field: &str, allow_question: bool) -> bool {
    if field == "?" {
        return allow_question;
    }
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ',' | '-' | '*' | '/' | '#'))
}

impl FromStr for CronExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [minutes, hours, day_of_month, month, day_of_week, year] = fields[..] else {
            return Err(invalid(s, "cron expressions must have exactly 6 fields"));
        };
        if (day_of_month == "?") == (day_of_week == "?") {
            return Err(invalid(s, "exactly one of day-of-month or day-of-week must be '?'"));
        }
        let checks = [
            (minutes, false), (hours, false), (day_of_month, true),
            (month, false), (day_of_week, true), (year, false),
        ];
        if let Some((field, _)) = checks.iter().find(|(field, q)| !valid_field(field, *q)) {
            return Err(invalid(s, &format!("invalid cron field {:?}", field)));
        }
        Ok(CronExpression {
            minutes: minutes.to_string(),
            hours: hours.to_string(),
            day_of_month: day_of_month.to_string(),
            month: month.to_string(),
            day_of_week: day_of_week.to_string(),
            year: year.to_string(),
        })
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("cron(").and_then(|r| r.strip_suffix(')')) {
            return Ok(Schedule::Cron(inner.parse()?));
        }
        let Some(inner) = s.strip_prefix("rate(").and_then(|r| r.strip_suffix(')')) else {
            return Err(invalid(s, "must be cron(...) or rate(...)"));
        };
        let Some((value, unit)) = inner.trim().split_once(' ') else {
            return Err(invalid(s, "rate expressions look like rate(5 minutes)"));
        };
        let value: u32 = value.parse().map_err(|_| invalid(s, "rate value must be a positive integer"))?;
        if value < 1 {
            return Err(invalid(s, "rate value must be >= 1"));
        }
        let unit = match unit.trim() {
            "minute" | "minutes" => RateUnit::Minutes,
            "hour" | "hours" => RateUnit::Hours,
            "day" | "days" => RateUnit::Days,
            other => return Err(invalid(s, &format!("Invalid unit {:?}. Must be either minutes, hours, or days", other))),
        };
        if unit.as_str(value) != unit_str(inner) {
            return Err(invalid(s, &format!("a rate of {} must use the unit {:?}", value, unit.as_str(value))));
        }
        Ok(Schedule::Rate(value, unit))
    }
}

fn unit_str(inner: &str) -> &str {
    inner.trim().split_once(' ').map(|(_, u)| u.trim()).unwrap_or_default()
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {} {} {}", self.minutes, self.hours, self.day_of_month, self.month, self.day_of_week, self.year)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(expr) => write!(f, "cron({expr})"),
            Schedule::Rate(value, unit) => write!(f, "rate({} {})", value, unit.as_str(*value)),
        }
    }
}
