// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::digit1,
    combinator::{all_consuming, map, opt, recognize},
    error::Error as NomError,
    multi::many1,
    sequence::{pair, preceded},
};

const NS_PER_MS: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationValue {
    nanos: i64,
}

impl DurationValue {
    pub fn new(nanos: i64) -> Result<Self, String> {
        if nanos <= 0 {
            return Err("duration must be positive".into());
        }
        Ok(Self { nanos })
    }

    /// Parses Prometheus-style literals such as `5m`, `1h30m` or `250ms`.
    pub fn parse_literal(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("duration cannot be empty".into());
        }
        let (_, parts) = all_consuming(many1(duration_part))
            .parse(trimmed)
            .map_err(|_| format!("`{trimmed}` is not a duration literal"))?;
        let mut total = 0f64;
        for (amount, unit) in parts {
            let value: f64 = amount
                .parse()
                .map_err(|err| format!("invalid duration amount `{amount}`: {err}"))?;
            total += value * unit.millis() * NS_PER_MS;
        }
        if !total.is_finite() || total > i64::MAX as f64 {
            return Err(format!("duration `{trimmed}` exceeds supported range"));
        }
        Self::new(total.round() as i64)
    }

    pub fn as_nanoseconds(&self) -> i64 {
        self.nanos
    }

    pub fn as_millis(&self) -> i64 {
        self.nanos / 1_000_000
    }
}

#[derive(Debug, Clone, Copy)]
enum DurationUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Year,
}

impl DurationUnit {
    fn millis(self) -> f64 {
        match self {
            DurationUnit::Millisecond => 1.0,
            DurationUnit::Second => 1_000.0,
            DurationUnit::Minute => 60_000.0,
            DurationUnit::Hour => 3_600_000.0,
            DurationUnit::Day => 86_400_000.0,
            DurationUnit::Week => 604_800_000.0,
            DurationUnit::Year => 31_536_000_000.0,
        }
    }
}

fn duration_part(input: &str) -> IResult<&str, (&str, DurationUnit), NomError<&str>> {
    pair(
        recognize(pair(digit1, opt(preceded(tag("."), digit1)))),
        alt((
            map(tag("ms"), |_| DurationUnit::Millisecond),
            map(tag("s"), |_| DurationUnit::Second),
            map(tag("m"), |_| DurationUnit::Minute),
            map(tag("h"), |_| DurationUnit::Hour),
            map(tag("d"), |_| DurationUnit::Day),
            map(tag("w"), |_| DurationUnit::Week),
            map(tag("y"), |_| DurationUnit::Year),
        )),
    )
    .parse(input)
}

pub fn is_duration_literal(raw: &str) -> bool {
    DurationValue::parse_literal(raw).is_ok()
}
