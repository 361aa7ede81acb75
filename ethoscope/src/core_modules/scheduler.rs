// THEORY:
// The scheduler is the time gate of a stimulator. It parses a short textual
// description of allowed wall-clock windows, e.g.
//
//     "2024-01-01 20:00:00 > 2024-01-02 08:00:00, 2024-01-03 20:00:00 >"
//
// and answers "is `t` inside one of them?". Either side of a window can be
// empty, meaning the beginning or the end of time. The string format is
// shared with configuration files and the device's control interface, so
// parsing is strict: malformed windows, windows that end before they start,
// and overlapping windows are all rejected at construction.
//
// The segmented scheduler adds, per window, a program of breakpoints
// "HOURS > DURATION_MS; HOURS > DURATION_MS" telling the stimulator which
// pulse duration to use as the treatment progresses.

use crate::error::ScheduleError;
use chrono::{Local, NaiveDateTime, TimeZone};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Converts a `YYYY-MM-DD HH:MM:SS` local wall-clock time to unix seconds.
pub fn timestamp_of(date: &str) -> Result<f64, ScheduleError> {
    let naive = NaiveDateTime::parse_from_str(date.trim(), DATE_FORMAT).map_err(|e| {
        ScheduleError::date_range(date, format!("does not match {DATE_FORMAT}: {e}"))
    })?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ScheduleError::date_range(date, "does not exist in the local time zone"))?;
    Ok(local.timestamp() as f64)
}

/// Disjoint, chronologically ordered allowed windows in unix seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduler {
    ranges: Vec<(f64, f64)>,
}

impl Scheduler {
    pub fn new(date_ranges: &str) -> Result<Self, ScheduleError> {
        let ranges = date_ranges
            .split(',')
            .map(parse_date_range)
            .collect::<Result<Vec<_>, _>>()?;

        let boundaries: Vec<f64> = ranges.iter().flat_map(|&(s, e)| [s, e]).collect();
        if boundaries.windows(2).any(|w| w[1] - w[0] <= 0.0) {
            return Err(ScheduleError::date_range(date_ranges, "some date ranges overlap"));
        }

        Ok(Self { ranges })
    }

    /// A scheduler that is always in range.
    pub fn always() -> Self {
        Self {
            ranges: vec![(0.0, f64::INFINITY)],
        }
    }

    pub fn ranges(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    /// True iff `start < t < end` for some window.
    pub fn check_time_range(&self, t: f64) -> bool {
        self.range_index(t).is_some()
    }

    fn range_index(&self, t: f64) -> Option<usize> {
        self.ranges.iter().position(|&(start, end)| start < t && t < end)
    }
}

fn parse_date_range(range: &str) -> Result<(f64, f64), ScheduleError> {
    let parts: Vec<&str> = range.split('>').map(str::trim).collect();
    if parts.len() > 2 {
        return Err(ScheduleError::date_range(
            range,
            "found several '>' symbols, only one is allowed",
        ));
    }

    let parse_side = |s: &str| -> Result<Option<f64>, ScheduleError> {
        if s.is_empty() {
            Ok(None)
        } else {
            timestamp_of(s).map(Some)
        }
    };

    let out = match parts.as_slice() {
        [single] => (parse_side(single)?.unwrap_or(0.0), f64::INFINITY),
        [start, end] => match (parse_side(start)?, parse_side(end)?) {
            (None, None) => {
                return Err(ScheduleError::date_range(
                    range,
                    "a date range cannot have both sides empty",
                ));
            }
            (None, Some(e)) => (0.0, e),
            (Some(s), None) => (s, f64::INFINITY),
            (Some(s), Some(e)) => (s, e),
        },
        _ => return Err(ScheduleError::date_range(range, "unexpected date string")),
    };

    if out.0 >= out.1 {
        return Err(ScheduleError::date_range(
            range,
            "the end date is not after the start date",
        ));
    }
    Ok(out)
}

/// One treatment program: `(hours_since_range_start, duration_ms)` breakpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub breakpoints: Vec<(f64, u32)>,
}

/// Parses `"0 > 500; 3 > 1000"`. Hours must be strictly increasing.
pub fn parse_program(program: &str) -> Result<Program, ScheduleError> {
    let mut breakpoints: Vec<(f64, u32)> = Vec::new();

    for step in program.split(';') {
        let (hours, duration) = step
            .split_once('>')
            .ok_or_else(|| ScheduleError::program(program, format!("step '{}' has no '>'", step.trim())))?;
        let hours: f64 = hours
            .trim()
            .parse()
            .map_err(|_| ScheduleError::program(program, format!("'{}' is not a number of hours", hours.trim())))?;
        let duration: u32 = duration
            .trim()
            .parse()
            .map_err(|_| ScheduleError::program(program, format!("'{}' is not a duration in ms", duration.trim())))?;

        if let Some(&(previous, _)) = breakpoints.last() {
            if hours <= previous {
                return Err(ScheduleError::program(
                    program,
                    "time points must be strictly increasing with no duplicates",
                ));
            }
        }
        breakpoints.push((hours, duration));
    }

    Ok(Program { breakpoints })
}

/// A scheduler with a duration program per window.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedScheduler {
    scheduler: Scheduler,
    programs: Vec<Program>,
}

impl SegmentedScheduler {
    /// `programs` holds one program per window, separated by `,`. Empty means no override.
    pub fn new(ranges: &str, programs: &str) -> Result<Self, ScheduleError> {
        let scheduler = Scheduler::new(ranges)?;
        let programs = if programs.trim().is_empty() {
            Vec::new()
        } else {
            programs
                .split(',')
                .map(parse_program)
                .collect::<Result<Vec<_>, _>>()?
        };

        if !programs.is_empty() && programs.len() != scheduler.ranges.len() {
            return Err(ScheduleError::program(
                format!("{} programs", programs.len()),
                format!("expected one program per date range ({})", scheduler.ranges.len()),
            ));
        }

        Ok(Self { scheduler, programs })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn check_time_range(&self, t: f64) -> bool {
        self.scheduler.check_time_range(t)
    }

    /// The duration that applies at `t`, or `None` when `t` is outside every window.
    pub fn check_duration(&self, t: f64) -> Option<u32> {
        let index = self.scheduler.range_index(t)?;
        let program = self.programs.get(index)?;
        let start = self.scheduler.ranges[index].0;
        let hours_since_start = (t - start) / 3600.0;

        let first = program.breakpoints.first()?;
        let active = program
            .breakpoints
            .iter()
            .rev()
            .find(|(hours, _)| *hours <= hours_since_start)
            .unwrap_or(first);
        Some(active.1)
    }
}
