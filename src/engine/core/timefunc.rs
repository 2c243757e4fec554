// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: Piecewise-linear forcing series with monotone cursors and cached interpolation
// ABOUTME: Also provides the piecewise-constant interval schedules used for dt and print control

use super::error::{Result, TrexError};

/// One piecewise-linear time series: (time, value) pairs in ascending time
/// plus a monotone cursor with the current interval's slope and intercept
/// cached so per-step evaluation is a multiply-add, not a table search.
///
/// Times are hours past simulation time zero. Outside the table the series
/// extrapolates as a constant from the nearest endpoint.
#[derive(Clone, Debug)]
pub struct TimeFunction {
    times: Vec<f64>,
    values: Vec<f64>,
    cursor: usize,
    slope: f64,
    intercept: f64,
    /// Simulation time (hours) at which the cursor must advance next.
    next_update: f64,
}

impl TimeFunction {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if times.is_empty() || times.len() != values.len() {
            return Err(TrexError::Validation(format!(
                "time function needs matching non-empty time/value lists (got {} times, {} values)",
                times.len(),
                values.len()
            )));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(TrexError::Validation(
                "time function times must be strictly ascending".to_string(),
            ));
        }
        let mut f = Self {
            times,
            values,
            cursor: 0,
            slope: 0.0,
            intercept: 0.0,
            next_update: 0.0,
        };
        f.recache();
        Ok(f)
    }

    /// A series that holds one value for all time.
    pub fn constant(value: f64) -> Self {
        Self {
            times: vec![0.0],
            values: vec![value],
            cursor: 0,
            slope: 0.0,
            intercept: value,
            next_update: f64::INFINITY,
        }
    }

    fn recache(&mut self) {
        let i = self.cursor;
        if i + 1 < self.times.len() {
            let dt = self.times[i + 1] - self.times[i];
            self.slope = (self.values[i + 1] - self.values[i]) / dt;
            self.intercept = self.values[i];
            self.next_update = self.times[i + 1];
        } else {
            self.slope = 0.0;
            self.intercept = self.values[i];
            self.next_update = f64::INFINITY;
        }
    }

    /// Advance the cursor past every interval boundary crossed by `time`.
    /// Cursors never rewind in a forward run.
    pub fn update(&mut self, time: f64) {
        while time >= self.next_update && self.cursor + 1 < self.times.len() {
            self.cursor += 1;
            self.recache();
        }
    }

    /// Interpolated value at `time` using the cached interval.
    pub fn value(&self, time: f64) -> f64 {
        if time <= self.times[self.cursor] {
            // before the cached interval start (includes pre-table times)
            if self.cursor == 0 && time < self.times[0] {
                return self.values[0];
            }
            return self.intercept;
        }
        if self.next_update.is_infinite() {
            return self.intercept;
        }
        self.intercept + self.slope * (time - self.times[self.cursor])
    }

    /// Reseed the cursor by binary search, for restart initialization.
    pub fn seek(&mut self, time: f64) {
        self.cursor = match self
            .times
            .binary_search_by(|t| t.partial_cmp(&time).expect("non-NaN times"))
        {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        self.recache();
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn next_update(&self) -> f64 {
        self.next_update
    }

    /// Last tabulated time (hours).
    pub fn end_time(&self) -> f64 {
        *self.times.last().expect("non-empty table")
    }
}

/// A piecewise-constant schedule: values each holding until their end
/// time. Used for the user dt series and for output print intervals.
#[derive(Clone, Debug)]
pub struct IntervalSchedule {
    values: Vec<f64>,
    /// Time (hours) up to which each value applies.
    end_times: Vec<f64>,
    cursor: usize,
}

impl IntervalSchedule {
    pub fn new(values: Vec<f64>, end_times: Vec<f64>) -> Result<Self> {
        if values.is_empty() || values.len() != end_times.len() {
            return Err(TrexError::Validation(format!(
                "interval schedule needs matching non-empty value/end-time lists (got {} values, {} times)",
                values.len(),
                end_times.len()
            )));
        }
        if end_times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(TrexError::Validation(
                "interval schedule end times must be strictly ascending".to_string(),
            ));
        }
        Ok(Self {
            values,
            end_times,
            cursor: 0,
        })
    }

    pub fn constant(value: f64) -> Self {
        Self {
            values: vec![value],
            end_times: vec![f64::INFINITY],
            cursor: 0,
        }
    }

    /// Value in effect at the current cursor position.
    pub fn current(&self) -> f64 {
        self.values[self.cursor]
    }

    /// Advance the cursor when `time` passes the current interval's end.
    pub fn advance(&mut self, time: f64) {
        while self.cursor + 1 < self.values.len() && time >= self.end_times[self.cursor] {
            self.cursor += 1;
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, time: f64) {
        self.cursor = 0;
        self.advance(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_inside_interval() {
        let mut f = TimeFunction::new(vec![0.0, 1.0, 2.0], vec![0.0, 10.0, 10.0]).unwrap();
        f.update(0.5);
        assert!((f.value(0.5) - 5.0).abs() < 1.0e-12);
        f.update(1.5);
        assert!((f.value(1.5) - 10.0).abs() < 1.0e-12);
    }

    #[test]
    fn test_constant_extrapolation() {
        let mut f = TimeFunction::new(vec![1.0, 2.0], vec![4.0, 8.0]).unwrap();
        assert_eq!(f.value(0.5), 4.0);
        f.update(5.0);
        assert_eq!(f.value(5.0), 8.0);
    }

    #[test]
    fn test_cursor_monotone() {
        let mut f =
            TimeFunction::new(vec![0.0, 1.0, 2.0, 3.0], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let mut last = 0;
        for step in 0..30 {
            f.update(step as f64 * 0.13);
            assert!(f.cursor() >= last);
            last = f.cursor();
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_seek_matches_forward_update() {
        let times = vec![0.0, 0.5, 1.25, 4.0, 9.0];
        let values = vec![1.0, 2.0, 0.5, 3.0, 0.0];
        for t in [0.0, 0.4, 0.6, 2.0, 5.0, 12.0] {
            let mut forward = TimeFunction::new(times.clone(), values.clone()).unwrap();
            forward.update(t);
            let mut seeked = TimeFunction::new(times.clone(), values.clone()).unwrap();
            seeked.seek(t);
            assert_eq!(forward.cursor(), seeked.cursor(), "t = {}", t);
            assert!((forward.value(t) - seeked.value(t)).abs() < 1.0e-12);
        }
    }

    #[test]
    fn test_rejects_unsorted_times() {
        assert!(TimeFunction::new(vec![0.0, 2.0, 1.0], vec![0.0; 3]).is_err());
        assert!(IntervalSchedule::new(vec![1.0, 2.0], vec![2.0, 1.0]).is_err());
    }

    #[test]
    fn test_interval_schedule_advance() {
        let mut s = IntervalSchedule::new(vec![10.0, 20.0, 5.0], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(s.current(), 10.0);
        s.advance(0.99);
        assert_eq!(s.current(), 10.0);
        s.advance(1.0);
        assert_eq!(s.current(), 20.0);
        s.advance(7.0);
        // holds the last value past the final end time
        assert_eq!(s.current(), 5.0);
    }
}
