use super::error::SignalError;

/// Rising and falling edge indices of a sampled digital channel.
///
/// `rising[i]` is the index of the first high sample of a run, `falling[i]` the index of
/// the first low sample after a run. A run that is already high at the first sample has
/// no rising edge, and a run still high at the last sample has no falling edge, so the
/// two lists can differ in length by one at either end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edges {
    pub rising: Vec<usize>,
    pub falling: Vec<usize>,
}

/// On and off times of a digital channel, in seconds on the device clock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeTimes {
    pub on: Vec<f64>,
    pub off: Vec<f64>,
}

impl Edges {
    /// Complete (rising, falling) pairs, in time order. Open-ended runs at either
    /// boundary of the recording are skipped.
    pub fn pulses(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::with_capacity(self.rising.len());
        let mut falling = self.falling.iter().peekable();
        for &on in &self.rising {
            while falling.next_if(|&&off| off <= on).is_some() {}
            match falling.next() {
                Some(&off) => pairs.push((on, off)),
                None => break,
            }
        }
        pairs
    }

    /// Convert edge indices to times for a uniformly sampled channel
    pub fn at_rate(&self, sample_rate: f64) -> EdgeTimes {
        EdgeTimes {
            on: self.rising.iter().map(|&i| i as f64 / sample_rate).collect(),
            off: self.falling.iter().map(|&i| i as f64 / sample_rate).collect(),
        }
    }

    /// Convert edge indices to times using per-sample timestamps (event logs are not
    /// uniformly sampled). `times` must be the timestamps of the samples the edges were
    /// detected on.
    pub fn at_times(&self, times: &[f64]) -> EdgeTimes {
        EdgeTimes {
            on: self.rising.iter().map(|&i| times[i]).collect(),
            off: self.falling.iter().map(|&i| times[i]).collect(),
        }
    }
}

/// Detect rising and falling edges of a 0/1 signal.
///
/// Every sample must be exactly 0 or 1; anything else is rejected with the count and
/// first offending sample. Edges are found where consecutive ±1-mapped samples differ
/// by 2, which is the [1, -1] convolution thresholded at ±2.
pub fn detect_edges<T>(signal: &[T]) -> Result<Edges, SignalError>
where
    T: Copy + Into<f64>,
{
    let mut first_bad: Option<(usize, f64)> = None;
    let mut bad_count = 0;
    for (idx, sample) in signal.iter().enumerate() {
        let value: f64 = (*sample).into();
        if value != 0.0 && value != 1.0 {
            bad_count += 1;
            if first_bad.is_none() {
                first_bad = Some((idx, value));
            }
        }
    }
    if let Some((first_index, first_value)) = first_bad {
        return Err(SignalError::NotDigital {
            count: bad_count,
            first_index,
            first_value,
        });
    }

    let mut edges = Edges::default();
    for idx in 1..signal.len() {
        let prev: f64 = signal[idx - 1].into();
        let curr: f64 = signal[idx].into();
        let conv = (2.0 * curr - 1.0) - (2.0 * prev - 1.0);
        if conv == 2.0 {
            edges.rising.push(idx);
        } else if conv == -2.0 {
            edges.falling.push(idx);
        }
    }
    Ok(edges)
}

/// Detect edges of an irregularly sampled digital variable given as (time, value)
/// samples, returning the times of the samples at which the value changed.
pub fn detect_edge_times(times: &[f64], values: &[f64]) -> Result<EdgeTimes, SignalError> {
    if times.len() != values.len() {
        return Err(SignalError::LengthMismatch(values.len(), times.len()));
    }
    Ok(detect_edges(values)?.at_times(times))
}
