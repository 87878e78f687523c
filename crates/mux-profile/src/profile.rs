//! The per-(gpu, model) profile curve and its text codec
//!
//! Profiles are produced offline by the profiler tool. The on-disk format
//! is UTF-8 text: the profile id, the GPU device name, a CSV block of
//! forward measurements for each batch size, then preprocess and
//! postprocess latency scalars. `serialize -> parse -> serialize` is a
//! fixed point of the codec.

use crate::{ProfileError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Mean and standard deviation of a latency measurement, in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStat {
    pub mean_us: f64,
    pub std_us: f64,
}

/// One forward measurement at a fixed batch size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardEntry {
    /// Mean forward latency, microseconds
    pub latency_us: f64,
    /// Standard deviation of the forward latency, microseconds
    pub std_us: f64,
    /// GPU memory consumed at this batch size, bytes
    pub memory_bytes: u64,
}

/// Offline profile of one (gpu device, profile id) pair
#[derive(Debug, Clone, PartialEq)]
pub struct ModelProfile {
    /// Canonical model session key (SLA excluded)
    pub profile_id: String,

    /// GPU device name the measurements were taken on
    pub gpu_device: String,

    /// Forward latency and memory by batch size; monotone in batch
    pub forward: BTreeMap<u32, ForwardEntry>,

    /// Preprocess latency scalar
    pub preprocess: LatencyStat,

    /// Postprocess latency scalar
    pub postprocess: LatencyStat,
}

impl ModelProfile {
    /// Mean forward latency at `batch`, microseconds
    pub fn forward_latency(&self, batch: u32) -> Option<f64> {
        self.forward.get(&batch).map(|e| e.latency_us)
    }

    /// GPU memory usage at `batch`, bytes
    pub fn memory_usage(&self, batch: u32) -> Option<u64> {
        self.forward.get(&batch).map(|e| e.memory_bytes)
    }

    /// Mean preprocess latency, microseconds
    pub fn preprocess_latency(&self) -> f64 {
        self.preprocess.mean_us
    }

    /// Mean postprocess latency, microseconds
    pub fn postprocess_latency(&self) -> f64 {
        self.postprocess.mean_us
    }

    /// Largest batch size the profile covers
    pub fn max_profiled_batch(&self) -> u32 {
        self.forward.keys().next_back().copied().unwrap_or(0)
    }

    /// The batch size maximizing `batch / forward_latency(batch)` under
    /// the constraint `forward + preprocess + postprocess <= sla`, and the
    /// throughput (qps) it achieves. Returns `(0, 0.0)` when even batch
    /// size 1 does not fit the SLA.
    pub fn max_throughput(&self, latency_sla_ms: u32) -> (u32, f64) {
        let sla_us = latency_sla_ms as f64 * 1000.0;
        let fixed_us = self.preprocess.mean_us + self.postprocess.mean_us;

        let mut best_batch = 0u32;
        let mut best_throughput = 0.0f64;
        for (&batch, entry) in &self.forward {
            if entry.latency_us + fixed_us > sla_us {
                // latency is monotone in batch; nothing larger fits either
                break;
            }
            let throughput = batch as f64 * 1e6 / entry.latency_us;
            if throughput > best_throughput {
                best_throughput = throughput;
                best_batch = batch;
            }
        }
        (best_batch, best_throughput)
    }

    fn validate(&self) -> Result<()> {
        if self.forward.is_empty() {
            return Err(ProfileError::Empty);
        }
        Ok(())
    }
}

/// Format a float the way the codec writes it: shortest representation
/// that round-trips through `parse`
fn fmt_float(v: f64) -> String {
    format!("{}", v)
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.profile_id)?;
        writeln!(f, "{}", self.gpu_device)?;
        writeln!(f, "Forward latency")?;
        writeln!(f, "batch,latency(us),std(us),memory(B)")?;
        for (batch, entry) in &self.forward {
            writeln!(
                f,
                "{},{},{},{}",
                batch,
                fmt_float(entry.latency_us),
                fmt_float(entry.std_us),
                entry.memory_bytes
            )?;
        }
        writeln!(f, "Preprocess latency")?;
        writeln!(f, "mean(us),std(us)")?;
        writeln!(
            f,
            "{},{}",
            fmt_float(self.preprocess.mean_us),
            fmt_float(self.preprocess.std_us)
        )?;
        writeln!(f, "Postprocess latency")?;
        writeln!(f, "mean(us),std(us)")?;
        writeln!(
            f,
            "{},{}",
            fmt_float(self.postprocess.mean_us),
            fmt_float(self.postprocess.std_us)
        )?;
        Ok(())
    }
}

/// Line-oriented cursor over the profile text
struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
    current: usize,
}

impl<'a> Lines<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            inner: s.lines().enumerate(),
            current: 0,
        }
    }

    fn next(&mut self) -> Result<&'a str> {
        match self.inner.next() {
            Some((i, line)) => {
                self.current = i + 1;
                Ok(line.trim_end())
            }
            None => Err(ProfileError::parse(self.current + 1, "unexpected end of file")),
        }
    }

    fn expect(&mut self, literal: &str) -> Result<()> {
        let line = self.next()?;
        if line != literal {
            return Err(ProfileError::parse(
                self.current,
                format!("expected `{}`, found `{}`", literal, line),
            ));
        }
        Ok(())
    }
}

fn parse_latency_stat(lines: &mut Lines<'_>, header: &str) -> Result<LatencyStat> {
    lines.expect(header)?;
    lines.expect("mean(us),std(us)")?;
    let row = lines.next()?;
    let line_no = lines.current;
    let (mean, std) = row
        .split_once(',')
        .ok_or_else(|| ProfileError::parse(line_no, "expected `mean,std`"))?;
    Ok(LatencyStat {
        mean_us: mean
            .parse()
            .map_err(|e| ProfileError::parse(line_no, format!("bad mean: {}", e)))?,
        std_us: std
            .parse()
            .map_err(|e| ProfileError::parse(line_no, format!("bad std: {}", e)))?,
    })
}

impl FromStr for ModelProfile {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = Lines::new(s);
        let profile_id = lines.next()?.to_string();
        if profile_id.is_empty() {
            return Err(ProfileError::parse(lines.current, "empty profile id"));
        }
        let gpu_device = lines.next()?.to_string();
        if gpu_device.is_empty() {
            return Err(ProfileError::parse(lines.current, "empty gpu device"));
        }
        lines.expect("Forward latency")?;
        lines.expect("batch,latency(us),std(us),memory(B)")?;

        let mut forward = BTreeMap::new();
        loop {
            let line = lines.next()?;
            if line == "Preprocess latency" {
                break;
            }
            let line_no = lines.current;
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 4 {
                return Err(ProfileError::parse(line_no, "expected 4 CSV fields"));
            }
            let batch: u32 = fields[0]
                .parse()
                .map_err(|e| ProfileError::parse(line_no, format!("bad batch: {}", e)))?;
            let entry = ForwardEntry {
                latency_us: fields[1]
                    .parse()
                    .map_err(|e| ProfileError::parse(line_no, format!("bad latency: {}", e)))?,
                std_us: fields[2]
                    .parse()
                    .map_err(|e| ProfileError::parse(line_no, format!("bad std: {}", e)))?,
                memory_bytes: fields[3]
                    .parse()
                    .map_err(|e| ProfileError::parse(line_no, format!("bad memory: {}", e)))?,
            };
            if forward.insert(batch, entry).is_some() {
                return Err(ProfileError::parse(
                    line_no,
                    format!("duplicate batch size {}", batch),
                ));
            }
        }

        // The "Preprocess latency" header was already consumed by the loop
        lines.expect("mean(us),std(us)")?;
        let row = lines.next()?;
        let line_no = lines.current;
        let (mean, std) = row
            .split_once(',')
            .ok_or_else(|| ProfileError::parse(line_no, "expected `mean,std`"))?;
        let preprocess = LatencyStat {
            mean_us: mean
                .parse()
                .map_err(|e| ProfileError::parse(line_no, format!("bad mean: {}", e)))?,
            std_us: std
                .parse()
                .map_err(|e| ProfileError::parse(line_no, format!("bad std: {}", e)))?,
        };
        let postprocess = parse_latency_stat(&mut lines, "Postprocess latency")?;

        let profile = ModelProfile {
            profile_id,
            gpu_device,
            forward,
            preprocess,
            postprocess,
        };
        profile.validate()?;
        Ok(profile)
    }
}
