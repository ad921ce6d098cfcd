//! Event profiling across queues.
//!
//! A [`Profiler`] collects the profiling instants of every event owned by
//! the queues registered with it, aggregates busy time per event name and
//! measures how long differently named events ran at the same time.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{host_err, Error, HostError, Result};
use crate::event::Event;
use crate::queue::Queue;
use crate::raw::*;

/// Profiling instants of one event, in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfInfo {
    pub event_name: String,
    pub queue_name: String,
    pub t_queued: cl_ulong,
    pub t_submit: cl_ulong,
    pub t_start: cl_ulong,
    pub t_end: cl_ulong,
}

impl ProfInfo {
    pub fn duration(&self) -> cl_ulong {
        self.t_end.saturating_sub(self.t_start)
    }
}

/// Busy time of all events sharing a name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfAgg {
    pub event_name: String,
    /// Nanoseconds.
    pub absolute_time: cl_ulong,
    /// Fraction of the total time of all events.
    pub relative_time: f64,
}

/// Time two events (or two events of the same name) ran simultaneously.
/// `event1 <= event2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfOverlap {
    pub event1: String,
    pub event2: String,
    /// Nanoseconds.
    pub duration: cl_ulong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggSort {
    Name,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapSort {
    Name,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSort {
    EventName,
    QueueName,
    Queued,
    Submit,
    Start,
    End,
}

/// Layout of [`Profiler::export_info`] lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub separator: String,
    pub newline: String,
    /// Written before and after each queue name.
    pub queue_delim: String,
    /// Written before and after each event name.
    pub evname_delim: String,
    /// Shift all instants so the earliest start is zero.
    pub zero_start: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            separator: "\t".to_string(),
            newline: "\n".to_string(),
            queue_delim: String::new(),
            evname_delim: String::new(),
            zero_start: true,
        }
    }
}

#[derive(Default)]
pub struct Profiler {
    queues: Vec<(String, Queue)>,
    extra: Vec<ProfInfo>,
    started: Option<Instant>,
    stopped: Option<Duration>,
    calculated: Option<Results>,
}

struct Results {
    infos: Vec<ProfInfo>,
    aggregates: Vec<ProfAgg>,
    overlaps: Vec<ProfOverlap>,
    total: cl_ulong,
    effective: cl_ulong,
}

impl Profiler {
    pub fn new() -> Self {
        Profiler::default()
    }

    /// Registers `queue`, whose events are read by [`Profiler::calc`]. A
    /// queue already registered under `name` is replaced.
    pub fn add_queue(&mut self, name: impl Into<String>, queue: &Queue) {
        let name = name.into();
        match self.queues.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => {
                log::debug!("profiler queue '{}' replaced", name);
                slot.1 = queue.clone();
            }
            None => self.queues.push((name, queue.clone())),
        }
    }

    /// Adds an event with explicit instants, for work not visible as a
    /// single queue event.
    pub fn add_instant(
        &mut self,
        event_name: impl Into<String>,
        queue_name: impl Into<String>,
        t_start: cl_ulong,
        t_end: cl_ulong,
    ) {
        self.extra.push(ProfInfo {
            event_name: event_name.into(),
            queue_name: queue_name.into(),
            t_queued: t_start,
            t_submit: t_start,
            t_start,
            t_end,
        });
    }

    /// Adds an event spanning from the start of `first` to the end of
    /// `last`.
    pub fn add_composite(
        &mut self,
        event_name: impl Into<String>,
        queue_name: impl Into<String>,
        first: &Event,
        last: &Event,
    ) -> Result<()> {
        let mut info = read_info(first, queue_name.into())?;
        info.event_name = event_name.into();
        info.t_end = last.profiling_time(CL_PROFILING_COMMAND_END)?;
        self.extra.push(info);
        Ok(())
    }

    /// Starts the wall-clock timer.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started {
            self.stopped = Some(started.elapsed());
        }
    }

    /// Seconds between [`Profiler::start`] and [`Profiler::stop`] (or now,
    /// while running). Zero if never started.
    pub fn elapsed(&self) -> f64 {
        match (self.started, self.stopped) {
            (_, Some(stopped)) => stopped.as_secs_f64(),
            (Some(started), None) => started.elapsed().as_secs_f64(),
            (None, None) => 0.0,
        }
    }

    /// Reads the events of every registered queue and computes aggregates
    /// and overlaps. Events without profiling information are skipped.
    /// Afterwards each queue's finished events are collected, which only
    /// happens for queues the profiler holds the last reference to.
    pub fn calc(&mut self) -> Result<()> {
        let mut infos = Vec::new();
        for (queue_name, queue) in &mut self.queues {
            if queue.properties()? & CL_QUEUE_PROFILING_ENABLE == 0 {
                return Err(host_err!(Other, "queue '{}' does not have profiling enabled", queue_name));
            }
            for event in queue.events() {
                match read_info(&event, queue_name.clone()) {
                    Ok(info) => infos.push(info),
                    Err(err)
                        if err.is_runtime(CL_PROFILING_INFO_NOT_AVAILABLE)
                            || err.is_host(HostError::InfoUnavailable) =>
                    {
                        log::info!("the '{}' event does not have profiling info", event.final_name()?);
                    }
                    Err(err) => return Err(err),
                }
            }
            queue.gc();
        }
        infos.extend(self.extra.iter().cloned());

        let mut per_name: HashMap<&str, cl_ulong> = HashMap::new();
        for info in &infos {
            *per_name.entry(&info.event_name).or_default() += info.duration();
        }
        let total: cl_ulong = per_name.values().sum();
        let aggregates: Vec<ProfAgg> = per_name
            .into_iter()
            .map(|(name, time)| ProfAgg {
                event_name: name.to_string(),
                absolute_time: time,
                relative_time: if total == 0 { 0.0 } else { time as f64 / total as f64 },
            })
            .collect();

        let overlaps = overlaps(&infos);
        let overlapping: cl_ulong = overlaps.iter().map(|o| o.duration).sum();
        log::debug!("profiled {} events, {}ns busy, {}ns overlapping", infos.len(), total, overlapping);
        self.calculated = Some(Results {
            infos,
            aggregates,
            overlaps,
            total,
            effective: total.saturating_sub(overlapping),
        });
        Ok(())
    }

    fn results(&self) -> Result<&Results> {
        self.calculated
            .as_ref()
            .ok_or_else(|| host_err!(Other, "profiling results requested before calc()"))
    }

    /// Sum of the durations of all events, in nanoseconds.
    pub fn total_time(&self) -> Result<cl_ulong> {
        Ok(self.results()?.total)
    }

    /// Total time minus the time events spent overlapping.
    pub fn effective_time(&self) -> Result<cl_ulong> {
        Ok(self.results()?.effective)
    }

    pub fn aggregates(&self, by: AggSort, order: SortOrder) -> Result<Vec<&ProfAgg>> {
        let aggs = &self.results()?.aggregates;
        Ok(match by {
            AggSort::Name => sorted(aggs, order, |a, b| a.event_name.cmp(&b.event_name)),
            AggSort::Time => sorted(aggs, order, |a, b| {
                a.absolute_time.cmp(&b.absolute_time).then_with(|| a.event_name.cmp(&b.event_name))
            }),
        })
    }

    pub fn overlaps(&self, by: OverlapSort, order: SortOrder) -> Result<Vec<&ProfOverlap>> {
        let overlaps = &self.results()?.overlaps;
        let names = |a: &ProfOverlap, b: &ProfOverlap| (&a.event1, &a.event2).cmp(&(&b.event1, &b.event2));
        Ok(match by {
            OverlapSort::Name => sorted(overlaps, order, names),
            OverlapSort::Duration => {
                sorted(overlaps, order, |a, b| a.duration.cmp(&b.duration).then_with(|| names(a, b)))
            }
        })
    }

    pub fn infos(&self, by: InfoSort, order: SortOrder) -> Result<Vec<&ProfInfo>> {
        let infos = &self.results()?.infos;
        Ok(match by {
            InfoSort::EventName => sorted(infos, order, |a, b| a.event_name.cmp(&b.event_name)),
            InfoSort::QueueName => sorted(infos, order, |a, b| a.queue_name.cmp(&b.queue_name)),
            InfoSort::Queued => sorted(infos, order, |a, b| a.t_queued.cmp(&b.t_queued)),
            InfoSort::Submit => sorted(infos, order, |a, b| a.t_submit.cmp(&b.t_submit)),
            InfoSort::Start => sorted(infos, order, |a, b| a.t_start.cmp(&b.t_start)),
            InfoSort::End => sorted(infos, order, |a, b| a.t_end.cmp(&b.t_end)),
        })
    }

    /// Writes one line per event, in start order:
    /// `queue sep start sep end sep event newline`.
    pub fn export_info(&self, mut out: impl Write, opts: &ExportOptions) -> Result<()> {
        let infos = self.infos(InfoSort::Start, SortOrder::Ascending)?;
        let t0 = if opts.zero_start { infos.first().map_or(0, |i| i.t_start) } else { 0 };
        let (sep, qd, ed) = (&opts.separator, &opts.queue_delim, &opts.evname_delim);
        for info in infos {
            write!(
                out,
                "{qd}{}{qd}{sep}{}{sep}{}{sep}{ed}{}{ed}{}",
                info.queue_name,
                info.t_start - t0,
                info.t_end.saturating_sub(t0),
                info.event_name,
                opts.newline,
            )
            .map_err(export_error)?;
        }
        out.flush().map_err(export_error)
    }

    pub fn export_info_file(&self, path: impl AsRef<Path>, opts: &ExportOptions) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path)
            .map_err(|e| host_err!(OpenFile, "unable to create '{}': {}", path.display(), e))?;
        self.export_info(BufWriter::new(file), opts)
    }

    /// Human-readable report of the aggregate and overlap tables.
    pub fn summary(&self, agg: (AggSort, SortOrder), ovlp: (OverlapSort, SortOrder)) -> Result<String> {
        const RULE: &str = "       ------------------------------------------------------------------\n";
        let results = self.results()?;
        let mut out = String::from("\n   =========================== Timing/Profiling ===========================\n\n");
        if self.started.is_some() {
            out += &format!("     Total elapsed time        : {:.6}s\n", self.elapsed());
        }
        if results.total > 0 {
            out += &format!("     Total of all events       : {:.6}s\n", seconds(results.total));
        }
        let aggregates = self.aggregates(agg.0, agg.1)?;
        if !aggregates.is_empty() {
            out += "     Aggregate times by event  :\n";
            out += RULE;
            out += "       | Event name                     | Rel. time (%) | Abs. time (s) |\n";
            out += RULE;
            for a in aggregates {
                out += &format!(
                    "       | {:<30.30} | {:>13.4} | {:>13.4e} |\n",
                    a.event_name,
                    a.relative_time * 100.0,
                    seconds(a.absolute_time)
                );
            }
            out += RULE;
        }
        let overlaps = self.overlaps(ovlp.0, ovlp.1)?;
        if overlaps.is_empty() {
            out += "     Event overlap times       : None\n";
        } else {
            out += &format!("     Tot. of all events (eff.) : {:e}s\n", seconds(results.effective));
            out += &format!(
                "                                 {:e}s saved with overlaps\n",
                seconds(results.total - results.effective)
            );
            out += "     Event overlap times       :\n";
            out += RULE;
            out += "       | Event 1                | Event2                 | Overlap (s)  |\n";
            out += RULE;
            for o in overlaps {
                out += &format!(
                    "       | {:<22.22} | {:<22.22} | {:>12.4e} |\n",
                    o.event1,
                    o.event2,
                    seconds(o.duration)
                );
            }
            out += RULE;
        }
        Ok(out)
    }
}

fn read_info(event: &Event, queue_name: String) -> Result<ProfInfo> {
    Ok(ProfInfo {
        event_name: event.final_name()?,
        queue_name,
        t_queued: event.profiling_time(CL_PROFILING_COMMAND_QUEUED)?,
        t_submit: event.profiling_time(CL_PROFILING_COMMAND_SUBMIT)?,
        t_start: event.profiling_time(CL_PROFILING_COMMAND_START)?,
        t_end: event.profiling_time(CL_PROFILING_COMMAND_END)?,
    })
}

/// Sweeps the start and end instants in time order, ends before starts on
/// ties, and charges each ending event's overlap with every event still
/// running to their name pair.
fn overlaps(infos: &[ProfInfo]) -> Vec<ProfOverlap> {
    let mut instants = Vec::with_capacity(infos.len() * 2);
    for (id, info) in infos.iter().enumerate() {
        if info.t_end > info.t_start {
            instants.push((info.t_start, true, id));
            instants.push((info.t_end, false, id));
        } else {
            log::debug!("event '{}' has no duration, left out of overlaps", info.event_name);
        }
    }
    instants.sort_unstable();

    let mut running: Vec<usize> = Vec::new();
    let mut per_pair: HashMap<(&str, &str), cl_ulong> = HashMap::new();
    for (t, is_start, id) in instants {
        if is_start {
            running.push(id);
            continue;
        }
        running.retain(|&r| r != id);
        for &other in &running {
            let since = infos[id].t_start.max(infos[other].t_start);
            if t > since {
                let (a, b) = (infos[id].event_name.as_str(), infos[other].event_name.as_str());
                *per_pair.entry((a.min(b), a.max(b))).or_default() += t - since;
            }
        }
    }
    per_pair
        .into_iter()
        .map(|((a, b), duration)| ProfOverlap { event1: a.to_string(), event2: b.to_string(), duration })
        .collect()
}

fn sorted<T>(items: &[T], order: SortOrder, cmp: impl Fn(&T, &T) -> Ordering) -> Vec<&T> {
    let mut items: Vec<&T> = items.iter().collect();
    items.sort_by(|a, b| match order {
        SortOrder::Ascending => cmp(a, b),
        SortOrder::Descending => cmp(b, a),
    });
    items
}

fn seconds(ns: cl_ulong) -> f64 {
    ns as f64 / 1e9
}

fn export_error(e: io::Error) -> Error {
    host_err!(StreamWrite, "unable to export profiling information: {}", e)
}
