use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

use crate::floating_type_mod::FT;

#[derive(Clone)]
pub struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}

impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }

    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Counter<FT> {
    pub fn avg(&self) -> FT {
        self.values.iter().cloned().sum::<FT>() / self.values.len().max(1) as FT
    }
    pub fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, FT::min)
    }
    pub fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, FT::max)
    }
}

impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    pub fn avg(&self) -> Duration {
        self.sum() / self.values.len().max(1) as u32
    }

    pub fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

/// Named series of scalar samples, e.g. iteration counts.
pub struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}

impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<FT>> {
        self.counters.get(id)
    }
}

/// Named wall-clock timers. `begin`/`end` pairs for the same id must not nest.
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if let Some(counter) = self.counters.get_mut(id) {
            counter.end();
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<Duration>> {
        self.counters.get(id)
    }
}

pub fn write_statistics(pcounters: &PerformanceCounters, vcounters: &ValueCounters) -> String {
    let mut s = String::new();

    if let Some(compute) = pcounters.get("compute") {
        let _ = writeln!(s, "compute-time: {}ms", compute.sum().as_secs_f64() * 1000.);
        let _ = writeln!(s);
    }

    let mut v = pcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        let _ = writeln!(
            s,
            "{}: avg:{}ms calls:{}",
            label,
            pcounter.avg().as_secs_f64() * 1000.,
            pcounter.len()
        );
    }
    let _ = writeln!(s);

    let mut v = vcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        let _ = writeln!(
            s,
            "{}: avg:{} min:{} max:{}",
            label,
            vcounter.avg(),
            vcounter.min(),
            vcounter.max()
        );
    }

    s
}

#[test]
fn disabled_counters_record_nothing() {
    let mut pcounters = PerformanceCounters::new(false);
    let mut vcounters = ValueCounters::new(false);
    pcounters.begin("compute");
    pcounters.end("compute");
    vcounters.add_value("iterations", 3.);
    assert!(pcounters.get("compute").is_none());
    assert!(vcounters.get("iterations").is_none());
}

#[test]
fn statistics_list_every_counter() {
    let mut pcounters = PerformanceCounters::new(true);
    let mut vcounters = ValueCounters::new(true);
    pcounters.begin("group:density");
    pcounters.end("group:density");
    vcounters.add_value("iterations:pressure", 2.);
    vcounters.add_value("iterations:pressure", 4.);

    let counter = vcounters.get("iterations:pressure").unwrap();
    assert_eq!(counter.avg(), 3.);
    assert_eq!(counter.min(), 2.);
    assert_eq!(counter.max(), 4.);

    let s = write_statistics(&pcounters, &vcounters);
    assert!(s.contains("group:density: avg:"));
    assert!(s.contains("iterations:pressure: avg:3 min:2 max:4"));
}
