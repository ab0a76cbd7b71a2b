//! Structured diagnostics emitted by the solver.
//!
//! The solver never logs through global state. Each solver owns a
//! [`DiagnosticsSink`] passed in at construction and pushes
//! [`DiagnosticRecord`]s into it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Debug,
    Warning,
}

/// Linear loops and nonlinear loops are traced under separate categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    LinearSystem,
    NonlinearSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Count(usize),
    Scalar(f64),
    Vector(Vec<f64>),
    Names(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp: SystemTime,
    pub level: Level,
    pub category: Category,
    pub equation_index: usize,
    pub simulation_time: f64,
    pub message: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl DiagnosticRecord {
    pub fn scalar(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(FieldValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn vector(&self, key: &str) -> Option<&[f64]> {
        match self.fields.get(key) {
            Some(FieldValue::Vector(v)) => Some(v),
            _ => None,
        }
    }
}

/// Receiver of solver diagnostics.
pub trait DiagnosticsSink {
    /// Whether records of `level` are kept. Vector payloads are only
    /// assembled when this returns true.
    fn enabled(&self, level: Level, category: Category) -> bool;

    fn record(&mut self, record: DiagnosticRecord);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn enabled(&self, _level: Level, _category: Category) -> bool {
        false
    }

    fn record(&mut self, _record: DiagnosticRecord) {}
}

/// Keeps every record at or above `min_level` in arrival order.
#[derive(Debug, Clone)]
pub struct MemorySink {
    pub min_level: Level,
    records: Vec<DiagnosticRecord>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(Level::Debug)
    }
}

impl MemorySink {
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[DiagnosticRecord] {
        &self.records
    }

    /// Records whose message starts with `prefix`.
    pub fn matching<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a DiagnosticRecord> {
        self.records
            .iter()
            .filter(move |r| r.message.starts_with(prefix))
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn enabled(&self, level: Level, _category: Category) -> bool {
        level >= self.min_level
    }

    fn record(&mut self, record: DiagnosticRecord) {
        if record.level >= self.min_level {
            self.records.push(record);
        }
    }
}

/// Forwards records to `tracing` as events with target `algloop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn enabled(&self, level: Level, _category: Category) -> bool {
        match level {
            Level::Debug => tracing::enabled!(target: "algloop", tracing::Level::DEBUG),
            Level::Warning => tracing::enabled!(target: "algloop", tracing::Level::WARN),
        }
    }

    fn record(&mut self, record: DiagnosticRecord) {
        let fields = format_fields(&record.fields);
        match record.level {
            Level::Debug => tracing::debug!(
                target: "algloop",
                category = ?record.category,
                eq = record.equation_index,
                time = record.simulation_time,
                "{} {}",
                record.message,
                fields
            ),
            Level::Warning => tracing::warn!(
                target: "algloop",
                category = ?record.category,
                eq = record.equation_index,
                time = record.simulation_time,
                "{} {}",
                record.message,
                fields
            ),
        }
    }
}

fn format_fields(fields: &BTreeMap<String, FieldValue>) -> String {
    let mut parts = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        let text = match value {
            FieldValue::Count(n) => n.to_string(),
            FieldValue::Scalar(v) => format!("{v:e}"),
            FieldValue::Vector(v) => format!(
                "{{{}}}",
                v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ")
            ),
            FieldValue::Names(names) => format!("{{{}}}", names.join(", ")),
        };
        parts.push(format!("{key} = {text}"));
    }
    parts.join(", ")
}

/// Builder used by the solver to assemble records for one loop.
pub(crate) struct Emitter<'a, D: DiagnosticsSink> {
    pub sink: &'a mut D,
    pub category: Category,
    pub equation_index: usize,
    pub simulation_time: f64,
}

impl<'a, D: DiagnosticsSink> Emitter<'a, D> {
    pub fn enabled(&self, level: Level) -> bool {
        self.sink.enabled(level, self.category)
    }

    pub fn emit(
        &mut self,
        level: Level,
        message: impl Into<String>,
        fields: Vec<(&str, FieldValue)>,
    ) {
        if !self.enabled(level) {
            return;
        }
        self.sink.record(DiagnosticRecord {
            timestamp: SystemTime::now(),
            level,
            category: self.category,
            equation_index: self.equation_index,
            simulation_time: self.simulation_time,
            message: message.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(sink: &mut MemorySink) -> Emitter<'_, MemorySink> {
        Emitter {
            sink,
            category: Category::NonlinearSystem,
            equation_index: 7,
            simulation_time: 0.5,
        }
    }

    #[test]
    fn memory_sink_filters_by_level() {
        let mut sink = MemorySink::new(Level::Warning);
        {
            let mut em = emitter(&mut sink);
            em.emit(Level::Debug, "dropped", vec![]);
            em.emit(
                Level::Warning,
                "kept",
                vec![("lambda", FieldValue::Scalar(0.25))],
            );
        }
        assert_eq!(sink.records().len(), 1);
        let record = &sink.records()[0];
        assert_eq!(record.message, "kept");
        assert_eq!(record.equation_index, 7);
        assert_eq!(record.scalar("lambda"), Some(0.25));
    }

    #[test]
    fn null_sink_is_never_enabled() {
        assert!(!NullSink.enabled(Level::Warning, Category::LinearSystem));
    }

    #[test]
    fn fields_render_vectors_and_names() {
        let mut fields = BTreeMap::new();
        fields.insert("names".to_string(), FieldValue::Names(vec!["a".into(), "b".into()]));
        fields.insert("y".to_string(), FieldValue::Vector(vec![1.0, 2.5]));
        assert_eq!(format_fields(&fields), "names = {a, b}, y = {1, 2.5}");
    }
}
