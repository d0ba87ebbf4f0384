//! InfluxDB line protocol encoding
//!
//! `measurement,tag=value field=1i 1465839830100400200`: one line per
//! point, tags sorted lexically, integers carry the `i` suffix, timestamps
//! are nanoseconds since the epoch.

use super::{FieldValue, MetricPoint};

/// Encode one point as a single protocol line.
pub fn encode(point: &MetricPoint) -> String {
    let mut line = escape_measurement(&point.name);

    for (key, value) in &point.tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if !first {
            line.push(',');
        }
        first = false;
        line.push_str(&escape_key(key));
        line.push('=');
        match value {
            FieldValue::Integer(v) => line.push_str(&format!("{v}i")),
            FieldValue::Float(v) => line.push_str(&format!("{v}")),
        }
    }

    line.push(' ');
    line.push_str(&point.timestamp.timestamp_nanos_opt().unwrap_or(0).to_string());
    line
}

/// Encode a batch as a newline-separated write body.
pub fn encode_batch(points: &[MetricPoint]) -> String {
    points.iter().map(encode).collect::<Vec<_>>().join("\n")
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(key: &str) -> String {
    key.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
