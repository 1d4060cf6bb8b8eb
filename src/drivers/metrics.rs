use std::fmt::Write as _;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::drivers::{BatchAggregate, SinkError};

/// Receiver of one aggregate per publication interval.
pub trait MetricsSink: Send {
    fn name(&self) -> &str;

    /// Push one aggregate; best effort, never retried by the caller.
    fn publish(&mut self, batch: &BatchAggregate, timeout: Duration) -> Result<(), SinkError>;
}

impl MetricsSink for Box<dyn MetricsSink> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn publish(&mut self, batch: &BatchAggregate, timeout: Duration) -> Result<(), SinkError> {
        (**self).publish(batch, timeout)
    }
}

/// Gauge names pushed each cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricNames {
    pub aggregate: String,
    pub per_sample: String,
    pub per_sample_label: String,
    pub rate: String,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            aggregate: "pressure_list".into(),
            per_sample: "pressure_value".into(),
            per_sample_label: "index".into(),
            rate: "measurement_rate".into(),
        }
    }
}

/// Prometheus text exposition of one aggregate: the mean, one labeled gauge per sample, the rate.
pub fn render_exposition(batch: &BatchAggregate, names: &MetricNames) -> String {
    let mut out = String::new();
    writeln!(out, "# HELP {} Average reading over the publish interval", names.aggregate).ok();
    writeln!(out, "# TYPE {} gauge", names.aggregate).ok();
    writeln!(out, "{} {}", names.aggregate, batch.mean).ok();
    writeln!(out, "# HELP {} Individual readings in the publish interval", names.per_sample).ok();
    writeln!(out, "# TYPE {} gauge", names.per_sample).ok();
    for (i, value) in batch.values.iter().enumerate() {
        writeln!(
            out,
            "{}{{{}=\"{i}\"}} {value}",
            names.per_sample, names.per_sample_label
        )
        .ok();
    }
    writeln!(out, "# HELP {} Measurements per second", names.rate).ok();
    writeln!(out, "# TYPE {} gauge", names.rate).ok();
    writeln!(out, "{} {}", names.rate, batch.measurement_rate).ok();
    out
}

/// Pushes aggregates to a Prometheus Pushgateway, replacing the job's group each cycle.
pub struct PushgatewaySink {
    agent: ureq::Agent,
    url: String,
    names: MetricNames,
}

impl PushgatewaySink {
    pub fn new(address: &str, job: &str, names: MetricNames) -> Self {
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_owned()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let url = format!("{base}/metrics/job/{job}");
        info!("publishing metrics to {url}");
        Self {
            agent: ureq::AgentBuilder::new().build(),
            url,
            names,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MetricsSink for PushgatewaySink {
    fn name(&self) -> &str {
        "pushgateway"
    }

    fn publish(&mut self, batch: &BatchAggregate, timeout: Duration) -> Result<(), SinkError> {
        let body = render_exposition(batch, &self.names);
        debug!("pushing {} bytes to {}", body.len(), self.url);
        self.agent
            .put(&self.url)
            .timeout(timeout)
            .set("Content-Type", "text/plain; version=0.0.4")
            .send_string(&body)
            .map(|_| ())
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => {
                    SinkError::unavailable(self.name(), format!("gateway answered {code}"))
                }
                ureq::Error::Transport(t) => SinkError::unavailable(self.name(), t),
            })
    }
}
