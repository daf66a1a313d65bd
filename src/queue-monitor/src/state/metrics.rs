use prometheus::Encoder as _;

pub struct PromMetrics {
    registry: prometheus::Registry,

    pub queue_checks_started: prometheus::IntCounter,
    pub queue_checks_finished: prometheus::IntCounter,
    pub queue_build_loads: prometheus::IntCounter,
    pub queue_steps_created: prometheus::IntCounter,

    pub nr_queue_wakeups: prometheus::IntCounter, // queuemonitor_monitor_checks
    pub nr_builds_read: prometheus::IntCounter,   // queuemonitor_builds_read
    pub nr_builds_done: prometheus::IntCounter,   // queuemonitor_builds_finished

    pub nr_builds_unfinished: prometheus::IntGauge,
    pub nr_steps_unfinished: prometheus::IntGauge,
}

impl PromMetrics {
    #[tracing::instrument(err)]
    pub fn new() -> anyhow::Result<Self> {
        let queue_checks_started = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_queue_checks_started_total",
            "Number of times the queue was checked for new builds",
        ))?;
        let queue_checks_finished = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_queue_checks_finished_total",
            "Number of times a queue check ran to completion",
        ))?;
        let queue_build_loads = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_queue_build_loads_total",
            "Number of builds loaded",
        ))?;
        let queue_steps_created = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_queue_steps_created_total",
            "Number of steps created",
        ))?;
        let nr_queue_wakeups = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_monitor_checks",
            "Number of times the queue monitor woke up on a notification",
        ))?;
        let nr_builds_read = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_builds_read",
            "Number of builds read from the database",
        ))?;
        let nr_builds_done = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "queuemonitor_builds_finished",
            "Number of builds finalized by the monitor",
        ))?;
        let nr_builds_unfinished = prometheus::IntGauge::with_opts(prometheus::Opts::new(
            "queuemonitor_builds_unfinished",
            "Number of admitted builds in the registry",
        ))?;
        let nr_steps_unfinished = prometheus::IntGauge::with_opts(prometheus::Opts::new(
            "queuemonitor_steps_unfinished",
            "Number of live steps in the graph",
        ))?;

        let registry = prometheus::Registry::new();
        registry.register(Box::new(queue_checks_started.clone()))?;
        registry.register(Box::new(queue_checks_finished.clone()))?;
        registry.register(Box::new(queue_build_loads.clone()))?;
        registry.register(Box::new(queue_steps_created.clone()))?;
        registry.register(Box::new(nr_queue_wakeups.clone()))?;
        registry.register(Box::new(nr_builds_read.clone()))?;
        registry.register(Box::new(nr_builds_done.clone()))?;
        registry.register(Box::new(nr_builds_unfinished.clone()))?;
        registry.register(Box::new(nr_steps_unfinished.clone()))?;

        Ok(Self {
            registry,
            queue_checks_started,
            queue_checks_finished,
            queue_build_loads,
            queue_steps_created,
            nr_queue_wakeups,
            nr_builds_read,
            nr_builds_done,
            nr_builds_unfinished,
            nr_steps_unfinished,
        })
    }

    /// Render the registry in the text exposition format.
    pub fn dump(&self) -> anyhow::Result<String> {
        let mut buffer = vec![];
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_counters_register_and_dump() {
        let metrics = PromMetrics::new().unwrap();
        metrics.nr_queue_wakeups.inc();
        metrics.nr_builds_read.inc_by(3);

        let dump = metrics.dump().unwrap();
        assert!(dump.contains("queuemonitor_monitor_checks 1"));
        assert!(dump.contains("queuemonitor_builds_read 3"));
    }
}
