//! Event subscription and measurement logging.
//!
//! The gateway pushes subscribed events into an [`EventSink`]; a drain task
//! owned by [`EventSubscriptionLog`] hands each one, unchanged, to a
//! [`MeasurementLogger`]. Logger calls run on the blocking pool, in batches of
//! whatever is queued. The phase controller never sees these events.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use cwtune_fleet::{EventSink, FleetGateway, MeasurementEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MeasurementConfig;
use crate::error::Result;

/// Persists measurement events. Calls may block.
pub trait MeasurementLogger: Send {
    fn log_measurement(&mut self, event: &MeasurementEvent) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesLogger<W: Write + Send> {
    writer: W,
}

impl JsonLinesLogger<BufWriter<File>> {
    /// Append to `path`, creating it if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesLogger<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> MeasurementLogger for JsonLinesLogger<W> {
    fn log_measurement(&mut self, event: &MeasurementEvent) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Writes measurements to the log.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl MeasurementLogger for TracingLogger {
    fn log_measurement(&mut self, event: &MeasurementEvent) -> io::Result<()> {
        info!(
            target: "cwtune::measurement",
            node = %event.node,
            name = %event.name,
            value = %event.value,
            timestamp_ms = event.timestamp_ms,
            "measurement"
        );
        Ok(())
    }
}

/// Open the logger named by the measurement configuration.
pub fn open_logger(config: &MeasurementConfig) -> Result<Box<dyn MeasurementLogger>> {
    match &config.output {
        Some(path) => {
            info!(path = %path.display(), "writing measurements");
            Ok(Box::new(JsonLinesLogger::create(path)?))
        }
        None => Ok(Box::new(TracingLogger)),
    }
}

/// Totals reported when the subscription stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub written: u64,
    pub write_errors: u64,
    pub dropped: u64,
}

/// A running telemetry subscription.
pub struct EventSubscriptionLog {
    stop_tx: oneshot::Sender<()>,
    drain: JoinHandle<TelemetryStats>,
    sink: EventSink,
}

impl EventSubscriptionLog {
    /// Subscribe to the configured events and start logging them.
    ///
    /// A rejected subscription is logged, not fatal: the experiment still
    /// runs, just without measurements from the rejecting agents.
    pub async fn start<G: FleetGateway>(
        gateway: &G,
        config: &MeasurementConfig,
        logger: Box<dyn MeasurementLogger>,
    ) -> Self {
        let (sink, rx) = EventSink::channel(config.queue_depth);
        let (stop_tx, stop_rx) = oneshot::channel();
        let drain = tokio::spawn(drain(rx, stop_rx, logger));

        let outcome = gateway
            .subscribe_events(&config.events, config.filter_mask, sink.clone())
            .await;
        if outcome.is_success() {
            info!(
                events = ?config.events,
                mask = config.filter_mask,
                %outcome,
                "subscribed to measurements"
            );
        } else {
            warn!(events = ?config.events, %outcome, "measurement subscription failed");
        }

        Self {
            stop_tx,
            drain,
            sink,
        }
    }

    /// Unsubscribe, log whatever is still queued and flush the logger.
    pub async fn stop<G: FleetGateway>(self, gateway: &G) -> TelemetryStats {
        let outcome = gateway.unsubscribe_events().await;
        if !outcome.is_success() {
            warn!(%outcome, "measurement unsubscribe failed");
        }

        let _ = self.stop_tx.send(());
        let mut stats = match self.drain.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "measurement logger task failed");
                TelemetryStats::default()
            }
        };
        stats.dropped = self.sink.dropped();

        info!(
            written = stats.written,
            dropped = stats.dropped,
            write_errors = stats.write_errors,
            "measurement logging stopped"
        );
        stats
    }
}

/// Most events handed to the blocking pool at once.
const MAX_BATCH: usize = 256;

async fn drain(
    mut rx: mpsc::Receiver<MeasurementEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    logger: Box<dyn MeasurementLogger>,
) -> TelemetryStats {
    let mut stats = TelemetryStats::default();
    let mut logger = Some(logger);

    loop {
        let first = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut stop_rx => break,
        };

        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        write_batch(&mut logger, batch, false, &mut stats).await;
    }

    rx.close();
    let mut rest = Vec::new();
    while let Ok(event) = rx.try_recv() {
        rest.push(event);
    }
    write_batch(&mut logger, rest, true, &mut stats).await;
    stats
}

/// Log `batch` on the blocking pool, flushing afterwards if asked.
///
/// The logger travels to the blocking thread and back. If that thread
/// panics the logger is lost and later events count as write errors.
async fn write_batch(
    logger: &mut Option<Box<dyn MeasurementLogger>>,
    batch: Vec<MeasurementEvent>,
    flush: bool,
    stats: &mut TelemetryStats,
) {
    let Some(mut current) = logger.take() else {
        stats.write_errors += batch.len() as u64;
        return;
    };

    let task = tokio::task::spawn_blocking(move || {
        let mut written = 0u64;
        let mut errors = 0u64;
        for event in &batch {
            match current.log_measurement(event) {
                Ok(()) => written += 1,
                Err(e) => {
                    errors += 1;
                    warn!(error = %e, name = %event.name, "failed to log measurement");
                }
            }
        }
        if flush {
            if let Err(e) = current.flush() {
                warn!(error = %e, "failed to flush measurements");
            }
        }
        (current, written, errors)
    });

    match task.await {
        Ok((current, written, errors)) => {
            *logger = Some(current);
            stats.written += written;
            stats.write_errors += errors;
        }
        Err(e) => warn!(error = %e, "measurement writer failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cwtune_fleet::NodeId;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, ThreadId};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn event(node: u64, value: u64) -> MeasurementEvent {
        MeasurementEvent {
            timestamp_ms: 1_000 + value,
            node: NodeId::from(node),
            name: "RIME_appPerPacket_rxstats".to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn json_lines_format() {
        let out = Shared::default();
        let mut logger = JsonLinesLogger::new(out.clone());

        logger.log_measurement(&event(2, 5)).unwrap();
        logger.log_measurement(&event(3, 6)).unwrap();

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: MeasurementEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, event(2, 5));
    }

    #[test]
    fn file_logger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rx.jsonl");

        for v in 0..2 {
            let mut logger = JsonLinesLogger::create(&path).unwrap();
            logger.log_measurement(&event(2, v)).unwrap();
            logger.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn drain_flushes_queued_events_on_stop() {
        let out = Shared::default();
        let (sink, rx) = EventSink::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();

        for v in 0..5 {
            assert!(sink.deliver(event(2, v)));
        }
        stop_tx.send(()).unwrap();

        let stats = drain(rx, stop_rx, Box::new(JsonLinesLogger::new(out.clone()))).await;
        assert_eq!(stats.written, 5);
        assert!(sink.is_closed());

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 5);
    }

    /// Records the thread each call ran on.
    #[derive(Clone, Default)]
    struct ThreadLog(Arc<Mutex<Vec<ThreadId>>>);

    impl MeasurementLogger for ThreadLog {
        fn log_measurement(&mut self, _event: &MeasurementEvent) -> io::Result<()> {
            self.0.lock().unwrap().push(thread::current().id());
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.lock().unwrap().push(thread::current().id());
            Ok(())
        }
    }

    #[tokio::test]
    async fn logger_runs_off_the_runtime_thread() {
        let threads = ThreadLog::default();
        let (sink, rx) = EventSink::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(drain(rx, stop_rx, Box::new(threads.clone())));
        for v in 0..3 {
            assert!(sink.deliver(event(2, v)));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop_tx.send(()).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.written, 3);
        let seen = threads.0.lock().unwrap().clone();
        // Three events plus the final flush.
        assert_eq!(seen.len(), 4);
        let runtime = thread::current().id();
        assert!(seen.iter().all(|id| *id != runtime));
    }
}
